use std::{path::PathBuf, sync::Arc};

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use launchpad_process::{ProjectListing, ServiceStatus, StartedProcess, StopOutcome};
use serde::{Deserialize, Serialize};

use crate::error::{ErrorPayload, SupervisorError};
use crate::host::{self, HostReport};
use crate::logs;
use crate::supervisor::Supervisor;

#[derive(Clone)]
pub struct AppState {
    pub supervisor: Supervisor,
    pub log_file: Option<Arc<PathBuf>>,
    pub error_log_file: Option<Arc<PathBuf>>,
}

pub struct ApiError(SupervisorError);

impl From<SupervisorError> for ApiError {
    fn from(value: SupervisorError) -> Self {
        Self(value)
    }
}

pub(crate) fn status_for(err: &SupervisorError) -> StatusCode {
    match err {
        SupervisorError::InvalidSelector(_) => StatusCode::NOT_FOUND,
        SupervisorError::AlreadyRunning(_) => StatusCode::CONFLICT,
        SupervisorError::PathMissing { .. } => StatusCode::GONE,
        SupervisorError::SpawnFailed { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        SupervisorError::ProjectsRoot { .. } => StatusCode::SERVICE_UNAVAILABLE,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (status_for(&self.0), Json(ErrorPayload::from(&self.0))).into_response()
    }
}

#[derive(Debug, Serialize)]
struct HealthzResponse {
    status: &'static str,
    version: &'static str,
}

async fn healthz() -> Json<HealthzResponse> {
    Json(HealthzResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn list_projects(State(state): State<AppState>) -> Result<Json<Vec<ProjectListing>>, ApiError> {
    Ok(Json(state.supervisor.list_projects().await?))
}

async fn start_project(
    State(state): State<AppState>,
    Path(selector): Path<String>,
) -> Result<Json<StartedProcess>, ApiError> {
    tracing::info!(%selector, "start requested");
    Ok(Json(state.supervisor.start(&selector).await?))
}

async fn stop_project(
    State(state): State<AppState>,
    Path(selector): Path<String>,
) -> Result<Json<Vec<StopOutcome>>, ApiError> {
    tracing::info!(%selector, "stop requested");
    Ok(Json(state.supervisor.stop(&selector).await?))
}

async fn list_services(State(state): State<AppState>) -> Json<Vec<ServiceStatus>> {
    Json(state.supervisor.list().await)
}

async fn host_report(State(state): State<AppState>) -> Json<HostReport> {
    // Disk usage is reported for the filesystem holding the projects.
    let root = state.supervisor.projects().root().to_path_buf();
    let disk_path = if root.exists() { root } else { PathBuf::from("/") };
    Json(host::collect(&disk_path).await)
}

#[derive(Debug, Deserialize)]
struct TailQuery {
    lines: Option<usize>,
}

#[derive(Debug, Serialize)]
struct TailResponse {
    lines: Vec<String>,
}

async fn tail(path: Option<&Arc<PathBuf>>, lines: usize) -> Json<TailResponse> {
    let lines = match path {
        Some(p) => logs::tail_file(p, lines).await,
        None => Vec::new(),
    };
    Json(TailResponse { lines })
}

async fn output_log(State(state): State<AppState>, Query(q): Query<TailQuery>) -> Json<TailResponse> {
    tail(state.log_file.as_ref(), logs::clamp_lines(q.lines)).await
}

async fn error_log(State(state): State<AppState>) -> Json<TailResponse> {
    tail(state.error_log_file.as_ref(), logs::DEFAULT_TAIL_LINES).await
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/projects", get(list_projects))
        .route("/projects/:selector/start", post(start_project))
        .route("/projects/:selector/stop", post(stop_project))
        .route("/services", get(list_services))
        .route("/host", get(host_report))
        .route("/logs/output", get(output_log))
        .route("/logs/error", get(error_log))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use launchpad_process::ProjectId;

    use super::*;
    use crate::error::RejectedAttempt;

    #[test]
    fn error_statuses_match_taxonomy() {
        let cases = [
            (SupervisorError::InvalidSelector("9".into()), StatusCode::NOT_FOUND),
            (
                SupervisorError::AlreadyRunning(ProjectId::from("site")),
                StatusCode::CONFLICT,
            ),
            (
                SupervisorError::PathMissing {
                    project: ProjectId::from("site"),
                    path: PathBuf::from("/srv/site"),
                },
                StatusCode::GONE,
            ),
            (
                SupervisorError::SpawnFailed {
                    project: ProjectId::from("site"),
                    attempts: vec![RejectedAttempt {
                        candidate: "npm start".into(),
                        reason: "stderr: error".into(),
                    }],
                },
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(status_for(&err), status, "{}", err.code());
        }
    }

    #[test]
    fn error_response_carries_code() {
        let resp = ApiError(SupervisorError::AlreadyRunning(ProjectId::from("api"))).into_response();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }
}
