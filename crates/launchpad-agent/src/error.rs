use std::path::PathBuf;

use launchpad_process::ProjectId;

const MAX_MESSAGE_BYTES: usize = 32 * 1024;
const MAX_HINT_BYTES: usize = 8 * 1024;

/// Why a single launch candidate was not accepted.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct RejectedAttempt {
    pub candidate: String,
    pub reason: String,
}

impl std::fmt::Display for RejectedAttempt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "`{}`: {}", self.candidate, self.reason)
    }
}

fn join_attempts(attempts: &[RejectedAttempt]) -> String {
    attempts
        .iter()
        .map(|a| a.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("not a valid project number or name: {0:?}")]
    InvalidSelector(String),

    #[error("project `{0}` is already running")]
    AlreadyRunning(ProjectId),

    #[error("project path does not exist: {}", .path.display())]
    PathMissing { project: ProjectId, path: PathBuf },

    #[error("failed to start `{project}`: {}", join_attempts(.attempts))]
    SpawnFailed {
        project: ProjectId,
        attempts: Vec<RejectedAttempt>,
    },

    #[error("cannot read projects root {}: {source}", .path.display())]
    ProjectsRoot {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl SupervisorError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidSelector(_) => "invalid_selector",
            Self::AlreadyRunning(_) => "already_running",
            Self::PathMissing { .. } => "path_missing",
            Self::SpawnFailed { .. } => "spawn_failed",
            Self::ProjectsRoot { .. } => "projects_root_unavailable",
        }
    }

    pub fn hint(&self) -> Option<String> {
        match self {
            Self::InvalidSelector(_) => {
                Some("Use a number from GET /projects or the exact directory name.".to_string())
            }
            Self::AlreadyRunning(_) => Some("Check GET /services.".to_string()),
            Self::SpawnFailed { attempts, .. } if attempts.is_empty() => {
                Some("No launch candidates are configured; set LAUNCHPAD_LAUNCH_CANDIDATES.".to_string())
            }
            Self::SpawnFailed { .. } => Some(
                "No launch candidate was accepted; the message lists why each attempt failed."
                    .to_string(),
            ),
            Self::PathMissing { .. } | Self::ProjectsRoot { .. } => None,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

/// Cuts `s` to at most `max_bytes`, ending on a char boundary and marked.
pub(crate) fn truncate_utf8(s: &str, max_bytes: usize) -> String {
    const MARKER: &str = "…(truncated)";
    if s.len() <= max_bytes {
        return s.to_string();
    }

    let budget = max_bytes.saturating_sub(MARKER.len());
    let end = s
        .char_indices()
        .map(|(idx, _)| idx)
        .take_while(|&idx| idx <= budget)
        .last()
        .unwrap_or(0);
    format!("{}{MARKER}", &s[..end])
}

impl ErrorPayload {
    pub fn new(code: &str, message: impl Into<String>, hint: Option<String>) -> Self {
        Self {
            code: code.to_string(),
            message: truncate_utf8(&message.into(), MAX_MESSAGE_BYTES),
            hint: hint.map(|h| truncate_utf8(&h, MAX_HINT_BYTES)),
        }
    }
}

impl From<&SupervisorError> for ErrorPayload {
    fn from(err: &SupervisorError) -> Self {
        Self::new(err.code(), err.to_string(), err.hint())
    }
}
