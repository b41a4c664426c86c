use std::{path::Path, sync::Arc};

use anyhow::Context;
use launchpad_agent::{
    api,
    config::AgentConfig,
    os::UnixHost,
    registry::ProjectRegistry,
    supervisor::Supervisor,
};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{
    EnvFilter, Layer, filter::LevelFilter, layer::SubscriberExt, util::SubscriberInitExt,
};

fn file_writer(path: &Path, guards: &mut Vec<WorkerGuard>) -> anyhow::Result<NonBlocking> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let name = path
        .file_name()
        .ok_or_else(|| anyhow::anyhow!("log path has no file name: {}", path.display()))?;
    std::fs::create_dir_all(dir).with_context(|| format!("create log dir {}", dir.display()))?;

    let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name));
    guards.push(guard);
    Ok(writer)
}

/// Stdout always; the output log gets everything, the error log WARN and up.
fn init_tracing(cfg: &AgentConfig) -> anyhow::Result<Vec<WorkerGuard>> {
    let mut guards = Vec::new();

    let output_layer = match &cfg.log_file {
        Some(p) => Some(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(file_writer(p, &mut guards)?),
        ),
        None => None,
    };
    let error_layer = match &cfg.error_log_file {
        Some(p) => Some(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(file_writer(p, &mut guards)?)
                .with_filter(LevelFilter::WARN),
        ),
        None => None,
    };

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .with(output_layer)
        .with(error_layer)
        .init();

    Ok(guards)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(err) => {
                tracing::warn!(error = %err, "cannot install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("SIGINT received, shutting down"),
        _ = terminate => tracing::info!("SIGTERM received, shutting down"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = AgentConfig::from_env()?;
    let _log_guards = init_tracing(&cfg)?;

    let candidates: Vec<String> = cfg.launch.candidates.iter().map(|c| c.label()).collect();
    tracing::info!(
        root = %cfg.projects_root.display(),
        ?candidates,
        observe_window_ms = cfg.launch.observe_window.as_millis() as u64,
        "launchpad-agent starting"
    );
    if !cfg.projects_root.is_dir() {
        tracing::warn!(root = %cfg.projects_root.display(), "projects root is not a directory");
    }

    let supervisor = Supervisor::new(
        Arc::new(UnixHost),
        ProjectRegistry::new(&cfg.projects_root),
        cfg.launch.clone(),
    );
    let state = api::AppState {
        supervisor: supervisor.clone(),
        log_file: cfg.log_file.clone().map(Arc::new),
        error_log_file: cfg.error_log_file.clone().map(Arc::new),
    };

    let listener = tokio::net::TcpListener::bind(cfg.listen_addr)
        .await
        .with_context(|| format!("bind {}", cfg.listen_addr))?;
    tracing::info!(addr = %cfg.listen_addr, "launchpad-agent HTTP listening");

    axum::serve(listener, api::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    for outcome in supervisor.shutdown().await {
        if outcome.ok {
            tracing::info!(project = %outcome.project_id, detail = %outcome.detail, "stopped on shutdown");
        } else {
            tracing::warn!(project = %outcome.project_id, detail = %outcome.detail, "stop on shutdown failed");
        }
    }
    tracing::info!("launchpad-agent stopped");
    Ok(())
}
