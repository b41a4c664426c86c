use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use chrono::{DateTime, Utc};
use launchpad_process::{
    ProjectDescriptor, ProjectId, ProjectListing, ServiceStatus, SlotState, StartedProcess,
    StopOutcome,
};
use tokio::sync::Mutex;
use tokio_util::task::TaskTracker;

use crate::config::{LaunchCommand, LaunchConfig};
use crate::error::{RejectedAttempt, SupervisorError};
use crate::observe::{self, Verdict};
use crate::os::{self, ProcessHost};
use crate::ports::PortResolver;
use crate::registry::ProjectRegistry;

/// Selector reserved by `stop` for "every tracked project".
pub const STOP_ALL: &str = "all";

#[derive(Debug, Clone)]
struct ManagedProcess {
    project_id: ProjectId,
    pid: u32,
    // Always equal to `pid`: the child is spawned as a session leader.
    pgid: i32,
    started_at: DateTime<Utc>,
    command: LaunchCommand,
}

#[derive(Debug, Default)]
struct Slots {
    running: HashMap<ProjectId, ManagedProcess>,
    // Held from the already-running check until the start sequence finishes,
    // so two concurrent starts of one project cannot both spawn.
    starting: HashSet<ProjectId>,
    closed: bool,
}

/// Owns the table of launched projects. At most one process per project.
///
/// The table is lazily consistent: a process that dies on its own stays
/// listed (with `alive = false`) until it is stopped.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Mutex<Slots>>,
    host: Arc<dyn ProcessHost>,
    projects: ProjectRegistry,
    ports: PortResolver,
    launch: Arc<LaunchConfig>,
    // Start sequences in flight; `shutdown` waits for them.
    starts: TaskTracker,
}

impl Supervisor {
    pub fn new(host: Arc<dyn ProcessHost>, projects: ProjectRegistry, launch: LaunchConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Slots::default())),
            ports: PortResolver::new(host.clone()),
            host,
            projects,
            launch: Arc::new(launch),
            starts: TaskTracker::new(),
        }
    }

    pub fn projects(&self) -> &ProjectRegistry {
        &self.projects
    }

    pub async fn slot_state(&self, project: &ProjectId) -> SlotState {
        let slots = self.inner.lock().await;
        if slots.running.contains_key(project) {
            SlotState::Running
        } else if slots.starting.contains(project) {
            SlotState::Starting
        } else {
            SlotState::Absent
        }
    }

    pub async fn list_projects(&self) -> Result<Vec<ProjectListing>, SupervisorError> {
        let projects = self.projects.list()?;
        let mut out = Vec::with_capacity(projects.len());
        for (idx, p) in projects.into_iter().enumerate() {
            let state = self.slot_state(&p.id).await;
            out.push(ProjectListing {
                ordinal: idx + 1,
                id: p.id,
                path: p.path,
                state,
            });
        }
        Ok(out)
    }

    /// Resolves `selector` and runs the start sequence.
    ///
    /// The sequence runs on a tracked task: once a candidate is spawned its
    /// observation window always completes, even if the caller goes away,
    /// and `shutdown` does not return before it has.
    pub async fn start(&self, selector: &str) -> Result<StartedProcess, SupervisorError> {
        let project = self.projects.resolve(selector)?;
        let project_id = project.id.clone();
        let this = self.clone();
        match self.starts.spawn(async move { this.start_project(project).await }).await {
            Ok(res) => res,
            Err(err) => Err(SupervisorError::SpawnFailed {
                project: project_id,
                attempts: vec![RejectedAttempt {
                    candidate: "-".to_string(),
                    reason: format!("start task aborted: {err}"),
                }],
            }),
        }
    }

    async fn start_project(
        &self,
        project: ProjectDescriptor,
    ) -> Result<StartedProcess, SupervisorError> {
        let id = project.id.clone();
        {
            let mut slots = self.inner.lock().await;
            if slots.running.contains_key(&id) || slots.starting.contains(&id) {
                tracing::info!(project = %id, "start refused: already running");
                return Err(SupervisorError::AlreadyRunning(id));
            }
            if slots.closed {
                return Err(shutting_down(id));
            }
            slots.starting.insert(id.clone());
        }

        let launched = self.launch_candidates(&project).await;

        let managed = {
            let mut slots = self.inner.lock().await;
            slots.starting.remove(&id);
            let managed = launched?;
            if slots.closed {
                // The sweep already ran; do not leave this one behind.
                if let Err(err) = self.host.signal_group(managed.pgid) {
                    tracing::warn!(project = %id, pgid = managed.pgid, error = %err, "failed to signal late start");
                }
                return Err(shutting_down(id));
            }
            slots.running.insert(id.clone(), managed.clone());
            managed
        };

        tracing::info!(
            project = %id,
            pid = managed.pid,
            pgid = managed.pgid,
            candidate = %managed.command.label(),
            "project started"
        );

        if !self.launch.port_settle.is_zero() {
            tokio::time::sleep(self.launch.port_settle).await;
        }
        let ports = self.ports.resolve(managed.pid).await;

        Ok(StartedProcess {
            project_id: id,
            pid: managed.pid,
            ports,
        })
    }

    async fn launch_candidates(
        &self,
        project: &ProjectDescriptor,
    ) -> Result<ManagedProcess, SupervisorError> {
        let is_dir = tokio::fs::metadata(&project.path)
            .await
            .is_ok_and(|m| m.is_dir());
        if !is_dir {
            return Err(SupervisorError::PathMissing {
                project: project.id.clone(),
                path: project.path.clone(),
            });
        }

        let mut attempts = Vec::new();
        for candidate in &self.launch.candidates {
            let label = candidate.label();
            let mut child = match self.host.spawn_detached(&project.path, candidate) {
                Ok(c) => c,
                Err(err) => {
                    tracing::warn!(project = %project.id, candidate = %label, error = %err, "spawn failed");
                    attempts.push(RejectedAttempt {
                        candidate: label,
                        reason: format!("spawn: {err}"),
                    });
                    continue;
                }
            };

            let verdict = observe::observe(child.stderr.as_deref_mut(), self.launch.observe_window).await;
            if let Some(stderr) = child.stderr.take() {
                observe::drain_stderr(project.id.0.clone(), child.pid, stderr);
            }

            match verdict {
                Verdict::Clean => {
                    return Ok(ManagedProcess {
                        project_id: project.id.clone(),
                        pid: child.pid,
                        pgid: child.pgid(),
                        started_at: Utc::now(),
                        command: candidate.clone(),
                    });
                }
                Verdict::ErrorOutput(text) => {
                    // Abandoned, not killed: it exits on its own or is reaped.
                    tracing::warn!(
                        project = %project.id,
                        pid = child.pid,
                        candidate = %label,
                        stderr = %text,
                        "candidate rejected"
                    );
                    attempts.push(RejectedAttempt {
                        candidate: label,
                        reason: format!("stderr: {text}"),
                    });
                }
            }
        }

        tracing::warn!(project = %project.id, attempts = attempts.len(), "all launch candidates failed");
        Err(SupervisorError::SpawnFailed {
            project: project.id.clone(),
            attempts,
        })
    }

    /// Stops one project, or every tracked project for [`STOP_ALL`].
    pub async fn stop(&self, selector: &str) -> Result<Vec<StopOutcome>, SupervisorError> {
        if selector == STOP_ALL {
            let entries = {
                let mut slots = self.inner.lock().await;
                take_all(&mut slots)
            };
            return Ok(entries.iter().map(|e| self.terminate(e)).collect());
        }

        let id = match self.projects.resolve(selector) {
            Ok(p) => p.id,
            Err(err) => {
                // The directory may be gone while its process is still tracked.
                let fallback = ProjectId::from(selector);
                if !self.inner.lock().await.running.contains_key(&fallback) {
                    return Err(err);
                }
                fallback
            }
        };

        let entry = self.inner.lock().await.running.remove(&id);
        let Some(entry) = entry else {
            return Ok(vec![StopOutcome {
                project_id: id,
                ok: false,
                detail: "not running".to_string(),
            }]);
        };
        Ok(vec![self.terminate(&entry)])
    }

    /// Signals the entry's group. The entry is already out of the table, so
    /// a failed signal never leaves a stuck slot behind.
    fn terminate(&self, entry: &ManagedProcess) -> StopOutcome {
        let project_id = entry.project_id.clone();
        match self.host.signal_group(entry.pgid) {
            Ok(()) => {
                tracing::info!(project = %project_id, pgid = entry.pgid, "sent SIGTERM to process group");
                StopOutcome {
                    project_id,
                    ok: true,
                    detail: format!("stopped (pid {})", entry.pid),
                }
            }
            Err(err) if os::is_no_such_process(&err) => {
                tracing::info!(project = %project_id, pgid = entry.pgid, "process group already gone");
                StopOutcome {
                    project_id,
                    ok: true,
                    detail: format!("already exited (pid {})", entry.pid),
                }
            }
            Err(err) => {
                tracing::warn!(project = %project_id, pgid = entry.pgid, error = %err, "failed to signal process group");
                StopOutcome {
                    project_id,
                    ok: false,
                    detail: err.to_string(),
                }
            }
        }
    }

    pub async fn list(&self) -> Vec<ServiceStatus> {
        let mut entries: Vec<ManagedProcess> = {
            let slots = self.inner.lock().await;
            slots.running.values().cloned().collect()
        };
        entries.sort_by(|a, b| a.started_at.cmp(&b.started_at));

        let mut out = Vec::with_capacity(entries.len());
        for e in entries {
            let alive = self.host.probe_alive(e.pid);
            let ports = self.ports.resolve(e.pid).await;
            out.push(ServiceStatus {
                project_id: e.project_id,
                pid: e.pid,
                alive,
                ports,
                started_at: e.started_at,
                command: e.command.label(),
            });
        }
        out
    }

    /// Process-wide sweep: refuse new starts, let in-flight starts finish
    /// their window (they signal their own group once they see the flag),
    /// then terminate every tracked group and clear the table.
    pub async fn shutdown(&self) -> Vec<StopOutcome> {
        self.inner.lock().await.closed = true;

        self.starts.close();
        if !self.starts.is_empty() {
            tracing::info!(in_flight = self.starts.len(), "waiting for in-flight starts");
        }
        self.starts.wait().await;

        let entries = {
            let mut slots = self.inner.lock().await;
            take_all(&mut slots)
        };
        if !entries.is_empty() {
            tracing::info!(count = entries.len(), "terminating tracked process groups");
        }
        entries.iter().map(|e| self.terminate(e)).collect()
    }
}

fn take_all(slots: &mut Slots) -> Vec<ManagedProcess> {
    let mut entries: Vec<ManagedProcess> = slots.running.drain().map(|(_, e)| e).collect();
    entries.sort_by(|a, b| a.started_at.cmp(&b.started_at));
    entries
}

fn shutting_down(project: ProjectId) -> SupervisorError {
    SupervisorError::SpawnFailed {
        project,
        attempts: vec![RejectedAttempt {
            candidate: "-".to_string(),
            reason: "supervisor is shutting down".to_string(),
        }],
    }
}
