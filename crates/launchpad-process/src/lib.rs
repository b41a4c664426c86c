use std::collections::BTreeSet;
use std::path::PathBuf;

use chrono::{DateTime, Utc};

/// Directory name of a project under the projects root.
///
/// NOTE: This is identity only. Launch commands are never derived from it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct ProjectId(pub String);

impl ProjectId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ProjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProjectId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ProjectDescriptor {
    pub id: ProjectId,
    pub path: PathBuf,
}

/// Lifecycle of a project slot. A failed start leaves the slot `Absent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotState {
    Absent,
    Starting,
    Running,
}

/// A project as shown to callers, with its 1-based selector ordinal.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ProjectListing {
    pub ordinal: usize,
    pub id: ProjectId,
    pub path: PathBuf,
    pub state: SlotState,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct StartedProcess {
    pub project_id: ProjectId,
    pub pid: u32,
    pub ports: BTreeSet<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct StopOutcome {
    pub project_id: ProjectId,
    pub ok: bool,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ServiceStatus {
    pub project_id: ProjectId,
    pub pid: u32,
    pub alive: bool,
    pub ports: BTreeSet<u16>,
    pub started_at: DateTime<Utc>,
    /// Label of the launch candidate that was accepted, e.g. `npm run dev`.
    pub command: String,
}
