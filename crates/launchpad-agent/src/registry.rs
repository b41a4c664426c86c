use std::path::{Path, PathBuf};

use launchpad_process::{ProjectDescriptor, ProjectId};

use crate::error::SupervisorError;

/// Projects are the immediate subdirectories of a single root.
///
/// Nothing is cached: every call re-reads the directory, so ordinals always
/// reflect the current enumeration order (not sorted).
#[derive(Debug, Clone)]
pub struct ProjectRegistry {
    root: PathBuf,
}

impl ProjectRegistry {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn list(&self) -> Result<Vec<ProjectDescriptor>, SupervisorError> {
        let entries = std::fs::read_dir(&self.root).map_err(|source| {
            SupervisorError::ProjectsRoot {
                path: self.root.clone(),
                source,
            }
        })?;

        let mut out = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            // Follow symlinks: a linked checkout still counts as a project.
            if !std::fs::metadata(&path).is_ok_and(|m| m.is_dir()) {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(|s| s.to_string()) else {
                tracing::debug!(path = %path.display(), "skipping non-utf8 project directory");
                continue;
            };
            out.push(ProjectDescriptor {
                id: ProjectId(name),
                path,
            });
        }
        Ok(out)
    }

    /// 1-based ordinal first, then exact directory name. No fuzzy matching.
    pub fn resolve(&self, selector: &str) -> Result<ProjectDescriptor, SupervisorError> {
        let projects = self.list()?;
        resolve_in(projects, selector)
    }
}

fn resolve_in(
    projects: Vec<ProjectDescriptor>,
    selector: &str,
) -> Result<ProjectDescriptor, SupervisorError> {
    if let Ok(ordinal) = selector.parse::<usize>()
        && (1..=projects.len()).contains(&ordinal)
    {
        return Ok(projects[ordinal - 1].clone());
    }

    projects
        .into_iter()
        .find(|p| p.id.as_str() == selector)
        .ok_or_else(|| SupervisorError::InvalidSelector(selector.to_string()))
}
