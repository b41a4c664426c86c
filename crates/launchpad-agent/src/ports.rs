use std::{
    collections::{BTreeSet, HashMap},
    path::PathBuf,
    sync::Arc,
};

use crate::os::ProcessHost;

/// Finds the TCP ports a launched process is listening on.
///
/// Launchers like `npm run dev` fork the real server under a different pid,
/// so ownership is decided by working directory rather than by pid: any
/// listener whose owner shares the target's cwd counts.
#[derive(Clone)]
pub struct PortResolver {
    host: Arc<dyn ProcessHost>,
}

impl PortResolver {
    pub fn new(host: Arc<dyn ProcessHost>) -> Self {
        Self { host }
    }

    /// Best-effort: any introspection failure shrinks the result, never errors.
    pub async fn resolve(&self, pid: u32) -> BTreeSet<u16> {
        let mut ports = BTreeSet::new();
        let Some(target_cwd) = self.host.read_cwd(pid).await else {
            tracing::debug!(pid, "cwd unavailable; no ports resolved");
            return ports;
        };

        // Many sockets can share an owner; read each owner's cwd once.
        let mut cwd_by_owner: HashMap<u32, Option<PathBuf>> = HashMap::new();
        for binding in self.host.listening_sockets().await {
            if ports.contains(&binding.port) {
                continue;
            }
            let owner_cwd = match cwd_by_owner.get(&binding.owner_pid) {
                Some(cached) => cached.clone(),
                None => {
                    let cwd = self.host.read_cwd(binding.owner_pid).await;
                    cwd_by_owner.insert(binding.owner_pid, cwd.clone());
                    cwd
                }
            };
            if owner_cwd.as_deref() == Some(target_cwd.as_path()) {
                ports.insert(binding.port);
            }
        }
        ports
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::os::testing::FakeHost;

    fn resolver(host: &Arc<FakeHost>) -> PortResolver {
        PortResolver::new(host.clone())
    }

    #[tokio::test]
    async fn unreadable_cwd_yields_nothing() {
        let host = Arc::new(FakeHost::default());
        host.add_socket(3000, 100);
        host.set_cwd(100, "/srv/site");

        let ports = resolver(&host).resolve(999).await;
        assert!(ports.is_empty());
    }

    #[tokio::test]
    async fn includes_descendants_sharing_the_cwd() {
        let host = Arc::new(FakeHost::default());
        host.set_cwd(100, "/srv/site");
        host.set_cwd(101, "/srv/site");
        host.set_cwd(200, "/srv/api");
        host.add_socket(5173, 101);
        host.add_socket(24678, 101);
        host.add_socket(4000, 200);

        let ports = resolver(&host).resolve(100).await;
        assert_eq!(ports.into_iter().collect::<Vec<_>>(), vec![5173, 24678]);
    }

    #[tokio::test]
    async fn duplicate_listeners_are_collapsed() {
        let host = Arc::new(FakeHost::default());
        host.set_cwd(100, "/srv/site");
        // Same port on tcp and tcp6, plus a worker sharing the socket.
        host.add_socket(3000, 100);
        host.add_socket(3000, 100);
        host.add_socket(3000, 102);
        host.set_cwd(102, "/srv/site");

        let ports = resolver(&host).resolve(100).await;
        assert_eq!(ports.len(), 1);
        assert!(ports.contains(&3000));
    }

    #[tokio::test]
    async fn owners_with_unknown_cwd_are_skipped() {
        let host = Arc::new(FakeHost::default());
        host.set_cwd(100, "/srv/site");
        host.add_socket(22, 1);

        assert!(resolver(&host).resolve(100).await.is_empty());
    }
}
