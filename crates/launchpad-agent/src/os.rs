use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use tokio::io::AsyncRead;

use crate::config::LaunchCommand;

pub type StderrStream = Box<dyn AsyncRead + Send + Unpin>;

/// A child that leads its own process group (`pgid == pid`).
pub struct DetachedChild {
    pub pid: u32,
    pub stderr: Option<StderrStream>,
}

impl DetachedChild {
    pub fn pgid(&self) -> i32 {
        self.pid as i32
    }
}

/// A listening socket and the process holding it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortBinding {
    pub port: u16,
    pub owner_pid: u32,
}

/// Everything the supervisor needs from the operating system.
#[async_trait]
pub trait ProcessHost: Send + Sync + 'static {
    /// Spawn in a new session with stdout discarded and stderr captured.
    fn spawn_detached(&self, cwd: &Path, command: &LaunchCommand)
    -> std::io::Result<DetachedChild>;

    /// SIGTERM to the whole group (`kill(-pgid, SIGTERM)`).
    fn signal_group(&self, pgid: i32) -> std::io::Result<()>;

    /// Existence check only; nothing is delivered.
    fn probe_alive(&self, pid: u32) -> bool;

    async fn read_cwd(&self, pid: u32) -> Option<PathBuf>;

    async fn listening_sockets(&self) -> Vec<PortBinding>;
}

pub(crate) fn is_no_such_process(err: &std::io::Error) -> bool {
    err.raw_os_error() == Some(libc::ESRCH)
}

#[derive(Debug, Default, Clone, Copy)]
pub struct UnixHost;

#[async_trait]
impl ProcessHost for UnixHost {
    fn spawn_detached(
        &self,
        cwd: &Path,
        command: &LaunchCommand,
    ) -> std::io::Result<DetachedChild> {
        let mut cmd = tokio::process::Command::new(&command.program);
        cmd.args(&command.args)
            .current_dir(cwd)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::piped());

        #[cfg(unix)]
        {
            unsafe {
                cmd.pre_exec(|| {
                    // New session so the whole tree can be signalled via -pgid.
                    if libc::setsid() == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        let mut child = cmd.spawn()?;
        let pid = child
            .id()
            .ok_or_else(|| std::io::Error::other("spawned child has no pid"))?;
        let stderr = child
            .stderr
            .take()
            .map(|s| Box::new(s) as StderrStream);

        // Reap the direct child whenever it exits so liveness probes see ESRCH
        // instead of a zombie.
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => tracing::debug!(pid, %status, "child exited"),
                Err(err) => tracing::debug!(pid, error = %err, "wait on child failed"),
            }
        });

        Ok(DetachedChild { pid, stderr })
    }

    fn signal_group(&self, pgid: i32) -> std::io::Result<()> {
        if pgid <= 0 {
            return Err(std::io::Error::from_raw_os_error(libc::EINVAL));
        }
        let rc = unsafe { libc::kill(-pgid, libc::SIGTERM) };
        if rc == -1 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    }

    fn probe_alive(&self, pid: u32) -> bool {
        if pid == 0 {
            return false;
        }
        let rc = unsafe { libc::kill(pid as i32, 0) };
        if rc == 0 {
            return true;
        }
        // EPERM: the pid exists but belongs to someone else.
        std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }

    async fn read_cwd(&self, pid: u32) -> Option<PathBuf> {
        read_proc_cwd(pid).await
    }

    async fn listening_sockets(&self) -> Vec<PortBinding> {
        tokio::task::spawn_blocking(scan_listening_sockets)
            .await
            .unwrap_or_default()
    }
}

#[cfg(target_os = "linux")]
async fn read_proc_cwd(pid: u32) -> Option<PathBuf> {
    if pid == 0 {
        return None;
    }
    tokio::fs::read_link(format!("/proc/{pid}/cwd")).await.ok()
}

#[cfg(not(target_os = "linux"))]
async fn read_proc_cwd(_pid: u32) -> Option<PathBuf> {
    None
}

const TCP_LISTEN: &str = "0A";

/// Extracts `(local_port, inode)` for LISTEN rows of /proc/net/tcp or tcp6.
pub(crate) fn parse_proc_net_tcp(contents: &str) -> Vec<(u16, u64)> {
    let mut out = Vec::new();
    for line in contents.lines().skip(1) {
        let parts: Vec<&str> = line.split_whitespace().collect();
        // sl local_address rem_address st tx:rx tr:tm retrnsmt uid timeout inode
        let (Some(local), Some(state), Some(inode)) = (parts.get(1), parts.get(3), parts.get(9))
        else {
            continue;
        };
        if *state != TCP_LISTEN {
            continue;
        }
        let Some((_, port_hex)) = local.rsplit_once(':') else {
            continue;
        };
        let Ok(port) = u16::from_str_radix(port_hex, 16) else {
            continue;
        };
        let Ok(inode) = inode.parse::<u64>() else {
            continue;
        };
        if port == 0 || inode == 0 {
            continue;
        }
        out.push((port, inode));
    }
    out
}

/// `socket:[12345]` -> 12345
pub(crate) fn parse_socket_inode(link: &str) -> Option<u64> {
    link.strip_prefix("socket:[")?
        .strip_suffix(']')?
        .parse()
        .ok()
}

#[cfg(target_os = "linux")]
fn scan_listening_sockets() -> Vec<PortBinding> {
    let mut ports_by_inode: HashMap<u64, u16> = HashMap::new();
    for table in ["/proc/net/tcp", "/proc/net/tcp6"] {
        let Ok(contents) = std::fs::read_to_string(table) else {
            continue;
        };
        for (port, inode) in parse_proc_net_tcp(&contents) {
            ports_by_inode.insert(inode, port);
        }
    }
    if ports_by_inode.is_empty() {
        return Vec::new();
    }

    let Ok(procs) = std::fs::read_dir("/proc") else {
        return Vec::new();
    };

    let mut out = Vec::new();
    for entry in procs.flatten() {
        let Some(pid) = entry
            .file_name()
            .to_str()
            .and_then(|s| s.parse::<u32>().ok())
        else {
            continue;
        };
        // Other users' fd tables are unreadable without privileges; skip them.
        let Ok(fds) = std::fs::read_dir(entry.path().join("fd")) else {
            continue;
        };
        for fd in fds.flatten() {
            let Ok(target) = std::fs::read_link(fd.path()) else {
                continue;
            };
            let Some(inode) = target.to_str().and_then(parse_socket_inode) else {
                continue;
            };
            if let Some(port) = ports_by_inode.get(&inode) {
                out.push(PortBinding {
                    port: *port,
                    owner_pid: pid,
                });
            }
        }
    }
    out
}

#[cfg(not(target_os = "linux"))]
fn scan_listening_sockets() -> Vec<PortBinding> {
    Vec::new()
}

#[cfg(test)]
pub(crate) mod testing {
    use std::{
        collections::{HashSet, VecDeque},
        sync::Mutex,
    };

    use tokio::io::AsyncReadExt as _;

    use super::*;

    /// What the next `spawn_detached` call produces.
    pub(crate) enum ScriptedSpawn {
        /// Child writes `stderr` and then keeps the pipe open.
        Ok { pid: u32, stderr: &'static str },
        Fail(std::io::ErrorKind),
    }

    /// Scripted stand-in for the OS; every field is inspectable from tests.
    #[derive(Default)]
    pub(crate) struct FakeHost {
        pub spawns: Mutex<VecDeque<ScriptedSpawn>>,
        pub spawned: Mutex<Vec<(PathBuf, String, u32)>>,
        pub signalled: Mutex<Vec<i32>>,
        pub signal_errors: Mutex<HashMap<i32, i32>>,
        pub alive: Mutex<HashSet<u32>>,
        pub cwds: Mutex<HashMap<u32, PathBuf>>,
        pub sockets: Mutex<Vec<PortBinding>>,
        // Keeps the write halves open so scripted stderr never hits EOF.
        writers: Mutex<Vec<tokio::io::DuplexStream>>,
    }

    impl FakeHost {
        pub(crate) fn script(&self, spawn: ScriptedSpawn) {
            self.spawns.lock().unwrap().push_back(spawn);
        }

        pub(crate) fn fail_signal(&self, pgid: i32, errno: i32) {
            self.signal_errors.lock().unwrap().insert(pgid, errno);
        }

        pub(crate) fn set_cwd(&self, pid: u32, cwd: impl Into<PathBuf>) {
            self.cwds.lock().unwrap().insert(pid, cwd.into());
        }

        pub(crate) fn add_socket(&self, port: u16, owner_pid: u32) {
            self.sockets
                .lock()
                .unwrap()
                .push(PortBinding { port, owner_pid });
        }

        pub(crate) fn kill_externally(&self, pid: u32) {
            self.alive.lock().unwrap().remove(&pid);
        }

        pub(crate) fn spawned_commands(&self) -> Vec<String> {
            self.spawned
                .lock()
                .unwrap()
                .iter()
                .map(|(_, label, _)| label.clone())
                .collect()
        }
    }

    #[async_trait]
    impl ProcessHost for FakeHost {
        fn spawn_detached(
            &self,
            cwd: &Path,
            command: &LaunchCommand,
        ) -> std::io::Result<DetachedChild> {
            let next = self
                .spawns
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(ScriptedSpawn::Fail(std::io::ErrorKind::NotFound));
            match next {
                ScriptedSpawn::Fail(kind) => Err(std::io::Error::from(kind)),
                ScriptedSpawn::Ok { pid, stderr } => {
                    let (reader, writer) = tokio::io::duplex(64);
                    let scripted = std::io::Cursor::new(stderr.as_bytes().to_vec());
                    self.writers.lock().unwrap().push(writer);
                    self.alive.lock().unwrap().insert(pid);
                    self.spawned
                        .lock()
                        .unwrap()
                        .push((cwd.to_path_buf(), command.label(), pid));
                    Ok(DetachedChild {
                        pid,
                        stderr: Some(Box::new(scripted.chain(reader))),
                    })
                }
            }
        }

        fn signal_group(&self, pgid: i32) -> std::io::Result<()> {
            self.signalled.lock().unwrap().push(pgid);
            if let Some(errno) = self.signal_errors.lock().unwrap().get(&pgid) {
                return Err(std::io::Error::from_raw_os_error(*errno));
            }
            self.alive.lock().unwrap().remove(&(pgid as u32));
            Ok(())
        }

        fn probe_alive(&self, pid: u32) -> bool {
            self.alive.lock().unwrap().contains(&pid)
        }

        async fn read_cwd(&self, pid: u32) -> Option<PathBuf> {
            self.cwds.lock().unwrap().get(&pid).cloned()
        }

        async fn listening_sockets(&self) -> Vec<PortBinding> {
            self.sockets.lock().unwrap().clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROC_NET_TCP: &str = "\
  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode
   0: 00000000:0BB8 00000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 41234 1 0000000000000000 100 0 0 10 0
   1: 0100007F:1435 00000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 41299 1 0000000000000000 100 0 0 10 0
   2: 0100007F:A1B2 0100007F:0BB8 01 00000000:00000000 00:00000000 00000000  1000        0 51111 1 0000000000000000 20 4 30 10 -1
";

    const PROC_NET_TCP6: &str = "\
  sl  local_address                         remote_address                        st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode
   0: 00000000000000000000000000000000:1F90 00000000000000000000000000000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 77001 1 0000000000000000 100 0 0 10 0
";

    #[test]
    fn parses_listen_rows_only() {
        let rows = parse_proc_net_tcp(PROC_NET_TCP);
        assert_eq!(rows, vec![(3000, 41234), (5173, 41299)]);
    }

    #[test]
    fn parses_ipv6_table() {
        let rows = parse_proc_net_tcp(PROC_NET_TCP6);
        assert_eq!(rows, vec![(8080, 77001)]);
    }

    #[test]
    fn ignores_garbage_rows() {
        let rows = parse_proc_net_tcp("header\nnot a row\n   0: zz:zz 0 0A\n");
        assert!(rows.is_empty());
    }

    #[test]
    fn socket_inode_from_fd_link() {
        assert_eq!(parse_socket_inode("socket:[41234]"), Some(41234));
        assert_eq!(parse_socket_inode("pipe:[41234]"), None);
        assert_eq!(parse_socket_inode("/dev/null"), None);
        assert_eq!(parse_socket_inode("socket:[abc]"), None);
    }

    #[test]
    fn no_such_process_is_recognized() {
        assert!(is_no_such_process(&std::io::Error::from_raw_os_error(
            libc::ESRCH
        )));
        assert!(!is_no_such_process(&std::io::Error::from_raw_os_error(
            libc::EPERM
        )));
    }

    #[test]
    fn unix_host_rejects_non_positive_group() {
        let err = UnixHost.signal_group(0).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EINVAL));
    }

    #[tokio::test]
    async fn unix_host_reads_own_cwd() {
        if !cfg!(target_os = "linux") {
            return;
        }
        let cwd = UnixHost.read_cwd(std::process::id()).await;
        assert_eq!(cwd, std::env::current_dir().ok());
    }

    #[test]
    fn unix_host_sees_itself_alive() {
        assert!(UnixHost.probe_alive(std::process::id()));
        assert!(!UnixHost.probe_alive(0));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn unix_host_spawns_a_group_leader_and_signals_the_group() {
        use std::time::Duration;

        let dir = tempfile::tempdir().unwrap();
        let command = LaunchCommand::new("sh", &["-c", "echo Error >&2; sleep 5"]);
        let mut child = UnixHost.spawn_detached(dir.path(), &command).unwrap();

        let pid = child.pid;
        assert_eq!(unsafe { libc::getpgid(pid as i32) }, pid as i32);
        assert_eq!(child.pgid(), pid as i32);
        assert!(UnixHost.probe_alive(pid));

        let cwd = UnixHost.read_cwd(pid).await.unwrap();
        assert_eq!(cwd, dir.path().canonicalize().unwrap());

        let verdict =
            crate::observe::observe(child.stderr.as_deref_mut(), Duration::from_millis(300)).await;
        assert_eq!(verdict, crate::observe::Verdict::ErrorOutput("Error".to_string()));

        UnixHost.signal_group(child.pgid()).unwrap();
        let mut alive = true;
        for _ in 0..50 {
            if !UnixHost.probe_alive(pid) {
                alive = false;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!alive, "group leader {pid} survived SIGTERM");
    }
}
