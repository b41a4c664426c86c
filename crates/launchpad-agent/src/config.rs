use std::{net::SocketAddr, path::PathBuf, time::Duration};

const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:8080";
const DEFAULT_OBSERVE_WINDOW_MS: u64 = 2000;
const DEFAULT_PORT_SETTLE_MS: u64 = 1000;
const DEFAULT_LAUNCH_CANDIDATES: &str = "npm run dev;npm start";

pub(crate) fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.trim().parse::<u64>().ok())
}

fn env_path(name: &str) -> Option<PathBuf> {
    std::env::var_os(name)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

/// One way of starting a project, tried in priority order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl LaunchCommand {
    pub fn new(program: impl Into<String>, args: &[&str]) -> Self {
        Self {
            program: program.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    pub fn label(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

/// Parses `;`-separated commands; each entry is split on whitespace.
pub fn parse_launch_candidates(raw: &str) -> Vec<LaunchCommand> {
    raw.split(';')
        .filter_map(|entry| {
            let mut words = entry.split_whitespace();
            let program = words.next()?;
            Some(LaunchCommand {
                program: program.to_string(),
                args: words.map(|w| w.to_string()).collect(),
            })
        })
        .collect()
}

pub fn default_launch_candidates() -> Vec<LaunchCommand> {
    parse_launch_candidates(DEFAULT_LAUNCH_CANDIDATES)
}

/// Knobs for the start sequence.
#[derive(Debug, Clone)]
pub struct LaunchConfig {
    pub candidates: Vec<LaunchCommand>,
    pub observe_window: Duration,
    pub port_settle: Duration,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            candidates: default_launch_candidates(),
            observe_window: Duration::from_millis(DEFAULT_OBSERVE_WINDOW_MS),
            port_settle: Duration::from_millis(DEFAULT_PORT_SETTLE_MS),
        }
    }
}

impl LaunchConfig {
    pub fn from_env() -> Self {
        let candidates = std::env::var("LAUNCHPAD_LAUNCH_CANDIDATES")
            .map(|raw| parse_launch_candidates(&raw))
            .ok()
            .filter(|c| !c.is_empty())
            .unwrap_or_else(default_launch_candidates);

        let observe_window = Duration::from_millis(
            env_u64("LAUNCHPAD_OBSERVE_WINDOW_MS")
                .map(|v| v.clamp(100, 60_000))
                .unwrap_or(DEFAULT_OBSERVE_WINDOW_MS),
        );
        let port_settle = Duration::from_millis(
            env_u64("LAUNCHPAD_PORT_SETTLE_MS")
                .map(|v| v.clamp(0, 30_000))
                .unwrap_or(DEFAULT_PORT_SETTLE_MS),
        );

        Self {
            candidates,
            observe_window,
            port_settle,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub projects_root: PathBuf,
    pub listen_addr: SocketAddr,
    pub launch: LaunchConfig,
    pub log_file: Option<PathBuf>,
    pub error_log_file: Option<PathBuf>,
}

fn default_projects_root() -> PathBuf {
    match std::env::var_os("HOME").filter(|h| !h.is_empty()) {
        Some(home) => PathBuf::from(home).join("Github"),
        None => PathBuf::from("./projects"),
    }
}

impl AgentConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let listen_raw = std::env::var("LAUNCHPAD_LISTEN_ADDR")
            .unwrap_or_else(|_| DEFAULT_LISTEN_ADDR.to_string());
        let listen_addr: SocketAddr = listen_raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid LAUNCHPAD_LISTEN_ADDR {listen_raw:?}: {e}"))?;

        Ok(Self {
            projects_root: env_path("LAUNCHPAD_PROJECTS_ROOT").unwrap_or_else(default_projects_root),
            listen_addr,
            launch: LaunchConfig::from_env(),
            log_file: env_path("LAUNCHPAD_LOG_FILE"),
            error_log_file: env_path("LAUNCHPAD_ERROR_LOG_FILE"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_candidates_try_dev_before_start() {
        let c = default_launch_candidates();
        assert_eq!(c.len(), 2);
        assert_eq!(c[0].label(), "npm run dev");
        assert_eq!(c[1].label(), "npm start");
    }

    #[test]
    fn parse_candidates_skips_blank_entries() {
        let c = parse_launch_candidates(" yarn dev ;; ;cargo run --release");
        assert_eq!(
            c,
            vec![
                LaunchCommand::new("yarn", &["dev"]),
                LaunchCommand::new("cargo", &["run", "--release"]),
            ]
        );
    }

    #[test]
    fn parse_candidates_empty_input() {
        assert!(parse_launch_candidates("").is_empty());
        assert!(parse_launch_candidates(" ; ").is_empty());
    }

    #[test]
    fn label_without_args_is_program() {
        assert_eq!(LaunchCommand::new("./run.sh", &[]).label(), "./run.sh");
    }
}
