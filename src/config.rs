use std::path::{Path, PathBuf};
use std::time::Duration;

/// Manifest file names looked up at a chart root, in preference order.
pub const MANIFEST_FILES: [&str; 2] = ["ftl.yaml", "ftl.yml"];

/// Directory (relative to a chart root) holding one-profile-per-file manifests.
pub const PROFILES_DIR: &str = "profiles";

#[derive(Debug, Clone)]
pub struct Settings {
    /// Directory holding the chart registry.
    pub home: PathBuf,
    pub docker_bin: String,

    pub build_timeout: Duration,
    pub start_timeout: Duration,
    pub attach_timeout: Duration,
    /// Budget for one service's readiness waits, all of them together.
    pub wait_timeout: Duration,
    /// Delay before the single retry of an operation that hit an unreachable engine.
    pub retry_backoff: Duration,

    /// Shell used when attaching to a service that does not name one.
    pub shell: String,
}

impl Settings {
    pub fn from_env() -> Self {
        Settings {
            home: std::env::var_os("FTL_HOME")
                .map(PathBuf::from)
                .unwrap_or_else(default_home),
            docker_bin: resolve_docker_binary(),
            build_timeout: secs_from_env("FTL_BUILD_TIMEOUT", 900),
            start_timeout: secs_from_env("FTL_START_TIMEOUT", 120),
            attach_timeout: secs_from_env("FTL_ATTACH_TIMEOUT", 30),
            wait_timeout: secs_from_env("FTL_WAIT_TIMEOUT", 60),
            retry_backoff: Duration::from_millis(
                std::env::var("FTL_RETRY_BACKOFF_MS")
                    .ok()
                    .and_then(|s| s.parse::<u64>().ok())
                    .unwrap_or(500),
            ),
            shell: std::env::var("FTL_SHELL").unwrap_or_else(|_| "/bin/sh".to_string()),
        }
    }

    pub fn with_home(mut self, home: Option<PathBuf>) -> Self {
        if let Some(home) = home {
            self.home = home;
        }
        self
    }
}

fn secs_from_env(key: &str, default: u64) -> Duration {
    Duration::from_secs(
        std::env::var(key)
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(default),
    )
}

fn default_home() -> PathBuf {
    dirs::config_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join(".config")))
        .unwrap_or_else(|| PathBuf::from("."))
        .join("ftl")
}

pub fn resolve_docker_binary() -> String {
    std::env::var("DOCKER_BIN").unwrap_or_else(|_| "docker".to_string())
}

/// Returns the manifest file directly under `root`, if any.
pub fn manifest_in(root: &Path) -> Option<PathBuf> {
    MANIFEST_FILES
        .iter()
        .map(|name| root.join(name))
        .find(|p| p.is_file())
}

/// Walk up from `start_dir` to the nearest directory holding a manifest.
pub fn find_chart_root(start_dir: &Path) -> Option<PathBuf> {
    let mut dir = start_dir.to_path_buf();

    for _ in 0..32 {
        if manifest_in(&dir).is_some() {
            return Some(dir);
        }
        match dir.parent() {
            Some(parent) if parent != dir => dir = parent.to_path_buf(),
            _ => break,
        }
    }
    None
}
