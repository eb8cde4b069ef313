//! Configuration types — all read from the environment at startup.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(default)
}

fn env_csv(key: &str) -> Vec<String> {
    std::env::var(key)
        .unwrap_or_default()
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn env_u32(key: &str) -> Option<u32> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

/// Server-side configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the HTTP server binds to.
    pub bind_addr: String,
    /// Path to the local database file.
    pub db_path: PathBuf,
    /// Global kill-switch for session resumption on retry. When false,
    /// every resume request is forced to a cold new session.
    pub resume_enabled: bool,
    /// API key for the default seeded user, if any.
    pub bootstrap_api_key: Option<SecretString>,
    /// Optional directory for rolling log files.
    pub log_dir: Option<PathBuf>,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self {
            bind_addr: env_or("TASKFORGE_BIND", "0.0.0.0:8080"),
            db_path: PathBuf::from(env_or("TASKFORGE_DB_PATH", "./data/taskforge.db")),
            resume_enabled: env_bool("TASKFORGE_RESUME_ENABLED", true),
            bootstrap_api_key: std::env::var("TASKFORGE_API_KEY")
                .ok()
                .map(SecretString::from),
            log_dir: std::env::var("TASKFORGE_LOG_DIR").ok().map(PathBuf::from),
        }
    }
}

/// PR action policy knobs. Empty lists and unset limits disable the
/// corresponding rule; the write-enabled flag is off by default.
#[derive(Debug, Clone, Default)]
pub struct PrPolicyConfig {
    pub write_enabled: bool,
    pub repo_allowlist: Vec<String>,
    pub base_branch_allowlist: Vec<String>,
    pub head_branch_regex: Option<String>,
    pub max_changed_files: Option<u32>,
    pub max_diff_lines: Option<u32>,
    pub forbidden_path_patterns: Vec<String>,
    pub required_checks: Vec<String>,
}

impl PrPolicyConfig {
    pub fn from_env() -> Self {
        Self {
            write_enabled: env_bool("TASKFORGE_PR_WRITE_ENABLED", false),
            repo_allowlist: env_csv("TASKFORGE_PR_REPO_ALLOWLIST"),
            base_branch_allowlist: env_csv("TASKFORGE_PR_BASE_BRANCH_ALLOWLIST"),
            head_branch_regex: std::env::var("TASKFORGE_PR_HEAD_BRANCH_REGEX")
                .ok()
                .filter(|s| !s.is_empty()),
            max_changed_files: env_u32("TASKFORGE_PR_MAX_CHANGED_FILES"),
            max_diff_lines: env_u32("TASKFORGE_PR_MAX_DIFF_LINES"),
            forbidden_path_patterns: env_csv("TASKFORGE_PR_FORBIDDEN_PATHS"),
            required_checks: env_csv("TASKFORGE_PR_REQUIRED_CHECKS"),
        }
    }
}

/// GitHub provider credentials.
#[derive(Clone)]
pub struct GitHubConfig {
    pub token: SecretString,
}

impl GitHubConfig {
    /// Returns None when no token is configured (PR actions then fail at
    /// the provider, after policy evaluation — policy still gets audited).
    pub fn from_env() -> Option<Self> {
        std::env::var("TASKFORGE_GITHUB_TOKEN")
            .ok()
            .filter(|s| !s.is_empty())
            .map(|token| Self {
                token: SecretString::from(token),
            })
    }
}

/// Configuration for the embedded local-runner poll loop.
///
/// The runner is enabled only when `TASKFORGE_RUNNER_ID` is set, mirroring
/// how optional channels are switched on elsewhere.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub runner_id: String,
    pub name: String,
    pub server_url: String,
    pub api_key: SecretString,
    /// Agent CLI binary to execute.
    pub codex_cmd: String,
    /// Workspace id → local path mappings this runner serves.
    pub workspaces: HashMap<String, PathBuf>,
    pub poll_interval: Duration,
    /// How long to wait after SIGTERM before force-killing the CLI.
    pub graceful_shutdown_timeout: Duration,
    /// Root directory for per-task run homes.
    pub data_dir: PathBuf,
    /// Credentials injected only into the child process environment.
    pub agent_env: HashMap<String, String>,
}

impl RunnerConfig {
    pub fn from_env() -> Result<Option<Self>, ConfigError> {
        let Ok(runner_id) = std::env::var("TASKFORGE_RUNNER_ID") else {
            return Ok(None);
        };

        let api_key = std::env::var("TASKFORGE_RUNNER_API_KEY")
            .map_err(|_| ConfigError::MissingEnvVar("TASKFORGE_RUNNER_API_KEY".into()))?;

        // "id=path,id2=path2"
        let mut workspaces = HashMap::new();
        for entry in env_csv("TASKFORGE_RUNNER_WORKSPACES") {
            let Some((id, path)) = entry.split_once('=') else {
                return Err(ConfigError::InvalidValue {
                    key: "TASKFORGE_RUNNER_WORKSPACES".into(),
                    message: format!("expected id=path, got '{entry}'"),
                });
            };
            workspaces.insert(id.trim().to_string(), PathBuf::from(path.trim()));
        }

        let poll_secs: u64 = env_or("TASKFORGE_RUNNER_POLL_SECS", "5")
            .parse()
            .map_err(|e| ConfigError::InvalidValue {
                key: "TASKFORGE_RUNNER_POLL_SECS".into(),
                message: format!("{e}"),
            })?;

        let mut agent_env = HashMap::new();
        for key in ["OPENAI_API_KEY", "OPENAI_BASE_URL"] {
            if let Ok(value) = std::env::var(key) {
                agent_env.insert(key.to_string(), value);
            }
        }

        Ok(Some(Self {
            name: env_or("TASKFORGE_RUNNER_NAME", &runner_id),
            runner_id,
            server_url: env_or("TASKFORGE_SERVER_URL", "http://127.0.0.1:8080"),
            api_key: SecretString::from(api_key),
            codex_cmd: env_or("TASKFORGE_CODEX_CMD", "codex"),
            workspaces,
            poll_interval: Duration::from_secs(poll_secs),
            graceful_shutdown_timeout: Duration::from_secs(2),
            data_dir: PathBuf::from(env_or("TASKFORGE_RUNNER_DATA_DIR", "./data/runs")),
            agent_env,
        }))
    }
}
