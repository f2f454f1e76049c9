//! Resolved supervisor configuration.
//!
//! `SupervisorConfig` is the equivalent of the teacher's `StdioServerConfig`:
//! the single resolved shape the engine consumes, built by layering CLI flags
//! over environment variables over hard-coded defaults (flags win).

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Default vendor directories excluded from file watching.
pub const DEFAULT_IGNORE_GLOBS: &[&str] = &["**/node_modules/**", "**/.git/**", "**/dist/**", "**/build/**"];

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(300);
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(5);
pub const DEFAULT_SPAWN_RETRIES: u32 = 3;
pub const DEFAULT_SPAWN_BACKOFF_BASE: Duration = Duration::from_millis(250);
pub const DEFAULT_PROXY_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_BUFFER_CAPACITY: usize = 1000;
pub const DEFAULT_ID_PREFIX: &str = "relay";

/// Fully resolved configuration for one supervisor run.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Command (argv\[0\]) of the child server to supervise.
    pub command: String,
    /// Remaining argv passed to the child.
    pub args: Vec<String>,
    /// Extra environment variables merged into the child's environment.
    pub env: HashMap<String, String>,
    /// Working directory for the child, if not the proxy's own cwd.
    pub cwd: Option<PathBuf>,

    /// Paths to watch for changes.
    pub watch_paths: Vec<PathBuf>,
    /// Glob patterns excluded from watch events.
    pub ignore_globs: Vec<String>,

    pub debounce: Duration,
    pub kill_grace: Duration,
    pub spawn_retries: u32,
    pub spawn_backoff_base: Duration,
    pub proxy_request_timeout: Duration,
    pub buffer_capacity: usize,

    /// Prefix used to tag proxy-synthesized request ids (`"<prefix>:<n>"`).
    pub id_prefix: String,

    pub verbose: bool,

    pub enabled_extensions: Vec<String>,
    pub disabled_extensions: Vec<String>,
    pub extension_config: Option<serde_json::Value>,
    pub extensions_data_dir: Option<PathBuf>,
}

impl SupervisorConfig {
    /// A config with every non-command field at its documented default,
    /// useful for tests and for callers that only care about `command`/`args`.
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            env: HashMap::new(),
            cwd: None,
            watch_paths: Vec::new(),
            ignore_globs: DEFAULT_IGNORE_GLOBS.iter().map(|s| s.to_string()).collect(),
            debounce: DEFAULT_DEBOUNCE,
            kill_grace: DEFAULT_KILL_GRACE,
            spawn_retries: DEFAULT_SPAWN_RETRIES,
            spawn_backoff_base: DEFAULT_SPAWN_BACKOFF_BASE,
            proxy_request_timeout: DEFAULT_PROXY_REQUEST_TIMEOUT,
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            id_prefix: DEFAULT_ID_PREFIX.to_string(),
            verbose: false,
            enabled_extensions: Vec::new(),
            disabled_extensions: Vec::new(),
            extension_config: None,
            extensions_data_dir: None,
        }
    }

    /// Build a `globset::GlobSet` matcher for the configured ignore patterns.
    pub fn ignore_matcher(&self) -> Result<globset::GlobSet, globset::Error> {
        let mut builder = globset::GlobSetBuilder::new();
        for pattern in &self.ignore_globs {
            builder.add(globset::Glob::new(pattern)?);
        }
        builder.build()
    }
}
