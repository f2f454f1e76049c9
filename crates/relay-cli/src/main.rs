//! `relay-proxy` binary entry point: parses CLI flags into a
//! `SupervisorConfig` and runs the proxy to completion.
//!
//! Grounded on `claudeless`'s clap-with-env CLI idiom (the teacher's own
//! `codex` crate is a library with no CLI binary of its own) and on
//! `atm-daemon`'s `tracing_subscriber::fmt()` initialization.

use std::path::PathBuf;

use clap::Parser;
use relay_core::{Supervisor, SupervisorConfig};

/// Transparent hot-reload proxy for an MCP child process speaking
/// newline-delimited JSON-RPC 2.0 over stdio.
#[derive(Parser, Debug)]
#[command(name = "relay-proxy")]
#[command(about = "Transparent hot-reload proxy for MCP stdio servers")]
#[command(version)]
struct Cli {
    /// Command to run the child MCP server.
    #[arg(required_unless_present = "list_extensions")]
    command: Option<String>,

    /// Arguments passed through to the child command.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,

    /// Path to watch for changes that trigger a restart. Repeatable.
    #[arg(long = "watch", value_name = "PATH", env = "MCPMON_WATCH", value_delimiter = ',')]
    watch: Vec<PathBuf>,

    /// Debounce delay, in milliseconds, between a change event and restart.
    #[arg(long, value_name = "MS", env = "MCPMON_DELAY")]
    delay: Option<u64>,

    /// Enable verbose (debug-level) logging.
    #[arg(long, env = "MCPMON_VERBOSE")]
    verbose: bool,

    /// List registered extensions and exit.
    #[arg(long)]
    list_extensions: bool,

    /// Enable an extension by id. Repeatable.
    #[arg(long = "enable-extension", value_name = "ID")]
    enable_extension: Vec<String>,

    /// Disable an extension by id. Repeatable.
    #[arg(long = "disable-extension", value_name = "ID")]
    disable_extension: Vec<String>,

    /// Extension configuration, as a JSON object.
    #[arg(long, value_name = "JSON")]
    extension_config: Option<String>,

    /// Data directory made available to extensions.
    #[arg(long, value_name = "PATH")]
    extensions_data_dir: Option<PathBuf>,
}

fn main() {
    let cli = Cli::parse();

    let log_level = if cli.verbose { tracing::Level::DEBUG } else { tracing::Level::INFO };
    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    if cli.list_extensions {
        list_extensions();
        std::process::exit(0);
    }

    let exit_code = match build_config(cli) {
        Ok(config) => {
            let rt = tokio::runtime::Runtime::new().expect("failed to start tokio runtime");
            rt.block_on(run(config))
        }
        Err(err) => {
            eprintln!("relay-proxy: {err}");
            1
        }
    };

    std::process::exit(exit_code);
}

async fn run(config: SupervisorConfig) -> i32 {
    match Supervisor::new(config) {
        Ok(supervisor) => supervisor.run().await,
        Err(err) => {
            eprintln!("relay-proxy: {err}");
            1
        }
    }
}

/// No built-in extensions ship with the core (§1); the registry only exists
/// as a hook-point contract for embedders to populate.
fn list_extensions() {
    println!("no extensions registered");
}

fn build_config(cli: Cli) -> Result<SupervisorConfig, String> {
    let command = cli.command.expect("clap enforces presence unless --list-extensions");

    let mut config = SupervisorConfig::new(command, cli.args);
    config.watch_paths = cli.watch;
    if let Some(delay) = cli.delay {
        config.debounce = std::time::Duration::from_millis(delay);
    }
    config.verbose = cli.verbose;
    config.enabled_extensions = cli.enable_extension;
    config.disabled_extensions = cli.disable_extension;
    config.extensions_data_dir = cli.extensions_data_dir;

    if let Some(raw) = cli.extension_config {
        let value: serde_json::Value = serde_json::from_str(&raw)
            .map_err(|err| format!("invalid --extension-config JSON: {err}"))?;
        config.extension_config = Some(value);
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_config_applies_watch_and_delay() {
        let cli = Cli::try_parse_from([
            "relay-proxy",
            "--watch",
            "src",
            "--delay",
            "50",
            "node",
            "server.js",
        ])
        .unwrap();
        let config = build_config(cli).unwrap();
        assert_eq!(config.command, "node");
        assert_eq!(config.args, vec!["server.js".to_string()]);
        assert_eq!(config.watch_paths, vec![PathBuf::from("src")]);
        assert_eq!(config.debounce, std::time::Duration::from_millis(50));
    }

    #[test]
    fn build_config_rejects_malformed_extension_config() {
        let cli = Cli::try_parse_from(["relay-proxy", "--extension-config", "{not json", "node"]).unwrap();
        assert!(build_config(cli).is_err());
    }

    #[test]
    fn comma_separated_watch_env_splits_into_paths() {
        let cli = Cli::try_parse_from(["relay-proxy", "--watch", "a,b,c", "node"]).unwrap();
        assert_eq!(cli.watch, vec![PathBuf::from("a"), PathBuf::from("b"), PathBuf::from("c")]);
    }

    #[test]
    fn list_extensions_does_not_require_command() {
        let cli = Cli::try_parse_from(["relay-proxy", "--list-extensions"]).unwrap();
        assert!(cli.command.is_none());
    }
}
