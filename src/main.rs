mod artifacts;
mod capture;
mod config;
mod error;
mod policy;
mod runtime;
mod session;
mod skills;

use std::sync::Arc;

use anyhow::Result;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::session::SessionManager;
use crate::skills::{SkillContext, SkillRegistry};

/// Reserved tool name that returns the tool definitions instead of running a skill.
const LIST_TOOLS: &str = "list_tools";

fn print_help() {
    println!(
        "\
fluux-sandbox v{}

A persistent Python and shell execution sandbox driven over JSON lines.

USAGE:
    fluux-sandbox [OPTIONS] [CONFIG_PATH]

ARGUMENTS:
    CONFIG_PATH    Path to TOML configuration file [default: config/sandbox.toml]
                   A missing file means built-in defaults.

OPTIONS:
    -h, --help       Print this help message and exit
    -V, --version    Print version and exit

PROTOCOL:
    One JSON request per line on stdin, one JSON response per line on stdout:
      {{\"id\": 1, \"tool\": \"execute\", \"params\": {{\"code\": \"1 + 1\"}}, \"session_id\": \"s1\"}}
      {{\"id\": 2, \"tool\": \"list_tools\"}}
    Logs go to stderr.

ENVIRONMENT VARIABLES:
    Variables are referenced in the config file via ${{VAR_NAME}} syntax.

    RUST_LOG                      Log level filter for tracing
                                  (e.g. debug, fluux_sandbox=debug,warn)
    SANDBOX_ALLOWED_ROOT          Directory the sandbox may touch
    SANDBOX_DATA_DIR              Where session state is persisted
    SANDBOX_ARTIFACT_DIR          Shared artifact directory
    SANDBOX_PYTHON                Interpreter to run code with
    SANDBOX_SECURITY_LEVEL        standard | high
    SANDBOX_MAX_EXECUTION_TIME    Python timeout in seconds
    SANDBOX_SHELL_TIMEOUT         Default shell timeout in seconds
    SANDBOX_MEMORY_LIMIT_MB       Interpreter address-space limit (0 disables)
    SANDBOX_RETENTION             delete | keep

EXAMPLES:
    fluux-sandbox                              # uses config/sandbox.toml
    fluux-sandbox /etc/fluux/sandbox.toml      # custom config path
    RUST_LOG=debug fluux-sandbox               # with debug logging",
        env!("CARGO_PKG_VERSION"),
    );
}

/// One line of input.
#[derive(Debug, Deserialize)]
struct Request {
    #[serde(default)]
    id: Value,
    tool: String,
    #[serde(default)]
    params: Value,
    #[serde(default)]
    session_id: Option<String>,
}

/// Runs one request line and builds its response.
///
/// Skill output that is JSON is embedded as-is; plain text (such as the
/// text artifact listing) is embedded as a string.
async fn handle_line(registry: &SkillRegistry, manager: &Arc<SessionManager>, line: &str) -> Value {
    let request: Request = match serde_json::from_str(line) {
        Ok(r) => r,
        Err(e) => {
            warn!("Malformed request: {e}");
            return json!({ "id": null, "ok": false, "error": format!("Malformed request: {e}") });
        }
    };

    if request.tool == LIST_TOOLS {
        return json!({ "id": request.id, "ok": true, "result": registry.tool_definitions() });
    }

    let params = match request.params {
        Value::Null => json!({}),
        p => p,
    };
    let context = SkillContext {
        manager: Arc::clone(manager),
        session_id: request.session_id,
    };
    match registry.execute(&request.tool, params, &context).await {
        Ok(text) => {
            let result = serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text));
            json!({ "id": request.id, "ok": true, "result": result })
        }
        Err(e) => {
            warn!("Tool {} rejected: {e}", request.tool);
            json!({ "id": request.id, "ok": false, "error": e.to_string() })
        }
    }
}

/// Reads requests until stdin closes. Each request runs on its own task so
/// different sessions progress concurrently; calls on one session queue up.
async fn serve(registry: Arc<SkillRegistry>, manager: Arc<SessionManager>) -> Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Value>();

    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(response) = rx.recv().await {
            let mut line = response.to_string();
            line.push('\n');
            if let Err(e) = stdout.write_all(line.as_bytes()).await {
                error!("Cannot write response: {e}");
                break;
            }
            let _ = stdout.flush().await;
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        debug!("Request: {line}");
        let registry = Arc::clone(&registry);
        let manager = Arc::clone(&manager);
        let tx = tx.clone();
        tokio::spawn(async move {
            let response = handle_line(&registry, &manager, &line).await;
            let _ = tx.send(response);
        });
    }

    info!("Input closed, waiting for pending requests");
    drop(tx);
    let _ = writer.await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Handle --help / --version before anything else
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("fluux-sandbox v{}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            _ => {}
        }
    }

    // stdout carries responses, so logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("fluux_sandbox=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config/sandbox.toml".to_string());

    info!("Loading configuration from {config_path}");
    let config = Config::load_or_default(&config_path)?;

    info!("Allowed root: {}", config.allowed_root().display());
    info!("Session data: {}", config.data_dir().display());
    info!("Security level: {}", config.security.level);
    info!(
        "Timeouts: python {}s, shell {}s",
        config.execution.max_execution_time, config.execution.shell_timeout
    );

    let manager = Arc::new(SessionManager::new(config));
    let registry = Arc::new(SkillRegistry::with_builtins());
    info!("Skills: {} registered ({})", registry.len(), registry.names().join(", "));

    let outcome = tokio::select! {
        result = serve(registry, Arc::clone(&manager)) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received, exiting");
            Ok(())
        }
    };

    manager.shutdown().await;
    info!("All sessions closed");
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::testing::{scripted_factory, test_config};

    fn setup(dir: &std::path::Path) -> (SkillRegistry, Arc<SessionManager>) {
        let (factory, _) = scripted_factory();
        (
            SkillRegistry::with_builtins(),
            Arc::new(SessionManager::with_factory(test_config(dir), factory)),
        )
    }

    #[tokio::test]
    async fn test_execute_request() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, manager) = setup(dir.path());

        let out = handle_line(
            &registry,
            &manager,
            r#"{"id": 7, "tool": "execute", "params": {"code": "x = 1"}, "session_id": "s1"}"#,
        )
        .await;
        assert_eq!(out["id"], 7);
        assert_eq!(out["ok"], true);
        assert_eq!(out["result"]["success"], true);
        assert_eq!(out["result"]["session_id"], "s1");
    }

    #[tokio::test]
    async fn test_list_tools_request() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, manager) = setup(dir.path());

        let out = handle_line(&registry, &manager, r#"{"id": "a", "tool": "list_tools"}"#).await;
        assert_eq!(out["ok"], true);
        assert_eq!(out["result"].as_array().unwrap().len(), registry.len());
    }

    #[tokio::test]
    async fn test_text_result_and_errors() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, manager) = setup(dir.path());

        let text = handle_line(&registry, &manager, r#"{"tool": "list_artifacts"}"#).await;
        assert_eq!(text["result"], "No artifacts.");

        let missing = handle_line(&registry, &manager, r#"{"id": 1, "tool": "execute"}"#).await;
        assert_eq!(missing["ok"], false);
        assert!(missing["error"].as_str().unwrap().contains("code"));

        let unknown = handle_line(&registry, &manager, r#"{"tool": "launch_rocket"}"#).await;
        assert!(unknown["error"].as_str().unwrap().contains("Unknown tool"));

        let garbage = handle_line(&registry, &manager, "not json").await;
        assert_eq!(garbage["ok"], false);
        assert_eq!(garbage["id"], Value::Null);
    }
}
