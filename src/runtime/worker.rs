//! Persistent interpreter worker.
//!
//! One worker process per session holds the live namespace. The parent
//! talks to it over stdin/stdout, one JSON object per line:
//!
//!   → {"id": 7, "op": "exec", "code": "x = 5"}
//!   ← {"id": 7, "ok": true, "stdout": "", "result": null, ...}
//!
//! The worker announces itself with an `id: 0` ready line. Requests are
//! strictly sequential; a reply whose id does not match is discarded.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, info, warn};

use super::environment::{InterpreterEnvironment, ProcessEnv};
use super::process;
use crate::error::RuntimeFailure;

/// Bootstrap executed by the interpreter (`python -c`).
pub const WORKER_SOURCE: &str = include_str!("worker.py");

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

// ── Requests and replies ────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum WorkerRequest {
    Exec { code: String },
    Probe { library: String },
    Hook { producer: String, code: String },
    Chdir { path: PathBuf },
    Snapshot,
    Restore { values: BTreeMap<String, NamespaceValue> },
    Names,
    /// Reports compile-cache stats; `clear` empties the cache first,
    /// keeping import, def and class blocks when `important_only`.
    Cache { clear: bool, important_only: bool },
    Shutdown,
}

impl WorkerRequest {
    pub fn op(&self) -> &'static str {
        match self {
            Self::Exec { .. } => "exec",
            Self::Probe { .. } => "probe",
            Self::Hook { .. } => "hook",
            Self::Chdir { .. } => "chdir",
            Self::Snapshot => "snapshot",
            Self::Restore { .. } => "restore",
            Self::Names => "names",
            Self::Cache { .. } => "cache",
            Self::Shutdown => "shutdown",
        }
    }
}

/// A file a capture hook wrote during an `exec`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapturedFile {
    pub path: PathBuf,
    pub source: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ExecReply {
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    /// `repr` of a trailing expression
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub error: Option<RuntimeFailure>,
    #[serde(default)]
    pub artifacts: Vec<CapturedFile>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "encoding", rename_all = "lowercase")]
pub enum NamespaceValue {
    Json { value: Value },
    /// Base64 of the pickled object
    Pickle { data: String },
}

/// Namespace captured by value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamespaceSnapshot {
    pub values: BTreeMap<String, NamespaceValue>,
    /// Names that could not be encoded
    #[serde(default)]
    pub skipped: Vec<String>,
    #[serde(default = "Utc::now")]
    pub taken_at: DateTime<Utc>,
}

impl NamespaceSnapshot {
    pub fn empty() -> Self {
        Self {
            values: BTreeMap::new(),
            skipped: Vec::new(),
            taken_at: Utc::now(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RestoreReply {
    #[serde(default)]
    pub restored: Vec<String>,
    #[serde(default)]
    pub failed: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NameInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct NamesReply {
    #[serde(default)]
    pub names: Vec<NameInfo>,
}

/// Compiled-code cache held by the worker. Counters reset when cleared
/// and when the worker restarts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    #[serde(default)]
    pub entries: usize,
    #[serde(default)]
    pub hits: u64,
    #[serde(default)]
    pub misses: u64,
    #[serde(default)]
    pub hit_ratio: f64,
    /// Entries dropped by this call
    #[serde(default)]
    pub removed: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ProbeReply {
    #[serde(default)]
    pub available: bool,
}

/// What a running interpreter reports about itself.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InterpreterDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub python: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub virtual_env: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub site_packages: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum WorkerFault {
    #[error("failed to start interpreter: {0}")]
    Spawn(String),
    #[error("interpreter did not answer within {}s", .0.as_secs())]
    Timeout(Duration),
    #[error("interpreter exited: {0}")]
    Exited(String),
    #[error("interpreter protocol error: {0}")]
    Protocol(String),
    /// The worker handled the request but the operation failed.
    #[error("{0}")]
    Failed(String),
}

// ── Interpreter seam ────────────────────────────────────

/// A live interpreter holding one session's namespace.
#[async_trait]
pub trait Interpreter: Send {
    /// Starts the interpreter if needed. `true` means a fresh process
    /// (empty namespace, no hooks) was started by this call.
    async fn ensure_started(&mut self) -> Result<bool, WorkerFault>;

    fn is_running(&self) -> bool;

    /// Sends one request and waits for its reply body. On timeout the
    /// interpreter is killed and must be restarted.
    async fn call(&mut self, request: &WorkerRequest, timeout: Duration) -> Result<Value, WorkerFault>;

    async fn shutdown(&mut self);

    fn details(&self) -> InterpreterDetails;
}

/// `call` with the reply body decoded into `T`.
pub async fn call_as<T: DeserializeOwned>(
    interpreter: &mut dyn Interpreter,
    request: &WorkerRequest,
    timeout: Duration,
) -> Result<T, WorkerFault> {
    let body = interpreter.call(request, timeout).await?;
    serde_json::from_value(body)
        .map_err(|e| WorkerFault::Protocol(format!("bad {} reply: {e}", request.op())))
}

// ── Python worker process ───────────────────────────────

/// How to launch the worker of one session.
#[derive(Debug, Clone)]
pub struct WorkerSpec {
    pub session_id: String,
    pub environment: InterpreterEnvironment,
    pub cwd: PathBuf,
    pub env: ProcessEnv,
    pub startup_timeout: Duration,
}

struct Running {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
}

pub struct PythonWorker {
    spec: WorkerSpec,
    running: Option<Running>,
    next_id: u64,
    ready: Option<InterpreterDetails>,
}

impl PythonWorker {
    pub fn new(spec: WorkerSpec) -> Self {
        Self {
            spec,
            running: None,
            next_id: 1,
            ready: None,
        }
    }

    async fn spawn(&mut self) -> Result<(), WorkerFault> {
        let session = self.spec.session_id.clone();
        let mut cmd = Command::new(&self.spec.environment.python);
        cmd.arg("-u")
            .arg("-c")
            .arg(WORKER_SOURCE)
            .current_dir(&self.spec.cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        self.spec.env.apply(&mut cmd);
        process::isolate_group(&mut cmd);

        let mut child = cmd
            .spawn()
            .map_err(|e| WorkerFault::Spawn(format!("{}: {e}", self.spec.environment.python.display())))?;
        let stdin = child.stdin.take().ok_or_else(|| WorkerFault::Spawn("no stdin pipe".into()))?;
        let stdout = child.stdout.take().ok_or_else(|| WorkerFault::Spawn("no stdout pipe".into()))?;
        if let Some(stderr) = child.stderr.take() {
            let label = session.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("[{label}] worker: {line}");
                }
            });
        }

        let mut running = Running {
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
        };
        let ready = tokio::time::timeout(self.spec.startup_timeout, read_reply(&mut running.stdout, 0)).await;
        let ready = match ready {
            Ok(Ok(v)) => v,
            Ok(Err(fault)) => {
                process::kill_tree(&mut running.child).await;
                return Err(fault);
            }
            Err(_) => {
                process::kill_tree(&mut running.child).await;
                return Err(WorkerFault::Spawn(format!(
                    "no ready signal within {}s",
                    self.spec.startup_timeout.as_secs()
                )));
            }
        };

        let mut details: InterpreterDetails = serde_json::from_value(ready).unwrap_or_default();
        details.virtual_env = self.spec.environment.virtual_env.clone();
        details.site_packages = self.spec.environment.site_packages.clone();
        info!(
            "[{session}] Interpreter worker started (pid={}, python {})",
            details.pid.map(|p| p.to_string()).unwrap_or_else(|| "?".into()),
            details.version.as_deref().unwrap_or("?")
        );
        self.ready = Some(details);
        self.running = Some(running);
        Ok(())
    }

    async fn kill(&mut self) {
        if let Some(mut running) = self.running.take() {
            process::kill_tree(&mut running.child).await;
        }
    }

    /// Reaps a worker whose pipe closed and describes how it ended.
    async fn reap(&mut self) -> String {
        let Some(mut running) = self.running.take() else {
            return "not running".into();
        };
        match tokio::time::timeout(SHUTDOWN_TIMEOUT, running.child.wait()).await {
            Ok(Ok(status)) => format!("worker ended with {status}"),
            _ => {
                process::kill_tree(&mut running.child).await;
                "worker closed its pipe".into()
            }
        }
    }
}

#[async_trait]
impl Interpreter for PythonWorker {
    async fn ensure_started(&mut self) -> Result<bool, WorkerFault> {
        if let Some(running) = self.running.as_mut() {
            match running.child.try_wait() {
                Ok(None) => return Ok(false),
                Ok(Some(status)) => {
                    warn!("[{}] Worker died ({status}), restarting", self.spec.session_id);
                }
                Err(e) => warn!("[{}] Worker state unknown ({e}), restarting", self.spec.session_id),
            }
            self.kill().await;
        }
        self.spawn().await?;
        Ok(true)
    }

    fn is_running(&self) -> bool {
        self.running.is_some()
    }

    async fn call(&mut self, request: &WorkerRequest, timeout: Duration) -> Result<Value, WorkerFault> {
        let id = self.next_id;
        self.next_id += 1;
        let running = self
            .running
            .as_mut()
            .ok_or_else(|| WorkerFault::Exited("worker is not running".into()))?;

        let mut message = serde_json::to_value(request)
            .map_err(|e| WorkerFault::Protocol(e.to_string()))?;
        if let Value::Object(map) = &mut message {
            map.insert("id".into(), Value::from(id));
        }
        let mut line = message.to_string();
        line.push('\n');

        let written = async {
            running.stdin.write_all(line.as_bytes()).await?;
            running.stdin.flush().await
        }
        .await;
        if let Err(e) = written {
            debug!("[{}] Write to worker failed: {e}", self.spec.session_id);
            return Err(WorkerFault::Exited(self.reap().await));
        }

        match tokio::time::timeout(timeout, read_reply(&mut running.stdout, id)).await {
            Ok(Ok(body)) => Ok(body),
            Ok(Err(WorkerFault::Exited(_))) => Err(WorkerFault::Exited(self.reap().await)),
            Ok(Err(fault)) => Err(fault),
            Err(_) => {
                warn!(
                    "[{}] Worker {} timed out after {}s, killing it",
                    self.spec.session_id,
                    request.op(),
                    timeout.as_secs()
                );
                self.kill().await;
                Err(WorkerFault::Timeout(timeout))
            }
        }
    }

    async fn shutdown(&mut self) {
        if self.running.is_none() {
            return;
        }
        let _ = self.call(&WorkerRequest::Shutdown, SHUTDOWN_TIMEOUT).await;
        if let Some(mut running) = self.running.take() {
            drop(running.stdin);
            if tokio::time::timeout(SHUTDOWN_TIMEOUT, running.child.wait()).await.is_err() {
                process::terminate_tree(&mut running.child, process::GRACE_PERIOD).await;
            }
        }
        debug!("[{}] Interpreter worker stopped", self.spec.session_id);
    }

    fn details(&self) -> InterpreterDetails {
        self.ready.clone().unwrap_or_else(|| InterpreterDetails {
            python: Some(self.spec.environment.python.clone()),
            virtual_env: self.spec.environment.virtual_env.clone(),
            site_packages: self.spec.environment.site_packages.clone(),
            ..Default::default()
        })
    }
}

impl Drop for PythonWorker {
    fn drop(&mut self) {
        if let Some(pid) = self.running.as_ref().and_then(|r| r.child.id()) {
            let _ = process::kill_group(pid);
        }
    }
}

/// Reads lines until the reply for `id` arrives; returns its body.
async fn read_reply(
    stdout: &mut Lines<BufReader<ChildStdout>>,
    id: u64,
) -> Result<Value, WorkerFault> {
    loop {
        let line = match stdout.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => return Err(WorkerFault::Exited("pipe closed".into())),
            Err(e) => return Err(WorkerFault::Protocol(e.to_string())),
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut reply: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                debug!("Ignoring non-protocol worker output ({e}): {line}");
                continue;
            }
        };
        if reply.get("id").and_then(Value::as_u64) != Some(id) {
            debug!("Discarding stale worker reply: {line}");
            continue;
        }
        if reply.get("ok").and_then(Value::as_bool) != Some(true) {
            let fault = reply
                .get("fault")
                .and_then(Value::as_str)
                .unwrap_or("request failed")
                .to_string();
            return Err(WorkerFault::Failed(fault));
        }
        if let Value::Object(map) = &mut reply {
            map.remove("id");
            map.remove("ok");
        }
        return Ok(reply);
    }
}
