//! Execution Context: the live state of one session.
//!
//! Owns the interpreter worker (and with it the persistent namespace), the
//! access policy, the capture hooks and the execution history. Every
//! operation takes `&mut self`, so callers that share a context behind a
//! mutex get per-session queuing for free.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::environment::ProcessEnv;
use super::shell;
use super::worker::{
    call_as, CacheStats, CapturedFile, ExecReply, Interpreter, InterpreterDetails, NameInfo, NamesReply,
    NamespaceSnapshot, RestoreReply, WorkerFault, WorkerRequest,
};
use crate::artifacts::{ArtifactRef, ArtifactReport, ArtifactStore};
use crate::capture::CaptureInterceptor;
use crate::config::{Config, RetentionPolicy};
use crate::error::{RuntimeFailure, SandboxError};
use crate::policy::AccessPolicy;
use crate::session::files::{SavedState, SessionFiles, SessionMeta};

/// Budget for bookkeeping requests (chdir, snapshot, names, restore).
const CALL_TIMEOUT: Duration = Duration::from_secs(30);
/// Budget for probing and installing capture hooks; importing a plotting
/// library for the first time can be slow.
const CAPTURE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContextState {
    Uninitialized,
    Ready,
    Running,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionKind {
    Python,
    Shell,
}

/// One `execute` or `run_shell` call. Never changed once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: u64,
    pub kind: ExecutionKind,
    /// Code or command text
    pub source: String,
    pub cwd: PathBuf,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    /// `repr` of a trailing expression
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<SandboxError>,
    #[serde(default)]
    pub artifacts: Vec<ArtifactRef>,
}

impl ExecutionRecord {
    pub fn new(id: u64, kind: ExecutionKind, source: impl Into<String>, cwd: PathBuf) -> Self {
        let now = Utc::now();
        Self {
            id,
            kind,
            source: source.into(),
            cwd,
            started_at: now,
            finished_at: now,
            duration_ms: 0,
            stdout: String::new(),
            stderr: String::new(),
            result: None,
            exit_code: None,
            success: false,
            error: None,
            artifacts: Vec::new(),
        }
    }

    fn finish(&mut self) {
        self.finished_at = Utc::now();
        self.duration_ms = (self.finished_at - self.started_at).num_milliseconds().max(0) as u64;
    }

    /// stdout followed by stderr, as a caller would have seen them.
    pub fn output(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (_, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => format!("{}\n{}", self.stdout.trim_end_matches('\n'), self.stderr),
        }
    }
}

/// Aggregates over a session's history.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExecutionStats {
    pub total_executions: usize,
    pub successful: usize,
    pub failed: usize,
    pub python_executions: usize,
    pub shell_executions: usize,
    pub total_duration_ms: u64,
    pub average_duration_ms: f64,
    pub artifact_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_execution_at: Option<DateTime<Utc>>,
}

impl ExecutionStats {
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a ExecutionRecord>) -> Self {
        let mut stats = Self::default();
        for record in records {
            stats.total_executions += 1;
            if record.success {
                stats.successful += 1;
            } else {
                stats.failed += 1;
            }
            match record.kind {
                ExecutionKind::Python => stats.python_executions += 1,
                ExecutionKind::Shell => stats.shell_executions += 1,
            }
            stats.total_duration_ms += record.duration_ms;
            stats.artifact_count += record.artifacts.len();
            stats.last_execution_at = Some(record.finished_at);
        }
        if stats.total_executions > 0 {
            stats.average_duration_ms = stats.total_duration_ms as f64 / stats.total_executions as f64;
        }
        stats
    }
}

/// What `get_session_info` reports.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub state: ContextState,
    pub created_at: DateTime<Utc>,
    pub cwd: PathBuf,
    pub allowed_root: PathBuf,
    pub artifact_root: PathBuf,
    pub session_dir: PathBuf,
    pub security_level: String,
    pub interpreter: InterpreterDetails,
    pub capture: Vec<String>,
    pub variables: Vec<NameInfo>,
    pub stats: ExecutionStats,
    /// Absent while no interpreter is running
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compile_cache: Option<CacheStats>,
    pub artifacts: ArtifactReport,
}

/// Result of persisting the namespace.
#[derive(Debug, Clone, Serialize)]
pub struct SaveSummary {
    pub session_id: String,
    pub variables: usize,
    pub skipped: Vec<String>,
    pub path: PathBuf,
}

/// Everything an [`ExecutionContext`] is assembled from.
pub struct ContextParts {
    pub session_id: String,
    pub config: Config,
    pub policy: AccessPolicy,
    pub files: SessionFiles,
    pub artifacts: Arc<ArtifactStore>,
    pub artifact_root: PathBuf,
    pub interpreter: Box<dyn Interpreter>,
    pub shell_env: ProcessEnv,
}

pub struct ExecutionContext {
    session_id: String,
    state: ContextState,
    config: Config,
    policy: AccessPolicy,
    files: SessionFiles,
    interpreter: Box<dyn Interpreter>,
    capture: CaptureInterceptor,
    artifacts: Arc<ArtifactStore>,
    artifact_root: PathBuf,
    shell_env: ProcessEnv,
    history: Vec<ExecutionRecord>,
    next_id: u64,
    last_snapshot: Option<NamespaceSnapshot>,
    /// Python executions since the last snapshot
    since_snapshot: u32,
    created_at: DateTime<Utc>,
}

impl ExecutionContext {
    pub fn new(parts: ContextParts) -> Self {
        Self {
            session_id: parts.session_id,
            state: ContextState::Uninitialized,
            config: parts.config,
            policy: parts.policy,
            files: parts.files,
            interpreter: parts.interpreter,
            capture: CaptureInterceptor::builtin(CAPTURE_TIMEOUT),
            artifacts: parts.artifacts,
            artifact_root: parts.artifact_root,
            shell_env: parts.shell_env,
            history: Vec::new(),
            next_id: 1,
            last_snapshot: None,
            since_snapshot: 0,
            created_at: Utc::now(),
        }
    }

    /// Seeds the context with persisted state before `initialize`.
    pub fn preload(&mut self, saved: SavedState) {
        if let Some(meta) = saved.meta {
            self.created_at = meta.created_at;
            if !self.policy.adopt_cwd(&meta.cwd) {
                warn!(
                    "[{}] Saved cwd {} is no longer usable, starting at {}",
                    self.session_id,
                    meta.cwd.display(),
                    self.policy.cwd().display()
                );
            }
        }
        self.next_id = saved.history.iter().map(|r| r.id).max().unwrap_or(0) + 1;
        self.history = saved.history;
        self.last_snapshot = saved.snapshot;
    }

    // ── Accessors ───────────────────────────────────────

    pub fn state(&self) -> ContextState {
        self.state
    }

    pub fn cwd(&self) -> &Path {
        self.policy.cwd()
    }

    pub fn policy(&self) -> &AccessPolicy {
        &self.policy
    }

    pub fn files(&self) -> &SessionFiles {
        &self.files
    }

    pub fn artifact_root(&self) -> &Path {
        &self.artifact_root
    }

    pub fn history(&self) -> &[ExecutionRecord] {
        &self.history
    }

    pub fn stats(&self) -> ExecutionStats {
        ExecutionStats::from_records(&self.history)
    }

    // ── Lifecycle ───────────────────────────────────────

    /// `UNINITIALIZED -> READY`: starts the interpreter, installs capture
    /// and restores the preloaded namespace.
    pub async fn initialize(&mut self) -> Result<(), SandboxError> {
        self.ensure_usable()?;
        if self.state == ContextState::Uninitialized {
            self.ensure_interpreter().await?;
            self.state = ContextState::Ready;
            info!(
                "[{}] Context ready (cwd {}, capture: {:?})",
                self.session_id,
                self.policy.cwd().display(),
                self.capture.active()
            );
        }
        Ok(())
    }

    /// `READY -> TERMINATED`. Waits for nothing: the caller holds `&mut self`,
    /// so any running operation has already finished.
    pub async fn terminate(&mut self, persist: bool) {
        if self.state == ContextState::Terminated {
            return;
        }
        if persist {
            if let Err(e) = self.save().await {
                warn!("[{}] Failed to persist session on teardown: {e}", self.session_id);
            }
        }
        self.capture.uninstall(self.interpreter.as_mut()).await;
        self.interpreter.shutdown().await;
        if self.config.storage.retention == RetentionPolicy::Delete {
            if let Err(e) = self.files.clear_tmp() {
                warn!("[{}] Failed to clear scratch directory: {e}", self.session_id);
            }
        }
        self.artifacts.forget_session(&self.session_id);
        self.state = ContextState::Terminated;
        info!("[{}] Context terminated", self.session_id);
    }

    fn ensure_usable(&self) -> Result<(), SandboxError> {
        if self.state == ContextState::Terminated {
            return Err(SandboxError::invalid(format!(
                "session '{}' has been terminated",
                self.session_id
            )));
        }
        Ok(())
    }

    /// Starts the worker if needed; a fresh worker gets capture, cwd and
    /// the last snapshot back.
    async fn ensure_interpreter(&mut self) -> Result<(), SandboxError> {
        let fresh = self
            .interpreter
            .ensure_started()
            .await
            .map_err(|e| SandboxError::internal(e.to_string()))?;
        if !fresh {
            return Ok(());
        }

        self.capture.reset();
        if let Err(e) = self.capture.install(self.interpreter.as_mut()).await {
            warn!("[{}] Capture not installed: {e}", self.session_id);
        }
        self.sync_worker_cwd().await;

        if let Some(snapshot) = self.last_snapshot.clone().filter(|s| !s.is_empty()) {
            let reply = self.restore_values(&snapshot).await?;
            info!(
                "[{}] Restored {} value(s) into fresh interpreter",
                self.session_id,
                reply.restored.len()
            );
        }
        Ok(())
    }

    async fn sync_worker_cwd(&mut self) {
        let request = WorkerRequest::Chdir {
            path: self.policy.cwd().to_path_buf(),
        };
        if let Err(e) = self.interpreter.call(&request, CALL_TIMEOUT).await {
            warn!("[{}] Interpreter chdir failed: {e}", self.session_id);
        }
    }

    async fn restore_values(&mut self, snapshot: &NamespaceSnapshot) -> Result<RestoreReply, SandboxError> {
        let request = WorkerRequest::Restore {
            values: snapshot.values.clone(),
        };
        let reply: RestoreReply = call_as(self.interpreter.as_mut(), &request, CALL_TIMEOUT)
            .await
            .map_err(|e| self.worker_error(e))?;
        if !reply.failed.is_empty() {
            warn!("[{}] Could not restore: {}", self.session_id, reply.failed.join(", "));
        }
        Ok(reply)
    }

    /// Maps a fault outside `execute` to an error; the interpreter is
    /// gone after a timeout, so its hooks are too.
    fn worker_error(&mut self, fault: WorkerFault) -> SandboxError {
        match fault {
            WorkerFault::Timeout(d) => {
                self.capture.reset();
                SandboxError::TimeoutError { seconds: d.as_secs() }
            }
            WorkerFault::Exited(_) => {
                self.capture.reset();
                SandboxError::internal(fault.to_string())
            }
            other => SandboxError::internal(other.to_string()),
        }
    }

    // ── Execution ───────────────────────────────────────

    /// Runs code against the persistent namespace. Failures of the code
    /// itself come back inside the record.
    pub async fn execute(&mut self, code: &str) -> Result<ExecutionRecord, SandboxError> {
        self.ensure_usable()?;
        if self.state == ContextState::Uninitialized {
            self.initialize().await?;
        }
        self.state = ContextState::Running;
        let outcome = self.execute_inner(code).await;
        self.state = ContextState::Ready;
        let record = outcome?;

        self.since_snapshot += 1;
        self.commit(record.clone());
        let every = self.config.execution.autosave_every;
        if every > 0 && self.since_snapshot >= every {
            debug!("[{}] Autosave after {} executions", self.session_id, self.since_snapshot);
            if let Err(e) = self.save().await {
                warn!("[{}] Autosave failed: {e}", self.session_id);
            }
        }
        Ok(record)
    }

    async fn execute_inner(&mut self, code: &str) -> Result<ExecutionRecord, SandboxError> {
        let mut record = ExecutionRecord::new(
            self.next_id,
            ExecutionKind::Python,
            code,
            self.policy.cwd().to_path_buf(),
        );
        self.ensure_interpreter().await?;

        let timeout = self.config.max_execution_time();
        let request = WorkerRequest::Exec {
            code: code.to_string(),
        };
        let mut captured = Vec::new();
        match call_as::<ExecReply>(self.interpreter.as_mut(), &request, timeout).await {
            Ok(reply) => {
                record.stdout = reply.stdout;
                record.stderr = reply.stderr;
                record.result = reply.result;
                record.success = reply.error.is_none();
                record.error = reply.error.map(SandboxError::RuntimeFailure);
                captured = reply.artifacts;
                if let Some(cwd) = reply.cwd {
                    self.follow_interpreter_cwd(&cwd).await;
                }
            }
            Err(WorkerFault::Timeout(limit)) => {
                warn!("[{}] Execution exceeded {}s, interpreter killed", self.session_id, limit.as_secs());
                self.capture.reset();
                record.error = Some(SandboxError::TimeoutError {
                    seconds: limit.as_secs(),
                });
            }
            Err(WorkerFault::Exited(reason)) => {
                warn!("[{}] Interpreter exited during execution: {reason}", self.session_id);
                self.capture.reset();
                record.error = Some(SandboxError::RuntimeFailure(RuntimeFailure::new(
                    "InterpreterExited",
                    reason,
                )));
            }
            Err(other) => record.error = Some(SandboxError::internal(other.to_string())),
        }
        record.artifacts = self.collect_artifacts(captured);
        record.finish();
        Ok(record)
    }

    /// Keeps the policy cwd in step with `os.chdir` inside user code,
    /// pulling the interpreter back if it left the allowed root.
    async fn follow_interpreter_cwd(&mut self, cwd: &Path) {
        if cwd == self.policy.cwd() {
            return;
        }
        if self.policy.adopt_cwd(cwd) {
            debug!("[{}] cwd now {}", self.session_id, cwd.display());
        } else {
            warn!(
                "[{}] Interpreter moved outside the allowed root ({}), moving it back",
                self.session_id,
                cwd.display()
            );
            self.sync_worker_cwd().await;
        }
    }

    /// Registers hook-captured files, then anything new written straight
    /// into the artifact root.
    fn collect_artifacts(&self, captured: Vec<CapturedFile>) -> Vec<ArtifactRef> {
        let mut refs = Vec::new();
        for file in captured {
            match self
                .artifacts
                .register(&self.session_id, &file.path, None, Some(&file.source))
            {
                Ok(artifact) => refs.push(artifact.to_ref()),
                Err(e) => warn!("[{}] Captured file not registered: {e}", self.session_id),
            }
        }
        refs.extend(self.artifacts.scan_new(&self.session_id).iter().map(|a| a.to_ref()));
        refs
    }

    /// Runs a shell command under the Command Filter and Path Guard.
    pub async fn run_shell(
        &mut self,
        command: &str,
        cwd: Option<&str>,
        timeout_secs: Option<u64>,
    ) -> Result<ExecutionRecord, SandboxError> {
        self.ensure_usable()?;
        if command.trim().is_empty() {
            return Err(SandboxError::invalid("empty command"));
        }
        self.policy.check_command(command)?;
        let dir = self.policy.resolve_dir(cwd)?;
        let timeout = self.config.shell_timeout(timeout_secs);

        let mut record = ExecutionRecord::new(self.next_id, ExecutionKind::Shell, command, dir.clone());
        let previous = self.state;
        self.state = ContextState::Running;
        let outcome = shell::run_shell(command, &dir, &self.shell_env, timeout).await;
        self.state = previous;
        let outcome = outcome.map_err(|e| SandboxError::internal(format!("failed to start shell: {e}")))?;

        record.exit_code = outcome.exit_code;
        record.success = outcome.success();
        record.error = if outcome.timed_out {
            warn!("[{}] Shell command exceeded {}s: {command}", self.session_id, timeout.as_secs());
            Some(SandboxError::TimeoutError {
                seconds: timeout.as_secs(),
            })
        } else if !outcome.success() {
            let message = match outcome.exit_code {
                Some(code) => format!("exit status {code}"),
                None => "terminated by signal".to_string(),
            };
            let mut failure = RuntimeFailure::new("CommandError", message);
            failure.traceback = outcome.stderr.clone();
            Some(SandboxError::RuntimeFailure(failure))
        } else {
            None
        };
        record.stdout = outcome.stdout;
        record.stderr = outcome.stderr;
        record.artifacts = self.collect_artifacts(Vec::new());
        record.finish();

        self.commit(record.clone());
        Ok(record)
    }

    fn commit(&mut self, record: ExecutionRecord) {
        match &record.error {
            Some(err) => debug!(
                "[{}] Execution {} failed ({}) after {}ms",
                self.session_id,
                record.id,
                err.kind(),
                record.duration_ms
            ),
            None => debug!(
                "[{}] Execution {} succeeded in {}ms",
                self.session_id, record.id, record.duration_ms
            ),
        }
        self.next_id = record.id + 1;
        if let Err(e) = self.files.append_record(&record) {
            warn!("[{}] Failed to append history: {e}", self.session_id);
        }
        self.history.push(record);
    }

    // ── Working directory ───────────────────────────────

    pub async fn change_dir(&mut self, path: &str) -> Result<PathBuf, SandboxError> {
        self.ensure_usable()?;
        let dir = self.policy.change_dir(path)?;
        if self.interpreter.is_running() {
            self.sync_worker_cwd().await;
        }
        info!("[{}] Working directory: {}", self.session_id, dir.display());
        Ok(dir)
    }

    // ── Snapshots ───────────────────────────────────────

    /// Captures the namespace by value. Without a live interpreter the
    /// last snapshot is the namespace (it is what a restart restores).
    pub async fn snapshot(&mut self) -> Result<NamespaceSnapshot, SandboxError> {
        self.ensure_usable()?;
        if self.interpreter.is_running() {
            match call_as::<NamespaceSnapshot>(self.interpreter.as_mut(), &WorkerRequest::Snapshot, CALL_TIMEOUT)
                .await
            {
                Ok(snapshot) => {
                    if !snapshot.skipped.is_empty() {
                        debug!("[{}] Not snapshotted: {}", self.session_id, snapshot.skipped.join(", "));
                    }
                    self.last_snapshot = Some(snapshot);
                    self.since_snapshot = 0;
                }
                Err(fault) => {
                    let err = self.worker_error(fault);
                    warn!("[{}] Snapshot failed, keeping the previous one: {err}", self.session_id);
                }
            }
        }
        Ok(self.last_snapshot.clone().unwrap_or_else(NamespaceSnapshot::empty))
    }

    /// Writes `namespace.json` and `session.json`.
    pub async fn save(&mut self) -> Result<SaveSummary, SandboxError> {
        let snapshot = self.snapshot().await?;
        self.files.write_snapshot(&snapshot)?;
        self.files.write_meta(&self.meta())?;
        info!(
            "[{}] Saved {} variable(s) to {}",
            self.session_id,
            snapshot.values.len(),
            self.files.namespace_path().display()
        );
        Ok(SaveSummary {
            session_id: self.session_id.clone(),
            variables: snapshot.values.len(),
            skipped: snapshot.skipped,
            path: self.files.namespace_path(),
        })
    }

    /// Replays values into the namespace; no code is re-executed.
    pub async fn load_snapshot(&mut self, snapshot: NamespaceSnapshot) -> Result<RestoreReply, SandboxError> {
        self.ensure_usable()?;
        self.last_snapshot = Some(snapshot.clone());
        if self.state == ContextState::Uninitialized {
            // initialize restores last_snapshot itself
            self.initialize().await?;
            return Ok(RestoreReply {
                restored: snapshot.values.keys().cloned().collect(),
                failed: Vec::new(),
            });
        }
        self.ensure_interpreter().await?;
        self.restore_values(&snapshot).await
    }

    fn meta(&self) -> SessionMeta {
        SessionMeta {
            version: 1,
            session_id: self.session_id.clone(),
            created_at: self.created_at,
            updated_at: Utc::now(),
            cwd: self.policy.cwd().to_path_buf(),
            execution_count: self.history.len(),
        }
    }

    // ── Introspection ───────────────────────────────────

    pub async fn info(&mut self) -> SessionInfo {
        let variables = self.variables().await;
        let compile_cache = self.cache_request(false, false).await.ok().flatten();
        SessionInfo {
            session_id: self.session_id.clone(),
            state: self.state,
            created_at: self.created_at,
            cwd: self.policy.cwd().to_path_buf(),
            allowed_root: self.policy.root().to_path_buf(),
            artifact_root: self.artifact_root.clone(),
            session_dir: self.files.dir().to_path_buf(),
            security_level: self.policy.level().to_string(),
            interpreter: self.interpreter.details(),
            capture: self.capture.active().iter().map(|s| s.to_string()).collect(),
            variables,
            stats: self.stats(),
            compile_cache,
            artifacts: self.artifacts.report(&self.session_id),
        }
    }

    /// Empties the worker's compile cache. With `important_only`, blocks
    /// containing imports or definitions survive. A stopped worker has
    /// nothing cached.
    pub async fn clear_cache(&mut self, important_only: bool) -> Result<CacheStats, SandboxError> {
        self.ensure_usable()?;
        let stats = self.cache_request(true, important_only).await?.unwrap_or_default();
        info!(
            "[{}] Compile cache cleared ({} removed, {} kept)",
            self.session_id, stats.removed, stats.entries
        );
        Ok(stats)
    }

    async fn cache_request(&mut self, clear: bool, important_only: bool) -> Result<Option<CacheStats>, SandboxError> {
        if !self.interpreter.is_running() {
            return Ok(None);
        }
        let request = WorkerRequest::Cache { clear, important_only };
        match call_as::<CacheStats>(self.interpreter.as_mut(), &request, CALL_TIMEOUT).await {
            Ok(stats) => Ok(Some(stats)),
            Err(fault) => {
                let err = self.worker_error(fault);
                warn!("[{}] Compile cache request failed: {err}", self.session_id);
                Err(err)
            }
        }
    }

    async fn variables(&mut self) -> Vec<NameInfo> {
        if self.interpreter.is_running() {
            match call_as::<NamesReply>(self.interpreter.as_mut(), &WorkerRequest::Names, CALL_TIMEOUT).await {
                Ok(reply) => return reply.names,
                Err(fault) => {
                    let err = self.worker_error(fault);
                    warn!("[{}] Could not list names: {err}", self.session_id);
                }
            }
        }
        self.last_snapshot
            .iter()
            .flat_map(|s| s.values.keys())
            .map(|name| NameInfo {
                name: name.clone(),
                type_name: "saved".to_string(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::testing::{test_config, ScriptedInterpreter};
    use crate::runtime::worker::NamespaceValue;
    use serde_json::json;

    struct Fixture {
        _dir: tempfile::TempDir,
        interp: ScriptedInterpreter,
        ctx: ExecutionContext,
    }

    fn fixture_with(tweak: impl FnOnce(&mut Config)) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        tweak(&mut config);

        let policy = AccessPolicy::from_config(&config, "t").unwrap();
        let files = SessionFiles::open(&config.data_dir(), "t").unwrap();
        let store = Arc::new(ArtifactStore::new());
        let artifact_root = store
            .open_session("t", &config.artifact_root("t", files.dir()))
            .unwrap();
        let interp = ScriptedInterpreter::with_libraries(&["matplotlib"]);
        let ctx = ExecutionContext::new(ContextParts {
            session_id: "t".into(),
            config,
            policy,
            files,
            artifacts: store,
            artifact_root,
            interpreter: Box::new(interp.clone()),
            shell_env: ProcessEnv::new(false),
        });
        Fixture {
            _dir: dir,
            interp,
            ctx,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(|_| {})
    }

    #[tokio::test]
    async fn test_initialize_installs_capture_and_syncs_cwd() {
        let mut f = fixture();
        assert_eq!(f.ctx.state(), ContextState::Uninitialized);
        f.ctx.initialize().await.unwrap();

        assert_eq!(f.ctx.state(), ContextState::Ready);
        let state = f.interp.state();
        assert!(state.hooked.contains("matplotlib"));
        assert_eq!(state.cwd.as_deref(), Some(f.ctx.cwd()));
    }

    #[tokio::test]
    async fn test_namespace_persists_across_calls() {
        let mut f = fixture();
        let first = f.ctx.execute("x = 5").await.unwrap();
        assert!(first.success);
        let second = f.ctx.execute("x").await.unwrap();
        assert_eq!(second.result.as_deref(), Some("5"));
        assert_eq!(second.id, 2);
        assert_eq!(f.ctx.history().len(), 2);
        assert_eq!(f.interp.state().starts, 1);
    }

    #[tokio::test]
    async fn test_runtime_error_is_recorded_not_raised() {
        let mut f = fixture();
        let record = f.ctx.execute("print hi\nraise ValueError").await.unwrap();
        assert!(!record.success);
        match record.error {
            Some(SandboxError::RuntimeFailure(ref failure)) => assert_eq!(failure.kind, "ValueError"),
            ref other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(record.stdout, "hi\n");
        assert_eq!(f.ctx.state(), ContextState::Ready);
        // The context keeps working
        assert!(f.ctx.execute("y = 1").await.unwrap().success);
    }

    #[tokio::test]
    async fn test_timeout_restarts_and_restores_snapshot() {
        let mut f = fixture();
        f.ctx.execute("x = 5").await.unwrap();
        f.ctx.snapshot().await.unwrap();

        let record = f.ctx.execute("hang").await.unwrap();
        assert!(matches!(record.error, Some(SandboxError::TimeoutError { .. })));
        assert!(!record.success);

        let after = f.ctx.execute("x").await.unwrap();
        assert_eq!(after.result.as_deref(), Some("5"));
        let state = f.interp.state();
        assert_eq!(state.starts, 2);
        // Capture was reinstalled in the new interpreter
        assert!(state.hooked.contains("matplotlib"));
    }

    #[tokio::test]
    async fn test_crash_is_a_runtime_failure() {
        let mut f = fixture();
        let record = f.ctx.execute("crash").await.unwrap();
        match record.error {
            Some(SandboxError::RuntimeFailure(ref failure)) => assert_eq!(failure.kind, "InterpreterExited"),
            ref other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_blocked_command_never_runs() {
        let mut f = fixture();
        let marker = f.ctx.cwd().join("marker");
        let command = format!("touch {} && sudo ls", marker.display());
        let err = f.ctx.run_shell(&command, None, None).await.unwrap_err();
        assert!(matches!(err, SandboxError::SecurityViolation { .. }));
        assert!(!marker.exists());
        assert!(f.ctx.history().is_empty());
    }

    #[tokio::test]
    async fn test_shell_cwd_outside_root_is_rejected() {
        let mut f = fixture();
        let err = f.ctx.run_shell("ls", Some("/"), None).await.unwrap_err();
        assert!(matches!(err, SandboxError::PathViolation { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shell_timeout_is_recorded() {
        let mut f = fixture();
        let start = std::time::Instant::now();
        let record = f.ctx.run_shell("sleep 10", None, Some(1)).await.unwrap();
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(record.error, Some(SandboxError::TimeoutError { seconds: 1 }));
        assert_eq!(record.kind, ExecutionKind::Shell);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shell_nonzero_exit_and_output() {
        let mut f = fixture();
        let ok = f.ctx.run_shell("echo hello", None, None).await.unwrap();
        assert!(ok.success);
        assert_eq!(ok.output(), "hello\n");

        let failed = f.ctx.run_shell("echo oops >&2; exit 4", None, None).await.unwrap();
        assert!(!failed.success);
        assert_eq!(failed.exit_code, Some(4));
        match failed.error {
            Some(SandboxError::RuntimeFailure(ref failure)) => {
                assert_eq!(failure.kind, "CommandError");
                assert_eq!(failure.message, "exit status 4");
            }
            ref other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(f.ctx.stats().shell_executions, 2);
    }

    #[tokio::test]
    async fn test_change_dir_inside_and_outside() {
        let mut f = fixture();
        f.ctx.initialize().await.unwrap();
        let sub = f.ctx.policy().root().join("sub");
        std::fs::create_dir_all(&sub).unwrap();

        let dir = f.ctx.change_dir("sub").await.unwrap();
        assert_eq!(dir, sub);
        assert_eq!(f.interp.state().cwd.as_deref(), Some(sub.as_path()));

        let err = f.ctx.change_dir("/").await.unwrap_err();
        assert!(matches!(err, SandboxError::PathViolation { .. }));
        assert_eq!(f.ctx.cwd(), sub);
    }

    #[tokio::test]
    async fn test_interpreter_cwd_outside_root_is_pulled_back() {
        let mut f = fixture();
        let root = f.ctx.policy().root().to_path_buf();
        let sub = root.join("inner");
        std::fs::create_dir_all(&sub).unwrap();

        f.ctx.execute(&format!("cd {}", sub.display())).await.unwrap();
        assert_eq!(f.ctx.cwd(), sub);

        f.ctx.execute("cd /").await.unwrap();
        assert_eq!(f.ctx.cwd(), sub);
        assert_eq!(f.interp.state().cwd.as_deref(), Some(sub.as_path()));
    }

    #[tokio::test]
    async fn test_captured_and_scanned_artifacts_are_registered() {
        let mut f = fixture();
        f.ctx.initialize().await.unwrap();
        let root = f.ctx.artifact_root().to_path_buf();
        let plot = root.join("images").join("plot_1.png");
        std::fs::write(&plot, b"\x89PNG\r\n\x1a\n").unwrap();
        std::fs::write(root.join("data").join("out.csv"), "a,b\n1,2\n").unwrap();
        f.interp.state().pending_artifacts.push((plot.clone(), "matplotlib".into()));

        let record = f.ctx.execute("print plotted").await.unwrap();
        assert_eq!(record.artifacts.len(), 2);
        assert_eq!(record.artifacts[0].path, plot);

        let listed = f.ctx.artifacts.list(Some("t"), None);
        assert_eq!(listed[0].source.as_deref(), Some("matplotlib"));
        assert_eq!(listed[1].source.as_deref(), Some("scan"));

        // Nothing new: nothing registered again
        let again = f.ctx.execute("print again").await.unwrap();
        assert!(again.artifacts.is_empty());
    }

    #[tokio::test]
    async fn test_autosave_writes_snapshot() {
        let mut f = fixture_with(|c| c.execution.autosave_every = 2);
        f.ctx.execute("a = 1").await.unwrap();
        assert!(!f.ctx.files().namespace_path().exists());
        f.ctx.execute("b = 2").await.unwrap();

        let saved = f.ctx.files().read_snapshot().unwrap().unwrap();
        assert_eq!(saved.values.len(), 2);
        assert_eq!(f.ctx.files().read_meta().unwrap().unwrap().execution_count, 2);
    }

    #[tokio::test]
    async fn test_terminate_persists_and_rejects_further_calls() {
        let mut f = fixture_with(|c| c.storage.retention = RetentionPolicy::Delete);
        f.ctx.execute("x = 5").await.unwrap();
        std::fs::write(f.ctx.files().tmp_dir().join("scratch"), "x").unwrap();

        f.ctx.terminate(true).await;
        assert_eq!(f.ctx.state(), ContextState::Terminated);
        {
            let state = f.interp.state();
            assert!(!state.running);
            assert!(state.hooked.is_empty());
        }
        assert!(!f.ctx.files().tmp_dir().join("scratch").exists());
        let saved = f.ctx.files().read_snapshot().unwrap().unwrap();
        assert_eq!(saved.values["x"], NamespaceValue::Json { value: json!(5) });

        let err = f.ctx.execute("x").await.unwrap_err();
        assert!(matches!(err, SandboxError::InvalidRequest { .. }));
        // Terminating twice is harmless
        f.ctx.terminate(true).await;
    }

    #[tokio::test]
    async fn test_preload_restores_values_and_numbering() {
        let mut f = fixture();
        let mut snapshot = NamespaceSnapshot::empty();
        snapshot
            .values
            .insert("x".into(), NamespaceValue::Json { value: json!(41) });
        let mut old = ExecutionRecord::new(7, ExecutionKind::Python, "x = 41", PathBuf::from("/w"));
        old.success = true;
        f.ctx.preload(SavedState {
            meta: None,
            snapshot: Some(snapshot),
            history: vec![old],
        });

        let record = f.ctx.execute("x").await.unwrap();
        assert_eq!(record.result.as_deref(), Some("41"));
        assert_eq!(record.id, 8);
        // The old code was not executed again
        let ops = f.interp.state().ops.clone();
        assert_eq!(ops.iter().filter(|op| *op == "exec").count(), 1);
    }

    #[tokio::test]
    async fn test_info_reports_variables_and_capture() {
        let mut f = fixture();
        f.ctx.execute("x = 1").await.unwrap();
        f.ctx.execute("raise KeyError").await.unwrap();

        let info = f.ctx.info().await;
        assert_eq!(info.state, ContextState::Ready);
        assert_eq!(info.capture, vec!["matplotlib".to_string()]);
        assert_eq!(info.variables[0].name, "x");
        assert_eq!(info.stats.total_executions, 2);
        assert_eq!(info.stats.failed, 1);
        assert_eq!(info.security_level, "standard");
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["state"], "READY");
    }

    #[tokio::test]
    async fn test_compile_cache_stats_and_clear() {
        let mut f = fixture();
        assert_eq!(f.ctx.clear_cache(false).await.unwrap(), CacheStats::default());
        assert!(f.ctx.info().await.compile_cache.is_none());

        f.ctx.execute("import math").await.unwrap();
        f.ctx.execute("y = 2").await.unwrap();
        f.ctx.execute("y = 2").await.unwrap();
        let cache = f.ctx.info().await.compile_cache.unwrap();
        assert_eq!((cache.entries, cache.hits, cache.misses), (2, 1, 2));

        let cleared = f.ctx.clear_cache(true).await.unwrap();
        assert_eq!((cleared.removed, cleared.entries, cleared.hits), (1, 1, 0));
        assert!(f.interp.state().compiled.contains("import math"));
    }

    #[test]
    fn test_stats_from_records() {
        let mut a = ExecutionRecord::new(1, ExecutionKind::Python, "a", PathBuf::from("/"));
        a.success = true;
        a.duration_ms = 10;
        let mut b = ExecutionRecord::new(2, ExecutionKind::Shell, "b", PathBuf::from("/"));
        b.duration_ms = 30;
        let stats = ExecutionStats::from_records(&[a, b]);
        assert_eq!(stats.total_executions, 2);
        assert_eq!(stats.successful, 1);
        assert_eq!(stats.shell_executions, 1);
        assert_eq!(stats.average_duration_ms, 20.0);
    }

    #[test]
    fn test_record_serialization_has_no_type_field() {
        let record = ExecutionRecord::new(1, ExecutionKind::Shell, "ls", PathBuf::from("/"));
        let json = serde_json::to_value(&record).unwrap();
        assert!(json.get("type").is_none());
        assert_eq!(json["kind"], "shell");
    }
}
