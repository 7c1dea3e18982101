//! Session Manager: creates, persists, restores and destroys execution
//! contexts. Exactly one context is live per session id.

pub mod files;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{info, warn};

use crate::artifacts::{Artifact, ArtifactCategory, ArtifactStore, CleanupReport};
use crate::config::Config;
use crate::error::SandboxError;
use crate::policy::AccessPolicy;
use crate::runtime::context::{ContextParts, SaveSummary};
use crate::runtime::environment::{ProcessEnv, WorkerPaths};
use crate::runtime::{
    ContextState, ExecutionContext, ExecutionKind, ExecutionRecord, Interpreter,
    InterpreterEnvironment, PythonWorker, WorkerSpec,
};
use files::{SavedState, SessionFiles};

/// Session used when a request names none.
pub const DEFAULT_SESSION: &str = "default";

const MAX_ID_LEN: usize = 64;
const STARTUP_TIMEOUT: Duration = Duration::from_secs(30);

/// Where a session's interpreter runs and may write.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub session_id: String,
    pub cwd: PathBuf,
    pub allowed_root: PathBuf,
    pub session_dir: PathBuf,
    pub tmp_dir: PathBuf,
    pub artifact_root: PathBuf,
}

/// What a factory hands back for a new context.
pub struct Launched {
    pub interpreter: Box<dyn Interpreter>,
    pub shell_env: ProcessEnv,
}

pub type InterpreterFactory =
    Arc<dyn Fn(&LaunchSpec) -> Result<Launched, SandboxError> + Send + Sync>;

/// Launches a [`PythonWorker`] in the detected interpreter environment.
pub fn python_factory(config: &Config) -> InterpreterFactory {
    let config = config.clone();
    Arc::new(move |launch: &LaunchSpec| {
        let environment = InterpreterEnvironment::detect(
            config.execution.python.as_deref(),
            std::slice::from_ref(&launch.allowed_root),
        )?;
        let level = config.security.level;
        let paths = WorkerPaths {
            tmp_dir: launch.tmp_dir.clone(),
            artifact_root: launch.artifact_root.clone(),
            write_roots: vec![
                launch.allowed_root.clone(),
                launch.session_dir.clone(),
                launch.artifact_root.clone(),
            ],
        };
        let env = environment.worker_env(level, &paths, config.execution.memory_limit_mb);
        let shell_env = environment.shell_env(level, &launch.tmp_dir);
        let worker = PythonWorker::new(WorkerSpec {
            session_id: launch.session_id.clone(),
            environment,
            cwd: launch.cwd.clone(),
            env,
            startup_timeout: STARTUP_TIMEOUT,
        });
        Ok(Launched {
            interpreter: Box::new(worker),
            shell_env,
        })
    })
}

/// Session ids name directories: `[A-Za-z0-9_-]{1,64}`.
pub fn validate_session_id(id: &str) -> Result<(), SandboxError> {
    let valid = !id.is_empty()
        && id.len() <= MAX_ID_LEN
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(SandboxError::invalid(format!(
            "invalid session id '{id}' (expected 1-{MAX_ID_LEN} of A-Z a-z 0-9 _ -)"
        )))
    }
}

/// A live session. Operations on it queue on the context lock.
pub struct Session {
    id: String,
    context: Mutex<ExecutionContext>,
}

impl Session {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn lock(&self) -> MutexGuard<'_, ExecutionContext> {
        self.context.lock().await
    }
}

/// Selects records from a session's history.
#[derive(Debug, Clone, Default)]
pub struct HistoryFilter {
    pub success: Option<bool>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub kind: Option<ExecutionKind>,
    /// Keep only the most recent N matches
    pub limit: Option<usize>,
}

impl HistoryFilter {
    pub fn matches(&self, record: &ExecutionRecord) -> bool {
        self.success.map_or(true, |s| record.success == s)
            && self.kind.map_or(true, |k| record.kind == k)
            && self.since.map_or(true, |t| record.started_at >= t)
            && self.until.map_or(true, |t| record.started_at <= t)
    }

    pub fn apply(&self, records: Vec<ExecutionRecord>) -> Vec<ExecutionRecord> {
        let mut selected: Vec<ExecutionRecord> =
            records.into_iter().filter(|r| self.matches(r)).collect();
        if let Some(limit) = self.limit {
            let skip = selected.len().saturating_sub(limit);
            selected.drain(..skip);
        }
        selected
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RestoreSummary {
    pub session_id: String,
    pub restored: Vec<String>,
    pub failed: Vec<String>,
    pub history_len: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct DestroySummary {
    pub session_id: String,
    pub was_live: bool,
    pub artifacts_removed: usize,
}

/// One line of `list_sessions`.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    /// `None` while an operation holds the session
    pub state: Option<ContextState>,
    pub cwd: Option<PathBuf>,
    pub executions: Option<usize>,
    pub busy: bool,
}

pub struct SessionManager {
    config: Config,
    artifacts: Arc<ArtifactStore>,
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    factory: InterpreterFactory,
}

impl SessionManager {
    pub fn new(config: Config) -> Self {
        let factory = python_factory(&config);
        Self::with_factory(config, factory)
    }

    pub fn with_factory(config: Config, factory: InterpreterFactory) -> Self {
        Self {
            config,
            artifacts: Arc::new(ArtifactStore::new()),
            sessions: Mutex::new(HashMap::new()),
            factory,
        }
    }

    fn files(&self, session_id: &str) -> SessionFiles {
        SessionFiles::locate(&self.config.data_dir(), session_id)
    }

    // ── Lookup and creation ─────────────────────────────

    /// Returns the live session, creating it (and restoring any persisted
    /// state) if needed. `None` means the default session.
    pub async fn get_or_create(&self, session_id: Option<&str>) -> Result<Arc<Session>, SandboxError> {
        let id = session_id.unwrap_or(DEFAULT_SESSION);
        validate_session_id(id)?;

        let mut sessions = self.sessions.lock().await;
        if let Some(session) = sessions.get(id) {
            return Ok(session.clone());
        }

        let mut context = self.build_context(id)?;
        let files = context.files().clone();
        if files.has_saved_state() {
            match files.load_state() {
                Ok(saved) => {
                    info!(
                        "[{id}] Resuming saved session ({} record(s))",
                        saved.history.len()
                    );
                    context.preload(saved);
                }
                Err(e) => warn!("[{id}] Ignoring unreadable saved state: {e}"),
            }
        } else if let Ok(history) = files.read_history() {
            context.preload(SavedState {
                history,
                ..Default::default()
            });
        }

        let session = Arc::new(Session {
            id: id.to_string(),
            context: Mutex::new(context),
        });
        sessions.insert(id.to_string(), session.clone());
        info!("[{id}] Session created");
        Ok(session)
    }

    /// Creates a session with a fresh random id.
    pub async fn create(&self) -> Result<Arc<Session>, SandboxError> {
        let id = uuid::Uuid::new_v4().simple().to_string();
        self.get_or_create(Some(&id)).await
    }

    pub async fn live(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions.lock().await.get(session_id).cloned()
    }

    fn build_context(&self, id: &str) -> Result<ExecutionContext, SandboxError> {
        let policy = AccessPolicy::from_config(&self.config, id)?;
        let files = SessionFiles::open(&self.config.data_dir(), id)?;
        let artifact_root = self
            .artifacts
            .open_session(id, &self.config.artifact_root(id, files.dir()))?;
        let launch = LaunchSpec {
            session_id: id.to_string(),
            cwd: policy.cwd().to_path_buf(),
            allowed_root: policy.root().to_path_buf(),
            session_dir: files.dir().to_path_buf(),
            tmp_dir: files.tmp_dir(),
            artifact_root: artifact_root.clone(),
        };
        let launched = (self.factory)(&launch)?;
        Ok(ExecutionContext::new(ContextParts {
            session_id: id.to_string(),
            config: self.config.clone(),
            policy,
            files,
            artifacts: self.artifacts.clone(),
            artifact_root,
            interpreter: launched.interpreter,
            shell_env: launched.shell_env,
        }))
    }

    // ── Persistence ─────────────────────────────────────

    pub async fn save(&self, session_id: &str) -> Result<SaveSummary, SandboxError> {
        let session = self
            .live(session_id)
            .await
            .ok_or_else(|| SandboxError::invalid(format!("no live session '{session_id}'")))?;
        let mut context = session.lock().await;
        context.save().await
    }

    /// Replaces the live context with one rebuilt from disk. Values are
    /// replayed into the namespace; code is not re-executed.
    pub async fn restore(&self, session_id: &str) -> Result<RestoreSummary, SandboxError> {
        validate_session_id(session_id)?;
        let files = self.files(session_id);
        if !files.has_saved_state() {
            return Err(SandboxError::invalid(format!(
                "no saved state for session '{session_id}'"
            )));
        }
        let saved = files
            .load_state()
            .map_err(|e| SandboxError::internal(format!("cannot read saved session: {e}")))?;

        // The map guard is a temporary; other sessions stay reachable while
        // this one waits for its running call and rebuilds
        let old = self.sessions.lock().await.remove(session_id);
        if let Some(old) = old {
            old.lock().await.terminate(false).await;
        }

        let mut context = self.build_context(session_id)?;
        let snapshot = saved.snapshot.clone();
        let history_len = saved.history.len();
        context.preload(SavedState {
            snapshot: None,
            ..saved
        });
        context.initialize().await?;
        let reply = match snapshot {
            Some(snapshot) => context.load_snapshot(snapshot).await?,
            None => Default::default(),
        };

        let session = Arc::new(Session {
            id: session_id.to_string(),
            context: Mutex::new(context),
        });
        let displaced = self.sessions.lock().await.insert(session_id.to_string(), session);
        if let Some(displaced) = displaced {
            warn!("[{session_id}] Replacing a context opened during restore");
            displaced.lock().await.terminate(false).await;
        }
        info!(
            "[{session_id}] Restored {} value(s), {history_len} history record(s)",
            reply.restored.len()
        );
        Ok(RestoreSummary {
            session_id: session_id.to_string(),
            restored: reply.restored,
            failed: reply.failed,
            history_len,
        })
    }

    /// Live history if the session is active, else the persisted one.
    pub async fn history(
        &self,
        session_id: &str,
        filter: &HistoryFilter,
    ) -> Result<Vec<ExecutionRecord>, SandboxError> {
        validate_session_id(session_id)?;
        let records = match self.live(session_id).await {
            Some(session) => session.lock().await.history().to_vec(),
            None => {
                let files = self.files(session_id);
                if !files.dir().is_dir() {
                    return Err(SandboxError::invalid(format!("unknown session '{session_id}'")));
                }
                files.read_history()?
            }
        };
        Ok(filter.apply(records))
    }

    // ── Artifacts ───────────────────────────────────────

    /// Artifacts of one session, or of every session the store knows.
    /// A saved session that is not live has its index read from disk.
    pub async fn list_artifacts(
        &self,
        session_id: Option<&str>,
        category: Option<ArtifactCategory>,
    ) -> Result<Vec<Artifact>, SandboxError> {
        match session_id {
            Some(id) => {
                self.with_artifact_index(id, |store| Ok(store.list(Some(id), category)))
                    .await
            }
            None => Ok(self.artifacts.list(None, category)),
        }
    }

    /// Deletes a session's artifacts. Unknown sessions clean nothing.
    pub async fn cleanup_artifacts(
        &self,
        session_id: &str,
        category: Option<ArtifactCategory>,
    ) -> Result<CleanupReport, SandboxError> {
        self.with_artifact_index(session_id, |store| store.cleanup(session_id, category))
            .await
    }

    async fn with_artifact_index<T: Default>(
        &self,
        session_id: &str,
        f: impl FnOnce(&ArtifactStore) -> Result<T, SandboxError>,
    ) -> Result<T, SandboxError> {
        validate_session_id(session_id)?;
        // Held so the session cannot go live while its index is borrowed
        let sessions = self.sessions.lock().await;
        if sessions.contains_key(session_id) || self.artifacts.artifact_root(session_id).is_some() {
            return f(&self.artifacts);
        }
        let root = self.config.artifact_root(session_id, self.files(session_id).dir());
        if !root.is_dir() {
            return Ok(T::default());
        }
        self.artifacts.open_session(session_id, &root)?;
        let result = f(&self.artifacts);
        self.artifacts.forget_session(session_id);
        result
    }

    // ── Teardown ────────────────────────────────────────

    /// Tears a live session down, persisting it per configuration.
    /// Returns false if it was not live.
    pub async fn close(&self, session_id: &str) -> bool {
        let Some(session) = self.sessions.lock().await.remove(session_id) else {
            return false;
        };
        let persist = self.config.storage.persist_on_teardown;
        session.lock().await.terminate(persist).await;
        info!("[{session_id}] Session closed");
        true
    }

    /// Deletes a session entirely: context, artifacts, history and saved state.
    pub async fn destroy(&self, session_id: &str) -> Result<DestroySummary, SandboxError> {
        validate_session_id(session_id)?;
        let live = self.sessions.lock().await.remove(session_id);
        let was_live = live.is_some();
        if let Some(session) = live {
            session.lock().await.terminate(false).await;
        }

        let files = self.files(session_id);
        let artifact_root = self.config.artifact_root(session_id, files.dir());
        let artifacts_removed = if artifact_root.exists() {
            self.artifacts.open_session(session_id, &artifact_root)?;
            self.artifacts.purge_session(session_id)?
        } else {
            0
        };
        files.remove_all()?;
        info!("[{session_id}] Session destroyed ({artifacts_removed} artifact(s))");
        Ok(DestroySummary {
            session_id: session_id.to_string(),
            was_live,
            artifacts_removed,
        })
    }

    /// Closes every live session (process teardown).
    pub async fn shutdown(&self) {
        let drained: Vec<Arc<Session>> = self.sessions.lock().await.drain().map(|(_, s)| s).collect();
        let persist = self.config.storage.persist_on_teardown;
        for session in drained {
            session.lock().await.terminate(persist).await;
        }
        info!("Session manager stopped");
    }

    /// Removes saved sessions untouched for longer than `max_age`.
    /// Live sessions are never swept.
    pub async fn sweep_stale(&self, max_age: Duration) -> Result<Vec<String>, SandboxError> {
        let data_dir = self.config.data_dir();
        let entries = match std::fs::read_dir(&data_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let cutoff = SystemTime::now()
            .checked_sub(max_age)
            .unwrap_or(SystemTime::UNIX_EPOCH);

        let live: Vec<String> = self.sessions.lock().await.keys().cloned().collect();
        let mut removed = Vec::new();
        for entry in entries.flatten() {
            let Ok(id) = entry.file_name().into_string() else {
                continue;
            };
            if !entry.path().is_dir() || validate_session_id(&id).is_err() || live.contains(&id) {
                continue;
            }
            let files = self.files(&id);
            if files.last_activity().is_some_and(|t| t >= cutoff) {
                continue;
            }
            let artifact_root = self.config.artifact_root(&id, files.dir());
            if let Err(e) = files.remove_all() {
                warn!("[{id}] Failed to sweep session directory: {e}");
                continue;
            }
            if let Err(e) = std::fs::remove_dir_all(&artifact_root) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("[{id}] Failed to sweep artifacts: {e}");
                }
            }
            removed.push(id);
        }
        removed.sort();
        if !removed.is_empty() {
            info!("Swept {} stale session(s)", removed.len());
        }
        Ok(removed)
    }

    pub async fn list_sessions(&self) -> Vec<SessionSummary> {
        let sessions = self.sessions.lock().await;
        let mut summaries: Vec<SessionSummary> = sessions
            .values()
            .map(|session| match session.context.try_lock() {
                Ok(ctx) => SessionSummary {
                    session_id: session.id.clone(),
                    state: Some(ctx.state()),
                    cwd: Some(ctx.cwd().to_path_buf()),
                    executions: Some(ctx.history().len()),
                    busy: false,
                },
                Err(_) => SessionSummary {
                    session_id: session.id.clone(),
                    state: None,
                    cwd: None,
                    executions: None,
                    busy: true,
                },
            })
            .collect();
        summaries.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        summaries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::testing::{python_or_skip, scripted_factory, test_config, ScriptedInterpreter};
    use std::sync::Mutex as StdMutex;

    struct Fixture {
        dir: tempfile::TempDir,
        manager: SessionManager,
        /// Every interpreter the factory handed out
        launched: Arc<StdMutex<Vec<ScriptedInterpreter>>>,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let (factory, launched) = scripted_factory();
        Fixture {
            manager: SessionManager::with_factory(test_config(dir.path()), factory),
            dir,
            launched,
        }
    }

    #[test]
    fn test_session_id_validation() {
        assert!(validate_session_id("abc-DEF_123").is_ok());
        assert!(validate_session_id("").is_err());
        assert!(validate_session_id("../etc").is_err());
        assert!(validate_session_id("a/b").is_err());
        assert!(validate_session_id(&"x".repeat(65)).is_err());
    }

    #[tokio::test]
    async fn test_get_or_create_reuses_live_context() {
        let f = fixture();
        let a = f.manager.get_or_create(Some("s1")).await.unwrap();
        a.lock().await.execute("x = 1").await.unwrap();
        let b = f.manager.get_or_create(Some("s1")).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(f.launched.lock().unwrap().len(), 1);

        let default = f.manager.get_or_create(None).await.unwrap();
        assert_eq!(default.id(), DEFAULT_SESSION);
        let fresh = f.manager.create().await.unwrap();
        assert_eq!(fresh.id().len(), 32);
    }

    #[tokio::test]
    async fn test_invalid_id_is_rejected() {
        let f = fixture();
        let err = f.manager.get_or_create(Some("../x")).await.err().unwrap();
        assert!(matches!(err, SandboxError::InvalidRequest { .. }));
    }

    #[tokio::test]
    async fn test_same_session_calls_queue() {
        let f = fixture();
        let session = f.manager.get_or_create(Some("q")).await.unwrap();
        let mut tasks = Vec::new();
        for i in 0..8 {
            let session = session.clone();
            tasks.push(tokio::spawn(async move {
                session.lock().await.execute(&format!("v{i} = {i}")).await.unwrap().id
            }));
        }
        let mut ids = Vec::new();
        for task in tasks {
            ids.push(task.await.unwrap());
        }
        ids.sort();
        assert_eq!(ids, (1..=8).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn test_save_and_restore_replays_values_only() {
        let f = fixture();
        let session = f.manager.get_or_create(Some("s")).await.unwrap();
        session.lock().await.execute("x = 5").await.unwrap();
        let summary = f.manager.save("s").await.unwrap();
        assert_eq!(summary.variables, 1);

        let restored = f.manager.restore("s").await.unwrap();
        assert_eq!(restored.restored, vec!["x".to_string()]);
        assert_eq!(restored.history_len, 1);

        let interps = f.launched.lock().unwrap().clone();
        assert_eq!(interps.len(), 2);
        // Old interpreter shut down, new one never re-ran `x = 5`
        assert!(!interps[0].state().running);
        assert!(!interps[1].state().ops.contains(&"exec".to_string()));

        let session = f.manager.get_or_create(Some("s")).await.unwrap();
        let record = session.lock().await.execute("x").await.unwrap();
        assert_eq!(record.result.as_deref(), Some("5"));
        assert_eq!(record.id, 2);
    }

    #[tokio::test]
    async fn test_restore_does_not_block_other_sessions() {
        let f = Arc::new(fixture());
        let s1 = f.manager.get_or_create(Some("s1")).await.unwrap();
        s1.lock().await.execute("x = 1").await.unwrap();
        f.manager.save("s1").await.unwrap();

        // A call in flight on s1 keeps its restore waiting
        let busy = s1.lock().await;
        let restoring = {
            let f = f.clone();
            tokio::spawn(async move { f.manager.restore("s1").await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let s2 = tokio::time::timeout(Duration::from_secs(2), f.manager.get_or_create(Some("s2")))
            .await
            .expect("s2 lookup blocked by s1 restore")
            .unwrap();
        s2.lock().await.execute("y = 2").await.unwrap();
        assert!(!restoring.is_finished());

        drop(busy);
        let summary = restoring.await.unwrap().unwrap();
        assert_eq!(summary.restored, vec!["x".to_string()]);
        let s1 = f.manager.live("s1").await.unwrap();
        assert_eq!(s1.lock().await.execute("x").await.unwrap().result.as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn test_restore_without_saved_state_fails() {
        let f = fixture();
        let err = f.manager.restore("nothing").await.unwrap_err();
        assert!(matches!(err, SandboxError::InvalidRequest { .. }));
    }

    #[tokio::test]
    async fn test_close_persists_and_get_or_create_resumes() {
        let f = fixture();
        let session = f.manager.get_or_create(Some("p")).await.unwrap();
        session.lock().await.execute("x = 3").await.unwrap();
        assert!(f.manager.close("p").await);
        assert!(!f.manager.close("p").await);

        let session = f.manager.get_or_create(Some("p")).await.unwrap();
        let record = session.lock().await.execute("x").await.unwrap();
        assert_eq!(record.result.as_deref(), Some("3"));
        assert_eq!(session.lock().await.history().len(), 2);
    }

    #[tokio::test]
    async fn test_history_filtering() {
        let f = fixture();
        let session = f.manager.get_or_create(Some("h")).await.unwrap();
        {
            let mut ctx = session.lock().await;
            ctx.execute("a = 1").await.unwrap();
            ctx.execute("raise ValueError").await.unwrap();
            ctx.execute("b = 2").await.unwrap();
        }

        let failures = f
            .manager
            .history("h", &HistoryFilter { success: Some(false), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].id, 2);

        let last = f
            .manager
            .history("h", &HistoryFilter { limit: Some(1), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(last[0].source, "b = 2");

        let future = f
            .manager
            .history(
                "h",
                &HistoryFilter {
                    since: Some(Utc::now() + chrono::Duration::hours(1)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(future.is_empty());

        // Persisted history is served once the session is closed
        f.manager.close("h").await;
        assert_eq!(f.manager.history("h", &HistoryFilter::default()).await.unwrap().len(), 3);
        assert!(f.manager.history("ghost", &HistoryFilter::default()).await.is_err());
    }

    #[tokio::test]
    async fn test_destroy_cascades() {
        let f = fixture();
        let session = f.manager.get_or_create(Some("d")).await.unwrap();
        let (artifact_root, session_dir) = {
            let mut ctx = session.lock().await;
            let root = ctx.artifact_root().to_path_buf();
            std::fs::write(root.join("data").join("t.csv"), "a\n").unwrap();
            ctx.execute("x = 1").await.unwrap();
            (root, ctx.files().dir().to_path_buf())
        };

        let summary = f.manager.destroy("d").await.unwrap();
        assert!(summary.was_live);
        assert_eq!(summary.artifacts_removed, 1);
        assert!(!artifact_root.exists());
        assert!(!session_dir.exists());
        assert!(f.manager.live("d").await.is_none());
        assert!(f.manager.artifacts.list(Some("d"), None).is_empty());
    }

    #[tokio::test]
    async fn test_artifacts_of_saved_session_are_reachable() {
        let f = fixture();
        let session = f.manager.get_or_create(Some("art")).await.unwrap();
        {
            let mut ctx = session.lock().await;
            let root = ctx.artifact_root().to_path_buf();
            std::fs::write(root.join("images").join("a.png"), b"png").unwrap();
            std::fs::write(root.join("data").join("b.csv"), "x\n").unwrap();
            ctx.execute("x = 1").await.unwrap();
        }
        f.manager.close("art").await;

        let listed = f.manager.list_artifacts(Some("art"), None).await.unwrap();
        assert_eq!(listed.len(), 2);
        let images = f
            .manager
            .list_artifacts(Some("art"), Some(ArtifactCategory::Image))
            .await
            .unwrap();
        assert_eq!(images.len(), 1);
        assert_eq!(f.manager.cleanup_artifacts("art", Some(ArtifactCategory::Data)).await.unwrap().removed, 1);
        assert_eq!(f.manager.list_artifacts(Some("art"), None).await.unwrap().len(), 1);
        // Not left attached to the store
        assert!(f.manager.artifacts.artifact_root("art").is_none());
    }

    #[tokio::test]
    async fn test_cleanup_of_unknown_session_is_a_no_op() {
        let f = fixture();
        assert_eq!(f.manager.cleanup_artifacts("nobody", None).await.unwrap().removed, 0);
        assert!(f.manager.list_artifacts(Some("nobody"), None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sweep_skips_live_and_recent() {
        let f = fixture();
        f.manager.get_or_create(Some("live")).await.unwrap();
        for id in ["old", "recent"] {
            let s = f.manager.get_or_create(Some(id)).await.unwrap();
            s.lock().await.execute("x = 1").await.unwrap();
            f.manager.close(id).await;
        }
        let old_dir = f.dir.path().join("data").join("old");
        let past = filetime::FileTime::from_unix_time(1_000_000, 0);
        for entry in std::fs::read_dir(&old_dir).unwrap().flatten() {
            filetime::set_file_mtime(entry.path(), past).unwrap();
        }
        filetime::set_file_mtime(&old_dir, past).unwrap();

        let removed = f.manager.sweep_stale(Duration::from_secs(3600)).await.unwrap();
        assert_eq!(removed, vec!["old".to_string()]);
        assert!(!old_dir.exists());
        assert!(f.dir.path().join("data").join("recent").exists());
        assert!(f.dir.path().join("data").join("live").exists());
    }

    #[tokio::test]
    async fn test_list_and_shutdown() {
        let f = fixture();
        f.manager.get_or_create(Some("b")).await.unwrap();
        let a = f.manager.get_or_create(Some("a")).await.unwrap();
        a.lock().await.execute("x = 1").await.unwrap();

        let listed = f.manager.list_sessions().await;
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].session_id, "a");
        assert_eq!(listed[0].executions, Some(1));
        assert_eq!(listed[1].state, Some(ContextState::Uninitialized));

        f.manager.shutdown().await;
        assert!(f.manager.list_sessions().await.is_empty());
        assert!(f.launched.lock().unwrap().iter().all(|i| !i.state().running));
        // Persisted on teardown
        assert!(f.dir.path().join("data").join("a").join("namespace.json").exists());
    }

    /// Real interpreter: values survive save, restore and a fresh manager.
    #[tokio::test]
    async fn test_python_round_trip() {
        if python_or_skip().is_none() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let manager = SessionManager::new(test_config(dir.path()));
        let session = manager.get_or_create(Some("rt")).await.unwrap();
        {
            let mut ctx = session.lock().await;
            let first = ctx.execute("x = 5\nitems = [1, 'two', {'k': 3.5}]").await.unwrap();
            assert!(first.success, "{:?}", first.error);
            let second = ctx.execute("x + 1").await.unwrap();
            assert_eq!(second.result.as_deref(), Some("6"));
        }
        manager.save("rt").await.unwrap();

        let summary = manager.restore("rt").await.unwrap();
        assert!(summary.failed.is_empty(), "{:?}", summary.failed);
        let session = manager.get_or_create(Some("rt")).await.unwrap();
        let check = session.lock().await.execute("(x, items)").await.unwrap();
        assert_eq!(check.result.as_deref(), Some("(5, [1, 'two', {'k': 3.5}])"));
        manager.shutdown().await;

        let again = SessionManager::new(test_config(dir.path()));
        let session = again.get_or_create(Some("rt")).await.unwrap();
        let check = session.lock().await.execute("x * 2").await.unwrap();
        assert_eq!(check.result.as_deref(), Some("10"));
        again.shutdown().await;
    }

    #[tokio::test]
    async fn test_python_shell_timeout() {
        if python_or_skip().is_none() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let manager = SessionManager::new(test_config(dir.path()));
        let session = manager.get_or_create(Some("sh")).await.unwrap();
        let start = std::time::Instant::now();
        let record = session.lock().await.run_shell("sleep 10", None, Some(1)).await.unwrap();
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(record.error, Some(SandboxError::TimeoutError { seconds: 1 }));
        manager.shutdown().await;
    }
}
