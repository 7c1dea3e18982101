//! Test doubles for the interpreter seam.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::environment::{InterpreterEnvironment, ProcessEnv};
use super::worker::{Interpreter, InterpreterDetails, NamespaceValue, WorkerFault, WorkerRequest};
use crate::config::Config;
use crate::session::{InterpreterFactory, LaunchSpec, Launched};

/// A real interpreter for integration-style tests, or `None` (test skips).
pub fn python_or_skip() -> Option<InterpreterEnvironment> {
    match InterpreterEnvironment::detect(None, &[]) {
        Ok(env) => Some(env),
        Err(_) => {
            eprintln!("python3 not available, skipping");
            None
        }
    }
}

/// Config rooted in `dir`: allowed root `dir/root`, data under `dir/data`.
pub fn test_config(dir: &Path) -> Config {
    let root = dir.join("root");
    std::fs::create_dir_all(&root).unwrap();
    let mut config = Config::default();
    config.storage.allowed_root = Some(root);
    config.storage.data_dir = Some(dir.join("data"));
    config
}

/// A factory handing out [`ScriptedInterpreter`]s, and the list of every
/// interpreter it created.
pub fn scripted_factory() -> (InterpreterFactory, Arc<Mutex<Vec<ScriptedInterpreter>>>) {
    let launched: Arc<Mutex<Vec<ScriptedInterpreter>>> = Arc::default();
    let sink = launched.clone();
    let factory: InterpreterFactory = Arc::new(move |_launch: &LaunchSpec| {
        let interp = ScriptedInterpreter::new();
        sink.lock().unwrap().push(interp.clone());
        Ok(Launched {
            interpreter: Box::new(interp),
            shell_env: ProcessEnv::new(false),
        })
    });
    (factory, launched)
}

/// Observable state of a [`ScriptedInterpreter`].
#[derive(Debug, Default)]
pub struct ScriptState {
    pub running: bool,
    pub starts: u32,
    /// Libraries reported as importable by `probe`
    pub libraries: BTreeSet<String>,
    pub hooked: BTreeSet<String>,
    /// Every `hook` request, in order: (producer, code)
    pub hook_calls: Vec<(String, String)>,
    pub namespace: BTreeMap<String, Value>,
    pub cwd: Option<PathBuf>,
    /// Ops received, in order
    pub ops: Vec<String>,
    /// Files reported as captured by the next `exec`
    pub pending_artifacts: Vec<(PathBuf, String)>,
    /// Sources seen by `exec`, standing in for the compile cache
    pub compiled: BTreeSet<String>,
    pub cache_hits: u64,
    pub cache_misses: u64,
}

/// In-memory interpreter understanding a tiny line language:
///
/// - `name = <json>` binds a value
/// - `name` (last line) evaluates to the JSON text of the value
/// - `print <text>` appends to stdout
/// - `raise <Kind>` fails with a runtime error of that kind
/// - `hang` never answers (the call times out)
/// - `crash` makes the process exit
/// - `cd <dir>` changes the interpreter's own cwd
#[derive(Clone, Default)]
pub struct ScriptedInterpreter {
    pub state: Arc<Mutex<ScriptState>>,
}

impl ScriptedInterpreter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_libraries(libraries: &[&str]) -> Self {
        let interp = Self::new();
        interp.state().libraries = libraries.iter().map(|l| l.to_string()).collect();
        interp
    }

    pub fn state(&self) -> std::sync::MutexGuard<'_, ScriptState> {
        self.state.lock().unwrap()
    }

    fn exec(&self, code: &str, timeout: Duration) -> Result<Value, WorkerFault> {
        let mut state = self.state();
        if state.compiled.insert(code.to_string()) {
            state.cache_misses += 1;
        } else {
            state.cache_hits += 1;
        }
        let mut stdout = String::new();
        let mut result = None;
        let lines: Vec<&str> = code.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
        for (i, line) in lines.iter().enumerate() {
            if *line == "hang" {
                state.running = false;
                return Err(WorkerFault::Timeout(timeout));
            }
            if *line == "crash" {
                state.running = false;
                return Err(WorkerFault::Exited("worker ended with exit status: 1".into()));
            }
            if let Some(kind) = line.strip_prefix("raise ") {
                return Ok(json!({
                    "stdout": stdout, "stderr": "", "result": null,
                    "error": {"kind": kind, "message": "scripted failure",
                              "traceback": format!("Traceback:\n{kind}: scripted failure\n")},
                    "artifacts": [], "cwd": state.cwd,
                }));
            }
            if let Some(text) = line.strip_prefix("print ") {
                stdout.push_str(text);
                stdout.push('\n');
            } else if let Some(dir) = line.strip_prefix("cd ") {
                state.cwd = Some(PathBuf::from(dir));
            } else if let Some((name, value)) = line.split_once('=') {
                let value: Value = serde_json::from_str(value.trim()).unwrap_or(Value::Null);
                state.namespace.insert(name.trim().to_string(), value);
            } else if i == lines.len() - 1 {
                match state.namespace.get(*line) {
                    Some(v) => result = Some(v.to_string()),
                    None => {
                        return Ok(json!({
                            "stdout": stdout, "stderr": "", "result": null,
                            "error": {"kind": "NameError", "message": format!("name '{line}' is not defined")},
                            "artifacts": [], "cwd": state.cwd,
                        }))
                    }
                }
            }
        }
        let artifacts: Vec<Value> = std::mem::take(&mut state.pending_artifacts)
            .into_iter()
            .map(|(path, source)| json!({"path": path, "source": source}))
            .collect();
        Ok(json!({
            "stdout": stdout, "stderr": "", "result": result, "error": null,
            "artifacts": artifacts, "cwd": state.cwd,
        }))
    }
}

#[async_trait]
impl Interpreter for ScriptedInterpreter {
    async fn ensure_started(&mut self) -> Result<bool, WorkerFault> {
        let mut state = self.state();
        if state.running {
            return Ok(false);
        }
        state.running = true;
        state.starts += 1;
        state.namespace.clear();
        state.hooked.clear();
        state.compiled.clear();
        state.cache_hits = 0;
        state.cache_misses = 0;
        Ok(true)
    }

    fn is_running(&self) -> bool {
        self.state().running
    }

    async fn call(&mut self, request: &WorkerRequest, timeout: Duration) -> Result<Value, WorkerFault> {
        {
            let mut state = self.state();
            state.ops.push(request.op().to_string());
            if !state.running {
                return Err(WorkerFault::Exited("worker is not running".into()));
            }
        }
        match request {
            WorkerRequest::Exec { code } => self.exec(code, timeout),
            WorkerRequest::Probe { library } => {
                Ok(json!({"available": self.state().libraries.contains(library)}))
            }
            WorkerRequest::Hook { producer, code } => {
                let mut state = self.state();
                state.hook_calls.push((producer.clone(), code.clone()));
                if code.contains("unhook(") {
                    state.hooked.remove(producer);
                } else {
                    state.hooked.insert(producer.clone());
                }
                Ok(json!({"hooked": state.hooked}))
            }
            WorkerRequest::Chdir { path } => {
                let mut state = self.state();
                state.cwd = Some(path.clone());
                Ok(json!({"cwd": path}))
            }
            WorkerRequest::Snapshot => {
                let values: BTreeMap<String, NamespaceValue> = self
                    .state()
                    .namespace
                    .iter()
                    .map(|(k, v)| (k.clone(), NamespaceValue::Json { value: v.clone() }))
                    .collect();
                Ok(json!({"values": values, "skipped": []}))
            }
            WorkerRequest::Restore { values } => {
                let mut state = self.state();
                let mut restored = Vec::new();
                let mut failed = Vec::new();
                for (name, value) in values {
                    match value {
                        NamespaceValue::Json { value } => {
                            state.namespace.insert(name.clone(), value.clone());
                            restored.push(name.clone());
                        }
                        NamespaceValue::Pickle { .. } => failed.push(name.clone()),
                    }
                }
                Ok(json!({"restored": restored, "failed": failed}))
            }
            WorkerRequest::Names => {
                let names: Vec<Value> = self
                    .state()
                    .namespace
                    .keys()
                    .map(|k| json!({"name": k, "type": "scripted"}))
                    .collect();
                Ok(json!({"names": names}))
            }
            WorkerRequest::Cache { clear, important_only } => {
                let mut state = self.state();
                let before = state.compiled.len();
                if *clear {
                    if *important_only {
                        state.compiled.retain(|code| {
                            ["import", "def", "class"].iter().any(|word| code.contains(word))
                        });
                    } else {
                        state.compiled.clear();
                    }
                    state.cache_hits = 0;
                    state.cache_misses = 0;
                }
                Ok(json!({
                    "entries": state.compiled.len(),
                    "hits": state.cache_hits,
                    "misses": state.cache_misses,
                    "removed": before - state.compiled.len(),
                }))
            }
            WorkerRequest::Shutdown => {
                self.state().running = false;
                Ok(json!({}))
            }
        }
    }

    async fn shutdown(&mut self) {
        let mut state = self.state();
        state.ops.push("shutdown".into());
        state.running = false;
    }

    fn details(&self) -> InterpreterDetails {
        InterpreterDetails {
            python: Some(PathBuf::from("scripted")),
            version: Some("0".into()),
            ..Default::default()
        }
    }
}
