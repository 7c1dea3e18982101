//! Interpreter environment detection and subprocess environments.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::SecurityLevel;
use crate::error::SandboxError;

/// Variables kept when the environment is scrubbed (high security level).
const SCRUBBED_KEEP: &[&str] = &["PATH", "HOME", "LANG", "TMPDIR", "VIRTUAL_ENV"];

/// Interpreter located for a session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InterpreterEnvironment {
    pub python: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub virtual_env: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub site_packages: Option<PathBuf>,
}

impl InterpreterEnvironment {
    /// Locates an interpreter: explicit setting, then an active virtualenv,
    /// then a `.venv` under one of `project_roots`, then `python3` on PATH.
    pub fn detect(explicit: Option<&Path>, project_roots: &[PathBuf]) -> Result<Self, SandboxError> {
        Self::detect_with(
            explicit,
            std::env::var_os("VIRTUAL_ENV").map(PathBuf::from),
            project_roots,
            std::env::var_os("PATH"),
        )
    }

    fn detect_with(
        explicit: Option<&Path>,
        active_venv: Option<PathBuf>,
        project_roots: &[PathBuf],
        path_var: Option<OsString>,
    ) -> Result<Self, SandboxError> {
        if let Some(python) = explicit {
            let resolved = if python.components().count() == 1 {
                find_on_path(&python.to_string_lossy(), path_var.as_ref())
            } else {
                Some(python.to_path_buf()).filter(|p| p.is_file())
            };
            return resolved.map(Self::from_python).ok_or_else(|| {
                SandboxError::internal(format!(
                    "configured Python interpreter not found: {}",
                    python.display()
                ))
            });
        }

        let venv_candidates = active_venv
            .into_iter()
            .chain(project_roots.iter().map(|r| r.join(".venv")));
        for venv in venv_candidates {
            let python = venv_python(&venv);
            if python.is_file() {
                debug!("Using virtualenv interpreter {}", python.display());
                return Ok(Self::from_python(python));
            }
        }

        ["python3", "python"]
            .iter()
            .find_map(|name| find_on_path(name, path_var.as_ref()))
            .map(Self::from_python)
            .ok_or_else(|| SandboxError::internal("no Python interpreter found on PATH"))
    }

    fn from_python(python: PathBuf) -> Self {
        let virtual_env = python
            .parent()
            .and_then(Path::parent)
            .filter(|dir| dir.join("pyvenv.cfg").is_file())
            .map(Path::to_path_buf);
        let site_packages = virtual_env.as_deref().and_then(find_site_packages);
        let env = Self {
            python,
            virtual_env,
            site_packages,
        };
        info!(
            "Python interpreter: {}{}",
            env.python.display(),
            env.virtual_env
                .as_ref()
                .map(|v| format!(" (virtualenv {})", v.display()))
                .unwrap_or_default()
        );
        env
    }

    /// PATH with the virtualenv's bin directory first.
    fn path_value(&self) -> Option<OsString> {
        let current = std::env::var_os("PATH");
        let Some(venv) = &self.virtual_env else {
            return current;
        };
        let bin = venv_bin(venv);
        let mut parts: Vec<PathBuf> = vec![bin.clone()];
        if let Some(current) = &current {
            parts.extend(std::env::split_paths(current).filter(|p| *p != bin));
        }
        std::env::join_paths(parts).ok().or(current)
    }

    /// Environment for shell commands.
    pub fn shell_env(&self, level: SecurityLevel, tmp_dir: &Path) -> ProcessEnv {
        let mut env = ProcessEnv::new(level == SecurityLevel::High);
        if let Some(path) = self.path_value() {
            env.set("PATH", path);
        }
        if let Some(venv) = &self.virtual_env {
            env.set("VIRTUAL_ENV", venv.as_os_str());
        }
        env.set("TMPDIR", tmp_dir.as_os_str());
        if env.clear {
            for key in SCRUBBED_KEEP {
                if env.get(key).is_none() {
                    if let Some(value) = std::env::var_os(key) {
                        env.set(key, value);
                    }
                }
            }
            if env.get("LANG").is_none() {
                env.set("LANG", "C.UTF-8");
            }
        }
        env
    }

    /// Environment for the interpreter worker of one session.
    pub fn worker_env(&self, level: SecurityLevel, worker: &WorkerPaths, memory_limit_mb: u64) -> ProcessEnv {
        let mut env = self.shell_env(level, &worker.tmp_dir);
        env.set("PYTHONDONTWRITEBYTECODE", "1");
        env.set("PYTHONUNBUFFERED", "1");
        env.set("PYTHONIOENCODING", "utf-8");
        env.set("MPLBACKEND", "Agg");
        env.set("MPLCONFIGDIR", worker.tmp_dir.join("matplotlib").as_os_str());
        if let Ok(roots) = std::env::join_paths(&worker.write_roots) {
            env.set("SANDBOX_WRITE_ROOTS", roots);
        }
        env.set("SANDBOX_ARTIFACT_ROOT", worker.artifact_root.as_os_str());
        env.set("SANDBOX_MEMORY_LIMIT_MB", memory_limit_mb.to_string());
        env
    }
}

/// Directories handed to a worker process.
#[derive(Debug, Clone)]
pub struct WorkerPaths {
    pub tmp_dir: PathBuf,
    pub artifact_root: PathBuf,
    /// Roots outside of which the worker refuses to write
    pub write_roots: Vec<PathBuf>,
}

/// Environment applied to a spawned subprocess.
#[derive(Debug, Clone, Default)]
pub struct ProcessEnv {
    pub clear: bool,
    pub vars: Vec<(String, OsString)>,
}

impl ProcessEnv {
    pub fn new(clear: bool) -> Self {
        Self {
            clear,
            vars: Vec::new(),
        }
    }

    pub fn set(&mut self, key: &str, value: impl Into<OsString>) {
        let value = value.into();
        match self.vars.iter_mut().find(|(k, _)| k == key) {
            Some(slot) => slot.1 = value,
            None => self.vars.push((key.to_string(), value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&OsString> {
        self.vars.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn apply(&self, command: &mut Command) {
        if self.clear {
            command.env_clear();
        }
        command.envs(self.vars.iter().map(|(k, v)| (k, v)));
    }
}

fn venv_bin(venv: &Path) -> PathBuf {
    if cfg!(windows) {
        venv.join("Scripts")
    } else {
        venv.join("bin")
    }
}

fn venv_python(venv: &Path) -> PathBuf {
    if cfg!(windows) {
        venv_bin(venv).join("python.exe")
    } else {
        venv_bin(venv).join("python")
    }
}

/// `lib/python3.X/site-packages` of a virtualenv, newest version first.
fn find_site_packages(venv: &Path) -> Option<PathBuf> {
    let mut candidates: Vec<PathBuf> = std::fs::read_dir(venv.join("lib"))
        .ok()?
        .flatten()
        .filter(|e| e.file_name().to_string_lossy().starts_with("python3"))
        .map(|e| e.path().join("site-packages"))
        .filter(|p| p.is_dir())
        .collect();
    candidates.sort_by_key(|p| {
        // python3.12 → 12
        p.parent()
            .and_then(|d| d.file_name())
            .and_then(|n| n.to_string_lossy().rsplit('.').next().map(str::to_string))
            .and_then(|minor| minor.parse::<u32>().ok())
            .unwrap_or(0)
    });
    candidates.pop()
}

fn find_on_path(name: &str, path_var: Option<&OsString>) -> Option<PathBuf> {
    std::env::split_paths(path_var?)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_venv(dir: &Path) -> PathBuf {
        let venv = dir.join(".venv");
        std::fs::create_dir_all(venv.join("bin")).unwrap();
        std::fs::create_dir_all(venv.join("lib/python3.9/site-packages")).unwrap();
        std::fs::create_dir_all(venv.join("lib/python3.11/site-packages")).unwrap();
        std::fs::write(venv.join("bin/python"), "").unwrap();
        std::fs::write(venv.join("pyvenv.cfg"), "home = /usr/bin\n").unwrap();
        venv
    }

    #[cfg(unix)]
    #[test]
    fn test_project_venv_is_preferred_over_path() {
        let dir = tempfile::tempdir().unwrap();
        let venv = fake_venv(dir.path());
        let bin_dir = dir.path().join("usr-bin");
        std::fs::create_dir(&bin_dir).unwrap();
        std::fs::write(bin_dir.join("python3"), "").unwrap();

        let env = InterpreterEnvironment::detect_with(
            None,
            None,
            &[dir.path().to_path_buf()],
            Some(bin_dir.clone().into_os_string()),
        )
        .unwrap();
        assert_eq!(env.python, venv.join("bin/python"));
        assert_eq!(env.virtual_env.as_deref(), Some(venv.as_path()));
        assert_eq!(
            env.site_packages,
            Some(venv.join("lib/python3.11/site-packages"))
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_active_virtualenv_wins() {
        let dir = tempfile::tempdir().unwrap();
        let active = fake_venv(&dir.path().join("active"));
        let _project = fake_venv(&dir.path().join("project"));
        let env = InterpreterEnvironment::detect_with(
            None,
            Some(active.clone()),
            &[dir.path().join("project")],
            None,
        )
        .unwrap();
        assert_eq!(env.virtual_env, Some(active));
    }

    #[test]
    fn test_falls_back_to_path_lookup() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("python3"), "").unwrap();
        let env = InterpreterEnvironment::detect_with(
            None,
            None,
            &[],
            Some(dir.path().as_os_str().to_os_string()),
        )
        .unwrap();
        assert_eq!(env.python, dir.path().join("python3"));
        assert!(env.virtual_env.is_none());
    }

    #[test]
    fn test_explicit_missing_interpreter_is_an_error() {
        let result = InterpreterEnvironment::detect_with(
            Some(Path::new("/nonexistent/bin/python9")),
            None,
            &[],
            None,
        );
        assert!(matches!(result, Err(SandboxError::Internal { .. })));
        let none = InterpreterEnvironment::detect_with(None, None, &[], None);
        assert!(none.is_err());
    }

    #[test]
    fn test_shell_env_scrubbed_at_high() {
        let env = InterpreterEnvironment {
            python: PathBuf::from("/usr/bin/python3"),
            virtual_env: None,
            site_packages: None,
        };
        let tmp = Path::new("/sandbox/tmp");
        let standard = env.shell_env(SecurityLevel::Standard, tmp);
        assert!(!standard.clear);
        assert_eq!(standard.get("TMPDIR"), Some(&OsString::from("/sandbox/tmp")));

        let high = env.shell_env(SecurityLevel::High, tmp);
        assert!(high.clear);
        assert_eq!(high.get("TMPDIR"), Some(&OsString::from("/sandbox/tmp")));
        assert!(high.get("LANG").is_some());
        for (key, _) in &high.vars {
            assert!(SCRUBBED_KEEP.contains(&key.as_str()), "{key} leaked");
        }
    }

    #[test]
    fn test_worker_env_carries_sandbox_settings() {
        let env = InterpreterEnvironment {
            python: PathBuf::from("/usr/bin/python3"),
            virtual_env: None,
            site_packages: None,
        };
        let paths = WorkerPaths {
            tmp_dir: PathBuf::from("/s/tmp"),
            artifact_root: PathBuf::from("/s/artifacts"),
            write_roots: vec![PathBuf::from("/home/u"), PathBuf::from("/s")],
        };
        let vars = env.worker_env(SecurityLevel::Standard, &paths, 256);
        assert_eq!(vars.get("SANDBOX_MEMORY_LIMIT_MB"), Some(&OsString::from("256")));
        assert_eq!(vars.get("SANDBOX_ARTIFACT_ROOT"), Some(&OsString::from("/s/artifacts")));
        assert_eq!(vars.get("MPLBACKEND"), Some(&OsString::from("Agg")));
        let roots = vars.get("SANDBOX_WRITE_ROOTS").unwrap();
        let split: Vec<PathBuf> = std::env::split_paths(roots).collect();
        assert_eq!(split, paths.write_roots);
    }

    #[test]
    fn test_process_env_set_overwrites() {
        let mut env = ProcessEnv::new(false);
        env.set("A", "1");
        env.set("A", "2");
        assert_eq!(env.vars.len(), 1);
        assert_eq!(env.get("A"), Some(&OsString::from("2")));
    }
}
