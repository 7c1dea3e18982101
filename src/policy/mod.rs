pub mod command_filter;
pub mod path_guard;

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::config::{Config, SecurityLevel};
use crate::error::SandboxError;

pub use command_filter::CommandFilter;
pub use path_guard::PathGuard;

/// Access policy of one execution context: the allowed root, the current
/// working directory (always inside the root) and the command deny list.
#[derive(Debug, Clone)]
pub struct AccessPolicy {
    guard: PathGuard,
    filter: CommandFilter,
    cwd: PathBuf,
    level: SecurityLevel,
}

impl AccessPolicy {
    pub fn new(guard: PathGuard, filter: CommandFilter, level: SecurityLevel) -> Self {
        let cwd = guard.root().to_path_buf();
        Self {
            guard,
            filter,
            cwd,
            level,
        }
    }

    /// Builds the policy described by `config` for one session.
    pub fn from_config(config: &Config, actor: &str) -> Result<Self, SandboxError> {
        let root = config.allowed_root();
        std::fs::create_dir_all(&root)?;
        let level = config.security.level;
        let mut guard = PathGuard::new(&root)?
            .with_actor(actor)
            .deny_hidden(level == SecurityLevel::High)
            .allow_hidden_under(config.data_dir());
        if let Some(artifact_dir) = config.artifact_dir() {
            guard = guard.allow_hidden_under(artifact_dir);
        }
        let filter = CommandFilter::for_level(level, &config.security.blocked_patterns);
        debug!(
            "[{actor}] Policy: root {}, {} level, {} deny rule(s)",
            guard.root().display(),
            level,
            filter.rule_count()
        );
        Ok(Self::new(guard, filter, level))
    }

    pub fn root(&self) -> &Path {
        self.guard.root()
    }

    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    pub fn level(&self) -> SecurityLevel {
        self.level
    }

    /// Resolves a caller-supplied path against the current directory.
    pub fn resolve(&self, candidate: &str) -> Result<PathBuf, SandboxError> {
        self.guard.resolve_str(candidate, &self.cwd)
    }

    /// Resolves an optional working directory, defaulting to the current one.
    pub fn resolve_dir(&self, candidate: Option<&str>) -> Result<PathBuf, SandboxError> {
        let dir = match candidate.map(str::trim).filter(|c| !c.is_empty()) {
            Some(c) => self.resolve(c)?,
            None => self.cwd.clone(),
        };
        if !dir.is_dir() {
            return Err(SandboxError::invalid(format!(
                "not a directory: {}",
                dir.display()
            )));
        }
        Ok(dir)
    }

    /// Moves the working directory; rejected before anything changes.
    pub fn change_dir(&mut self, candidate: &str) -> Result<PathBuf, SandboxError> {
        let dir = self.resolve_dir(Some(candidate))?;
        self.cwd = dir.clone();
        Ok(dir)
    }

    /// Adopts a directory the interpreter moved to on its own, if it is inside the root.
    pub fn adopt_cwd(&mut self, dir: &Path) -> bool {
        if self.guard.contains(dir) && dir.is_dir() {
            self.cwd = dir.to_path_buf();
            true
        } else {
            false
        }
    }

    pub fn check_command(&self, command: &str) -> Result<(), SandboxError> {
        self.filter.check(command)
    }
}
