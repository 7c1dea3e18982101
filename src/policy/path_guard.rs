//! Path Guard: keeps every path the sandbox touches under one allowed root.
//!
//! Candidates are joined to the current directory when relative, `~` is
//! expanded, `.`/`..` are folded lexically, and the longest existing prefix
//! is canonicalized so symlinks pointing out of the root are caught. The
//! returned path is the one callers must use for the actual operation.

use std::ffi::OsString;
use std::io;
use std::path::{Component, Path, PathBuf};

use tracing::warn;

use crate::error::SandboxError;

#[derive(Debug, Clone)]
pub struct PathGuard {
    root: PathBuf,
    actor: String,
    deny_hidden: bool,
    /// Trees where hidden components are accepted even when denied elsewhere
    hidden_exempt: Vec<PathBuf>,
}

impl PathGuard {
    /// Creates a guard rooted at `root`, which must exist.
    pub fn new(root: impl AsRef<Path>) -> io::Result<Self> {
        let root = root.as_ref().canonicalize()?;
        Ok(Self {
            root,
            actor: "sandbox".to_string(),
            deny_hidden: false,
            hidden_exempt: Vec::new(),
        })
    }

    /// Label used in audit logs for rejected attempts (usually the session id).
    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = actor.into();
        self
    }

    /// Rejects paths with a hidden component below the root (high security).
    pub fn deny_hidden(mut self, deny: bool) -> Self {
        self.deny_hidden = deny;
        self
    }

    /// Accepts hidden components at and below `dir` (the sandbox's own
    /// state directory, which may itself be hidden).
    pub fn allow_hidden_under(mut self, dir: impl AsRef<Path>) -> Self {
        self.hidden_exempt
            .push(resolve_physical(&normalize_lexically(dir.as_ref())));
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolves a user-supplied path string (supports `~`).
    pub fn resolve_str(&self, candidate: &str, current_dir: &Path) -> Result<PathBuf, SandboxError> {
        let expanded = shellexpand::tilde(candidate.trim());
        self.resolve(Path::new(expanded.as_ref()), current_dir)
    }

    /// Resolves `candidate` against `current_dir` and checks it stays under the root.
    pub fn resolve(&self, candidate: &Path, current_dir: &Path) -> Result<PathBuf, SandboxError> {
        let joined = if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            current_dir.join(candidate)
        };
        let resolved = resolve_physical(&normalize_lexically(&joined));

        if !resolved.starts_with(&self.root) {
            return Err(self.reject(candidate, "resolves outside the allowed root"));
        }
        if self.deny_hidden
            && has_hidden_component(&resolved, &self.root)
            && !self.hidden_exempt.iter().any(|dir| resolved.starts_with(dir))
        {
            return Err(self.reject(candidate, "hidden paths are not allowed at this security level"));
        }
        Ok(resolved)
    }

    /// True if an already-resolved absolute path lies under the root.
    pub fn contains(&self, path: &Path) -> bool {
        resolve_physical(&normalize_lexically(path)).starts_with(&self.root)
    }

    fn reject(&self, candidate: &Path, reason: &str) -> SandboxError {
        warn!(
            "[{}] Path rejected: {} {} ({})",
            self.actor,
            candidate.display(),
            reason,
            self.root.display()
        );
        SandboxError::PathViolation {
            path: candidate.display().to_string(),
            allowed_root: self.root.display().to_string(),
        }
    }
}

/// Folds `.` and `..` without touching the filesystem.
/// `..` at the filesystem root stays at the root.
fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(p) => out.push(p.as_os_str()),
            Component::RootDir => out.push(Component::RootDir.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(c) => out.push(c),
        }
    }
    out
}

/// Canonicalizes the longest existing prefix and re-appends the rest.
fn resolve_physical(path: &Path) -> PathBuf {
    let mut existing = path.to_path_buf();
    let mut tail: Vec<OsString> = Vec::new();
    loop {
        if let Ok(real) = existing.canonicalize() {
            let mut out = real;
            for part in tail.iter().rev() {
                out.push(part);
            }
            return out;
        }
        match (existing.file_name().map(|n| n.to_os_string()), existing.parent()) {
            (Some(name), Some(parent)) => {
                tail.push(name);
                existing = parent.to_path_buf();
            }
            _ => return path.to_path_buf(),
        }
    }
}

fn has_hidden_component(path: &Path, root: &Path) -> bool {
    path.strip_prefix(root)
        .map(|rel| {
            rel.components().any(|c| match c {
                Component::Normal(name) => name.to_string_lossy().starts_with('.'),
                _ => false,
            })
        })
        .unwrap_or(false)
}
