//! Artifact Store: on-disk layout and index of generated files.
//!
//! Layout per session (the artifact root):
//!   {root}/images/  {root}/videos/  {root}/data/  {root}/code/  {root}/other/
//!   {root}/.index.jsonl   header line, then one artifact per line
//!
//! The store is shared by every session of the process; each artifact is
//! owned by exactly one session and lives under that session's root.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{classify_file, mime_from_extension, Artifact, ArtifactCategory};
use crate::error::SandboxError;
use crate::policy::PathGuard;

const INDEX_FILE: &str = ".index.jsonl";

/// One line of `.index.jsonl`.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
enum IndexEntry {
    #[serde(rename = "index")]
    Header {
        version: u32,
        created: String,
        session_id: String,
    },
    #[serde(rename = "artifact")]
    Artifact(Artifact),
}

/// Per-category totals for one session.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CategoryTotals {
    pub count: usize,
    pub bytes: u64,
}

/// What a cleanup did. Files that could not be deleted stay indexed.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CleanupReport {
    pub removed: usize,
    pub failed: Vec<PathBuf>,
}

/// Summary of one session's artifacts.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArtifactReport {
    pub session_id: String,
    pub artifact_root: PathBuf,
    pub total_count: usize,
    pub total_bytes: u64,
    pub by_category: BTreeMap<String, CategoryTotals>,
}

struct SessionArtifacts {
    guard: PathGuard,
    /// (global sequence, artifact), kept in creation order
    entries: Vec<(u64, Artifact)>,
}

impl SessionArtifacts {
    fn root(&self) -> &Path {
        self.guard.root()
    }

    fn index_path(&self) -> PathBuf {
        self.root().join(INDEX_FILE)
    }
}

#[derive(Default)]
struct StoreInner {
    sessions: HashMap<String, SessionArtifacts>,
    next_seq: u64,
}

impl StoreInner {
    fn seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }
}

#[derive(Default)]
pub struct ArtifactStore {
    inner: Mutex<StoreInner>,
}

impl ArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        // The index is always left consistent between statements
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Attaches a session to its artifact root: creates the category
    /// directories and loads any existing index. Idempotent.
    pub fn open_session(&self, session_id: &str, root: &Path) -> Result<PathBuf, SandboxError> {
        let mut inner = self.lock();
        if let Some(existing) = inner.sessions.get(session_id) {
            return Ok(existing.root().to_path_buf());
        }

        for category in ArtifactCategory::ALL {
            fs::create_dir_all(root.join(category.dir_name()))?;
        }
        let guard = PathGuard::new(root)?.with_actor(session_id);
        let loaded = load_index(&guard.root().join(INDEX_FILE));
        let mut entries = Vec::with_capacity(loaded.len());
        for artifact in loaded {
            // Drop entries whose file vanished or that point outside the root
            if artifact.path.is_file() && guard.contains(&artifact.path) {
                let seq = inner.seq();
                entries.push((seq, artifact));
            }
        }
        let canonical_root = guard.root().to_path_buf();
        if !entries.is_empty() {
            info!(
                "[{session_id}] Loaded {} artifact(s) from {}",
                entries.len(),
                canonical_root.display()
            );
        }
        inner
            .sessions
            .insert(session_id.to_string(), SessionArtifacts { guard, entries });
        Ok(canonical_root)
    }

    pub fn artifact_root(&self, session_id: &str) -> Option<PathBuf> {
        self.lock()
            .sessions
            .get(session_id)
            .map(|s| s.root().to_path_buf())
    }

    /// Tracks a file under the session's artifact root.
    ///
    /// Relative paths are taken relative to the artifact root. Registering
    /// a path that is already indexed returns the existing artifact.
    pub fn register(
        &self,
        session_id: &str,
        path: &Path,
        category: Option<ArtifactCategory>,
        source: Option<&str>,
    ) -> Result<Artifact, SandboxError> {
        let mut inner = self.lock();
        let seq = inner.next_seq + 1;
        let session = inner.sessions.get_mut(session_id).ok_or_else(|| {
            SandboxError::artifact(
                path.display().to_string(),
                format!("session '{session_id}' has no artifact root"),
            )
        })?;

        let resolved = match session.guard.resolve(path, session.guard.root()) {
            Ok(p) => p,
            Err(_) => {
                return Err(SandboxError::artifact(
                    path.display().to_string(),
                    format!("outside artifact root {}", session.root().display()),
                ))
            }
        };
        if let Some((_, existing)) = session.entries.iter().find(|(_, a)| a.path == resolved) {
            return Ok(existing.clone());
        }
        let metadata = fs::metadata(&resolved)
            .ok()
            .filter(|m| m.is_file())
            .ok_or_else(|| SandboxError::artifact(resolved.display().to_string(), "file does not exist"))?;

        let name = resolved
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let artifact = Artifact {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            category: category.unwrap_or_else(|| classify_file(&resolved)),
            mime_type: mime_from_extension(&name),
            path: resolved,
            name,
            size: metadata.len(),
            created_at: Utc::now(),
            source: source.map(str::to_string),
        };

        append_index(&session.index_path(), session_id, &artifact)?;
        session.entries.push((seq, artifact.clone()));
        inner.next_seq = seq;
        debug!(
            "[{session_id}] Artifact registered: {} ({}, {})",
            artifact.name,
            artifact.category,
            artifact.human_size()
        );
        Ok(artifact)
    }

    /// Artifacts in creation order, optionally filtered.
    pub fn list(
        &self,
        session_id: Option<&str>,
        category: Option<ArtifactCategory>,
    ) -> Vec<Artifact> {
        let inner = self.lock();
        let mut found: Vec<(u64, Artifact)> = inner
            .sessions
            .iter()
            .filter(|(id, _)| session_id.map_or(true, |s| s == id.as_str()))
            .flat_map(|(_, s)| s.entries.iter())
            .filter(|(_, a)| category.map_or(true, |c| a.category == c))
            .cloned()
            .collect();
        found.sort_by_key(|(seq, _)| *seq);
        found.into_iter().map(|(_, a)| a).collect()
    }

    /// Deletes matching artifacts and drops them from the index.
    ///
    /// Files that are already gone count as cleaned. A file that cannot be
    /// deleted keeps its index entry and is listed in `failed`. An unknown
    /// session cleans nothing.
    pub fn cleanup(
        &self,
        session_id: &str,
        category: Option<ArtifactCategory>,
    ) -> Result<CleanupReport, SandboxError> {
        let mut inner = self.lock();
        let Some(session) = inner.sessions.get_mut(session_id) else {
            return Ok(CleanupReport::default());
        };

        let mut report = CleanupReport::default();
        let mut kept = Vec::with_capacity(session.entries.len());
        for (seq, artifact) in std::mem::take(&mut session.entries) {
            if !category.map_or(true, |c| artifact.category == c) {
                kept.push((seq, artifact));
                continue;
            }
            match fs::remove_file(&artifact.path) {
                Ok(()) => report.removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => report.removed += 1,
                Err(e) => {
                    warn!(
                        "[{session_id}] Failed to delete artifact {}: {e}",
                        artifact.path.display()
                    );
                    report.failed.push(artifact.path.clone());
                    kept.push((seq, artifact));
                }
            }
        }
        session.entries = kept;

        let remaining: Vec<&Artifact> = session.entries.iter().map(|(_, a)| a).collect();
        rewrite_index(&session.index_path(), session_id, &remaining)?;
        if report.removed > 0 {
            info!(
                "[{session_id}] Cleaned up {} artifact(s){}",
                report.removed,
                category.map(|c| format!(" of type {c}")).unwrap_or_default()
            );
        }
        Ok(report)
    }

    /// Registers files that appeared under the artifact root without going
    /// through a capture hook. Hidden files are ignored.
    pub fn scan_new(&self, session_id: &str) -> Vec<Artifact> {
        let Some(root) = self.artifact_root(session_id) else {
            return Vec::new();
        };
        let mut files = Vec::new();
        collect_files(&root, &mut files);
        files.sort();

        let known: Vec<PathBuf> = self
            .list(Some(session_id), None)
            .into_iter()
            .map(|a| a.path)
            .collect();
        files
            .into_iter()
            .filter(|f| !known.contains(f))
            .filter_map(|f| match self.register(session_id, &f, None, Some("scan")) {
                Ok(a) => Some(a),
                Err(e) => {
                    debug!("[{session_id}] Skipping scanned file: {e}");
                    None
                }
            })
            .collect()
    }

    pub fn report(&self, session_id: &str) -> ArtifactReport {
        let artifact_root = self.artifact_root(session_id).unwrap_or_default();
        let mut by_category: BTreeMap<String, CategoryTotals> = BTreeMap::new();
        let mut total_bytes = 0;
        let artifacts = self.list(Some(session_id), None);
        for artifact in &artifacts {
            let totals = by_category
                .entry(artifact.category.to_string())
                .or_default();
            totals.count += 1;
            totals.bytes += artifact.size;
            total_bytes += artifact.size;
        }
        ArtifactReport {
            session_id: session_id.to_string(),
            artifact_root,
            total_count: artifacts.len(),
            total_bytes,
            by_category,
        }
    }

    /// Detaches a session from the store, leaving its files in place.
    pub fn forget_session(&self, session_id: &str) -> Option<PathBuf> {
        self.lock()
            .sessions
            .remove(session_id)
            .map(|s| s.root().to_path_buf())
    }

    /// Detaches a session and deletes its whole artifact root.
    pub fn purge_session(&self, session_id: &str) -> Result<usize, SandboxError> {
        let Some(session) = self.lock().sessions.remove(session_id) else {
            return Ok(0);
        };
        let count = session.entries.len();
        match fs::remove_dir_all(session.root()) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        info!("[{session_id}] Purged {count} artifact(s)");
        Ok(count)
    }
}

// ── Index file ──────────────────────────────────────────

fn header(session_id: &str) -> IndexEntry {
    IndexEntry::Header {
        version: 1,
        created: Utc::now().to_rfc3339(),
        session_id: session_id.to_string(),
    }
}

fn append_index(path: &Path, session_id: &str, artifact: &Artifact) -> Result<(), SandboxError> {
    let is_new = !path.exists();
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    if is_new {
        writeln!(file, "{}", to_line(&header(session_id))?)?;
    }
    writeln!(file, "{}", to_line(&IndexEntry::Artifact(artifact.clone()))?)?;
    Ok(())
}

fn rewrite_index(path: &Path, session_id: &str, artifacts: &[&Artifact]) -> Result<(), SandboxError> {
    let mut out = to_line(&header(session_id))?;
    out.push('\n');
    for artifact in artifacts {
        out.push_str(&to_line(&IndexEntry::Artifact((*artifact).clone()))?);
        out.push('\n');
    }
    fs::write(path, out)?;
    Ok(())
}

fn to_line(entry: &IndexEntry) -> Result<String, SandboxError> {
    serde_json::to_string(entry).map_err(|e| SandboxError::internal(e.to_string()))
}

/// Reads the artifact lines of an index. Malformed lines are skipped.
fn load_index(path: &Path) -> Vec<Artifact> {
    let Ok(content) = fs::read_to_string(path) else {
        return Vec::new();
    };
    content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .filter_map(|l| serde_json::from_str::<IndexEntry>(l).ok())
        .filter_map(|entry| match entry {
            IndexEntry::Artifact(a) => Some(a),
            IndexEntry::Header { .. } => None,
        })
        .collect()
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        if entry.file_name().to_string_lossy().starts_with('.') {
            continue;
        }
        let path = entry.path();
        match entry.file_type() {
            Ok(t) if t.is_dir() => collect_files(&path, out),
            Ok(t) if t.is_file() => out.push(path),
            _ => {}
        }
    }
}
