//! Durable layout of one session.
//!
//!   {data_dir}/{session_id}/session.json     metadata
//!   {data_dir}/{session_id}/namespace.json   last namespace snapshot
//!   {data_dir}/{session_id}/history.jsonl    header line, then one record per line
//!   {data_dir}/{session_id}/tmp/             scratch space (TMPDIR of the worker)
//!   {data_dir}/{session_id}/artifacts/       unless `storage.artifact_dir` is set

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::runtime::worker::NamespaceSnapshot;
use crate::runtime::ExecutionRecord;

const META_FILE: &str = "session.json";
const NAMESPACE_FILE: &str = "namespace.json";
const HISTORY_FILE: &str = "history.jsonl";
const TMP_DIR: &str = "tmp";

/// `session.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMeta {
    pub version: u32,
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub cwd: PathBuf,
    pub execution_count: usize,
}

/// Everything persisted for a session, as read back from disk.
#[derive(Debug, Clone, Default)]
pub struct SavedState {
    pub meta: Option<SessionMeta>,
    pub snapshot: Option<NamespaceSnapshot>,
    pub history: Vec<ExecutionRecord>,
}

/// One line of `history.jsonl`.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
enum HistoryEntry {
    #[serde(rename = "session")]
    Header {
        version: u32,
        created: String,
        session_id: String,
    },
    #[serde(rename = "execution")]
    Record(Box<ExecutionRecord>),
}

#[derive(Debug, Clone)]
pub struct SessionFiles {
    session_id: String,
    dir: PathBuf,
}

impl SessionFiles {
    /// Opens (creating if needed) the directory of a session.
    pub fn open(data_dir: &Path, session_id: &str) -> io::Result<Self> {
        let files = Self::locate(data_dir, session_id);
        fs::create_dir_all(files.tmp_dir())?;
        Ok(files)
    }

    /// Paths of a session without touching the filesystem.
    pub fn locate(data_dir: &Path, session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            dir: data_dir.join(session_id),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.dir.join(TMP_DIR)
    }

    pub fn meta_path(&self) -> PathBuf {
        self.dir.join(META_FILE)
    }

    pub fn namespace_path(&self) -> PathBuf {
        self.dir.join(NAMESPACE_FILE)
    }

    pub fn history_path(&self) -> PathBuf {
        self.dir.join(HISTORY_FILE)
    }

    /// True if a snapshot or metadata was saved for this session.
    pub fn has_saved_state(&self) -> bool {
        self.meta_path().is_file() || self.namespace_path().is_file()
    }

    // ── Metadata and snapshot ───────────────────────────

    pub fn write_meta(&self, meta: &SessionMeta) -> io::Result<()> {
        write_json_atomic(&self.meta_path(), meta)
    }

    pub fn read_meta(&self) -> io::Result<Option<SessionMeta>> {
        read_json(&self.meta_path())
    }

    pub fn write_snapshot(&self, snapshot: &NamespaceSnapshot) -> io::Result<()> {
        write_json_atomic(&self.namespace_path(), snapshot)
    }

    pub fn read_snapshot(&self) -> io::Result<Option<NamespaceSnapshot>> {
        read_json(&self.namespace_path())
    }

    pub fn load_state(&self) -> io::Result<SavedState> {
        Ok(SavedState {
            meta: self.read_meta()?,
            snapshot: self.read_snapshot()?,
            history: self.read_history()?,
        })
    }

    // ── History ─────────────────────────────────────────

    /// Appends one record; the header line is written on first use.
    pub fn append_record(&self, record: &ExecutionRecord) -> io::Result<()> {
        let path = self.history_path();
        let is_new = !path.exists();
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        if is_new {
            let header = HistoryEntry::Header {
                version: 1,
                created: Utc::now().to_rfc3339(),
                session_id: self.session_id.clone(),
            };
            writeln!(file, "{}", serde_json::to_string(&header)?)?;
        }
        let entry = HistoryEntry::Record(Box::new(record.clone()));
        writeln!(file, "{}", serde_json::to_string(&entry)?)?;
        Ok(())
    }

    /// Records in execution order. Malformed lines are skipped.
    pub fn read_history(&self) -> io::Result<Vec<ExecutionRecord>> {
        let content = match fs::read_to_string(self.history_path()) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut records = Vec::new();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<HistoryEntry>(line) {
                Ok(HistoryEntry::Record(record)) => records.push(*record),
                Ok(HistoryEntry::Header { .. }) => {}
                Err(e) => debug!("[{}] Skipping malformed history line: {e}", self.session_id),
            }
        }
        Ok(records)
    }

    // ── Cleanup ─────────────────────────────────────────

    /// Empties the scratch directory, keeping the directory itself.
    pub fn clear_tmp(&self) -> io::Result<()> {
        let tmp = self.tmp_dir();
        match fs::remove_dir_all(&tmp) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        fs::create_dir_all(tmp)
    }

    pub fn remove_all(&self) -> io::Result<()> {
        match fs::remove_dir_all(&self.dir) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    /// Most recent modification time among the session's files.
    pub fn last_activity(&self) -> Option<std::time::SystemTime> {
        [
            self.dir.clone(),
            self.meta_path(),
            self.namespace_path(),
            self.history_path(),
        ]
        .iter()
        .filter_map(|p| fs::metadata(p).and_then(|m| m.modified()).ok())
        .max()
    }
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json)?;
    fs::rename(&tmp, path)
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> io::Result<Option<T>> {
    match fs::read_to_string(path) {
        Ok(content) => serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("{}: {e}", path.display()))),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}
