//! Artifacts: files produced as a side effect of executed code.
//!
//! Classification is a pure function of the file name and its first bytes,
//! independent of which hook (if any) produced the file.

pub mod store;

use std::io::Read;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use store::{ArtifactReport, ArtifactStore, CleanupReport};

/// Number of leading bytes read for content sniffing.
const SNIFF_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactCategory {
    Image,
    Video,
    Data,
    Code,
    Other,
}

impl ArtifactCategory {
    pub const ALL: [ArtifactCategory; 5] = [
        Self::Image,
        Self::Video,
        Self::Data,
        Self::Code,
        Self::Other,
    ];

    /// Subdirectory of the session's artifact root for this category.
    pub fn dir_name(self) -> &'static str {
        match self {
            Self::Image => "images",
            Self::Video => "videos",
            Self::Data => "data",
            Self::Code => "code",
            Self::Other => "other",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Video => "video",
            Self::Data => "data",
            Self::Code => "code",
            Self::Other => "other",
        }
    }

    /// Parses a category name; plural directory names are accepted too.
    pub fn parse(name: &str) -> Option<Self> {
        let name = name.trim().to_lowercase();
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == name || c.dir_name() == name)
    }
}

impl std::fmt::Display for ArtifactCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tracked file. Never mutated after creation; removed only by cleanup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub id: String,
    pub session_id: String,
    pub category: ArtifactCategory,
    /// Absolute path, always under the owning session's artifact root
    pub path: PathBuf,
    pub name: String,
    pub mime_type: String,
    pub size: u64,
    pub created_at: DateTime<Utc>,
    /// Producer that created the file (e.g. "matplotlib"), if known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl Artifact {
    pub fn human_size(&self) -> String {
        format_size(self.size)
    }

    pub fn to_ref(&self) -> ArtifactRef {
        ArtifactRef {
            id: self.id.clone(),
            name: self.name.clone(),
            category: self.category,
            path: self.path.clone(),
        }
    }
}

/// Lightweight reference stored in execution records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub id: String,
    pub name: String,
    pub category: ArtifactCategory,
    pub path: PathBuf,
}

/// Classifies a file from its extension, falling back to magic bytes.
pub fn classify(path: &Path, head: &[u8]) -> ArtifactCategory {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "png" | "jpg" | "jpeg" | "gif" | "bmp" | "svg" | "webp" | "tif" | "tiff" | "ico" => {
            ArtifactCategory::Image
        }
        "mp4" | "avi" | "mov" | "mkv" | "webm" | "m4v" | "mpeg" | "mpg" => ArtifactCategory::Video,
        "csv" | "tsv" | "json" | "jsonl" | "ndjson" | "xml" | "xlsx" | "xls" | "parquet"
        | "feather" | "h5" | "hdf5" | "npy" | "npz" | "pkl" | "pickle" => ArtifactCategory::Data,
        "py" | "ipynb" | "js" | "ts" | "rs" | "c" | "h" | "cpp" | "hpp" | "java" | "go" | "rb"
        | "sh" | "sql" | "r" => ArtifactCategory::Code,
        _ => sniff(head),
    }
}

/// Classifies a file on disk (reads the first few bytes).
pub fn classify_file(path: &Path) -> ArtifactCategory {
    let mut head = [0u8; SNIFF_LEN];
    let read = std::fs::File::open(path)
        .and_then(|mut f| f.read(&mut head))
        .unwrap_or(0);
    classify(path, &head[..read])
}

fn sniff(head: &[u8]) -> ArtifactCategory {
    if head.starts_with(b"\x89PNG\r\n\x1a\n")
        || head.starts_with(b"\xff\xd8\xff")
        || head.starts_with(b"GIF87a")
        || head.starts_with(b"GIF89a")
        || (head.len() >= 12 && &head[..4] == b"RIFF" && &head[8..12] == b"WEBP")
    {
        return ArtifactCategory::Image;
    }
    if (head.len() >= 8 && &head[4..8] == b"ftyp")
        || head.starts_with(b"\x1a\x45\xdf\xa3")
        || (head.len() >= 12 && &head[..4] == b"RIFF" && &head[8..12] == b"AVI ")
    {
        return ArtifactCategory::Video;
    }
    ArtifactCategory::Other
}

/// Guesses MIME type from a filename extension.
pub fn mime_from_extension(filename: &str) -> String {
    let ext = filename
        .rsplit_once('.')
        .map(|(_, e)| e.to_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "svg" => "image/svg+xml",
        "mp4" | "m4v" => "video/mp4",
        "webm" => "video/webm",
        "mov" => "video/quicktime",
        "csv" => "text/csv",
        "json" => "application/json",
        "py" => "text/x-python",
        "pdf" => "application/pdf",
        "txt" | "log" => "text/plain",
        "html" | "htm" => "text/html",
        _ => "application/octet-stream",
    }
    .to_string()
}

const SIZE_UNITS: [&str; 4] = ["KiB", "MiB", "GiB", "TiB"];

/// Byte count in binary units, e.g. `812 B`, `1.5 KiB`, `5.5 MiB`.
pub fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit + 1 < SIZE_UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.1} {}", SIZE_UNITS[unit])
}
