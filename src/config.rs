use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub security: SecurityConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExecutionConfig {
    /// Upper bound for a single execute/shell call, in seconds
    #[serde(default = "default_max_execution_time")]
    pub max_execution_time: u64,
    /// Default shell timeout when the caller does not pass one
    #[serde(default = "default_shell_timeout")]
    pub shell_timeout: u64,
    /// Address-space limit for the interpreter worker (0 disables)
    #[serde(default = "default_memory_limit_mb")]
    pub memory_limit_mb: u64,
    /// Explicit interpreter path; auto-detected when unset
    #[serde(default)]
    pub python: Option<PathBuf>,
    /// Snapshot the namespace every N executions (0 disables)
    #[serde(default = "default_autosave_every")]
    pub autosave_every: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// Root of everything the sandbox may touch. Supports `~`.
    #[serde(default)]
    pub allowed_root: Option<PathBuf>,
    /// Where session directories live
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    /// Override for artifact storage (one subdirectory per session)
    #[serde(default)]
    pub artifact_dir: Option<PathBuf>,
    #[serde(default)]
    pub retention: RetentionPolicy,
    #[serde(default = "default_true")]
    pub persist_on_teardown: bool,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct SecurityConfig {
    #[serde(default)]
    pub level: SecurityLevel,
    /// Extra deny regexes appended to the built-in table
    #[serde(default)]
    pub blocked_patterns: Vec<String>,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SecurityLevel {
    #[default]
    Standard,
    High,
}

impl FromStr for SecurityLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "standard" => Ok(Self::Standard),
            "high" => Ok(Self::High),
            other => Err(format!("unknown security level '{other}' (expected standard|high)")),
        }
    }
}

impl std::fmt::Display for SecurityLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Standard => write!(f, "standard"),
            Self::High => write!(f, "high"),
        }
    }
}

/// What happens to a session's scratch directory when its context is torn down.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RetentionPolicy {
    #[default]
    Delete,
    Keep,
}

impl FromStr for RetentionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "delete" => Ok(Self::Delete),
            "keep" => Ok(Self::Keep),
            other => Err(format!("unknown retention policy '{other}' (expected delete|keep)")),
        }
    }
}

fn default_max_execution_time() -> u64 {
    300
}

fn default_shell_timeout() -> u64 {
    30
}

fn default_memory_limit_mb() -> u64 {
    512
}

fn default_autosave_every() -> u32 {
    10
}

fn default_true() -> bool {
    true
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_execution_time: default_max_execution_time(),
            shell_timeout: default_shell_timeout(),
            memory_limit_mb: default_memory_limit_mb(),
            python: None,
            autosave_every: default_autosave_every(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            allowed_root: None,
            data_dir: None,
            artifact_dir: None,
            retention: RetentionPolicy::default(),
            persist_on_teardown: true,
        }
    }
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        // Expand environment variables like ${HOME}
        let expanded = shellexpand::env(&content)?;
        let config: Config = toml::from_str(&expanded)?;
        Ok(config)
    }

    /// Loads the file if it exists (defaults otherwise), then applies
    /// `SANDBOX_*` environment overrides.
    pub fn load_or_default(path: &str) -> anyhow::Result<Self> {
        let mut config = if Path::new(path).exists() {
            Self::load(path)?
        } else {
            Self::default()
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Applies environment-style overrides through `lookup`.
    /// Unparseable values are logged and ignored.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        fn parsed<T: FromStr>(key: &str, raw: Option<String>) -> Option<T> {
            let raw = raw?;
            match raw.trim().parse::<T>() {
                Ok(v) => Some(v),
                Err(_) => {
                    warn!("Ignoring invalid value for {key}: '{raw}'");
                    None
                }
            }
        }

        if let Some(v) = parsed("SANDBOX_MAX_EXECUTION_TIME", lookup("SANDBOX_MAX_EXECUTION_TIME")) {
            self.execution.max_execution_time = v;
        }
        if let Some(v) = parsed("SANDBOX_SHELL_TIMEOUT", lookup("SANDBOX_SHELL_TIMEOUT")) {
            self.execution.shell_timeout = v;
        }
        if let Some(v) = parsed("SANDBOX_MEMORY_LIMIT_MB", lookup("SANDBOX_MEMORY_LIMIT_MB")) {
            self.execution.memory_limit_mb = v;
        }
        if let Some(v) = parsed("SANDBOX_SECURITY_LEVEL", lookup("SANDBOX_SECURITY_LEVEL")) {
            self.security.level = v;
        }
        if let Some(v) = parsed("SANDBOX_RETENTION", lookup("SANDBOX_RETENTION")) {
            self.storage.retention = v;
        }
        if let Some(v) = lookup("SANDBOX_PYTHON").filter(|v| !v.trim().is_empty()) {
            self.execution.python = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("SANDBOX_ALLOWED_ROOT").filter(|v| !v.trim().is_empty()) {
            self.storage.allowed_root = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("SANDBOX_DATA_DIR").filter(|v| !v.trim().is_empty()) {
            self.storage.data_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("SANDBOX_ARTIFACT_DIR").filter(|v| !v.trim().is_empty()) {
            self.storage.artifact_dir = Some(PathBuf::from(v));
        }
    }

    /// The allowed root: configured value, else the user's home directory.
    pub fn allowed_root(&self) -> PathBuf {
        match &self.storage.allowed_root {
            Some(p) => expand_tilde(p),
            None => dirs::home_dir()
                .or_else(|| std::env::current_dir().ok())
                .unwrap_or_else(|| PathBuf::from(".")),
        }
    }

    /// Directory holding one subdirectory per session.
    pub fn data_dir(&self) -> PathBuf {
        match &self.storage.data_dir {
            Some(p) => expand_tilde(p),
            None => self.allowed_root().join(".fluux-sandbox").join("sessions"),
        }
    }

    /// Shared artifact directory, if one is configured.
    pub fn artifact_dir(&self) -> Option<PathBuf> {
        self.storage.artifact_dir.as_deref().map(expand_tilde)
    }

    /// Artifact root for a session whose state lives in `session_dir`.
    pub fn artifact_root(&self, session_id: &str, session_dir: &Path) -> PathBuf {
        match self.artifact_dir() {
            Some(dir) => dir.join(session_id),
            None => session_dir.join("artifacts"),
        }
    }

    pub fn max_execution_time(&self) -> Duration {
        Duration::from_secs(self.execution.max_execution_time.max(1))
    }

    /// Effective timeout for a shell call, clamped per security level.
    pub fn shell_timeout(&self, requested: Option<u64>) -> Duration {
        let ceiling = match self.security.level {
            SecurityLevel::Standard => self.execution.max_execution_time,
            SecurityLevel::High => self.execution.shell_timeout,
        };
        let secs = requested.unwrap_or(self.execution.shell_timeout);
        Duration::from_secs(secs.clamp(1, ceiling.max(1)))
    }
}

fn expand_tilde(path: &Path) -> PathBuf {
    let raw = path.to_string_lossy();
    PathBuf::from(shellexpand::tilde(&raw).into_owned())
}
