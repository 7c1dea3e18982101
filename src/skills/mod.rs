pub mod builtin;
pub mod registry;

use std::sync::Arc;

use async_trait::async_trait;

use crate::session::SessionManager;

/// Runtime context passed to skill execution.
///
/// Carries the session manager and the session the request was addressed
/// to, so skills can scope their work per session.
pub struct SkillContext {
    pub manager: Arc<SessionManager>,
    /// Session named by the request envelope; `None` means the default session.
    pub session_id: Option<String>,
}

/// A sandbox operation callable as a tool.
#[async_trait]
pub trait Skill: Send + Sync {
    /// Tool name, lowercase alphanumeric + underscores (e.g. "shell_execute").
    fn name(&self) -> &str;

    /// Human-readable description shown to the caller.
    fn description(&self) -> &str;

    /// JSON Schema describing the parameters this skill accepts.
    fn parameters_schema(&self) -> serde_json::Value;

    /// Declared capabilities, informational.
    /// Examples: "process:python", "filesystem:artifacts:write"
    fn capabilities(&self) -> Vec<String> {
        vec![]
    }

    /// Execute the skill and return its JSON result as text.
    /// Sandbox errors are part of the result; `Err` means the call itself
    /// was malformed (missing parameter, wrong type).
    async fn execute(
        &self,
        params: serde_json::Value,
        context: &SkillContext,
    ) -> anyhow::Result<String>;
}

pub use registry::SkillRegistry;
