use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use super::{
    failure, optional_bool, optional_str, optional_u64, record_json, requested_session, success,
    target_session,
};
use crate::error::SandboxError;
use crate::runtime::ExecutionKind;
use crate::session::HistoryFilter;
use crate::skills::{Skill, SkillContext};

const DEFAULT_HISTORY_LIMIT: usize = 20;

fn session_param_schema(purpose: &str) -> Value {
    json!({
        "type": "string",
        "description": format!("Session to {purpose} (default session if omitted)")
    })
}

/// Moves the session's working directory, never outside the allowed root.
pub struct ChangeWorkingDirectorySkill;

#[async_trait]
impl Skill for ChangeWorkingDirectorySkill {
    fn name(&self) -> &str {
        "change_working_directory"
    }

    fn description(&self) -> &str {
        "Change the working directory used by later execute and shell_execute calls. \
         Relative paths resolve against the current directory; leaving the allowed root \
         is refused."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "New working directory"
                },
                "session_id": session_param_schema("move")
            },
            "required": ["path"]
        })
    }

    async fn execute(&self, params: Value, context: &SkillContext) -> anyhow::Result<String> {
        let path = params["path"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("Missing required parameter: path"))?;

        let session = match context
            .manager
            .get_or_create(requested_session(&params, context))
            .await
        {
            Ok(s) => s,
            Err(e) => return Ok(failure(&e)),
        };
        let mut ctx = session.lock().await;
        Ok(match ctx.change_dir(path).await {
            Ok(cwd) => success(json!({
                "session_id": session.id(),
                "cwd": cwd,
                "allowed_root": ctx.policy().root(),
            })),
            Err(e) => failure(&e),
        })
    }
}

/// Reports a session's state, environment, variables and statistics.
pub struct GetSessionInfoSkill;

#[async_trait]
impl Skill for GetSessionInfoSkill {
    fn name(&self) -> &str {
        "get_session_info"
    }

    fn description(&self) -> &str {
        "Describe a session: working directory, allowed root, artifact directory, \
         interpreter and virtualenv, active capture hooks, defined variables and \
         execution statistics, plus the list of live sessions."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "session_id": session_param_schema("describe")
            }
        })
    }

    async fn execute(&self, params: Value, context: &SkillContext) -> anyhow::Result<String> {
        let session = match context
            .manager
            .get_or_create(requested_session(&params, context))
            .await
        {
            Ok(s) => s,
            Err(e) => return Ok(failure(&e)),
        };
        let info = session.lock().await.info().await;
        let live = context.manager.list_sessions().await;
        Ok(success(json!({
            "session": info,
            "live_sessions": live,
        })))
    }
}

/// Drops compiled code cached by a session's interpreter.
pub struct ClearCacheSkill;

#[async_trait]
impl Skill for ClearCacheSkill {
    fn name(&self) -> &str {
        "clear_cache"
    }

    fn description(&self) -> &str {
        "Clear the session's compilation cache and reset its hit counters. With \
         important_only, code blocks containing import, def or class stay cached."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "important_only": {
                    "type": "boolean",
                    "description": "Keep blocks that import modules or define functions and classes (default: false)"
                },
                "session_id": session_param_schema("clear")
            }
        })
    }

    async fn execute(&self, params: Value, context: &SkillContext) -> anyhow::Result<String> {
        let important_only = optional_bool(&params, "important_only")?.unwrap_or(false);
        let session = match context
            .manager
            .get_or_create(requested_session(&params, context))
            .await
        {
            Ok(s) => s,
            Err(e) => return Ok(failure(&e)),
        };
        let result = session.lock().await.clear_cache(important_only).await;
        Ok(match result {
            Ok(stats) => success(json!({
                "session_id": session.id(),
                "removed": stats.removed,
                "remaining": stats.entries,
            })),
            Err(e) => failure(&e),
        })
    }
}

/// Reads a session's execution history with optional filters.
pub struct GetExecutionHistorySkill;

fn parse_time(params: &Value, key: &str) -> anyhow::Result<Result<Option<DateTime<Utc>>, SandboxError>> {
    Ok(match optional_str(params, key)? {
        None => Ok(None),
        Some(raw) => DateTime::parse_from_rfc3339(raw)
            .map(|t| Some(t.with_timezone(&Utc)))
            .map_err(|e| SandboxError::invalid(format!("{key}: not an RFC 3339 timestamp ({e})"))),
    })
}

#[async_trait]
impl Skill for GetExecutionHistorySkill {
    fn name(&self) -> &str {
        "get_execution_history"
    }

    fn description(&self) -> &str {
        "Return recent executions of a session (code or command, output, errors, \
         artifacts), optionally only successes or failures, one kind, or a time range."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "session_id": session_param_schema("read"),
                "success": {
                    "type": "boolean",
                    "description": "Only successful (true) or failed (false) executions"
                },
                "kind": {
                    "type": "string",
                    "enum": ["python", "shell"]
                },
                "since": {
                    "type": "string",
                    "description": "RFC 3339 lower bound on the start time"
                },
                "until": {
                    "type": "string",
                    "description": "RFC 3339 upper bound on the start time"
                },
                "limit": {
                    "type": "integer",
                    "minimum": 1,
                    "description": "Most recent N records (default 20)"
                }
            }
        })
    }

    async fn execute(&self, params: Value, context: &SkillContext) -> anyhow::Result<String> {
        let session = target_session(&params, context);
        let kind = match optional_str(&params, "kind")? {
            None => None,
            Some("python") => Some(ExecutionKind::Python),
            Some("shell") => Some(ExecutionKind::Shell),
            Some(other) => {
                return Ok(failure(&SandboxError::invalid(format!(
                    "unknown kind '{other}' (expected python or shell)"
                ))))
            }
        };
        let since = match parse_time(&params, "since")? {
            Ok(t) => t,
            Err(e) => return Ok(failure(&e)),
        };
        let until = match parse_time(&params, "until")? {
            Ok(t) => t,
            Err(e) => return Ok(failure(&e)),
        };
        let filter = HistoryFilter {
            success: optional_bool(&params, "success")?,
            since,
            until,
            kind,
            limit: Some(
                optional_u64(&params, "limit")?
                    .map_or(DEFAULT_HISTORY_LIMIT, |n| n.max(1) as usize),
            ),
        };

        Ok(match context.manager.history(session, &filter).await {
            Ok(records) => success(json!({
                "session_id": session,
                "count": records.len(),
                "records": records.iter().map(record_json).collect::<Vec<_>>(),
            })),
            Err(e) => failure(&e),
        })
    }
}

/// Persists a session's namespace and metadata.
pub struct SaveSessionSkill;

#[async_trait]
impl Skill for SaveSessionSkill {
    fn name(&self) -> &str {
        "save_session"
    }

    fn description(&self) -> &str {
        "Save the session's variables (by value) and metadata to disk so they can be \
         restored later, even after a restart."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "session_id": session_param_schema("save")
            }
        })
    }

    fn capabilities(&self) -> Vec<String> {
        vec!["filesystem:sessions:write".to_string()]
    }

    async fn execute(&self, params: Value, context: &SkillContext) -> anyhow::Result<String> {
        let session = target_session(&params, context);
        Ok(match context.manager.save(session).await {
            Ok(summary) => success(json!(summary)),
            Err(e) => failure(&e),
        })
    }
}

/// Rebuilds a session from its saved state.
pub struct RestoreSessionSkill;

#[async_trait]
impl Skill for RestoreSessionSkill {
    fn name(&self) -> &str {
        "restore_session"
    }

    fn description(&self) -> &str {
        "Restore a saved session: a fresh interpreter is started and the saved variable \
         values are loaded into it. Earlier code is not run again."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "session_id": session_param_schema("restore")
            }
        })
    }

    fn capabilities(&self) -> Vec<String> {
        vec!["process:python".to_string(), "filesystem:sessions:read".to_string()]
    }

    async fn execute(&self, params: Value, context: &SkillContext) -> anyhow::Result<String> {
        let session = target_session(&params, context);
        Ok(match context.manager.restore(session).await {
            Ok(summary) => success(json!(summary)),
            Err(e) => failure(&e),
        })
    }
}

/// Starts a session with a freshly minted id.
pub struct StartSessionSkill;

#[async_trait]
impl Skill for StartSessionSkill {
    fn name(&self) -> &str {
        "start_session"
    }

    fn description(&self) -> &str {
        "Start a new, empty session and return its generated id. Pass that id as \
         session_id to later calls to keep their state apart from other sessions."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {}
        })
    }

    async fn execute(&self, _params: Value, context: &SkillContext) -> anyhow::Result<String> {
        Ok(match context.manager.create().await {
            Ok(session) => success(json!({ "session_id": session.id() })),
            Err(e) => failure(&e),
        })
    }
}

/// Tears a live session down, persisting it when configured to.
pub struct CloseSessionSkill;

#[async_trait]
impl Skill for CloseSessionSkill {
    fn name(&self) -> &str {
        "close_session"
    }

    fn description(&self) -> &str {
        "Stop a session's interpreter. Its saved state and artifacts stay on disk, so \
         using the same session_id later resumes it."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "session_id": session_param_schema("close")
            }
        })
    }

    async fn execute(&self, params: Value, context: &SkillContext) -> anyhow::Result<String> {
        let session = target_session(&params, context);
        let closed = context.manager.close(session).await;
        Ok(success(json!({ "session_id": session, "closed": closed })))
    }
}

/// Deletes a session with everything it produced.
pub struct DestroySessionSkill;

#[async_trait]
impl Skill for DestroySessionSkill {
    fn name(&self) -> &str {
        "destroy_session"
    }

    fn description(&self) -> &str {
        "Delete a session completely: interpreter, saved state, execution history and \
         artifacts. This cannot be undone."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "session_id": session_param_schema("destroy")
            }
        })
    }

    fn capabilities(&self) -> Vec<String> {
        vec![
            "filesystem:sessions:write".to_string(),
            "filesystem:artifacts:write".to_string(),
        ]
    }

    async fn execute(&self, params: Value, context: &SkillContext) -> anyhow::Result<String> {
        let session = target_session(&params, context);
        Ok(match context.manager.destroy(session).await {
            Ok(summary) => success(json!(summary)),
            Err(e) => failure(&e),
        })
    }
}
