pub mod artifacts;
pub mod execute;
pub mod session;

use serde_json::{json, Value};

use crate::error::SandboxError;
use crate::runtime::ExecutionRecord;
use crate::session::DEFAULT_SESSION;
use crate::skills::{SkillContext, SkillRegistry};

pub use artifacts::{CleanupArtifactsSkill, CleanupTempArtifactsSkill, ListArtifactsSkill};
pub use execute::{ExecuteSkill, ShellExecuteSkill};
pub use session::{
    ChangeWorkingDirectorySkill, ClearCacheSkill, CloseSessionSkill, DestroySessionSkill,
    GetExecutionHistorySkill, GetSessionInfoSkill, RestoreSessionSkill, SaveSessionSkill,
    StartSessionSkill,
};

pub fn register_all(registry: &mut SkillRegistry) {
    registry.register(Box::new(ExecuteSkill));
    registry.register(Box::new(ShellExecuteSkill));
    registry.register(Box::new(ListArtifactsSkill));
    registry.register(Box::new(CleanupArtifactsSkill));
    registry.register(Box::new(ChangeWorkingDirectorySkill));
    registry.register(Box::new(GetSessionInfoSkill));
    registry.register(Box::new(ClearCacheSkill));
    registry.register(Box::new(GetExecutionHistorySkill));
    registry.register(Box::new(SaveSessionSkill));
    registry.register(Box::new(RestoreSessionSkill));
    registry.register(Box::new(CleanupTempArtifactsSkill));
    registry.register(Box::new(StartSessionSkill));
    registry.register(Box::new(CloseSessionSkill));
    registry.register(Box::new(DestroySessionSkill));
}

// ── Shared helpers ──────────────────────────────────────

/// `session_id` parameter, else the envelope's session, else none.
pub(crate) fn requested_session<'a>(params: &'a Value, context: &'a SkillContext) -> Option<&'a str> {
    params["session_id"]
        .as_str()
        .or(context.session_id.as_deref())
}

/// Like [`requested_session`], falling back to the default session.
pub(crate) fn target_session<'a>(params: &'a Value, context: &'a SkillContext) -> &'a str {
    requested_session(params, context).unwrap_or(DEFAULT_SESSION)
}

pub(crate) fn success(mut body: Value) -> String {
    body["success"] = json!(true);
    body.to_string()
}

pub(crate) fn failure(err: &SandboxError) -> String {
    json!({ "success": false, "error": err }).to_string()
}

pub(crate) fn optional_str<'a>(params: &'a Value, key: &str) -> anyhow::Result<Option<&'a str>> {
    match &params[key] {
        Value::Null => Ok(None),
        Value::String(s) => Ok(Some(s.as_str())),
        _ => anyhow::bail!("Invalid parameter: {key} must be a string"),
    }
}

pub(crate) fn optional_u64(params: &Value, key: &str) -> anyhow::Result<Option<u64>> {
    match &params[key] {
        Value::Null => Ok(None),
        v => v
            .as_u64()
            .map(Some)
            .ok_or_else(|| anyhow::anyhow!("Invalid parameter: {key} must be a non-negative integer")),
    }
}

pub(crate) fn optional_bool(params: &Value, key: &str) -> anyhow::Result<Option<bool>> {
    match &params[key] {
        Value::Null => Ok(None),
        Value::Bool(b) => Ok(Some(*b)),
        _ => anyhow::bail!("Invalid parameter: {key} must be a boolean"),
    }
}

/// Tool-facing view of an execution record.
pub(crate) fn record_json(record: &ExecutionRecord) -> Value {
    json!({
        "success": record.success,
        "execution_id": record.id,
        "kind": record.kind,
        "output": record.output(),
        "stdout": record.stdout,
        "stderr": record.stderr,
        "result": record.result,
        "error": record.error,
        "exit_code": record.exit_code,
        "cwd": record.cwd,
        "started_at": record.started_at,
        "duration_ms": record.duration_ms,
        "artifacts": record.artifacts,
    })
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use serde_json::Value;

    use crate::runtime::testing::{scripted_factory, test_config};
    use crate::session::SessionManager;
    use crate::skills::SkillContext;

    pub fn context(dir: &std::path::Path) -> SkillContext {
        let (factory, _) = scripted_factory();
        SkillContext {
            manager: Arc::new(SessionManager::with_factory(test_config(dir), factory)),
            session_id: None,
        }
    }

    pub fn parse(out: &str) -> Value {
        serde_json::from_str(out).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_resolution_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = test_support::context(dir.path());
        assert_eq!(target_session(&json!({}), &ctx), "default");
        ctx.session_id = Some("envelope".into());
        assert_eq!(target_session(&json!({}), &ctx), "envelope");
        assert_eq!(target_session(&json!({"session_id": "param"}), &ctx), "param");
    }

    #[test]
    fn test_failure_carries_typed_error() {
        let out = failure(&SandboxError::TimeoutError { seconds: 2 });
        let v = test_support::parse(&out);
        assert_eq!(v["success"], false);
        assert_eq!(v["error"]["type"], "TimeoutError");
        assert_eq!(v["error"]["seconds"], 2);
    }

    #[test]
    fn test_optional_params() {
        let params = json!({"n": 3, "s": "x", "b": true, "bad": -1});
        assert_eq!(optional_u64(&params, "n").unwrap(), Some(3));
        assert_eq!(optional_u64(&params, "missing").unwrap(), None);
        assert!(optional_u64(&params, "bad").is_err());
        assert_eq!(optional_str(&params, "s").unwrap(), Some("x"));
        assert!(optional_str(&params, "n").is_err());
        assert_eq!(optional_bool(&params, "b").unwrap(), Some(true));
    }
}
