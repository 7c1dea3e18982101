use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use serde_json::{json, Value};
use tracing::debug;

use super::{failure, optional_bool, optional_str, requested_session, success, target_session};
use crate::artifacts::{format_size, Artifact, ArtifactCategory};
use crate::error::SandboxError;
use crate::skills::{Skill, SkillContext};

/// Files larger than this are listed without inline content.
const MAX_INLINE_BYTES: u64 = 10 * 1024 * 1024;

fn parse_category(name: Option<&str>) -> Result<Option<ArtifactCategory>, SandboxError> {
    match name.map(str::trim).filter(|n| !n.is_empty() && *n != "all") {
        None => Ok(None),
        Some(n) => ArtifactCategory::parse(n).map(Some).ok_or_else(|| {
            SandboxError::invalid(format!(
                "unknown artifact category '{n}' (expected image, video, data, code, other or all)"
            ))
        }),
    }
}

fn render_text(artifacts: &[Artifact]) -> String {
    if artifacts.is_empty() {
        return "No artifacts.".to_string();
    }
    let total: u64 = artifacts.iter().map(|a| a.size).sum();
    let mut out = format!("{} artifact(s), {}\n", artifacts.len(), format_size(total));
    for a in artifacts {
        out.push_str(&format!(
            "- [{}] {} ({}, {}) {}",
            a.category,
            a.name,
            a.human_size(),
            a.mime_type,
            a.path.display()
        ));
        if let Some(source) = &a.source {
            out.push_str(&format!(" via {source}"));
        }
        out.push('\n');
    }
    out
}

async fn artifact_json(artifact: &Artifact, include_content: bool) -> Value {
    let mut value = json!(artifact);
    if !include_content {
        return value;
    }
    if artifact.size > MAX_INLINE_BYTES {
        value["content_omitted"] = json!(format!("larger than {}", format_size(MAX_INLINE_BYTES)));
        return value;
    }
    match tokio::fs::read(&artifact.path).await {
        Ok(data) => {
            value["content_base64"] = json!(base64::engine::general_purpose::STANDARD.encode(&data));
        }
        Err(e) => {
            debug!("Cannot read artifact {}: {e}", artifact.path.display());
            value["content_omitted"] = json!(e.to_string());
        }
    }
    value
}

/// Lists the artifacts produced by a session (or by every live session).
pub struct ListArtifactsSkill;

#[async_trait]
impl Skill for ListArtifactsSkill {
    fn name(&self) -> &str {
        "list_artifacts"
    }

    fn description(&self) -> &str {
        "List files produced by executed code (plots, images, videos, data, code). \
         Filter by session and category; use format=json with include_content=true to \
         receive file contents as base64."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "session_id": {
                    "type": "string",
                    "description": "Session whose artifacts to list (all live sessions if omitted)"
                },
                "category": {
                    "type": "string",
                    "enum": ["image", "video", "data", "code", "other", "all"],
                    "description": "Only list this category"
                },
                "format": {
                    "type": "string",
                    "enum": ["text", "json"],
                    "description": "Output format (default text)"
                },
                "include_content": {
                    "type": "boolean",
                    "description": "Embed base64 file content (json format only)"
                }
            }
        })
    }

    fn capabilities(&self) -> Vec<String> {
        vec!["filesystem:artifacts:read".to_string()]
    }

    async fn execute(&self, params: Value, context: &SkillContext) -> anyhow::Result<String> {
        let format = optional_str(&params, "format")?.unwrap_or("text");
        let include_content = optional_bool(&params, "include_content")?.unwrap_or(false);
        let category = match parse_category(optional_str(&params, "category")?) {
            Ok(c) => c,
            Err(e) => return Ok(failure(&e)),
        };
        let session = requested_session(&params, context);

        let artifacts = match context.manager.list_artifacts(session, category).await {
            Ok(a) => a,
            Err(e) => return Ok(failure(&e)),
        };
        match format {
            "text" => Ok(render_text(&artifacts)),
            "json" => {
                let mut items = Vec::with_capacity(artifacts.len());
                for artifact in &artifacts {
                    items.push(artifact_json(artifact, include_content).await);
                }
                Ok(success(json!({
                    "count": items.len(),
                    "total_bytes": artifacts.iter().map(|a| a.size).sum::<u64>(),
                    "artifacts": items,
                })))
            }
            other => Ok(failure(&SandboxError::invalid(format!(
                "unknown format '{other}' (expected text or json)"
            )))),
        }
    }
}

/// Deletes a session's artifacts, optionally one category only.
pub struct CleanupArtifactsSkill;

#[async_trait]
impl Skill for CleanupArtifactsSkill {
    fn name(&self) -> &str {
        "cleanup_artifacts"
    }

    fn description(&self) -> &str {
        "Delete artifacts of a session, all of them or only one category. \
         Returns how many were removed and any files that could not be deleted; \
         cleaning an empty session removes 0."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "type": {
                    "type": "string",
                    "enum": ["image", "video", "data", "code", "other", "all"],
                    "description": "Category to delete (default all)"
                },
                "session_id": {
                    "type": "string",
                    "description": "Session to clean (default session if omitted)"
                }
            }
        })
    }

    fn capabilities(&self) -> Vec<String> {
        vec!["filesystem:artifacts:write".to_string()]
    }

    async fn execute(&self, params: Value, context: &SkillContext) -> anyhow::Result<String> {
        let category = match parse_category(optional_str(&params, "type")?) {
            Ok(c) => c,
            Err(e) => return Ok(failure(&e)),
        };
        let session = target_session(&params, context);
        Ok(match context.manager.cleanup_artifacts(session, category).await {
            Ok(report) => success(json!({
                "session_id": session,
                "category": category.map_or("all", |c| c.as_str()),
                "removed": report.removed,
                "failed": report.failed,
            })),
            Err(e) => failure(&e),
        })
    }
}

/// Removes saved sessions that have not been touched for a while.
pub struct CleanupTempArtifactsSkill;

#[async_trait]
impl Skill for CleanupTempArtifactsSkill {
    fn name(&self) -> &str {
        "cleanup_temp_artifacts"
    }

    fn description(&self) -> &str {
        "Delete the directories (state, history and artifacts) of inactive sessions older \
         than max_age_hours. Live sessions are never touched."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "max_age_hours": {
                    "type": "number",
                    "minimum": 0,
                    "description": "Age threshold in hours (default 24)"
                }
            }
        })
    }

    fn capabilities(&self) -> Vec<String> {
        vec!["filesystem:sessions:write".to_string()]
    }

    async fn execute(&self, params: Value, context: &SkillContext) -> anyhow::Result<String> {
        let hours = match &params["max_age_hours"] {
            Value::Null => 24.0,
            v => v
                .as_f64()
                .filter(|h| h.is_finite() && *h >= 0.0)
                .ok_or_else(|| anyhow::anyhow!("Invalid parameter: max_age_hours must be a non-negative number"))?,
        };
        let max_age = Duration::from_secs_f64(hours * 3600.0);
        Ok(match context.manager.sweep_stale(max_age).await {
            Ok(removed) => success(json!({
                "max_age_hours": hours,
                "removed_sessions": removed,
                "count": removed.len(),
            })),
            Err(e) => failure(&e),
        })
    }
}
