use async_trait::async_trait;
use serde_json::{json, Value};

use super::{failure, optional_str, optional_u64, record_json, requested_session};
use crate::skills::{Skill, SkillContext};

/// Runs Python code in the session's persistent namespace.
///
/// Variables, functions and imports defined in one call stay visible in
/// the next. Plots and images shown by the code come back as artifacts.
pub struct ExecuteSkill;

#[async_trait]
impl Skill for ExecuteSkill {
    fn name(&self) -> &str {
        "execute"
    }

    fn description(&self) -> &str {
        "Execute Python code in a persistent session. Variables and imports survive between \
         calls. If the last statement is an expression its value is returned as `result`. \
         Figures shown with matplotlib or PIL are saved and returned as artifacts."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "code": {
                    "type": "string",
                    "description": "Python source to execute"
                },
                "session_id": {
                    "type": "string",
                    "description": "Session to run in (default session if omitted)"
                }
            },
            "required": ["code"]
        })
    }

    fn capabilities(&self) -> Vec<String> {
        vec!["process:python".to_string(), "filesystem:artifacts:write".to_string()]
    }

    async fn execute(&self, params: Value, context: &SkillContext) -> anyhow::Result<String> {
        let code = params["code"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("Missing required parameter: code"))?;

        let session = match context
            .manager
            .get_or_create(requested_session(&params, context))
            .await
        {
            Ok(s) => s,
            Err(e) => return Ok(failure(&e)),
        };
        let outcome = session.lock().await.execute(code).await;
        Ok(match outcome {
            Ok(record) => {
                let mut body = record_json(&record);
                body["session_id"] = json!(session.id());
                body.to_string()
            }
            Err(e) => failure(&e),
        })
    }
}

/// Runs a shell command after the command filter and path checks.
pub struct ShellExecuteSkill;

#[async_trait]
impl Skill for ShellExecuteSkill {
    fn name(&self) -> &str {
        "shell_execute"
    }

    fn description(&self) -> &str {
        "Run a shell command inside the sandbox. Dangerous commands are refused before they \
         start, the working directory must stay inside the allowed root, and the command is \
         killed when the timeout expires."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "Command line, run with `sh -c`"
                },
                "working_directory": {
                    "type": "string",
                    "description": "Directory to run in, relative to the session's current directory"
                },
                "timeout": {
                    "type": "integer",
                    "minimum": 1,
                    "description": "Timeout in seconds (defaults to the configured shell timeout)"
                },
                "session_id": {
                    "type": "string",
                    "description": "Session to run in (default session if omitted)"
                }
            },
            "required": ["command"]
        })
    }

    fn capabilities(&self) -> Vec<String> {
        vec!["process:shell".to_string()]
    }

    async fn execute(&self, params: Value, context: &SkillContext) -> anyhow::Result<String> {
        let command = params["command"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("Missing required parameter: command"))?;
        let working_directory = optional_str(&params, "working_directory")?;
        let timeout = optional_u64(&params, "timeout")?;

        let session = match context
            .manager
            .get_or_create(requested_session(&params, context))
            .await
        {
            Ok(s) => s,
            Err(e) => return Ok(failure(&e)),
        };
        let outcome = session
            .lock()
            .await
            .run_shell(command, working_directory, timeout)
            .await;
        Ok(match outcome {
            Ok(record) => {
                let mut body = record_json(&record);
                body["session_id"] = json!(session.id());
                body.to_string()
            }
            Err(e) => failure(&e),
        })
    }
}
