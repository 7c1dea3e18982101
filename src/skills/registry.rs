//! Skills registry: holds the tool surface and dispatches calls by name.

use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use super::{Skill, SkillContext};

/// A tool as advertised to callers.
#[derive(Debug, Clone, Serialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub capabilities: Vec<String>,
}

#[derive(Default)]
pub struct SkillRegistry {
    skills: Vec<Box<dyn Skill>>,
}

impl SkillRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every builtin sandbox skill.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        super::builtin::register_all(&mut registry);
        registry
    }

    /// Adds a skill; a skill with the same name is replaced.
    pub fn register(&mut self, skill: Box<dyn Skill>) {
        self.skills.retain(|s| s.name() != skill.name());
        self.skills.push(skill);
    }

    pub fn len(&self) -> usize {
        self.skills.len()
    }

    pub fn is_empty(&self) -> bool {
        self.skills.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&dyn Skill> {
        self.skills.iter().find(|s| s.name() == name).map(|s| s.as_ref())
    }

    pub fn names(&self) -> Vec<&str> {
        self.skills.iter().map(|s| s.name()).collect()
    }

    pub fn tool_definitions(&self) -> Vec<ToolDefinition> {
        self.skills
            .iter()
            .map(|s| ToolDefinition {
                name: s.name().to_string(),
                description: s.description().to_string(),
                input_schema: s.parameters_schema(),
                capabilities: s.capabilities(),
            })
            .collect()
    }

    pub async fn execute(
        &self,
        name: &str,
        params: Value,
        context: &SkillContext,
    ) -> anyhow::Result<String> {
        let skill = self
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("Unknown tool: {name}"))?;
        debug!("Executing tool {name}");
        skill.execute(params, context).await
    }
}
