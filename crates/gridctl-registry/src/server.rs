use std::sync::Arc;

use serde_json::{Value, json};

use gridctl_core::protocol::CallToolResult;
use gridctl_core::types::ToolDescriptor;

use crate::skill::Skill;
use crate::store::{RegistryError, SkillStore};

/// Server slug the registry appears under in the catalog.
pub const REGISTRY_SERVER_NAME: &str = "registry";

const SKILL_URI_SCHEME: &str = "skill://";

/// The registry viewed as an upstream: active skills become tools, every
/// skill body is reachable through `prompts/*` and `resources/*`.
#[derive(Debug, Clone)]
pub struct RegistryServer {
    store: Arc<SkillStore>,
}

impl RegistryServer {
    pub fn new(store: Arc<SkillStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<SkillStore> {
        &self.store
    }

    /// Whether the registry should currently be advertised at all.
    pub fn has_content(&self) -> bool {
        !self.store.is_empty()
    }

    /// Active skills as the registry's tool catalog.
    pub fn tools(&self) -> Vec<ToolDescriptor> {
        self.store
            .active()
            .iter()
            .map(skill_tool)
            .collect()
    }

    /// Invoking a skill tool returns the skill's instructions.
    pub fn call(&self, tool: &str) -> Result<CallToolResult, RegistryError> {
        let skill = self
            .store
            .get(tool)
            .filter(Skill::is_active)
            .ok_or_else(|| RegistryError::NotFound(tool.to_string()))?;
        Ok(CallToolResult::text(skill.body))
    }

    pub fn prompts_list(&self) -> Value {
        let prompts: Vec<Value> = self
            .store
            .active()
            .iter()
            .map(|skill| {
                json!({
                    "name": skill.name(),
                    "description": skill.meta.description,
                })
            })
            .collect();
        json!({ "prompts": prompts })
    }

    pub fn prompt_get(&self, name: &str) -> Result<Value, RegistryError> {
        let skill = self
            .store
            .get(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        Ok(json!({
            "description": skill.meta.description,
            "messages": [{
                "role": "user",
                "content": { "type": "text", "text": skill.body },
            }],
        }))
    }

    pub fn resources_list(&self) -> Value {
        let resources: Vec<Value> = self
            .store
            .list()
            .iter()
            .map(|skill| {
                json!({
                    "uri": format!("{SKILL_URI_SCHEME}{}", skill.name()),
                    "name": skill.name(),
                    "description": skill.meta.description,
                    "mimeType": "text/markdown",
                })
            })
            .collect();
        json!({ "resources": resources })
    }

    pub fn resource_read(&self, uri: &str) -> Result<Value, RegistryError> {
        let name = uri
            .strip_prefix(SKILL_URI_SCHEME)
            .ok_or_else(|| RegistryError::Invalid(format!("unknown resource uri '{uri}'")))?;
        let skill = self
            .store
            .get(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        Ok(json!({
            "contents": [{
                "uri": uri,
                "mimeType": "text/markdown",
                "text": skill.render(),
            }],
        }))
    }
}

fn skill_tool(skill: &Skill) -> ToolDescriptor {
    ToolDescriptor {
        name: skill.name().to_string(),
        description: skill.meta.description.clone(),
        input_schema: json!({
            "type": "object",
            "properties": {},
        }),
    }
}
