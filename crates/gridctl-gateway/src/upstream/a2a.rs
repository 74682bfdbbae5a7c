//! A2A-as-MCP adapter: wraps a peer agent so each of its declared skills
//! is callable as one MCP tool. A call is translated into a task
//! submission, polled to completion, and rendered as tool content.

use std::time::Duration;

use serde::Deserialize;
use serde_json::{Value, json};
use ulid::Ulid;

use gridctl_core::GatewayError;
use gridctl_core::protocol::{CallToolResult, JsonRpcRequest, JsonRpcResponse};
use gridctl_core::types::ToolDescriptor;

use super::{CallTimeouts, UpstreamBase};

const AGENT_CARD_PATH: &str = "/.well-known/agent.json";
const POLL_INTERVAL_MS: u64 = 250;

#[derive(Debug, Deserialize)]
struct AgentCard {
    #[serde(default)]
    name: String,
    #[serde(default)]
    skills: Vec<AgentSkill>,
}

#[derive(Debug, Deserialize)]
struct AgentSkill {
    #[serde(default)]
    id: String,
    name: String,
    #[serde(default)]
    description: String,
}

#[derive(Debug, Deserialize)]
struct TaskSnapshot {
    status: TaskStatus,
    #[serde(default)]
    artifacts: Vec<Artifact>,
}

#[derive(Debug, Deserialize)]
struct TaskStatus {
    state: String,
    #[serde(default)]
    message: Option<Message>,
}

#[derive(Debug, Deserialize)]
struct Message {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Artifact {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug)]
pub struct A2aUpstream {
    base: UpstreamBase,
    url: String,
    client: reqwest::Client,
    timeouts: CallTimeouts,
}

impl A2aUpstream {
    pub fn new(name: &str, url: String, timeouts: CallTimeouts) -> Self {
        Self {
            base: UpstreamBase::new(name, vec![]),
            url: url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
            timeouts,
        }
    }

    pub fn base(&self) -> &UpstreamBase {
        &self.base
    }

    /// Fetch the peer's agent card and publish its skills as tools.
    pub async fn initialize(&self) -> Result<(), GatewayError> {
        let _guard = self.base.init_guard().await;
        if self.base.is_initialized() {
            return Ok(());
        }

        let card = self.fetch_card(self.timeouts.call).await?;
        let tools = card
            .skills
            .iter()
            .map(|skill| ToolDescriptor {
                name: if skill.id.is_empty() {
                    skill.name.clone()
                } else {
                    skill.id.clone()
                },
                description: skill.description.clone(),
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "input": { "type": "string", "description": "Task input for the skill" },
                    },
                }),
            })
            .collect();
        self.base.store_tools(tools);
        self.base.set_initialized(true);
        tracing::info!(
            server = %self.base.name(),
            peer = %card.name,
            "a2a upstream initialized"
        );
        Ok(())
    }

    pub async fn refresh_tools(&self) -> Result<std::sync::Arc<Vec<ToolDescriptor>>, GatewayError> {
        let card = self.fetch_card(self.timeouts.call).await?;
        let tools = card
            .skills
            .iter()
            .map(|skill| {
                let name = if skill.id.is_empty() {
                    skill.name.clone()
                } else {
                    skill.id.clone()
                };
                ToolDescriptor::new(name, skill.description.clone())
            })
            .collect();
        Ok(self.base.store_tools(tools))
    }

    pub async fn ping(&self) -> Result<(), GatewayError> {
        self.fetch_card(self.timeouts.ping).await.map(|_| ())
    }

    /// Submit a task for the skill and poll until it reaches a terminal
    /// state, all within the call deadline.
    pub async fn tools_call(&self, skill: &str, args: Value) -> Result<CallToolResult, GatewayError> {
        let task_id = Ulid::new().to_string();
        let input = args
            .get("input")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| args.to_string());

        let deadline = tokio::time::Instant::now() + self.timeouts.call;

        let send_params = json!({
            "id": task_id,
            "message": {
                "role": "user",
                "parts": [{ "type": "text", "text": input }],
            },
            "metadata": { "skill": skill },
        });
        let submitted: TaskSnapshot = self.rpc("tasks/send", send_params, deadline).await?;
        let mut snapshot = submitted;

        while !is_terminal(&snapshot.status.state) {
            if tokio::time::Instant::now() >= deadline {
                return Err(GatewayError::transport(
                    self.base.name(),
                    format_args!("task {task_id} did not complete within the deadline"),
                ));
            }
            tokio::time::sleep(Duration::from_millis(POLL_INTERVAL_MS)).await;
            snapshot = self
                .rpc("tasks/get", json!({ "id": task_id }), deadline)
                .await?;
        }

        let text = render_task(&snapshot);
        if snapshot.status.state == "completed" {
            Ok(CallToolResult::text(text))
        } else {
            Ok(CallToolResult::error(format!(
                "task {}: {}",
                snapshot.status.state,
                if text.is_empty() { "no output".to_string() } else { text }
            )))
        }
    }

    async fn fetch_card(&self, deadline: Duration) -> Result<AgentCard, GatewayError> {
        let url = format!("{}{AGENT_CARD_PATH}", self.url);
        let response = tokio::time::timeout(deadline, self.client.get(&url).send())
            .await
            .map_err(|_| GatewayError::transport(self.base.name(), "agent card fetch timed out"))?
            .map_err(|error| {
                GatewayError::transport(self.base.name(), format_args!("agent card fetch failed: {error}"))
            })?;
        if !response.status().is_success() {
            return Err(GatewayError::transport(
                self.base.name(),
                format_args!("agent card fetch returned {}", response.status()),
            ));
        }
        response.json().await.map_err(|error| {
            GatewayError::transport(self.base.name(), format_args!("invalid agent card: {error}"))
        })
    }

    async fn rpc<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
        deadline: tokio::time::Instant,
    ) -> Result<T, GatewayError> {
        let request = JsonRpcRequest::new(1, method, params);
        let send = async {
            let response = self
                .client
                .post(&self.url)
                .json(&request)
                .send()
                .await
                .map_err(|error| {
                    GatewayError::transport(self.base.name(), format_args!("{method} failed: {error}"))
                })?;
            response.json::<JsonRpcResponse>().await.map_err(|error| {
                GatewayError::transport(
                    self.base.name(),
                    format_args!("{method} returned invalid JSON-RPC: {error}"),
                )
            })
        };

        let response = tokio::time::timeout_at(deadline, send)
            .await
            .map_err(|_| {
                GatewayError::transport(self.base.name(), format_args!("{method} timed out"))
            })??;

        if let Some(error) = response.error {
            return Err(GatewayError::transport(
                self.base.name(),
                format_args!("{method} failed ({}): {}", error.code, error.message),
            ));
        }
        let result = response.result.ok_or_else(|| {
            GatewayError::transport(self.base.name(), format_args!("{method} returned no result"))
        })?;
        serde_json::from_value(result).map_err(|error| {
            GatewayError::transport(self.base.name(), format_args!("{method} payload mismatch: {error}"))
        })
    }
}

fn is_terminal(state: &str) -> bool {
    matches!(state, "completed" | "failed" | "canceled")
}

/// Concatenate all text parts from the task's artifacts, falling back to
/// the status message.
fn render_task(snapshot: &TaskSnapshot) -> String {
    let mut chunks: Vec<&str> = Vec::new();
    for artifact in &snapshot.artifacts {
        for part in &artifact.parts {
            if let Some(text) = part.text.as_deref() {
                chunks.push(text);
            }
        }
    }
    if chunks.is_empty() {
        if let Some(message) = &snapshot.status.message {
            for part in &message.parts {
                if let Some(text) = part.text.as_deref() {
                    chunks.push(text);
                }
            }
        }
    }
    chunks.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_are_recognized() {
        assert!(is_terminal("completed"));
        assert!(is_terminal("failed"));
        assert!(is_terminal("canceled"));
        assert!(!is_terminal("working"));
        assert!(!is_terminal("submitted"));
    }

    #[test]
    fn render_prefers_artifacts_over_status_message() {
        let snapshot: TaskSnapshot = serde_json::from_value(json!({
            "status": {
                "state": "completed",
                "message": { "parts": [{ "type": "text", "text": "status text" }] },
            },
            "artifacts": [
                { "parts": [{ "type": "text", "text": "first" }] },
                { "parts": [{ "type": "text", "text": "second" }] },
            ],
        }))
        .unwrap();
        assert_eq!(render_task(&snapshot), "first\nsecond");
    }

    #[test]
    fn render_falls_back_to_status_message() {
        let snapshot: TaskSnapshot = serde_json::from_value(json!({
            "status": {
                "state": "failed",
                "message": { "parts": [{ "type": "text", "text": "boom" }] },
            },
        }))
        .unwrap();
        assert_eq!(render_task(&snapshot), "boom");
    }

    #[test]
    fn card_skills_parse_with_optional_ids() {
        let card: AgentCard = serde_json::from_value(json!({
            "name": "peer",
            "skills": [
                { "id": "summarize", "name": "Summarize", "description": "Summarize text" },
                { "name": "translate" },
            ],
        }))
        .unwrap();
        assert_eq!(card.skills.len(), 2);
        assert_eq!(card.skills[0].id, "summarize");
        assert!(card.skills[1].id.is_empty());
    }
}
