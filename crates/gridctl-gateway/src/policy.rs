//! Identity table: the set of known agents and their tool selectors.
//! Mutated only by bring-up and hot reload; reads clone an `Arc` snapshot
//! published copy-on-write.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use gridctl_config::AgentConfig;
use gridctl_core::types::{AgentIdentity, ToolSelector};

#[derive(Debug, Default)]
pub struct PolicyStore {
    identities: RwLock<Arc<HashMap<String, AgentIdentity>>>,
}

impl PolicyStore {
    pub fn from_agents(agents: &[AgentConfig]) -> Self {
        let store = Self::default();
        store.replace_all(agents);
        store
    }

    /// Swap in a freshly built identity table.
    pub fn replace_all(&self, agents: &[AgentConfig]) {
        let table: HashMap<String, AgentIdentity> = agents
            .iter()
            .map(|agent| {
                (
                    agent.name.clone(),
                    AgentIdentity {
                        name: agent.name.clone(),
                        uses: agent.uses.clone(),
                        a2a_enabled: agent.a2a.enabled,
                    },
                )
            })
            .collect();
        *self.identities.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(table);
    }

    fn snapshot(&self) -> Arc<HashMap<String, AgentIdentity>> {
        Arc::clone(&self.identities.read().unwrap_or_else(|e| e.into_inner()))
    }

    pub fn get(&self, name: &str) -> Option<AgentIdentity> {
        self.snapshot().get(name).cloned()
    }

    pub fn known(&self, name: &str) -> bool {
        self.snapshot().contains_key(name)
    }

    /// The selectors of one identity; an unknown identity has none.
    pub fn allowed_servers(&self, name: &str) -> Vec<ToolSelector> {
        self.snapshot()
            .get(name)
            .map(|agent| agent.uses.clone())
            .unwrap_or_default()
    }

    /// All identities, sorted by name for stable listings.
    pub fn list(&self) -> Vec<AgentIdentity> {
        let mut agents: Vec<AgentIdentity> = self.snapshot().values().cloned().collect();
        agents.sort_by(|a, b| a.name.cmp(&b.name));
        agents
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridctl_config::StackConfig;

    fn store() -> PolicyStore {
        let stack = StackConfig::parse(
            r#"
agents:
  - name: alpha
    uses:
      - server: local-tools
        tools: [echo]
  - name: beta
    uses:
      - server: local-tools
"#,
        )
        .unwrap();
        PolicyStore::from_agents(&stack.agents)
    }

    #[test]
    fn unknown_identity_has_no_access() {
        let store = store();
        assert!(store.get("gamma").is_none());
        assert!(store.allowed_servers("gamma").is_empty());
        assert!(!store.known("gamma"));
    }

    #[test]
    fn selectors_round_trip_from_config() {
        let store = store();
        let alpha = store.get("alpha").unwrap();
        assert!(alpha.allows_tool("local-tools", "echo"));
        assert!(!alpha.allows_tool("local-tools", "get_time"));

        // Empty tools list grants the whole server.
        let beta = store.get("beta").unwrap();
        assert!(beta.allows_tool("local-tools", "get_time"));
    }

    #[test]
    fn replace_all_swaps_the_table() {
        let store = store();
        let stack = StackConfig::parse("agents:\n  - name: gamma\n").unwrap();
        store.replace_all(&stack.agents);

        assert!(store.known("gamma"));
        assert!(!store.known("alpha"));
        assert_eq!(store.len(), 1);
    }
}
