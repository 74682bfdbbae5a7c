//! The router owns the upstream clients and the derived catalog: every
//! upstream tool under its `<server>__<tool>` name, published
//! copy-on-write. Lookups never hold a lock across an upstream
//! round-trip.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{RwLock, mpsc};

use gridctl_core::GatewayError;
use gridctl_core::protocol::CallToolResult;
use gridctl_core::types::{ToolDescriptor, ToolSelector, split_prefixed_name};

use crate::policy::PolicyStore;
use crate::upstream::UpstreamClient;

/// One published catalog entry.
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogEntry {
    pub server: String,
    pub tool: ToolDescriptor,
}

/// Immutable derived view: prefixed name → owning server + descriptor.
#[derive(Debug, Default, PartialEq)]
pub struct Catalog {
    entries: BTreeMap<String, CatalogEntry>,
}

impl Catalog {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = (&String, &CatalogEntry)> {
        self.entries.iter()
    }

    /// Externally visible tools for an identity; `None` sees everything.
    pub fn visible_tools(&self, identity: Option<&[ToolSelector]>) -> Vec<ToolDescriptor> {
        self.entries
            .iter()
            .filter(|(_, entry)| match identity {
                None => true,
                Some(selectors) => selectors
                    .iter()
                    .any(|sel| sel.server == entry.server && sel.allows(&entry.tool.name)),
            })
            .map(|(prefixed, entry)| ToolDescriptor {
                name: prefixed.clone(),
                description: entry.tool.description.clone(),
                input_schema: entry.tool.input_schema.clone(),
            })
            .collect()
    }
}

struct RouterInner {
    clients: Vec<Arc<UpstreamClient>>,
    catalog: Arc<Catalog>,
}

pub struct Router {
    inner: RwLock<RouterInner>,
    policy: Arc<PolicyStore>,
    // One event per catalog publication; the facade fans each out as a
    // single `listChanged` to every session.
    publish_tx: mpsc::UnboundedSender<()>,
}

impl Router {
    /// Returns the router plus the publication stream the facade drains.
    pub fn new(policy: Arc<PolicyStore>) -> (Arc<Self>, mpsc::UnboundedReceiver<()>) {
        let (publish_tx, publish_rx) = mpsc::unbounded_channel();
        let router = Arc::new(Self {
            inner: RwLock::new(RouterInner {
                clients: Vec::new(),
                catalog: Arc::new(Catalog::default()),
            }),
            policy,
            publish_tx,
        });
        (router, publish_rx)
    }

    pub fn policy(&self) -> &Arc<PolicyStore> {
        &self.policy
    }

    /// Register a client. A second registration under the same name
    /// replaces the first and logs a WARN. Atomic with the catalog.
    pub async fn add_client(&self, client: Arc<UpstreamClient>) {
        let mut inner = self.inner.write().await;
        if let Some(at) = inner.clients.iter().position(|c| c.name() == client.name()) {
            tracing::warn!(server = %client.name(), "replacing already-registered upstream");
            inner.clients[at] = client;
        } else {
            inner.clients.push(client);
        }
        self.rebuild_and_publish(&mut inner, true);
    }

    /// Detach a client, returning it so the caller can drain and close it.
    pub async fn remove_client(&self, name: &str) -> Option<Arc<UpstreamClient>> {
        let mut inner = self.inner.write().await;
        let at = inner.clients.iter().position(|c| c.name() == name)?;
        let removed = inner.clients.remove(at);
        self.rebuild_and_publish(&mut inner, true);
        Some(removed)
    }

    /// Apply a hot-reload diff as one catalog mutation: all removals and
    /// additions land under a single write lock, and at most one
    /// publication is emitted. Returns the detached clients and whether a
    /// publication happened.
    pub async fn apply_diff(
        &self,
        additions: Vec<Arc<UpstreamClient>>,
        removals: &[String],
    ) -> (Vec<Arc<UpstreamClient>>, bool) {
        let mut inner = self.inner.write().await;
        let mut detached = Vec::new();

        for name in removals {
            if let Some(at) = inner.clients.iter().position(|c| c.name() == name) {
                detached.push(inner.clients.remove(at));
            }
        }
        for client in additions {
            if let Some(at) = inner.clients.iter().position(|c| c.name() == client.name()) {
                tracing::warn!(server = %client.name(), "replacing already-registered upstream");
                detached.push(std::mem::replace(&mut inner.clients[at], client));
            } else {
                inner.clients.push(client);
            }
        }

        let published = self.rebuild_and_publish(&mut inner, false);
        (detached, published)
    }

    /// Re-query every upstream and publish the rebuilt catalog when it
    /// actually changed. Upstream failures keep the previous cache.
    pub async fn refresh_tools(&self) {
        let clients = self.clients_snapshot().await;
        for client in &clients {
            if let Err(error) = client.refresh_tools().await {
                tracing::warn!(server = %client.name(), error = %error, "tool refresh failed");
            }
        }

        let mut inner = self.inner.write().await;
        self.rebuild_and_publish(&mut inner, false);
    }

    /// Emit one publication without rebuilding; used when visibility
    /// changes for reasons outside the catalog (policy swaps).
    pub fn publish(&self) {
        let _ = self.publish_tx.send(());
    }

    pub async fn has_client(&self, name: &str) -> bool {
        self.inner
            .read()
            .await
            .clients
            .iter()
            .any(|c| c.name() == name)
    }

    pub async fn clients_snapshot(&self) -> Vec<Arc<UpstreamClient>> {
        self.inner.read().await.clients.clone()
    }

    pub async fn catalog(&self) -> Arc<Catalog> {
        Arc::clone(&self.inner.read().await.catalog)
    }

    /// The catalog filtered by the caller's identity. No identity sees
    /// everything (administrative surfaces); an unknown identity sees
    /// nothing.
    pub async fn handle_tools_list(&self, identity: Option<&str>) -> Vec<ToolDescriptor> {
        let catalog = self.catalog().await;
        match identity {
            None => catalog.visible_tools(None),
            Some(name) => match self.policy.get(name) {
                Some(agent) => catalog.visible_tools(Some(&agent.uses)),
                None => Vec::new(),
            },
        }
    }

    /// Route one call: split the prefix at the first `__`, policy-check,
    /// resolve the owner under the read lock, then dispatch without
    /// holding any lock across the upstream round-trip.
    pub async fn handle_tools_call(
        &self,
        identity: Option<&str>,
        prefixed_name: &str,
        args: Value,
    ) -> Result<CallToolResult, GatewayError> {
        let (server, tool) = split_prefixed_name(prefixed_name)
            .ok_or_else(|| GatewayError::NotFound(format!("unknown tool '{prefixed_name}'")))?;

        if let Some(identity) = identity {
            let allowed = self
                .policy
                .get(identity)
                .is_some_and(|agent| agent.allows_tool(server, tool));
            if !allowed {
                return Err(GatewayError::PolicyDenied(prefixed_name.to_string()));
            }
        }

        let owner = {
            let inner = self.inner.read().await;
            inner
                .clients
                .iter()
                .find(|c| c.name() == server)
                .cloned()
        }
        .ok_or_else(|| GatewayError::NotFound(format!("unknown tool '{prefixed_name}'")))?;

        owner.tools_call(tool, args).await
    }

    /// Read-through to the policy store.
    pub fn get_agent_allowed_servers(&self, identity: &str) -> Vec<ToolSelector> {
        self.policy.allowed_servers(identity)
    }

    /// Refresh a single client's tool list and republish if the catalog
    /// changed. Cheaper than a full `refresh_tools` for local mutations
    /// like registry edits.
    pub async fn refresh_client(&self, name: &str) {
        let client = {
            let inner = self.inner.read().await;
            inner.clients.iter().find(|c| c.name() == name).cloned()
        };
        let Some(client) = client else { return };
        if let Err(error) = client.refresh_tools().await {
            tracing::warn!(server = %name, error = %error, "tool refresh failed");
        }

        let mut inner = self.inner.write().await;
        self.rebuild_and_publish(&mut inner, false);
    }

    fn rebuild_and_publish(&self, inner: &mut RouterInner, always_publish: bool) -> bool {
        let mut entries = BTreeMap::new();
        for client in &inner.clients {
            let server = client.name().to_string();
            for tool in client.tools_list().iter() {
                entries.insert(
                    tool.prefixed(&server),
                    CatalogEntry {
                        server: server.clone(),
                        tool: tool.clone(),
                    },
                );
            }
        }
        let rebuilt = Catalog { entries };

        if !always_publish && rebuilt == *inner.catalog {
            return false;
        }
        inner.catalog = Arc::new(rebuilt);
        let _ = self.publish_tx.send(());
        true
    }
}

#[cfg(test)]
#[path = "router_tests.rs"]
mod tests;
