//! Periodic upstream health monitoring. Three consecutive ping failures
//! mark a client unhealthy; recovery invokes `reconnect` (where
//! supported) before health is declared again. The monitor never blocks
//! router operations; it works on a snapshot of the client set.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::router::Router;

pub const UNHEALTHY_AFTER_FAILURES: u32 = 3;

pub fn spawn_health_monitor(
    router: Arc<Router>,
    interval: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut failures: HashMap<String, u32> = HashMap::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    run_sweep(&router, &mut failures).await;
                }
            }
        }
    })
}

/// One monitoring pass over the current client set. Exposed separately so
/// tests can drive sweeps without waiting on the ticker.
pub async fn run_sweep(router: &Router, failures: &mut HashMap<String, u32>) {
    let clients = router.clients_snapshot().await;
    failures.retain(|name, _| clients.iter().any(|c| c.name() == name));

    let mut recovered = false;
    for client in clients {
        let name = client.name().to_string();
        let was_healthy = client.base().is_healthy();

        // A dead transport cannot answer a ping; reconnectable clients
        // are revived first so the probe has something to reach.
        if !was_healthy && client.supports_reconnect() {
            if let Err(error) = client.reconnect().await {
                tracing::debug!(server = %name, error = %error, "reconnect attempt failed");
            }
        }

        match client.ping().await {
            Ok(()) => {
                failures.remove(&name);
                if !was_healthy {
                    client.base().set_healthy(true);
                    tracing::info!(server = %name, "upstream recovered");
                    recovered = true;
                }
            }
            Err(error) => {
                let count = failures.entry(name.clone()).or_insert(0);
                *count += 1;
                if *count >= UNHEALTHY_AFTER_FAILURES && was_healthy {
                    client.base().set_healthy(false);
                    tracing::warn!(
                        server = %name,
                        consecutive_failures = *count,
                        error = %error,
                        "marking upstream unhealthy"
                    );
                }
            }
        }
    }

    if recovered {
        // A revived upstream may advertise a different tool set.
        router.refresh_tools().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use gridctl_registry::{RegistryServer, SkillStore};

    use crate::policy::PolicyStore;
    use crate::upstream::{RegistryUpstream, UpstreamClient};

    // Registry upstreams always answer pings, which makes them a handy
    // stand-in for a healthy transport.
    async fn router_with_local_client() -> (tempfile::TempDir, Arc<Router>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SkillStore::open(dir.path()).unwrap());
        let upstream = RegistryUpstream::new("local", RegistryServer::new(store));
        upstream.initialize().unwrap();

        let (router, _rx) = Router::new(Arc::new(PolicyStore::default()));
        router
            .add_client(Arc::new(UpstreamClient::Registry(upstream)))
            .await;
        (dir, router)
    }

    #[tokio::test]
    async fn healthy_client_stays_healthy() {
        let (_dir, router) = router_with_local_client().await;
        let mut failures = HashMap::new();

        run_sweep(&router, &mut failures).await;

        let client = &router.clients_snapshot().await[0];
        assert!(client.base().is_healthy());
        assert!(failures.is_empty());
    }

    #[tokio::test]
    async fn unhealthy_client_recovers_on_successful_ping() {
        let (_dir, router) = router_with_local_client().await;
        let client = router.clients_snapshot().await[0].clone();
        client.base().set_healthy(false);

        let mut failures = HashMap::new();
        failures.insert("local".to_string(), UNHEALTHY_AFTER_FAILURES);
        run_sweep(&router, &mut failures).await;

        assert!(client.base().is_healthy());
        assert!(failures.is_empty());
    }

    #[tokio::test]
    async fn stale_failure_counts_are_pruned() {
        let (_dir, router) = router_with_local_client().await;
        let mut failures = HashMap::new();
        failures.insert("removed-upstream".to_string(), 2);

        run_sweep(&router, &mut failures).await;
        assert!(!failures.contains_key("removed-upstream"));
    }
}
