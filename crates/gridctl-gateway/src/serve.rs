//! Gateway assembly and lifecycle: construct upstreams from the stack,
//! wire the router, sessions, health monitor, and notification fan-out,
//! serve the HTTP surface, and shut everything down in order.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use gridctl_config::StackConfig;
use gridctl_core::GatewayError;
use gridctl_core::logbuf::LogBuffer;
use gridctl_registry::{RegistryServer, SkillStore};

use crate::api;
use crate::facade::{self, GatewayState};
use crate::health::spawn_health_monitor;
use crate::policy::PolicyStore;
use crate::router::Router;
use crate::session::SessionManager;
use crate::upstream::{A2aUpstream, CallTimeouts, UpstreamClient};

const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

pub struct Gateway {
    state: Arc<GatewayState>,
    publish_rx: Option<mpsc::UnboundedReceiver<()>>,
}

impl Gateway {
    /// Bring the topology up. Configuration problems abort; transport
    /// failures leave the upstream uninitialized for the health monitor
    /// to revive.
    pub async fn build(
        stack: StackConfig,
        stack_path: Option<PathBuf>,
        logs: Arc<LogBuffer>,
    ) -> Result<Self, GatewayError> {
        let settings = stack.gateway.clone();
        let timeouts = CallTimeouts::from_settings(&settings);
        let policy = Arc::new(PolicyStore::from_agents(&stack.agents));
        let (router, publish_rx) = Router::new(Arc::clone(&policy));

        for config in &stack.mcp_servers {
            let client = Arc::new(UpstreamClient::from_config(config, timeouts)?);
            connect_upstream(&client).await;
            router.add_client(client).await;
        }

        for agent in &stack.agents {
            if !agent.a2a.enabled {
                continue;
            }
            let Some(url) = agent.a2a.url.clone() else {
                continue;
            };
            let client = Arc::new(UpstreamClient::A2a(A2aUpstream::new(
                &agent.name,
                url,
                timeouts,
            )));
            connect_upstream(&client).await;
            router.add_client(client).await;
        }

        let registry = match settings.registry_dir.as_deref() {
            Some(dir) => {
                let store = SkillStore::open(dir)
                    .map_err(|error| GatewayError::Configuration(error.to_string()))?;
                Some(RegistryServer::new(Arc::new(store)))
            }
            None => None,
        };

        let sessions = Arc::new(SessionManager::new(
            settings.session_cap,
            Duration::from_secs(settings.session_ttl_secs),
        ));

        let state = Arc::new(GatewayState {
            settings,
            stack: tokio::sync::Mutex::new(stack),
            stack_path,
            router,
            sessions,
            policy,
            logs,
            registry,
            timeouts,
            shutdown: CancellationToken::new(),
            started_at: Utc::now(),
        });

        // Progressive disclosure: the registry joins the catalog only if
        // it already has content.
        api::sync_registry(&state).await;

        Ok(Self {
            state,
            publish_rx: Some(publish_rx),
        })
    }

    pub fn state(&self) -> Arc<GatewayState> {
        Arc::clone(&self.state)
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.state.shutdown.clone()
    }

    #[cfg(test)]
    pub(crate) fn take_publish_rx(&mut self) -> Option<mpsc::UnboundedReceiver<()>> {
        self.publish_rx.take()
    }

    /// Serve until the shutdown token fires, then wind down: stop
    /// accepting, broadcast `shutdown`, wait out the grace period, close
    /// upstreams, stop the monitor.
    pub async fn run(mut self, listener: tokio::net::TcpListener) -> Result<(), GatewayError> {
        let state = self.state;
        let shutdown = state.shutdown.clone();

        let Some(mut publish_rx) = self.publish_rx.take() else {
            return Err(GatewayError::Internal("gateway already running".to_string()));
        };
        let fanout = {
            let sessions = Arc::clone(&state.sessions);
            let cancel = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        event = publish_rx.recv() => match event {
                            Some(()) => sessions.broadcast_list_changed(),
                            None => break,
                        }
                    }
                }
            })
        };

        let health = spawn_health_monitor(
            Arc::clone(&state.router),
            Duration::from_secs(state.settings.health_interval_secs),
            shutdown.clone(),
        );
        let sweeper = state.sessions.spawn_sweeper(SWEEP_INTERVAL, shutdown.clone());

        let app = facade::build_app(Arc::clone(&state));
        let server = {
            let cancel = shutdown.clone();
            tokio::spawn(async move {
                axum::serve(listener, app)
                    .with_graceful_shutdown(cancel.cancelled_owned())
                    .await
            })
        };

        shutdown.cancelled().await;
        tracing::info!("gateway shutting down");

        // Sessions close first so streaming responses finish and the
        // server can complete its graceful shutdown.
        state
            .sessions
            .shutdown_all(Duration::from_secs(state.settings.shutdown_grace_secs))
            .await;

        let served = server
            .await
            .map_err(|error| GatewayError::Internal(error.to_string()))?;
        if let Err(error) = served {
            return Err(GatewayError::Internal(error.to_string()));
        }

        for client in state.router.clients_snapshot().await {
            client.shutdown().await;
        }

        let _ = health.await;
        let _ = sweeper.await;
        fanout.abort();
        let _ = fanout.await;

        tracing::info!("gateway stopped");
        Ok(())
    }
}

async fn connect_upstream(client: &Arc<UpstreamClient>) {
    if let Err(error) = client.initialize().await {
        tracing::warn!(server = %client.name(), error = %error, "upstream failed to initialize");
        return;
    }
    if let Err(error) = client.refresh_tools().await {
        tracing::warn!(server = %client.name(), error = %error, "initial tool fetch failed");
    }
}
