use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal;
use tracing::{info, warn};

use crate::bus::{BusClient, MessageBus};
use crate::config::Config;
use crate::gateway_server::GatewayServer;
use crate::router::TopicRouter;

/// Wires the bus client, router and websocket server together for `run`.
pub struct GatewayRuntime {
    config: Config,
}

impl GatewayRuntime {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    pub async fn run(self) -> Result<()> {
        info!(
            "starting gateway (broker={}:{}, bind={}, base_path={}, queue={}, retained={})",
            self.config.mqtt.host,
            self.config.mqtt.port,
            self.config.server.bind,
            self.config.server.base_path,
            self.config.server.outbound_queue_capacity,
            self.config.mqtt.deliver_retained
        );

        let bus = Arc::new(BusClient::connect(&self.config.mqtt).await.with_context(|| {
            format!(
                "failed connecting to MQTT broker {}:{}",
                self.config.mqtt.host, self.config.mqtt.port
            )
        })?);
        let bus_dyn: Arc<dyn MessageBus> = bus.clone();
        let router = TopicRouter::new(bus_dyn.clone(), self.config.server.site_ids.clone());
        router
            .start(&self.config.topics)
            .await
            .context("failed subscribing Hermes event topics")?;

        let server = GatewayServer::new(self.config.server.clone(), router.clone(), bus_dyn);
        let result = server
            .run_until(async {
                match signal::ctrl_c().await {
                    Ok(()) => info!("received ctrl-c, shutting down"),
                    Err(err) => {
                        warn!("ctrl-c handler unavailable: {err}");
                        std::future::pending::<()>().await;
                    }
                }
            })
            .await;

        router.stop().await;
        bus.shutdown().await;
        result
    }
}
