use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};

use crate::client::{Client, ClientRegistry, SessionSource};
use crate::config::Config;
use crate::hub::ProxyHub;
use crate::{Error, Result};

/// Composes the engine-acceptor client and the relay hub into one runnable
/// process: engines connect on one port, viewers on the other.
pub struct DbgpProxyServer {
    registry: Arc<ClientRegistry>,
    engine_client: Arc<Client>,
    hub: ProxyHub,
    relay_addr: String,
}

impl DbgpProxyServer {
    pub fn new(config: Config) -> Result<Self> {
        let engine_addr = config
            .engine_addr()
            .ok_or_else(|| Error::configuration("an engine accept port is required"))?;
        let relay_addr = config
            .relay_addr()
            .ok_or_else(|| Error::configuration("a relay port is required"))?;

        let registry = Arc::new(ClientRegistry::new());
        let engine_client = Arc::new(Client::new(
            &registry,
            SessionSource::EngineAcceptor {
                addr: engine_addr,
                options: config.session_options(),
            },
        ));
        let hub = ProxyHub::new(config.namespace.clone(), config.engine_host.clone());
        hub.listen(&engine_client);

        Ok(Self {
            registry,
            engine_client,
            hub,
            relay_addr,
        })
    }

    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    pub fn hub(&self) -> &ProxyHub {
        &self.hub
    }

    pub async fn run(self) -> Result<()> {
        info!("Starting dbgproxy-rs");

        self.engine_client.connect().await?;

        let listener = tokio::net::TcpListener::bind(&self.relay_addr).await?;
        info!(addr = %self.relay_addr, "relay hub listening");
        let app = self.hub.router();
        let relay_handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                error!("Relay endpoint error: {}", e);
            }
        });

        let shutdown_handle = tokio::spawn(async {
            if let Err(e) = signal::ctrl_c().await {
                error!("Failed to listen for Ctrl+C: {}", e);
            }
        });

        tokio::select! {
            _ = relay_handle => {
                info!("Relay endpoint shut down");
            }
            _ = shutdown_handle => {
                info!("Shutting down gracefully");
            }
        }

        self.engine_client.disconnect().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_creation() {
        let server = DbgpProxyServer::new(Config::default());
        assert!(server.is_ok());
    }

    #[test]
    fn test_server_requires_engine_port() {
        let config = Config {
            engine_port: None,
            ..Config::default()
        };
        assert!(matches!(
            DbgpProxyServer::new(config),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_server_requires_relay_port() {
        let config = Config {
            relay_port: None,
            ..Config::default()
        };
        assert!(matches!(
            DbgpProxyServer::new(config),
            Err(Error::Configuration(_))
        ));
    }
}
