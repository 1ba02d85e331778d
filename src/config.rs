use serde::{Deserialize, Serialize};
use std::path::Path;
use url::Url;

use crate::session::SessionOptions;
use crate::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Address the engine acceptor binds to.
    pub engine_host: String,
    /// Port debugger engines connect to; `None` disables the acceptor.
    pub engine_port: Option<u16>,
    /// Address the relay hub endpoint binds to.
    pub relay_host: String,
    /// Port relay clients connect to; `None` disables the relay endpoint.
    pub relay_port: Option<u16>,
    /// Path under which the hub serves its WebSocket endpoint.
    pub namespace: String,
    /// When set, only engine connections from these addresses are accepted.
    pub allowed_addresses: Option<Vec<String>>,
    /// When set, only handshakes carrying one of these idekeys are accepted.
    pub allowed_ide_keys: Option<Vec<String>>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            engine_host: "127.0.0.1".to_string(),
            engine_port: Some(9000),
            relay_host: "127.0.0.1".to_string(),
            relay_port: Some(9021),
            namespace: "/dbgp-proxy".to_string(),
            allowed_addresses: None,
            allowed_ide_keys: None,
        }
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path.as_ref().to_string_lossy().as_ref()))
            .build()?;

        let config: Config = settings.try_deserialize()?;
        Ok(config)
    }

    pub fn engine_addr(&self) -> Option<String> {
        self.engine_port
            .map(|port| format!("{}:{}", self.engine_host, port))
    }

    pub fn relay_addr(&self) -> Option<String> {
        self.relay_port
            .map(|port| format!("{}:{}", self.relay_host, port))
    }

    /// The WebSocket URL a relay consumer dials to reach the hub.
    pub fn relay_endpoint(&self) -> Result<Option<Url>> {
        match self.relay_addr() {
            Some(addr) => {
                let url = Url::parse(&format!("ws://{}{}", addr, self.namespace))?;
                Ok(Some(url))
            }
            None => Ok(None),
        }
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            allowed_addresses: self.allowed_addresses.clone(),
            allowed_ide_keys: self.allowed_ide_keys.clone(),
        }
    }
}
