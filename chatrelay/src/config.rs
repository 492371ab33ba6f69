//! Server configuration.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::ValueEnum;

use crate::provider::{EchoProducer, OpenAiProducer, Provider};
use crate::relay::{DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_SINK_CAPACITY, MIN_HEARTBEAT_INTERVAL};

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 3001;

/// Which upstream produces chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum ProviderKind {
    /// OpenAI-compatible chat completions API
    #[default]
    Openai,
    /// Offline echo of the last user message
    Echo,
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub host: String,
    pub port: u16,
    pub heartbeat_interval: Duration,
    pub sink_capacity: usize,
    pub provider: ProviderKind,
    pub api_key: Option<String>,
    pub api_base: String,
    pub default_model: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            sink_capacity: DEFAULT_SINK_CAPACITY,
            provider: ProviderKind::default(),
            api_key: None,
            api_base: crate::provider::DEFAULT_API_BASE.to_string(),
            default_model: crate::provider::DEFAULT_MODEL.to_string(),
        }
    }
}

impl RelayConfig {
    #[must_use]
    pub fn with_addr(mut self, host: impl Into<String>, port: u16) -> Self {
        self.host = host.into();
        self.port = port;
        self
    }

    #[must_use]
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval.max(MIN_HEARTBEAT_INTERVAL);
        self
    }

    #[must_use]
    pub fn with_sink_capacity(mut self, capacity: usize) -> Self {
        self.sink_capacity = capacity;
        self
    }

    #[must_use]
    pub fn with_provider(mut self, provider: ProviderKind) -> Self {
        self.provider = provider;
        self
    }

    #[must_use]
    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key.filter(|k| !k.trim().is_empty());
        self
    }

    #[must_use]
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    #[must_use]
    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = model.into();
        self
    }

    pub fn socket_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid listen address {}:{}", self.host, self.port))
    }

    /// Build the configured upstream.
    pub fn build_provider(&self) -> Provider {
        match self.provider {
            ProviderKind::Echo => {
                Provider::new(EchoProducer::new().with_delay(Duration::from_millis(40)))
            }
            ProviderKind::Openai => Provider::new(
                OpenAiProducer::new(self.api_key.clone())
                    .with_api_base(&self.api_base)
                    .with_default_model(&self.default_model),
            ),
        }
    }
}
