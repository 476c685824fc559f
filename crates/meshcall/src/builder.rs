//! # Dispatcher Builder
//!
//! Provides a fluent API for configuring and assembling a [`Dispatcher`].

use std::sync::Arc;
use std::time::Duration;

use crate::dispatcher::Dispatcher;
use crate::nodes::DEFAULT_QUARANTINE;
use crate::nodes::NodeRegistry;
use crate::pending::PendingCalls;
use crate::transport::Address;
use crate::transport::Transport;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    MissingTransport,
    MissingLocalAddress,
    ZeroTimeout,
    ZeroQuarantine,
    ZeroInflightLimit,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingTransport => write!(f, "A transport is required"),
            Self::MissingLocalAddress => write!(f, "A local address is required"),
            Self::ZeroTimeout => write!(f, "Default timeout must be non-zero"),
            Self::ZeroQuarantine => write!(f, "Quarantine window must be non-zero"),
            Self::ZeroInflightLimit => write!(f, "In-flight limit must be non-zero"),
        }
    }
}

impl std::error::Error for ConfigError {}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Tunables of a dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherConfig {
    /// Deadline of calls issued without an explicit timeout.
    pub default_timeout: Duration,
    /// How long a failed node is kept out of failover routing.
    pub quarantine: Duration,
    /// Upper bound on calls in flight; `None` is unbounded.
    pub max_inflight: Option<usize>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(30),
            quarantine: DEFAULT_QUARANTINE,
            max_inflight: None,
        }
    }
}

impl DispatcherConfig {
    pub fn validate(&self) -> Result<()> {
        if self.default_timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout);
        }
        if self.quarantine.is_zero() {
            return Err(ConfigError::ZeroQuarantine);
        }
        if self.max_inflight == Some(0) {
            return Err(ConfigError::ZeroInflightLimit);
        }
        Ok(())
    }
}

/// Fluent builder for a dispatcher.
///
/// A node registry passed with [`nodes`](Self::nodes) keeps its own quarantine
/// window; otherwise a fresh registry is created with the configured one.
#[derive(Default)]
pub struct DispatcherBuilder {
    local: Option<Address>,
    transport: Option<Arc<dyn Transport>>,
    nodes: Option<Arc<NodeRegistry>>,
    config: DispatcherConfig,
}

impl DispatcherBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn local_address(mut self, local: impl Into<Address>) -> Self {
        self.local = Some(local.into());
        self
    }

    pub fn transport(mut self, transport: impl Transport) -> Self {
        self.transport = Some(Arc::new(transport));
        self
    }

    pub fn shared_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn nodes(mut self, nodes: Arc<NodeRegistry>) -> Self {
        self.nodes = Some(nodes);
        self
    }

    pub fn config(mut self, config: DispatcherConfig) -> Self {
        self.config = config;
        self
    }

    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.config.default_timeout = timeout;
        self
    }

    pub fn quarantine(mut self, quarantine: Duration) -> Self {
        self.config.quarantine = quarantine;
        self
    }

    pub fn max_inflight(mut self, limit: usize) -> Self {
        self.config.max_inflight = Some(limit);
        self
    }

    pub fn build(self) -> Result<Dispatcher> {
        self.config.validate()?;
        let local = self.local.ok_or(ConfigError::MissingLocalAddress)?;
        let transport = self.transport.ok_or(ConfigError::MissingTransport)?;

        let nodes = self
            .nodes
            .unwrap_or_else(|| Arc::new(NodeRegistry::new(self.config.quarantine)));
        let pending = match self.config.max_inflight {
            Some(limit) => PendingCalls::with_limit(limit),
            None => PendingCalls::new(),
        };

        Ok(Dispatcher::from_parts(local, transport, pending, nodes, self.config))
    }
}
