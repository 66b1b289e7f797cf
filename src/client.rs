// Copyright 2020 Joyent, Inc.

use std::sync::Arc;

use slog::{o, Drain, Logger};

use crate::config::ClientConfig;
use crate::distribution::{Distribution, NoopDistribution};
use crate::resolver::{HostResolver, SystemResolver};
use crate::sasl::SaslAuthenticator;
use crate::server::{Server, ServerName};

/// The root a set of server instances hangs off.
///
/// A `Client` owns the shared [`ClientConfig`], the logger, and the
/// behavior hooks: the [`HostResolver`] used for lookups, the
/// [`Distribution`] invoked when a server is auto-ejected, and an optional
/// [`SaslAuthenticator`]. Server instances hold no back-reference; the
/// client drives their connect attempts and outlives every call.
///
/// The connect entry points live in an `impl` block next to the rest of
/// the connect machinery; see [`Client::connect`].
pub struct Client {
    pub(crate) config: ClientConfig,
    pub(crate) log: Logger,
    pub(crate) resolver: Arc<dyn HostResolver>,
    pub(crate) distribution: Box<dyn Distribution>,
    pub(crate) sasl: Option<Arc<dyn SaslAuthenticator>>,
    pub(crate) last_disconnected: Option<ServerName>,
}

impl Client {
    pub fn new(config: ClientConfig) -> Self {
        let log = config
            .log
            .clone()
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));

        Client {
            config,
            log,
            resolver: Arc::new(SystemResolver),
            distribution: Box::new(NoopDistribution),
            sasl: None,
            last_disconnected: None,
        }
    }

    /// Replace the system resolver, e.g. with a canned lookup for tests or
    /// a service-discovery client.
    pub fn with_resolver(mut self, resolver: Arc<dyn HostResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Install the distribution recomputation hook invoked on auto-eject.
    pub fn with_distribution(mut self, distribution: Box<dyn Distribution>) -> Self {
        self.distribution = distribution;
        self
    }

    /// Install a SASL authenticator run after every successful TCP connect.
    pub fn with_sasl(mut self, sasl: Arc<dyn SaslAuthenticator>) -> Self {
        self.sasl = Some(sasl);
        self
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// The most recent server a connect attempt failed against, as
    /// `hostname:port`.
    pub fn last_disconnected_host(&self) -> Option<&str> {
        self.last_disconnected.as_deref()
    }

    /// Record a server as the most recent disconnect for user retrieval.
    pub(crate) fn note_disconnect(&mut self, server: &Server) {
        self.last_disconnected = Some(server.name());
    }
}
