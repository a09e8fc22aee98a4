// ABOUTME: Shared application state for the seqcast HTTP server.
// ABOUTME: Holds the log reader, publish bus, connection registry, collaborators, and the shutdown signal.

use std::sync::Arc;
use std::time::Duration;

use seqcast_core::{Authenticator, PublishBus, ReplayPolicy, SnapshotProvider};
use seqcast_store::EventLogReader;
use tokio::sync::watch;

use crate::connection::{ConnectionContext, ConnectionRegistry, ConnectionSettings};
use crate::resolver::ReplayResolver;

/// Shared application state accessible by all Axum handlers.
pub struct AppState {
    pub reader: EventLogReader,
    pub bus: Arc<PublishBus>,
    pub registry: ConnectionRegistry,
    pub authenticator: Arc<dyn Authenticator>,
    pub resolver: ReplayResolver,
    pub settings: ConnectionSettings,
    shutdown: watch::Sender<bool>,
}

/// Type alias for the Arc-wrapped state used with Axum's State extractor.
pub type SharedState = Arc<AppState>;

impl AppState {
    pub fn new(
        reader: EventLogReader,
        bus: Arc<PublishBus>,
        authenticator: Arc<dyn Authenticator>,
        snapshots: Arc<dyn SnapshotProvider>,
        policy: ReplayPolicy,
        snapshot_timeout: Duration,
        settings: ConnectionSettings,
    ) -> Self {
        let resolver = ReplayResolver::new(reader.clone(), snapshots, policy, snapshot_timeout);
        let (shutdown, _) = watch::channel(false);
        Self {
            reader,
            bus,
            registry: ConnectionRegistry::default(),
            authenticator,
            resolver,
            settings,
            shutdown,
        }
    }

    /// Everything a new connection task needs.
    pub fn connection_context(&self) -> ConnectionContext {
        ConnectionContext {
            authenticator: Arc::clone(&self.authenticator),
            resolver: self.resolver.clone(),
            bus: Arc::clone(&self.bus),
            registry: self.registry.clone(),
            settings: self.settings,
            shutdown: self.shutdown.subscribe(),
        }
    }

    /// Receiver that flips to `true` when the server begins shutting down.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Close every connection with `SERVER_SHUTDOWN` and stop fan-out.
    pub fn shutdown(&self) {
        tracing::info!(connections = self.registry.count(), "shutting down connections");
        self.shutdown.send_replace(true);
        self.bus.close();
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }
}
