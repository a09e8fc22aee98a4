// ABOUTME: HTTP and WebSocket server for seqcast: per-client sessions with replay-or-snapshot resume.
// ABOUTME: Also hosts the env configuration and the concrete auth and snapshot collaborators.

pub mod app_state;
pub mod auth;
pub mod config;
pub mod connection;
pub mod resolver;
pub mod routes;
pub mod snapshot;
pub mod ws;

pub use app_state::{AppState, SharedState};
pub use auth::StaticTokenAuthenticator;
pub use config::{ConfigError, SeqcastConfig, TokenGrant, default_home};
pub use connection::{
    Connection, ConnectionContext, ConnectionEnd, ConnectionInfo, ConnectionRegistry,
    ConnectionSettings, ConnectionState, Inbound,
};
pub use resolver::{ReplayOutcome, ReplayResolver, ResolveError};
pub use routes::create_router;
pub use snapshot::HttpSnapshotProvider;
