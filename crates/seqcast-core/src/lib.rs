// ABOUTME: Core library for seqcast: event envelope, wire protocol, publish bus, and replay decisions.
// ABOUTME: Also defines the collaborator traits (authentication, snapshots) shared by every other crate.

pub mod auth;
pub mod bus;
pub mod error;
pub mod event;
pub mod protocol;
pub mod replay;
pub mod snapshot;
pub mod testing;

pub use auth::{AuthError, Authenticator, Identity};
pub use bus::{PublishBus, PublishReport, Subscription};
pub use error::{ErrorKind, ReplayGapError};
pub use event::{Event, EventPayload, Origin, OriginKey, SourceEvent, Watermark};
pub use protocol::{ClientMessage, CloseReason, ProtocolError, ServerMessage};
pub use replay::{ReplayDecision, ReplayPolicy, SnapshotCause, decide};
pub use snapshot::{Snapshot, SnapshotError, SnapshotProvider, SnapshotRequest};
