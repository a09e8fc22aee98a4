// ABOUTME: Per-client connection state machine: authentication, resume, live delivery, heartbeats, and backpressure.
// ABOUTME: One task per connection talks to the transport through an inbound channel and a bounded outbound queue.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use seqcast_core::{
    Authenticator, ClientMessage, CloseReason, Event, Identity, ProtocolError, PublishBus,
    ServerMessage, Subscription,
};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use ulid::Ulid;

use crate::resolver::{ReplayOutcome, ReplayResolver, ResolveError};

/// Inbound frames as the transport hands them over: parsed messages or the
/// reason a frame could not be parsed.
pub type Inbound = Result<ClientMessage, ProtocolError>;

/// Timeouts and sizes governing every connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionSettings {
    pub auth_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub queue_capacity: usize,
    pub replay_batch: usize,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            auth_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(15),
            heartbeat_timeout: Duration::from_secs(30),
            queue_capacity: 1024,
            replay_batch: 500,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Unauthenticated,
    Authenticated,
    Subscribed,
    Closed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Unauthenticated => "UNAUTHENTICATED",
            ConnectionState::Authenticated => "AUTHENTICATED",
            ConnectionState::Subscribed => "SUBSCRIBED",
            ConnectionState::Closed => "CLOSED",
        }
    }
}

/// How a connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEnd {
    /// The server closed it with a reason.
    Closed(CloseReason),
    /// The client went away.
    Disconnected,
}

impl ConnectionEnd {
    pub fn reason(&self) -> Option<CloseReason> {
        match self {
            ConnectionEnd::Closed(reason) => Some(*reason),
            ConnectionEnd::Disconnected => None,
        }
    }
}

/// Public view of a live connection.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub id: Ulid,
    pub identity: Option<String>,
    pub state: ConnectionState,
    pub last_delivered: u64,
    pub opened_at: DateTime<Utc>,
}

/// Live connections by id.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    inner: Arc<Mutex<HashMap<Ulid, ConnectionInfo>>>,
}

impl ConnectionRegistry {
    fn lock(&self) -> MutexGuard<'_, HashMap<Ulid, ConnectionInfo>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn register(&self, id: Ulid) -> Registration {
        self.lock().insert(
            id,
            ConnectionInfo {
                id,
                identity: None,
                state: ConnectionState::Unauthenticated,
                last_delivered: 0,
                opened_at: Utc::now(),
            },
        );
        Registration {
            registry: self.clone(),
            id,
        }
    }

    fn update(&self, id: Ulid, f: impl FnOnce(&mut ConnectionInfo)) {
        if let Some(info) = self.lock().get_mut(&id) {
            f(info);
        }
    }

    pub fn count(&self) -> usize {
        self.lock().len()
    }

    /// Connections sorted by open time.
    pub fn list(&self) -> Vec<ConnectionInfo> {
        let mut all: Vec<ConnectionInfo> = self.lock().values().cloned().collect();
        all.sort_by_key(|c| c.id);
        all
    }
}

/// Removes a connection from the registry when its task ends, however it
/// ends.
struct Registration {
    registry: ConnectionRegistry,
    id: Ulid,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.lock().remove(&self.id);
    }
}

/// Everything a connection needs from the rest of the server.
#[derive(Clone)]
pub struct ConnectionContext {
    pub authenticator: Arc<dyn Authenticator>,
    pub resolver: ReplayResolver,
    pub bus: Arc<PublishBus>,
    pub registry: ConnectionRegistry,
    pub settings: ConnectionSettings,
    pub shutdown: watch::Receiver<bool>,
}

/// Why the session loop stopped.
enum Stop {
    Close(CloseReason),
    Disconnected,
}

struct Heartbeat {
    next_nonce: u64,
    unacked_since: Option<Instant>,
}

/// A single client session. Create one per transport and call
/// [`Connection::run`].
pub struct Connection {
    id: Ulid,
    ctx: ConnectionContext,
    outbound: mpsc::Sender<ServerMessage>,
    state: ConnectionState,
    identity: Option<Identity>,
    subscription: Option<Subscription>,
    cursor: u64,
    heartbeat: Heartbeat,
}

impl Connection {
    pub fn new(ctx: ConnectionContext, outbound: mpsc::Sender<ServerMessage>) -> Self {
        Self {
            id: Ulid::new(),
            ctx,
            outbound,
            state: ConnectionState::Unauthenticated,
            identity: None,
            subscription: None,
            cursor: 0,
            heartbeat: Heartbeat {
                next_nonce: 1,
                unacked_since: None,
            },
        }
    }

    pub fn id(&self) -> Ulid {
        self.id
    }

    /// Drive the session until it closes. The final `close` message, when
    /// the queue has room for it, is the last thing written to `outbound`.
    pub async fn run(mut self, mut inbound: mpsc::Receiver<Inbound>) -> ConnectionEnd {
        let _registration = self.ctx.registry.register(self.id);
        tracing::info!(connection_id = %self.id, "connection opened");

        let stop = match self.authenticate(&mut inbound).await {
            Ok(()) => self.session(&mut inbound).await,
            Err(stop) => stop,
        };

        self.subscription = None;
        self.state = ConnectionState::Closed;

        let end = match stop {
            Stop::Close(reason) => {
                let _ = self.outbound.try_send(ServerMessage::Close {
                    reason_code: reason,
                });
                ConnectionEnd::Closed(reason)
            }
            Stop::Disconnected => ConnectionEnd::Disconnected,
        };

        match end {
            ConnectionEnd::Closed(reason @ CloseReason::ServerShutdown) => {
                tracing::info!(connection_id = %self.id, %reason, "connection closed");
            }
            ConnectionEnd::Closed(reason) => {
                tracing::warn!(
                    connection_id = %self.id,
                    identity = ?self.identity,
                    %reason,
                    last_delivered = self.cursor,
                    "connection closed"
                );
            }
            ConnectionEnd::Disconnected => {
                tracing::info!(connection_id = %self.id, last_delivered = self.cursor, "client disconnected");
            }
        }
        end
    }

    fn set_state(&mut self, state: ConnectionState) {
        self.state = state;
        let identity = self.identity.as_ref().map(|i| i.to_string());
        let cursor = self.cursor;
        self.ctx.registry.update(self.id, |info| {
            info.state = state;
            info.identity = identity;
            info.last_delivered = cursor;
        });
    }

    /// Move the delivery cursor and publish it to the registry.
    fn advance(&mut self, cursor: u64) {
        self.cursor = cursor;
        self.ctx.registry.update(self.id, |info| info.last_delivered = cursor);
    }

    fn send(&self, message: ServerMessage) -> Result<(), Stop> {
        match self.outbound.try_send(message) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(Stop::Close(CloseReason::QueueOverflow)),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(Stop::Disconnected),
        }
    }

    fn protocol_error(&self, err: &ProtocolError) -> Stop {
        tracing::warn!(connection_id = %self.id, error = %err, state = self.state.as_str(), "protocol violation");
        Stop::Close(CloseReason::ProtocolError)
    }

    fn unexpected(&self, message: &ClientMessage) -> Stop {
        self.protocol_error(&ProtocolError::UnexpectedMessage {
            message: message.name(),
            state: self.state.as_str(),
        })
    }

    async fn authenticate(&mut self, inbound: &mut mpsc::Receiver<Inbound>) -> Result<(), Stop> {
        let mut shutdown = self.ctx.shutdown.clone();
        if *shutdown.borrow_and_update() {
            return Err(Stop::Close(CloseReason::ServerShutdown));
        }
        let deadline = tokio::time::sleep(self.ctx.settings.auth_timeout);
        tokio::pin!(deadline);

        let credential = tokio::select! {
            _ = &mut deadline => return Err(Stop::Close(CloseReason::AuthTimeout)),
            _ = shutdown.changed() => return Err(Stop::Close(CloseReason::ServerShutdown)),
            msg = inbound.recv() => match msg {
                None => return Err(Stop::Disconnected),
                Some(Err(err)) => return Err(self.protocol_error(&err)),
                Some(Ok(ClientMessage::Authenticate { credential })) => credential,
                Some(Ok(other)) => return Err(self.unexpected(&other)),
            },
        };

        let result = tokio::select! {
            _ = &mut deadline => return Err(Stop::Close(CloseReason::AuthTimeout)),
            _ = shutdown.changed() => return Err(Stop::Close(CloseReason::ServerShutdown)),
            result = self.ctx.authenticator.authenticate(&credential) => result,
        };

        match result {
            Ok(identity) => {
                tracing::info!(connection_id = %self.id, %identity, "authenticated");
                self.send(ServerMessage::AuthResult {
                    ok: true,
                    identity: Some(identity.to_string()),
                    error: None,
                })?;
                self.identity = Some(identity);
                self.set_state(ConnectionState::Authenticated);
                Ok(())
            }
            Err(err) => {
                tracing::warn!(connection_id = %self.id, error = %err, "authentication rejected");
                self.send(ServerMessage::AuthResult {
                    ok: false,
                    identity: None,
                    error: Some(err.code().to_string()),
                })?;
                Err(Stop::Close(CloseReason::AuthFailed))
            }
        }
    }

    /// Main loop once authenticated.
    async fn session(&mut self, inbound: &mut mpsc::Receiver<Inbound>) -> Stop {
        let mut shutdown = self.ctx.shutdown.clone();
        let interval = self.ctx.settings.heartbeat_interval;
        let mut probes = tokio::time::interval_at(Instant::now() + interval, interval);
        probes.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            if *shutdown.borrow_and_update() {
                return Stop::Close(CloseReason::ServerShutdown);
            }
            let heartbeat_deadline = self
                .heartbeat
                .unacked_since
                .map(|since| since + self.ctx.settings.heartbeat_timeout);

            let step = tokio::select! {
                _ = shutdown.changed() => Err(Stop::Close(CloseReason::ServerShutdown)),
                _ = sleep_until_opt(heartbeat_deadline) => Err(Stop::Close(CloseReason::HeartbeatTimeout)),
                _ = probes.tick() => self.probe(),
                msg = inbound.recv() => match msg {
                    None => Err(Stop::Disconnected),
                    Some(Err(err)) => Err(self.protocol_error(&err)),
                    Some(Ok(msg)) => self.handle_message(msg).await,
                },
                event = next_live(&mut self.subscription) => self.handle_live(event).await,
            };

            if let Err(stop) = step {
                return stop;
            }
        }
    }

    fn probe(&mut self) -> Result<(), Stop> {
        let nonce = self.heartbeat.next_nonce;
        self.heartbeat.next_nonce += 1;
        if self.heartbeat.unacked_since.is_none() {
            self.heartbeat.unacked_since = Some(Instant::now());
        }
        self.send(ServerMessage::HeartbeatProbe { nonce })
    }

    async fn handle_message(&mut self, msg: ClientMessage) -> Result<(), Stop> {
        match (self.state, msg) {
            (_, ClientMessage::HeartbeatAck { .. }) => {
                self.heartbeat.unacked_since = None;
                Ok(())
            }
            (ConnectionState::Authenticated, ClientMessage::Resume { last_sequence_id }) => {
                self.resume(last_sequence_id.unwrap_or(0)).await
            }
            (ConnectionState::Subscribed, ClientMessage::Unsubscribe) => {
                if let Some(sub) = self.subscription.take() {
                    self.ctx.bus.unsubscribe(sub.id());
                }
                tracing::debug!(connection_id = %self.id, cursor = self.cursor, "unsubscribed");
                self.set_state(ConnectionState::Authenticated);
                Ok(())
            }
            (_, other) => Err(self.unexpected(&other)),
        }
    }

    /// Subscribe first, then resolve, so any event committed after the
    /// resolver's head read is already queued on the subscription.
    async fn resume(&mut self, last_seen: u64) -> Result<(), Stop> {
        let subscription = self.ctx.bus.subscribe();
        tracing::info!(connection_id = %self.id, last_seen, "resume requested");

        let resolved = self.resolve(last_seen).await;
        let resolved = match resolved {
            Ok(resolved) => resolved,
            Err(stop) => {
                self.ctx.bus.unsubscribe(subscription.id());
                return Err(stop);
            }
        };
        match resolved {
            Ok(outcome) => {
                self.deliver(outcome)?;
                self.subscription = Some(subscription);
                self.set_state(ConnectionState::Subscribed);
                Ok(())
            }
            Err(err) => {
                self.ctx.bus.unsubscribe(subscription.id());
                self.report_resume_error(&err)
            }
        }
    }

    /// Run the resolver, abandoning it if the client goes away or the
    /// server shuts down first.
    async fn resolve(&self, last_seen: u64) -> Result<Result<ReplayOutcome, ResolveError>, Stop> {
        tokio::select! {
            _ = self.outbound.closed() => Err(Stop::Disconnected),
            _ = wait_for_shutdown(self.ctx.shutdown.clone()) => Err(Stop::Close(CloseReason::ServerShutdown)),
            outcome = self.ctx.resolver.resolve(last_seen) => Ok(outcome),
        }
    }

    fn report_resume_error(&mut self, err: &ResolveError) -> Result<(), Stop> {
        tracing::warn!(
            connection_id = %self.id,
            error = %err,
            kind = err.kind().as_str(),
            "resume failed"
        );
        self.send(ServerMessage::ResumeError {
            reason: err.to_string(),
            retryable: true,
        })?;
        self.set_state(ConnectionState::Authenticated);
        Ok(())
    }

    fn deliver(&mut self, outcome: ReplayOutcome) -> Result<(), Stop> {
        match outcome {
            ReplayOutcome::Live { head } => {
                self.advance(head);
            }
            ReplayOutcome::Incremental {
                to_inclusive,
                events,
                ..
            } => {
                self.send_batches(events)?;
                self.advance(to_inclusive);
            }
            ReplayOutcome::Snapshot {
                cause, snapshot, ..
            } => {
                tracing::info!(
                    connection_id = %self.id,
                    ?cause,
                    at_seq = snapshot.at_sequence_id,
                    "resyncing client from snapshot"
                );
                self.send(ServerMessage::Snapshot {
                    payload: snapshot.payload,
                    at_seq: snapshot.at_sequence_id,
                })?;
                self.advance(snapshot.at_sequence_id);
            }
        }
        Ok(())
    }

    fn send_batches(&mut self, events: Vec<Arc<Event>>) -> Result<(), Stop> {
        let batch = self.ctx.settings.replay_batch.max(1);
        for chunk in events.chunks(batch) {
            let (Some(first), Some(last)) = (chunk.first(), chunk.last()) else {
                continue;
            };
            let (from_seq, to_seq) = (first.sequence_id, last.sequence_id);
            self.send(ServerMessage::ReplayBatch {
                events: chunk.to_vec(),
                from_seq,
                to_seq,
            })?;
        }
        Ok(())
    }

    async fn handle_live(&mut self, event: Option<Arc<Event>>) -> Result<(), Stop> {
        let Some(event) = event else {
            let overflowed = self
                .subscription
                .as_ref()
                .is_some_and(|s| s.overflowed());
            if overflowed {
                return self.resubscribe().await;
            }
            return Err(Stop::Close(CloseReason::ServerShutdown));
        };

        let seq = event.sequence_id;
        if seq <= self.cursor {
            return Ok(());
        }
        if seq > self.cursor + 1 {
            tracing::debug!(connection_id = %self.id, cursor = self.cursor, seq, "gap in live stream, filling from log");
            self.catch_up(seq - 1).await?;
            if self.state != ConnectionState::Subscribed || seq <= self.cursor {
                return Ok(());
            }
        }

        self.send(ServerMessage::live(event))?;
        self.advance(seq);
        Ok(())
    }

    /// The bus detached this subscriber after its buffer filled. Subscribe
    /// again and read what was missed from the log, starting at the cursor.
    async fn resubscribe(&mut self) -> Result<(), Stop> {
        if let Some(old) = self.subscription.take() {
            self.ctx.bus.unsubscribe(old.id());
        }
        let subscription = self.ctx.bus.subscribe();
        tracing::debug!(connection_id = %self.id, cursor = self.cursor, "live stream fell behind, catching up from log");

        let resolved = self.resolve(self.cursor).await;
        let resolved = match resolved {
            Ok(resolved) => resolved,
            Err(stop) => {
                self.ctx.bus.unsubscribe(subscription.id());
                return Err(stop);
            }
        };
        match resolved {
            Ok(outcome) => {
                self.deliver(outcome)?;
                self.subscription = Some(subscription);
                Ok(())
            }
            Err(err) => {
                self.ctx.bus.unsubscribe(subscription.id());
                self.report_resume_error(&err)
            }
        }
    }

    /// Bring the cursor up to `upto` from the log, or resync with a
    /// snapshot if that part of the log has been pruned.
    async fn catch_up(&mut self, upto: u64) -> Result<(), Stop> {
        let cursor = self.cursor;
        let filled = tokio::select! {
            _ = self.outbound.closed() => return Err(Stop::Disconnected),
            _ = wait_for_shutdown(self.ctx.shutdown.clone()) => return Err(Stop::Close(CloseReason::ServerShutdown)),
            filled = self.ctx.resolver.fill_gap(cursor, upto) => filled,
        };

        let err = match filled {
            Ok(events) => {
                self.send_batches(events)?;
                self.advance(upto);
                return Ok(());
            }
            Err(err) => err,
        };

        tracing::info!(connection_id = %self.id, error = %err, "gap fill failed, re-resolving");
        match self.resolve(cursor).await? {
            Ok(outcome) => self.deliver(outcome),
            Err(err) => {
                if let Some(sub) = self.subscription.take() {
                    self.ctx.bus.unsubscribe(sub.id());
                }
                self.report_resume_error(&err)
            }
        }
    }
}

async fn wait_for_shutdown(mut shutdown: watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn next_live(subscription: &mut Option<Subscription>) -> Option<Arc<Event>> {
    match subscription {
        Some(sub) => sub.recv().await,
        None => std::future::pending().await,
    }
}
