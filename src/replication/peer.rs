// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication sessions between two hosts.
//!
//! A [`PeerSession`] runs the bootstrap handshake over a [`WireChannel`],
//! registers a [`ReplicationHandler`] for the outbound direction and spawns
//! an inbound pump applying the counterpart's entries. A [`PeerLink`]
//! re-establishes sessions through a [`Connector`] whenever one ends.
//!
//! # Session Lifecycle
//!
//! ```text
//! Idle ──→ Bootstrapping ──→ Streaming ──→ Disconnected
//!               ↑                               │
//!               └────────── (PeerLink) ─────────┘
//! ```
//!
//! # Bootstrap
//!
//! Each side reports the last modification time it has received from the
//! other; the counterpart marks everything at or after that time dirty.
//! Iterators survive disconnects, so whatever was not sent before the
//! outage is sent after it. Delivery is at least once; the conflict rule
//! makes repeats harmless.

use super::{EventLoop, ReplicationEngine, ReplicationHandler};
use crate::config::ReplicationSettings;
use crate::cursor::CursorStore;
use crate::error::{Result, TreeError};
use crate::metrics;
use crate::resilience::{RateLimitConfig, RetryConfig};
use crate::wire::{Frame, WireChannel, WireMessage};
use futures::future::BoxFuture;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};

/// Subscription id used by replication frames.
const REPLICATION_CID: u64 = 0;

/// State of a replication session or link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// Not yet connected.
    Idle,
    /// Handshake in progress.
    Bootstrapping,
    /// Entries flowing both ways.
    Streaming,
    /// Session ended; iterators keep their dirty entries.
    Disconnected,
}

impl PeerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PeerState::Idle => "idle",
            PeerState::Bootstrapping => "bootstrapping",
            PeerState::Streaming => "streaming",
            PeerState::Disconnected => "disconnected",
        }
    }
}

impl std::fmt::Display for PeerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-session tuning.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Content-stream-path stamped on replication frames.
    pub csp: String,
    /// Persists received catch-up markers when set.
    pub cursor: Option<Arc<CursorStore>>,
    pub handshake_timeout: Duration,
    pub max_entries_per_action: usize,
    pub rate_limit: Option<RateLimitConfig>,
}

impl SessionOptions {
    pub fn new(csp: impl Into<String>) -> Self {
        Self {
            csp: csp.into(),
            cursor: None,
            handshake_timeout: Duration::from_secs(5),
            max_entries_per_action: 64,
            rate_limit: None,
        }
    }

    /// Options for `csp` tuned by `settings`.
    pub fn from_settings(csp: impl Into<String>, settings: &ReplicationSettings) -> Self {
        Self {
            max_entries_per_action: settings.max_entries_per_action,
            rate_limit: settings.rate_limit_config(),
            ..Self::new(csp)
        }
    }

    pub fn with_cursor(mut self, cursor: Arc<CursorStore>) -> Self {
        self.cursor = Some(cursor);
        self
    }
}

async fn send(outbound: &mpsc::Sender<Frame>, frame: Frame) -> Result<()> {
    let kind = frame.message.kind();
    outbound
        .send(frame)
        .await
        .map_err(|_| TreeError::Handshake(format!("channel closed sending {}", kind)))
}

async fn recv(inbound: &mut mpsc::Receiver<Frame>, timeout: Duration, expecting: &str) -> Result<WireMessage> {
    match tokio::time::timeout(timeout, inbound.recv()).await {
        Ok(Some(frame)) => Ok(frame.message),
        Ok(None) => Err(TreeError::Handshake(format!("channel closed awaiting {}", expecting))),
        Err(_) => Err(TreeError::Handshake(format!("timed out awaiting {}", expecting))),
    }
}

fn unexpected(expecting: &str, got: &WireMessage) -> TreeError {
    TreeError::Handshake(format!("expected {}, got {}", expecting, got.kind()))
}

/// One live replication session with a remote host.
pub struct PeerSession {
    engine: Arc<ReplicationEngine>,
    remote_identifier: u8,
    state: Arc<watch::Sender<PeerState>>,
    caught_up: watch::Receiver<bool>,
    cancelled: Arc<AtomicBool>,
    pump: JoinHandle<()>,
}

impl PeerSession {
    /// Open a session as the connecting side.
    pub async fn initiate(
        engine: Arc<ReplicationEngine>,
        channel: WireChannel,
        event_loop: &EventLoop,
        options: SessionOptions,
    ) -> Result<Self> {
        let WireChannel { outbound, mut inbound } = channel;
        let local = engine.local_identifier();
        let csp = options.csp.clone();
        let timeout = options.handshake_timeout;

        send(&outbound, Frame::new(csp.clone(), REPLICATION_CID, WireMessage::Identifier { id: local })).await?;
        let remote = match recv(&mut inbound, timeout, "identifierReply").await? {
            WireMessage::IdentifierReply { id } => id,
            other => return Err(unexpected("identifierReply", &other)),
        };
        check_remote(local, remote)?;
        seed_from_cursor(&engine, remote, &options).await;

        send(
            &outbound,
            Frame::new(
                csp,
                REPLICATION_CID,
                WireMessage::Bootstrap {
                    id: local,
                    last_updated_time: engine.last_modification_time(remote),
                },
            ),
        )
        .await?;
        let from_time = match recv(&mut inbound, timeout, "bootstrap").await? {
            WireMessage::Bootstrap { id, last_updated_time } if id == remote => last_updated_time,
            other => return Err(unexpected("bootstrap", &other)),
        };

        Self::start_streaming(engine, remote, from_time, outbound, inbound, event_loop, options)
    }

    /// Open a session as the accepting side.
    pub async fn accept(
        engine: Arc<ReplicationEngine>,
        channel: WireChannel,
        event_loop: &EventLoop,
        options: SessionOptions,
    ) -> Result<Self> {
        let WireChannel { outbound, mut inbound } = channel;
        let local = engine.local_identifier();
        let csp = options.csp.clone();
        let timeout = options.handshake_timeout;

        let remote = match recv(&mut inbound, timeout, "identifier").await? {
            WireMessage::Identifier { id } => id,
            other => return Err(unexpected("identifier", &other)),
        };
        check_remote(local, remote)?;
        send(
            &outbound,
            Frame::new(csp.clone(), REPLICATION_CID, WireMessage::IdentifierReply { id: local }),
        )
        .await?;
        seed_from_cursor(&engine, remote, &options).await;

        let from_time = match recv(&mut inbound, timeout, "bootstrap").await? {
            WireMessage::Bootstrap { id, last_updated_time } if id == remote => last_updated_time,
            other => return Err(unexpected("bootstrap", &other)),
        };
        send(
            &outbound,
            Frame::new(
                csp,
                REPLICATION_CID,
                WireMessage::Bootstrap {
                    id: local,
                    last_updated_time: engine.last_modification_time(remote),
                },
            ),
        )
        .await?;

        Self::start_streaming(engine, remote, from_time, outbound, inbound, event_loop, options)
    }

    fn start_streaming(
        engine: Arc<ReplicationEngine>,
        remote: u8,
        from_time: u64,
        outbound: mpsc::Sender<Frame>,
        inbound: mpsc::Receiver<Frame>,
        event_loop: &EventLoop,
        options: SessionOptions,
    ) -> Result<Self> {
        let local = engine.local_identifier();
        let iterator = engine.acquire_modification_iterator(remote)?;
        iterator.set_modification_notifier(event_loop.waker());
        let marked = iterator.dirty_entries(from_time);
        metrics::record_bootstrap(remote, marked);
        info!(
            path = %engine.path(),
            local_id = local,
            remote_id = remote,
            from_time,
            marked,
            "Peer bootstrapped"
        );

        let cancelled = Arc::new(AtomicBool::new(false));
        let handler = ReplicationHandler::new(options.csp.clone(), REPLICATION_CID, local, iterator, outbound)
            .with_max_entries_per_action(options.max_entries_per_action)
            .with_rate_limit(options.rate_limit.clone())
            .with_cancellation(Arc::clone(&cancelled));
        event_loop.add_handler(Box::new(handler));

        let state = Arc::new(watch::Sender::new(PeerState::Streaming));
        let (caught_up_tx, caught_up_rx) = watch::channel(false);
        metrics::record_peer_state(remote, PeerState::Streaming.as_str());

        let pump = InboundPump {
            engine: Arc::clone(&engine),
            remote,
            cursor: options.cursor.clone(),
            state: Arc::clone(&state),
            caught_up: caught_up_tx,
            cancelled: Arc::clone(&cancelled),
            wake: event_loop.waker(),
        };
        let span = info_span!("replication_peer", local_id = local, remote_id = remote);
        let pump = tokio::spawn(pump.run(inbound).instrument(span));

        Ok(Self {
            engine,
            remote_identifier: remote,
            state,
            caught_up: caught_up_rx,
            cancelled,
            pump,
        })
    }

    pub fn remote_identifier(&self) -> u8 {
        self.remote_identifier
    }

    pub fn engine(&self) -> &Arc<ReplicationEngine> {
        &self.engine
    }

    pub fn state(&self) -> PeerState {
        *self.state.borrow()
    }

    pub fn state_watch(&self) -> watch::Receiver<PeerState> {
        self.state.subscribe()
    }

    /// Whether a catch-up marker has arrived from the remote.
    pub fn is_caught_up(&self) -> bool {
        *self.caught_up.borrow()
    }

    /// Wait up to `timeout` for the first catch-up marker.
    pub async fn wait_caught_up(&self, timeout: Duration) -> bool {
        let mut caught_up = self.caught_up.clone();
        tokio::time::timeout(timeout, caught_up.wait_for(|c| *c))
            .await
            .is_ok_and(|r| r.is_ok())
    }

    /// Wait until the session ends.
    pub async fn closed(&self) {
        let mut state = self.state.subscribe();
        let _ = state.wait_for(|s| *s == PeerState::Disconnected).await;
    }

    /// End the session. Undelivered entries stay dirty.
    pub fn disconnect(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        self.pump.abort();
        self.state.send_replace(PeerState::Disconnected);
        info!(remote_id = self.remote_identifier, "Peer session disconnected");
        metrics::record_peer_state(self.remote_identifier, PeerState::Disconnected.as_str());
    }
}

impl Drop for PeerSession {
    fn drop(&mut self) {
        self.cancelled.store(true, Ordering::Release);
        self.pump.abort();
    }
}

impl std::fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerSession")
            .field("path", &self.engine.path())
            .field("remote_identifier", &self.remote_identifier)
            .field("state", &self.state())
            .field("caught_up", &self.is_caught_up())
            .finish()
    }
}

fn check_remote(local: u8, remote: u8) -> Result<()> {
    if remote == local {
        return Err(TreeError::Handshake(format!(
            "remote reported our own identifier {}",
            local
        )));
    }
    Ok(())
}

async fn seed_from_cursor(engine: &ReplicationEngine, remote: u8, options: &SessionOptions) {
    if let Some(cursor) = &options.cursor {
        if let Some(time) = cursor.get(engine.path(), remote).await {
            debug!(remote_id = remote, time, "Seeding last modification time from cursor");
            engine.set_last_modification_time(remote, time);
        }
    }
}

/// Applies the remote's frames until the channel closes.
struct InboundPump {
    engine: Arc<ReplicationEngine>,
    remote: u8,
    cursor: Option<Arc<CursorStore>>,
    state: Arc<watch::Sender<PeerState>>,
    caught_up: watch::Sender<bool>,
    cancelled: Arc<AtomicBool>,
    wake: Arc<dyn Fn() + Send + Sync>,
}

impl InboundPump {
    async fn run(self, mut inbound: mpsc::Receiver<Frame>) {
        while let Some(frame) = inbound.recv().await {
            if self.cancelled.load(Ordering::Acquire) {
                break;
            }
            match frame.message {
                WireMessage::ReplicationEvent { entry } => {
                    if let Err(e) = self.engine.apply_replication(&entry) {
                        warn!(key = %entry.key, error = %e, "Failed to apply replication entry");
                        break;
                    }
                }
                WireMessage::LastUpdateTime { time, id } => {
                    if id != self.remote {
                        warn!(id, "Catch-up marker with unexpected identifier");
                        continue;
                    }
                    self.engine.set_last_modification_time(self.remote, time);
                    if let Some(cursor) = &self.cursor {
                        cursor.set(self.engine.path(), self.remote, time).await;
                    }
                    if !*self.caught_up.borrow() {
                        info!(time, "Caught up with remote");
                    }
                    self.caught_up.send_replace(true);
                }
                other => debug!(kind = other.kind(), "Ignoring frame on replication channel"),
            }
        }

        self.cancelled.store(true, Ordering::Release);
        self.state.send_replace(PeerState::Disconnected);
        metrics::record_peer_state(self.remote, PeerState::Disconnected.as_str());
        // Let the handler observe the cancellation promptly
        (self.wake)();
        info!("Replication inbound closed");
    }
}

/// Opens channels to one remote host.
pub trait Connector: Send + Sync {
    fn connect(&self) -> BoxFuture<'_, Result<WireChannel>>;
}

/// Keeps a replication session to one remote alive, reconnecting with
/// backoff.
pub struct PeerLink {
    state: watch::Receiver<PeerState>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl PeerLink {
    pub fn spawn(
        engine: Arc<ReplicationEngine>,
        connector: Arc<dyn Connector>,
        event_loop: EventLoop,
        options: SessionOptions,
        retry: RetryConfig,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(PeerState::Idle);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let span = info_span!("replication_link", local_id = engine.local_identifier(), path = %engine.path());
        let task = tokio::spawn(
            run_link(engine, connector, event_loop, options, retry, state_tx, shutdown_rx).instrument(span),
        );
        Self {
            state: state_rx,
            shutdown: shutdown_tx,
            task,
        }
    }

    pub fn state(&self) -> PeerState {
        *self.state.borrow()
    }

    pub fn state_watch(&self) -> watch::Receiver<PeerState> {
        self.state.clone()
    }

    /// Stop reconnecting and end the current session.
    pub async fn shutdown(self) {
        self.shutdown.send_replace(true);
        let _ = self.task.await;
    }
}

impl std::fmt::Debug for PeerLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerLink").field("state", &self.state()).finish()
    }
}

async fn run_link(
    engine: Arc<ReplicationEngine>,
    connector: Arc<dyn Connector>,
    event_loop: EventLoop,
    options: SessionOptions,
    retry: RetryConfig,
    state: watch::Sender<PeerState>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut attempt = 0usize;

    loop {
        if *shutdown.borrow() {
            break;
        }
        state.send_replace(PeerState::Bootstrapping);

        let connected = match connector.connect().await {
            Ok(channel) => PeerSession::initiate(Arc::clone(&engine), channel, &event_loop, options.clone()).await,
            Err(e) => Err(e),
        };

        match connected {
            Ok(session) => {
                attempt = 0;
                state.send_replace(PeerState::Streaming);
                metrics::record_peer_connection(session.remote_identifier(), true);
                tokio::select! {
                    _ = session.closed() => {
                        warn!(remote_id = session.remote_identifier(), "Replication session lost, reconnecting");
                    }
                    _ = shutdown.changed() => {}
                }
                session.disconnect();
                state.send_replace(PeerState::Disconnected);
            }
            Err(e) => {
                attempt += 1;
                state.send_replace(PeerState::Disconnected);
                if attempt >= retry.max_attempts {
                    warn!(attempts = attempt, error = %e, "Giving up on peer");
                    return;
                }
                let delay = retry.delay_for_attempt(attempt);
                warn!(attempt, ?delay, error = %e, "Peer connection failed, backing off");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }
    }
    state.send_replace(PeerState::Disconnected);
}
