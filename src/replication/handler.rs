//! Outbound replication towards one remote host.
//!
//! Each action drains up to `max_entries_per_action` dirty entries from the
//! remote's [`ModificationIterator`] into the bounded outbound queue. A full
//! queue or an exhausted rate limit ends the action with whatever progress
//! was made; nothing ever waits. Once the iterator is empty the handler
//! sends a single `lastUpdateTime` catch-up marker carrying the highest
//! timestamp delivered, and another only after that mark advances.

use super::{EventHandler, ModificationIterator};
use crate::error::{Result, TreeError};
use crate::metrics;
use crate::resilience::{RateLimitConfig, RateLimiter};
use crate::wire::{Frame, WireMessage};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, trace};

/// Streams one store's dirty entries to one remote host.
pub struct ReplicationHandler {
    name: String,
    csp: String,
    cid: u64,
    local_identifier: u8,
    remote_identifier: u8,
    iterator: Arc<ModificationIterator>,
    outbound: mpsc::Sender<Frame>,
    max_entries_per_action: usize,
    rate_limiter: Option<RateLimiter>,
    last_marker_sent: Option<u64>,
    cancelled: Arc<AtomicBool>,
}

impl ReplicationHandler {
    pub fn new(
        csp: impl Into<String>,
        cid: u64,
        local_identifier: u8,
        iterator: Arc<ModificationIterator>,
        outbound: mpsc::Sender<Frame>,
    ) -> Self {
        let csp = csp.into();
        let remote_identifier = iterator.remote_identifier();
        Self {
            name: format!("replication {} {}->{}", csp, local_identifier, remote_identifier),
            csp,
            cid,
            local_identifier,
            remote_identifier,
            iterator,
            outbound,
            max_entries_per_action: 64,
            rate_limiter: None,
            last_marker_sent: None,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_max_entries_per_action(mut self, max: usize) -> Self {
        self.max_entries_per_action = max.max(1);
        self
    }

    pub fn with_rate_limit(mut self, config: Option<RateLimitConfig>) -> Self {
        self.rate_limiter = config.map(RateLimiter::new);
        self
    }

    /// Share a flag that makes the next action end the handler.
    pub fn with_cancellation(mut self, cancelled: Arc<AtomicBool>) -> Self {
        self.cancelled = cancelled;
        self
    }

    pub fn remote_identifier(&self) -> u8 {
        self.remote_identifier
    }

    fn closed(&self) -> TreeError {
        TreeError::TransportClosed {
            remote_id: self.remote_identifier,
        }
    }

    /// Drain entries into the outbound queue. Returns how many were sent.
    fn send_entries(&mut self) -> Result<usize> {
        let mut sent = 0;
        while sent < self.max_entries_per_action && self.iterator.has_next() {
            let permit = match self.outbound.try_reserve() {
                Ok(permit) => permit,
                Err(TrySendError::Full(())) => {
                    trace!(remote_id = self.remote_identifier, "Outbound queue full");
                    metrics::record_handler_stall(self.remote_identifier);
                    break;
                }
                Err(TrySendError::Closed(())) => return Err(self.closed()),
            };
            if let Some(limiter) = &self.rate_limiter {
                if !limiter.try_acquire() {
                    break;
                }
            }

            let mut permit = Some(permit);
            let (csp, cid) = (&self.csp, self.cid);
            let delivered = self.iterator.next_entry(&mut |entry| match permit.take() {
                Some(permit) => {
                    permit.send(Frame::new(
                        csp.clone(),
                        cid,
                        WireMessage::ReplicationEvent {
                            entry: entry.clone(),
                        },
                    ));
                    true
                }
                None => false,
            });
            if !delivered {
                break;
            }
            sent += 1;
        }
        if sent > 0 {
            metrics::record_entries_sent(self.remote_identifier, sent);
        }
        Ok(sent)
    }

    /// Send the catch-up marker if everything is drained and the delivered
    /// high-water mark moved since the last one.
    fn send_marker(&mut self) -> Result<bool> {
        if self.iterator.has_next() {
            return Ok(false);
        }
        let time = self.iterator.last_update_time();
        if self.last_marker_sent.is_some_and(|sent| time <= sent) {
            return Ok(false);
        }
        let marker = Frame::new(
            self.csp.clone(),
            self.cid,
            WireMessage::LastUpdateTime {
                time,
                id: self.local_identifier,
            },
        );
        match self.outbound.try_send(marker) {
            Ok(()) => {
                trace!(remote_id = self.remote_identifier, time, "Catch-up marker sent");
                metrics::record_marker_sent(self.remote_identifier);
                self.last_marker_sent = Some(time);
                Ok(true)
            }
            Err(TrySendError::Full(_)) => Ok(false),
            Err(TrySendError::Closed(_)) => Err(self.closed()),
        }
    }
}

impl EventHandler for ReplicationHandler {
    fn action(&mut self) -> Result<bool> {
        if self.cancelled.load(Ordering::Acquire) {
            return Err(TreeError::Shutdown);
        }
        if self.outbound.is_closed() {
            return Err(self.closed());
        }
        let sent = self.send_entries()?;
        let marked = self.send_marker()?;
        Ok(sent > 0 || marked)
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn on_deregistered(&mut self, reason: &TreeError) {
        debug!(
            remote_id = self.remote_identifier,
            pending = self.iterator.dirty_count(),
            reason = %reason,
            "Replication handler deregistered"
        );
    }
}

impl std::fmt::Debug for ReplicationHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationHandler")
            .field("name", &self.name)
            .field("max_entries_per_action", &self.max_entries_per_action)
            .field("last_marker_sent", &self.last_marker_sent)
            .finish()
    }
}
