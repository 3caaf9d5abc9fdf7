// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cooperative event loop for replication handlers.
//!
//! One tokio task polls every registered [`EventHandler`] in turn. A handler
//! never blocks: it does a bounded amount of work and reports whether it
//! made progress.
//!
//! # Scheduling
//!
//! ```text
//! ┌─→ poll every handler ──→ any progress? ──yes──→ yield_now ──┐
//! │                              │ no                           │
//! │                              ↓                              │
//! │      park until: notify (iterator woke us) | idle pause     │
//! │                  | shutdown                                 │
//! └─────────────────────────────┴───────────────────────────────┘
//! ```
//!
//! A handler returning `Err` is deregistered and logged; the others keep
//! running.

use crate::error::{Result, TreeError};
use crate::metrics;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};

/// Unit of work polled by the [`EventLoop`].
pub trait EventHandler: Send {
    /// Do a bounded amount of work. `Ok(true)` means progress was made.
    fn action(&mut self) -> Result<bool>;

    fn name(&self) -> &str;

    /// Called once when the handler leaves the loop.
    fn on_deregistered(&mut self, _reason: &TreeError) {}
}

struct LoopShared {
    name: String,
    pending: Mutex<Vec<Box<dyn EventHandler>>>,
    wake: Notify,
    handler_count: AtomicUsize,
    idle_pause: Duration,
    shutdown_tx: watch::Sender<bool>,
}

/// Handle to a running event loop. Cloning shares the loop.
#[derive(Clone)]
pub struct EventLoop {
    shared: Arc<LoopShared>,
}

impl EventLoop {
    /// Spawn the loop task on the current tokio runtime.
    pub fn start(name: impl Into<String>, idle_pause: Duration) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shared = Arc::new(LoopShared {
            name: name.into(),
            pending: Mutex::new(Vec::new()),
            wake: Notify::new(),
            handler_count: AtomicUsize::new(0),
            idle_pause,
            shutdown_tx,
        });
        info!(event_loop = %shared.name, ?idle_pause, "Starting event loop");
        tokio::spawn(run(Arc::clone(&shared), shutdown_rx));
        Self { shared }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Register a handler; it is polled from the next pass on.
    pub fn add_handler(&self, mut handler: Box<dyn EventHandler>) {
        if !self.is_running() {
            handler.on_deregistered(&TreeError::Shutdown);
            return;
        }
        debug!(event_loop = %self.shared.name, handler = %handler.name(), "Handler added");
        self.shared
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handler);
        self.shared.handler_count.fetch_add(1, Ordering::AcqRel);
        self.shared.wake.notify_one();
    }

    /// Callback that wakes the loop out of an idle pause.
    pub fn waker(&self) -> Arc<dyn Fn() + Send + Sync> {
        let shared = Arc::downgrade(&self.shared);
        Arc::new(move || {
            if let Some(shared) = shared.upgrade() {
                shared.wake.notify_one();
            }
        })
    }

    /// Handlers registered and not yet deregistered.
    pub fn handler_count(&self) -> usize {
        self.shared.handler_count.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        !*self.shared.shutdown_tx.borrow()
    }

    /// Stop the loop; every handler is deregistered with [`TreeError::Shutdown`].
    pub fn shutdown(&self) {
        if self.shared.shutdown_tx.send_replace(true) {
            return;
        }
        info!(event_loop = %self.shared.name, "Event loop shutdown requested");
        self.shared.wake.notify_one();
    }
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("name", &self.shared.name)
            .field("handlers", &self.handler_count())
            .field("running", &self.is_running())
            .finish()
    }
}

async fn run(shared: Arc<LoopShared>, mut shutdown_rx: watch::Receiver<bool>) {
    let mut handlers: Vec<Box<dyn EventHandler>> = Vec::new();

    loop {
        if *shutdown_rx.borrow() {
            break;
        }
        handlers.extend(
            shared
                .pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .drain(..),
        );

        let mut busy = false;
        handlers.retain_mut(|handler| match handler.action() {
            Ok(progress) => {
                busy |= progress;
                true
            }
            Err(e) => {
                if matches!(e, TreeError::Shutdown) {
                    debug!(event_loop = %shared.name, handler = %handler.name(), "Handler finished");
                } else {
                    warn!(event_loop = %shared.name, handler = %handler.name(), error = %e, "Handler failed, deregistering");
                }
                metrics::record_handler_deregistered(handler.name(), &e);
                handler.on_deregistered(&e);
                shared.handler_count.fetch_sub(1, Ordering::AcqRel);
                false
            }
        });

        if busy {
            tokio::task::yield_now().await;
            continue;
        }

        tokio::select! {
            _ = shared.wake.notified() => {}
            _ = tokio::time::sleep(shared.idle_pause) => {}
            _ = shutdown_rx.changed() => {}
        }
    }

    let reason = TreeError::Shutdown;
    let mut pending = std::mem::take(&mut *shared.pending.lock().unwrap_or_else(PoisonError::into_inner));
    for handler in handlers.iter_mut().chain(pending.iter_mut()) {
        handler.on_deregistered(&reason);
    }
    shared.handler_count.store(0, Ordering::Release);
    info!(event_loop = %shared.name, "Event loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    struct Countdown {
        name: String,
        remaining: usize,
        done: Arc<AtomicUsize>,
        deregistered: Arc<AtomicBool>,
    }

    impl EventHandler for Countdown {
        fn action(&mut self) -> Result<bool> {
            if self.remaining == 0 {
                return Err(TreeError::Shutdown);
            }
            self.remaining -= 1;
            self.done.fetch_add(1, Ordering::SeqCst);
            Ok(true)
        }

        fn name(&self) -> &str {
            &self.name
        }

        fn on_deregistered(&mut self, _reason: &TreeError) {
            self.deregistered.store(true, Ordering::SeqCst);
        }
    }

    struct Failing;

    impl EventHandler for Failing {
        fn action(&mut self) -> Result<bool> {
            Err(TreeError::TransportClosed { remote_id: 9 })
        }

        fn name(&self) -> &str {
            "failing"
        }
    }

    struct Idle;

    impl EventHandler for Idle {
        fn action(&mut self) -> Result<bool> {
            Ok(false)
        }

        fn name(&self) -> &str {
            "idle"
        }
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_handler_runs_until_error() {
        let event_loop = EventLoop::start("test", Duration::from_millis(5));
        let done = Arc::new(AtomicUsize::new(0));
        let deregistered = Arc::new(AtomicBool::new(false));
        event_loop.add_handler(Box::new(Countdown {
            name: "countdown".to_string(),
            remaining: 10,
            done: Arc::clone(&done),
            deregistered: Arc::clone(&deregistered),
        }));

        wait_for(|| deregistered.load(Ordering::SeqCst)).await;
        assert_eq!(done.load(Ordering::SeqCst), 10);
        assert_eq!(event_loop.handler_count(), 0);
        event_loop.shutdown();
    }

    #[tokio::test]
    async fn test_failing_handler_does_not_stop_others() {
        let event_loop = EventLoop::start("test", Duration::from_millis(5));
        event_loop.add_handler(Box::new(Failing));
        event_loop.add_handler(Box::new(Idle));

        wait_for(|| event_loop.handler_count() == 1).await;
        assert!(event_loop.is_running());
        event_loop.shutdown();
    }

    #[tokio::test]
    async fn test_shutdown_deregisters_everything() {
        let event_loop = EventLoop::start("test", Duration::from_millis(5));
        let deregistered = Arc::new(AtomicBool::new(false));
        event_loop.add_handler(Box::new(Countdown {
            name: "long".to_string(),
            remaining: usize::MAX,
            done: Arc::new(AtomicUsize::new(0)),
            deregistered: Arc::clone(&deregistered),
        }));

        event_loop.shutdown();
        assert!(!event_loop.is_running());
        wait_for(|| deregistered.load(Ordering::SeqCst)).await;
        assert_eq!(event_loop.handler_count(), 0);
    }

    #[tokio::test]
    async fn test_waker_is_harmless_after_shutdown() {
        let event_loop = EventLoop::start("test", Duration::from_millis(5));
        let waker = event_loop.waker();
        event_loop.shutdown();
        waker();
    }
}
