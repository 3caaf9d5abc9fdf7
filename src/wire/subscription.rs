//! Server side of the subscription protocol.
//!
//! A client sends `registerSubscriber` (or `registerTopicSubscriber`) with a
//! csp naming a map and a fresh `cid`. Every event of that map is streamed
//! back as a `reply` frame with `notComplete` set; the subscription ends
//! with a single `onEndOfSubscription` frame, whether the client
//! unregistered, the map closed, or the outbound queue could not keep up.

use super::{Frame, ReplyPayload, WireMessage};
use crate::context::RequestContext;
use crate::error::{InvalidSubscriber, Result, TreeError};
use crate::metrics;
use crate::subscription::{Delivery, MapEvent, Subscriber, SubscriptionCollection, TopicSubscriber};
use crate::tree::AssetTree;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

/// Streams one subscription's deliveries into the outbound queue.
struct RemoteSubscriber {
    csp: String,
    cid: u64,
    tid: u64,
    outbound: mpsc::Sender<Frame>,
    ended: AtomicBool,
}

impl RemoteSubscriber {
    fn new(frame: &Frame, outbound: mpsc::Sender<Frame>) -> Self {
        Self {
            csp: frame.csp.clone(),
            cid: frame.cid,
            tid: frame.tid,
            outbound,
            ended: AtomicBool::new(false),
        }
    }

    fn reply(&self, payload: ReplyPayload) -> Delivery {
        if self.ended.load(Ordering::Acquire) {
            return Err(InvalidSubscriber);
        }
        let frame = Frame::new(self.csp.clone(), self.cid, WireMessage::Reply { payload })
            .with_tid(self.tid)
            .streaming();
        match self.outbound.try_send(frame) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                warn!(csp = %self.csp, cid = self.cid, "Outbound queue full, dropping remote subscriber");
                metrics::record_remote_subscriber_dropped("backpressure");
                Err(InvalidSubscriber)
            }
            Err(TrySendError::Closed(_)) => {
                debug!(csp = %self.csp, cid = self.cid, "Outbound closed, dropping remote subscriber");
                Err(InvalidSubscriber)
            }
        }
    }

    fn end(&self) {
        if self.ended.swap(true, Ordering::AcqRel) {
            return;
        }
        let frame = Frame::new(self.csp.clone(), self.cid, WireMessage::OnEndOfSubscription)
            .with_tid(self.tid);
        if self.outbound.try_send(frame).is_err() {
            debug!(csp = %self.csp, cid = self.cid, "End of subscription not delivered");
        }
    }

    fn is_ended(&self) -> bool {
        self.ended.load(Ordering::Acquire)
    }
}

impl Subscriber<MapEvent> for RemoteSubscriber {
    fn on_message(&self, event: MapEvent) -> Delivery {
        self.reply(ReplyPayload::Event { event })
    }

    fn on_end_of_subscription(&self) {
        self.end();
    }
}

impl Subscriber<String> for RemoteSubscriber {
    fn on_message(&self, key: String) -> Delivery {
        self.reply(ReplyPayload::Key { key })
    }

    fn on_end_of_subscription(&self) {
        self.end();
    }
}

impl TopicSubscriber for RemoteSubscriber {
    fn on_message(&self, topic: String, message: Option<String>) -> Delivery {
        self.reply(ReplyPayload::Topic { topic, message })
    }

    fn on_end_of_subscription(&self) {
        self.end();
    }
}

enum Registration {
    Entries(Arc<SubscriptionCollection>, Arc<dyn Subscriber<MapEvent>>),
    Keys(Arc<SubscriptionCollection>, Arc<dyn Subscriber<String>>),
    Topics(Arc<SubscriptionCollection>, Arc<dyn TopicSubscriber>),
}

impl Registration {
    fn unregister(&self) {
        match self {
            Registration::Entries(c, s) => c.unregister_subscriber(s),
            Registration::Keys(c, s) => c.unregister_key_subscriber(s),
            Registration::Topics(c, s) => c.unregister_topic_subscriber(s),
        }
    }
}

/// Handles subscription requests from one connection.
pub struct SubscriptionService {
    tree: AssetTree,
    outbound: mpsc::Sender<Frame>,
    registrations: DashMap<u64, (Arc<RemoteSubscriber>, Registration)>,
}

impl SubscriptionService {
    pub fn new(tree: AssetTree, outbound: mpsc::Sender<Frame>) -> Self {
        Self {
            tree,
            outbound,
            registrations: DashMap::new(),
        }
    }

    /// Process one inbound request.
    pub fn handle(&self, frame: Frame) -> Result<()> {
        match &frame.message {
            WireMessage::RegisterSubscriber { keys_only } => self.register(&frame, *keys_only, false),
            WireMessage::RegisterTopicSubscriber => self.register(&frame, false, true),
            WireMessage::UnregisterSubscriber | WireMessage::UnregisterTopicSubscriber => {
                self.unregister(frame.cid);
                Ok(())
            }
            other => Err(TreeError::Codec(format!(
                "unexpected {} on subscription channel",
                other.kind()
            ))),
        }
    }

    fn register(&self, frame: &Frame, keys_only: bool, topics: bool) -> Result<()> {
        if self.registrations.contains_key(&frame.cid) {
            return Err(TreeError::InvalidState {
                expected: "unused cid".to_string(),
                actual: format!("cid {} already subscribed", frame.cid),
            });
        }
        let ctx = RequestContext::parse(&frame.csp)?;
        let map = self.tree.acquire_map(&ctx)?;
        let collection = map.subscription();
        let remote = Arc::new(RemoteSubscriber::new(frame, self.outbound.clone()));

        let registration = if topics {
            Registration::Topics(Arc::clone(&collection), remote.clone())
        } else if keys_only {
            Registration::Keys(Arc::clone(&collection), remote.clone())
        } else {
            Registration::Entries(Arc::clone(&collection), remote.clone())
        };
        // Registered before bootstrap so an unregister racing the replay finds it
        self.registrations
            .insert(frame.cid, (Arc::clone(&remote), registration));

        if topics {
            collection.register_topic_subscriber(&ctx, remote.clone());
        } else if keys_only {
            collection.register_key_subscriber(&ctx, remote.clone());
        } else {
            collection.register_subscriber(&ctx, remote.clone());
        }

        if remote.is_ended() {
            self.registrations.remove(&frame.cid);
        }
        debug!(csp = %frame.csp, cid = frame.cid, keys_only, topics, "Remote subscriber registered");
        Ok(())
    }

    fn unregister(&self, cid: u64) {
        match self.registrations.remove(&cid) {
            Some((_, (_, registration))) => registration.unregister(),
            None => debug!(cid, "Unregister for unknown cid"),
        }
    }

    /// Number of live remote subscriptions.
    pub fn active_subscriptions(&self) -> usize {
        self.registrations.retain(|_, (remote, _)| !remote.is_ended());
        self.registrations.len()
    }

    /// End every subscription of this connection.
    pub fn close(&self) {
        let cids: Vec<u64> = self.registrations.iter().map(|e| *e.key()).collect();
        for cid in cids {
            self.unregister(cid);
        }
    }

    /// Handle requests until `inbound` closes, then end every subscription.
    /// A failed request is answered with an `error` frame.
    pub async fn serve(&self, mut inbound: mpsc::Receiver<Frame>) {
        while let Some(frame) = inbound.recv().await {
            let (csp, cid, tid) = (frame.csp.clone(), frame.cid, frame.tid);
            if let Err(e) = self.handle(frame) {
                warn!(csp = %csp, cid, error = %e, "Subscription request failed");
                let reply = Frame::new(csp, cid, WireMessage::Error { message: e.to_string() }).with_tid(tid);
                if self.outbound.send(reply).await.is_err() {
                    break;
                }
            }
        }
        self.close();
    }
}

impl std::fmt::Debug for SubscriptionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionService")
            .field("registrations", &self.registrations.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::ClusterContext;

    fn service(capacity: usize) -> (AssetTree, SubscriptionService, mpsc::Receiver<Frame>) {
        let tree = AssetTree::with_default_rules(ClusterContext::standalone(1));
        let (tx, rx) = mpsc::channel(capacity);
        let service = SubscriptionService::new(tree.clone(), tx);
        (tree, service, rx)
    }

    fn drain(rx: &mut mpsc::Receiver<Frame>) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn test_bootstrap_then_live_then_end() {
        let (tree, service, mut rx) = service(64);
        let map = tree.acquire_map(&RequestContext::for_path("/orders")).unwrap();
        map.put("a", "1");

        let request = Frame::new("/orders", 5, WireMessage::RegisterSubscriber { keys_only: false }).with_tid(9);
        service.handle(request).unwrap();
        map.put("b", "2");

        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 2);
        assert!(frames.iter().all(|f| f.cid == 5 && f.tid == 9 && f.not_complete));
        match &frames[1].message {
            WireMessage::Reply {
                payload: ReplyPayload::Event { event },
            } => assert_eq!(event.key(), "b"),
            other => panic!("unexpected {:?}", other),
        }

        service
            .handle(Frame::new("/orders", 5, WireMessage::UnregisterSubscriber))
            .unwrap();
        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].message, WireMessage::OnEndOfSubscription);
        assert_eq!(service.active_subscriptions(), 0);

        map.put("c", "3");
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_end_after_bootstrap() {
        let (tree, service, mut rx) = service(64);
        let map = tree.acquire_map(&RequestContext::for_path("/m")).unwrap();
        map.put("k", "v");

        let request = Frame::new(
            "/m?endSubscriptionAfterBootstrap=true",
            1,
            WireMessage::RegisterSubscriber { keys_only: true },
        );
        service.handle(request).unwrap();
        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 2);
        assert_eq!(
            frames[0].message,
            WireMessage::Reply {
                payload: ReplyPayload::Key { key: "k".to_string() }
            }
        );
        assert_eq!(frames[1].message, WireMessage::OnEndOfSubscription);
        assert_eq!(service.active_subscriptions(), 0);
    }

    #[test]
    fn test_topic_subscription() {
        let (tree, service, mut rx) = service(64);
        service
            .handle(Frame::new("/news?bootstrap=false", 2, WireMessage::RegisterTopicSubscriber))
            .unwrap();
        let map = tree.acquire_map(&RequestContext::for_path("/news")).unwrap();
        map.put("sport", "goal");
        map.remove("sport");

        let payloads: Vec<_> = drain(&mut rx).into_iter().map(|f| f.message).collect();
        assert_eq!(
            payloads,
            vec![
                WireMessage::Reply {
                    payload: ReplyPayload::Topic {
                        topic: "sport".to_string(),
                        message: Some("goal".to_string())
                    }
                },
                WireMessage::Reply {
                    payload: ReplyPayload::Topic {
                        topic: "sport".to_string(),
                        message: None
                    }
                },
            ]
        );
    }

    #[test]
    fn test_duplicate_cid_rejected() {
        let (_tree, service, _rx) = service(64);
        let request = Frame::new("/m", 1, WireMessage::RegisterSubscriber { keys_only: false });
        service.handle(request.clone()).unwrap();
        assert!(matches!(service.handle(request), Err(TreeError::InvalidState { .. })));
    }

    #[test]
    fn test_full_queue_drops_subscriber() {
        let (tree, service, mut rx) = service(1);
        service
            .handle(Frame::new("/m", 1, WireMessage::RegisterSubscriber { keys_only: false }))
            .unwrap();
        let map = tree.acquire_map(&RequestContext::for_path("/m")).unwrap();
        map.put("a", "1");
        map.put("b", "2");

        assert_eq!(service.active_subscriptions(), 0);
        assert_eq!(map.subscription().entry_subscriber_count(), 0);
        // Only the first reply fitted; the end frame found the queue full
        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[test]
    fn test_unexpected_message_is_an_error() {
        let (_tree, service, _rx) = service(4);
        let err = service
            .handle(Frame::new("/m", 1, WireMessage::Identifier { id: 1 }))
            .unwrap_err();
        assert!(err.to_string().contains("identifier"));
    }
}
