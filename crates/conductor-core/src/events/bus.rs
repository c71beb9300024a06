//! Typed multi-subscriber event bus
//!
//! Every subscription owns an unbounded FIFO queue. `publish` enqueues to
//! all matching queues while holding one lock, so every subscriber sees
//! events in the same global order, and therefore in per-agent order.
//! Handlers run on their own task and never block the publisher.
//! Delivery is in-process only: a subscriber never sees events published
//! before it subscribed.

use crate::types::{AgentEvent, EventKind};
use futures::Stream;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

type Sender = mpsc::UnboundedSender<AgentEvent>;

#[derive(Default)]
struct BusInner {
    next_id: u64,
    subscribers: HashMap<EventKind, Vec<(u64, Sender)>>,
}

impl BusInner {
    fn register(&mut self, kinds: &[EventKind], tx: Sender) -> u64 {
        self.next_id += 1;
        let id = self.next_id;
        for kind in kinds {
            let list = self.subscribers.entry(*kind).or_default();
            if !list.iter().any(|(sid, _)| *sid == id) {
                list.push((id, tx.clone()));
            }
        }
        id
    }

    fn unregister(&mut self, id: u64) {
        for list in self.subscribers.values_mut() {
            list.retain(|(sid, _)| *sid != id);
        }
    }
}

/// Publish/subscribe hub for agent lifecycle events
#[derive(Default)]
pub struct EventBus {
    inner: Arc<Mutex<BusInner>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver `event` to every subscriber of its kind
    pub fn publish(&self, event: AgentEvent) {
        let kind = event.kind();
        let mut inner = self.inner.lock();
        let Some(list) = inner.subscribers.get_mut(&kind) else {
            return;
        };
        trace!("Publishing {:?} for agent {} to {} subscribers", kind, event.agent_id(), list.len());
        list.retain(|(id, tx)| {
            let alive = tx.send(event.clone()).is_ok();
            if !alive {
                debug!("Dropping closed subscriber {}", id);
            }
            alive
        });
    }

    /// Register `handler` for one event kind.
    ///
    /// The handler runs on a dedicated task (or thread, outside a Tokio
    /// runtime). A panicking handler is logged and stays subscribed.
    /// Dropping the returned handle leaves the subscription active; call
    /// [`Subscription::unsubscribe`] to end it.
    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn(&AgentEvent) + Send + Sync + 'static,
    {
        let EventReceiver {
            subscription,
            mut rx,
        } = self.subscribe_channel(&[kind]);
        let sub_id = subscription.id;

        let deliver = move |event: AgentEvent| {
            if catch_unwind(AssertUnwindSafe(|| handler(&event))).is_err() {
                warn!("Event handler {} panicked on {:?}", sub_id, event.kind());
            }
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    while let Some(event) = rx.recv().await {
                        deliver(event);
                    }
                });
            }
            Err(_) => {
                std::thread::spawn(move || {
                    while let Some(event) = rx.blocking_recv() {
                        deliver(event);
                    }
                });
            }
        }

        subscription
    }

    /// Receive events of `kinds` through a channel, in publish order
    pub fn subscribe_channel(&self, kinds: &[EventKind]) -> EventReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.inner.lock().register(kinds, tx);
        debug!("Subscriber {} registered for {:?}", id, kinds);
        EventReceiver {
            subscription: Subscription {
                id,
                bus: Arc::downgrade(&self.inner),
            },
            rx,
        }
    }

    /// Receive every event kind through one channel
    pub fn subscribe_all(&self) -> EventReceiver {
        self.subscribe_channel(&EventKind::ALL)
    }

    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.inner
            .lock()
            .subscribers
            .get(&kind)
            .map_or(0, |list| list.len())
    }
}

/// Handle to one registration on the bus
#[must_use = "keep the handle to unsubscribe later"]
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    bus: Weak<Mutex<BusInner>>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Stop delivery; events already queued are still handled
    pub fn unsubscribe(self) {
        if let Some(inner) = self.bus.upgrade() {
            inner.lock().unregister(self.id);
            debug!("Subscriber {} unsubscribed", self.id);
        }
    }
}

/// Channel end of a subscription
pub struct EventReceiver {
    subscription: Subscription,
    rx: mpsc::UnboundedReceiver<AgentEvent>,
}

impl EventReceiver {
    pub async fn recv(&mut self) -> Option<AgentEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<AgentEvent> {
        self.rx.try_recv().ok()
    }

    pub fn id(&self) -> u64 {
        self.subscription.id
    }

    pub fn unsubscribe(self) {
        self.subscription.unsubscribe();
    }
}

impl Stream for EventReceiver {
    type Item = AgentEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}
