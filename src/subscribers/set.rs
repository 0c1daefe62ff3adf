//! # Non-blocking event delivery, one subscription per event kind.
//!
//! Provides [`SubscriberSet`] - delivers each event to the subscriber registered for
//! its [`EventKind`] without blocking the publisher.
//!
//! ## Architecture
//! ```text
//! emit(event)
//!     │  lookup(event.kind)
//!     ├──► ChangedBoard ──► [queue] ──► worker ──► ui.on_event()
//!     ├──► FinishedRun  ──► [queue] ──► worker ──► ide.on_event()
//!     └──► (no subscription) ──► dropped
//! ```
//!
//! ## Rules
//! - **Single subscriber per kind**: `subscribe(kind, ..)` replaces the previous one.
//!   The replaced worker drains what it already queued and exits.
//! - **Overflow**: event dropped for that subscriber only, `SubscriberOverflow` published
//! - **Non-blocking**: `emit()` returns immediately (uses `try_send`)
//! - **Per-subscriber FIFO**: each subscriber sees its events in order
//!
//! ## Panic handling
//! Worker tasks use `catch_unwind` to isolate panics:
//! - Panic is caught and converted to `SubscriberPanicked` event
//! - Worker continues processing next event

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use futures::FutureExt;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, warn};

use crate::events::{Bus, Event, EventKind};
use crate::subscribers::Subscribe;

/// One active subscription: its queue and worker.
struct Subscription {
    name: &'static str,
    sender: mpsc::Sender<Arc<Event>>,
    worker: JoinHandle<()>,
}

/// Kind-keyed delivery of router events.
pub struct SubscriberSet {
    subs: Mutex<HashMap<EventKind, Subscription>>,
    bus: Bus,
}

impl SubscriberSet {
    /// Creates an empty set. Overflow and panic reports are published on `bus`.
    #[must_use]
    pub fn new(bus: Bus) -> Self {
        Self {
            subs: Mutex::new(HashMap::new()),
            bus,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<EventKind, Subscription>> {
        self.subs.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Registers `sub` for `kind`, replacing any previous subscriber of that kind.
    ///
    /// Returns the name of the replaced subscriber, if any.
    pub fn subscribe(&self, kind: EventKind, sub: Arc<dyn Subscribe>) -> Option<&'static str> {
        let cap = sub.queue_capacity().max(1);
        let name = sub.name();
        let (tx, mut rx) = mpsc::channel::<Arc<Event>>(cap);
        let bus = self.bus.clone();

        let worker = tokio::spawn(async move {
            while let Some(ev) = rx.recv().await {
                let fut = sub.on_event(ev.as_ref());

                if let Err(panic_err) = std::panic::AssertUnwindSafe(fut).catch_unwind().await {
                    let info = {
                        let any = &*panic_err;
                        if let Some(msg) = any.downcast_ref::<&'static str>() {
                            (*msg).to_string()
                        } else if let Some(msg) = any.downcast_ref::<String>() {
                            msg.clone()
                        } else {
                            "unknown panic".to_string()
                        }
                    };
                    bus.publish(Event::subscriber_panicked(sub.name(), info));
                }
            }
        });

        let previous = self.lock().insert(
            kind,
            Subscription {
                name,
                sender: tx,
                worker,
            },
        );
        let replaced = previous.map(|old| old.name);
        if let Some(old) = replaced {
            debug!(kind = kind.as_str(), old, new = name, "replaced subscriber");
        }
        replaced
    }

    /// Removes the subscriber for `kind`. Returns `true` if one was registered.
    pub fn unsubscribe(&self, kind: EventKind) -> bool {
        self.lock().remove(&kind).is_some()
    }

    /// Returns the name of the subscriber registered for `kind`.
    pub fn subscriber_name(&self, kind: EventKind) -> Option<&'static str> {
        self.lock().get(&kind).map(|s| s.name)
    }

    /// Delivers an event to the subscriber registered for its kind.
    ///
    /// - Uses `try_send` (non-blocking)
    /// - On queue full/closed: drops event, publishes `SubscriberOverflow`
    ///   (overflow events themselves are never re-reported)
    pub fn emit(&self, event: &Event) {
        let is_overflow_evt = matches!(event.kind, EventKind::SubscriberOverflow);
        let subs = self.lock();
        let Some(sub) = subs.get(&event.kind) else {
            return;
        };

        match sub.sender.try_send(Arc::new(event.clone())) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(subscriber = sub.name, "subscriber queue full, dropping event");
                if !is_overflow_evt {
                    self.bus.publish(Event::subscriber_overflow(sub.name, "full"));
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!(subscriber = sub.name, "subscriber worker closed, dropping event");
                if !is_overflow_evt {
                    self.bus
                        .publish(Event::subscriber_overflow(sub.name, "closed"));
                }
            }
        }
    }

    /// Graceful shutdown: close all queues and await worker completion.
    pub async fn shutdown(&self) {
        let drained: Vec<Subscription> = self.lock().drain().map(|(_, s)| s).collect();
        let mut workers = Vec::with_capacity(drained.len());
        for sub in drained {
            drop(sub.sender);
            workers.push(sub.worker);
        }
        for w in workers {
            let _ = w.await;
        }
    }

    /// Number of active subscriptions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// True if there are no subscriptions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscribers::FnSubscriber;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn second_subscription_replaces_first() {
        let set = SubscriberSet::new(Bus::new(16));
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let f = Arc::clone(&first);
        set.subscribe(
            EventKind::FinishedRun,
            FnSubscriber::arc("first", move |_| {
                f.fetch_add(1, Ordering::SeqCst);
            }),
        );
        let s = Arc::clone(&second);
        let replaced = set.subscribe(
            EventKind::FinishedRun,
            FnSubscriber::arc("second", move |_| {
                s.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert_eq!(replaced, Some("first"));
        assert_eq!(set.len(), 1);

        set.emit(&Event::new(EventKind::FinishedRun));
        settle().await;

        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn events_without_subscription_are_dropped() {
        let set = SubscriberSet::new(Bus::new(16));
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        set.subscribe(
            EventKind::Error,
            FnSubscriber::arc("errors", move |_| {
                h.fetch_add(1, Ordering::SeqCst);
            }),
        );

        set.emit(&Event::new(EventKind::GifEncoded));
        set.emit(&Event::error("boom"));
        settle().await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        assert!(set.unsubscribe(EventKind::Error));
        assert!(!set.unsubscribe(EventKind::Error));
        set.emit(&Event::error("boom"));
        settle().await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn panicking_subscriber_is_reported() {
        let bus = Bus::new(16);
        let mut rx = bus.subscribe();
        let set = SubscriberSet::new(bus);
        set.subscribe(
            EventKind::PlugLoaded,
            FnSubscriber::arc("bad", |_| panic!("kaboom")),
        );

        set.emit(&Event::new(EventKind::PlugLoaded));
        let ev = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ev.kind, EventKind::SubscriberPanicked);
        assert!(ev.message_or_empty().contains("kaboom"));
        set.shutdown().await;
        assert!(set.is_empty());
    }
}
