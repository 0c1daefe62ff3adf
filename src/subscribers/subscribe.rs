//! # Core subscriber trait
//!
//! `Subscribe` is the extension point for plugging event handlers (a UI, a logger,
//! a test probe) into the router. Each subscription is driven by a dedicated worker
//! loop fed by a bounded queue owned by the [`SubscriberSet`](crate::SubscriberSet).
//!
//! ## Contract
//! - Implementations may be slow; they do **not** block the publisher.
//! - Each subscriber **declares** its preferred queue capacity via
//!   [`Subscribe::queue_capacity`]. If a queue overflows, events for that
//!   subscriber are **dropped** and `SubscriberOverflow` is published.
//!
//! ## Example
//! ```rust
//! use lightrun::{Event, EventKind, Subscribe};
//!
//! struct StatusLine;
//!
//! #[async_trait::async_trait]
//! impl Subscribe for StatusLine {
//!     async fn on_event(&self, ev: &Event) {
//!         if ev.kind == EventKind::Error {
//!             // show ev.message ...
//!         }
//!     }
//!     fn name(&self) -> &'static str { "status-line" }
//! }
//! ```

use async_trait::async_trait;

use crate::events::Event;

/// Contract for event subscribers.
#[async_trait]
pub trait Subscribe: Send + Sync + 'static {
    /// Handle a single event for this subscriber.
    async fn on_event(&self, event: &Event);

    /// Human-readable name (for logs).
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    /// Preferred capacity of this subscriber's queue.
    fn queue_capacity(&self) -> usize {
        256
    }
}

/// Closure-backed subscriber.
///
/// ```rust
/// use std::sync::Arc;
/// use lightrun::{FnSubscriber, Subscribe};
///
/// let sub: Arc<dyn Subscribe> = FnSubscriber::arc("printer", |ev| {
///     let _ = ev.kind;
/// });
/// assert_eq!(sub.name(), "printer");
/// ```
pub struct FnSubscriber<F> {
    name: &'static str,
    f: F,
}

impl<F> FnSubscriber<F>
where
    F: Fn(&Event) + Send + Sync + 'static,
{
    /// Creates a closure-backed subscriber.
    pub fn new(name: &'static str, f: F) -> Self {
        Self { name, f }
    }

    /// Creates the subscriber and returns it as a shared handle.
    pub fn arc(name: &'static str, f: F) -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self::new(name, f))
    }
}

#[async_trait]
impl<F> Subscribe for FnSubscriber<F>
where
    F: Fn(&Event) + Send + Sync + 'static,
{
    async fn on_event(&self, event: &Event) {
        (self.f)(event);
    }

    fn name(&self) -> &'static str {
        self.name
    }
}
