//! # Event subscribers for the router.
//!
//! This module provides the [`Subscribe`] trait and the [`SubscriberSet`] that
//! delivers router events to them.
//!
//! ## Architecture
//! ```text
//! router listener ──────► SubscriberSet::emit(&Event)
//!                                   │   (looked up by EventKind)
//!                                   ▼
//!                          [queue] ──► worker ──► subscriber.on_event()
//! ```
//!
//! ## Rules
//! - **At most one** subscription per [`EventKind`](crate::EventKind): subscribing
//!   again for the same kind replaces the previous subscriber.
//! - Subscribers are only ever invoked from their own worker task.

mod set;
mod subscribe;

pub use set::SubscriberSet;
pub use subscribe::{FnSubscriber, Subscribe};
