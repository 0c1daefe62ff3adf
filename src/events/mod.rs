//! Router events: types and broadcast bus.
//!
//! This module groups the event **data model** and the **bus** used to
//! publish/subscribe to events emitted by the router and its runners.
//!
//! ## Contents
//! - [`EventKind`], [`Event`] event classification and payload metadata
//! - [`Bus`] thin wrapper over `tokio::sync::broadcast`
//!
//! ## Quick reference
//! - **Publishers**: `Router`, runner wait tasks, the simulation stdout listener,
//!   the remote heartbeat, `SubscriberSet` workers (overflow/panic).
//! - **Consumer**: the router listener, which filters stale run events,
//!   attributes script errors and fans out to the `SubscriberSet`.

mod bus;
mod event;

pub use bus::Bus;
pub use event::{Event, EventKind, PowerupStatus};
