//! Dispatcher module exports.
//!
//! Re-exports the dispatcher and listener trait so adapters and callers can
//! depend on this module directly.

pub mod dispatcher;

pub use dispatcher::{queue_listener, ChannelListener, Dispatcher, QueueListener};
