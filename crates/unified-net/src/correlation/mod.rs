//! Request/response correlation over one-way transports.
//!
//! An outgoing request registers a single-resolution waiter under a unique
//! token; the receive path resolves it from a matching reply, and timeouts or
//! disconnects resolve it with `Timeout` / `Cancelled`.

mod pending;

pub use pending::{PendingEntry, PendingRequests, Reply, Waiter};
