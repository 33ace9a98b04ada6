//! Unified core: transport-neutral messaging primitives and error types.
//!
//! This crate defines the envelope model, the typed payload registry, and the
//! proxy wire framing shared by every adapter. It carries no runtime
//! dependencies so the same types can be used by adapters, fakes, and tools.
//!
//! # Defensive guarantees
//! Panics, `unwrap`, and `expect` are compile-denied here
//! (`#![deny(clippy::panic, clippy::unwrap_used, clippy::expect_used)]`).
//! Malformed frames and envelopes surface as `FabricError::Decode` so a single
//! bad message can never take down a receive loop.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

pub mod error;
pub mod protocol;

/// Shared result type.
pub use error::{ClientId, ErrorKind, FabricError, Result};
pub use protocol::envelope::{Envelope, FabricMessage};
