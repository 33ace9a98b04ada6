//! Top-level facade crate for the unified messaging fabric.
//!
//! Re-exports the core types and the adapter library so users can depend on a single crate.

pub mod core {
    pub use unified_core::*;
}

pub mod net {
    pub use unified_net::*;
}
