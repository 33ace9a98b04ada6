//! Unified messaging fabric: adapters and runtime pieces.
//!
//! This crate wires the channel adapter contract, the listener dispatcher,
//! the correlation layer, and the two transport strategies (shared
//! key-value/pub-sub store, proxy-native forwarding) into a cluster
//! messaging stack. It is consumed by the demo binary (`main.rs`) and by
//! integration tests.

pub mod adapter;
pub mod config;
pub mod correlation;
pub mod dispatch;
pub mod node;
pub mod obs;
pub mod proxy;
pub mod store;

pub use adapter::{build, Backend, ChannelAdapter, ChannelAdapterExt, ControlCommand, ReceivedMessage};
pub use config::{BackendKind, FabricConfig};
pub use dispatch::{queue_listener, ChannelListener};
pub use proxy::{LocalProxy, ProxyAdapter, ProxyBroker};
pub use store::{MemoryStore, Store, StoreAdapter};
