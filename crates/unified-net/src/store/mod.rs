//! Backing store contract and the store-based adapter.
//!
//! The store is a collaborator: a shared string hash + pub/sub service
//! (Redis-shaped). `MemoryStore` implements it in-process so whole clusters
//! run inside one test.

pub mod adapter;
pub mod discovery;
pub mod keys;
pub mod memory;

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::mpsc;

use unified_core::error::Result;

pub use adapter::StoreAdapter;
pub use discovery::Membership;
pub use keys::Keys;
pub use memory::{MemoryStore, MemoryStoreClient};

/// Live subscription to one topic. Dropping the receiver ends it from the
/// consumer side; `Store::unsubscribe` ends it from the store side.
#[derive(Debug)]
pub struct Subscription {
    pub topic: String,
    pub rx: mpsc::Receiver<String>,
}

/// One connection to the shared store. All values are strings.
#[async_trait]
pub trait Store: Send + Sync {
    async fn connect(&self) -> Result<()>;
    async fn disconnect(&self) -> Result<()>;

    /// Returns how many subscribers the message was handed to.
    async fn publish(&self, topic: &str, message: &str) -> Result<usize>;
    async fn subscribe(&self, topic: &str) -> Result<Subscription>;
    async fn unsubscribe(&self, topic: &str) -> Result<()>;

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>>;
    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<()>;
    async fn hash_set_all(&self, key: &str, fields: HashMap<String, String>) -> Result<()>;
    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>>;
    async fn hash_keys(&self, key: &str) -> Result<Vec<String>>;
    /// False if the field did not exist.
    async fn hash_remove(&self, key: &str, field: &str) -> Result<bool>;
    async fn hash_size(&self, key: &str) -> Result<usize>;

    /// False if the key did not exist.
    async fn delete(&self, key: &str) -> Result<bool>;
}
