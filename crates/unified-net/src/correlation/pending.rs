use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

use unified_core::error::{FabricError, Result};

use crate::adapter::ReceivedMessage;

/// What a correlated request resolves with.
#[derive(Debug, Clone)]
pub enum Reply {
    /// An envelope whose correlation id matched the request.
    Message(ReceivedMessage),
    ServerList(Vec<String>),
    PlayerCount(u32),
}

/// A registered, not yet resolved request.
pub struct PendingEntry {
    key: String,
    seq: u64,
    created_at: Instant,
    sender: oneshot::Sender<Result<Reply>>,
}

impl PendingEntry {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Resolve the waiter. Returns false if the caller already gave up.
    pub fn resolve(self, outcome: Result<Reply>) -> bool {
        debug!(
            key = %self.key,
            elapsed_ms = self.created_at.elapsed().as_millis() as u64,
            ok = outcome.is_ok(),
            "pending request resolved"
        );
        self.sender.send(outcome).is_ok()
    }
}

type PendingMap = DashMap<Uuid, PendingEntry>;

/// Concurrent map of outstanding requests.
///
/// Every entry leaves the map exactly once (`DashMap::remove` is the
/// single-resolution guard): whichever of reply, timeout, or cancel removes
/// it first wins and later attempts are no-ops.
///
/// Tokens are unique per request. Replies that carry no token on the wire
/// (proxy server-list / player-count answers) resolve the oldest entry
/// registered under the same key, so concurrent identical queries are
/// answered in the order they were issued.
#[derive(Default)]
pub struct PendingRequests {
    pending: Arc<PendingMap>,
    seq: AtomicU64,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register under a fresh token.
    pub fn register(&self, key: impl Into<String>) -> Waiter {
        self.register_with_token(Uuid::new_v4(), key)
    }

    /// Register under a caller-chosen token (e.g. the request envelope id).
    ///
    /// Re-using a live token replaces the older waiter, which then observes
    /// `Cancelled`.
    pub fn register_with_token(&self, token: Uuid, key: impl Into<String>) -> Waiter {
        let (tx, rx) = oneshot::channel();
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let entry = PendingEntry {
            key: key.into(),
            seq,
            created_at: Instant::now(),
            sender: tx,
        };
        debug!(token = %token, key = %entry.key, "registered pending request");
        if let Some(old) = self.pending.insert(token, entry) {
            warn!(token = %token, key = %old.key, "pending token reused; older waiter dropped");
        }
        Waiter {
            token,
            seq,
            rx,
            pending: Arc::clone(&self.pending),
        }
    }

    /// Remove the entry for `token`, leaving resolution to the caller.
    pub fn take(&self, token: Uuid) -> Option<PendingEntry> {
        self.pending.remove(&token).map(|(_, e)| e)
    }

    /// Resolve `token` with a reply. False if unknown or already resolved.
    pub fn complete(&self, token: Uuid, reply: Reply) -> bool {
        match self.take(token) {
            Some(entry) => entry.resolve(Ok(reply)),
            None => {
                debug!(token = %token, "reply for unknown or expired token");
                false
            }
        }
    }

    /// Resolve the oldest entry registered under `key`.
    pub fn complete_oldest(&self, key: &str, reply: Reply) -> bool {
        // retry if a concurrent resolver removed our pick between scan and remove
        loop {
            let oldest = self
                .pending
                .iter()
                .filter(|e| e.value().key == key)
                .min_by_key(|e| e.value().seq)
                .map(|e| *e.key());

            let Some(token) = oldest else {
                debug!(key = %key, "reply with no matching pending request");
                return false;
            };
            if let Some(entry) = self.take(token) {
                return entry.resolve(Ok(reply));
            }
        }
    }

    /// Cancel one request; its waiter observes `Cancelled`.
    pub fn cancel(&self, token: Uuid) -> bool {
        match self.take(token) {
            Some(entry) => {
                entry.resolve(Err(FabricError::Cancelled));
                true
            }
            None => false,
        }
    }

    /// Cancel everything outstanding. Returns how many were cancelled.
    pub fn cancel_all(&self) -> usize {
        let tokens: Vec<Uuid> = self.pending.iter().map(|e| *e.key()).collect();
        tokens.into_iter().filter(|t| self.cancel(*t)).count()
    }

    pub fn is_pending(&self, token: Uuid) -> bool {
        self.pending.contains_key(&token)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Caller side of a pending request.
pub struct Waiter {
    token: Uuid,
    seq: u64,
    rx: oneshot::Receiver<Result<Reply>>,
    pending: Arc<PendingMap>,
}

impl Waiter {
    pub fn token(&self) -> Uuid {
        self.token
    }

    /// Wait for the resolution, or time out.
    ///
    /// On timeout the entry is removed so a late reply finds nothing. If a
    /// reply won the race against the timer, that reply is returned.
    pub async fn wait(mut self, timeout: Duration) -> Result<Reply> {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(FabricError::Cancelled),
            Err(_) => {
                if self.purge() {
                    debug!(token = %self.token, timeout_ms = timeout.as_millis() as u64, "pending request timed out");
                    return Err(FabricError::Timeout);
                }
                match self.rx.try_recv() {
                    Ok(outcome) => outcome,
                    Err(_) => Err(FabricError::Cancelled),
                }
            }
        }
    }
}

impl Waiter {
    // only our own registration; a reused token may belong to a newer waiter
    fn purge(&self) -> bool {
        self.pending
            .remove_if(&self.token, |_, e| e.seq == self.seq)
            .is_some()
    }
}

impl Drop for Waiter {
    // a caller that stops waiting must not leave its entry behind
    fn drop(&mut self) {
        self.purge();
    }
}
