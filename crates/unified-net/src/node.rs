//! State shared by every adapter implementation.
//!
//! Both transports need the same bookkeeping around their wire: the
//! connected flag, the set of logical channels, listener dispatch, and the
//! pending-request map. `NodeCore` owns those so the adapters only deal
//! with their transport.
//!
//! The transport's receive task only routes: correlated replies resolve
//! their waiter on the spot, everything else is queued to a per-channel
//! listener worker. A listener may therefore await a request or query
//! without stalling the stream that carries the answer. Order within a
//! channel is preserved by the worker.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::{DashMap, DashSet};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use uuid::Uuid;

use unified_core::error::{FabricError, Result};
use unified_core::protocol::now_millis;

use crate::adapter::ReceivedMessage;
use crate::correlation::{PendingRequests, Reply, Waiter};
use crate::dispatch::{ChannelListener, Dispatcher};
use crate::obs::FabricMetrics;

/// Messages a channel's listeners may fall behind by before drops start.
const LISTENER_QUEUE: usize = 1024;

pub struct NodeCore {
    server_id: Arc<str>,
    connected: AtomicBool,
    channels: DashSet<String>,
    dispatcher: Arc<Dispatcher>,
    /// channel -> listener worker queue
    workers: DashMap<String, mpsc::Sender<ReceivedMessage>>,
    pending: PendingRequests,
    metrics: Arc<FabricMetrics>,
    request_timeout: Duration,
}

impl NodeCore {
    pub fn new(server_id: impl Into<Arc<str>>, request_timeout: Duration) -> Self {
        Self {
            server_id: server_id.into(),
            connected: AtomicBool::new(false),
            channels: DashSet::new(),
            dispatcher: Arc::new(Dispatcher::new()),
            workers: DashMap::new(),
            pending: PendingRequests::new(),
            metrics: Arc::new(FabricMetrics::default()),
            request_timeout,
        }
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn metrics(&self) -> Arc<FabricMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn pending(&self) -> &PendingRequests {
        &self.pending
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn ensure_connected(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(FabricError::NotConnected)
        }
    }

    /// Flip to connected. False if already connected.
    pub fn mark_connected(&self) -> bool {
        !self.connected.swap(true, Ordering::AcqRel)
    }

    /// Flip to disconnected. False if it was not connected.
    pub fn mark_disconnected(&self) -> bool {
        self.connected.swap(false, Ordering::AcqRel)
    }

    pub fn validate_channel(channel: &str) -> Result<()> {
        if channel.is_empty() {
            return Err(FabricError::Config("channel name must not be empty".into()));
        }
        if channel.contains('|') {
            return Err(FabricError::Config(format!("channel name must not contain '|': {channel}")));
        }
        Ok(())
    }

    /// Track a logical channel. False if it was already tracked.
    pub fn track_channel(&self, channel: &str) -> bool {
        self.channels.insert(channel.to_string())
    }

    pub fn untrack_channel(&self, channel: &str) -> bool {
        self.channels.remove(channel).is_some()
    }

    pub fn is_tracked(&self, channel: &str) -> bool {
        self.channels.contains(channel)
    }

    pub fn channels(&self) -> Vec<String> {
        self.channels.iter().map(|c| c.key().clone()).collect()
    }

    pub fn add_listener(&self, channel: &str, listener: Arc<dyn ChannelListener>) {
        self.dispatcher.register(channel, listener);
    }

    /// Route one inbound message. Never waits on listeners.
    ///
    /// Expired envelopes are dropped. A correlated reply goes to its waiter,
    /// or is dropped when nobody waits for it any more; it never reaches
    /// listeners. Broadcasts are only dispatched on tracked channels;
    /// unicast is always dispatched.
    pub fn deliver(&self, msg: ReceivedMessage) {
        let env = &msg.envelope;
        if env.is_expired(now_millis()) {
            tracing::debug!(server = %self.server_id, channel = %msg.channel, id = %env.id(), ttl = env.ttl(), "dropping expired envelope");
            self.metrics.expired_dropped.inc(&[("channel", msg.channel.as_str())]);
            return;
        }

        if let Some(cid) = env.correlation_id() {
            match self.pending.take(cid) {
                Some(entry) => {
                    tracing::trace!(server = %self.server_id, correlation = %cid, "correlated reply");
                    entry.resolve(Ok(Reply::Message(msg)));
                    self.sync_pending_gauge();
                }
                None => {
                    tracing::debug!(server = %self.server_id, channel = %msg.channel, correlation = %cid, source = %msg.source_server, "dropping reply with no pending request");
                    self.metrics.late_replies.inc(&[("channel", msg.channel.as_str())]);
                }
            }
            return;
        }

        if env.is_broadcast() && !self.is_tracked(&msg.channel) {
            tracing::trace!(server = %self.server_id, channel = %msg.channel, "broadcast on untracked channel");
            return;
        }

        self.metrics.messages_received.inc(&[("channel", msg.channel.as_str())]);
        tracing::debug!(server = %self.server_id, channel = %msg.channel, source = %msg.source_server, "delivering message");
        self.enqueue(msg);
    }

    fn enqueue(&self, msg: ReceivedMessage) {
        let tx = {
            let mut worker = self
                .workers
                .entry(msg.channel.clone())
                .or_insert_with(|| spawn_worker(Arc::clone(&self.dispatcher)));
            // a panicking listener takes its worker down with it
            if worker.is_closed() {
                *worker = spawn_worker(Arc::clone(&self.dispatcher));
            }
            worker.clone()
        };
        match tx.try_send(msg) {
            Ok(()) => {}
            Err(TrySendError::Full(msg)) => {
                tracing::warn!(server = %self.server_id, channel = %msg.channel, source = %msg.source_server, "listener queue full; dropping message");
                self.metrics.dispatch_dropped.inc(&[("channel", msg.channel.as_str())]);
            }
            Err(TrySendError::Closed(msg)) => {
                tracing::warn!(server = %self.server_id, channel = %msg.channel, "listener worker gone; dropping message");
                self.metrics.dispatch_dropped.inc(&[("channel", msg.channel.as_str())]);
            }
        }
    }

    /// Let the listener workers drain what they hold and exit.
    pub fn stop_listeners(&self) {
        self.workers.clear();
    }

    /// Register a waiter under `token`.
    pub fn begin_request(&self, token: Uuid, key: impl Into<String>) -> Waiter {
        let waiter = self.pending.register_with_token(token, key);
        self.sync_pending_gauge();
        waiter
    }

    /// Wait for `waiter`, recording the outcome. `None` uses the configured
    /// request timeout.
    pub async fn finish_request(&self, waiter: Waiter, timeout: Option<Duration>) -> Result<Reply> {
        let started = Instant::now();
        let res = waiter.wait(timeout.unwrap_or(self.request_timeout)).await;
        let outcome = match &res {
            Ok(_) => "ok",
            Err(FabricError::Timeout) => "timeout",
            Err(FabricError::Cancelled) => "cancelled",
            Err(_) => "failed",
        };
        self.metrics.requests.inc(&[("outcome", outcome)]);
        self.metrics.request_duration.observe(&[("outcome", outcome)], started.elapsed());
        self.sync_pending_gauge();
        res
    }

    /// Resolve every outstanding request with `Cancelled`.
    pub fn cancel_pending(&self) -> usize {
        let n = self.pending.cancel_all();
        self.sync_pending_gauge();
        n
    }

    fn sync_pending_gauge(&self) {
        self.metrics.pending_requests.set(&[], self.pending.len() as i64);
    }
}

fn spawn_worker(dispatcher: Arc<Dispatcher>) -> mpsc::Sender<ReceivedMessage> {
    let (tx, mut rx) = mpsc::channel::<ReceivedMessage>(LISTENER_QUEUE);
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            dispatcher.dispatch(msg).await;
        }
    });
    tx
}
