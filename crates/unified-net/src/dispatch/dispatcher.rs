use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::stream::FuturesUnordered;
use futures_util::StreamExt;
use tokio::sync::mpsc;

use unified_core::error::Result;

use crate::adapter::ReceivedMessage;

/// Receives decoded messages for the logical channels it is attached to.
#[async_trait]
pub trait ChannelListener: Send + Sync {
    async fn on_message(&self, msg: ReceivedMessage) -> Result<()>;
}

/// Registry of listeners per logical channel.
#[derive(Default)]
pub struct Dispatcher {
    listeners: DashMap<String, Vec<Arc<dyn ChannelListener>>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            listeners: DashMap::new(),
        }
    }

    /// Attach a listener. The same `Arc` attached twice to one channel is
    /// kept once.
    pub fn register(&self, channel: &str, listener: Arc<dyn ChannelListener>) {
        let mut entry = self.listeners.entry(channel.to_string()).or_insert_with(Vec::new);
        if !entry.iter().any(|l| Arc::ptr_eq(l, &listener)) {
            entry.push(listener);
        }
    }

    /// Hand `msg` to every listener of its channel, concurrently.
    ///
    /// Listener errors are logged and never propagate: one failing listener
    /// does not affect the others or the receive loop. Returns how many
    /// listeners were invoked.
    pub async fn dispatch(&self, msg: ReceivedMessage) -> usize {
        // clone out of the map; listeners must not run under a shard lock
        let handlers: Vec<Arc<dyn ChannelListener>> = match self.listeners.get(&msg.channel) {
            Some(ls) => ls.value().clone(),
            None => {
                tracing::trace!(channel = %msg.channel, "no listeners for channel");
                return 0;
            }
        };

        let count = handlers.len();
        let mut futs = FuturesUnordered::new();
        for h in handlers {
            let m = msg.clone();
            futs.push(async move { h.on_message(m).await });
        }
        while let Some(res) = futs.next().await {
            if let Err(e) = res {
                tracing::warn!(channel = %msg.channel, source = %msg.source_server, error = %e, "listener failed");
            }
        }
        count
    }
}

/// Listener that queues every message for the caller to pull.
pub struct QueueListener {
    tx: mpsc::UnboundedSender<ReceivedMessage>,
}

#[async_trait]
impl ChannelListener for QueueListener {
    async fn on_message(&self, msg: ReceivedMessage) -> Result<()> {
        // receiver gone means the caller stopped caring
        let _ = self.tx.send(msg);
        Ok(())
    }
}

/// A listener plus the receiving end of its queue.
pub fn queue_listener() -> (Arc<QueueListener>, mpsc::UnboundedReceiver<ReceivedMessage>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(QueueListener { tx }), rx)
}
