#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use uuid::Uuid;

use unified_core::protocol::frame::Frame;
use unified_core::{Envelope, Result};
use unified_net::adapter::{build, Backend, ChannelAdapter, ChannelAdapterExt, ReceivedMessage};
use unified_net::config::{BackendKind, FabricConfig};
use unified_net::dispatch::{queue_listener, ChannelListener};
use unified_net::proxy::{LocalProxy, ProxyBroker};

const PHYSICAL: &str = "unified:main";

fn node(proxy: &Arc<LocalProxy>, id: &str) -> Arc<dyn ChannelAdapter> {
    let cfg = FabricConfig::for_server(id).with_backend(BackendKind::Proxy);
    build(&cfg, Backend::Proxy(proxy.clone())).unwrap()
}

async fn up(proxy: &Arc<LocalProxy>, id: &str, channels: &[&str]) -> (Arc<dyn ChannelAdapter>, UnboundedReceiver<ReceivedMessage>) {
    let a = node(proxy, id);
    let (l, rx) = queue_listener();
    for ch in channels {
        a.register_channel(ch).await.unwrap();
        a.add_listener(ch, l.clone());
    }
    a.connect().await.unwrap();
    (a, rx)
}

async fn recv(rx: &mut UnboundedReceiver<ReceivedMessage>) -> ReceivedMessage {
    tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("timed out")
        .expect("listener closed")
}

async fn assert_quiet(rx: &mut UnboundedReceiver<ReceivedMessage>) {
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rx.try_recv().is_err(), "unexpected delivery");
}

struct Echo {
    adapter: Weak<dyn ChannelAdapter>,
}

#[async_trait]
impl ChannelListener for Echo {
    async fn on_message(&self, msg: ReceivedMessage) -> Result<()> {
        let Some(a) = self.adapter.upgrade() else { return Ok(()) };
        let text: String = msg.payload()?;
        let answer = Envelope::wrap(msg.channel.clone(), &format!("echo:{text}"), a.server_id())?;
        a.reply(&msg, answer).await
    }
}

#[tokio::test]
async fn broadcast_reaches_each_other_server_once() {
    let proxy = LocalProxy::new();
    let (a, mut ra) = up(&proxy, "A", &["chat"]).await;
    let (_b, mut rb) = up(&proxy, "B", &["chat"]).await;
    let (_c, mut rc) = up(&proxy, "C", &["chat"]).await;

    a.broadcast_msg("chat", &"hi".to_string()).await.unwrap();

    for rx in [&mut rb, &mut rc] {
        let msg = recv(rx).await;
        assert_eq!(msg.source_server, "A");
        assert_eq!(msg.payload::<String>().unwrap(), "hi");
        assert_quiet(rx).await;
    }
    assert_quiet(&mut ra).await;
}

#[tokio::test]
async fn send_to_client_uses_client_frame_and_owning_server() {
    let proxy = LocalProxy::new();
    let (a, _) = up(&proxy, "A", &[]).await;
    let (_b, mut rb) = up(&proxy, "B", &["notify"]).await;
    let (_c, mut rc) = up(&proxy, "C", &["notify"]).await;

    let client = Uuid::from_u128(42);
    assert!(proxy.connect_player(client, "B").await.unwrap());

    a.send_msg_to_client("notify", client, &"data".to_string()).await.unwrap();

    let msg = recv(&mut rb).await;
    assert_eq!(msg.client, Some(client));
    assert_eq!(msg.source_server, "A");
    assert_eq!(msg.payload::<String>().unwrap(), "data");
    assert_quiet(&mut rc).await;

    let err = a.send_to_client(Uuid::from_u128(7), msg.envelope).await.unwrap_err();
    assert_eq!(err.kind().as_str(), "CLIENT_NOT_FOUND");
}

#[tokio::test]
async fn cluster_queries_go_through_query_frames() {
    let proxy = LocalProxy::new();
    let (a, _) = up(&proxy, "A", &[]).await;
    let (_b, _) = up(&proxy, "B", &[]).await;
    proxy.connect_player(Uuid::from_u128(1), "B").await.unwrap();
    proxy.connect_player(Uuid::from_u128(2), "B").await.unwrap();

    assert_eq!(a.server_ids().await.unwrap(), vec!["A", "B"]);
    assert_eq!(a.client_count("B").await.unwrap(), 2);
    assert_eq!(a.client_count("A").await.unwrap(), 0);

    // identical concurrent queries each get an answer
    let (x, y) = tokio::join!(a.server_ids(), a.server_ids());
    assert_eq!(x.unwrap(), y.unwrap());

    assert_eq!(a.total_client_count().await.unwrap(), 2);
    assert_eq!(a.clients_on("B").await.unwrap(), vec![Uuid::from_u128(1), Uuid::from_u128(2)]);
    assert_eq!(a.find_client_server(Uuid::from_u128(2)).await.unwrap().as_deref(), Some("B"));
    assert_eq!(a.metrics().pending_requests.get(&[]), 0);
}

/// Answers each chat line with the cluster's server list.
struct Roster {
    adapter: Weak<dyn ChannelAdapter>,
    results: UnboundedSender<Result<Vec<String>>>,
}

#[async_trait]
impl ChannelListener for Roster {
    async fn on_message(&self, _msg: ReceivedMessage) -> Result<()> {
        let Some(a) = self.adapter.upgrade() else { return Ok(()) };
        let _ = self.results.send(a.server_ids().await);
        Ok(())
    }
}

#[tokio::test]
async fn listener_can_query_the_proxy() {
    let proxy = LocalProxy::new();
    let (a, _) = up(&proxy, "A", &[]).await;
    let (b, _) = up(&proxy, "B", &[]).await;
    b.register_channel("chat").await.unwrap();
    let (tx, mut results) = mpsc::unbounded_channel();
    b.add_listener("chat", Arc::new(Roster { adapter: Arc::downgrade(&b), results: tx }));

    // the response frame shares the physical channel with the chat line
    a.broadcast_msg("chat", &"who".to_string()).await.unwrap();

    let servers = tokio::time::timeout(Duration::from_secs(1), results.recv())
        .await
        .expect("listener stalled")
        .expect("listener gone");
    assert_eq!(servers.unwrap(), vec!["A", "B"]);
    assert_eq!(b.metrics().requests.get(&[("outcome", "ok")]), 1);
}

#[tokio::test]
async fn late_reply_is_not_answered_again() {
    let proxy = LocalProxy::new();
    let (a, mut ra) = up(&proxy, "A", &["rpc"]).await;
    let (b, _) = up(&proxy, "B", &[]).await;
    // B answers after A gave up, and A holds an echo handler of its own
    let slow = Delayed(Duration::from_millis(100), Echo { adapter: Arc::downgrade(&b) });
    b.add_listener("rpc", Arc::new(slow));
    a.add_listener("rpc", Arc::new(Echo { adapter: Arc::downgrade(&a) }));

    let req = Envelope::wrap("rpc", &"ping".to_string(), "A").unwrap();
    let err = a.request("B", req, Some(Duration::from_millis(20))).await.unwrap_err();
    assert_eq!(err.kind().as_str(), "TIMEOUT");

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(ra.try_recv().is_err(), "late reply was dispatched");
    assert_eq!(a.metrics().late_replies.get(&[("channel", "rpc")]), 1);
    assert_eq!(b.metrics().messages_received.get(&[("channel", "rpc")]), 1);
}

struct Delayed<L>(Duration, L);

#[async_trait]
impl<L: ChannelListener> ChannelListener for Delayed<L> {
    async fn on_message(&self, msg: ReceivedMessage) -> Result<()> {
        tokio::time::sleep(self.0).await;
        self.1.on_message(msg).await
    }
}

#[tokio::test]
async fn malformed_frame_does_not_stop_receive_loop() {
    let proxy = LocalProxy::new();
    let (a, _) = up(&proxy, "A", &[]).await;
    let (b, mut rb) = up(&proxy, "B", &["chat"]).await;

    assert!(proxy.inject("B", PHYSICAL, Bytes::from_static(&[0x7f, 0x01])));
    let bad_envelope = Frame::Forward {
        target: "B".into(),
        channel: "chat".into(),
        source: "A".into(),
        payload: Bytes::from_static(b"{not json"),
    };
    assert!(proxy.inject("B", PHYSICAL, bad_envelope.encode().unwrap()));

    a.broadcast_msg("chat", &"still here".to_string()).await.unwrap();
    let msg = recv(&mut rb).await;
    assert_eq!(msg.payload::<String>().unwrap(), "still here");

    let m = b.metrics();
    assert_eq!(m.decode_errors.get(&[("source", "frame")]), 1);
    assert_eq!(m.decode_errors.get(&[("source", "envelope")]), 1);
}

#[tokio::test]
async fn unicast_to_unknown_server_is_dropped_silently() {
    let proxy = LocalProxy::new();
    let (a, _) = up(&proxy, "A", &[]).await;
    a.send_msg("chat", "nobody", &"x".to_string()).await.unwrap();
    assert_eq!(a.metrics().messages_sent.get(&[("route", "unicast")]), 0);
}

#[tokio::test]
async fn request_reply_and_disconnect_cancel() {
    let proxy = LocalProxy::new();
    let (a, _) = up(&proxy, "A", &[]).await;
    let (b, _) = up(&proxy, "B", &[]).await;
    let (_c, _) = up(&proxy, "C", &[]).await;
    b.add_listener("rpc", Arc::new(Echo { adapter: Arc::downgrade(&b) }));

    let req = Envelope::wrap("rpc", &"ping".to_string(), "A").unwrap();
    let resp = a.request("B", req, None).await.unwrap();
    assert_eq!(resp.payload::<String>().unwrap(), "echo:ping");
    assert_eq!(resp.source_server, "B");

    // C never answers
    let req = Envelope::wrap("rpc", &"ping".to_string(), "A").unwrap();
    let err = a.request("C", req, Some(Duration::from_millis(100))).await.unwrap_err();
    assert_eq!(err.kind().as_str(), "TIMEOUT");

    let req = Envelope::wrap("rpc", &"ping".to_string(), "A").unwrap();
    let caller = Arc::clone(&a);
    let pending = tokio::spawn(async move { caller.request("C", req, Some(Duration::from_secs(30))).await });
    while a.metrics().pending_requests.get(&[]) == 0 {
        tokio::task::yield_now().await;
    }
    a.disconnect().await.unwrap();
    a.disconnect().await.unwrap();

    let err = pending.await.unwrap().unwrap_err();
    assert_eq!(err.kind().as_str(), "CANCELLED");
    assert_eq!(a.server_ids().await.unwrap_err().kind().as_str(), "NOT_CONNECTED");
    assert_eq!(b.server_ids().await.unwrap(), vec!["B", "C"]);
}

#[tokio::test]
async fn control_operations_go_to_broker() {
    let proxy = LocalProxy::new();
    let (a, _) = up(&proxy, "A", &[]).await;
    let (_b, _) = up(&proxy, "B", &[]).await;
    let client = Uuid::from_u128(42);
    proxy.connect_player(client, "A").await.unwrap();

    // locations belong to the proxy
    a.register_client(Uuid::from_u128(99)).await.unwrap();
    assert_eq!(a.find_client_server(Uuid::from_u128(99)).await.unwrap(), None);

    a.transfer_client(client, "B").await.unwrap();
    assert_eq!(proxy.get_player_server(client).await.unwrap().as_deref(), Some("B"));

    let err = a.transfer_client(client, "nowhere").await.unwrap_err();
    assert_eq!(err.kind().as_str(), "SERVER_NOT_FOUND");

    a.kick_client(client, "bye").await.unwrap();
    let err = a.kick_client(client, "bye").await.unwrap_err();
    assert_eq!(err.kind().as_str(), "CLIENT_NOT_FOUND");
}

#[tokio::test]
async fn lifecycle_edges() {
    let proxy = LocalProxy::new();
    let a = node(&proxy, "A");
    a.disconnect().await.unwrap();

    let env = Envelope::wrap("chat", &"x".to_string(), "A").unwrap();
    assert_eq!(a.broadcast(env).await.unwrap_err().kind().as_str(), "NOT_CONNECTED");

    proxy.set_reachable(false);
    assert_eq!(a.connect().await.unwrap_err().kind().as_str(), "TRANSPORT");
    assert!(!a.is_connected());

    proxy.set_reachable(true);
    a.connect().await.unwrap();
    a.connect().await.unwrap();
    assert!(a.is_connected());
    a.register_channel("chat").await.unwrap();
    a.register_channel("chat").await.unwrap();
    a.unregister_channel("never").await.unwrap();
}
