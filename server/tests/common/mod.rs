//! Shared helpers for integration tests: an in-memory socket double and
//! hub construction over a shared in-process bus.

#![allow(dead_code)]

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::extract::ws::Message;
use futures_util::{Sink, Stream};
use serde_json::Value;
use tokio::sync::mpsc;

use tidings_server::hub::{Hub, HubSettings};
use tidings_server::lookup::InMemoryMembership;
use tidings_server::relay::{MemoryBus, MessageBus};
use tidings_server::ws::{InboundHandler, InboundMessage};

/// Server side of an in-memory connection.
pub struct MockSocket {
    incoming: mpsc::UnboundedReceiver<Result<Message, io::Error>>,
    outgoing: mpsc::UnboundedSender<Message>,
}

/// Client side of an in-memory connection.
pub struct MockPeer {
    pub tx: mpsc::UnboundedSender<Result<Message, io::Error>>,
    pub rx: mpsc::UnboundedReceiver<Message>,
}

pub fn mock_socket() -> (MockSocket, MockPeer) {
    let (to_server, incoming) = mpsc::unbounded_channel();
    let (outgoing, from_server) = mpsc::unbounded_channel();
    (
        MockSocket { incoming, outgoing },
        MockPeer {
            tx: to_server,
            rx: from_server,
        },
    )
}

impl Stream for MockSocket {
    type Item = Result<Message, io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.incoming.poll_recv(cx)
    }
}

impl Sink<Message> for MockSocket {
    type Error = io::Error;

    fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn start_send(self: Pin<&mut Self>, item: Message) -> Result<(), Self::Error> {
        self.outgoing
            .send(item)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "peer gone"))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }
}

impl MockPeer {
    pub fn send_text(&self, text: &str) {
        let _ = self.tx.send(Ok(Message::Text(text.into())));
    }

    /// Next frame from the server, or `None` after a short wait.
    pub async fn next_frame(&mut self) -> Option<Message> {
        tokio::time::timeout(Duration::from_millis(300), self.rx.recv())
            .await
            .ok()
            .flatten()
    }

    /// Next text frame decoded as JSON, skipping keepalive probes.
    pub async fn next_json(&mut self) -> Option<Value> {
        loop {
            match self.next_frame().await? {
                Message::Text(text) => return serde_json::from_str(text.as_str()).ok(),
                Message::Ping(_) | Message::Pong(_) => continue,
                _ => return None,
            }
        }
    }
}

pub async fn start_hub(
    bus: &Arc<MemoryBus>,
    membership: &Arc<InMemoryMembership>,
    instance_id: &str,
) -> (Arc<Hub>, mpsc::UnboundedReceiver<InboundMessage>) {
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let hub = start_hub_with(bus, membership, instance_id, Arc::new(inbound_tx)).await;
    (hub, inbound_rx)
}

pub async fn start_hub_with(
    bus: &Arc<MemoryBus>,
    membership: &Arc<InMemoryMembership>,
    instance_id: &str,
    inbound: Arc<dyn InboundHandler>,
) -> Arc<Hub> {
    let settings = HubSettings {
        instance_id: instance_id.to_string(),
        ..Default::default()
    };
    start_hub_with_settings(bus, membership, settings, inbound).await
}

pub async fn start_hub_with_settings(
    bus: &Arc<MemoryBus>,
    membership: &Arc<InMemoryMembership>,
    settings: HubSettings,
    inbound: Arc<dyn InboundHandler>,
) -> Arc<Hub> {
    let hub = Hub::start(
        settings,
        bus.clone() as Arc<dyn MessageBus>,
        membership.clone(),
        inbound,
    )
    .await
    .expect("hub should start on the in-process bus");
    Arc::new(hub)
}

/// Wait until `check` holds, polling for up to a second.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
