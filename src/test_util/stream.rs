use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::bail;
use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex, RwLock};

use crate::message::{Content, Message};
use crate::provider::name_service::NameRecord;
use crate::provider::stream_service::{Connection, MessageStream, StreamService};
use crate::reference::Reference;

/// An in-memory [MessageStream]. The test side is a [FakeStreamPeer] that delivers messages
///  into the stream and sees everything that was sent.
pub struct FakeMessageStream {
    inbound: Mutex<mpsc::UnboundedReceiver<anyhow::Result<Option<Message>>>>,
    sent: mpsc::UnboundedSender<Message>,
    fail_sends: Arc<AtomicBool>,
}

pub struct FakeStreamPeer {
    inbound: mpsc::UnboundedSender<anyhow::Result<Option<Message>>>,
    pub sent: mpsc::UnboundedReceiver<Message>,
    fail_sends: Arc<AtomicBool>,
}

pub fn fake_message_stream() -> (Arc<FakeMessageStream>, FakeStreamPeer) {
    let (inbound_send, inbound_recv) = mpsc::unbounded_channel();
    let (sent_send, sent_recv) = mpsc::unbounded_channel();
    let fail_sends = Arc::new(AtomicBool::new(false));

    let stream = FakeMessageStream {
        inbound: Mutex::new(inbound_recv),
        sent: sent_send,
        fail_sends: fail_sends.clone(),
    };
    let peer = FakeStreamPeer {
        inbound: inbound_send,
        sent: sent_recv,
        fail_sends,
    };
    (Arc::new(stream), peer)
}

#[async_trait]
impl MessageStream for FakeMessageStream {
    async fn send(&self, message: Message) -> anyhow::Result<()> {
        if self.fail_sends.load(Ordering::Acquire) {
            bail!("simulated transport failure");
        }
        let _ = self.sent.send(message);
        Ok(())
    }

    async fn receive(&self) -> anyhow::Result<Option<Message>> {
        match self.inbound.lock().await.recv().await {
            Some(received) => received,
            None => Ok(None),
        }
    }
}

impl FakeStreamPeer {
    pub fn deliver(&self, message: Message) {
        let _ = self.inbound.send(Ok(Some(message)));
    }

    /// makes the stream's next `receive` fail
    pub fn deliver_error(&self) {
        let _ = self.inbound.send(Err(anyhow::anyhow!("simulated receive failure")));
    }

    /// makes the stream's next `receive` report the end of the transport
    pub fn end(&self) {
        let _ = self.inbound.send(Ok(None));
    }

    pub fn fail_sends(&self) {
        self.fail_sends.store(true, Ordering::Release);
    }

    /// the next message that was sent to the peer, skipping polls
    pub async fn next_sent(&mut self) -> Option<Message> {
        loop {
            let message = self.sent.recv().await?;
            if !matches!(message.content, Content::Poll(_)) {
                return Some(message);
            }
        }
    }
}

/// A [Connection] over a [FakeMessageStream]
pub struct FakeConnection {
    pub stream_id: Reference,
    pub remote_id: Reference,
    stream: Arc<FakeMessageStream>,
    fail_open: bool,
    fail_close: bool,
    is_closed: AtomicBool,
}

#[async_trait]
impl Connection for FakeConnection {
    fn connection_string(&self) -> String {
        format!("fake://{}/{}", self.remote_id, self.stream_id)
    }

    fn is_polled(&self) -> bool {
        true
    }

    async fn open(&self) -> anyhow::Result<Arc<dyn MessageStream>> {
        if self.fail_open {
            bail!("simulated open failure");
        }
        Ok(self.stream.clone())
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.is_closed.store(true, Ordering::Release);
        if self.fail_close {
            bail!("simulated close failure");
        }
        Ok(())
    }
}

impl FakeConnection {
    pub fn is_closed(&self) -> bool {
        self.is_closed.load(Ordering::Acquire)
    }
}

/// Peer side of a connection created by [FakeStreamService]
pub struct FakeConnectionHandle {
    pub proxy: Reference,
    pub connection: Arc<FakeConnection>,
    pub peer: FakeStreamPeer,
}

/// A [StreamService] creating [FakeConnection]s. The peer side of every connection is passed
///  to the test through [FakeStreamService::next_connection].
pub struct FakeStreamService {
    connections_send: mpsc::UnboundedSender<FakeConnectionHandle>,
    connections_recv: Mutex<mpsc::UnboundedReceiver<FakeConnectionHandle>>,
    failing_opens: RwLock<Vec<Reference>>,
    failing_closes: RwLock<Vec<Reference>>,
}

impl Default for FakeStreamService {
    fn default() -> Self {
        let (connections_send, connections_recv) = mpsc::unbounded_channel();
        FakeStreamService {
            connections_send,
            connections_recv: Mutex::new(connections_recv),
            failing_opens: Default::default(),
            failing_closes: Default::default(),
        }
    }
}

impl FakeStreamService {
    pub async fn fail_open_for(&self, proxy: Reference) {
        self.failing_opens.write().await.push(proxy);
    }

    pub async fn fail_close_for(&self, proxy: Reference) {
        self.failing_closes.write().await.push(proxy);
    }

    pub async fn next_connection(&self) -> Option<FakeConnectionHandle> {
        self.connections_recv.lock().await
            .recv().await
    }
}

#[async_trait]
impl StreamService for FakeStreamService {
    async fn create_connection(&self, stream_id: Reference, remote_id: Reference, proxy: &NameRecord) -> anyhow::Result<Arc<dyn Connection>> {
        let (stream, peer) = fake_message_stream();
        let connection = Arc::new(FakeConnection {
            stream_id,
            remote_id,
            stream,
            fail_open: self.failing_opens.read().await.contains(&proxy.address),
            fail_close: self.failing_closes.read().await.contains(&proxy.address),
            is_closed: AtomicBool::new(false),
        });

        let _ = self.connections_send.send(FakeConnectionHandle {
            proxy: proxy.address,
            connection: connection.clone(),
            peer,
        });
        Ok(connection)
    }
}
