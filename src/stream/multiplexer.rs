use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::bail;
use tokio::select;
use tokio::sync::{mpsc, oneshot, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, span, trace, warn, Instrument, Level, Span};
use uuid::Uuid;

use crate::config::ProxyConfig;
use crate::error::SocketError;
use crate::message::payloads::Poll;
use crate::message::{Content, Message};
use crate::provider::stream_service::MessageStream;
use crate::reference::Reference;
use crate::stream::sequencer::{SequenceGenerator, SequenceTracker};
use crate::util::safe_converter::MillisCast;

/// Capacity of the outgoing queue. Senders are suspended while a message is waiting for the
///  pump, which is the only backpressure between a socket and its proxy.
pub const OUTGOING_CAPACITY: usize = 1;

/// The state of the pump moving messages between a [LinkStream]'s queues and its transport
#[derive(Debug)]
enum PumpState {
    Idle,
    Pumping {
        handle: JoinHandle<PumpExit>,
        stop: oneshot::Sender<()>,
    },
    /// a previous pump is being shut down before a new one takes over
    Draining,
}

#[derive(Debug)]
enum PumpExit {
    /// stopped because a new transport was attached
    Detached,
    /// the outgoing queue was completed and `Close` was sent
    Completed,
    /// the proxy sent `Close`
    RemoteClosed,
    TransportClosed,
    Faulted(anyhow::Error),
}

/// State that is passed from one pump to the next when a new transport is attached
struct PumpResources {
    outgoing: mpsc::Receiver<Message>,
    send_sequence: SequenceGenerator,
    receive_sequence: SequenceTracker,
}

struct StreamInner {
    stream_id: Reference,
    remote_id: Reference,
    config: Arc<ProxyConfig>,
    inbound: mpsc::UnboundedSender<Message>,
    resources: Mutex<PumpResources>,
    /// the last transport ended or failed, and no new one was attached yet
    is_detached: AtomicBool,
}

impl StreamInner {
    fn message(&self, content: Content) -> Message {
        Message::new(self.stream_id, self.remote_id, content)
    }

    /// Handles a message received from the transport, returns `true` if the stream was closed
    fn on_received(&self, mut message: Message, receive_sequence: &mut SequenceTracker) -> bool {
        trace!("received {:?} on stream {}", message.content.kind(), self.stream_id);

        let is_close = match &message.content {
            Content::Poll(_) => {
                trace!("dropping poll message");
                return false;
            }
            Content::Data(data) => {
                if !receive_sequence.check(data.sequence_number) {
                    warn!("stream {}: sequence gap before message #{}, flagging it as a communication error", self.stream_id, data.sequence_number);
                    message.error = SocketError::Comm.code();
                }
                false
            }
            Content::Close => {
                debug!("stream {} was closed by the proxy", self.stream_id);
                true
            }
            other => {
                debug!("forwarding unexpected {:?} on stream {}", other.kind(), self.stream_id);
                false
            }
        };

        if self.inbound.send(message).is_err() {
            debug!("stream {} has no reader any more, discarding message", self.stream_id);
        }
        is_close
    }

    /// lets the reader know that the stream ended without a `Close` from the proxy
    fn deliver_close(&self, error: SocketError) {
        let close = Message::new(self.remote_id, self.stream_id, Content::Close)
            .with_error(error);
        let _ = self.inbound.send(close);
    }
}

/// A sequenced message stream between a link and its proxy on top of an external, unordered
///  [MessageStream] transport.
///
/// Outgoing messages go through a queue of capacity [OUTGOING_CAPACITY] and are moved to the
///  transport by a single pump task, which also
/// * numbers outgoing `Data` messages,
/// * sends a `Poll` whenever nothing was sent for `poll_interval`,
/// * checks the sequence of incoming `Data` messages, flagging gaps,
/// * ends the stream when the proxy sends `Close`, or sends `Close` itself when the outgoing
///  queue is completed by [LinkStream::close].
///
/// Transports can be replaced by attaching a new one: the previous pump is stopped and awaited
///  before a new pump starts, and numbering continues where it left off. A transport that ends
///  or fails leaves the outgoing queue intact, so messages that were queued at that time are
///  sent over the next transport.
pub struct LinkStream {
    inner: Arc<StreamInner>,
    outgoing: RwLock<Option<mpsc::Sender<Message>>>,
    inbound: Mutex<mpsc::UnboundedReceiver<Message>>,
    pump: Mutex<PumpState>,
    opened: watch::Sender<bool>,
}

impl Drop for LinkStream {
    fn drop(&mut self) {
        if let PumpState::Pumping { handle, .. } = self.pump.get_mut() {
            handle.abort();
        }
    }
}

impl LinkStream {
    pub fn new(stream_id: Reference, remote_id: Reference, config: Arc<ProxyConfig>) -> LinkStream {
        let (outgoing_send, outgoing_recv) = mpsc::channel(OUTGOING_CAPACITY);
        let (inbound_send, inbound_recv) = mpsc::unbounded_channel();

        LinkStream {
            inner: Arc::new(StreamInner {
                stream_id,
                remote_id,
                config,
                inbound: inbound_send,
                resources: Mutex::new(PumpResources {
                    outgoing: outgoing_recv,
                    send_sequence: SequenceGenerator::default(),
                    receive_sequence: SequenceTracker::default(),
                }),
                is_detached: AtomicBool::new(false),
            }),
            outgoing: RwLock::new(Some(outgoing_send)),
            inbound: Mutex::new(inbound_recv),
            pump: Mutex::new(PumpState::Idle),
            opened: watch::Sender::new(false),
        }
    }

    pub fn stream_id(&self) -> Reference {
        self.inner.stream_id
    }

    pub fn remote_id(&self) -> Reference {
        self.inner.remote_id
    }

    pub fn is_open(&self) -> bool {
        *self.opened.borrow()
    }

    pub fn is_detached(&self) -> bool {
        self.inner.is_detached.load(Ordering::Acquire)
    }

    /// Completes once a transport was attached for the first time
    pub async fn wait_open(&self) {
        let mut opened = self.opened.subscribe();
        let _ = opened.wait_for(|is_open| *is_open).await;
    }

    /// Starts pumping messages over a (new) transport. A pump that is running for a previous
    ///  transport is stopped and awaited first.
    pub async fn attach(&self, transport: Arc<dyn MessageStream>) -> anyhow::Result<()> {
        if self.outgoing.read().await.is_none() {
            bail!("stream {} is closed", self.inner.stream_id);
        }

        let mut state = self.pump.lock().await;
        if let PumpState::Pumping { handle, stop } = std::mem::replace(&mut *state, PumpState::Draining) {
            debug!("stream {}: stopping previous pump before attaching a new transport", self.inner.stream_id);
            let _ = stop.send(());
            match handle.await {
                Ok(exit) => debug!("previous pump finished: {:?}", exit),
                Err(e) => warn!("previous pump failed: {}", e),
            }
        }

        let (stop_send, stop_recv) = oneshot::channel();
        let handle = tokio::spawn(
            Self::pump(self.inner.clone(), transport, stop_recv)
                .instrument(Span::current())
        );
        *state = PumpState::Pumping { handle, stop: stop_send };
        self.inner.is_detached.store(false, Ordering::Release);
        drop(state);

        self.opened.send_replace(true);
        Ok(())
    }

    /// Enqueues content for sending. This suspends while the previous message was not yet taken
    ///  by the pump, in particular while no transport was attached yet. After the transport
    ///  ended or failed, sending fails until a new transport is attached.
    pub async fn send(&self, content: Content) -> anyhow::Result<()> {
        let sender = match self.outgoing.read().await.as_ref() {
            Some(sender) => sender.clone(),
            None => bail!("stream {} is closed", self.inner.stream_id),
        };
        if self.is_detached() {
            bail!("transport of stream {} is gone", self.inner.stream_id);
        }
        sender.send(self.inner.message(content)).await?;
        Ok(())
    }

    /// Waits for the next received message. The end of the stream is signalled by a `Close`
    ///  message, which carries an error code if the transport failed.
    pub async fn receive(&self) -> Option<Message> {
        self.inbound.lock().await
            .recv().await
    }

    pub fn try_receive(&self) -> Option<Message> {
        self.inbound.try_lock().ok()?
            .try_recv().ok()
    }

    /// Completes the outgoing queue and waits for the pump to flush it and send `Close`.
    ///  Closing a stream that was never attached or is closed already is a no-op.
    pub async fn close(&self) -> anyhow::Result<()> {
        if self.outgoing.write().await.take().is_none() {
            debug!("stream {} was closed already", self.inner.stream_id);
            return Ok(());
        }

        let mut state = self.pump.lock().await;
        let result = match std::mem::replace(&mut *state, PumpState::Idle) {
            PumpState::Pumping { handle, stop } => {
                let exit = handle.await;
                drop(stop);
                match exit {
                    Ok(PumpExit::Completed) | Ok(PumpExit::RemoteClosed) | Ok(PumpExit::TransportClosed) => Ok(()),
                    Ok(PumpExit::Faulted(e)) => Err(e),
                    Ok(PumpExit::Detached) => bail!("stream {} was detached while closing", self.inner.stream_id),
                    Err(e) => Err(e.into()),
                }
            }
            _ => Ok(()),
        };
        drop(state);

        // senders still waiting for a transport fail now
        self.inner.resources.lock().await
            .outgoing.close();
        info!("stream {} closed", self.inner.stream_id);
        result
    }

    async fn pump(inner: Arc<StreamInner>, transport: Arc<dyn MessageStream>, mut stop: oneshot::Receiver<()>) -> PumpExit {
        let mut resources = inner.resources.lock().await;
        let PumpResources { outgoing, send_sequence, receive_sequence } = &mut *resources;

        debug!("starting pump for stream {}", inner.stream_id);
        let exit = select! {
            exit = Self::send_loop(&inner, transport.as_ref(), outgoing, send_sequence, &mut stop) => exit,
            exit = Self::receive_loop(&inner, transport.as_ref(), receive_sequence) => exit,
        };
        debug!("pump for stream {} finished: {:?}", inner.stream_id, exit);

        match &exit {
            PumpExit::Faulted(e) => {
                warn!("transport of stream {} failed: {}", inner.stream_id, e);
                inner.is_detached.store(true, Ordering::Release);
                inner.deliver_close(SocketError::Comm);
            }
            PumpExit::TransportClosed => {
                inner.is_detached.store(true, Ordering::Release);
                inner.deliver_close(SocketError::Closed);
            }
            PumpExit::Completed | PumpExit::RemoteClosed => {
                // nobody is going to take messages from the queue any more
                outgoing.close();
            }
            PumpExit::Detached => {}
        }
        exit
    }

    async fn send_loop(
        inner: &StreamInner,
        transport: &dyn MessageStream,
        outgoing: &mut mpsc::Receiver<Message>,
        send_sequence: &mut SequenceGenerator,
        stop: &mut oneshot::Receiver<()>,
    ) -> PumpExit {
        loop {
            let mut message = select! {
                biased;
                _ = &mut *stop => {
                    return PumpExit::Detached;
                }
                message = outgoing.recv() => match message {
                    Some(message) => message,
                    None => {
                        debug!("outgoing queue of stream {} completed, sending close", inner.stream_id);
                        return match transport.send(inner.message(Content::Close)).await {
                            Ok(()) => PumpExit::Completed,
                            Err(e) => PumpExit::Faulted(e),
                        };
                    }
                },
                _ = sleep(inner.config.poll_interval) => {
                    trace!("stream {} idle, polling", inner.stream_id);
                    inner.message(Content::Poll(Poll { timeout_ms: inner.config.poll_timeout.as_millis_u64() }))
                }
            };

            if let Content::Data(data) = &mut message.content {
                data.sequence_number = send_sequence.next();
                trace!("sending data #{} on stream {}", data.sequence_number, inner.stream_id);
            }

            if let Err(e) = transport.send(message).await {
                return PumpExit::Faulted(e);
            }
        }
    }

    async fn receive_loop(inner: &StreamInner, transport: &dyn MessageStream, receive_sequence: &mut SequenceTracker) -> PumpExit {
        loop {
            let message = match transport.receive().await {
                Ok(Some(message)) => message,
                Ok(None) => return PumpExit::TransportClosed,
                Err(e) => return PumpExit::Faulted(e),
            };

            let correlation_id = Uuid::new_v4();
            let span = span!(Level::TRACE, "message_received", ?correlation_id);
            if span.in_scope(|| inner.on_received(message, receive_sequence)) {
                return PumpExit::RemoteClosed;
            }
        }
    }
}
