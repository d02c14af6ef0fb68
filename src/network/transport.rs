//! Transport session abstraction
//!
//! A [`Transport`] opens one [`TransportSession`] per voice session. The
//! session exposes a bounded outbound queue of wire chunks and an ordered
//! stream of inbound events that ends after the first terminal event.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::constants::INBOUND_QUEUE_EVENTS;
use crate::error::NetworkError;
use crate::protocol::{ServerMessage, WireChunk};

/// Inbound events, delivered in arrival order
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    AudioChunk(WireChunk),
    TranscriptFragment(String),
    Interrupted,
    TurnComplete,
    Closed,
    Error(String),
}

impl TransportEvent {
    /// `Closed` and `Error` end the session
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransportEvent::Closed | TransportEvent::Error(_))
    }
}

impl From<ServerMessage> for TransportEvent {
    fn from(msg: ServerMessage) -> Self {
        match msg {
            ServerMessage::Audio(chunk) => TransportEvent::AudioChunk(chunk),
            ServerMessage::Transcript { text } => TransportEvent::TranscriptFragment(text),
            ServerMessage::Interrupted => TransportEvent::Interrupted,
            ServerMessage::TurnComplete => TransportEvent::TurnComplete,
            ServerMessage::Error { message } => TransportEvent::Error(message),
        }
    }
}

/// Opens channels to the agent
#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(&self) -> Result<TransportSession, NetworkError>;
}

/// One open channel to the agent
pub struct TransportSession {
    outbound: Option<mpsc::Sender<WireChunk>>,
    inbound: mpsc::Receiver<TransportEvent>,
    terminated: bool,
    tasks: Vec<JoinHandle<()>>,
    close_timeout: Duration,
}

impl TransportSession {
    /// Wrap the channel halves and the I/O tasks that serve them
    pub fn new(
        outbound: mpsc::Sender<WireChunk>,
        inbound: mpsc::Receiver<TransportEvent>,
        tasks: Vec<JoinHandle<()>>,
        close_timeout: Duration,
    ) -> Self {
        Self {
            outbound: Some(outbound),
            inbound,
            terminated: false,
            tasks,
            close_timeout,
        }
    }

    /// Queue a chunk without waiting. A full queue is `Backpressure`.
    pub fn try_send(&self, chunk: WireChunk) -> Result<(), NetworkError> {
        let outbound = self.outbound.as_ref().ok_or(NetworkError::Closed)?;
        outbound.try_send(chunk).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => NetworkError::Backpressure,
            mpsc::error::TrySendError::Closed(_) => NetworkError::Closed,
        })
    }

    /// Next inbound event. After a terminal event has been returned this
    /// yields `None` forever; a channel that simply ends reports `Closed`.
    pub async fn next_event(&mut self) -> Option<TransportEvent> {
        if self.terminated {
            return None;
        }
        let event = self.inbound.recv().await.unwrap_or(TransportEvent::Closed);
        if event.is_terminal() {
            self.terminated = true;
            self.inbound.close();
        }
        Some(event)
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Close the channel: stop accepting chunks, let the writer flush within
    /// the close timeout, then abort whatever is left.
    pub async fn close(mut self) {
        self.outbound.take();
        self.terminated = true;
        self.inbound.close();

        let tasks = std::mem::take(&mut self.tasks);
        let aborts: Vec<_> = tasks.iter().map(|t| t.abort_handle()).collect();
        let joined = tokio::time::timeout(self.close_timeout, async move {
            for task in tasks {
                let _ = task.await;
            }
        })
        .await;
        if joined.is_err() {
            tracing::debug!("Transport tasks did not finish in {:?}, aborting", self.close_timeout);
        }
        for abort in aborts {
            abort.abort();
        }
    }
}

impl Drop for TransportSession {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Test-side end of a [`MockTransport`] session
pub struct MockPeer {
    /// Events to deliver to the client
    pub events: mpsc::Sender<TransportEvent>,
    /// Chunks the client sent
    pub outbound: mpsc::Receiver<WireChunk>,
}

impl MockPeer {
    pub async fn send(&self, event: TransportEvent) {
        let _ = self.events.send(event).await;
    }

    /// Everything the client has sent so far
    pub fn drain_outbound(&mut self) -> Vec<WireChunk> {
        let mut chunks = Vec::new();
        while let Ok(chunk) = self.outbound.try_recv() {
            chunks.push(chunk);
        }
        chunks
    }
}

/// In-memory transport for tests
pub struct MockTransport {
    outbound_queue: usize,
    open_delay: Option<Duration>,
    opens: AtomicUsize,
    failure: Mutex<Option<String>>,
    peers: Mutex<Vec<MockPeer>>,
}

impl MockTransport {
    pub fn new(outbound_queue: usize) -> Self {
        Self {
            outbound_queue,
            open_delay: None,
            opens: AtomicUsize::new(0),
            failure: Mutex::new(None),
            peers: Mutex::new(Vec::new()),
        }
    }

    /// Make `open` take this long, simulating a slow handshake
    pub fn with_open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = Some(delay);
        self
    }

    /// Make the next `open` fail
    pub fn refuse_next(&self, reason: &str) {
        *self.failure.lock() = Some(reason.to_string());
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Take the peer of the oldest session not yet taken
    pub fn take_peer(&self) -> Option<MockPeer> {
        let mut peers = self.peers.lock();
        if peers.is_empty() {
            None
        } else {
            Some(peers.remove(0))
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&self) -> Result<TransportSession, NetworkError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.open_delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(reason) = self.failure.lock().take() {
            return Err(NetworkError::ConnectionFailed(reason));
        }

        let (out_tx, out_rx) = mpsc::channel(self.outbound_queue.max(1));
        let (in_tx, in_rx) = mpsc::channel(INBOUND_QUEUE_EVENTS);
        self.peers.lock().push(MockPeer {
            events: in_tx,
            outbound: out_rx,
        });
        Ok(TransportSession::new(
            out_tx,
            in_rx,
            Vec::new(),
            Duration::from_millis(100),
        ))
    }
}
