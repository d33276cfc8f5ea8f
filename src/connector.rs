use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use zeromq::{Socket, SocketSend};

use crate::serializer::Serializer;
use crate::wire::RawEvent;
use crate::{Error, Result};

/// The producer's capability to pull events from the outside world.
///
/// `connect` is called exactly once inside the spawned producer process and
/// must be idempotent (the producer never calls it twice, but a restarted
/// producer runs a fresh `connect` inside its fresh process). `get_data`
/// blocks until an event is available or its configured timeout elapses.
pub trait SourceConnector: Send + Sync {
    /// Establishes the connection to the source. Idempotent.
    fn connect(&self) -> Result<()>;
    /// Blocks until one event is available, or the timeout set by the
    /// implementation expires with [`crate::Error::SourceTimeout`].
    fn get_data(&self) -> Result<RawEvent>;
}

/// Replays a fixed sequence of events, one call to `get_data` per element,
/// then blocks forever. Used by the crate's own test scenarios in place of
/// a real acquisition system connector.
pub struct SequenceSourceConnector {
    sequence: Vec<RawEvent>,
    cursor: AtomicUsize,
    delay: Duration,
}

impl SequenceSourceConnector {
    pub fn new(sequence: Vec<RawEvent>) -> Self {
        Self::with_delay(sequence, Duration::from_millis(50))
    }

    pub fn with_delay(sequence: Vec<RawEvent>, delay: Duration) -> Self {
        Self {
            sequence,
            cursor: AtomicUsize::new(0),
            delay,
        }
    }
}

impl SourceConnector for SequenceSourceConnector {
    fn connect(&self) -> Result<()> {
        Ok(())
    }

    fn get_data(&self) -> Result<RawEvent> {
        loop {
            let idx = self.cursor.fetch_add(1, Ordering::SeqCst);
            if let Some(event) = self.sequence.get(idx) {
                std::thread::sleep(self.delay);
                return Ok(event.clone());
            }
            std::thread::sleep(Duration::from_secs(1));
        }
    }
}

/// The sink's capability to publish serialized frames externally.
///
/// Carries the [`Serializer`] used by the worker; the sender uses only
/// `connect_subprocess` and `send`.
pub trait SinkConnector: Send + Sync {
    /// The serializer the worker uses to turn one [`RawEvent`] into bytes.
    fn serializer(&self) -> &dyn Serializer;
    /// Binds the external output for sender `idx`. Called exactly once,
    /// inside the spawned sender process.
    fn connect_subprocess(&self, idx: usize) -> Result<()>;
    /// Publishes one already-serialized frame. Non-blocking: a slow
    /// subscriber may miss messages, never the publisher.
    fn send(&self, idx: usize, frame: &[u8]) -> Result<()>;
}

/// Reference [`SinkConnector`]: one ZeroMQ PUB socket per sender subprocess,
/// bound at `tcp://*:{port+idx}`.
///
/// Mirrors `middle_layer_server/connectors/sink/zmq_sink_connector.py`
/// one-to-one: `port+idx` addressing, bind-not-connect (subscribers come and
/// go, the publisher is the stable endpoint), fire-and-forget `send`.
pub struct ZmqSinkConnector {
    port: u16,
    serializer: Arc<dyn Serializer>,
    runtime: OnceLock<tokio::runtime::Runtime>,
    socket: crate::locking::Mutex<Option<zeromq::PubSocket>>,
}

impl ZmqSinkConnector {
    pub fn new(port: u16, serializer: Arc<dyn Serializer>) -> Self {
        Self {
            port,
            serializer,
            runtime: OnceLock::new(),
            socket: crate::locking::Mutex::new(None),
        }
    }

    fn runtime(&self) -> Result<&tokio::runtime::Runtime> {
        if self.runtime.get().is_none() {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .map_err(|e| Error::Config(format!("failed to start sink runtime: {e}")))?;
            let _ = self.runtime.set(rt);
        }
        Ok(self.runtime.get().expect("runtime was just initialized"))
    }
}

impl SinkConnector for ZmqSinkConnector {
    fn serializer(&self) -> &dyn Serializer {
        self.serializer.as_ref()
    }

    fn connect_subprocess(&self, idx: usize) -> Result<()> {
        let address = format!("tcp://*:{}", self.port as usize + idx);
        let mut socket = zeromq::PubSocket::new();
        self.runtime()?
            .block_on(socket.bind(&address))
            .map_err(|e| Error::Transport(e.to_string()))?;
        *self.socket.lock() = Some(socket);
        Ok(())
    }

    fn send(&self, _idx: usize, frame: &[u8]) -> Result<()> {
        let message = zeromq::ZmqMessage::from(frame.to_vec());
        let mut guard = self.socket.lock();
        let socket = guard
            .as_mut()
            .ok_or_else(|| Error::Config("sink socket not connected".into()))?;
        self.runtime()?
            .block_on(socket.send(message))
            .map_err(|e| Error::Transport(e.to_string()))
    }
}
