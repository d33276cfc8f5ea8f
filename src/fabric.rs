use std::collections::HashMap;
use std::sync::Arc;

use rtsc::data_policy::{DataDeliveryPolicy, DeliveryPolicy};
use zeromq::{Socket, SocketRecv, SocketSend};

use crate::{Error, Result};

/// Internal fan-out/fan-in socket shapes, plus the external publish shape.
///
/// Mirrors the reference deployment's `socket_type` + `bind_address`/
/// `connect_address` pairs one-to-one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelRole {
    PushBind,
    PullConnect,
    PullBind,
    PushConnect,
    PubBind,
    SubConnect,
}

/// A fully-resolved channel endpoint: role, transport address, and the
/// backpressure capacity a fabric implementation should honor where it can.
#[derive(Debug, Clone)]
pub struct ChannelSpec {
    pub role: ChannelRole,
    pub address: String,
    pub capacity: usize,
}

impl ChannelSpec {
    pub fn new(role: ChannelRole, address: impl Into<String>) -> Self {
        Self {
            role,
            address: address.into(),
            capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }
}

/// Conservative default for every internal channel's backpressure buffer.
/// The upstream source is inherently lossy, so a larger buffer only delays
/// backpressure rather than avoiding it.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1000;

/// One endpoint created by a [`Fabric`]; opaque to everything except the
/// child routine that owns it.
pub trait FabricChannel: Send {
    fn send(&mut self, frame: Vec<u8>) -> Result<()>;
    fn recv(&mut self) -> Result<Vec<u8>>;
}

/// The message-fabric abstraction every child process is built against.
///
/// Mirrors the reference deployment's `CommsFactory` abstract factory:
/// `create_context` once per process, `create_channel` once per endpoint,
/// `cleanup` on the way out. Implementations are constructed once in the
/// parent and copied into each forked child via the fork's copy-on-write
/// semantics, so `Clone` must be cheap.
pub trait Fabric: Clone + Send + Sync + 'static {
    type Context;
    type Channel: FabricChannel;

    fn create_context(&self) -> Result<Self::Context>;
    fn create_channel(&self, ctx: &Self::Context, spec: &ChannelSpec) -> Result<Self::Channel>;
    fn cleanup(&self, ctx: Self::Context, channels: Vec<Self::Channel>);
}

// ---------------------------------------------------------------------
// Production backend: ZeroMQ sockets driven by a per-process tokio runtime.
// ---------------------------------------------------------------------

/// Production [`Fabric`] backed by the `zeromq` crate.
///
/// Each child drives its sockets with a current-thread tokio runtime created
/// fresh inside `create_context`, the same pattern the teacher crate uses to
/// bridge an async I/O primitive into a synchronous worker loop.
#[derive(Debug, Default, Clone, Copy)]
pub struct ZmqFabric;

/// Per-process ZeroMQ context: the tokio runtime driving every socket
/// created for this process.
pub struct ZmqContext {
    runtime: Arc<tokio::runtime::Runtime>,
}

enum ZmqSocketKind {
    Push(zeromq::PushSocket),
    Pull(zeromq::PullSocket),
    Pub(zeromq::PubSocket),
    Sub(zeromq::SubSocket),
}

pub struct ZmqChannel {
    runtime: Arc<tokio::runtime::Runtime>,
    socket: ZmqSocketKind,
}

impl Fabric for ZmqFabric {
    type Context = ZmqContext;
    type Channel = ZmqChannel;

    fn create_context(&self) -> Result<Self::Context> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| Error::Config(format!("failed to start fabric runtime: {e}")))?;
        Ok(ZmqContext {
            runtime: Arc::new(runtime),
        })
    }

    fn create_channel(&self, ctx: &Self::Context, spec: &ChannelSpec) -> Result<Self::Channel> {
        let runtime = ctx.runtime.clone();
        let socket: ZmqSocketKind = runtime.block_on(async {
            match spec.role {
                ChannelRole::PushBind => {
                    let mut s = zeromq::PushSocket::new();
                    s.bind(&spec.address)
                        .await
                        .map_err(|e| Error::Transport(e.to_string()))?;
                    Ok::<ZmqSocketKind, Error>(ZmqSocketKind::Push(s))
                }
                ChannelRole::PushConnect => {
                    let mut s = zeromq::PushSocket::new();
                    s.connect(&spec.address)
                        .await
                        .map_err(|e| Error::Transport(e.to_string()))?;
                    Ok::<ZmqSocketKind, Error>(ZmqSocketKind::Push(s))
                }
                ChannelRole::PullBind => {
                    let mut s = zeromq::PullSocket::new();
                    s.bind(&spec.address)
                        .await
                        .map_err(|e| Error::Transport(e.to_string()))?;
                    Ok::<ZmqSocketKind, Error>(ZmqSocketKind::Pull(s))
                }
                ChannelRole::PullConnect => {
                    let mut s = zeromq::PullSocket::new();
                    s.connect(&spec.address)
                        .await
                        .map_err(|e| Error::Transport(e.to_string()))?;
                    Ok::<ZmqSocketKind, Error>(ZmqSocketKind::Pull(s))
                }
                ChannelRole::PubBind => {
                    let mut s = zeromq::PubSocket::new();
                    s.bind(&spec.address)
                        .await
                        .map_err(|e| Error::Transport(e.to_string()))?;
                    Ok::<ZmqSocketKind, Error>(ZmqSocketKind::Pub(s))
                }
                ChannelRole::SubConnect => {
                    let mut s = zeromq::SubSocket::new();
                    s.connect(&spec.address)
                        .await
                        .map_err(|e| Error::Transport(e.to_string()))?;
                    Ok::<ZmqSocketKind, Error>(ZmqSocketKind::Sub(s))
                }
            }
        })?;
        Ok(ZmqChannel { runtime, socket })
    }

    fn cleanup(&self, ctx: Self::Context, channels: Vec<Self::Channel>) {
        drop(channels);
        drop(ctx);
    }
}

impl FabricChannel for ZmqChannel {
    fn send(&mut self, frame: Vec<u8>) -> Result<()> {
        let message = zeromq::ZmqMessage::from(frame);
        let runtime = self.runtime.clone();
        match &mut self.socket {
            ZmqSocketKind::Push(s) => runtime
                .block_on(s.send(message))
                .map_err(|e| Error::Transport(e.to_string())),
            ZmqSocketKind::Pub(s) => runtime
                .block_on(s.send(message))
                .map_err(|e| Error::Transport(e.to_string())),
            _ => Err(Error::Transport("channel does not support send".into())),
        }
    }

    fn recv(&mut self) -> Result<Vec<u8>> {
        let runtime = self.runtime.clone();
        let message = match &mut self.socket {
            ZmqSocketKind::Pull(s) => runtime
                .block_on(s.recv())
                .map_err(|e| Error::Transport(e.to_string())),
            ZmqSocketKind::Sub(s) => runtime
                .block_on(s.recv())
                .map_err(|e| Error::Transport(e.to_string())),
            _ => Err(Error::Transport("channel does not support recv".into())),
        }?;
        Ok(message.into_vec().into_iter().flatten().collect())
    }
}

// ---------------------------------------------------------------------
// Test backend: in-process bounded channels, no sockets, no subprocesses.
// ---------------------------------------------------------------------

#[derive(Clone)]
struct Frame(Vec<u8>);

impl DataDeliveryPolicy for Frame {
    fn delivery_policy(&self) -> DeliveryPolicy {
        DeliveryPolicy::Always
    }
}

/// Test-only [`Fabric`] built on `rtsc::pchannel`: every "socket" is really a
/// named bounded channel shared in-process, so pipeline tests never spawn
/// real OS processes or open real sockets.
///
/// `LoopbackFabric` resolves PUSH/PULL and PUB/SUB pairs purely by address:
/// the first side to ask for an address creates the underlying channel, the
/// second side attaches to it. This matches ZeroMQ's own bind/connect
/// symmetry without needing a real transport.
#[derive(Clone, Default)]
pub struct LoopbackFabric {
    registry: Arc<crate::locking::Mutex<HashMap<String, LoopbackChannelPair>>>,
}

#[derive(Clone)]
struct LoopbackChannelPair {
    tx: rtsc::channel::Sender<Frame, rtsc::locking::RawMutex, rtsc::locking::Condvar>,
    rx: rtsc::channel::Receiver<Frame, rtsc::locking::RawMutex, rtsc::locking::Condvar>,
}

impl LoopbackFabric {
    pub fn new() -> Self {
        Self::default()
    }

    fn pair_for(&self, address: &str, capacity: usize) -> LoopbackChannelPair {
        let mut registry = self.registry.lock();
        registry
            .entry(address.to_string())
            .or_insert_with(|| {
                let ch = rtsc::channel::Bounded::new(capacity.max(1));
                LoopbackChannelPair { tx: ch.tx, rx: ch.rx }
            })
            .clone()
    }
}

/// No real per-process resources are needed for the loopback backend; the
/// fabric handle itself is the shared registry.
pub struct LoopbackContext;

pub enum LoopbackChannel {
    Sender(rtsc::channel::Sender<Frame, rtsc::locking::RawMutex, rtsc::locking::Condvar>),
    Receiver(rtsc::channel::Receiver<Frame, rtsc::locking::RawMutex, rtsc::locking::Condvar>),
}

impl Fabric for LoopbackFabric {
    type Context = LoopbackContext;
    type Channel = LoopbackChannel;

    fn create_context(&self) -> Result<Self::Context> {
        Ok(LoopbackContext)
    }

    fn create_channel(&self, _ctx: &Self::Context, spec: &ChannelSpec) -> Result<Self::Channel> {
        let pair = self.pair_for(&spec.address, spec.capacity);
        match spec.role {
            ChannelRole::PushBind | ChannelRole::PushConnect | ChannelRole::PubBind => {
                Ok(LoopbackChannel::Sender(pair.tx))
            }
            ChannelRole::PullBind | ChannelRole::PullConnect | ChannelRole::SubConnect => {
                Ok(LoopbackChannel::Receiver(pair.rx))
            }
        }
    }

    fn cleanup(&self, _ctx: Self::Context, channels: Vec<Self::Channel>) {
        drop(channels);
    }
}

impl FabricChannel for LoopbackChannel {
    fn send(&mut self, frame: Vec<u8>) -> Result<()> {
        match self {
            LoopbackChannel::Sender(tx) => tx.send(Frame(frame)).map_err(Error::from),
            LoopbackChannel::Receiver(_) => {
                Err(Error::Transport("channel does not support send".into()))
            }
        }
    }

    fn recv(&mut self) -> Result<Vec<u8>> {
        match self {
            LoopbackChannel::Receiver(rx) => rx.recv().map(|f| f.0).map_err(Error::from),
            LoopbackChannel::Sender(_) => {
                Err(Error::Transport("channel does not support recv".into()))
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_loopback_push_pull_round_trip() {
        let fabric = LoopbackFabric::new();
        let ctx = fabric.create_context().unwrap();
        let mut push = fabric
            .create_channel(&ctx, &ChannelSpec::new(ChannelRole::PushBind, "ipc://t1"))
            .unwrap();
        let mut pull = fabric
            .create_channel(&ctx, &ChannelSpec::new(ChannelRole::PullConnect, "ipc://t1"))
            .unwrap();
        push.send(vec![1, 2, 3]).unwrap();
        assert_eq!(pull.recv().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_loopback_fans_in_from_multiple_senders() {
        let fabric = LoopbackFabric::new();
        let ctx = fabric.create_context().unwrap();
        let mut push_a = fabric
            .create_channel(&ctx, &ChannelSpec::new(ChannelRole::PushConnect, "ipc://fan"))
            .unwrap();
        let mut push_b = fabric
            .create_channel(&ctx, &ChannelSpec::new(ChannelRole::PushConnect, "ipc://fan"))
            .unwrap();
        let mut pull = fabric
            .create_channel(&ctx, &ChannelSpec::new(ChannelRole::PullBind, "ipc://fan"))
            .unwrap();
        push_a.send(vec![1]).unwrap();
        push_b.send(vec![2]).unwrap();
        let mut received = vec![pull.recv().unwrap(), pull.recv().unwrap()];
        received.sort();
        assert_eq!(received, vec![vec![1], vec![2]]);
    }
}
