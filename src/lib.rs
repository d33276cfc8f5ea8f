#![doc = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/", "README.md"))]

pub use rtsc::locking;

/// Event and batch types, plus the internal producer→worker wire encoding.
pub mod wire;
/// The `Serializer` contract and the reference JSON serializer.
pub mod serializer;
/// The `Analyzer` contract and the crate's own reference/test analyzers.
pub mod analyzer;
/// The `SourceConnector`/`SinkConnector` contracts and the crate's own test
/// source plus a ZeroMQ-backed reference sink.
pub mod connector;
/// The message-fabric abstraction: production ZeroMQ sockets and an
/// in-process loopback backend for tests.
pub mod fabric;
/// The supervised-child lifecycle (`ManagedChild`) and its two
/// implementations, `ProcessChild` and the test-only `ThreadChild`.
pub mod process;
/// The restart-policy-driven process supervisor.
pub mod supervisor;
/// Logging configuration: a dual stdout + rolling-file `tracing` subscriber.
pub mod logging;
/// The producer child routine.
pub mod producer;
/// The worker child routine.
pub mod worker;
/// The sender child routine.
pub mod sender;
/// The `Ripflow`/`RipflowBuilder` façade that wires producer, workers,
/// senders and the supervisor together.
pub mod pipeline;

/// The crate result type.
pub type Result<T> = std::result::Result<T, Error>;

/// The crate error type.
///
/// `Config` is returned synchronously from pipeline construction and channel
/// setup. The remaining variants are raised inside a child's routine,
/// logged, and terminate that child; the supervisor decides whether to
/// restart it.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Invalid pipeline configuration: a bad channel address, a duplicate
    /// process name, an analyzer declaring zero outputs, and similar
    /// construction-time mistakes.
    #[error("configuration error: {0}")]
    Config(String),
    /// A source connector did not produce an event within its own configured
    /// timeout. Not retried in-place; the producer exits and the supervisor
    /// decides whether to restart it.
    #[error("source timed out waiting for data")]
    SourceTimeout,
    /// An analyzer failed while processing an event.
    #[error("analyzer error: {0}")]
    Analyzer(String),
    /// A fabric channel failed to send or receive a frame.
    #[error("transport error: {0}")]
    Transport(String),
    /// A serializer or sink connector failed to publish a frame.
    #[error("sink error: {0}")]
    Sink(String),
    /// A supervised child exhausted its restart budget within the policy's
    /// reset window and was abandoned.
    #[error("restart budget exhausted for process: {0}")]
    RestartBudgetExhausted(String),
    /// Standard I/O errors, surfaced by the logging and process machinery.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// `rtsc::pchannel` errors only ever reach this crate through
/// [`fabric::LoopbackFabric`], where a closed or empty channel is always a
/// transport-layer fact about the loopback backend, never a condition the
/// caller can usefully distinguish from any other transport failure.
impl From<rtsc::Error> for Error {
    fn from(err: rtsc::Error) -> Self {
        Error::Transport(err.to_string())
    }
}

/// Prelude module.
pub mod prelude {
    pub use crate::analyzer::Analyzer;
    pub use crate::connector::{SinkConnector, SourceConnector};
    pub use crate::fabric::{Fabric, FabricChannel, LoopbackFabric, ZmqFabric};
    pub use crate::pipeline::{Ripflow, RipflowBuilder};
    pub use crate::serializer::Serializer;
    pub use crate::supervisor::RestartPolicy;
    pub use crate::{Error, Result};
}
