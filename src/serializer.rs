use crate::wire::RawEvent;
use crate::{Error, Result};

/// Turns one element of an [`crate::wire::AnalyzedBatch`] into the bytes
/// published on an external output.
///
/// Held by the sink connector but invoked by the worker: the worker
/// parallelizes the CPU-bound serialization step, the sender is left a pure
/// I/O multiplexer. Implementations must be [`Send`] + [`Sync`] since the
/// same sink (and therefore the same serializer) is shared by every worker.
pub trait Serializer: Send + Sync {
    /// Serializes one event, returning the bytes to publish verbatim.
    fn serialize(&self, event: &RawEvent) -> Result<Vec<u8>>;
}

/// Reference serializer: plain JSON, one object per frame.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn serialize(&self, event: &RawEvent) -> Result<Vec<u8>> {
        serde_json::to_vec(event).map_err(|e| Error::Sink(e.to_string()))
    }
}
