use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// An event as it travels from the source connector to the analyzer.
///
/// The reference deployment carries a fixed set of fields; `data` and
/// `miscellaneous` are left as loosely-typed JSON values since their shape is
/// entirely up to the source connector and the analyzer, never interpreted
/// by the runtime itself.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawEvent {
    pub data: serde_json::Value,
    #[serde(rename = "type")]
    pub type_: String,
    pub timestamp: f64,
    pub macropulse: i64,
    pub miscellaneous: serde_json::Value,
    pub name: String,
}

/// The ordered result of one analyzer invocation on one [`RawEvent`].
///
/// Element `k` is bound to sender `k` by position; this positional binding
/// is the only guarantee the runtime makes about the batch's contents.
pub type AnalyzedBatch = Vec<RawEvent>;

/// A byte string produced by a [`crate::serializer::Serializer`] for one
/// element of an [`AnalyzedBatch`].
pub type SerializedFrame = Vec<u8>;

/// Encodes a [`RawEvent`] for transport across the producer→worker ingress
/// channel.
///
/// MessagePack is used rather than the external-facing serializer because
/// this encoding never leaves the process family: it only has to round-trip
/// between Rust processes that agree on the same schema.
pub fn encode_event(event: &RawEvent) -> Result<Vec<u8>> {
    rmp_serde::to_vec(event).map_err(|e| Error::Transport(e.to_string()))
}

/// Decodes a [`RawEvent`] received on the ingress channel.
pub fn decode_event(bytes: &[u8]) -> Result<RawEvent> {
    rmp_serde::from_slice(bytes).map_err(|e| Error::Transport(e.to_string()))
}
