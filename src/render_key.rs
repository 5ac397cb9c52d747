use crate::types::{AggregationResult, ViewMode};
use serde::{Serialize, Serializer};
use std::fmt;

/// Redraw identity for the boundary layer. Two equal keys mean the layer
/// would be drawn identically; the value itself carries no meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RenderKey(blake3::Hash);

impl RenderKey {
    pub fn to_hex(&self) -> String {
        self.0.to_hex().to_string()
    }
}

impl fmt::Display for RenderKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for RenderKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

#[derive(Serialize)]
struct KeyInput<'a> {
    mode: ViewMode,
    aggregation: &'a AggregationResult,
}

/// Digest of the canonical JSON form of `(mode, aggregation)`.
///
/// `AggregationResult` only holds ordered maps, so structurally equal
/// results serialize to the same bytes whatever order they were built in.
pub fn key_for(aggregation: &AggregationResult, mode: ViewMode) -> RenderKey {
    let mut hasher = blake3::Hasher::new();
    // Writing ordered maps into a hasher cannot fail.
    if let Err(e) = serde_json::to_writer(&mut hasher, &KeyInput { mode, aggregation }) {
        tracing::error!(error = %e, "failed to serialize render key input");
    }
    RenderKey(hasher.finalize())
}
