//! The opaque cached value type.
//!
//! The engine treats values as opaque payloads; size estimation and
//! encryption operate on a serialized/structural representation rather than
//! on runtime type inspection. `serde_json::Value` gives us that for free: a
//! finite, well-known variant set (null, bool, number, string, array, object)
//! that both size estimators can walk without reflection.

/// The stored payload type. Re-exported so callers don't need a direct
/// `serde_json` dependency just to construct values.
pub type Value = serde_json::Value;

/// Produces the lowercase textual projection of a value used for sensitivity
/// matching (§4.5) and as the fast-estimator's encoded form (§4.4).
pub fn lowercase_projection(value: &Value) -> String {
    value.to_string().to_lowercase()
}
