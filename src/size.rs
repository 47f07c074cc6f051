//! Size estimation: precise, fast, and adaptive selection (spec §4.4).
//!
//! Both strategies share one shape: key bytes, value bytes, and a fixed
//! 32-byte metadata overhead, summed into a total.

use crate::value::Value;

/// Fixed per-entry overhead counted toward every estimate (bookkeeping for
/// the map slot, LRU node, and entry struct itself).
pub const METADATA_OVERHEAD: u64 = 32;

/// Default ceiling above which adaptive mode keeps the fast estimate instead
/// of paying for a precise structural walk.
pub const DEFAULT_MAX_SIZE_FOR_PRECISE: u64 = 10 * 1024;

/// Recursion depth cap standing in for the source's pointer-identity cycle
/// guard; `serde_json::Value` trees are owned and cannot actually cycle, but
/// pathologically deep input should not blow the stack.
const MAX_PRECISE_DEPTH: usize = 256;

/// Which estimator strategy produced a size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EstimateMode {
    Fast,
    Precise,
}

/// Estimates byte size for `(key, value)` pairs with a precise structural
/// walk, a fast flat approximation, and adaptive selection between them.
#[derive(Debug, Default, Clone, Copy)]
pub struct SizeEstimator {
    max_size_for_precise: u64,
}

impl SizeEstimator {
    /// Builds an estimator with the given adaptive-selection threshold.
    pub fn new(max_size_for_precise: u64) -> Self {
        SizeEstimator { max_size_for_precise }
    }

    /// `keyBytes(key) + valueBytes(value) + METADATA_OVERHEAD`, picking the
    /// estimator per `force_precise` and the adaptive threshold.
    pub fn estimate(&self, key: &str, value: &Value, force_precise: bool) -> u64 {
        let key_bytes = key.len() as u64 * 2;
        let fast_value = Self::fast_value_size(value);
        let value_bytes = if force_precise {
            Self::precise_value_size(value).unwrap_or(fast_value)
        } else if fast_value > self.max_size_for_precise {
            fast_value
        } else {
            Self::precise_value_size(value).unwrap_or(fast_value)
        };
        key_bytes + value_bytes + METADATA_OVERHEAD
    }

    /// The fast, flat-encoding estimate alone (used by `estimate`'s adaptive
    /// threshold check and exposed for callers that only want the cheap
    /// path, e.g. the `setMany` capacity pre-check).
    pub fn fast_value_size(value: &Value) -> u64 {
        match value {
            Value::Null => 4,
            Value::Bool(_) => 4,
            Value::Number(_) => 8,
            Value::String(s) => s.len() as u64 * 2,
            composite => match serde_json::to_string(composite) {
                Ok(text) => text.len() as u64 * 2,
                Err(_) => 1024,
            },
        }
    }

    /// The precise, structural-walk estimate. `None` if the walk exceeds the
    /// depth guard.
    pub fn precise_value_size(value: &Value) -> Option<u64> {
        precise_walk(value, 0)
    }

    /// Size of an encrypted entry: computed on the stored cipher form rather
    /// than the plaintext, per §4.1 ("size is computed on the stored form").
    pub fn estimate_cipher(key: &str, record: &crate::crypto::CipherRecord) -> u64 {
        let key_bytes = key.len() as u64 * 2;
        let cipher_bytes = (record.data.len() + record.iv.len() + record.tag.len()) as u64;
        key_bytes + cipher_bytes + METADATA_OVERHEAD
    }
}

fn precise_walk(value: &Value, depth: usize) -> Option<u64> {
    if depth > MAX_PRECISE_DEPTH {
        return None;
    }
    let size = match value {
        Value::Null => 4,
        Value::Bool(_) => 4,
        Value::Number(_) => 8,
        Value::String(s) => utf16_byte_len(s),
        Value::Array(items) => {
            let mut total = 24u64;
            for item in items {
                total += precise_walk(item, depth + 1)?;
            }
            total
        }
        Value::Object(map) => {
            let mut total = 32u64;
            for (name, child) in map {
                total += utf16_byte_len(name) + precise_walk(child, depth + 1)? + 16;
            }
            total
        }
    };
    Some(size)
}

/// UTF-16 byte count, accounting for surrogate pairs: code points above the
/// BMP (> U+FFFF) cost two 16-bit units (4 bytes); everything else costs one
/// (2 bytes).
fn utf16_byte_len(s: &str) -> u64 {
    s.chars().map(|c| if (c as u32) > 0xFFFF { 4 } else { 2 }).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fast_primitives_match_spec_formula() {
        assert_eq!(SizeEstimator::fast_value_size(&json!(null)), 4);
        assert_eq!(SizeEstimator::fast_value_size(&json!(true)), 4);
        assert_eq!(SizeEstimator::fast_value_size(&json!(42)), 8);
        assert_eq!(SizeEstimator::fast_value_size(&json!("hello")), 10);
    }

    #[test]
    fn precise_object_header_and_fields() {
        let v = json!({"a": "bb"});
        // 32 header + (utf16("a")=2 + utf16("bb")=4 + 16) = 54
        assert_eq!(SizeEstimator::precise_value_size(&v), Some(54));
    }

    #[test]
    fn precise_array_header_and_children() {
        let v = json!([1, 2, 3]);
        assert_eq!(SizeEstimator::precise_value_size(&v), Some(24 + 8 * 3));
    }

    #[test]
    fn utf16_surrogate_pair_counts_four_bytes() {
        // U+1F600 (emoji) is outside the BMP.
        let s = "\u{1F600}";
        assert_eq!(utf16_byte_len(s), 4);
    }

    #[test]
    fn adaptive_falls_back_to_fast_above_threshold() {
        let est = SizeEstimator::new(4);
        let big = json!("0123456789");
        let total = est.estimate("k", &big, false);
        // fast_value_size("0123456789") = 20 > threshold(4), so fast path is used.
        assert_eq!(total, "k".len() as u64 * 2 + 20 + METADATA_OVERHEAD);
    }

    #[test]
    fn adaptive_uses_precise_below_threshold() {
        let est = SizeEstimator::new(1_000_000);
        let v = json!({"a": "bb"});
        let total = est.estimate("k", &v, false);
        assert_eq!(total, "k".len() as u64 * 2 + 54 + METADATA_OVERHEAD);
    }
}
