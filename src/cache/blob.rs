//! Versioned JSON envelope for everything written to the storage medium.
//!
//! Current blobs look like `{"version": 1, "data": ...}`. Blobs written before
//! versioning (bare JSON) decode as version 0 and are upgraded on the next
//! write. Blobs from a newer version are skipped so an older build never
//! misreads them.

use color_eyre::{eyre::eyre, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

/// Version stamped on every blob this build writes.
pub const FORMAT_VERSION: u32 = 1;

#[derive(Serialize)]
struct EnvelopeRef<'a, T> {
  version: u32,
  data: &'a T,
}

#[derive(Deserialize)]
struct Envelope {
  version: u32,
  data: Value,
}

/// Serialize `data` inside a current-version envelope.
pub fn encode<T: Serialize>(data: &T) -> Result<String> {
  serde_json::to_string(&EnvelopeRef {
    version: FORMAT_VERSION,
    data,
  })
  .map_err(|e| eyre!("Failed to serialize cache blob: {}", e))
}

/// Decode a blob read from `key`.
///
/// Returns `Ok(None)` for blobs from a newer format version.
pub fn decode<T: DeserializeOwned>(key: &str, raw: &str) -> Result<Option<T>> {
  let value: Value =
    serde_json::from_str(raw).map_err(|e| eyre!("Failed to parse cache blob {}: {}", key, e))?;

  let (version, data) = if is_envelope(&value) {
    let envelope: Envelope = serde_json::from_value(value)
      .map_err(|e| eyre!("Failed to parse cache envelope {}: {}", key, e))?;
    (envelope.version, envelope.data)
  } else {
    debug!(key, "Reading unversioned cache blob");
    (0, value)
  };

  if version > FORMAT_VERSION {
    warn!(
      key,
      version,
      supported = FORMAT_VERSION,
      "Ignoring cache blob written by a newer format"
    );
    return Ok(None);
  }

  // Versions 0 and 1 share the same payload shape.
  let data = serde_json::from_value(data)
    .map_err(|e| eyre!("Failed to deserialize cache blob {}: {}", key, e))?;

  Ok(Some(data))
}

fn is_envelope(value: &Value) -> bool {
  match value.as_object() {
    Some(obj) => {
      obj.len() == 2
        && obj.get("version").is_some_and(Value::is_u64)
        && obj.contains_key("data")
    }
    None => false,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::BTreeMap;

  #[test]
  fn test_encode_stamps_current_version() {
    let raw = encode(&vec![1, 2, 3]).unwrap();
    let value: Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(value["version"], FORMAT_VERSION);
    assert_eq!(value["data"], serde_json::json!([1, 2, 3]));
  }

  #[test]
  fn test_decode_current_version() {
    let raw = encode(&vec!["a".to_string()]).unwrap();
    let decoded: Option<Vec<String>> = decode("k", &raw).unwrap();
    assert_eq!(decoded, Some(vec!["a".to_string()]));
  }

  #[test]
  fn test_decode_legacy_unversioned_array() {
    let decoded: Option<Vec<u32>> = decode("k", "[4,5]").unwrap();
    assert_eq!(decoded, Some(vec![4, 5]));
  }

  #[test]
  fn test_decode_legacy_grouped_map() {
    let raw = r#"{"card-1":[{"id":"s1"}],"card-2":[]}"#;
    let decoded: Option<BTreeMap<String, Vec<Value>>> = decode("k", raw).unwrap();
    let groups = decoded.unwrap();
    assert_eq!(groups.len(), 2);
    assert_eq!(groups["card-1"][0]["id"], "s1");
  }

  #[test]
  fn test_decode_newer_version_is_skipped() {
    let raw = r#"{"version":99,"data":[1]}"#;
    let decoded: Option<Vec<u32>> = decode("k", raw).unwrap();
    assert_eq!(decoded, None);
  }

  #[test]
  fn test_decode_garbage_is_an_error() {
    assert!(decode::<Vec<u32>>("k", "not json").is_err());
    assert!(decode::<Vec<u32>>("k", r#"{"version":1,"data":"x"}"#).is_err());
  }
}
