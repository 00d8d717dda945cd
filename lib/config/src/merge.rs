use serde::{Serialize, de::DeserializeOwned};

use crate::{Error, Result};

/// Merge `source` over `target`.
/// Recurses into objects when `merge_nested`, extends arrays when
/// `extend_array`, and errors when the two sides disagree on type.
pub fn merge_objects(
  mut target: serde_json::Map<String, serde_json::Value>,
  source: serde_json::Map<String, serde_json::Value>,
  merge_nested: bool,
  extend_array: bool,
) -> Result<serde_json::Map<String, serde_json::Value>> {
  for (key, value) in source {
    let Some(curr) = target.remove(&key) else {
      target.insert(key, value);
      continue;
    };
    match curr {
      serde_json::Value::Object(target_obj) => {
        if !merge_nested {
          target.insert(key, value);
          continue;
        }
        match value {
          serde_json::Value::Object(source_obj) => {
            target.insert(
              key,
              serde_json::Value::Object(merge_objects(
                target_obj,
                source_obj,
                merge_nested,
                extend_array,
              )?),
            );
          }
          _ => {
            return Err(Error::ObjectFieldTypeMismatch {
              key,
              value,
            });
          }
        }
      }
      serde_json::Value::Array(mut target_arr) => {
        if !extend_array {
          target.insert(key, value);
          continue;
        }
        match value {
          serde_json::Value::Array(source_arr) => {
            target_arr.extend(source_arr);
            target.insert(key, serde_json::Value::Array(target_arr));
          }
          _ => {
            return Err(Error::ArrayFieldTypeMismatch { key, value });
          }
        }
      }
      _ => {
        target.insert(key, value);
      }
    }
  }
  Ok(target)
}

/// Typed wrapper over [merge_objects].
pub fn merge_config<T: Serialize + DeserializeOwned>(
  target: T,
  source: T,
  merge_nested: bool,
  extend_array: bool,
) -> Result<T> {
  let serde_json::Value::Object(target) =
    serde_json::to_value(target)
      .map_err(|e| Error::SerializeJson { e })?
  else {
    return Err(Error::ValueIsNotObject);
  };
  let serde_json::Value::Object(source) =
    serde_json::to_value(source)
      .map_err(|e| Error::SerializeJson { e })?
  else {
    return Err(Error::ValueIsNotObject);
  };
  let object =
    merge_objects(target, source, merge_nested, extend_array)?;
  serde_json::from_value(serde_json::Value::Object(object))
    .map_err(|e| Error::ParseFinalJson { e })
}

#[cfg(test)]
mod tests {
  use super::*;

  fn obj(
    value: serde_json::Value,
  ) -> serde_json::Map<String, serde_json::Value> {
    let serde_json::Value::Object(map) = value else {
      panic!("expected object");
    };
    map
  }

  #[test]
  fn nested_merge_keeps_unrelated_keys() {
    let target = obj(serde_json::json!({
      "agent": { "id": "a-1", "port": 8120 },
    }));
    let source = obj(serde_json::json!({
      "agent": { "port": 9000 },
    }));
    let merged =
      merge_objects(target, source, true, false).unwrap();
    assert_eq!(merged["agent"]["id"], "a-1");
    assert_eq!(merged["agent"]["port"], 9000);
  }

  #[test]
  fn replace_mode_overwrites_whole_objects() {
    let target = obj(serde_json::json!({
      "agent": { "id": "a-1", "port": 8120 },
    }));
    let source = obj(serde_json::json!({
      "agent": { "port": 9000 },
    }));
    let merged =
      merge_objects(target, source, false, false).unwrap();
    assert!(merged["agent"].get("id").is_none());
  }

  #[test]
  fn array_extension_appends() {
    let target = obj(serde_json::json!({ "keys": ["a"] }));
    let source = obj(serde_json::json!({ "keys": ["b"] }));
    let merged = merge_objects(target, source, true, true).unwrap();
    assert_eq!(merged["keys"], serde_json::json!(["a", "b"]));
  }

  #[test]
  fn type_mismatch_is_an_error() {
    let target = obj(serde_json::json!({ "agent": { "id": "a" } }));
    let source = obj(serde_json::json!({ "agent": 5 }));
    assert!(merge_objects(target, source, true, false).is_err());
  }
}
