//! Validation for operator-supplied preset payloads.

use serde_json::Value;

use crate::error::StoreError;

/// Upper bound on an import payload.
pub const MAX_IMPORT_BYTES: usize = 10 * 1024 * 1024;

/// Parse raw text as JSON, reporting the position of the first syntax error.
pub fn validate_json(raw: &str) -> Result<Value, StoreError> {
    serde_json::from_str(raw).map_err(|e| {
        StoreError::Validation(format!(
            "invalid JSON at line {} column {}: {}",
            e.line(),
            e.column(),
            e
        ))
    })
}

/// A preset response body must be a JSON object.
pub fn validate_response_object(value: &Value) -> Result<(), StoreError> {
    if value.is_object() {
        Ok(())
    } else {
        Err(StoreError::Validation(
            "response must be a JSON object".into(),
        ))
    }
}

/// Validate an import payload: size-limited, UTF-8, and a top-level array.
pub fn validate_import_array(raw: &[u8]) -> Result<Vec<Value>, StoreError> {
    if raw.len() > MAX_IMPORT_BYTES {
        return Err(StoreError::Validation(
            "import payload exceeds the 10MB limit".into(),
        ));
    }
    let text = std::str::from_utf8(raw)
        .map_err(|_| StoreError::Validation("import payload must be UTF-8".into()))?;
    match validate_json(text)? {
        Value::Array(items) => Ok(items),
        _ => Err(StoreError::Validation(
            "import payload must be a JSON array".into(),
        )),
    }
}

/// Indices and messages for every element that is not a JSON object.
pub fn validate_array_elements(items: &[Value]) -> Vec<(usize, String)> {
    items
        .iter()
        .enumerate()
        .filter(|(_, item)| !item.is_object())
        .map(|(idx, _)| (idx, format!("element {idx} is not a JSON object")))
        .collect()
}
