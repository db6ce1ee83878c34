//! Server value placeholders, resolved server-side (and optimistically
//! locally, against the connection's clock offset).

use serde_json::Value;

/// A placeholder for the server's clock at write time, in millis.
pub fn server_timestamp() -> Value {
    serde_json::json!({ ".sv": "timestamp" })
}

/// A placeholder that atomically adds `delta` to the current numeric value
/// (non-numeric or missing values count as zero).
pub fn increment(delta: f64) -> Value {
    serde_json::json!({
        ".sv": {
            "increment": delta,
        }
    })
}
