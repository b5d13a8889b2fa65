//! Response envelope. Every success body is `{"ok": true, ...fields}`; every error
//! body is `{"ok": false, "error": "..."}`, the latter produced by
//! [`crate::errors::ApiError`].

use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::{Map, Value};

/// Wraps `data` (which must serialize to a JSON object) with `"ok": true`
/// merged in at the top level, matching every endpoint's response shape.
pub fn ok<T: Serialize>(data: T) -> Response {
    let mut body = match serde_json::to_value(data) {
        Ok(Value::Object(map)) => map,
        Ok(other) => {
            let mut map = Map::new();
            map.insert("data".to_string(), other);
            map
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to serialize response body");
            let mut map = Map::new();
            map.insert("ok".to_string(), Value::Bool(false));
            map.insert("error".to_string(), Value::String("internal error".to_string()));
            return (axum::http::StatusCode::INTERNAL_SERVER_ERROR, Json(Value::Object(map))).into_response();
        }
    };
    body.insert("ok".to_string(), Value::Bool(true));
    Json(Value::Object(body)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    #[derive(Serialize)]
    struct Sample {
        total: u64,
    }

    #[tokio::test]
    async fn ok_merges_ok_true_into_object_body() {
        let resp = ok(Sample { total: 3 });
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let v: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(v["ok"], true);
        assert_eq!(v["total"], 3);
    }
}
