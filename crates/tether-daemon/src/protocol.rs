//! JSON bodies of the daemon's HTTP surface.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Body of `POST /api/RunAppMethod`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunMethodRequest {
    pub server_file: String,
    pub method_name: String,
    #[serde(default)]
    pub data: Value,
}

/// Reply of `POST /api/RunAppMethod`: `200 {type:"success", result}` or
/// `500 {type:"error", error}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RunMethodResponse {
    Success { result: Value },
    Error { error: String },
}

impl RunMethodResponse {
    pub fn is_success(&self) -> bool {
        matches!(self, RunMethodResponse::Success { .. })
    }
}

/// Reply of `GET /api/health`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub ok: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_shapes() {
        let request: RunMethodRequest = serde_json::from_value(json!({
            "serverFile": "notes",
            "methodName": "list",
        }))
        .unwrap();
        assert_eq!(request.data, Value::Null);

        assert_eq!(
            serde_json::to_value(RunMethodResponse::Success { result: json!(3) }).unwrap(),
            json!({"type": "success", "result": 3})
        );
        assert_eq!(
            serde_json::to_value(RunMethodResponse::Error {
                error: "nope".into()
            })
            .unwrap(),
            json!({"type": "error", "error": "nope"})
        );
    }
}
