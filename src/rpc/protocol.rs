//! JSON-RPC 2.0 messages, one per line.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::error::OrchestratorError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
    /// Absent for notifications, which get no response.
    #[serde(default)]
    pub id: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
    pub id: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;

// Application codes, one per orchestrator error kind.
pub const BACKEND_UNAVAILABLE: i32 = -32001;
pub const COMMAND_REJECTED: i32 = -32002;
pub const DEVICE_BUSY: i32 = -32003;
pub const JOB_NOT_FOUND: i32 = -32004;

impl Request {
    pub fn new(method: impl Into<String>, params: Option<Value>, id: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.into(),
            params,
            id: Some(id),
        }
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }

    pub fn validate(&self) -> Result<(), &'static str> {
        if self.jsonrpc != "2.0" {
            return Err("jsonrpc must be \"2.0\"");
        }
        if self.method.is_empty() {
            return Err("method must not be empty");
        }
        Ok(())
    }
}

impl Response {
    pub fn success(id: Value, result: impl Serialize) -> Self {
        match serde_json::to_value(result) {
            Ok(result) => Self {
                jsonrpc: "2.0".to_string(),
                result: Some(result),
                error: None,
                id,
            },
            Err(err) => Self::internal_error(id, err.to_string()),
        }
    }

    pub fn error(id: Value, code: i32, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
                data: None,
            }),
            id,
        }
    }

    pub fn parse_error() -> Self {
        Self::error(Value::Null, PARSE_ERROR, "Parse error")
    }

    pub fn invalid_request(id: Value) -> Self {
        Self::error(id, INVALID_REQUEST, "Invalid request")
    }

    pub fn method_not_found(id: Value, method: &str) -> Self {
        Self::error(id, METHOD_NOT_FOUND, format!("Method not found: {method}"))
    }

    pub fn invalid_params(id: Value, details: impl Into<String>) -> Self {
        Self::error(id, INVALID_PARAMS, details)
    }

    pub fn internal_error(id: Value, details: impl Into<String>) -> Self {
        Self::error(id, INTERNAL_ERROR, details)
    }

    /// An orchestrator failure, with the device named in `data` when busy.
    pub fn failure(id: Value, err: &OrchestratorError) -> Self {
        let code = error_code(err);
        let mut response = Self::error(id, code, err.to_string());
        if let (OrchestratorError::DeviceBusy { device }, Some(error)) =
            (err, response.error.as_mut())
        {
            error.data = Some(serde_json::json!({ "device": device }));
        }
        response
    }
}

pub fn error_code(err: &OrchestratorError) -> i32 {
    match err {
        OrchestratorError::BackendUnavailable(_) => BACKEND_UNAVAILABLE,
        OrchestratorError::CommandRejected(_) => COMMAND_REJECTED,
        OrchestratorError::DeviceBusy { .. } => DEVICE_BUSY,
        OrchestratorError::JobNotFound(_) => JOB_NOT_FOUND,
    }
}
