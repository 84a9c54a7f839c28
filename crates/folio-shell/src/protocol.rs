//! JSON-RPC messages exchanged with the UI process
//!
//! Messages are newline-delimited JSON objects. Requests carry an `id` and a
//! `method` naming one of the `llamafile:*` channels; notifications pushed by
//! the shell carry no `id`.

use std::str::FromStr;

use folio_runtime::RuntimeError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON-RPC request message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    /// JSON-RPC version (always "2.0")
    #[serde(default = "jsonrpc_version")]
    pub jsonrpc: String,
    /// Request ID; absent for client notifications
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    /// Channel name
    pub method: String,
    /// Request parameters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// JSON-RPC response message
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: jsonrpc_version(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Value, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: jsonrpc_version(),
            id,
            result: None,
            error: Some(error),
        }
    }
}

/// JSON-RPC error object
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    pub fn new(code: i32, message: String) -> Self {
        Self {
            code,
            message,
            data: None,
        }
    }

    /// Parse error (-32700)
    pub fn parse_error(message: String) -> Self {
        Self::new(-32700, message)
    }

    /// Invalid request (-32600)
    pub fn invalid_request(message: String) -> Self {
        Self::new(-32600, message)
    }

    /// Method not found (-32601)
    pub fn method_not_found(method: &str) -> Self {
        Self::new(-32601, format!("Method not found: {}", method))
    }

    /// Invalid params (-32602)
    pub fn invalid_params(message: String) -> Self {
        Self::new(-32602, message)
    }

    /// Error kind carried in `data.kind`
    pub fn kind(&self) -> Option<&str> {
        self.data.as_ref()?.get("kind")?.as_str()
    }
}

impl From<RuntimeError> for JsonRpcError {
    fn from(err: RuntimeError) -> Self {
        let code = match &err {
            RuntimeError::UnknownModel(_) => -32001,
            RuntimeError::ModelNotDownloaded(_) => -32002,
            RuntimeError::ActivationFailed { .. } => -32003,
            RuntimeError::DownloadFailed { .. } => -32004,
            RuntimeError::ModelInUse(_) => -32005,
            _ => -32000,
        };
        Self {
            code,
            message: err.to_string(),
            data: Some(serde_json::json!({ "kind": err.kind() })),
        }
    }
}

/// JSON-RPC notification pushed to the UI
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: jsonrpc_version(),
            method: method.into(),
            params,
        }
    }
}

/// Channels the UI can invoke
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    GetStatus,
    GetPort,
    ListModels,
    DownloadModel,
    DeleteModel,
    SetActiveModel,
    GetActiveModel,
    Deactivate,
}

impl Channel {
    pub const ALL: [Channel; 8] = [
        Channel::GetStatus,
        Channel::GetPort,
        Channel::ListModels,
        Channel::DownloadModel,
        Channel::DeleteModel,
        Channel::SetActiveModel,
        Channel::GetActiveModel,
        Channel::Deactivate,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Channel::GetStatus => "llamafile:get-status",
            Channel::GetPort => "llamafile:get-port",
            Channel::ListModels => "llamafile:list-models",
            Channel::DownloadModel => "llamafile:download-model",
            Channel::DeleteModel => "llamafile:delete-model",
            Channel::SetActiveModel => "llamafile:set-active-model",
            Channel::GetActiveModel => "llamafile:get-active-model",
            Channel::Deactivate => "llamafile:deactivate",
        }
    }

    /// Whether the channel takes a model id
    pub fn takes_model_id(&self) -> bool {
        matches!(
            self,
            Channel::DownloadModel | Channel::DeleteModel | Channel::SetActiveModel
        )
    }
}

impl FromStr for Channel {
    type Err = JsonRpcError;

    fn from_str(method: &str) -> Result<Self, Self::Err> {
        Channel::ALL
            .into_iter()
            .find(|channel| channel.name() == method)
            .ok_or_else(|| JsonRpcError::method_not_found(method))
    }
}

/// Extract the model id from request params
///
/// Accepts a bare string, a one-element array (as sent by `ipcRenderer.invoke`)
/// or an object with a `modelId` field. The id itself is passed through
/// unchanged; ids missing from the catalog are rejected by the manager.
pub fn model_id_param(params: Option<&Value>) -> Result<String, JsonRpcError> {
    let value = match params {
        Some(Value::String(id)) => Some(id.as_str()),
        Some(Value::Array(items)) => items.first().and_then(Value::as_str),
        Some(Value::Object(map)) => map.get("modelId").and_then(Value::as_str),
        _ => None,
    };

    value.map(str::to_string).ok_or_else(|| {
        JsonRpcError::invalid_params("expected a model id string".to_string())
    })
}

fn jsonrpc_version() -> String {
    "2.0".to_string()
}
