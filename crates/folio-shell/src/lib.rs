//! FOLIO desktop shell bridge
//!
//! Exposes the model runtime manager to the UI process as newline-delimited
//! JSON-RPC over stdio. Request methods are the `llamafile:*` channels; runtime
//! state changes are pushed back as notifications on the same stream.

pub mod bridge;
pub mod protocol;

pub use bridge::IpcBridge;
pub use protocol::{Channel, JsonRpcError, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};
