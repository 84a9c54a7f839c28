//! Stdio bridge between the UI process and the model runtime manager
//!
//! The UI writes one JSON-RPC request per line. Each request is handled on its
//! own task, so a long activation never blocks a status query. All output
//! (responses and pushed runtime events) goes through a single writer task and
//! is therefore never interleaved mid-line.

use std::io;

use folio_runtime::{ModelRuntimeManager, RuntimeEvent};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::protocol::{
    model_id_param, Channel, JsonRpcError, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
};

/// Routes `llamafile:*` channels onto a [`ModelRuntimeManager`]
#[derive(Clone)]
pub struct IpcBridge {
    manager: ModelRuntimeManager,
}

impl IpcBridge {
    pub fn new(manager: ModelRuntimeManager) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &ModelRuntimeManager {
        &self.manager
    }

    /// Invoke one channel and return its JSON result
    pub async fn dispatch(&self, method: &str, params: Option<&Value>) -> Result<Value, JsonRpcError> {
        let channel: Channel = method.parse()?;
        let model_id = if channel.takes_model_id() {
            Some(model_id_param(params)?)
        } else {
            None
        };
        let model_id = model_id.as_deref().unwrap_or_default();

        debug!(channel = channel.name(), model_id, "Dispatching request");

        let result = match channel {
            Channel::GetStatus => to_json(&self.manager.get_status().await)?,
            Channel::GetPort => to_json(&self.manager.get_port().await)?,
            Channel::ListModels => to_json(&self.manager.list_models().await)?,
            Channel::GetActiveModel => to_json(&self.manager.get_active_model().await)?,
            Channel::DownloadModel => {
                self.manager.download_model(model_id).await?;
                Value::Null
            }
            Channel::DeleteModel => {
                self.manager.delete_model(model_id).await?;
                Value::Null
            }
            Channel::SetActiveModel => {
                self.manager.set_active_model(model_id).await?;
                Value::Null
            }
            Channel::Deactivate => {
                self.manager.deactivate().await?;
                Value::Null
            }
        };

        Ok(result)
    }

    /// Handle one raw input line
    ///
    /// Returns the serialized response, or `None` when the line was a
    /// notification from the client (no `id`), which gets no reply.
    pub async fn handle_line(&self, line: &str) -> Option<String> {
        let request: JsonRpcRequest = match serde_json::from_str(line) {
            Ok(request) => request,
            Err(e) => {
                warn!("Unparseable request: {}", e);
                let response =
                    JsonRpcResponse::error(Value::Null, JsonRpcError::parse_error(e.to_string()));
                return serialize(&response);
            }
        };

        if request.jsonrpc != "2.0" {
            let response = JsonRpcResponse::error(
                request.id.unwrap_or(Value::Null),
                JsonRpcError::invalid_request(format!(
                    "unsupported jsonrpc version: {}",
                    request.jsonrpc
                )),
            );
            return serialize(&response);
        }

        let result = self.dispatch(&request.method, request.params.as_ref()).await;

        let id = match request.id {
            Some(id) => id,
            None => {
                if let Err(e) = result {
                    warn!(method = %request.method, "Notification failed: {}", e.message);
                }
                return None;
            }
        };

        let response = match result {
            Ok(value) => JsonRpcResponse::success(id, value),
            Err(e) => {
                debug!(method = %request.method, code = e.code, "Request failed: {}", e.message);
                JsonRpcResponse::error(id, e)
            }
        };
        serialize(&response)
    }

    /// Serve requests from `reader` until end of input
    ///
    /// Runtime events are forwarded to `writer` as notifications for as long
    /// as the loop runs. Requests still in flight at end of input are allowed
    /// to finish and their responses are written before this returns.
    pub async fn serve<R, W>(&self, reader: R, writer: W) -> io::Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel::<String>();
        let writer_task = tokio::spawn(write_lines(writer, rx));
        let events_task = tokio::spawn(forward_events(self.manager.subscribe(), tx.clone()));

        info!("IPC bridge ready");

        let mut lines = reader.lines();
        let read_result = loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            };
            if line.trim().is_empty() {
                continue;
            }

            let bridge = self.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                if let Some(response) = bridge.handle_line(&line).await {
                    let _ = tx.send(response);
                }
            });
        };

        info!("IPC input closed");
        events_task.abort();
        drop(tx);

        let write_result = writer_task
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        read_result.and(write_result)
    }
}

async fn write_lines<W>(mut writer: W, mut rx: mpsc::UnboundedReceiver<String>) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(line) = rx.recv().await {
        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
    }
    Ok(())
}

async fn forward_events(
    mut events: broadcast::Receiver<RuntimeEvent>,
    tx: mpsc::UnboundedSender<String>,
) {
    loop {
        match events.recv().await {
            Ok(event) => {
                let Some(line) = notification_line(&event) else {
                    continue;
                };
                if tx.send(line).is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Event forwarder lagged, skipped {} events", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Serialize a runtime event as a notification line
pub fn notification_line(event: &RuntimeEvent) -> Option<String> {
    let params = match serde_json::to_value(event) {
        Ok(params) => params,
        Err(e) => {
            error!("Failed to serialize event: {}", e);
            return None;
        }
    };
    serialize(&JsonRpcNotification::new(event.channel(), Some(params)))
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<Value, JsonRpcError> {
    serde_json::to_value(value).map_err(|e| JsonRpcError::new(-32603, e.to_string()))
}

fn serialize<T: serde::Serialize>(message: &T) -> Option<String> {
    match serde_json::to_string(message) {
        Ok(line) => Some(line),
        Err(e) => {
            error!("Failed to serialize message: {}", e);
            None
        }
    }
}
