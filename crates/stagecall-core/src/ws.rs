//! WebSocket connector for production use.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use url::Url;

use crate::errors::StageError;
use crate::transport::{Connector, SignalChannel};

#[derive(Debug, Default, Clone)]
pub struct WsConnector;

impl WsConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn open(&self, url: &Url) -> Result<SignalChannel, StageError> {
        let (stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| StageError::Transport(format!("websocket connect failed: {e}")))?;
        tracing::debug!(host = ?url.host_str(), "signaling websocket connected");
        let (mut ws_write, mut ws_read) = stream.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<String>();

        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if ws_write.send(Message::text(text)).await.is_err() {
                    break;
                }
            }
            let _ = ws_write.close().await;
        });

        tokio::spawn(async move {
            while let Some(msg) = ws_read.next().await {
                let text = match msg {
                    Ok(Message::Text(text)) => text.to_string(),
                    Ok(Message::Binary(data)) => match String::from_utf8(data.to_vec()) {
                        Ok(text) => text,
                        Err(_) => {
                            tracing::warn!(len = data.len(), "dropping non-utf8 binary frame");
                            continue;
                        }
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(err) => {
                        match &err {
                            WsError::ConnectionClosed
                            | WsError::AlreadyClosed
                            | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                                tracing::debug!("signaling websocket closed: {err}");
                            }
                            _ => tracing::warn!("signaling websocket error: {err}"),
                        }
                        break;
                    }
                };
                if in_tx.send(text).is_err() {
                    break;
                }
            }
        });

        Ok(SignalChannel {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}
