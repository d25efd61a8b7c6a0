//! Message-stream transports.
//!
//! A [`Connector`] opens one stream and hands back a pair of channels. The
//! connection task never sees the socket itself, which keeps it independent of
//! tokio-tungstenite and lets tests substitute an in-memory server.

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{client::IntoClientRequest, protocol::Message as WsMessage},
};
use tracing::{debug, info, warn};
use voice_protocol::{ServiceKind, WireFrame};

/// Frames buffered in each direction between a connection task and its socket.
const PUMP_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectRequest {
    pub channel: ServiceKind,
    pub url: String,
    /// Full `Authorization` header value, if the target needs one.
    pub authorization: Option<String>,
}

/// An open stream. Dropping `outgoing` closes it; `incoming` ends when the peer goes away.
#[derive(Debug)]
pub struct Transport {
    pub outgoing: mpsc::Sender<WireFrame>,
    pub incoming: mpsc::Receiver<Result<WireFrame>>,
}

#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, request: &ConnectRequest) -> Result<Transport>;
}

/// Opens WebSocket connections with tokio-tungstenite.
#[derive(Debug, Default, Clone)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, request: &ConnectRequest) -> Result<Transport> {
        let mut ws_request = request.url.as_str().into_client_request()?;
        if let Some(authorization) = &request.authorization {
            ws_request
                .headers_mut()
                .insert("Authorization", authorization.parse()?);
        }

        let (ws_stream, _) = connect_async(ws_request)
            .await
            .with_context(|| format!("Failed to connect to {} service", request.channel))?;
        let (mut ws_tx, mut ws_rx) = ws_stream.split();
        info!(channel = %request.channel, "WebSocket connected.");

        let (out_tx, mut out_rx) = mpsc::channel::<WireFrame>(PUMP_CAPACITY);
        let (in_tx, in_rx) = mpsc::channel::<Result<WireFrame>>(PUMP_CAPACITY);
        let channel = request.channel;

        // Writer: runs until the connection task drops its sender.
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                let message = match frame {
                    WireFrame::Text(text) => WsMessage::Text(text.into()),
                    WireFrame::Binary(data) => WsMessage::Binary(data),
                };
                if let Err(e) = ws_tx.send(message).await {
                    warn!(%channel, error = %e, "WebSocket send failed, closing writer.");
                    return;
                }
            }
            let _ = ws_tx.send(WsMessage::Close(None)).await;
            debug!(%channel, "WebSocket writer finished.");
        });

        // Reader: forwards data frames until the peer closes or errors.
        tokio::spawn(async move {
            while let Some(msg_result) = ws_rx.next().await {
                let frame = match msg_result {
                    Ok(WsMessage::Text(text)) => Ok(WireFrame::Text(text.as_str().to_owned())),
                    Ok(WsMessage::Binary(data)) => Ok(WireFrame::Binary(data)),
                    Ok(WsMessage::Close(frame)) => {
                        info!(%channel, close_frame = ?frame, "WebSocket closed by peer.");
                        break;
                    }
                    Ok(WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_)) => continue,
                    Err(e) => Err(anyhow::Error::new(e).context("WebSocket receive failed")),
                };
                let failed = frame.is_err();
                if in_tx.send(frame).await.is_err() || failed {
                    break;
                }
            }
            debug!(%channel, "WebSocket reader finished.");
        });

        Ok(Transport {
            outgoing: out_tx,
            incoming: in_rx,
        })
    }
}
