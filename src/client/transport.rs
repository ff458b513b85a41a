//! Transport seam
//!
//! The connection manager drives a socket through [`Connector`] and
//! [`Transport`] and learns about it only through [`TransportEvent`]s, the same
//! shape as a browser WebSocket: construction returns immediately, and the
//! open/message/error/close notifications arrive later on a channel.

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, warn};
use url::Url;

use super::endpoint::redact;
use super::{ClientError, ClientResult};
use crate::protocol::{CLOSE_ABNORMAL, CLOSE_NO_STATUS};

/// Notifications from an open transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Handshake completed
    Opened,
    /// A text frame arrived
    Text(String),
    /// Something failed; a `Closed` event follows if the socket is gone
    Error(String),
    /// The socket is closed; no further events follow
    Closed { code: u16, reason: String },
}

/// Receiving half of a transport's event stream
pub type TransportEvents = mpsc::UnboundedReceiver<TransportEvent>;

/// Handle to a live socket
pub trait Transport: Send + Sync {
    /// Queue a text frame
    fn send_text(&self, text: String) -> ClientResult<()>;

    /// Start the closing handshake
    fn close(&self, code: u16, reason: &str);
}

/// Opens transports
pub trait Connector: Send + Sync {
    fn open(&self, url: &Url) -> ClientResult<(Box<dyn Transport>, TransportEvents)>;
}

// ============================================================================
// tokio-tungstenite implementation
// ============================================================================

enum Outbound {
    Text(String),
    Close { code: u16, reason: String },
}

/// Connector backed by tokio-tungstenite
///
/// Must be called from within a tokio runtime.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

struct WsTransport {
    outbound: mpsc::UnboundedSender<Outbound>,
}

impl Connector for WsConnector {
    fn open(&self, url: &Url) -> ClientResult<(Box<dyn Transport>, TransportEvents)> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        tokio::spawn(run_socket(url.clone(), outbound_rx, event_tx));

        Ok((Box::new(WsTransport { outbound: outbound_tx }), event_rx))
    }
}

impl Transport for WsTransport {
    fn send_text(&self, text: String) -> ClientResult<()> {
        self.outbound
            .send(Outbound::Text(text))
            .map_err(|_| ClientError::Transport("socket task has stopped".to_string()))
    }

    fn close(&self, code: u16, reason: &str) {
        let _ = self.outbound.send(Outbound::Close {
            code,
            reason: reason.to_string(),
        });
    }
}

/// Socket task: performs the handshake, then pumps frames both ways
async fn run_socket(
    url: Url,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    let closed = |code: u16, reason: &str| TransportEvent::Closed {
        code,
        reason: reason.to_string(),
    };

    let ws_stream = match connect_async(url.as_str()).await {
        Ok((stream, _response)) => stream,
        Err(e) => {
            let _ = events.send(TransportEvent::Error(e.to_string()));
            let _ = events.send(closed(CLOSE_ABNORMAL, ""));
            return;
        }
    };
    debug!("Handshake complete with {}", redact(&url));
    let _ = events.send(TransportEvent::Opened);

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    loop {
        tokio::select! {
            command = outbound.recv() => {
                match command {
                    Some(Outbound::Text(text)) => {
                        if let Err(e) = ws_sender.send(WsMessage::Text(text)).await {
                            let _ = events.send(TransportEvent::Error(e.to_string()));
                            let _ = events.send(closed(CLOSE_ABNORMAL, ""));
                            return;
                        }
                    }
                    Some(Outbound::Close { code, reason }) => {
                        let frame = CloseFrame {
                            code: CloseCode::from(code),
                            reason: reason.clone().into(),
                        };
                        let _ = ws_sender.send(WsMessage::Close(Some(frame))).await;
                        let _ = events.send(closed(code, &reason));
                        return;
                    }
                    None => {
                        // Handle dropped without an explicit close
                        let _ = ws_sender.close().await;
                        return;
                    }
                }
            }
            frame = ws_receiver.next() => {
                match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        let _ = events.send(TransportEvent::Text(text));
                    }
                    Some(Ok(WsMessage::Binary(data))) => {
                        warn!("Ignoring binary frame ({} bytes)", data.len());
                    }
                    Some(Ok(WsMessage::Close(frame))) => {
                        let (code, reason) = match frame {
                            Some(frame) => (u16::from(frame.code), frame.reason.into_owned()),
                            None => (CLOSE_NO_STATUS, String::new()),
                        };
                        let _ = events.send(TransportEvent::Closed { code, reason });
                        return;
                    }
                    Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_))) => {}
                    Some(Err(e)) => {
                        let _ = events.send(TransportEvent::Error(e.to_string()));
                        let _ = events.send(closed(CLOSE_ABNORMAL, ""));
                        return;
                    }
                    None => {
                        let _ = events.send(closed(CLOSE_ABNORMAL, ""));
                        return;
                    }
                }
            }
        }
    }
}

// ============================================================================
// Test double
// ============================================================================
