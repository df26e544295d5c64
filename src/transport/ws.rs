//! WebSocket transport.

use super::{Channel, Connector, InboundEvent};
use crate::defaults;
use crate::error::{ConnectError, SendError};
use crate::identity::Credential;
use crate::transport::protocol::{InboundFrame, OutboundFrame};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite};
use tracing::{debug, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connects to the backend over `ws://` or `wss://`, sending the credential as
/// an `Authorization: Bearer` header on the upgrade request.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
    inbound_capacity: usize,
    close_timeout: Duration,
}

impl WsConnector {
    pub fn new(url: impl Into<String>, inbound_capacity: usize) -> Self {
        Self {
            url: url.into(),
            inbound_capacity: inbound_capacity.max(1),
            close_timeout: Duration::from_millis(defaults::CLOSE_TIMEOUT_MS),
        }
    }

    /// Bound on sending the Close frame and flushing before the socket is dropped.
    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    fn build_request(
        &self,
        credential: &Credential,
    ) -> Result<tungstenite::handshake::client::Request, ConnectError> {
        let mut request =
            self.url
                .as_str()
                .into_client_request()
                .map_err(|e| ConnectError::Handshake {
                    message: format!("invalid backend URL '{}': {}", self.url, e),
                })?;

        let header = HeaderValue::from_str(&credential.authorization_header()).map_err(|_| {
            ConnectError::Handshake {
                message: "credential contains characters not allowed in a header".to_string(),
            }
        })?;
        request.headers_mut().insert(AUTHORIZATION, header);
        Ok(request)
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn open(&self, credential: &Credential) -> Result<Box<dyn Channel>, ConnectError> {
        let request = self.build_request(credential)?;

        let stream = match connect_async(request).await {
            Ok((stream, _response)) => stream,
            Err(tungstenite::Error::Http(response)) => {
                return Err(ConnectError::Rejected {
                    status: response.status().as_u16(),
                });
            }
            Err(e) => {
                return Err(ConnectError::Unreachable {
                    message: e.to_string(),
                });
            }
        };

        info!(url = %self.url, "websocket connected");
        Ok(Box::new(WsChannel::spawn(
            stream,
            self.inbound_capacity,
            self.close_timeout,
        )))
    }

    fn endpoint(&self) -> String {
        self.url.clone()
    }
}

/// An open WebSocket. A reader task decodes inbound text frames in order.
pub struct WsChannel {
    sink: SplitSink<WsStream, tungstenite::Message>,
    inbound: Option<mpsc::Receiver<InboundEvent>>,
    reader: JoinHandle<()>,
    open: bool,
    close_timeout: Duration,
}

impl WsChannel {
    fn spawn(stream: WsStream, capacity: usize, close_timeout: Duration) -> Self {
        let (sink, source) = stream.split();
        let (tx, rx) = mpsc::channel(capacity);
        let reader = tokio::spawn(read_frames(source, tx));
        Self {
            sink,
            inbound: Some(rx),
            reader,
            open: true,
            close_timeout,
        }
    }
}

async fn read_frames(mut source: SplitStream<WsStream>, tx: mpsc::Sender<InboundEvent>) {
    let reason = loop {
        let message = match source.next().await {
            Some(Ok(message)) => message,
            Some(Err(e)) => break format!("transport error: {}", e),
            None => break "connection closed".to_string(),
        };

        let event = match message {
            tungstenite::Message::Text(text) => match InboundFrame::from_json(text.as_str()) {
                Ok(frame) => {
                    debug!(kind = frame.kind(), "frame received");
                    InboundEvent::Frame(frame)
                }
                Err(e) => InboundEvent::Invalid(e),
            },
            tungstenite::Message::Binary(_) => {
                InboundEvent::Invalid(crate::error::ProtocolError::Malformed {
                    message: "unexpected binary frame".to_string(),
                })
            }
            tungstenite::Message::Close(frame) => {
                break match frame {
                    Some(frame) => format!("closed by backend: {} {}", frame.code, frame.reason),
                    None => "closed by backend".to_string(),
                };
            }
            _ => continue,
        };

        if tx.send(event).await.is_err() {
            return;
        }
    };

    if tx.send(InboundEvent::Closed { reason }).await.is_err() {
        debug!("connection closed after the session stopped reading");
    }
}

#[async_trait]
impl Channel for WsChannel {
    async fn send(&mut self, frame: &OutboundFrame) -> Result<(), SendError> {
        if !self.open {
            return Err(SendError::NotOpen);
        }
        let json = frame.to_json().map_err(|e| SendError::Encode {
            message: e.to_string(),
        })?;
        self.sink
            .send(tungstenite::Message::Text(json.into()))
            .await
            .map_err(|e| SendError::Transport {
                message: e.to_string(),
            })
    }

    fn take_inbound(&mut self) -> Option<mpsc::Receiver<InboundEvent>> {
        self.inbound.take()
    }

    async fn close(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;
        self.reader.abort();

        let limit = self.close_timeout;
        let sink = &mut self.sink;
        let handshake = async {
            sink.send(tungstenite::Message::Close(None)).await?;
            sink.close().await
        };
        match tokio::time::timeout(limit, handshake).await {
            Ok(Ok(())) => debug!("websocket closed"),
            Ok(Err(e)) => warn!(error = %e, "websocket did not close cleanly"),
            Err(_) => warn!(
                timeout_ms = limit.as_millis() as u64,
                "backend not reading, abandoning close handshake"
            ),
        }
    }

    fn is_open(&self) -> bool {
        self.open && !self.reader.is_finished()
    }
}

impl Drop for WsChannel {
    fn drop(&mut self) {
        self.reader.abort();
    }
}
