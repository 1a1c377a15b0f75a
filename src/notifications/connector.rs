use crate::redact::redact_secrets;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketFrame {
    Text(String),
    Close { code: Option<u16> },
}

#[derive(Debug, Error)]
pub enum SocketError {
    #[error("no access token available for the notification socket")]
    NotAuthenticated,
    #[error("notification socket credentials were rejected")]
    Unauthorized,
    #[error("notification socket connect failed: {0}")]
    Connect(String),
    #[error("notification socket transport error: {0}")]
    Transport(String),
    #[error("invalid notification socket url: {0}")]
    InvalidUrl(String),
}

#[async_trait]
pub trait SocketConnector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Box<dyn SocketConnection>, SocketError>;
}

/// One open WebSocket. `next_frame` must be cancel-safe: the supervisor races
/// it against pings, outbound messages and shutdown.
#[async_trait]
pub trait SocketConnection: Send {
    async fn send_text(&mut self, text: String) -> Result<(), SocketError>;
    /// `None` once the stream has ended.
    async fn next_frame(&mut self) -> Option<Result<SocketFrame, SocketError>>;
    async fn close(&mut self);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TungsteniteConnector;

#[async_trait]
impl SocketConnector for TungsteniteConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn SocketConnection>, SocketError> {
        match tokio_tungstenite::connect_async(url).await {
            Ok((stream, _response)) => Ok(Box::new(TungsteniteConnection { stream })),
            Err(WsError::Http(response)) if matches!(response.status().as_u16(), 401 | 403) => {
                Err(SocketError::Unauthorized)
            }
            Err(e) => Err(SocketError::Connect(
                redact_secrets(&e.to_string()).to_string(),
            )),
        }
    }
}

struct TungsteniteConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl SocketConnection for TungsteniteConnection {
    async fn send_text(&mut self, text: String) -> Result<(), SocketError> {
        self.stream
            .send(Message::Text(text))
            .await
            .map_err(|e| SocketError::Transport(e.to_string()))
    }

    async fn next_frame(&mut self) -> Option<Result<SocketFrame, SocketError>> {
        loop {
            let message = match self.stream.next().await? {
                Ok(m) => m,
                Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => return None,
                Err(e) => return Some(Err(SocketError::Transport(e.to_string()))),
            };
            match message {
                Message::Text(text) => return Some(Ok(SocketFrame::Text(text))),
                Message::Binary(bytes) => match String::from_utf8(bytes) {
                    Ok(text) => return Some(Ok(SocketFrame::Text(text))),
                    Err(_) => continue,
                },
                Message::Close(frame) => {
                    return Some(Ok(SocketFrame::Close {
                        code: frame.map(|f| u16::from(f.code)),
                    }))
                }
                // Protocol-level pings are answered by tungstenite itself.
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.stream.close(None).await;
    }
}
