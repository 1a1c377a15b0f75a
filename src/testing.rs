//! In-process fakes for the HTTP and WebSocket seams.

use crate::api::transport::{ApiResponse, HttpRequest, HttpTransport, TransportError};
use crate::notifications::{SocketConnection, SocketConnector, SocketError, SocketFrame};
use async_trait::async_trait;
use reqwest::header::{HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

type Handler = Box<dyn Fn(&HttpRequest) -> Result<ApiResponse, TransportError> + Send + Sync>;

pub(crate) struct FakeTransport {
    handler: Handler,
    requests: Mutex<Vec<HttpRequest>>,
    delays: Mutex<Vec<(String, Duration)>>,
}

impl FakeTransport {
    pub(crate) fn new(
        handler: impl Fn(&HttpRequest) -> Result<ApiResponse, TransportError> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            handler: Box::new(handler),
            requests: Mutex::new(Vec::new()),
            delays: Mutex::new(Vec::new()),
        })
    }

    /// Holds every answer for `url` back by `delay`.
    pub(crate) fn delay(&self, url: &str, delay: Duration) {
        self.delays.lock().unwrap().push((url.to_string(), delay));
    }

    pub(crate) fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub(crate) fn count_url(&self, url: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.url == url)
            .count()
    }
}

#[async_trait]
impl HttpTransport for FakeTransport {
    async fn send(&self, request: HttpRequest) -> Result<ApiResponse, TransportError> {
        self.requests.lock().unwrap().push(request.clone());
        let delay = self
            .delays
            .lock()
            .unwrap()
            .iter()
            .find(|(url, _)| *url == request.url)
            .map(|(_, delay)| *delay);
        match delay {
            Some(delay) => tokio::time::sleep(delay).await,
            // Give other in-flight calls a chance to run before answering.
            None => tokio::task::yield_now().await,
        }
        (self.handler)(&request)
    }
}

pub(crate) fn json_response(status: StatusCode, body: &str) -> ApiResponse {
    let mut response = ApiResponse::new(status, body.as_bytes().to_vec());
    response
        .headers
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

pub(crate) fn bearer_of(request: &HttpRequest) -> Option<String> {
    request
        .headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::to_string)
}

pub(crate) struct FakeConnection {
    inbound: mpsc::UnboundedReceiver<SocketFrame>,
    sent: Arc<Mutex<Vec<String>>>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl SocketConnection for FakeConnection {
    async fn send_text(&mut self, text: String) -> Result<(), SocketError> {
        self.sent.lock().unwrap().push(text);
        Ok(())
    }

    async fn next_frame(&mut self) -> Option<Result<SocketFrame, SocketError>> {
        self.inbound.recv().await.map(Ok)
    }

    async fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// The server end of a `FakeConnection`. Dropping it ends the stream.
pub(crate) struct FakeServer {
    tx: mpsc::UnboundedSender<SocketFrame>,
    sent: Arc<Mutex<Vec<String>>>,
    closed: Arc<AtomicBool>,
}

impl FakeServer {
    pub(crate) fn push(&self, text: &str) {
        let _ = self.tx.send(SocketFrame::Text(text.to_string()));
    }

    pub(crate) fn close_with(&self, code: u16) {
        let _ = self.tx.send(SocketFrame::Close { code: Some(code) });
    }

    pub(crate) fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }

    pub(crate) fn client_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

pub(crate) fn fake_socket() -> (FakeConnection, FakeServer) {
    let (tx, inbound) = mpsc::unbounded_channel();
    let sent = Arc::new(Mutex::new(Vec::new()));
    let closed = Arc::new(AtomicBool::new(false));
    (
        FakeConnection {
            inbound,
            sent: sent.clone(),
            closed: closed.clone(),
        },
        FakeServer { tx, sent, closed },
    )
}

pub(crate) enum Scripted {
    Accept(FakeConnection),
    Reject(SocketError),
}

/// Hands out scripted outcomes in order; refuses once the script runs out.
#[derive(Default)]
pub(crate) struct FakeConnector {
    script: Mutex<VecDeque<Scripted>>,
    urls: Mutex<Vec<String>>,
    attempts: AtomicUsize,
}

impl FakeConnector {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn accept(&self) -> FakeServer {
        let (connection, server) = fake_socket();
        self.script
            .lock()
            .unwrap()
            .push_back(Scripted::Accept(connection));
        server
    }

    pub(crate) fn reject(&self, error: SocketError) {
        self.script.lock().unwrap().push_back(Scripted::Reject(error));
    }

    pub(crate) fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub(crate) fn urls(&self) -> Vec<String> {
        self.urls.lock().unwrap().clone()
    }
}

#[async_trait]
impl SocketConnector for FakeConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn SocketConnection>, SocketError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.urls.lock().unwrap().push(url.to_string());
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(Scripted::Accept(connection)) => Ok(Box::new(connection)),
            Some(Scripted::Reject(error)) => Err(error),
            None => Err(SocketError::Connect("connection refused".to_string())),
        }
    }
}
