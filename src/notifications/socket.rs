use super::backoff::ReconnectPolicy;
use super::connector::{SocketConnection, SocketConnector, SocketError, SocketFrame};
use super::events::{EventKind, EventRegistry, SocketEvent, Subscription};
use super::protocol::{parse_server_message, ClientMessage, ServerMessage};
use crate::auth::{AuthTokenStore, RefreshCoordinator, RefreshOutcome};
use crate::config::ClientConfig;
use crate::redact::redact_secrets;
use crate::types::{ConnectionState, NotificationId};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use url::Url;

/// Close codes the server uses to reject the token carried in the URL.
const AUTH_CLOSE_CODES: [u16; 2] = [4001, 4003];

#[derive(Debug, Clone)]
pub struct SocketSettings {
    pub url: String,
    pub ping_interval: Duration,
    pub reconnect: ReconnectPolicy,
}

impl SocketSettings {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            url: config.ws_url.clone(),
            ping_interval: config.ping_interval,
            reconnect: config.reconnect,
        }
    }
}

struct Worker {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Persistent push channel for notifications. One supervisor task owns the
/// socket; reconnects run strictly one after another inside it.
pub struct NotificationSocketClient {
    inner: Arc<SocketInner>,
    worker: tokio::sync::Mutex<Option<Worker>>,
}

struct SocketInner {
    settings: SocketSettings,
    tokens: Arc<AuthTokenStore>,
    connector: Arc<dyn SocketConnector>,
    refresher: Option<Arc<RefreshCoordinator>>,
    events: EventRegistry,
    state: watch::Sender<ConnectionState>,
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
}

enum Closed {
    Shutdown,
    Dropped { auth_rejected: bool },
}

impl NotificationSocketClient {
    pub fn new(
        settings: SocketSettings,
        tokens: Arc<AuthTokenStore>,
        connector: Arc<dyn SocketConnector>,
        refresher: Option<Arc<RefreshCoordinator>>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(SocketInner {
                settings,
                tokens,
                connector,
                refresher,
                events: EventRegistry::new(),
                state,
                outbound: Mutex::new(None),
            }),
            worker: tokio::sync::Mutex::new(None),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn events(&self) -> &EventRegistry {
        &self.inner.events
    }

    pub fn on(
        &self,
        kind: EventKind,
        listener: impl Fn(&SocketEvent) + Send + Sync + 'static,
    ) -> Subscription {
        self.inner.events.subscribe(kind, listener)
    }

    /// Starts the supervisor. A no-op while one is already running; after the
    /// reconnect budget is spent, calling it again starts over.
    pub async fn connect(&self) -> Result<(), SocketError> {
        let mut worker = self.worker.lock().await;
        if worker.as_ref().is_some_and(|w| !w.handle.is_finished()) {
            debug!("notification socket already running");
            return Ok(());
        }
        self.inner.authenticated_url()?;

        let (shutdown, shutdown_rx) = watch::channel(false);
        self.inner.set_state(ConnectionState::Connecting);
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move { inner.supervise(shutdown_rx).await });
        *worker = Some(Worker { shutdown, handle });
        Ok(())
    }

    /// Stops the supervisor and waits for it, so no reconnect timer outlives
    /// this call.
    pub async fn disconnect(&self) {
        let mut worker = self.worker.lock().await;
        let Some(Worker { shutdown, handle }) = worker.take() else {
            self.inner.set_state(ConnectionState::Disconnected);
            return;
        };
        self.inner.set_state(ConnectionState::Closing);
        let _ = shutdown.send(true);
        if let Err(e) = handle.await {
            warn!(error = %e, "notification socket task ended abnormally");
        }
        self.inner.set_state(ConnectionState::Disconnected);
        info!("notification socket disconnected");
    }

    /// Queues a read acknowledgement. Returns `false` when there is no open
    /// connection; callers then use the REST endpoint instead.
    pub fn mark_as_read(&self, id: impl Into<NotificationId>) -> bool {
        if self.state() != ConnectionState::Connected {
            return false;
        }
        let message = ClientMessage::MarkAsRead {
            notification_id: id.into(),
        };
        let text = match message.to_text() {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "failed to encode mark_as_read");
                return false;
            }
        };
        self.inner
            .outbound()
            .as_ref()
            .is_some_and(|tx| tx.send(text).is_ok())
    }
}

impl SocketInner {
    fn set_state(&self, next: ConnectionState) {
        self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
    }

    fn outbound(&self) -> std::sync::MutexGuard<'_, Option<mpsc::UnboundedSender<String>>> {
        self.outbound
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// The token is read fresh on every attempt so a refresh done by the REST
    /// side is picked up by the next reconnect.
    fn authenticated_url(&self) -> Result<(String, String), SocketError> {
        let token = self
            .tokens
            .access_token()
            .ok_or(SocketError::NotAuthenticated)?;
        let mut url = Url::parse(&self.settings.url)
            .map_err(|e| SocketError::InvalidUrl(e.to_string()))?;
        let kept: Vec<(String, String)> = url
            .query_pairs()
            .filter(|(k, _)| k != "token")
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        url.query_pairs_mut()
            .clear()
            .extend_pairs(kept)
            .append_pair("token", &token);
        Ok((url.into(), token))
    }

    async fn supervise(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let policy = self.settings.reconnect;
        let mut attempt: u32 = 0;
        let mut reconnect_pending = false;

        loop {
            let (url, token) = match self.authenticated_url() {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "notification socket cannot reconnect");
                    if reconnect_pending {
                        self.emit(SocketEvent::Disconnected {
                            will_reconnect: false,
                        });
                    }
                    break;
                }
            };

            self.set_state(ConnectionState::Connecting);
            debug!(url = %redact_secrets(&url), attempt, "opening notification socket");
            let connected = tokio::select! {
              _ = wait_for_shutdown(&mut shutdown) => break,
              result = self.connector.connect(&url) => result,
            };

            let (was_connected, auth_rejected) = match connected {
                Ok(connection) => {
                    attempt = 0;
                    match self.run_connection(connection, &mut shutdown).await {
                        Closed::Shutdown => break,
                        Closed::Dropped { auth_rejected } => (true, auth_rejected),
                    }
                }
                Err(SocketError::Unauthorized) => (false, true),
                Err(e) => {
                    warn!(error = %e, "notification socket connect failed");
                    (false, false)
                }
            };
            self.set_state(ConnectionState::Disconnected);

            if auth_rejected {
                let recovered = tokio::select! {
                  _ = wait_for_shutdown(&mut shutdown) => break,
                  ok = self.recover_credentials(&token) => ok,
                };
                if !recovered {
                    warn!("notification socket credentials rejected; not reconnecting");
                    if was_connected {
                        self.emit(SocketEvent::Disconnected {
                            will_reconnect: false,
                        });
                    }
                    break;
                }
            }

            attempt += 1;
            let Some(delay) = policy.delay_for_attempt(attempt) else {
                if was_connected {
                    self.emit(SocketEvent::Disconnected {
                        will_reconnect: false,
                    });
                }
                let attempts = attempt - 1;
                warn!(attempts, "notification socket reconnect budget exhausted");
                self.emit(SocketEvent::ReconnectExhausted { attempts });
                break;
            };
            if was_connected {
                self.emit(SocketEvent::Disconnected {
                    will_reconnect: true,
                });
            }
            debug!(attempt, delay_ms = delay.as_millis() as u64, "scheduling reconnect");
            self.emit(SocketEvent::ReconnectScheduled { attempt, delay });
            reconnect_pending = true;

            tokio::select! {
              _ = wait_for_shutdown(&mut shutdown) => break,
              _ = tokio::time::sleep(delay) => {}
            }
        }

        *self.outbound() = None;
        self.set_state(ConnectionState::Disconnected);
    }

    async fn run_connection(
        &self,
        mut connection: Box<dyn SocketConnection>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Closed {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        *self.outbound() = Some(tx);
        self.set_state(ConnectionState::Connected);
        info!("notification socket connected");
        self.emit(SocketEvent::Connected);

        let period = self.settings.ping_interval;
        let mut ping = tokio::time::interval_at(Instant::now() + period, period);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let closed = loop {
            tokio::select! {
              _ = wait_for_shutdown(shutdown) => {
                connection.close().await;
                break Closed::Shutdown;
              }
              frame = connection.next_frame() => match frame {
                Some(Ok(SocketFrame::Text(text))) => self.handle_text(&text),
                Some(Ok(SocketFrame::Close { code })) => {
                  info!(?code, "notification socket closed by server");
                  let auth_rejected = code.is_some_and(|c| AUTH_CLOSE_CODES.contains(&c));
                  break Closed::Dropped { auth_rejected };
                }
                Some(Err(e)) => warn!(error = %e, "notification socket error"),
                None => {
                  info!("notification socket stream ended");
                  break Closed::Dropped { auth_rejected: false };
                }
              },
              Some(text) = rx.recv() => {
                if let Err(e) = connection.send_text(text).await {
                  warn!(error = %e, "failed to send socket message");
                }
              }
              _ = ping.tick() => match ClientMessage::Ping.to_text() {
                Ok(text) => {
                  if let Err(e) = connection.send_text(text).await {
                    warn!(error = %e, "failed to send keep-alive ping");
                  }
                }
                Err(e) => warn!(error = %e, "failed to encode ping"),
              },
            }
        };

        *self.outbound() = None;
        closed
    }

    fn handle_text(&self, raw: &str) {
        let event = match parse_server_message(raw) {
            Ok(ServerMessage::Notification(notification)) => SocketEvent::Notification(notification),
            Ok(ServerMessage::ConnectionEstablished { message, user_id }) => {
                SocketEvent::ConnectionEstablished { message, user_id }
            }
            Ok(ServerMessage::MarkAsReadResponse {
                notification_id,
                success,
            }) => SocketEvent::MarkAsReadResponse {
                notification_id,
                success,
            },
            Ok(ServerMessage::Pong) => SocketEvent::Pong,
            Ok(ServerMessage::Unknown(kind)) => {
                warn!(kind = %kind, "dropping unrecognised socket message");
                return;
            }
            Err(e) => {
                warn!(error = %e, "dropping malformed socket message");
                return;
            }
        };
        self.emit(event);
    }

    fn emit(&self, event: SocketEvent) {
        self.events.emit(&event);
    }

    async fn recover_credentials(&self, rejected: &str) -> bool {
        let Some(refresher) = &self.refresher else {
            return false;
        };
        matches!(
            refresher.refresh(Some(rejected)).await,
            RefreshOutcome::Refreshed(_)
        )
    }
}

/// Resolves once shutdown is requested or the client is gone.
async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}
