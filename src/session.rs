use crate::api::{join_url, ApiError, HttpTransport, ReqwestTransport, ResilientApiClient, TransportError};
use crate::auth::{
    AuthFailureHandler, AuthTokenStore, JsonFileStore, KeyValueStore, KeyringStore, RefreshCoordinator,
    StoreError,
};
use crate::config::{ClientConfig, PATH_TOKEN_REFRESH};
use crate::notifications::{
    EventKind, NotificationFeed, NotificationSocketClient, SocketConnector, SocketError,
    SocketSettings, Subscription, TungsteniteConnector,
};
use crate::types::{LoginCredentials, LoginResponse, NotificationId};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Socket(#[from] SocketError),
}

/// Which channel carried a read acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadPath {
    Socket,
    Rest,
}

pub struct SessionBuilder {
    config: ClientConfig,
    store: Option<Box<dyn KeyValueStore>>,
    transport: Option<Arc<dyn HttpTransport>>,
    connector: Option<Arc<dyn SocketConnector>>,
    on_auth_failure: Option<AuthFailureHandler>,
}

impl SessionBuilder {
    pub fn store(mut self, store: impl KeyValueStore + 'static) -> Self {
        self.store = Some(Box::new(store));
        self
    }

    pub fn transport(mut self, transport: Arc<dyn HttpTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn connector(mut self, connector: Arc<dyn SocketConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Runs after an unrecoverable refresh failure has cleared the session.
    pub fn on_auth_failure(mut self, handler: AuthFailureHandler) -> Self {
        self.on_auth_failure = Some(handler);
        self
    }

    pub fn build(self) -> Result<Session, SessionError> {
        let config = self.config;
        let store = match self.store {
            Some(store) => store,
            None => default_store(&config)?,
        };
        let transport: Arc<dyn HttpTransport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(ReqwestTransport::new(&config)?),
        };
        let connector: Arc<dyn SocketConnector> = match self.connector {
            Some(connector) => connector,
            None => Arc::new(TungsteniteConnector),
        };

        let tokens = Arc::new(AuthTokenStore::from_boxed(store));
        let refresher = Arc::new(RefreshCoordinator::new(
            tokens.clone(),
            transport.clone(),
            join_url(&config.api_base_url, PATH_TOKEN_REFRESH),
            self.on_auth_failure,
        ));
        let api = ResilientApiClient::new(
            config.api_base_url.clone(),
            transport,
            tokens.clone(),
            refresher.clone(),
        );
        let socket = NotificationSocketClient::new(
            SocketSettings::from_config(&config),
            tokens.clone(),
            connector,
            Some(refresher.clone()),
        );

        let feed = Arc::new(NotificationFeed::new());
        let feed_sync = [EventKind::Notification, EventKind::MarkAsReadResponse]
            .into_iter()
            .map(|kind| {
                let feed = feed.clone();
                socket.on(kind, move |event| {
                    feed.apply(event);
                })
            })
            .collect();

        Ok(Session {
            config,
            tokens,
            refresher,
            api,
            socket,
            feed,
            _feed_sync: feed_sync,
        })
    }
}

fn default_store(config: &ClientConfig) -> Result<Box<dyn KeyValueStore>, StoreError> {
    if config.use_keyring {
        let keyring = KeyringStore::new();
        if keyring.is_available() {
            return Ok(Box::new(keyring));
        }
        warn!("OS keychain unavailable; falling back to the session file");
    }
    Ok(Box::new(JsonFileStore::open(config.store_path.clone())?))
}

/// The client object graph: one token store, one refresh coordinator shared by
/// the REST client and the socket, one of each client, and the local feed.
pub struct Session {
    config: ClientConfig,
    tokens: Arc<AuthTokenStore>,
    refresher: Arc<RefreshCoordinator>,
    api: ResilientApiClient,
    socket: NotificationSocketClient,
    feed: Arc<NotificationFeed>,
    _feed_sync: Vec<Subscription>,
}

impl Session {
    pub fn builder(config: ClientConfig) -> SessionBuilder {
        SessionBuilder {
            config,
            store: None,
            transport: None,
            connector: None,
            on_auth_failure: None,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn tokens(&self) -> &Arc<AuthTokenStore> {
        &self.tokens
    }

    pub fn refresher(&self) -> &Arc<RefreshCoordinator> {
        &self.refresher
    }

    pub fn api(&self) -> &ResilientApiClient {
        &self.api
    }

    pub fn socket(&self) -> &NotificationSocketClient {
        &self.socket
    }

    pub fn feed(&self) -> &NotificationFeed {
        &self.feed
    }

    pub fn is_authenticated(&self) -> bool {
        self.tokens.has_session()
    }

    pub async fn login(&self, username: &str, password: &str) -> Result<LoginResponse, SessionError> {
        let credentials = LoginCredentials {
            username: username.trim().to_string(),
            password: password.to_string(),
        };
        Ok(self.api.auth().login(&credentials).await?)
    }

    /// Closes the socket first so it cannot reconnect with a token that is
    /// about to be revoked.
    pub async fn logout(&self) -> Result<(), SessionError> {
        self.socket.disconnect().await;
        self.api.auth().logout().await?;
        self.feed.replace(Vec::new());
        Ok(())
    }

    pub async fn connect_notifications(&self) -> Result<(), SessionError> {
        Ok(self.socket.connect().await?)
    }

    pub async fn disconnect_notifications(&self) {
        self.socket.disconnect().await;
    }

    /// Reloads the feed over REST. Returns the unread count afterwards.
    pub async fn sync_notifications(&self) -> Result<usize, SessionError> {
        let list = self.api.notifications().list().await?;
        debug!(count = list.len(), "notifications synced");
        self.feed.replace(list);
        Ok(self.feed.unread_count())
    }

    /// Prefers the socket. The feed flips when the server acknowledges; over
    /// REST it flips as soon as the call succeeds.
    pub async fn mark_notification_read(
        &self,
        id: impl Into<NotificationId>,
    ) -> Result<ReadPath, SessionError> {
        let id = id.into();
        if self.socket.mark_as_read(id.clone()) {
            return Ok(ReadPath::Socket);
        }
        self.api.notifications().mark_as_read(&id).await?;
        self.feed.mark_read_locally(&id);
        Ok(ReadPath::Rest)
    }

    pub async fn mark_all_notifications_read(&self) -> Result<usize, SessionError> {
        self.api.notifications().mark_all_as_read().await?;
        let flipped = self.feed.mark_all_read_locally();
        info!(flipped, "all notifications marked read");
        Ok(flipped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::HttpRequest;
    use crate::auth::{AuthFailure, MemoryStore};
    use crate::config::{KEY_ACCESS_TOKEN, KEY_REFRESH_TOKEN};
    use crate::notifications::SocketEvent;
    use crate::testing::{bearer_of, json_response, FakeConnector, FakeTransport};
    use crate::types::{ConnectionState, RecordId};
    use reqwest::{Method, StatusCode};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    const API: &str = "http://portal.test/api";
    const REFRESH_URL: &str = "http://portal.test/api/auth/token/refresh/";
    const LIST_URL: &str = "http://portal.test/api/notifications/";

    fn config() -> ClientConfig {
        ClientConfig {
            api_base_url: API.to_string(),
            ws_url: "ws://portal.test/ws/notifications/".to_string(),
            ..ClientConfig::default()
        }
    }

    fn seeded_store(access: &str) -> MemoryStore {
        let mut store = MemoryStore::new();
        store
            .set_many(&[(KEY_ACCESS_TOKEN, access), (KEY_REFRESH_TOKEN, "R")])
            .unwrap();
        store
    }

    /// Accepts only bearer `B`; refresh always hands out `B`.
    fn portal(req: &HttpRequest) -> Result<crate::api::ApiResponse, TransportError> {
        if req.url == REFRESH_URL {
            return Ok(json_response(StatusCode::OK, r#"{"access":"B"}"#));
        }
        if bearer_of(req).as_deref() != Some("B") {
            return Ok(json_response(StatusCode::UNAUTHORIZED, r#"{"detail":"expired"}"#));
        }
        if req.url == LIST_URL {
            return Ok(json_response(
                StatusCode::OK,
                r#"{"count":2,"results":[
                    {"id":1,"message":"Hearing moved","type":"incident_update","created_at":"2024-05-01T09:00:00Z","is_read":false},
                    {"id":2,"message":"Evidence added","type":"evidence","created_at":"2024-05-01T08:00:00Z","is_read":true}
                ]}"#,
            ));
        }
        Ok(json_response(StatusCode::OK, "{}"))
    }

    async fn wait_connected(session: &Session) {
        session
            .socket()
            .watch_state()
            .wait_for(|s| *s == ConnectionState::Connected)
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn socket_and_rest_share_one_refresh() {
        let transport = FakeTransport::new(portal);
        let connector = FakeConnector::new();
        let first = connector.accept();
        let _second = connector.accept();
        let session = Session::builder(config())
            .store(seeded_store("A"))
            .transport(transport.clone())
            .connector(connector.clone())
            .build()
            .unwrap();

        session.connect_notifications().await.unwrap();
        wait_connected(&session).await;
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let _sub = session.socket().on(EventKind::Connected, move |_| {
            let _ = tx.send(());
        });
        first.close_with(4001);
        rx.recv().await.unwrap();

        assert_eq!(session.sync_notifications().await.unwrap(), 1);
        assert_eq!(session.refresher().network_calls(), 1);
        assert_eq!(transport.count_url(REFRESH_URL), 1);
        assert_eq!(transport.count_url(LIST_URL), 1);
        assert!(connector.urls()[1].ends_with("token=B"));
        session.logout().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn read_falls_back_to_rest_while_disconnected() {
        let transport = FakeTransport::new(portal);
        let session = Session::builder(config())
            .store(seeded_store("B"))
            .transport(transport.clone())
            .connector(FakeConnector::new())
            .build()
            .unwrap();
        session.sync_notifications().await.unwrap();

        let path = session.mark_notification_read(1_u64).await.unwrap();

        assert_eq!(path, ReadPath::Rest);
        assert_eq!(
            transport.count_url("http://portal.test/api/notifications/1/mark_as_read/"),
            1
        );
        assert_eq!(session.feed().unread_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn read_goes_over_the_socket_and_feed_follows_the_ack() {
        let transport = FakeTransport::new(portal);
        let connector = FakeConnector::new();
        let server = connector.accept();
        let session = Session::builder(config())
            .store(seeded_store("B"))
            .transport(transport.clone())
            .connector(connector)
            .build()
            .unwrap();
        session.sync_notifications().await.unwrap();
        session.connect_notifications().await.unwrap();
        wait_connected(&session).await;

        assert_eq!(session.mark_notification_read(1_u64).await.unwrap(), ReadPath::Socket);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(server.sent(), vec![r#"{"type":"mark_as_read","notification_id":1}"#.to_string()]);
        assert_eq!(session.feed().unread_count(), 1);

        server.push(r#"{"type":"mark_as_read_response","notification_id":1,"success":true}"#);
        server.push(r#"{"type":"notification","notification":{"id":3,"message":"New filing","type":"incident_update","created_at":"2024-05-02T09:00:00Z"}}"#);
        tokio::time::sleep(Duration::from_millis(10)).await;

        let feed = session.feed().snapshot();
        assert_eq!(feed[0].id, RecordId::Number(3));
        assert_eq!(session.feed().unread_count(), 1);
        assert_eq!(transport.count_url("http://portal.test/api/notifications/1/mark_as_read/"), 0);
        session.disconnect_notifications().await;
    }

    #[tokio::test(start_paused = true)]
    async fn mark_all_read_flips_the_whole_feed() {
        let transport = FakeTransport::new(portal);
        let session = Session::builder(config())
            .store(seeded_store("B"))
            .transport(transport.clone())
            .connector(FakeConnector::new())
            .build()
            .unwrap();
        assert_eq!(session.sync_notifications().await.unwrap(), 1);

        assert_eq!(session.mark_all_notifications_read().await.unwrap(), 1);

        assert_eq!(session.feed().unread_count(), 0);
        assert_eq!(session.feed().len(), 2);
        let call = transport
            .requests()
            .into_iter()
            .find(|r| r.url == "http://portal.test/api/notifications/mark_all_as_read/")
            .unwrap();
        assert_eq!(call.method, Method::POST);
    }

    #[tokio::test(start_paused = true)]
    async fn mark_all_read_leaves_the_feed_alone_when_rest_fails() {
        let transport = FakeTransport::new(|req| {
            if req.url.ends_with("/mark_all_as_read/") {
                return Ok(json_response(StatusCode::SERVICE_UNAVAILABLE, "{}"));
            }
            portal(req)
        });
        let session = Session::builder(config())
            .store(seeded_store("B"))
            .transport(transport)
            .connector(FakeConnector::new())
            .build()
            .unwrap();
        session.sync_notifications().await.unwrap();

        let err = session.mark_all_notifications_read().await.unwrap_err();

        assert!(matches!(err, SessionError::Api(ApiError::Status { status: 503, .. })));
        assert_eq!(session.feed().unread_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn logout_stops_the_socket_and_clears_everything() {
        let transport = FakeTransport::new(portal);
        let connector = FakeConnector::new();
        let server = connector.accept();
        let session = Session::builder(config())
            .store(seeded_store("B"))
            .transport(transport.clone())
            .connector(connector.clone())
            .build()
            .unwrap();
        session.sync_notifications().await.unwrap();
        session.connect_notifications().await.unwrap();
        wait_connected(&session).await;

        session.logout().await.unwrap();

        assert!(server.client_closed());
        assert_eq!(session.socket().state(), ConnectionState::Disconnected);
        assert!(!session.is_authenticated());
        assert!(session.feed().is_empty());
        let logout = transport
            .requests()
            .into_iter()
            .find(|r| r.url.ends_with("/auth/logout/"))
            .unwrap();
        assert_eq!(logout.method, Method::POST);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(connector.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_refresh_reports_once_and_returns_the_401() {
        let failures = Arc::new(AtomicUsize::new(0));
        let seen = failures.clone();
        let transport = FakeTransport::new(|req| {
            if req.url == REFRESH_URL {
                return Ok(json_response(StatusCode::UNAUTHORIZED, r#"{"detail":"blacklisted"}"#));
            }
            Ok(json_response(StatusCode::UNAUTHORIZED, r#"{"detail":"expired"}"#))
        });
        let session = Session::builder(config())
            .store(seeded_store("A"))
            .transport(transport.clone())
            .connector(FakeConnector::new())
            .on_auth_failure(Arc::new(move |reason| {
                assert!(matches!(reason, AuthFailure::RefreshRejected { status: 401 }));
                seen.fetch_add(1, Ordering::SeqCst);
            }))
            .build()
            .unwrap();

        let err = session.sync_notifications().await.unwrap_err();

        assert!(matches!(err, SessionError::Api(ApiError::Unauthorized)));
        assert_eq!(failures.load(Ordering::SeqCst), 1);
        assert_eq!(transport.count_url(REFRESH_URL), 1);
        assert!(!session.is_authenticated());
        assert!(matches!(
            session.connect_notifications().await,
            Err(SessionError::Socket(SocketError::NotAuthenticated))
        ));
    }

    #[test]
    fn feed_listener_ignores_unrelated_events() {
        let session = Session::builder(config())
            .store(MemoryStore::new())
            .transport(FakeTransport::new(portal))
            .connector(FakeConnector::new())
            .build()
            .unwrap();
        session.socket().events().emit(&SocketEvent::Pong);
        assert!(session.feed().is_empty());
    }
}
