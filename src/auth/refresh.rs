use super::token_store::AuthTokenStore;
use crate::api::transport::{HttpRequest, HttpTransport};
use crate::redact::redact_secrets;
use crate::types::RefreshResponse;
use futures::future::{BoxFuture, FutureExt, Shared};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::Method;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthFailure {
    #[error("no refresh token is stored")]
    MissingRefreshToken,
    #[error("refresh token was rejected ({status})")]
    RefreshRejected { status: u16 },
    #[error("token refresh failed: {0}")]
    RefreshUnavailable(String),
}

/// Called once per failed refresh cycle, after the session has been cleared.
pub type AuthFailureHandler = Arc<dyn Fn(&AuthFailure) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    Refreshed(String),
    Failed,
}

type SharedRefresh = Shared<BoxFuture<'static, RefreshOutcome>>;

/// Single-flight access-token refresh shared by every consumer of a session.
pub struct RefreshCoordinator {
    tokens: Arc<AuthTokenStore>,
    transport: Arc<dyn HttpTransport>,
    refresh_url: String,
    on_failure: Option<AuthFailureHandler>,
    in_flight: Mutex<Option<(u64, SharedRefresh)>>,
    generation: AtomicU64,
    network_calls: Arc<AtomicU64>,
}

impl RefreshCoordinator {
    pub fn new(
        tokens: Arc<AuthTokenStore>,
        transport: Arc<dyn HttpTransport>,
        refresh_url: impl Into<String>,
        on_failure: Option<AuthFailureHandler>,
    ) -> Self {
        Self {
            tokens,
            transport,
            refresh_url: refresh_url.into(),
            on_failure,
            in_flight: Mutex::new(None),
            generation: AtomicU64::new(0),
            network_calls: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Number of refresh calls that actually reached the network.
    pub fn network_calls(&self) -> u64 {
        self.network_calls.load(Ordering::SeqCst)
    }

    pub fn is_refreshing(&self) -> bool {
        self.slot().is_some()
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, Option<(u64, SharedRefresh)>> {
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// `rejected_access` is the token the failing call carried. If the store
    /// already holds a different one, a refresh finished in the meantime and
    /// that token is returned without another round trip. If the store holds
    /// none, an earlier cycle already failed and reported it, so this call
    /// fails quietly.
    pub async fn refresh(&self, rejected_access: Option<&str>) -> RefreshOutcome {
        if let Some(rejected) = rejected_access {
            match self.tokens.access_token() {
                Some(current) if rejected != current => {
                    debug!("access token already rotated; reusing it");
                    return RefreshOutcome::Refreshed(current);
                }
                Some(_) => {}
                None => {
                    debug!("session already cleared; not refreshing again");
                    return RefreshOutcome::Failed;
                }
            }
        }

        let (generation, pending) = self.join_or_start();
        let outcome = pending.await;

        let mut slot = self.slot();
        if slot.as_ref().is_some_and(|(g, _)| *g == generation) {
            *slot = None;
        }
        outcome
    }

    fn join_or_start(&self) -> (u64, SharedRefresh) {
        let mut slot = self.slot();
        if let Some((generation, pending)) = slot.as_ref() {
            debug!("joining in-flight token refresh");
            return (*generation, pending.clone());
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let pending = perform_refresh(
            self.tokens.clone(),
            self.transport.clone(),
            self.refresh_url.clone(),
            self.on_failure.clone(),
            self.network_calls.clone(),
        )
        .boxed()
        .shared();
        *slot = Some((generation, pending.clone()));
        (generation, pending)
    }
}

async fn perform_refresh(
    tokens: Arc<AuthTokenStore>,
    transport: Arc<dyn HttpTransport>,
    refresh_url: String,
    on_failure: Option<AuthFailureHandler>,
    network_calls: Arc<AtomicU64>,
) -> RefreshOutcome {
    let fail = |reason: AuthFailure| {
        warn!(reason = %reason, "session expired; clearing stored credentials");
        if let Err(e) = tokens.clear_tokens() {
            warn!(error = %e, "failed to clear session store");
        }
        if let Some(handler) = &on_failure {
            handler(&reason);
        }
        RefreshOutcome::Failed
    };

    let Some(refresh_token) = tokens.refresh_token() else {
        return fail(AuthFailure::MissingRefreshToken);
    };

    let body = match serde_json::to_vec(&serde_json::json!({ "refresh": refresh_token })) {
        Ok(body) => body,
        Err(e) => return fail(AuthFailure::RefreshUnavailable(e.to_string())),
    };
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

    network_calls.fetch_add(1, Ordering::SeqCst);
    debug!("refreshing access token");
    let response = transport
        .send(HttpRequest {
            method: Method::POST,
            url: refresh_url,
            headers,
            body: Some(body),
        })
        .await;

    let response = match response {
        Ok(r) => r,
        Err(e) => {
            let msg = redact_secrets(&e.to_string()).to_string();
            return fail(AuthFailure::RefreshUnavailable(msg));
        }
    };

    if !response.is_success() {
        return fail(AuthFailure::RefreshRejected {
            status: response.status().as_u16(),
        });
    }

    let parsed: RefreshResponse = match response.json() {
        Ok(v) => v,
        Err(e) => return fail(AuthFailure::RefreshUnavailable(e.to_string())),
    };
    let access = parsed.access.trim().to_string();
    if access.is_empty() {
        return fail(AuthFailure::RefreshUnavailable(
            "refresh response carried an empty access token".to_string(),
        ));
    }

    let next_refresh = parsed.refresh.as_deref().unwrap_or(&refresh_token);
    if let Err(e) = tokens.set_tokens(&access, next_refresh) {
        return fail(AuthFailure::RefreshUnavailable(e.to_string()));
    }
    info!(rotated = parsed.refresh.is_some(), "access token refreshed");
    RefreshOutcome::Refreshed(access)
}
