use super::error::ApiError;
use super::request::ApiRequest;
use super::transport::{ApiResponse, HttpRequest, HttpTransport};
use crate::auth::{AuthTokenStore, RefreshCoordinator, RefreshOutcome};
use crate::redact::redact_secrets;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

const MAX_ERROR_BODY_CHARS: usize = 512;

pub(crate) fn join_url(base: &str, target: &str) -> String {
    if target.starts_with("http://") || target.starts_with("https://") {
        return target.to_string();
    }
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        target.trim_start_matches('/')
    )
}

fn bearer(token: &str) -> Result<HeaderValue, ApiError> {
    let mut value = HeaderValue::from_str(&format!("Bearer {token}"))
        .map_err(|_| ApiError::InvalidRequest("access token is not a valid header value".into()))?;
    value.set_sensitive(true);
    Ok(value)
}

/// Turns a non-2xx response into an error, keeping a bounded slice of the body.
pub fn check_status(response: ApiResponse) -> Result<ApiResponse, ApiError> {
    if response.is_success() {
        return Ok(response);
    }
    if response.status() == StatusCode::UNAUTHORIZED {
        return Err(ApiError::Unauthorized);
    }
    let body: String = response.text().chars().take(MAX_ERROR_BODY_CHARS).collect();
    Err(ApiError::Status {
        status: response.status().as_u16(),
        body,
    })
}

pub struct ResilientApiClient {
    base_url: String,
    transport: Arc<dyn HttpTransport>,
    tokens: Arc<AuthTokenStore>,
    refresher: Arc<RefreshCoordinator>,
}

impl ResilientApiClient {
    pub fn new(
        base_url: impl Into<String>,
        transport: Arc<dyn HttpTransport>,
        tokens: Arc<AuthTokenStore>,
        refresher: Arc<RefreshCoordinator>,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            transport,
            tokens,
            refresher,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn tokens(&self) -> &Arc<AuthTokenStore> {
        &self.tokens
    }

    pub fn refresher(&self) -> &Arc<RefreshCoordinator> {
        &self.refresher
    }

    pub fn url_for(&self, target: &str) -> String {
        join_url(&self.base_url, target)
    }

    fn prepare(&self, request: &ApiRequest) -> Result<HttpRequest, ApiError> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        let body = match &request.body {
            Some(value) => {
                headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
                Some(serde_json::to_vec(value)?)
            }
            None => None,
        };
        for (name, value) in request.headers.iter() {
            headers.insert(name.clone(), value.clone());
        }
        Ok(HttpRequest {
            method: request.method.clone(),
            url: self.url_for(&request.target),
            headers,
            body,
        })
    }

    /// Sends `request`, recovering once from an expired access token.
    ///
    /// A 401 is answered by the shared refresh coordinator; on success the call is
    /// replayed exactly once with the new token and that response is returned,
    /// whatever its status. When the refresh fails the session has already been
    /// cleared and the original 401 is returned. Any other status passes through.
    pub async fn request(&self, request: ApiRequest) -> Result<ApiResponse, ApiError> {
        let mut http = self.prepare(&request)?;
        let sent_token = if request.skip_auth {
            None
        } else {
            self.tokens.access_token()
        };
        if let Some(token) = &sent_token {
            http.headers.insert(AUTHORIZATION, bearer(token)?);
        }

        let response = self.transport.send(http.clone()).await?;
        debug!(
            method = %http.method,
            url = %redact_secrets(&http.url),
            status = response.status().as_u16(),
            "api request"
        );

        if !response.is_unauthorized() || request.skip_auth || request.skip_refresh {
            return Ok(response);
        }

        match self.refresher.refresh(sent_token.as_deref()).await {
            RefreshOutcome::Refreshed(token) => {
                http.headers.insert(AUTHORIZATION, bearer(&token)?);
                let replayed = self.transport.send(http.clone()).await?;
                debug!(
                    method = %http.method,
                    url = %redact_secrets(&http.url),
                    status = replayed.status().as_u16(),
                    "api request replayed after token refresh"
                );
                Ok(replayed)
            }
            RefreshOutcome::Failed => Ok(response),
        }
    }

    pub async fn send_json<T: DeserializeOwned>(&self, request: ApiRequest) -> Result<T, ApiError> {
        let response = check_status(self.request(request).await?)?;
        Ok(response.json()?)
    }

    pub async fn get_json<T: DeserializeOwned>(&self, target: &str) -> Result<T, ApiError> {
        self.send_json(ApiRequest::get(target)).await
    }

    pub async fn post_json<T: DeserializeOwned>(&self, target: &str, body: Value) -> Result<T, ApiError> {
        self.send_json(ApiRequest::post(target).json(body)).await
    }

    pub async fn put_json<T: DeserializeOwned>(&self, target: &str, body: Value) -> Result<T, ApiError> {
        self.send_json(ApiRequest::put(target).json(body)).await
    }

    pub async fn patch_json<T: DeserializeOwned>(&self, target: &str, body: Value) -> Result<T, ApiError> {
        self.send_json(ApiRequest::patch(target).json(body)).await
    }

    pub async fn delete(&self, target: &str) -> Result<(), ApiError> {
        check_status(self.request(ApiRequest::delete(target)).await?)?;
        Ok(())
    }
}
