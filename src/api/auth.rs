use super::client::ResilientApiClient;
use super::error::ApiError;
use super::request::ApiRequest;
use crate::config::{PATH_LOGIN, PATH_LOGOUT, PATH_PROFILE};
use crate::types::{LoginCredentials, LoginResponse, UserProfile};
use tracing::{debug, info};

/// Session endpoints. Borrowed from the client: `client.auth().login(..)`.
pub struct AuthApi<'a> {
    client: &'a ResilientApiClient,
}

impl ResilientApiClient {
    pub fn auth(&self) -> AuthApi<'_> {
        AuthApi { client: self }
    }
}

impl AuthApi<'_> {
    pub async fn login(&self, credentials: &LoginCredentials) -> Result<LoginResponse, ApiError> {
        let request = ApiRequest::post(PATH_LOGIN)
            .json(serde_json::to_value(credentials)?)
            .skip_auth();
        let response: LoginResponse = self.client.send_json(request).await?;

        let tokens = self.client.tokens();
        tokens.set_tokens(&response.access, &response.refresh)?;
        if let Some(user) = &response.user {
            tokens.set_user(user, response.user_type.as_deref().unwrap_or_default())?;
        }
        info!(user_type = response.user_type.as_deref().unwrap_or("unknown"), "logged in");
        Ok(response)
    }

    /// Tells the backend to blacklist the refresh token, then clears the local
    /// session. The local clear happens even when the call fails.
    pub async fn logout(&self) -> Result<(), ApiError> {
        let tokens = self.client.tokens();
        if let Some(refresh) = tokens.refresh_token() {
            let request = ApiRequest::post(PATH_LOGOUT)
                .json(serde_json::json!({ "refresh": refresh }))
                .skip_refresh();
            match self.client.request(request).await {
                Ok(res) if res.is_success() => {}
                Ok(res) => debug!(status = res.status().as_u16(), "logout rejected by backend"),
                Err(e) => debug!(error = %e, "logout request failed"),
            }
        }
        tokens.clear_tokens()?;
        info!("logged out");
        Ok(())
    }

    pub async fn fetch_profile(&self) -> Result<UserProfile, ApiError> {
        let profile: UserProfile = self.client.get_json(PATH_PROFILE).await?;
        let tokens = self.client.tokens();
        let user_type = tokens.user_type().unwrap_or_default();
        tokens.set_user(&profile, &user_type)?;
        Ok(profile)
    }
}
