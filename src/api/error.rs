use super::transport::TransportError;
use crate::auth::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("unauthorized")]
    Unauthorized,
    #[error("api error ({status})")]
    Status { status: u16, body: String },
    #[error("invalid json")]
    Json(#[from] serde_json::Error),
    #[error("session store error: {0}")]
    Store(#[from] StoreError),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl ApiError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Unauthorized => Some(401),
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}
