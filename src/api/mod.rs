mod auth;
mod client;
mod error;
mod notifications;
mod request;
pub(crate) mod transport;

pub use auth::AuthApi;
pub(crate) use client::join_url;
pub use client::{check_status, ResilientApiClient};
pub use error::ApiError;
pub use notifications::NotificationsApi;
pub use request::ApiRequest;
pub use transport::{ApiResponse, HttpRequest, HttpTransport, ReqwestTransport, TransportError};
