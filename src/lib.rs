pub mod api;
mod app;
pub mod auth;
pub mod config;
pub mod notifications;
pub mod redact;
pub mod session;
#[cfg(test)]
pub(crate) mod testing;
pub mod types;

pub use session::{ReadPath, Session, SessionBuilder, SessionError};

pub async fn run() -> anyhow::Result<()> {
    app::run().await
}
