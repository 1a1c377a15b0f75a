use crate::config::{ClientConfig, ENV_PASSWORD, ENV_USERNAME};
use crate::notifications::{EventKind, SocketEvent, Subscription};
use crate::redact::redact_secrets;
use crate::session::Session;
use anyhow::{bail, Context};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{info, warn};

pub async fn run() -> anyhow::Result<()> {
  let config = ClientConfig::load().context("failed to load configuration")?;
  info!(
    api = %config.api_base_url,
    ws = %redact_secrets(&config.ws_url),
    store = %config.store_path.display(),
    "starting incident-desk"
  );

  let stop = Arc::new(Notify::new());
  let signed_out = stop.clone();
  let session = Session::builder(config)
    .on_auth_failure(Arc::new(move |reason| {
      warn!(reason = %reason, "session ended; log in again");
      signed_out.notify_one();
    }))
    .build()
    .context("failed to set up the client session")?;

  if !session.is_authenticated() {
    login_from_env(&session).await?;
  }

  match session.sync_notifications().await {
    Ok(unread) => info!(
      total = session.feed().len(),
      unread,
      "notifications loaded"
    ),
    Err(e) => warn!(error = %e, "could not load notifications"),
  }

  let _log = log_events(&session);
  let exhausted = stop.clone();
  let _give_up = session.socket().on(EventKind::ReconnectExhausted, move |_| {
    exhausted.notify_one();
  });
  session
    .connect_notifications()
    .await
    .context("failed to open the notification socket")?;

  tokio::select! {
    res = tokio::signal::ctrl_c() => {
      res.context("failed to listen for ctrl-c")?;
      info!("interrupted; shutting down");
    }
    _ = stop.notified() => {
      warn!("notification socket gave up; shutting down");
    }
  }

  session.disconnect_notifications().await;
  Ok(())
}

async fn login_from_env(session: &Session) -> anyhow::Result<()> {
  let (Ok(username), Ok(password)) = (std::env::var(ENV_USERNAME), std::env::var(ENV_PASSWORD)) else {
    bail!("no stored session; set {ENV_USERNAME} and {ENV_PASSWORD} to log in");
  };
  let response = session
    .login(&username, &password)
    .await
    .context("login failed")?;
  let who = response
    .user
    .as_ref()
    .map(|u| u.display_name())
    .unwrap_or_else(|| username.trim().to_string());
  info!(user = %who, "logged in");
  Ok(())
}

fn log_events(session: &Session) -> Vec<Subscription> {
  EventKind::ALL
    .into_iter()
    .map(|kind| session.socket().on(kind, describe))
    .collect()
}

fn describe(event: &SocketEvent) {
  match event {
    SocketEvent::Notification(n) => info!(
      id = %n.id,
      kind = %n.kind,
      title = n.title.as_deref().unwrap_or(""),
      "{}",
      n.message
    ),
    SocketEvent::ConnectionEstablished { message, .. } => {
      info!(message = message.as_deref().unwrap_or(""), "server accepted the socket")
    }
    SocketEvent::MarkAsReadResponse {
      notification_id,
      success,
    } => info!(id = %notification_id, success, "read acknowledgement"),
    SocketEvent::Pong => tracing::debug!("pong"),
    SocketEvent::Connected => tracing::debug!("connected event"),
    SocketEvent::Disconnected { will_reconnect } => {
      warn!(will_reconnect, "notification socket dropped")
    }
    SocketEvent::ReconnectScheduled { attempt, delay } => info!(
      attempt,
      delay_ms = delay.as_millis() as u64,
      "reconnect scheduled"
    ),
    SocketEvent::ReconnectExhausted { attempts } => {
      warn!(attempts, "notification socket stopped reconnecting")
    }
  }
}
