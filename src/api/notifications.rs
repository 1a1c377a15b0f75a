use super::client::{check_status, ResilientApiClient};
use super::error::ApiError;
use super::request::ApiRequest;
use crate::config::PATH_NOTIFICATIONS;
use crate::types::{NotificationEvent, NotificationId};
use serde::Deserialize;

#[derive(Deserialize)]
#[serde(untagged)]
enum NotificationPage {
    List(Vec<NotificationEvent>),
    Paged { results: Vec<NotificationEvent> },
}

#[derive(Deserialize)]
struct UnreadCount {
    #[serde(alias = "unread_count")]
    count: u64,
}

/// REST side of notifications, used on first load and whenever the socket is down.
pub struct NotificationsApi<'a> {
    client: &'a ResilientApiClient,
}

impl ResilientApiClient {
    pub fn notifications(&self) -> NotificationsApi<'_> {
        NotificationsApi { client: self }
    }
}

fn item_path(id: &NotificationId, action: &str) -> String {
    format!(
        "{PATH_NOTIFICATIONS}{}/{action}/",
        urlencoding::encode(&id.to_string())
    )
}

impl NotificationsApi<'_> {
    pub async fn list(&self) -> Result<Vec<NotificationEvent>, ApiError> {
        let page: NotificationPage = self.client.get_json(PATH_NOTIFICATIONS).await?;
        Ok(match page {
            NotificationPage::List(items) => items,
            NotificationPage::Paged { results } => results,
        })
    }

    pub async fn mark_as_read(&self, id: &NotificationId) -> Result<(), ApiError> {
        let request = ApiRequest::post(item_path(id, "mark_as_read"));
        check_status(self.client.request(request).await?)?;
        Ok(())
    }

    pub async fn mark_all_as_read(&self) -> Result<(), ApiError> {
        let request = ApiRequest::post(format!("{PATH_NOTIFICATIONS}mark_all_as_read/"));
        check_status(self.client.request(request).await?)?;
        Ok(())
    }

    pub async fn unread_count(&self) -> Result<u64, ApiError> {
        let count: UnreadCount = self
            .client
            .get_json(&format!("{PATH_NOTIFICATIONS}unread_count/"))
            .await?;
        Ok(count.count)
    }
}
