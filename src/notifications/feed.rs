use super::events::SocketEvent;
use crate::types::{NotificationEvent, NotificationId};
use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard};

/// Local mirror of the inbox, newest first. Loaded over REST and kept current
/// from socket pushes.
#[derive(Debug, Default)]
pub struct NotificationFeed {
    items: Mutex<Vec<NotificationEvent>>,
}

impl NotificationFeed {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<NotificationEvent>> {
        self.items.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Replaces the contents with a REST listing, dropping repeated ids.
    pub fn replace(&self, list: Vec<NotificationEvent>) {
        let mut seen = HashSet::new();
        let deduped: Vec<_> = list
            .into_iter()
            .filter(|n| seen.insert(n.id.clone()))
            .collect();
        *self.lock() = deduped;
    }

    /// Folds a socket event into the feed. Returns whether anything changed.
    pub fn apply(&self, event: &SocketEvent) -> bool {
        match event {
            SocketEvent::Notification(notification) => {
                let mut items = self.lock();
                if items.iter().any(|n| n.id == notification.id) {
                    return false;
                }
                items.insert(0, notification.clone());
                true
            }
            SocketEvent::MarkAsReadResponse {
                notification_id,
                success: true,
            } => self.mark_read_locally(notification_id),
            _ => false,
        }
    }

    pub fn mark_read_locally(&self, id: &NotificationId) -> bool {
        let mut items = self.lock();
        match items.iter_mut().find(|n| &n.id == id) {
            Some(n) if !n.is_read => {
                n.is_read = true;
                true
            }
            _ => false,
        }
    }

    pub fn mark_all_read_locally(&self) -> usize {
        let mut flipped = 0;
        for n in self.lock().iter_mut().filter(|n| !n.is_read) {
            n.is_read = true;
            flipped += 1;
        }
        flipped
    }

    pub fn unread_count(&self) -> usize {
        self.lock().iter().filter(|n| !n.is_read).count()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn snapshot(&self) -> Vec<NotificationEvent> {
        self.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RecordId;

    fn note(id: u64, is_read: bool) -> NotificationEvent {
        serde_json::from_value(serde_json::json!({
            "id": id,
            "message": format!("update {id}"),
            "type": "incident_update",
            "created_at": "2024-05-01T09:00:00Z",
            "is_read": is_read,
        }))
        .unwrap()
    }

    #[test]
    fn pushes_are_prepended_once() {
        let feed = NotificationFeed::new();
        feed.replace(vec![note(1, true), note(2, false), note(2, false)]);
        assert_eq!(feed.len(), 2);

        assert!(feed.apply(&SocketEvent::Notification(note(3, false))));
        assert!(!feed.apply(&SocketEvent::Notification(note(3, false))));

        let ids: Vec<_> = feed.snapshot().into_iter().map(|n| n.id).collect();
        assert_eq!(ids, vec![RecordId::Number(3), RecordId::Number(1), RecordId::Number(2)]);
        assert_eq!(feed.unread_count(), 2);
    }

    #[test]
    fn only_successful_acknowledgements_flip_read_state() {
        let feed = NotificationFeed::new();
        feed.replace(vec![note(7, false)]);

        assert!(!feed.apply(&SocketEvent::MarkAsReadResponse {
            notification_id: RecordId::Number(7),
            success: false,
        }));
        assert_eq!(feed.unread_count(), 1);

        assert!(feed.apply(&SocketEvent::MarkAsReadResponse {
            notification_id: RecordId::Number(7),
            success: true,
        }));
        assert_eq!(feed.unread_count(), 0);
        assert!(!feed.mark_read_locally(&RecordId::Number(7)));
    }

    #[test]
    fn mark_all_reports_how_many_changed() {
        let feed = NotificationFeed::new();
        feed.replace(vec![note(1, true), note(2, false), note(3, false)]);
        assert_eq!(feed.mark_all_read_locally(), 2);
        assert_eq!(feed.unread_count(), 0);
        assert!(!feed.apply(&SocketEvent::Pong));
    }
}
