use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;
use shared::{
    domain::UserId,
    protocol::{EventKind, NotificationPayload, ServerEvent},
};
use tracing::info;

use crate::{
    api::ApiClient,
    dispatcher::{EventDispatcher, SubscriptionHandle},
    error::QueryError,
    query::{QueryClient, QueryKey},
    rooms::RoomMembership,
};

pub const NOTIFICATIONS_KEY: &str = "notifications";
const NOTIFICATIONS_PATH: &str = "notifications";
const RECENT_LIMIT: usize = 20;

pub fn notifications_key() -> QueryKey {
    QueryKey::new(NOTIFICATIONS_KEY)
}

#[derive(Default)]
struct Inbox {
    unread: AtomicU64,
    recent: Mutex<VecDeque<NotificationPayload>>,
}

/// Per-user notification channel. Each `notification:new` bumps the unread
/// counter and invalidates the cached notification list.
pub struct NotificationCenter {
    api: Arc<ApiClient>,
    queries: Arc<QueryClient>,
    dispatcher: Arc<EventDispatcher>,
    inbox: Arc<Inbox>,
    handle: Option<SubscriptionHandle>,
}

impl NotificationCenter {
    pub fn start(
        api: Arc<ApiClient>,
        queries: Arc<QueryClient>,
        rooms: &RoomMembership,
        user_id: UserId,
    ) -> Self {
        let dispatcher = Arc::clone(rooms.connection().dispatcher());
        let inbox = Arc::new(Inbox::default());
        let handle = {
            let inbox = Arc::clone(&inbox);
            let queries = Arc::clone(&queries);
            dispatcher.subscribe(EventKind::NotificationNew, move |event| {
                let ServerEvent::NotificationNew(notification) = event else {
                    return;
                };
                info!(
                    notification_id = %notification.notification_id,
                    kind = %notification.kind,
                    "notifications: received"
                );
                inbox.unread.fetch_add(1, Ordering::SeqCst);
                {
                    let mut recent = inbox.recent.lock();
                    recent.push_front(notification.clone());
                    recent.truncate(RECENT_LIMIT);
                }
                queries.invalidate(&notifications_key());
            })
        };
        rooms.join_user_channel(user_id);
        Self {
            api,
            queries,
            dispatcher,
            inbox,
            handle: Some(handle),
        }
    }

    pub fn unread_count(&self) -> u64 {
        self.inbox.unread.load(Ordering::SeqCst)
    }

    pub fn mark_all_read(&self) {
        self.inbox.unread.store(0, Ordering::SeqCst);
    }

    /// Notifications pushed since start, newest first.
    pub fn recent(&self) -> Vec<NotificationPayload> {
        self.inbox.recent.lock().iter().cloned().collect()
    }

    pub async fn list(&self) -> Result<Arc<Vec<NotificationPayload>>, QueryError> {
        let api = Arc::clone(&self.api);
        self.queries
            .query(
                notifications_key(),
                move || {
                    let api = Arc::clone(&api);
                    async move { api.get_json::<Vec<NotificationPayload>>(NOTIFICATIONS_PATH, &[]).await }
                },
                self.queries.defaults().clone(),
            )
            .await
    }
}

impl Drop for NotificationCenter {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.dispatcher.unsubscribe(handle);
        }
    }
}

#[cfg(test)]
#[path = "tests/notifications_tests.rs"]
mod tests;
