//! Admin forum queries and mutations, plus the live feed of one discussion.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use parking_lot::Mutex;
use shared::{
    domain::{
        CommentId, DiscussionId, DiscussionPage, DiscussionStatus, DiscussionSummary, ForumStats,
        PostId, UserId,
    },
    protocol::{ClientEvent, CommentPayload, EventKind, PostPayload, ServerEvent},
};
use tokio::sync::watch;
use tracing::debug;

use crate::{
    api::ApiClient,
    dispatcher::{EventDispatcher, SubscriptionHandle},
    error::{ClientError, MutationError, QueryError},
    query::{QueryClient, QueryKey, QueryObserver, QueryOptions},
    rooms::RoomMembership,
};

pub mod keys {
    use shared::domain::{DiscussionId, DiscussionStatus};

    use crate::query::QueryKey;

    pub const LIST: &str = "adminForumList";
    pub const STATS: &str = "adminForumStats";
    pub const DISCUSSION: &str = "adminForumDiscussion";

    pub fn all_lists() -> QueryKey {
        QueryKey::new(LIST)
    }

    pub fn list(page: u32, status: Option<DiscussionStatus>) -> QueryKey {
        QueryKey::new(LIST)
            .with(page)
            .with(status.map_or("all", DiscussionStatus::as_str))
    }

    pub fn stats() -> QueryKey {
        QueryKey::new(STATS)
    }

    pub fn discussion(id: &DiscussionId) -> QueryKey {
        QueryKey::new(DISCUSSION).with(id)
    }
}

const DISCUSSIONS_PATH: &str = "admin/forum/discussions";
const STATS_PATH: &str = "admin/forum/stats";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscussionFilter {
    pub page: u32,
    pub status: Option<DiscussionStatus>,
}

impl Default for DiscussionFilter {
    fn default() -> Self {
        Self {
            page: 1,
            status: None,
        }
    }
}

impl DiscussionFilter {
    fn query_params(&self) -> Vec<(&'static str, String)> {
        let mut params = vec![("page", self.page.to_string())];
        if let Some(status) = self.status {
            params.push(("status", status.as_str().to_string()));
        }
        params
    }
}

/// Admin moderation screens: discussion list, stats and per-discussion
/// actions. Every successful action invalidates the list and the stats.
pub struct AdminForum {
    api: Arc<ApiClient>,
    queries: Arc<QueryClient>,
}

impl AdminForum {
    pub fn new(api: Arc<ApiClient>, queries: Arc<QueryClient>) -> Self {
        Self { api, queries }
    }

    fn options(&self) -> QueryOptions {
        self.queries.defaults().clone()
    }

    pub async fn list_discussions(
        &self,
        filter: DiscussionFilter,
    ) -> Result<Arc<DiscussionPage>, QueryError> {
        let api = Arc::clone(&self.api);
        let params = filter.query_params();
        self.queries
            .query(
                keys::list(filter.page, filter.status),
                move || {
                    let api = Arc::clone(&api);
                    let params = params.clone();
                    async move { api.get_json::<DiscussionPage>(DISCUSSIONS_PATH, &params).await }
                },
                self.options(),
            )
            .await
    }

    pub async fn forum_stats(&self) -> Result<Arc<ForumStats>, QueryError> {
        let api = Arc::clone(&self.api);
        self.queries
            .query(keys::stats(), move || fetch_stats(Arc::clone(&api)), self.options())
            .await
    }

    /// Stats for a mounted dashboard widget; refetched whenever a moderation
    /// action lands.
    pub fn observe_stats(&self) -> QueryObserver<ForumStats> {
        let api = Arc::clone(&self.api);
        self.queries
            .observe(keys::stats(), move || fetch_stats(Arc::clone(&api)), self.options())
    }

    pub async fn discussion(&self, id: &DiscussionId) -> Result<Arc<DiscussionSummary>, QueryError> {
        let api = Arc::clone(&self.api);
        let path = discussion_path(id, "");
        self.queries
            .query(
                keys::discussion(id),
                move || {
                    let api = Arc::clone(&api);
                    let path = path.clone();
                    async move { api.get_json::<DiscussionSummary>(&path, &[]).await }
                },
                self.options(),
            )
            .await
    }

    pub async fn toggle_pin(
        &self,
        id: &DiscussionId,
    ) -> Result<DiscussionSummary, MutationError<ClientError>> {
        self.moderate(id, "pin").await
    }

    pub async fn toggle_lock(
        &self,
        id: &DiscussionId,
    ) -> Result<DiscussionSummary, MutationError<ClientError>> {
        self.moderate(id, "lock").await
    }

    pub async fn delete_discussion(&self, id: &DiscussionId) -> Result<(), MutationError<ClientError>> {
        let path = discussion_path(id, "");
        self.queries
            .mutate(self.api.delete(&path), &invalidated_by_action(id))
            .await?;
        self.queries.remove(&keys::discussion(id));
        debug!(discussion_id = %id, "forum: discussion deleted");
        Ok(())
    }

    async fn moderate(
        &self,
        id: &DiscussionId,
        action: &str,
    ) -> Result<DiscussionSummary, MutationError<ClientError>> {
        let path = discussion_path(id, action);
        let updated = self
            .queries
            .mutate(
                self.api
                    .patch_json::<_, DiscussionSummary>(&path, &serde_json::json!({})),
                &invalidated_by_action(id),
            )
            .await?;
        debug!(discussion_id = %id, action, pinned = updated.is_pinned, status = updated.status.as_str(), "forum: moderation applied");
        Ok(updated)
    }
}

async fn fetch_stats(api: Arc<ApiClient>) -> Result<ForumStats, ClientError> {
    api.get_json(STATS_PATH, &[]).await
}

fn discussion_path(id: &DiscussionId, action: &str) -> String {
    if action.is_empty() {
        format!("{DISCUSSIONS_PATH}/{id}")
    } else {
        format!("{DISCUSSIONS_PATH}/{id}/{action}")
    }
}

fn invalidated_by_action(id: &DiscussionId) -> [QueryKey; 3] {
    [keys::all_lists(), keys::stats(), keys::discussion(id)]
}

/// The signed-in user, as shown to other participants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Viewer {
    pub user_id: UserId,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeedSnapshot {
    pub posts: Vec<PostPayload>,
    pub comments: Vec<CommentPayload>,
    pub comment_likes: HashMap<CommentId, u64>,
    /// Likes on the discussion itself, from `post:updated` without a post id.
    pub discussion_likes: Option<u64>,
    /// Other participants currently typing, by user id.
    pub typing: BTreeMap<UserId, String>,
}

impl FeedSnapshot {
    pub fn post(&self, post_id: &PostId) -> Option<&PostPayload> {
        self.posts.iter().find(|post| &post.post_id == post_id)
    }

    fn apply(&mut self, viewer: &UserId, event: &ServerEvent) -> bool {
        match event {
            ServerEvent::PostNew(post) => {
                if self.post(&post.post_id).is_some() {
                    return false;
                }
                self.posts.push(post.clone());
            }
            ServerEvent::PostUpdated { post_id, likes, .. } => match post_id {
                Some(post_id) => {
                    let Some(post) = self.posts.iter_mut().find(|post| &post.post_id == post_id) else {
                        return false;
                    };
                    post.likes = *likes;
                }
                None => self.discussion_likes = Some(*likes),
            },
            ServerEvent::CommentNew(comment) => {
                if let Some(post) = self.posts.iter_mut().find(|post| post.post_id == comment.post_id) {
                    post.comment_count += 1;
                }
                self.comments.push(comment.clone());
            }
            ServerEvent::CommentUpdated { comment_id, likes } => {
                if !self.comments.iter().any(|c| &c.comment_id == comment_id) {
                    return false;
                }
                self.comment_likes.insert(comment_id.clone(), *likes);
            }
            ServerEvent::TypingIndicator {
                user_id, user_name, ..
            } => {
                if user_id == viewer {
                    return false;
                }
                self.typing.insert(user_id.clone(), user_name.clone());
            }
            ServerEvent::StopTypingIndicator { user_id, .. } => {
                return self.typing.remove(user_id).is_some();
            }
            ServerEvent::NotificationNew(_) => return false,
        }
        true
    }
}

const FEED_EVENTS: [EventKind; 6] = [
    EventKind::PostNew,
    EventKind::PostUpdated,
    EventKind::CommentNew,
    EventKind::CommentUpdated,
    EventKind::TypingStarted,
    EventKind::TypingStopped,
];

/// Live view of one discussion. Opening it joins the discussion channel;
/// dropping it unsubscribes and leaves.
pub struct DiscussionFeed {
    discussion_id: DiscussionId,
    viewer: Viewer,
    rooms: Arc<RoomMembership>,
    dispatcher: Arc<EventDispatcher>,
    snapshot: Arc<Mutex<FeedSnapshot>>,
    handles: Vec<SubscriptionHandle>,
    updates: watch::Receiver<u64>,
}

impl DiscussionFeed {
    pub fn open(
        rooms: Arc<RoomMembership>,
        queries: Arc<QueryClient>,
        discussion_id: DiscussionId,
        viewer: Viewer,
    ) -> Self {
        let dispatcher = Arc::clone(rooms.connection().dispatcher());
        let snapshot = Arc::new(Mutex::new(FeedSnapshot::default()));
        let (version, updates) = watch::channel(0u64);
        let version = Arc::new(version);

        let handles = FEED_EVENTS
            .into_iter()
            .map(|kind| {
                let snapshot = Arc::clone(&snapshot);
                let version = Arc::clone(&version);
                let queries = Arc::clone(&queries);
                let discussion_id = discussion_id.clone();
                let viewer_id = viewer.user_id.clone();
                dispatcher.subscribe(kind, move |event| {
                    if !belongs_to(event, &discussion_id) {
                        return;
                    }
                    if !snapshot.lock().apply(&viewer_id, event) {
                        return;
                    }
                    if matches!(event, ServerEvent::PostNew(_) | ServerEvent::CommentNew(_)) {
                        queries.invalidate(&keys::discussion(&discussion_id));
                    }
                    version.send_modify(|v| *v += 1);
                })
            })
            .collect();

        rooms.join_discussion_channel(discussion_id.clone());
        debug!(discussion_id = %discussion_id, "forum: feed opened");
        Self {
            discussion_id,
            viewer,
            rooms,
            dispatcher,
            snapshot,
            handles,
            updates,
        }
    }

    pub fn discussion_id(&self) -> &DiscussionId {
        &self.discussion_id
    }

    pub fn snapshot(&self) -> FeedSnapshot {
        self.snapshot.lock().clone()
    }

    /// Waits for the next change to the feed.
    pub async fn changed(&mut self) -> bool {
        self.updates.changed().await.is_ok()
    }

    pub fn start_typing(&self) -> bool {
        self.rooms.connection().emit(ClientEvent::Typing {
            discussion_id: self.discussion_id.clone(),
            user_id: self.viewer.user_id.clone(),
            user_name: self.viewer.name.clone(),
        })
    }

    pub fn stop_typing(&self) -> bool {
        self.rooms.connection().emit(ClientEvent::StopTyping {
            discussion_id: self.discussion_id.clone(),
            user_id: self.viewer.user_id.clone(),
        })
    }

    pub fn mark_viewed(&self, post_id: PostId) -> bool {
        self.rooms.connection().emit(ClientEvent::PostView { post_id })
    }
}

impl Drop for DiscussionFeed {
    fn drop(&mut self) {
        for handle in self.handles.drain(..) {
            self.dispatcher.unsubscribe(handle);
        }
        self.rooms
            .leave_discussion_channel(self.discussion_id.clone());
        debug!(discussion_id = %self.discussion_id, "forum: feed closed");
    }
}

/// Typing indicators arrive on the discussion room and may omit the
/// discussion id; comment like updates never carry one.
fn belongs_to(event: &ServerEvent, discussion_id: &DiscussionId) -> bool {
    match event {
        ServerEvent::TypingIndicator { .. }
        | ServerEvent::StopTypingIndicator { .. }
        | ServerEvent::CommentUpdated { .. } => event
            .discussion_id()
            .map_or(true, |id| id == discussion_id),
        _ => event.discussion_id() == Some(discussion_id),
    }
}

#[cfg(test)]
#[path = "tests/forum_tests.rs"]
mod tests;
