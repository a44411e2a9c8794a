use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{AuthorSummary, CommentId, DiscussionId, NotificationId, PostId, UserId};

/// Messages the client emits on the socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientEvent {
    #[serde(rename = "user:join", rename_all = "camelCase")]
    UserJoin { user_id: UserId },
    #[serde(rename = "discussion:join", rename_all = "camelCase")]
    DiscussionJoin { discussion_id: DiscussionId },
    #[serde(rename = "discussion:leave", rename_all = "camelCase")]
    DiscussionLeave { discussion_id: DiscussionId },
    #[serde(rename = "user:typing", rename_all = "camelCase")]
    Typing {
        discussion_id: DiscussionId,
        user_id: UserId,
        user_name: String,
    },
    #[serde(rename = "user:stop-typing", rename_all = "camelCase")]
    StopTyping {
        discussion_id: DiscussionId,
        user_id: UserId,
    },
    #[serde(rename = "post:view", rename_all = "camelCase")]
    PostView { post_id: PostId },
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::UserJoin { .. } => "user:join",
            ClientEvent::DiscussionJoin { .. } => "discussion:join",
            ClientEvent::DiscussionLeave { .. } => "discussion:leave",
            ClientEvent::Typing { .. } => "user:typing",
            ClientEvent::StopTyping { .. } => "user:stop-typing",
            ClientEvent::PostView { .. } => "post:view",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostPayload {
    pub post_id: PostId,
    pub discussion_id: DiscussionId,
    pub author: AuthorSummary,
    pub content: String,
    #[serde(default)]
    pub likes: u64,
    #[serde(default)]
    pub comment_count: u64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommentPayload {
    pub comment_id: CommentId,
    pub post_id: PostId,
    pub discussion_id: DiscussionId,
    pub author: AuthorSummary,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationPayload {
    pub notification_id: NotificationId,
    #[serde(rename = "type")]
    pub kind: String,
    pub title: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Messages the server pushes to the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    #[serde(rename = "post:new")]
    PostNew(PostPayload),
    #[serde(rename = "post:updated", rename_all = "camelCase")]
    PostUpdated {
        discussion_id: DiscussionId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        post_id: Option<PostId>,
        likes: u64,
    },
    #[serde(rename = "comment:new")]
    CommentNew(CommentPayload),
    #[serde(rename = "comment:updated", rename_all = "camelCase")]
    CommentUpdated { comment_id: CommentId, likes: u64 },
    #[serde(rename = "notification:new")]
    NotificationNew(NotificationPayload),
    #[serde(rename = "user:typing:indicator", rename_all = "camelCase")]
    TypingIndicator {
        user_id: UserId,
        user_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        discussion_id: Option<DiscussionId>,
    },
    #[serde(rename = "user:stop-typing:indicator", rename_all = "camelCase")]
    StopTypingIndicator {
        user_id: UserId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        discussion_id: Option<DiscussionId>,
    },
}

/// Discriminant of [`ServerEvent`], used as the subscription key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    PostNew,
    PostUpdated,
    CommentNew,
    CommentUpdated,
    NotificationNew,
    TypingStarted,
    TypingStopped,
}

impl EventKind {
    pub const ALL: [EventKind; 7] = [
        EventKind::PostNew,
        EventKind::PostUpdated,
        EventKind::CommentNew,
        EventKind::CommentUpdated,
        EventKind::NotificationNew,
        EventKind::TypingStarted,
        EventKind::TypingStopped,
    ];

    pub fn name(self) -> &'static str {
        match self {
            EventKind::PostNew => "post:new",
            EventKind::PostUpdated => "post:updated",
            EventKind::CommentNew => "comment:new",
            EventKind::CommentUpdated => "comment:updated",
            EventKind::NotificationNew => "notification:new",
            EventKind::TypingStarted => "user:typing:indicator",
            EventKind::TypingStopped => "user:stop-typing:indicator",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }
}

impl ServerEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ServerEvent::PostNew(_) => EventKind::PostNew,
            ServerEvent::PostUpdated { .. } => EventKind::PostUpdated,
            ServerEvent::CommentNew(_) => EventKind::CommentNew,
            ServerEvent::CommentUpdated { .. } => EventKind::CommentUpdated,
            ServerEvent::NotificationNew(_) => EventKind::NotificationNew,
            ServerEvent::TypingIndicator { .. } => EventKind::TypingStarted,
            ServerEvent::StopTypingIndicator { .. } => EventKind::TypingStopped,
        }
    }

    /// The discussion this event is scoped to, when the payload names one.
    pub fn discussion_id(&self) -> Option<&DiscussionId> {
        match self {
            ServerEvent::PostNew(post) => Some(&post.discussion_id),
            ServerEvent::PostUpdated { discussion_id, .. } => Some(discussion_id),
            ServerEvent::CommentNew(comment) => Some(&comment.discussion_id),
            ServerEvent::TypingIndicator { discussion_id, .. }
            | ServerEvent::StopTypingIndicator { discussion_id, .. } => discussion_id.as_ref(),
            ServerEvent::CommentUpdated { .. } | ServerEvent::NotificationNew(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_event_uses_socket_event_names() {
        let event = ClientEvent::DiscussionJoin {
            discussion_id: DiscussionId::new("d1"),
        };
        let json = serde_json::to_value(&event).expect("serialize");
        assert_eq!(
            json,
            serde_json::json!({"event": "discussion:join", "data": {"discussionId": "d1"}})
        );
        assert_eq!(event.name(), "discussion:join");
    }

    #[test]
    fn parses_post_updated_counter_event() {
        let raw = r#"{"event":"post:updated","data":{"discussionId":"d1","likes":4}}"#;
        let event: ServerEvent = serde_json::from_str(raw).expect("parse");
        assert_eq!(event.kind(), EventKind::PostUpdated);
        assert_eq!(event.discussion_id(), Some(&DiscussionId::new("d1")));
        match event {
            ServerEvent::PostUpdated { likes, post_id, .. } => {
                assert_eq!(likes, 4);
                assert!(post_id.is_none());
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn parses_typing_indicator_without_discussion() {
        let raw = r#"{"event":"user:typing:indicator","data":{"userId":"u7","userName":"Ada"}}"#;
        let event: ServerEvent = serde_json::from_str(raw).expect("parse");
        assert_eq!(event.kind(), EventKind::TypingStarted);
        assert!(event.discussion_id().is_none());
    }

    #[test]
    fn unknown_event_name_is_rejected() {
        let raw = r#"{"event":"chat:new","data":{}}"#;
        assert!(serde_json::from_str::<ServerEvent>(raw).is_err());
        assert_eq!(EventKind::from_name("chat:new"), None);
        assert_eq!(
            EventKind::from_name("comment:updated"),
            Some(EventKind::CommentUpdated)
        );
    }
}
