//! Fixtures shared by the unit tests.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use parking_lot::Mutex;
use shared::{
    domain::{AuthorSummary, DiscussionId, NotificationId, PostId, UserId},
    protocol::{ClientEvent, NotificationPayload, PostPayload, ServerEvent},
};
use tokio::sync::{mpsc, watch};

use crate::{
    connection::{ConnectionSettings, ConnectionState, ReconnectConfig},
    error::TransportError,
    transport::{Endpoint, TransportConnector, TransportKind, TransportSession},
};

pub fn post_event(discussion: &str, post: &str) -> ServerEvent {
    ServerEvent::PostNew(PostPayload {
        post_id: PostId::new(post),
        discussion_id: DiscussionId::new(discussion),
        author: AuthorSummary {
            user_id: UserId::new("author-1"),
            name: "Grace".to_string(),
            role: None,
        },
        content: format!("post {post}"),
        likes: 0,
        comment_count: 0,
        created_at: Utc.with_ymd_and_hms(2024, 3, 1, 9, 30, 0).unwrap(),
    })
}

pub fn notification_event(id: &str) -> ServerEvent {
    ServerEvent::NotificationNew(NotificationPayload {
        notification_id: NotificationId::new(id),
        kind: "application_update".to_string(),
        title: "Application update".to_string(),
        message: "Your application was viewed".to_string(),
        link: None,
        created_at: Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap(),
    })
}

pub fn fast_settings(max_attempts: u32, transports: Vec<TransportKind>) -> ConnectionSettings {
    ConnectionSettings {
        base_url: "http://127.0.0.1:9".to_string(),
        transports,
        reconnect: ReconnectConfig {
            max_attempts,
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
            backoff_multiplier: 1.0,
        },
    }
}

/// Server side of a session opened by [`FakeConnector`].
pub struct FakePeer {
    pub to_client: mpsc::UnboundedSender<ServerEvent>,
    pub from_client: mpsc::UnboundedReceiver<ClientEvent>,
}

impl FakePeer {
    pub async fn next_client_event(&mut self) -> ClientEvent {
        tokio::time::timeout(Duration::from_secs(5), self.from_client.recv())
            .await
            .expect("client event within timeout")
            .expect("client still connected")
    }
}

/// In-memory connector; each `open` either fails or hands a [`FakePeer`]
/// to the test through `peers`.
pub struct FakeConnector {
    kind: TransportKind,
    fail_first: Mutex<u32>,
    always_fail: bool,
    pub opens: Mutex<u32>,
    peers: mpsc::UnboundedSender<FakePeer>,
}

impl FakeConnector {
    pub fn working(kind: TransportKind) -> (Arc<Self>, mpsc::UnboundedReceiver<FakePeer>) {
        Self::build(kind, 0, false)
    }

    pub fn failing(kind: TransportKind) -> (Arc<Self>, mpsc::UnboundedReceiver<FakePeer>) {
        Self::build(kind, 0, true)
    }

    pub fn flaky(kind: TransportKind, fail_first: u32) -> (Arc<Self>, mpsc::UnboundedReceiver<FakePeer>) {
        Self::build(kind, fail_first, false)
    }

    fn build(
        kind: TransportKind,
        fail_first: u32,
        always_fail: bool,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<FakePeer>) {
        let (peers, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                kind,
                fail_first: Mutex::new(fail_first),
                always_fail,
                opens: Mutex::new(0),
                peers,
            }),
            rx,
        )
    }

    pub fn open_count(&self) -> u32 {
        *self.opens.lock()
    }
}

#[async_trait]
impl TransportConnector for FakeConnector {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    async fn open(&self, _endpoint: &Endpoint) -> Result<TransportSession, TransportError> {
        *self.opens.lock() += 1;
        let refuse = {
            let mut remaining = self.fail_first.lock();
            if *remaining > 0 {
                *remaining -= 1;
                true
            } else {
                self.always_fail
            }
        };
        if refuse {
            return Err(TransportError::Handshake {
                kind: self.kind,
                message: "connection refused".to_string(),
            });
        }

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let _ = self.peers.send(FakePeer {
            to_client: in_tx,
            from_client: out_rx,
        });
        Ok(TransportSession::new(self.kind, out_tx, in_rx))
    }
}

pub async fn wait_for_state(
    rx: &mut watch::Receiver<ConnectionState>,
    wanted: ConnectionState,
) {
    tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|state| *state == wanted))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {wanted:?}"))
        .expect("state channel open");
}

pub async fn next_peer(peers: &mut mpsc::UnboundedReceiver<FakePeer>) -> FakePeer {
    tokio::time::timeout(Duration::from_secs(5), peers.recv())
        .await
        .expect("peer within timeout")
        .expect("connector alive")
}
