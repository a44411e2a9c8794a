use super::*;
use std::time::Duration;
use crate::{
    connection::ConnectionState,
    dispatcher::EventDispatcher,
    test_support::{fast_settings, next_peer, wait_for_state, FakeConnector},
    transport::{TransportConnector, TransportKind},
};

fn membership_with(connector: Arc<FakeConnector>) -> (Arc<ConnectionManager>, Arc<RoomMembership>) {
    let connectors: Vec<Arc<dyn TransportConnector>> = vec![connector];
    let connection = ConnectionManager::new(
        fast_settings(3, vec![TransportKind::WebSocket]),
        connectors,
        EventDispatcher::new(),
    );
    let rooms = RoomMembership::new(Arc::clone(&connection));
    (connection, rooms)
}

#[tokio::test]
async fn join_emits_on_live_connection() {
    let (ws, mut peers) = FakeConnector::working(TransportKind::WebSocket);
    let (connection, rooms) = membership_with(ws);
    let mut state = connection.connect();
    wait_for_state(&mut state, ConnectionState::Connected).await;
    let mut peer = next_peer(&mut peers).await;

    assert!(rooms.join_discussion_channel(DiscussionId::new("d1")));
    assert_eq!(
        peer.next_client_event().await,
        ClientEvent::DiscussionJoin {
            discussion_id: DiscussionId::new("d1")
        }
    );

    assert!(rooms.leave_discussion_channel(DiscussionId::new("d1")));
    assert_eq!(
        peer.next_client_event().await,
        ClientEvent::DiscussionLeave {
            discussion_id: DiscussionId::new("d1")
        }
    );
    assert!(rooms.joined_rooms().is_empty());
    connection.disconnect().await;
}

#[tokio::test]
async fn joins_requested_offline_are_sent_once_connected() {
    let (ws, mut peers) = FakeConnector::working(TransportKind::WebSocket);
    let (connection, rooms) = membership_with(ws);

    assert!(!rooms.join_user_channel(UserId::new("u1")));
    assert!(!rooms.join_discussion_channel(DiscussionId::new("d1")));
    assert!(rooms.is_joined(&Room::User(UserId::new("u1"))));

    let mut state = connection.connect();
    wait_for_state(&mut state, ConnectionState::Connected).await;
    let mut peer = next_peer(&mut peers).await;

    assert_eq!(
        peer.next_client_event().await,
        ClientEvent::UserJoin {
            user_id: UserId::new("u1")
        }
    );
    assert_eq!(
        peer.next_client_event().await,
        ClientEvent::DiscussionJoin {
            discussion_id: DiscussionId::new("d1")
        }
    );
    connection.disconnect().await;
}

#[tokio::test]
async fn reconnect_replays_current_membership_only() {
    let (ws, mut peers) = FakeConnector::working(TransportKind::WebSocket);
    let (connection, rooms) = membership_with(ws);
    let mut state = connection.connect();
    wait_for_state(&mut state, ConnectionState::Connected).await;
    let mut first = next_peer(&mut peers).await;

    rooms.join_discussion_channel(DiscussionId::new("d1"));
    rooms.join_discussion_channel(DiscussionId::new("d2"));
    rooms.leave_discussion_channel(DiscussionId::new("d1"));
    for _ in 0..3 {
        first.next_client_event().await;
    }

    drop(first);
    let mut second = next_peer(&mut peers).await;
    assert_eq!(
        second.next_client_event().await,
        ClientEvent::DiscussionJoin {
            discussion_id: DiscussionId::new("d2")
        }
    );
    assert!(second.from_client.try_recv().is_err());
    assert_eq!(
        rooms.joined_rooms(),
        vec![Room::Discussion(DiscussionId::new("d2"))]
    );
    connection.disconnect().await;
}

#[test]
fn rooms_render_as_channel_names() {
    assert_eq!(Room::User(UserId::new("u1")).to_string(), "user:u1");
    assert_eq!(
        Room::Discussion(DiscussionId::new("d9")).to_string(),
        "discussion:d9"
    );
}

#[tokio::test]
async fn shared_room_is_left_only_after_last_joiner() {
    let (ws, mut peers) = FakeConnector::working(TransportKind::WebSocket);
    let (connection, rooms) = membership_with(ws);
    let mut state = connection.connect();
    wait_for_state(&mut state, ConnectionState::Connected).await;
    let mut peer = next_peer(&mut peers).await;
    let d1 = Room::Discussion(DiscussionId::new("d1"));

    rooms.join_discussion_channel(DiscussionId::new("d1"));
    rooms.join_discussion_channel(DiscussionId::new("d1"));
    peer.next_client_event().await;
    peer.next_client_event().await;
    assert_eq!(rooms.join_count(&d1), 2);

    assert!(!rooms.leave_discussion_channel(DiscussionId::new("d1")));
    assert!(rooms.is_joined(&d1));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(peer.from_client.try_recv().is_err());

    assert!(rooms.leave_discussion_channel(DiscussionId::new("d1")));
    assert_eq!(
        peer.next_client_event().await,
        ClientEvent::DiscussionLeave {
            discussion_id: DiscussionId::new("d1")
        }
    );
    assert!(!rooms.is_joined(&d1));
    assert_eq!(rooms.join_count(&d1), 0);
    connection.disconnect().await;
}
