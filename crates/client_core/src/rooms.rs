use std::{
    collections::{btree_map::Entry, BTreeMap},
    fmt,
    sync::Arc,
};

use parking_lot::Mutex;
use shared::{
    domain::{DiscussionId, UserId},
    protocol::ClientEvent,
};
use tracing::debug;

use crate::connection::ConnectionManager;

/// A server-side scope events are addressed to.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Room {
    User(UserId),
    Discussion(DiscussionId),
}

impl Room {
    fn join_event(&self) -> ClientEvent {
        match self {
            Room::User(user_id) => ClientEvent::UserJoin {
                user_id: user_id.clone(),
            },
            Room::Discussion(discussion_id) => ClientEvent::DiscussionJoin {
                discussion_id: discussion_id.clone(),
            },
        }
    }
}

impl fmt::Display for Room {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Room::User(user_id) => write!(f, "user:{user_id}"),
            Room::Discussion(discussion_id) => write!(f, "discussion:{discussion_id}"),
        }
    }
}

/// Channel membership on top of the connection.
///
/// Joins and leaves are fire-and-forget. The set of rooms the client wants
/// is kept here and re-sent in full on every successful connect, so a join
/// requested while offline takes effect once the connection comes up.
///
/// Each room is counted per join; the leave only goes out once every joiner
/// has left.
pub struct RoomMembership {
    connection: Arc<ConnectionManager>,
    desired: Arc<Mutex<BTreeMap<Room, usize>>>,
}

impl RoomMembership {
    pub fn new(connection: Arc<ConnectionManager>) -> Arc<Self> {
        let desired: Arc<Mutex<BTreeMap<Room, usize>>> = Arc::new(Mutex::new(BTreeMap::new()));
        let replay = Arc::clone(&desired);
        connection.on_connected(move |outbound| {
            let rooms: Vec<Room> = replay.lock().keys().cloned().collect();
            if !rooms.is_empty() {
                debug!(rooms = rooms.len(), "socket: rejoining rooms");
            }
            for room in rooms {
                let _ = outbound.send(room.join_event());
            }
        });
        Arc::new(Self {
            connection,
            desired,
        })
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    /// Returns whether the join went out immediately.
    pub fn join_user_channel(&self, user_id: UserId) -> bool {
        self.join(Room::User(user_id))
    }

    pub fn join_discussion_channel(&self, discussion_id: DiscussionId) -> bool {
        self.join(Room::Discussion(discussion_id))
    }

    /// Drops one join of the discussion. Returns whether a leave went out,
    /// which only happens once no other joiner remains.
    pub fn leave_discussion_channel(&self, discussion_id: DiscussionId) -> bool {
        let room = Room::Discussion(discussion_id.clone());
        {
            let mut desired = self.desired.lock();
            if let Entry::Occupied(mut joined) = desired.entry(room) {
                if *joined.get() > 1 {
                    *joined.get_mut() -= 1;
                    debug!(room = %joined.key(), remaining = *joined.get(), "socket: room still in use");
                    return false;
                }
                joined.remove();
            }
        }
        self.connection
            .emit(ClientEvent::DiscussionLeave { discussion_id })
    }

    pub fn is_joined(&self, room: &Room) -> bool {
        self.desired.lock().contains_key(room)
    }

    /// How many joiners currently hold `room`.
    pub fn join_count(&self, room: &Room) -> usize {
        self.desired.lock().get(room).copied().unwrap_or(0)
    }

    pub fn joined_rooms(&self) -> Vec<Room> {
        self.desired.lock().keys().cloned().collect()
    }

    fn join(&self, room: Room) -> bool {
        let event = room.join_event();
        *self.desired.lock().entry(room).or_insert(0) += 1;
        self.connection.emit(event)
    }
}

#[cfg(test)]
#[path = "tests/rooms_tests.rs"]
mod tests;
