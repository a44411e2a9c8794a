//! Realtime client core for the educator marketplace: one push connection,
//! room membership on top of it, typed event fan-out, and a query cache that
//! mutations and push events invalidate.

use std::sync::Arc;

use shared::domain::{DiscussionId, UserId};
use tokio::sync::watch;
use tracing::info;

pub mod api;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod forum;
pub mod notifications;
pub mod query;
pub mod rooms;
pub mod site_settings;
pub mod transport;

#[cfg(test)]
pub(crate) mod test_support;

pub use api::ApiClient;
pub use config::{load_settings, Settings};
pub use connection::{ConnectionManager, ConnectionSettings, ConnectionState, ReconnectConfig};
pub use dispatcher::{EventDispatcher, SubscriptionHandle};
pub use error::{ClientError, FetchError, MutationError, QueryError, TransportError};
pub use forum::{AdminForum, DiscussionFeed, DiscussionFilter, FeedSnapshot, Viewer};
pub use notifications::NotificationCenter;
pub use query::{EntryStatus, QueryClient, QueryKey, QueryObserver, QueryOptions, RetryPolicy};
pub use rooms::{Room, RoomMembership};
pub use site_settings::SiteSettingsStore;
pub use transport::{TransportConnector, TransportKind};

/// Application root: builds every component once and hands out the feature
/// views that share them.
pub struct RealtimeClient {
    settings: Settings,
    api: Arc<ApiClient>,
    connection: Arc<ConnectionManager>,
    rooms: Arc<RoomMembership>,
    queries: Arc<QueryClient>,
}

impl RealtimeClient {
    /// WebSocket and long-poll transports against the configured base URL.
    pub fn new(settings: Settings) -> Result<Arc<Self>, ClientError> {
        let http = reqwest::Client::new();
        let connection = ConnectionManager::with_default_transports(
            settings.connection_settings(),
            http.clone(),
            EventDispatcher::new(),
        );
        Self::assemble(settings, http, connection)
    }

    pub fn with_connectors(
        settings: Settings,
        connectors: Vec<Arc<dyn TransportConnector>>,
    ) -> Result<Arc<Self>, ClientError> {
        let connection = ConnectionManager::new(
            settings.connection_settings(),
            connectors,
            EventDispatcher::new(),
        );
        Self::assemble(settings, reqwest::Client::new(), connection)
    }

    pub fn from_env() -> Result<Arc<Self>, ClientError> {
        Self::new(load_settings())
    }

    fn assemble(
        settings: Settings,
        http: reqwest::Client,
        connection: Arc<ConnectionManager>,
    ) -> Result<Arc<Self>, ClientError> {
        let api = Arc::new(ApiClient::new(http, &settings.api_url())?);
        api.set_token(settings.auth_token.clone());
        let rooms = RoomMembership::new(Arc::clone(&connection));
        let queries = QueryClient::new(settings.query_defaults());
        info!(
            api_url = %api.base_url(),
            socket_url = settings.socket_base_url(),
            transports = ?settings.transports,
            "client: initialized"
        );
        Ok(Arc::new(Self {
            settings,
            api,
            connection,
            rooms,
            queries,
        }))
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn api(&self) -> &Arc<ApiClient> {
        &self.api
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    pub fn dispatcher(&self) -> &Arc<EventDispatcher> {
        self.connection.dispatcher()
    }

    pub fn rooms(&self) -> &Arc<RoomMembership> {
        &self.rooms
    }

    pub fn queries(&self) -> &Arc<QueryClient> {
        &self.queries
    }

    pub fn connect(&self) -> watch::Receiver<ConnectionState> {
        self.connection.connect()
    }

    pub async fn disconnect(&self) {
        self.connection.disconnect().await;
    }

    pub fn admin_forum(&self) -> AdminForum {
        AdminForum::new(Arc::clone(&self.api), Arc::clone(&self.queries))
    }

    pub fn site_settings(&self) -> SiteSettingsStore {
        SiteSettingsStore::new(Arc::clone(&self.api), Arc::clone(&self.queries))
    }

    pub fn notifications(&self, user_id: UserId) -> NotificationCenter {
        NotificationCenter::start(
            Arc::clone(&self.api),
            Arc::clone(&self.queries),
            &self.rooms,
            user_id,
        )
    }

    pub fn open_discussion(&self, discussion_id: DiscussionId, viewer: Viewer) -> DiscussionFeed {
        DiscussionFeed::open(
            Arc::clone(&self.rooms),
            Arc::clone(&self.queries),
            discussion_id,
            viewer,
        )
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
