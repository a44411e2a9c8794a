use std::{sync::Arc, time::Duration};

use shared::domain::SiteSettings;
use tracing::info;

use crate::{
    api::ApiClient,
    error::{ClientError, MutationError, QueryError},
    query::{QueryClient, QueryKey, QueryObserver, QueryOptions},
};

pub const SITE_SETTINGS_KEY: &str = "siteSettings";
pub const SITE_SETTINGS_STALE_TIME: Duration = Duration::from_secs(5 * 60);
const READ_PATH: &str = "settings/site";
const WRITE_PATH: &str = "admin/settings/site";

pub fn site_settings_key() -> QueryKey {
    QueryKey::new(SITE_SETTINGS_KEY)
}

/// Public site configuration, cached for five minutes.
pub struct SiteSettingsStore {
    api: Arc<ApiClient>,
    queries: Arc<QueryClient>,
}

impl SiteSettingsStore {
    pub fn new(api: Arc<ApiClient>, queries: Arc<QueryClient>) -> Self {
        Self { api, queries }
    }

    fn options(&self) -> QueryOptions {
        self.queries
            .defaults()
            .clone()
            .with_stale_time(SITE_SETTINGS_STALE_TIME)
    }

    pub async fn get(&self) -> Result<Arc<SiteSettings>, QueryError> {
        let api = Arc::clone(&self.api);
        self.queries
            .query(site_settings_key(), move || fetch(Arc::clone(&api)), self.options())
            .await
    }

    pub fn observe(&self) -> QueryObserver<SiteSettings> {
        let api = Arc::clone(&self.api);
        self.queries
            .observe(site_settings_key(), move || fetch(Arc::clone(&api)), self.options())
    }

    pub async fn update(
        &self,
        settings: &SiteSettings,
    ) -> Result<SiteSettings, MutationError<ClientError>> {
        let saved = self
            .queries
            .mutate(
                self.api.patch_json::<_, SiteSettings>(WRITE_PATH, settings),
                &[site_settings_key()],
            )
            .await?;
        info!(
            site_name = %saved.site_name,
            maintenance_mode = saved.maintenance_mode,
            "site settings: updated"
        );
        Ok(saved)
    }
}

async fn fetch(api: Arc<ApiClient>) -> Result<SiteSettings, ClientError> {
    api.get_json(READ_PATH, &[]).await
}

#[cfg(test)]
#[path = "tests/site_settings_tests.rs"]
mod tests;
