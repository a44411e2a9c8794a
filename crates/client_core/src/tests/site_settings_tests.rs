use super::*;
use std::sync::atomic::{AtomicUsize, Ordering};

use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, patch},
    Json, Router,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::net::TcpListener;

#[derive(Clone)]
struct SettingsServer {
    fetches: Arc<AtomicUsize>,
    current: Arc<Mutex<SiteSettings>>,
}

async fn read(State(server): State<SettingsServer>) -> Json<SiteSettings> {
    server.fetches.fetch_add(1, Ordering::SeqCst);
    Json(server.current.lock().clone())
}

async fn write(
    State(server): State<SettingsServer>,
    Json(update): Json<SiteSettings>,
) -> Result<Json<SiteSettings>, (StatusCode, Json<Value>)> {
    if update.site_name.trim().is_empty() {
        return Err((
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({ "code": "validation", "message": "siteName is required" })),
        ));
    }
    *server.current.lock() = update.clone();
    Ok(Json(update))
}

fn initial() -> SiteSettings {
    SiteSettings {
        site_name: "Teach Connect".to_string(),
        support_email: Some("help@example.com".to_string()),
        maintenance_mode: false,
        allow_registrations: true,
    }
}

async fn spawn_settings_server() -> anyhow::Result<(String, SettingsServer)> {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let server = SettingsServer {
        fetches: Arc::new(AtomicUsize::new(0)),
        current: Arc::new(Mutex::new(initial())),
    };
    let app = Router::new()
        .route("/api/settings/site", get(read))
        .route("/api/admin/settings/site", patch(write))
        .with_state(server.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok((format!("http://{addr}/api"), server))
}

fn store(base: &str) -> (SiteSettingsStore, Arc<QueryClient>) {
    let api = Arc::new(ApiClient::new(reqwest::Client::new(), base).expect("api"));
    let queries = QueryClient::new(QueryOptions::default());
    (SiteSettingsStore::new(api, Arc::clone(&queries)), queries)
}

#[tokio::test]
async fn repeated_reads_within_five_minutes_hit_cache() {
    let (base, server) = spawn_settings_server().await.expect("spawn server");
    let (settings, queries) = store(&base);

    let first = settings.get().await.expect("first");
    let second = settings.get().await.expect("second");

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(server.fetches.load(Ordering::SeqCst), 1);
    assert!(!queries.entry_status(&site_settings_key()).expect("entry").is_stale);
}

#[tokio::test]
async fn update_invalidates_and_next_read_sees_server_state() {
    let (base, server) = spawn_settings_server().await.expect("spawn server");
    let (settings, _queries) = store(&base);
    settings.get().await.expect("seed");

    let mut changed = initial();
    changed.maintenance_mode = true;
    let saved = settings.update(&changed).await.expect("update");
    assert!(saved.maintenance_mode);

    let reread = settings.get().await.expect("reread");
    assert!(reread.maintenance_mode);
    assert_eq!(server.fetches.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn rejected_update_keeps_cached_settings() {
    let (base, server) = spawn_settings_server().await.expect("spawn server");
    let (settings, queries) = store(&base);
    settings.get().await.expect("seed");

    let mut invalid = initial();
    invalid.site_name = "  ".to_string();
    let err = settings.update(&invalid).await.expect_err("validation");
    assert!(matches!(err.into_inner(), ClientError::Api(api) if api.status == 422));

    assert!(!queries.entry_status(&site_settings_key()).expect("entry").is_stale);
    assert_eq!(settings.get().await.expect("cached").site_name, "Teach Connect");
    assert_eq!(server.fetches.load(Ordering::SeqCst), 1);
}
