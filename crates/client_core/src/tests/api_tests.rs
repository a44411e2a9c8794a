use super::*;
use std::{collections::HashMap, sync::Arc};

use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    routing::{delete, get},
    Json, Router,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use shared::error::ErrorCode;
use tokio::net::TcpListener;

#[derive(Clone, Default)]
struct ServerState {
    seen_auth: Arc<Mutex<Vec<Option<String>>>>,
    seen_query: Arc<Mutex<Vec<HashMap<String, String>>>>,
    deleted: Arc<Mutex<u32>>,
}

async fn echo_stats(
    State(state): State<ServerState>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Json<Value> {
    let auth = headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    state.seen_auth.lock().push(auth);
    state.seen_query.lock().push(query);
    Json(json!({ "totalDiscussions": 4, "pinnedDiscussions": 1 }))
}

async fn forbidden() -> (StatusCode, Json<Value>) {
    (
        StatusCode::FORBIDDEN,
        Json(json!({ "code": "forbidden", "message": "Admins only" })),
    )
}

async fn broken() -> (StatusCode, &'static str) {
    (StatusCode::BAD_GATEWAY, "upstream unavailable")
}

async fn echo_body(Json(body): Json<Value>) -> Json<Value> {
    Json(json!({ "received": body }))
}

async fn remove(State(state): State<ServerState>) -> StatusCode {
    *state.deleted.lock() += 1;
    StatusCode::NO_CONTENT
}

async fn spawn_api_server() -> anyhow::Result<(String, ServerState)> {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let state = ServerState::default();
    let app = Router::new()
        .route("/api/stats", get(echo_stats))
        .route("/api/forbidden", get(forbidden))
        .route("/api/broken", get(broken))
        .route("/api/echo", axum::routing::post(echo_body).patch(echo_body))
        .route("/api/items/:id", delete(remove))
        .with_state(state.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok((format!("http://{addr}/api"), state))
}

#[test]
fn paths_resolve_under_the_api_prefix() {
    let api = ApiClient::new(Client::new(), "http://localhost:5000/api").expect("client");
    assert_eq!(
        api.url("/admin/forum/stats").expect("url").as_str(),
        "http://localhost:5000/api/admin/forum/stats"
    );
    assert_eq!(
        api.url("settings/site").expect("url").as_str(),
        "http://localhost:5000/api/settings/site"
    );
}

#[test]
fn malformed_base_url_is_rejected() {
    assert!(matches!(
        ApiClient::new(Client::new(), "not a url"),
        Err(ClientError::Url(_))
    ));
}

#[tokio::test]
async fn get_json_sends_query_and_bearer_token() {
    let (base, state) = spawn_api_server().await.expect("spawn server");
    let api = ApiClient::new(Client::new(), &base).expect("client");

    let _: Value = api.get_json("stats", &[]).await.expect("anonymous");
    api.set_token(Some("secret-token".to_string()));
    let body: Value = api
        .get_json("stats", &[("page", "2".to_string())])
        .await
        .expect("authorized");

    assert_eq!(body["totalDiscussions"], 4);
    assert_eq!(
        *state.seen_auth.lock(),
        vec![None, Some("Bearer secret-token".to_string())]
    );
    assert_eq!(state.seen_query.lock()[1].get("page").map(String::as_str), Some("2"));
}

#[tokio::test]
async fn error_body_maps_to_api_error() {
    let (base, _state) = spawn_api_server().await.expect("spawn server");
    let api = ApiClient::new(Client::new(), &base).expect("client");

    let err = api.get_json::<Value>("forbidden", &[]).await.expect_err("403");
    match err {
        ClientError::Api(api_err) => {
            assert_eq!(api_err.status, 403);
            assert_eq!(api_err.code, ErrorCode::Forbidden);
            assert_eq!(api_err.message, "Admins only");
        }
        other => panic!("unexpected error: {other:?}"),
    }

    let err = api.get_json::<Value>("broken", &[]).await.expect_err("502");
    assert!(err.is_transient());
    match err {
        ClientError::Api(api_err) => {
            assert_eq!(api_err.code, ErrorCode::Internal);
            assert_eq!(api_err.message, "upstream unavailable");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn post_patch_and_delete_round_trip() {
    let (base, state) = spawn_api_server().await.expect("spawn server");
    let api = ApiClient::new(Client::new(), &base).expect("client");

    let posted: Value = api
        .post_json("echo", &json!({ "siteName": "Edu" }))
        .await
        .expect("post");
    assert_eq!(posted["received"]["siteName"], "Edu");

    let patched: Value = api
        .patch_json("echo", &json!({ "isPinned": true }))
        .await
        .expect("patch");
    assert_eq!(patched["received"]["isPinned"], true);

    api.delete("items/d1").await.expect("delete");
    assert_eq!(*state.deleted.lock(), 1);
}
