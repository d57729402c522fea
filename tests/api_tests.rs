//! HTTP API tests driven through the full router with `tower::ServiceExt::oneshot`.

use axum::{
    Router,
    body::Body,
    http::{Method, Request, StatusCode},
};
use serde_json::{Value, json};
use tower::ServiceExt;
use url::Url;
use uuid::Uuid;

use integration_hub::server::create_app;

#[path = "test_utils/mod.rs"]
mod test_utils;

use test_utils::TEST_OPERATOR_TOKEN;

async fn app() -> Router {
    create_app(test_utils::test_state().await.unwrap())
}

fn request(method: Method, uri: &str, workspace: Uuid, body: Option<Value>) -> Request<Body> {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("Authorization", format!("Bearer {TEST_OPERATOR_TOKEN}"))
        .header("X-Workspace-Id", workspace.to_string())
        .header("X-User-Id", "user-42");
    match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).unwrap_or(Value::Null)
    };
    (status, json)
}

/// Connects `workspace` to the sandbox through the API and the callback route.
async fn connect_via_api(app: &Router, workspace: Uuid) {
    let (status, body) = send(
        app,
        request(
            Method::POST,
            "/connections/sandbox/connect",
            workspace,
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["provider"], "sandbox");

    let consent = Url::parse(body["authorization_url"].as_str().unwrap()).unwrap();
    let state = body["state"].as_str().unwrap();
    assert!(consent.query_pairs().any(|(k, v)| k == "state" && v == state));

    let callback = format!("{}?{}", consent.path(), consent.query().unwrap());
    let response = app
        .clone()
        .oneshot(Request::builder().uri(callback).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
}

#[tokio::test]
async fn protected_routes_require_operator_token() {
    let app = app().await;

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/connections")
                .header("X-Workspace-Id", Uuid::new_v4().to_string())
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(
        response.headers()["content-type"],
        "application/problem+json"
    );

    let (status, body) = send(
        &app,
        Request::builder()
            .uri("/providers")
            .header("Authorization", "Bearer wrong-token")
            .header("X-Workspace-Id", Uuid::new_v4().to_string())
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "UNAUTHORIZED");
}

#[tokio::test]
async fn workspace_header_is_required_and_validated() {
    let app = app().await;

    let (status, body) = send(
        &app,
        Request::builder()
            .uri("/connections")
            .header("Authorization", format!("Bearer {TEST_OPERATOR_TOKEN}"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "VALIDATION_FAILED");

    let (status, body) = send(
        &app,
        Request::builder()
            .uri("/connections")
            .header("Authorization", format!("Bearer {TEST_OPERATOR_TOKEN}"))
            .header("X-Workspace-Id", "not-a-uuid")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["details"]["X-Workspace-Id"], "Must be a valid UUID");
}

#[tokio::test]
async fn providers_are_listed_with_metadata() {
    let app = app().await;
    let workspace = Uuid::new_v4();

    let (status, body) = send(&app, request(Method::GET, "/providers", workspace, None)).await;
    assert_eq!(status, StatusCode::OK);
    let providers = body["providers"].as_array().unwrap();
    assert_eq!(providers.len(), 1);
    assert_eq!(providers[0]["slug"], "sandbox");

    let (status, body) = send(
        &app,
        request(Method::GET, "/providers/sandbox", workspace, None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["widgets"][0]["id"], "echo");

    let (status, body) = send(&app, request(Method::GET, "/providers/nope", workspace, None)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "NOT_FOUND");
}

#[tokio::test]
async fn connect_flow_creates_a_connection_without_exposing_tokens() {
    let app = app().await;
    let workspace = Uuid::new_v4();

    let (status, _) = send(
        &app,
        request(Method::GET, "/connections/sandbox", workspace, None),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    connect_via_api(&app, workspace).await;

    let (status, body) = send(&app, request(Method::GET, "/connections", workspace, None)).await;
    assert_eq!(status, StatusCode::OK);
    let connections = body["connections"].as_array().unwrap();
    assert_eq!(connections.len(), 1);
    assert_eq!(connections[0]["provider"], "sandbox");
    assert_eq!(connections[0]["status"], "connected");
    assert_eq!(connections[0]["connected_by"], "user-42");
    assert!(!body.to_string().contains("sandbox-access-"));
    assert!(!body.to_string().contains("sandbox-refresh-"));

    // Other workspaces see nothing
    let (_, body) = send(
        &app,
        request(Method::GET, "/connections", Uuid::new_v4(), None),
    )
    .await;
    assert!(body["connections"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn connect_rejects_malformed_body_and_unknown_provider() {
    let app = app().await;
    let workspace = Uuid::new_v4();

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method(Method::POST)
                .uri("/connections/sandbox/connect")
                .header("Authorization", format!("Bearer {TEST_OPERATOR_TOKEN}"))
                .header("X-Workspace-Id", workspace.to_string())
                .header("content-type", "application/json")
                .body(Body::from("{not json"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let (status, _) = send(
        &app,
        request(
            Method::POST,
            "/connections/nope/connect",
            workspace,
            Some(json!({ "scopes": ["read"] })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn widgets_config_and_webhook_settings() {
    let app = app().await;
    let workspace = Uuid::new_v4();
    connect_via_api(&app, workspace).await;

    let (status, body) = send(
        &app,
        request(
            Method::PUT,
            "/connections/sandbox/widgets",
            workspace,
            Some(json!({ "widgets": ["echo"] })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["enabled_widgets"], json!(["echo"]));

    let (status, _) = send(
        &app,
        request(
            Method::PUT,
            "/connections/sandbox/widgets",
            workspace,
            Some(json!({ "widgets": ["nonexistent"] })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = send(
        &app,
        request(
            Method::GET,
            "/connections/sandbox/widgets/echo?repo=hub",
            workspace,
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["widget_id"], "echo");
    assert_eq!(body["data"]["params"]["repo"], "hub");
    assert_eq!(body["cached"], false);

    let (_, body) = send(
        &app,
        request(
            Method::GET,
            "/connections/sandbox/widgets/echo",
            workspace,
            None,
        ),
    )
    .await;
    assert_eq!(body["cached"], true);

    let (status, body) = send(
        &app,
        request(
            Method::PUT,
            "/connections/sandbox/config",
            workspace,
            Some(json!([1, 2, 3])),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "VALIDATION_FAILED");

    let (status, body) = send(
        &app,
        request(
            Method::PUT,
            "/connections/sandbox/config",
            workspace,
            Some(json!({ "channel": "#alerts" })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["config"]["channel"], "#alerts");

    let (status, body) = send(
        &app,
        request(
            Method::PUT,
            "/connections/sandbox/webhook",
            workspace,
            Some(json!({ "webhook_id": "hook-9", "secret": "whsec" })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["webhook_id"], "hook-9");
    assert_eq!(body["webhook_configured"], true);
    assert!(!body.to_string().contains("whsec"));
}

#[tokio::test]
async fn test_sync_and_disconnect_actions() {
    let app = app().await;
    let workspace = Uuid::new_v4();
    connect_via_api(&app, workspace).await;

    let (status, body) = send(
        &app,
        request(Method::POST, "/connections/sandbox/test", workspace, None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["healthy"], true);
    assert_eq!(body["connection"]["status"], "connected");

    let (status, body) = send(
        &app,
        request(Method::POST, "/connections/sandbox/sync", workspace, None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["sync_status"], "synced");
    assert!(body["last_sync_at"].is_string());

    let (status, body) = send(
        &app,
        request(Method::POST, "/connections/sandbox/disconnect", workspace, None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "disconnected");

    let (status, _) = send(
        &app,
        request(Method::POST, "/connections/sandbox/sync", workspace, None),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(
        &app,
        request(
            Method::GET,
            "/connections/sandbox/widgets/echo",
            workspace,
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // Disconnect again is a no-op success
    let (status, _) = send(
        &app,
        request(Method::POST, "/connections/sandbox/disconnect", workspace, None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn openapi_document_is_served() {
    let app = app().await;
    let response = app
        .oneshot(
            Request::builder()
                .uri("/openapi.json")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let spec: Value = serde_json::from_slice(&body).unwrap();
    assert!(spec["paths"]["/connections/{provider}/connect"].is_object());
    assert!(spec["paths"]["/webhooks/{provider}"].is_object());
}
