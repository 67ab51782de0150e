//! HTTP surface tests
//!
//! NIST 800-53: AC-3 (Access Enforcement), IA-2 (Identification and Authentication),
//! SI-11 (Error Handling)
//! Implementation: Requests driven through the router without a listener

use archive_gate::audit::AuditLog;
use archive_gate::config::{Config, DirectoryKind, StaticUser};
use archive_gate::{ArchiveGateway, StaticDirectory};
use archive_gate_http::HttpServer;
use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode, header};
use serde_json::{Value, json};
use std::fs;
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;

const BOUNDARY: &str = "archive-gate-test-boundary";

fn user(identity: &str, secret: &str, group: &str) -> StaticUser {
    StaticUser {
        identity: identity.to_string(),
        secret_sha256: StaticDirectory::digest(secret),
        display_name: identity.to_string(),
        email: format!("{identity}@example.org"),
        department: "records".to_string(),
        groups: vec![group.to_string()],
    }
}

/// Helper to build a router over a populated archive root
fn create_app() -> (TempDir, Router) {
    let root = TempDir::new().unwrap();
    fs::create_dir_all(root.path().join("dumps")).unwrap();
    fs::create_dir_all(root.path().join("incoming")).unwrap();
    fs::write(root.path().join("dumps/orders.sql"), "insert into orders;\n").unwrap();
    fs::write(root.path().join("dumps/run.log"), "ERROR one\nok\nerror two\n").unwrap();

    let mut config = Config::default();
    config.sandbox.allowed_paths = vec![root.path().to_path_buf()];
    config.directory.kind = DirectoryKind::Static;
    config.directory.users = vec![
        user("alice", "reader-pass", "archive-users"),
        user("olga", "operator-pass", "archive-operators"),
    ];
    config.session.secret = Some("http-test-secret-0123456789abcdef!!".to_string());
    config.upload.enabled = true;
    config.upload.directory = Some(root.path().join("incoming"));

    let directory = Arc::new(StaticDirectory::new(&config.directory.users));
    let audit = Arc::new(AuditLog::new().with_memory(100));
    let gateway = Arc::new(ArchiveGateway::with_directory(&config, directory, audit).unwrap());
    let router = HttpServer::new(gateway, &config).create_router();
    (root, router)
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, body.to_vec())
}

async fn send_json(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let (status, body) = send(app, request).await;
    (status, serde_json::from_slice(&body).unwrap())
}

fn login_request(identity: &str, secret: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/auth/login")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(
            json!({ "identity": identity, "secret": secret }).to_string(),
        ))
        .unwrap()
}

async fn token_for(app: &Router, identity: &str, secret: &str) -> String {
    let (status, body) = send_json(app, login_request(identity, secret)).await;
    assert_eq!(status, StatusCode::OK);
    body["token"].as_str().unwrap().to_string()
}

fn get(uri: &str, token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method("GET").uri(uri);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    builder.body(Body::empty()).unwrap()
}

/// NIST 800-53: IA-2 - Login returns a token and permissions
#[tokio::test]
async fn test_login_ok() {
    let (_root, app) = create_app();

    let (status, body) = send_json(&app, login_request("alice", "reader-pass")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["identity"], "alice");
    assert_eq!(body["expiresInSeconds"], 1800);
    assert!(body["token"].as_str().unwrap().split('.').count() == 3);
    assert_eq!(body["permissions"], json!(["content-search", "download", "search"]));
}

/// NIST 800-53: SI-11 - Bad credentials get a coded, generic error body
#[tokio::test]
async fn test_login_rejected() {
    let (_root, app) = create_app();

    let (status, body) = send_json(&app, login_request("alice", "wrong")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["errorCode"], "AUTHENTICATION_FAILED");
    assert_eq!(body["message"], "Invalid credentials");
    assert_eq!(body["path"], "/auth/login");
    assert!(body.get("details").is_none());
}

/// NIST 800-53: AC-7 - Lockout responses carry the remaining seconds
#[tokio::test]
async fn test_login_lockout_details() {
    let (_root, app) = create_app();

    for _ in 0..5 {
        send(&app, login_request("alice", "wrong")).await;
    }
    let (status, body) = send_json(&app, login_request("alice", "reader-pass")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["errorCode"], "ACCOUNT_LOCKED");
    let remaining = body["details"]["remainingSeconds"].as_u64().unwrap();
    assert!(remaining > 0 && remaining <= 15 * 60);
}

/// NIST 800-53: SI-10 - Malformed login bodies are bad requests
#[tokio::test]
async fn test_login_malformed_body() {
    let (_root, app) = create_app();

    let request = Request::builder()
        .method("POST")
        .uri("/auth/login")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let (status, body) = send_json(&app, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["errorCode"], "INVALID_PARAMETER");
}

/// NIST 800-53: IA-2 - Validation always answers 200
#[tokio::test]
async fn test_validate() {
    let (_root, app) = create_app();

    let (status, body) = send_json(&app, get("/auth/validate", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["valid"], false);

    let (status, body) = send_json(&app, get("/auth/validate", Some("a.b.c"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["valid"], false);

    let token = token_for(&app, "alice", "reader-pass").await;
    let (status, body) = send_json(&app, get("/auth/validate", Some(&token))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["valid"], true);
    assert_eq!(body["identity"], "alice");
    assert!(body["remainingSeconds"].as_i64().unwrap() > 0);
}

/// NIST 800-53: AC-3 - File search with a token
#[tokio::test]
async fn test_search() {
    let (root, app) = create_app();
    let token = token_for(&app, "alice", "reader-pass").await;

    let uri = format!(
        "/archive/search?path={}&pattern=*.sql",
        root.path().join("dumps").display()
    );
    let (status, body) = send_json(&app, get(&uri, Some(&token))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["totalCount"], 1);
    assert_eq!(body["truncated"], false);
    assert_eq!(body["searchPattern"], "*.sql");
    assert_eq!(body["files"][0]["relativePath"], "orders.sql");
    assert_eq!(body["files"][0]["kind"], "FILE");
}

/// NIST 800-53: IA-2 - Archive endpoints reject missing tokens
#[tokio::test]
async fn test_search_without_token() {
    let (root, app) = create_app();

    let uri = format!(
        "/archive/search?path={}&pattern=*",
        root.path().join("dumps").display()
    );
    let (status, body) = send_json(&app, get(&uri, None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["errorCode"], "TOKEN_INVALID");

    let (status, _) = send_json(&app, get("/archive/status", None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

/// NIST 800-53: SI-10 - Missing query parameters are bad requests
#[tokio::test]
async fn test_search_missing_parameters() {
    let (_root, app) = create_app();
    let token = token_for(&app, "alice", "reader-pass").await;

    let (status, body) = send_json(&app, get("/archive/search?pattern=*", Some(&token))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["errorCode"], "INVALID_PARAMETER");
}

/// NIST 800-53: AC-3 - Downloads stream with attachment headers
#[tokio::test]
async fn test_download_headers() {
    let (root, app) = create_app();
    let token = token_for(&app, "alice", "reader-pass").await;

    let uri = format!(
        "/archive/download?filePath={}",
        root.path().join("dumps/orders.sql").display()
    );
    let response = app.clone().oneshot(get(&uri, Some(&token))).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let headers = response.headers();
    assert_eq!(headers[header::CONTENT_LENGTH], "20");
    assert_eq!(
        headers[header::CONTENT_DISPOSITION],
        "attachment; filename=\"orders.sql\""
    );
    assert!(headers[header::CONTENT_TYPE]
        .to_str()
        .unwrap()
        .starts_with("text/plain"));

    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&body[..], b"insert into orders;\n");
}

/// NIST 800-53: SI-11 - Missing files are 404
#[tokio::test]
async fn test_download_missing() {
    let (root, app) = create_app();
    let token = token_for(&app, "alice", "reader-pass").await;

    let uri = format!(
        "/archive/download?filePath={}",
        root.path().join("dumps/gone.sql").display()
    );
    let (status, body) = send_json(&app, get(&uri, Some(&token))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["errorCode"], "NOT_FOUND");
    assert_eq!(body["path"], "/archive/download");
}

/// NIST 800-53: AC-3 - Traversal is 403 without echoing the rule
#[tokio::test]
async fn test_download_traversal() {
    let (root, app) = create_app();
    let token = token_for(&app, "alice", "reader-pass").await;

    let uri = format!(
        "/archive/download?filePath={}/dumps/../../../etc/passwd",
        root.path().display()
    );
    let (status, body) = send_json(&app, get(&uri, Some(&token))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["errorCode"], "SECURITY_VIOLATION");
    assert_eq!(body["message"], "Access to the requested path is not permitted");
}

/// NIST 800-53: SI-10 - Content search over JSON
#[tokio::test]
async fn test_content_search() {
    let (root, app) = create_app();
    let token = token_for(&app, "alice", "reader-pass").await;

    let request = Request::builder()
        .method("POST")
        .uri("/archive/content-search")
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
        .body(Body::from(
            json!({
                "filePath": root.path().join("dumps/run.log").display().to_string(),
                "searchTerm": "ERROR",
            })
            .to_string(),
        ))
        .unwrap();
    let (status, body) = send_json(&app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["totalMatches"], 2);
    assert_eq!(body["matches"][0]["lineNumber"], 1);
    assert_eq!(body["matches"][0]["columnStart"], 0);
    assert_eq!(body["matches"][0]["columnEnd"], 5);
    assert_eq!(body["matches"][1]["lineNumber"], 3);
}

fn multipart_upload(token: &str, file_name: &str, content: &str) -> Request<Body> {
    let body = format!(
        "--{BOUNDARY}\r\n\
         Content-Disposition: form-data; name=\"file\"; filename=\"{file_name}\"\r\n\
         Content-Type: application/octet-stream\r\n\r\n\
         {content}\r\n\
         --{BOUNDARY}\r\n\
         Content-Disposition: form-data; name=\"description\"\r\n\r\n\
         weekly export\r\n\
         --{BOUNDARY}--\r\n"
    );
    Request::builder()
        .method("POST")
        .uri("/archive/upload")
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
        .body(Body::from(body))
        .unwrap()
}

/// NIST 800-53: AC-3 - Operators may upload, readers may not
#[tokio::test]
async fn test_upload_by_role() {
    let (root, app) = create_app();

    let reader = token_for(&app, "alice", "reader-pass").await;
    let (status, body) = send_json(&app, multipart_upload(&reader, "load.sql", "select 1;")).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["errorCode"], "ACCESS_DENIED");

    let operator = token_for(&app, "olga", "operator-pass").await;
    let (status, body) =
        send_json(&app, multipart_upload(&operator, "load.sql", "select 1;")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["fileName"], "load.sql");
    assert_eq!(body["fileSize"], 9);
    assert_eq!(body["uploadedBy"], "olga");
    assert_eq!(
        fs::read_to_string(root.path().join("incoming/load.sql")).unwrap(),
        "select 1;"
    );
}

/// NIST 800-53: AC-12 - Logout answers 200 and reports token state
#[tokio::test]
async fn test_logout() {
    let (_root, app) = create_app();
    let token = token_for(&app, "alice", "reader-pass").await;

    let request = Request::builder()
        .method("POST")
        .uri("/auth/logout")
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
        .body(Body::empty())
        .unwrap();
    let (status, body) = send_json(&app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
}

/// NIST 800-53: AU-2 - Status reports limits to authenticated callers
#[tokio::test]
async fn test_status() {
    let (_root, app) = create_app();
    let token = token_for(&app, "alice", "reader-pass").await;

    let (status, body) = send_json(&app, get("/archive/status", Some(&token))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["searchEnabled"], true);
    assert_eq!(body["uploadEnabled"], true);
    assert_eq!(body["maxSearchResults"], 1000);
    assert!(body["supportedArchiveTypes"].as_array().unwrap().len() >= 3);
}
