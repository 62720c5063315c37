//! Spreadsheet client against a local stand-in for the token and Sheets APIs.

use axum::extract::{Path as UrlPath, Query, State};
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use study_chat_server::error::SheetsError;
use study_chat_server::sheets::{RowSink, ServiceAccountKey, SheetsClient};

const CREDS: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures/service_account.json");

#[derive(Default)]
struct MockGoogle {
    token_calls: AtomicUsize,
    appends: Mutex<Vec<(String, String, Value)>>,
    fail_appends: bool,
}

async fn token(State(mock): State<Arc<MockGoogle>>, Form(form): Form<HashMap<String, String>>) -> Json<Value> {
    assert_eq!(form["grant_type"], "urn:ietf:params:oauth:grant-type:jwt-bearer");
    assert_eq!(form["assertion"].split('.').count(), 3);
    let n = mock.token_calls.fetch_add(1, Ordering::SeqCst);
    Json(json!({ "access_token": format!("tok-{n}"), "expires_in": 3600, "token_type": "Bearer" }))
}

async fn meta(
    UrlPath(id): UrlPath<String>,
    Query(q): Query<HashMap<String, String>>,
) -> Json<Value> {
    assert_eq!(id, "sheet123");
    assert_eq!(q["fields"], "sheets.properties.title");
    Json(json!({ "sheets": [{ "properties": { "title": "conversations" } }] }))
}

async fn append(
    State(mock): State<Arc<MockGoogle>>,
    UrlPath((id, range)): UrlPath<(String, String)>,
    Query(q): Query<HashMap<String, String>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> (axum::http::StatusCode, Json<Value>) {
    if mock.fail_appends {
        return (axum::http::StatusCode::FORBIDDEN, Json(json!({"error": "no access"})));
    }
    assert_eq!(id, "sheet123");
    assert_eq!(q["valueInputOption"], "RAW");
    assert_eq!(q["insertDataOption"], "INSERT_ROWS");
    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    mock.appends.lock().unwrap().push((range, auth, body));
    (axum::http::StatusCode::OK, Json(json!({"updates": {"updatedRows": 1}})))
}

async fn spawn(mock: Arc<MockGoogle>) -> String {
    let app = Router::new()
        .route("/token", post(token))
        .route("/v4/spreadsheets/:id", get(meta))
        .route("/v4/spreadsheets/:id/values/:range", post(append))
        .with_state(mock);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}")
}

fn client(base: &str, worksheet: &str) -> SheetsClient {
    let key = ServiceAccountKey::from_file(Path::new(CREDS)).unwrap();
    SheetsClient::new(key, "sheet123", worksheet)
        .unwrap()
        .with_endpoints(format!("{base}/token"), base)
}

#[tokio::test]
async fn test_append_reuses_cached_token() {
    let mock = Arc::new(MockGoogle::default());
    let base = spawn(mock.clone()).await;
    let sheets = client(&base, "conversations");

    sheets
        .append_row(vec!["2026-10-17T09:30:00".into(), "P1".into(), "hello".into()])
        .await
        .unwrap();
    sheets.append_row(vec!["second".into()]).await.unwrap();

    assert_eq!(mock.token_calls.load(Ordering::SeqCst), 1);
    let appends = mock.appends.lock().unwrap();
    assert_eq!(appends.len(), 2);
    let (range, auth, body) = &appends[0];
    assert_eq!(range, "conversations:append");
    assert_eq!(auth, "Bearer tok-0");
    assert_eq!(body, &json!({"values": [["2026-10-17T09:30:00", "P1", "hello"]]}));
}

#[tokio::test]
async fn test_append_http_error_is_status() {
    let mock = Arc::new(MockGoogle {
        fail_appends: true,
        ..Default::default()
    });
    let base = spawn(mock).await;
    let err = client(&base, "conversations")
        .append_row(vec!["x".into()])
        .await
        .unwrap_err();
    assert!(matches!(err, SheetsError::Status { status: 403, .. }));
}

#[tokio::test]
async fn test_verify_checks_worksheet_exists() {
    let mock = Arc::new(MockGoogle::default());
    let base = spawn(mock).await;

    client(&base, "conversations").verify().await.unwrap();

    let err = client(&base, "other-tab").verify().await.unwrap_err();
    match err {
        SheetsError::Status { status, body } => {
            assert_eq!(status, 404);
            assert!(body.contains("other-tab"));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_unreachable_token_endpoint_is_token_error() {
    let key = ServiceAccountKey::from_file(Path::new(CREDS)).unwrap();
    let sheets = SheetsClient::new(key, "sheet123", "conversations")
        .unwrap()
        .with_endpoints("http://127.0.0.1:1/token", "http://127.0.0.1:1");
    let err = sheets.append_row(vec!["x".into()]).await.unwrap_err();
    assert!(matches!(err, SheetsError::Token(_)));
}
