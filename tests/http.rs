//! The HTTP client and the Onyx sink against throwaway axum servers.

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rs_onyx::config::{SinkConfig, SourceConfig};
use rs_onyx::document::{Document, DocumentBuilder};
use rs_onyx::error::BridgeError;
use rs_onyx::models::{parse_record, Customer, EntityKind};
use rs_onyx::sink::{DocumentSink, OnyxSink};
use rs_onyx::source::{BackoffPolicy, PageQuery, RepairShoprClient, SourceApi};

type Hits = Arc<AtomicUsize>;

async fn spawn(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        == Some("Bearer secret")
}

async fn customers(State(hits): State<Hits>, headers: HeaderMap) -> Response {
    if !authorized(&headers) {
        return (StatusCode::UNAUTHORIZED, "bad token").into_response();
    }
    if hits.fetch_add(1, Ordering::SeqCst) == 0 {
        return (StatusCode::TOO_MANY_REQUESTS, [(header::RETRY_AFTER, "0")], "slow down")
            .into_response();
    }
    Json(json!({
        "customers": [{"id": 1, "business_name": "Ace"}, {"id": 2, "firstname": "Bo"}],
        "meta": {"total_pages": 1, "total_entries": 2}
    }))
    .into_response()
}

async fn customer(Path(id): Path<i64>) -> Response {
    if id == 1 {
        Json(json!({"customer": {"id": 1, "business_name": "Ace"}})).into_response()
    } else {
        (StatusCode::NOT_FOUND, "no such customer").into_response()
    }
}

async fn comments(Path(_id): Path<i64>) -> Response {
    (StatusCode::NOT_FOUND, "").into_response()
}

async fn invoices(State(hits): State<Hits>) -> Response {
    hits.fetch_add(1, Ordering::SeqCst);
    (StatusCode::SERVICE_UNAVAILABLE, "maintenance").into_response()
}

async fn me(headers: HeaderMap) -> Response {
    if !authorized(&headers) {
        return (StatusCode::UNAUTHORIZED, "bad token").into_response();
    }
    Json(json!({"user_name": "Test Tech"})).into_response()
}

async fn repairshopr() -> (String, Hits) {
    let hits: Hits = Arc::new(AtomicUsize::new(0));
    let app = Router::new()
        .route("/api/v1/customers", get(customers))
        .route("/api/v1/customers/{id}", get(customer))
        .route("/api/v1/tickets/{id}/comments", get(comments))
        .route("/api/v1/invoices", get(invoices))
        .route("/api/v1/me", get(me))
        .with_state(hits.clone());
    (format!("{}/api/v1", spawn(app).await), hits)
}

fn client(base_url: &str, api_key: &str) -> RepairShoprClient {
    let config = SourceConfig {
        subdomain: "acme".into(),
        api_key: Some(api_key.into()),
        base_url: Some(base_url.into()),
        requests_per_minute: 6000,
        max_retries: 2,
        ..SourceConfig::default()
    };
    RepairShoprClient::new(&config)
        .unwrap()
        .with_backoff(BackoffPolicy {
            initial: Duration::from_millis(5),
            max: Duration::from_millis(20),
        })
}

#[tokio::test]
async fn rate_limited_page_is_retried() {
    let (url, _) = repairshopr().await;
    let client = client(&url, "secret");

    let page = client
        .list_page(
            EntityKind::Customer,
            &PageQuery {
                page: 1,
                ..PageQuery::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(page.items.len(), 2);
    assert_eq!(page.total_pages, Some(1));
    let stats = client.stats();
    assert_eq!(stats.request_count, 2);
    assert_eq!(stats.error_count, 1);
    assert_eq!(stats.rate_limiter.requests_made, 2);
}

#[tokio::test]
async fn single_records_and_missing_resources() {
    let (url, _) = repairshopr().await;
    let client = client(&url, "secret");

    let found = client.get_record(EntityKind::Customer, 1).await.unwrap().unwrap();
    assert_eq!(found["business_name"], "Ace");
    assert!(client.get_record(EntityKind::Customer, 9).await.unwrap().is_none());
    assert!(client.ticket_comments(42).await.unwrap().is_empty());
    assert_eq!(client.whoami().await.unwrap()["user_name"], "Test Tech");
}

#[tokio::test]
async fn bad_key_is_not_retried() {
    let (url, _) = repairshopr().await;
    let client = client(&url, "wrong");

    let err = client.whoami().await.unwrap_err();
    assert!(matches!(err, BridgeError::Auth(_)));
    assert_eq!(client.stats().request_count, 1);
}

#[tokio::test]
async fn server_errors_exhaust_retries() {
    let (url, hits) = repairshopr().await;
    let client = client(&url, "secret");

    let err = client
        .list_page(
            EntityKind::Invoice,
            &PageQuery {
                page: 1,
                ..PageQuery::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::Server { status: 503, .. }));
    assert_eq!(hits.load(Ordering::SeqCst), 3);
}

#[test]
fn missing_api_key_is_rejected_up_front() {
    let config = SourceConfig {
        subdomain: "acme".into(),
        ..SourceConfig::default()
    };
    assert!(matches!(
        RepairShoprClient::new(&config),
        Err(BridgeError::Auth(_))
    ));
}

// ── Onyx sink ──

async fn ingest(State(hits): State<Hits>, Json(body): Json<Value>) -> Response {
    let n = hits.fetch_add(1, Ordering::SeqCst);
    if body["document"]["source"] != "REPAIRSHOPR" {
        return (StatusCode::UNPROCESSABLE_ENTITY, "missing source").into_response();
    }
    if body["document"]["id"] == "rs_customer_2" {
        return (StatusCode::BAD_REQUEST, "bad document").into_response();
    }
    if n == 0 {
        return (StatusCode::INTERNAL_SERVER_ERROR, "warming up").into_response();
    }
    Json(json!({"document_id": body["document"]["id"], "already_existed": false})).into_response()
}

async fn onyx() -> (String, Hits) {
    let hits: Hits = Arc::new(AtomicUsize::new(0));
    let app = Router::new()
        .route("/onyx-api/ingestion", post(ingest))
        .with_state(hits.clone());
    (spawn(app).await, hits)
}

fn doc(id: i64) -> Document {
    let customer: Customer =
        parse_record(EntityKind::Customer, &json!({"id": id, "business_name": "Ace"})).unwrap();
    DocumentBuilder::new("acme").customer(&customer)
}

#[tokio::test]
async fn sink_retries_server_errors_and_reports_rejections() {
    let (url, hits) = onyx().await;
    let sink = OnyxSink::new(&SinkConfig {
        url: Some(url),
        api_key: Some("onyx-key".into()),
        ..SinkConfig::default()
    })
    .unwrap()
    .with_backoff_unit(Duration::from_millis(1));

    let report = sink.send_batch(&[doc(1), doc(2)]).await;

    assert_eq!(report.sent, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(report.errors, vec!["rs_customer_2: HTTP 400: bad document".to_string()]);
    assert_eq!(hits.load(Ordering::SeqCst), 3);
}
