//! Integration tests for the HTTP API.
//!
//! Each test boots the full Axum router (same assembly as `main.rs`) using
//! `tower::ServiceExt::oneshot`. No live server, plug or search API needed.
//!
//! `build_test_app()` wires together:
//! - An in-memory SQLite pool with all migrations applied
//! - A stub plug connector answering from a fixed table of IPs
//! - A wiremocked Google Custom Search endpoint
//! - A mailer that only logs
//! - Prometheus `AppMetrics`

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;
use wiremock::{
    matchers::{method, path},
    Mock, MockServer, ResponseTemplate,
};

use enervirgil::{
    api::{self, AppState},
    cache::AppCache,
    db,
    device::{DeviceError, PlugConnector, PlugSession},
    estimate::EstimateResolver,
    mail::LogMailer,
    metrics::AppMetrics,
    poller::DevicePoller,
    pool::WorkerPool,
    repository::EnergyRepository,
    search::GoogleSearchClient,
    services::EnergyService,
};

// ---- Helpers ----------------------------------------------------------------

#[derive(Clone, Copy)]
enum Plug {
    Reading { watts: f64, on: bool },
    Silent,
}

/// Plug connector answering from a table; unknown IPs are unreachable.
#[derive(Clone, Default)]
struct StubConnector {
    plugs: HashMap<String, Plug>,
}

impl StubConnector {
    fn with(mut self, ip: &str, plug: Plug) -> Self {
        self.plugs.insert(ip.to_string(), plug);
        self
    }
}

impl PlugConnector for StubConnector {
    fn open(&self, ip_address: &str) -> Box<dyn PlugSession> {
        Box::new(StubSession {
            plug: self.plugs.get(ip_address).copied(),
            watts: 0.0,
            on: false,
        })
    }
}

struct StubSession {
    plug: Option<Plug>,
    watts: f64,
    on: bool,
}

#[async_trait]
impl PlugSession for StubSession {
    async fn refresh(&mut self) -> Result<(), DeviceError> {
        match self.plug {
            Some(Plug::Reading { watts, on }) => {
                tokio::time::sleep(Duration::from_millis(20)).await;
                self.watts = watts;
                self.on = on;
                Ok(())
            }
            Some(Plug::Silent) => std::future::pending().await,
            None => Err(DeviceError::Transport("no route to host".into())),
        }
    }

    fn power_watts(&self) -> f64 {
        self.watts
    }

    fn is_on(&self) -> bool {
        self.on
    }

    async fn set_on(&mut self, on: bool) -> Result<(), DeviceError> {
        self.on = on;
        Ok(())
    }
}

const SEARCH_RESULTS: &str = r#"{"items": [
    {"title": "Deshumidificador Pro", "snippet": "Potencia nominal de 250 W, ideal para dormitorios"},
    {"title": "Ficha técnica", "snippet": "Tanque de 2 litros y control digital de humedad"}
]}"#;

/// Build the complete test router.
///
/// Plugs: `10.0.0.1` draws 150 W and is on, `10.0.0.2` is off, `10.0.0.3`
/// never answers. Device and deadline timeouts are shortened so the
/// silent plug does not slow the suite down.
///
/// Returns `(Router, MockServer)`. The `MockServer` must stay alive for the
/// duration of the test because the search client points at its URL.
async fn build_test_app() -> (Router, MockServer) {
    let search_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/customsearch/v1"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(SEARCH_RESULTS, "application/json"))
        .mount(&search_server)
        .await;

    let pool = db::create_pool("sqlite::memory:").await.unwrap();
    let repo = EnergyRepository::new(pool);

    let metrics = Arc::new(AppMetrics::new().unwrap());
    let cache = Arc::new(AppCache::new(Duration::from_secs(300)));
    let workers = WorkerPool::new(4).with_metrics(metrics.clone());

    let connector = StubConnector::default()
        .with("10.0.0.1", Plug::Reading { watts: 150.0, on: true })
        .with("10.0.0.2", Plug::Reading { watts: 0.0, on: false })
        .with("10.0.0.3", Plug::Silent);
    let poller = DevicePoller::new(
        Arc::new(connector),
        cache.clone(),
        workers.clone(),
        Arc::new(repo.clone()),
    )
    .with_timeouts(Duration::from_millis(300), Duration::from_secs(2))
    .with_metrics(metrics.clone());

    let search = GoogleSearchClient::with_base_url(
        format!("{}/customsearch/v1", search_server.uri()),
        "test-key".into(),
        "test-cx".into(),
    );
    let estimates = Arc::new(
        EstimateResolver::new(cache.clone(), workers.clone(), Arc::new(search))
            .with_metrics(metrics.clone()),
    );

    let service = EnergyService::new(
        repo,
        cache.clone(),
        poller,
        estimates,
        workers,
        Arc::new(LogMailer),
        "http://localhost:5000".into(),
    );

    let app = api::router(AppState {
        service,
        cache,
        metrics,
    });

    (app, search_server)
}

/// Convenience: collect body bytes and parse as JSON.
async fn json_body(body: Body) -> Value {
    let bytes = body.collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn send_json(http_method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(http_method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn register(app: &Router, receipt: &str) {
    let resp = app
        .clone()
        .oneshot(send_json(
            "POST",
            "/users",
            json!({ "username": format!("user_{}", receipt), "full_name": "Ana Quispe", "receipt_number": receipt }),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);
}

async fn add_device(app: &Router, receipt: &str, name: &str, ip: &str) -> i64 {
    let resp = app
        .clone()
        .oneshot(send_json(
            "POST",
            &format!("/users/{}/devices", receipt),
            json!({ "name": name, "ip_address": ip }),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);
    json_body(resp.into_body()).await["id"].as_i64().unwrap()
}

// ---- GET /health ------------------------------------------------------------

#[tokio::test]
async fn health_returns_200_with_ok_body() {
    let (app, _mock) = build_test_app().await;
    let resp = app.oneshot(get("/health")).await.unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers().get(header::CACHE_CONTROL).unwrap(), "no-store");
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&bytes[..], b"ok");
}

// ---- GET /metrics -----------------------------------------------------------

#[tokio::test]
async fn metrics_exposes_request_counters() {
    let (app, _mock) = build_test_app().await;
    app.clone().oneshot(get("/health")).await.unwrap();

    let resp = app.oneshot(get("/metrics")).await.unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("enervirgil_http_requests_total"));
    assert!(text.contains("path=\"/health\""));
}

// ---- POST /users ------------------------------------------------------------

#[tokio::test]
async fn registering_twice_greets_returning_user() {
    let (app, _mock) = build_test_app().await;
    register(&app, "R-100").await;

    let resp = app
        .oneshot(send_json(
            "POST",
            "/users",
            json!({ "username": "user_R-100", "receipt_number": "R-100" }),
        ))
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    let json = json_body(resp.into_body()).await;
    assert_eq!(json["created"], false);
    assert_eq!(json["user"]["receipt_number"], "R-100");
}

// ---- GET /users/:receipt/energy ---------------------------------------------

#[tokio::test]
async fn energy_data_degrades_silent_plug() {
    let (app, _mock) = build_test_app().await;
    register(&app, "R-100").await;
    let a = add_device(&app, "R-100", "Refrigeradora", "10.0.0.1").await;
    let b = add_device(&app, "R-100", "Televisor", "10.0.0.2").await;
    let c = add_device(&app, "R-100", "Terma", "10.0.0.3").await;

    let resp = app.oneshot(get("/users/R-100/energy")).await.unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    let json = json_body(resp.into_body()).await;
    let devices = json.as_array().unwrap();
    assert_eq!(devices.len(), 3);

    let by_id = |id: i64| devices.iter().find(|d| d["id"] == id).unwrap();
    assert_eq!(by_id(a)["consumption"], 0.15);
    assert_eq!(by_id(a)["status"], true);
    assert!(by_id(a).get("error").is_none());
    assert_eq!(by_id(b)["consumption"], 0.0);
    assert_eq!(by_id(b)["status"], false);
    assert_eq!(by_id(c)["consumption"], 0.0);
    assert_eq!(by_id(c)["error"], "timeout");
}

#[tokio::test]
async fn energy_data_for_unknown_user_is_404() {
    let (app, _mock) = build_test_app().await;
    let resp = app.oneshot(get("/users/nobody/energy")).await.unwrap();

    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    assert!(json_body(resp.into_body()).await["error"].is_string());
}

// ---- GET /users/:receipt/dashboard ------------------------------------------

#[tokio::test]
async fn dashboard_has_totals_advice_and_history() {
    let (app, _mock) = build_test_app().await;
    register(&app, "R-100").await;
    add_device(&app, "R-100", "Refrigeradora", "10.0.0.1").await;
    add_device(&app, "R-100", "Televisor", "10.0.0.2").await;

    let resp = app.oneshot(get("/users/R-100/dashboard")).await.unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    let json = json_body(resp.into_body()).await;
    assert_eq!(json["total_consumption"], 0.15);
    assert!(json["total_cost"].is_number());
    assert!(!json["recommendations"].as_array().unwrap().is_empty());
    assert_eq!(json["consumption_data"]["daily"]["labels"].as_array().unwrap().len(), 7);
    assert_eq!(json["consumption_data"]["weekly"]["data"].as_array().unwrap().len(), 4);
    assert_eq!(json["consumption_data"]["monthly"]["labels"].as_array().unwrap().len(), 12);
}

// ---- Devices ----------------------------------------------------------------

#[tokio::test]
async fn add_device_rejects_bad_ip() {
    let (app, _mock) = build_test_app().await;
    register(&app, "R-100").await;

    let resp = app
        .oneshot(send_json(
            "POST",
            "/users/R-100/devices",
            json!({ "name": "TV", "ip_address": "999.1.1.1" }),
        ))
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn add_device_with_duplicate_ip_is_409() {
    let (app, _mock) = build_test_app().await;
    register(&app, "R-100").await;
    add_device(&app, "R-100", "TV", "10.0.0.1").await;

    let resp = app
        .oneshot(send_json(
            "POST",
            "/users/R-100/devices",
            json!({ "name": "Radio", "ip_address": "10.0.0.1" }),
        ))
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn add_device_quotes_estimate() {
    let (app, _mock) = build_test_app().await;
    register(&app, "R-100").await;

    let resp = app
        .oneshot(send_json(
            "POST",
            "/users/R-100/devices",
            json!({ "name": "Lavadora", "ip_address": "10.0.0.1" }),
        ))
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::CREATED);
    let json = json_body(resp.into_body()).await;
    assert_eq!(json["estimate"]["daily_kwh"], 0.8);
    assert_eq!(json["estimate"]["source"], "local_table");
    assert!(json["message"].as_str().unwrap().contains("0.8 kWh/day"));
}

#[tokio::test]
async fn device_detail_then_delete() {
    let (app, _mock) = build_test_app().await;
    register(&app, "R-100").await;
    let id = add_device(&app, "R-100", "Refrigeradora", "10.0.0.1").await;

    let resp = app
        .clone()
        .oneshot(get(&format!("/users/R-100/devices/{}", id)))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let json = json_body(resp.into_body()).await;
    assert_eq!(json["device"]["ip_address"], "10.0.0.1");
    assert_eq!(json["estimate"]["daily_kwh"], 1.5);

    let resp = app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(format!("/users/R-100/devices/{}", id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);

    let resp = app
        .oneshot(get(&format!("/users/R-100/devices/{}", id)))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn power_action_is_validated_and_applied() {
    let (app, _mock) = build_test_app().await;
    register(&app, "R-100").await;
    let id = add_device(&app, "R-100", "Televisor", "10.0.0.2").await;
    let uri = format!("/users/R-100/devices/{}/power", id);

    let resp = app
        .clone()
        .oneshot(send_json("POST", &uri, json!({ "action": "toggle" })))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let resp = app
        .oneshot(send_json("POST", &uri, json!({ "action": "on" })))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let json = json_body(resp.into_body()).await;
    assert!(json["message"].as_str().unwrap().contains("switched on"));
}

#[tokio::test]
async fn power_on_unreachable_plug_is_502() {
    let (app, _mock) = build_test_app().await;
    register(&app, "R-100").await;
    let id = add_device(&app, "R-100", "Radio", "10.0.0.9").await;

    let resp = app
        .oneshot(send_json(
            "POST",
            &format!("/users/R-100/devices/{}/power", id),
            json!({ "action": "off" }),
        ))
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
}

// ---- GET /devices/:id/consumption -------------------------------------------

#[tokio::test]
async fn live_consumption_reports_kwh() {
    let (app, _mock) = build_test_app().await;
    register(&app, "R-100").await;
    let id = add_device(&app, "R-100", "Refrigeradora", "10.0.0.1").await;

    let resp = app
        .oneshot(get(&format!("/devices/{}/consumption", id)))
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(json_body(resp.into_body()).await["consumo_actual"], 0.15);
}

#[tokio::test]
async fn live_consumption_for_unknown_device_is_404() {
    let (app, _mock) = build_test_app().await;
    let resp = app.oneshot(get("/devices/999/consumption")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

// ---- GET /estimates ---------------------------------------------------------

#[tokio::test]
async fn estimate_from_local_table_is_cacheable() {
    let (app, _mock) = build_test_app().await;

    let resp = app.clone().oneshot(get("/estimates?name=Terma")).await.unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    let etag = resp.headers().get(header::ETAG).unwrap().clone();
    assert!(resp
        .headers()
        .get(header::CACHE_CONTROL)
        .unwrap()
        .to_str()
        .unwrap()
        .starts_with("max-age=300"));
    let json = json_body(resp.into_body()).await;
    assert_eq!(json["daily_kwh"], 4.0);

    let resp = app
        .oneshot(
            Request::builder()
                .uri("/estimates?name=Terma")
                .header(header::IF_NONE_MATCH, etag)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_MODIFIED);
}

#[tokio::test]
async fn estimate_falls_back_to_search() {
    let (app, mock) = build_test_app().await;

    let resp = app.oneshot(get("/estimates?name=Deshumidificador")).await.unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    let json = json_body(resp.into_body()).await;
    assert_eq!(json["source"], "external_lookup");
    assert_eq!(json["daily_kwh"], 6.0);
    assert_eq!(mock.received_requests().await.unwrap().len(), 1);
}

#[tokio::test]
async fn estimate_requires_name() {
    let (app, _mock) = build_test_app().await;
    let resp = app.oneshot(get("/estimates")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}
