//! HTTP surface.
//!
//! Routes:
//! - `GET    /health`
//! - `GET    /metrics`
//! - `POST   /users`                               register or greet a user
//! - `GET    /users/:receipt/energy`               live snapshot of every plug
//! - `GET    /users/:receipt/dashboard`            totals, advice, history
//! - `POST   /users/:receipt/devices`              register a plug
//! - `GET    /users/:receipt/devices/:id`          device detail
//! - `DELETE /users/:receipt/devices/:id`          remove a plug
//! - `POST   /users/:receipt/devices/:id/power`    switch a plug on/off
//! - `GET    /devices/:id/consumption`             uncached live reading
//! - `GET    /estimates?name=`                     estimated daily kWh

pub mod energy;
pub mod headers;
pub mod health;

use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{MatchedPath, Request, State},
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;

use crate::cache::AppCache;
use crate::metrics::AppMetrics;
use crate::services::EnergyService;

pub struct AppState {
    pub service: EnergyService,
    pub cache: Arc<AppCache>,
    pub metrics: Arc<AppMetrics>,
}

pub type SharedState = Arc<AppState>;

/// Assemble the full router. `main.rs` and the integration tests both
/// build the app through here.
pub fn router(state: AppState) -> Router {
    let metrics = state.metrics.clone();

    Router::new()
        .route("/health", get(health::health))
        .route("/metrics", get(health::metrics))
        .route("/users", post(energy::register_user))
        .route("/users/:receipt/energy", get(energy::energy_data))
        .route("/users/:receipt/dashboard", get(energy::dashboard))
        .route("/users/:receipt/devices", post(energy::add_device))
        .route(
            "/users/:receipt/devices/:id",
            get(energy::device_detail).delete(energy::delete_device),
        )
        .route("/users/:receipt/devices/:id/power", post(energy::set_power))
        .route("/devices/:id/consumption", get(energy::live_consumption))
        .route("/estimates", get(energy::estimate))
        .route_layer(middleware::from_fn_with_state(metrics, track_requests))
        .with_state(Arc::new(state))
        .layer(CorsLayer::permissive())
}

/// Count and time every routed request, labelled by route template so
/// receipt numbers and ids do not explode the label space.
async fn track_requests(
    State(metrics): State<Arc<AppMetrics>>,
    request: Request,
    next: Next,
) -> Response {
    let method = request.method().to_string();
    let path = request
        .extensions()
        .get::<MatchedPath>()
        .map(|matched| matched.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());

    let started = Instant::now();
    let response = next.run(request).await;

    metrics
        .http_request_duration
        .observe(started.elapsed().as_secs_f64());
    metrics
        .http_requests_total
        .with_label_values(&[method.as_str(), path.as_str(), response.status().as_str()])
        .inc();

    response
}
