//! JSON API over the brokerage client, recommendations and scheduler.
//!
//! CORS is open for local front-ends.

pub mod routes;

use anyhow::{Context, Result};
use axum::{
    http::{header, HeaderValue, Method},
    routing::{get, post},
    Router,
};
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

pub use routes::{ApiState, AppState};

/// Bind the API port and serve in a background task.
pub async fn spawn_api(state: AppState, port: u16) -> Result<JoinHandle<()>> {
    let app = build_router(state);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind API port {port}"))?;
    info!(port, "API server listening on http://localhost:{port}");

    Ok(tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "API server stopped");
        }
    }))
}

/// Build the router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(HeaderValue::from_static("*"))
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        .route("/health", get(routes::health))
        // Account
        .route("/api/balance/domestic", get(routes::domestic_balance))
        .route("/api/balance/overseas", get(routes::overseas_balance))
        .route("/api/balance/holdings", get(routes::holdings))
        .route("/api/balance/deposit", get(routes::deposit))
        .route("/api/balance/purchasable", get(routes::purchasable_amount))
        .route("/api/quote", get(routes::quote))
        // Orders
        .route("/api/orders", post(routes::place_order))
        .route("/api/orders/outstanding", get(routes::outstanding_orders))
        .route("/api/orders/reservations", get(routes::reservation_orders))
        .route("/api/orders/reservation", post(routes::reserve_order))
        .route("/api/orders/conditional", post(routes::conditional_order))
        // Recommendations
        .route("/api/recommendations/buy", get(routes::buy_candidates))
        .route("/api/recommendations/sell", get(routes::sell_candidates))
        .route("/api/recommendations/predictions", get(routes::predictions))
        .route("/api/signals/technical", post(routes::generate_signals))
        .route("/api/signals/sentiment", post(routes::refresh_sentiment))
        .route("/api/catalog", get(routes::catalog))
        // Model inputs
        .route("/api/prices", post(routes::upsert_prices))
        .route("/api/predictions", post(routes::insert_predictions))
        // Scheduler
        .route("/api/scheduler/status", get(routes::scheduler_status))
        .route("/api/scheduler/:job/start", post(routes::start_job))
        .route("/api/scheduler/:job/stop", post(routes::stop_job))
        .route("/api/scheduler/:job/run", post(routes::run_job))
        .layer(cors)
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
