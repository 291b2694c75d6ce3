use axum::http::{
    header::{ACCEPT, CONTENT_TYPE},
    HeaderName, HeaderValue, Method, StatusCode,
};
use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};
use sqlx::PgPool;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, CorsLayer};

pub mod checkout;
pub mod config;
pub mod gateway;
pub mod handlers;
pub mod ledger;
pub mod redemption;
pub mod rewards;
pub mod webhook;

use crate::config::AppConfig;
use crate::gateway::PaymentGateway;
use crate::rewards::RewardCatalog;

pub static STOREFRONT_REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

static HTTP_ERRORS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let v = IntCounterVec::new(
        Opts::new("http_errors_total", "Count of HTTP error responses emitted (status >= 400)"),
        &["service", "code", "status"],
    )
    .unwrap();
    STOREFRONT_REGISTRY.register(Box::new(v.clone())).ok();
    v
});

pub static WEBHOOK_EVENTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let v = IntCounterVec::new(
        Opts::new("webhook_events_total", "Square webhook deliveries by outcome"),
        &["outcome"],
    )
    .unwrap();
    STOREFRONT_REGISTRY.register(Box::new(v.clone())).ok();
    v
});

#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub gateway: Arc<dyn PaymentGateway>,
    pub catalog: Arc<RewardCatalog>,
    pub config: Arc<AppConfig>,
}

pub async fn http_error_metrics(
    req: axum::http::Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> axum::response::Response {
    let resp = next.run(req).await;
    let status = resp.status();
    if status.as_u16() >= 400 {
        let code = resp
            .headers()
            .get("X-Error-Code")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("unknown");
        HTTP_ERRORS_TOTAL
            .with_label_values(&["storefront-service", code, status.as_str()])
            .inc();
    }
    resp
}

pub async fn health() -> &'static str {
    "ok"
}

async fn metrics() -> (StatusCode, String) {
    let encoder = TextEncoder::new();
    let families = STOREFRONT_REGISTRY.gather();
    let mut buf = Vec::new();
    if let Err(e) = encoder.encode(&families, &mut buf) {
        return (StatusCode::INTERNAL_SERVER_ERROR, format!("metrics encode error: {e}"));
    }
    (StatusCode::OK, String::from_utf8_lossy(&buf).to_string())
}

pub fn build_router(state: AppState) -> Router {
    let allowed_origins = [
        "http://localhost:3000",
        "http://localhost:5173",
    ];
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(
            allowed_origins
                .iter()
                .filter_map(|o| o.parse::<HeaderValue>().ok())
                .collect::<Vec<_>>(),
        ))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            ACCEPT,
            CONTENT_TYPE,
            HeaderName::from_static("authorization"),
        ]);

    Router::new()
        .route("/healthz", get(health))
        .route("/coupons/validate", post(handlers::coupon_validate))
        .route("/rewards", get(handlers::list_rewards))
        .route("/rewards/redeem", post(handlers::redeem_reward))
        .route("/rewards/mark-used", post(handlers::mark_reward_used))
        .route("/checkout", post(handlers::full_checkout))
        .route("/checkout/orders", post(handlers::create_checkout_order))
        .route("/checkout/pay", post(handlers::pay_checkout_order))
        .route("/loyalty/balance", get(handlers::get_balance))
        .route("/webhooks/square", post(webhook::handle_square_webhook))
        .route("/metrics", get(metrics))
        .with_state(state)
        .layer(cors)
        .layer(middleware::from_fn(http_error_metrics))
}
