use crate::handlers::{self, AppState};
use crate::webhook_handler;
use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_governor::{
    governor::GovernorConfigBuilder, key_extractor::SmartIpKeyExtractor, GovernorLayer,
};
use tower_http::{cors::CorsLayer, limit::RequestBodyLimitLayer, trace::TraceLayer};

/// Request bodies above this size are rejected with 413.
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Builds the HTTP application.
///
/// API routes sit behind a body-size limit and per-IP rate limiting
/// (10 req/s, burst 20). `/health` bypasses both.
pub fn build_router(state: Arc<AppState>) -> Router {
    let governor_conf = Arc::new(
        GovernorConfigBuilder::default()
            .per_second(10)
            .burst_size(20)
            .key_extractor(SmartIpKeyExtractor)
            .finish()
            .expect("static rate limiter settings are valid"),
    );

    let protected_routes = Router::new()
        // Payments
        .route(
            "/api/payments/create-service-order",
            post(handlers::create_service_order),
        )
        .route("/api/payments/:id", get(handlers::get_payment))
        .route("/api/companies/:id/wallet", get(handlers::company_wallet))
        // Credits
        .route("/api/credits/packages", get(handlers::credit_packages))
        .route(
            "/api/credits/transactions",
            get(handlers::credit_transactions),
        )
        .route("/api/credits/balance", get(handlers::credit_balance))
        .route("/api/credits/purchase", post(handlers::purchase_credits))
        .route(
            "/api/credits/purchases/:id",
            get(handlers::get_credit_purchase),
        )
        .route("/api/credits/consume", post(handlers::consume_credits))
        // Automation chat
        .route("/api/chat", post(handlers::chat))
        // Gateway webhook
        .route("/api/webhooks/asaas", post(webhook_handler::asaas_webhook))
        .layer(
            ServiceBuilder::new()
                .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
                .layer(GovernorLayer {
                    config: governor_conf,
                }),
        );

    Router::new()
        .route("/health", get(handlers::health))
        .merge(protected_routes)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}
