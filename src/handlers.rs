use crate::config::Config;
use crate::credits::CreditService;
use crate::errors::AppError;
use crate::extract::{AppJson, AppPath, AppQuery};
use crate::models::*;
use crate::payments::PaymentOrderService;
use crate::relay_client::RelayClient;
use crate::store::OrderStore;
use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

/// Shared application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    /// Relational store (PostgREST, Postgres or in-memory).
    pub store: Arc<dyn OrderStore>,
    /// Application configuration.
    pub config: Config,
    /// Payment-order relay.
    pub payments: PaymentOrderService,
    /// Prepaid credit ledger.
    pub credits: CreditService,
    /// Automation webhook client, used directly for chat.
    pub relay: RelayClient,
}

/// Health check endpoint.
///
/// # Returns
///
/// * `(StatusCode, Json<serde_json::Value>)` - HTTP 200 OK with health status JSON.
pub async fn health() -> (StatusCode, Json<Value>) {
    (
        StatusCode::OK,
        Json(json!({
            "status": "healthy",
            "service": "pix-relay",
            "version": env!("CARGO_PKG_VERSION")
        })),
    )
}

/// POST /api/payments/create-service-order
///
/// Creates a PIX charge for a service, split between the platform and the
/// company wallets. Answers 201 for a new order and 200 when the
/// idempotency key replays an existing one.
///
/// # Arguments
///
/// * `state` - The application state.
/// * `headers` - May carry `Idempotency-Key`.
/// * `payload` - Customer, service, company and amount.
pub async fn create_service_order(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    AppJson(payload): AppJson<CreateServiceOrderRequest>,
) -> Result<(StatusCode, Json<ServiceOrderResponse>), AppError> {
    tracing::info!(
        "POST /payments/create-service-order - customer {} service {} company {}",
        payload.customer_id,
        payload.service_id,
        payload.company_id
    );

    let idempotency_key = headers
        .get("Idempotency-Key")
        .and_then(|v| v.to_str().ok());

    let created = state
        .payments
        .create_service_order(&payload, idempotency_key)
        .await?;

    let status = if created.replayed {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };

    Ok((
        status,
        Json(ServiceOrderResponse::from_order(
            created.order,
            created.replayed,
        )),
    ))
}

#[derive(Debug, Deserialize)]
pub struct GetPaymentParams {
    #[serde(default)]
    pub refresh: bool,
}

/// GET /api/payments/:id
///
/// Returns a stored order. `?refresh=true` re-reads the charge status from
/// the gateway first.
pub async fn get_payment(
    State(state): State<Arc<AppState>>,
    AppPath(id): AppPath<Uuid>,
    AppQuery(params): AppQuery<GetPaymentParams>,
) -> Result<Json<ServiceOrderResponse>, AppError> {
    tracing::info!("GET /payments/{} (refresh: {})", id, params.refresh);

    let order = state.payments.get_order(id, params.refresh).await?;
    Ok(Json(ServiceOrderResponse::from_order(order, false)))
}

/// GET /api/companies/:id/wallet
///
/// Diagnostic view of a company's wallet columns.
pub async fn company_wallet(
    State(state): State<Arc<AppState>>,
    AppPath(id): AppPath<Uuid>,
) -> Result<Json<CompanyWalletReport>, AppError> {
    tracing::info!("GET /companies/{}/wallet", id);

    let report = state.payments.company_wallet_report(id).await?;
    if report.columns_disagree {
        tracing::warn!(
            "Company {} has different asaas_wallet_id and wallet_id values",
            id
        );
    }
    Ok(Json(report))
}

/// GET /api/credits/packages
pub async fn credit_packages(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<CreditPackage>>, AppError> {
    Ok(Json(state.credits.packages().await?))
}

/// GET /api/credits/transactions?ownerType=&ownerId=&limit=
pub async fn credit_transactions(
    State(state): State<Arc<AppState>>,
    AppQuery(params): AppQuery<OwnerQuery>,
) -> Result<Json<Vec<CreditTransaction>>, AppError> {
    let transactions = state
        .credits
        .transactions(params.owner_type, params.owner_id, params.limit)
        .await?;
    Ok(Json(transactions))
}

/// GET /api/credits/balance?ownerType=&ownerId=
pub async fn credit_balance(
    State(state): State<Arc<AppState>>,
    AppQuery(params): AppQuery<OwnerQuery>,
) -> Result<Json<CreditBalanceResponse>, AppError> {
    Ok(Json(
        state
            .credits
            .balance(params.owner_type, params.owner_id)
            .await?,
    ))
}

/// POST /api/credits/purchase
///
/// Opens a PIX charge for a package. Credits are granted when the gateway
/// reports the charge as paid.
pub async fn purchase_credits(
    State(state): State<Arc<AppState>>,
    AppJson(payload): AppJson<PurchaseCreditsRequest>,
) -> Result<(StatusCode, Json<CreditPurchaseResponse>), AppError> {
    tracing::info!(
        "POST /credits/purchase - {} {} package {}",
        payload.owner_type.as_str(),
        payload.owner_id,
        payload.package_id
    );
    let purchase = state.credits.purchase(&payload).await?;
    Ok((StatusCode::CREATED, Json(purchase.into())))
}

/// GET /api/credits/purchases/:id
pub async fn get_credit_purchase(
    State(state): State<Arc<AppState>>,
    AppPath(id): AppPath<Uuid>,
) -> Result<Json<CreditPurchaseResponse>, AppError> {
    Ok(Json(state.credits.get_purchase(id).await?.into()))
}

/// POST /api/credits/consume
pub async fn consume_credits(
    State(state): State<Arc<AppState>>,
    AppJson(payload): AppJson<ConsumeCreditsRequest>,
) -> Result<Json<CreditMutationResponse>, AppError> {
    tracing::info!(
        "POST /credits/consume - {} {} amount {}",
        payload.owner_type.as_str(),
        payload.owner_id,
        payload.amount
    );
    Ok(Json(state.credits.consume(&payload).await?))
}

/// POST /api/chat
///
/// Forwards a chat message to the automation chat webhook.
pub async fn chat(
    State(state): State<Arc<AppState>>,
    AppJson(payload): AppJson<ChatRequest>,
) -> Result<Json<Value>, AppError> {
    if payload.message.trim().is_empty() {
        return Err(AppError::BadRequest("message must not be empty".to_string()));
    }
    tracing::info!("POST /chat - session {}", payload.session_id);

    let body = serde_json::to_value(&payload)
        .map_err(|e| AppError::InternalError(format!("Failed to encode chat message: {}", e)))?;
    Ok(Json(state.relay.send_chat_message(&body).await?))
}
