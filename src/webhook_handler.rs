use crate::errors::AppError;
use crate::extract::AppJson;
use crate::handlers::AppState;
use crate::store::OrderStore;
use crate::webhook_models::{PaymentWebhookEvent, WebhookPayload, WebhookResponse};
use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    Json,
};
use std::sync::Arc;

/// Asaas payment webhook.
///
/// Receives charge lifecycle events from the gateway. Validates the
/// `asaas-access-token` header, deduplicates events by id, moves the
/// matching order to its new status and settles credit purchases on
/// payment.
///
/// Answers 500 when any event failed so the gateway redelivers the batch;
/// events already applied come back as duplicates.
///
/// Expected payload: single event object OR array of events
pub async fn asaas_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    AppJson(payload): AppJson<WebhookPayload>,
) -> Result<(StatusCode, Json<WebhookResponse>), AppError> {
    tracing::info!("Received Asaas webhook");

    validate_webhook_token(state.config.asaas_webhook_token.as_deref(), &headers)?;

    let events = payload.into_events();
    let total_received = events.len();

    let mut processed = 0;
    let mut duplicates = 0;
    let mut failed = 0;

    for event in events {
        match process_payment_event(state.store.as_ref(), event).await {
            Ok(ProcessResult::Processed) => processed += 1,
            Ok(ProcessResult::Duplicate) => {
                duplicates += 1;
                tracing::debug!("Skipped duplicate webhook event");
            }
            Err(e) => {
                // Continue processing other events even if one fails
                failed += 1;
                tracing::error!("Failed to process webhook event: {}", e);
            }
        }
    }

    tracing::info!(
        "Webhook processing complete: {} received, {} processed, {} duplicates, {} failed",
        total_received,
        processed,
        duplicates,
        failed
    );

    let (status, label) = if failed > 0 {
        (StatusCode::INTERNAL_SERVER_ERROR, "retry")
    } else {
        (StatusCode::OK, "received")
    };

    Ok((
        status,
        Json(WebhookResponse {
            status: label.to_string(),
            received: total_received,
            processed,
            duplicates,
            failed,
        }),
    ))
}

/// Checks the `asaas-access-token` header when a token is configured.
fn validate_webhook_token(expected: Option<&str>, headers: &HeaderMap) -> Result<(), AppError> {
    let Some(expected) = expected else {
        return Ok(());
    };

    let token = headers
        .get("asaas-access-token")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AppError::Unauthorized("Missing asaas-access-token header".to_string()))?;

    if !constant_time_compare(token, expected) {
        tracing::warn!("Invalid webhook token received");
        return Err(AppError::Unauthorized("Invalid webhook token".to_string()));
    }

    Ok(())
}

fn constant_time_compare(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    a.as_bytes()
        .iter()
        .zip(b.as_bytes().iter())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}

#[derive(Debug, PartialEq)]
enum ProcessResult {
    Processed,
    Duplicate,
}

/// Applies one event, then records it.
///
/// The event id is stored only after every change went through, so an
/// event that failed halfway is applied again on redelivery. Both changes
/// are idempotent.
async fn process_payment_event(
    store: &dyn OrderStore,
    event: PaymentWebhookEvent,
) -> Result<ProcessResult, AppError> {
    let event_id = event.dedup_id();
    if store.payment_event_exists(&event_id).await? {
        return Ok(ProcessResult::Duplicate);
    }

    let payment_id = event.payment.as_ref().map(|p| p.id.clone());
    let payload = serde_json::to_value(&event)
        .map_err(|e| AppError::InternalError(format!("Failed to serialize event: {}", e)))?;

    match (payment_id.as_deref(), event.order_status()) {
        (Some(payment_id), Some(status)) => {
            match store
                .update_order_status_by_payment_id(payment_id, status)
                .await?
            {
                Some(order) => tracing::info!(
                    "✓ Order {} -> {} ({})",
                    order.id,
                    status,
                    event.event
                ),
                None => tracing::debug!(
                    "No order found for payment {} ({})",
                    payment_id,
                    event.event
                ),
            }

            if event.confirms_payment() {
                if let Some(grant) = store.settle_credit_purchase(payment_id).await? {
                    tracing::info!(
                        "✓ Credit purchase {} paid: {} {} balance {}",
                        grant.reference_id.as_deref().unwrap_or_default(),
                        grant.owner_type.as_str(),
                        grant.owner_id,
                        grant.balance_after
                    );
                }
            }
        }
        _ => tracing::debug!("Event {} ({}) does not change any order", event_id, event.event),
    }

    let is_new = store
        .record_payment_event(&event_id, payment_id.as_deref(), &event.event, payload)
        .await?;
    if !is_new {
        return Ok(ProcessResult::Duplicate);
    }

    Ok(ProcessResult::Processed)
}
