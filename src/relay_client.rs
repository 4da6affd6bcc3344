use crate::circuit_breaker::{create_relay_circuit_breaker, RelayCircuitBreaker};
use crate::errors::AppError;
use crate::money::Cents;
use chrono::NaiveDate;
use reqwest;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing;
use uuid::Uuid;

/// Customer block of the charge request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayCustomer {
    pub id: Uuid,
    pub name: String,
    pub cpf_cnpj: Option<String>,
    pub email: Option<String>,
    pub mobile_phone: Option<String>,
    pub birth_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayService {
    pub id: Uuid,
    pub name: String,
    pub category: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayCompany {
    pub id: Uuid,
    pub name: String,
    pub wallet_id: String,
}

/// Package block sent instead of service and company for credit purchases.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayCreditPackage {
    pub id: Uuid,
    pub name: String,
    pub credits: i64,
}

/// Split share in the gateway's own shape.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelaySplit {
    pub wallet_id: String,
    pub fixed_value: Cents,
}

/// Payload POSTed to the automation webhook, which creates the PIX charge.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayChargeRequest {
    /// Idempotency key; the gateway stores it as the charge reference.
    pub external_reference: String,
    pub billing_type: &'static str,
    pub value: Cents,
    pub due_date: NaiveDate,
    pub description: String,
    pub customer: RelayCustomer,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<RelayService>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub company: Option<RelayCompany>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credit_package: Option<RelayCreditPackage>,
    pub split: Vec<RelaySplit>,
}

/// Gateway identifiers extracted from the relay answer.
#[derive(Debug, Clone, PartialEq)]
pub struct RelayChargeResult {
    pub payment_id: String,
    pub status: String,
    pub pix_copy_paste: Option<String>,
    pub qr_code_image: Option<String>,
    pub invoice_url: Option<String>,
}

enum RelayFailure {
    /// Timeout, connection error, 429 or 5xx.
    Unavailable(String),
    /// The relay answered 4xx; retrying cannot help.
    Rejected(String),
}

/// Client for the automation-platform webhooks (charge creation and chat).
#[derive(Clone)]
pub struct RelayClient {
    client: reqwest::Client,
    webhook_url: String,
    chat_webhook_url: Option<String>,
    retry_backoff: Duration,
    breaker: Arc<RelayCircuitBreaker>,
}

impl RelayClient {
    /// Creates a new `RelayClient`.
    ///
    /// # Arguments
    ///
    /// * `webhook_url` - Charge-creation webhook.
    /// * `chat_webhook_url` - Optional chat webhook.
    /// * `timeout` - Per-attempt timeout for outbound calls.
    pub fn new(
        webhook_url: String,
        chat_webhook_url: Option<String>,
        timeout: Duration,
    ) -> Result<Self, AppError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| {
                AppError::ExternalApiError(format!("Failed to create relay client: {}", e))
            })?;

        Ok(Self {
            client,
            webhook_url,
            chat_webhook_url,
            retry_backoff: Duration::from_millis(500),
            breaker: Arc::new(create_relay_circuit_breaker()),
        })
    }

    /// Overrides the pause before the single retry.
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Asks the relay to create a PIX charge.
    ///
    /// Sends the idempotency key both as `Idempotency-Key` header and as
    /// `externalReference`, so the single retry on unavailability cannot
    /// create a second charge.
    pub async fn create_charge(
        &self,
        request: &RelayChargeRequest,
    ) -> Result<RelayChargeResult, AppError> {
        if !self.breaker.is_call_permitted() {
            return Err(AppError::RelayUnreachable(
                "relay circuit open after repeated failures".to_string(),
            ));
        }

        let key = request.external_reference.as_str();
        let mut attempt = 1;
        let body = loop {
            tracing::info!(
                "Relaying charge {} ({} BRL) attempt {}",
                key,
                request.value,
                attempt
            );
            match self.post_charge(request).await {
                Ok(body) => {
                    self.breaker.on_success();
                    break body;
                }
                Err(RelayFailure::Rejected(msg)) => {
                    return Err(AppError::RelayUnreachable(msg));
                }
                Err(RelayFailure::Unavailable(msg)) => {
                    self.breaker.on_error();
                    if attempt >= 2 {
                        return Err(AppError::RelayUnreachable(msg));
                    }
                    tracing::warn!("Relay unavailable for {}: {}. Retrying once", key, msg);
                    tokio::time::sleep(self.retry_backoff).await;
                    attempt += 1;
                }
            }
        };

        let result = parse_charge_response(&body)?;
        tracing::info!(
            "✓ Relay created charge {} for {}",
            result.payment_id,
            key
        );
        Ok(result)
    }

    async fn post_charge(&self, request: &RelayChargeRequest) -> Result<Value, RelayFailure> {
        let response = self
            .client
            .post(&self.webhook_url)
            .header("Idempotency-Key", &request.external_reference)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    RelayFailure::Unavailable("relay request timed out".to_string())
                } else {
                    RelayFailure::Unavailable(format!("relay request failed: {}", e))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            let msg = format!("relay returned {}: {}", status, error_text);
            return Err(
                if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                    RelayFailure::Unavailable(msg)
                } else {
                    RelayFailure::Rejected(msg)
                },
            );
        }

        response
            .json()
            .await
            .map_err(|e| RelayFailure::Rejected(format!("relay response is not JSON: {}", e)))
    }

    /// Forwards a chat message to the chat webhook and returns its answer.
    pub async fn send_chat_message(&self, body: &Value) -> Result<Value, AppError> {
        let url = self.chat_webhook_url.as_deref().ok_or_else(|| {
            AppError::ServiceUnavailable("chat relay is not configured".to_string())
        })?;

        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| AppError::RelayUnreachable(format!("chat relay failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(AppError::RelayUnreachable(format!(
                "chat relay returned {}: {}",
                status, error_text
            )));
        }

        response
            .json()
            .await
            .map_err(|e| AppError::RelayUnreachable(format!("chat relay response invalid: {}", e)))
    }
}

/// Pulls gateway identifiers out of whatever shape the workflow returned.
///
/// Workflows answer either with the gateway object itself, a one-element
/// array of it, or an object nesting it under `payment` / `pix`.
pub fn parse_charge_response(body: &Value) -> Result<RelayChargeResult, AppError> {
    let root = match body {
        Value::Array(items) => items.first().ok_or_else(|| {
            AppError::RelayUnreachable("relay returned an empty array".to_string())
        })?,
        other => other,
    };

    let payment_id = find_string(root, &[&["id"], &["paymentId"], &["payment", "id"]])
        .ok_or_else(|| {
            tracing::warn!("Unexpected relay response format: {:?}", body);
            AppError::RelayUnreachable("relay response missing payment id".to_string())
        })?;

    let qr_code_image = find_string(
        root,
        &[
            &["encodedImage"],
            &["qrCode"],
            &["pix", "encodedImage"],
            &["pixQrCode", "encodedImage"],
        ],
    );
    if qr_code_image.is_none() {
        tracing::warn!("Relay response for payment {} has no QR code", payment_id);
    }

    Ok(RelayChargeResult {
        status: find_string(root, &[&["status"], &["payment", "status"]])
            .unwrap_or_else(|| "PENDING".to_string()),
        pix_copy_paste: find_string(
            root,
            &[
                &["payload"],
                &["pixCopyPaste"],
                &["pix", "payload"],
                &["pixQrCode", "payload"],
            ],
        ),
        qr_code_image,
        invoice_url: find_string(root, &[&["invoiceUrl"], &["payment", "invoiceUrl"]]),
        payment_id,
    })
}

fn find_string(root: &Value, paths: &[&[&str]]) -> Option<String> {
    paths.iter().find_map(|path| {
        let mut node = root;
        for key in path.iter() {
            node = node.get(*key)?;
        }
        match node {
            Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_client_creation() {
        let client = RelayClient::new(
            "https://n8n.example.com/webhook/pix".to_string(),
            None,
            Duration::from_secs(5),
        );
        assert!(client.is_ok());
    }

    #[test]
    fn test_parse_flat_response() {
        let result = parse_charge_response(&json!({
            "id": "pay_123",
            "status": "PENDING",
            "invoiceUrl": "https://sandbox.asaas.com/i/123",
            "payload": "00020126...",
            "encodedImage": "iVBORw0KGgo="
        }))
        .unwrap();

        assert_eq!(result.payment_id, "pay_123");
        assert_eq!(result.pix_copy_paste.as_deref(), Some("00020126..."));
        assert_eq!(result.qr_code_image.as_deref(), Some("iVBORw0KGgo="));
        assert_eq!(
            result.invoice_url.as_deref(),
            Some("https://sandbox.asaas.com/i/123")
        );
    }

    #[test]
    fn test_parse_nested_array_response() {
        let result = parse_charge_response(&json!([{
            "payment": {"id": "pay_9", "status": "PENDING", "invoiceUrl": "u"},
            "pix": {"payload": "000201", "encodedImage": "img"}
        }]))
        .unwrap();

        assert_eq!(result.payment_id, "pay_9");
        assert_eq!(result.status, "PENDING");
        assert_eq!(result.pix_copy_paste.as_deref(), Some("000201"));
        assert_eq!(result.qr_code_image.as_deref(), Some("img"));
    }

    #[test]
    fn test_parse_missing_qr_code_is_not_an_error() {
        let result = parse_charge_response(&json!({"id": "pay_1", "payload": "000201"})).unwrap();
        assert_eq!(result.qr_code_image, None);
        assert_eq!(result.status, "PENDING");
    }

    #[test]
    fn test_parse_missing_payment_id() {
        let err = parse_charge_response(&json!({"message": "Workflow was started"})).unwrap_err();
        assert_eq!(err.code(), "RELAY_UNREACHABLE");
        assert!(parse_charge_response(&json!([])).is_err());
    }

    #[test]
    fn test_request_serializes_gateway_split_shape() {
        let split = RelaySplit {
            wallet_id: "w1".to_string(),
            fixed_value: Cents(7500),
        };
        assert_eq!(
            serde_json::to_value(&split).unwrap(),
            json!({"walletId": "w1", "fixedValue": 75.0})
        );
    }

    #[test]
    fn test_credit_package_request_omits_service_and_company() {
        let request = RelayChargeRequest {
            external_reference: "purchase-1".to_string(),
            billing_type: "PIX",
            value: Cents(4990),
            due_date: NaiveDate::from_ymd_opt(2024, 5, 10).unwrap(),
            description: "Credits".to_string(),
            customer: RelayCustomer {
                id: Uuid::nil(),
                name: "Maria".to_string(),
                cpf_cnpj: None,
                email: None,
                mobile_phone: None,
                birth_date: None,
            },
            service: None,
            company: None,
            credit_package: Some(RelayCreditPackage {
                id: Uuid::nil(),
                name: "Starter".to_string(),
                credits: 50,
            }),
            split: vec![],
        };

        let body = serde_json::to_value(&request).unwrap();
        assert!(body.get("service").is_none());
        assert!(body.get("company").is_none());
        assert_eq!(body["creditPackage"]["credits"], 50);
        assert_eq!(body["externalReference"], "purchase-1");
    }
}
