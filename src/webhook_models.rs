use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Gateway webhook body - a single event or an array of events.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum WebhookPayload {
    Single(PaymentWebhookEvent),
    Batch(Vec<PaymentWebhookEvent>),
}

impl WebhookPayload {
    /// Convert to a vec of events for uniform processing
    pub fn into_events(self) -> Vec<PaymentWebhookEvent> {
        match self {
            WebhookPayload::Single(event) => vec![event],
            WebhookPayload::Batch(events) => events,
        }
    }
}

/// Payment event posted by the gateway.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentWebhookEvent {
    /// Event id (`evt_...`). Older gateway accounts omit it.
    #[serde(default)]
    pub id: Option<String>,

    /// Event name, e.g. `PAYMENT_RECEIVED`.
    pub event: String,

    #[serde(default)]
    pub date_created: Option<String>,

    #[serde(default)]
    pub payment: Option<WebhookPayment>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookPayment {
    pub id: String,

    #[serde(default)]
    pub status: Option<String>,

    #[serde(default)]
    pub external_reference: Option<String>,

    /// Remaining payment fields
    #[serde(flatten)]
    pub raw: Value,
}

impl PaymentWebhookEvent {
    /// Stable id used for deduplication.
    ///
    /// Falls back to a hash of event name, payment id, payment status and
    /// creation date when the gateway sent no event id.
    pub fn dedup_id(&self) -> String {
        if let Some(id) = self.id.as_deref().filter(|id| !id.is_empty()) {
            return id.to_string();
        }

        let payment = self.payment.as_ref();
        let mut hasher = Sha256::new();
        hasher.update(
            format!(
                "{}|{}|{}|{}",
                self.event,
                payment.map(|p| p.id.as_str()).unwrap_or_default(),
                payment
                    .and_then(|p| p.status.as_deref())
                    .unwrap_or_default(),
                self.date_created.as_deref().unwrap_or_default()
            )
            .as_bytes(),
        );
        format!("derived_{}", hex::encode(hasher.finalize()))
    }

    /// Order status implied by the event, if the event moves the order.
    pub fn order_status(&self) -> Option<&'static str> {
        match self.event.as_str() {
            "PAYMENT_RECEIVED" => Some("RECEIVED"),
            "PAYMENT_CONFIRMED" => Some("CONFIRMED"),
            "PAYMENT_OVERDUE" => Some("OVERDUE"),
            "PAYMENT_REFUNDED" | "PAYMENT_PARTIALLY_REFUNDED" => Some("REFUNDED"),
            "PAYMENT_DELETED" => Some("CANCELLED"),
            "PAYMENT_RESTORED" => Some("PENDING"),
            _ => None,
        }
    }

    /// Whether the event means the charge was paid.
    pub fn confirms_payment(&self) -> bool {
        matches!(self.event.as_str(), "PAYMENT_RECEIVED" | "PAYMENT_CONFIRMED")
    }
}

/// Response to the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookResponse {
    pub status: String,
    pub received: usize,
    pub processed: usize,
    pub duplicates: usize,
    /// Events that hit an error; any failure makes the gateway redeliver.
    #[serde(default)]
    pub failed: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_single_and_batch_payloads() {
        let single: WebhookPayload = serde_json::from_value(json!({
            "id": "evt_1",
            "event": "PAYMENT_RECEIVED",
            "payment": {"id": "pay_1", "status": "RECEIVED", "value": 150.0}
        }))
        .unwrap();
        let events = single.into_events();
        assert_eq!(events.len(), 1);
        assert!(events[0].confirms_payment());
        assert_eq!(events[0].order_status(), Some("RECEIVED"));
        assert_eq!(events[0].payment.as_ref().unwrap().raw["value"], 150.0);

        let batch: WebhookPayload = serde_json::from_value(json!([
            {"id": "evt_1", "event": "PAYMENT_CREATED", "payment": {"id": "pay_1"}},
            {"id": "evt_2", "event": "PAYMENT_OVERDUE", "payment": {"id": "pay_1"}}
        ]))
        .unwrap();
        let events = batch.into_events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].order_status(), None);
        assert_eq!(events[1].order_status(), Some("OVERDUE"));
        assert!(!events[1].confirms_payment());
    }

    #[test]
    fn test_dedup_id_without_event_id_is_stable() {
        let event: PaymentWebhookEvent = serde_json::from_value(json!({
            "event": "PAYMENT_CONFIRMED",
            "dateCreated": "2024-05-01 10:00:00",
            "payment": {"id": "pay_9", "status": "CONFIRMED"}
        }))
        .unwrap();
        let first = event.dedup_id();
        assert!(first.starts_with("derived_"));
        assert_eq!(first, event.clone().dedup_id());

        let mut other = event;
        other.event = "PAYMENT_RECEIVED".to_string();
        assert_ne!(first, other.dedup_id());
    }
}
