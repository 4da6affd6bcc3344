//! Storage port for the relational store.
//!
//! Production runs against Supabase, either over its REST layer
//! ([`crate::postgrest::PostgrestStore`]) or a direct Postgres connection
//! ([`crate::pg_store::PgStore`]). Tests use [`crate::memory_store::MemoryStore`].

use crate::errors::AppError;
use crate::models::*;
use async_trait::async_trait;
use uuid::Uuid;

#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn get_client(&self, id: Uuid) -> Result<Option<Client>, AppError>;
    async fn get_company(&self, id: Uuid) -> Result<Option<Company>, AppError>;
    async fn get_service(&self, id: Uuid) -> Result<Option<Service>, AppError>;

    async fn find_order_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<ServiceOrder>, AppError>;
    async fn get_order(&self, id: Uuid) -> Result<Option<ServiceOrder>, AppError>;

    /// Inserts unless another order already holds `order.idempotency_key`.
    async fn insert_order(&self, order: ServiceOrder) -> Result<InsertOutcome, AppError>;

    /// Sets the status and fills charge fields that are provided.
    async fn update_order_payment(
        &self,
        id: Uuid,
        update: &OrderPaymentUpdate,
    ) -> Result<Option<ServiceOrder>, AppError>;

    /// Moves an order from `from` to `to`. Returns `None` when the order is
    /// no longer in `from`.
    async fn transition_order_status(
        &self,
        id: Uuid,
        from: &str,
        to: &str,
    ) -> Result<Option<ServiceOrder>, AppError>;

    async fn update_order_status_by_payment_id(
        &self,
        payment_id: &str,
        status: &str,
    ) -> Result<Option<ServiceOrder>, AppError>;

    async fn payment_event_exists(&self, event_id: &str) -> Result<bool, AppError>;

    /// Records a gateway webhook event. Returns `false` if it was seen before.
    async fn record_payment_event(
        &self,
        event_id: &str,
        payment_id: Option<&str>,
        event: &str,
        payload: serde_json::Value,
    ) -> Result<bool, AppError>;

    async fn list_credit_packages(&self) -> Result<Vec<CreditPackage>, AppError>;
    async fn get_credit_package(&self, id: Uuid) -> Result<Option<CreditPackage>, AppError>;
    async fn get_credit_account(
        &self,
        owner_type: OwnerType,
        owner_id: Uuid,
    ) -> Result<Option<CreditAccount>, AppError>;
    async fn list_credit_transactions(
        &self,
        owner_type: OwnerType,
        owner_id: Uuid,
        limit: i64,
    ) -> Result<Vec<CreditTransaction>, AppError>;

    /// Applies a balance change and writes its ledger row as one unit.
    ///
    /// Creates the account on first purchase. Fails with
    /// `AppError::InsufficientCredits` when the balance would go negative.
    async fn apply_credit(&self, mutation: CreditMutation) -> Result<CreditTransaction, AppError>;

    async fn insert_credit_purchase(
        &self,
        purchase: CreditPurchase,
    ) -> Result<CreditPurchase, AppError>;
    async fn get_credit_purchase(&self, id: Uuid) -> Result<Option<CreditPurchase>, AppError>;
    async fn update_credit_purchase_payment(
        &self,
        id: Uuid,
        update: &OrderPaymentUpdate,
    ) -> Result<Option<CreditPurchase>, AppError>;

    /// Marks the unpaid purchase charged as `payment_id` as paid and grants
    /// its credits, as one unit.
    ///
    /// Returns `None` when no unpaid purchase matches, so a repeated
    /// confirmation never grants twice.
    async fn settle_credit_purchase(
        &self,
        payment_id: &str,
    ) -> Result<Option<CreditTransaction>, AppError>;
}

/// Ledger arithmetic shared by every store.
pub fn next_balance(balance: i64, delta: i64) -> Result<i64, AppError> {
    let next = balance.checked_add(delta).ok_or_else(|| {
        AppError::BadRequest(format!("credit amount {} overflows balance", delta))
    })?;
    if next < 0 {
        return Err(AppError::InsufficientCredits {
            balance,
            requested: -delta,
        });
    }
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_balance() {
        assert_eq!(next_balance(10, 5).unwrap(), 15);
        assert_eq!(next_balance(10, -10).unwrap(), 0);
        match next_balance(3, -5) {
            Err(AppError::InsufficientCredits { balance, requested }) => {
                assert_eq!(balance, 3);
                assert_eq!(requested, 5);
            }
            other => panic!("expected insufficient credits, got {:?}", other),
        }
        assert!(next_balance(i64::MAX, 1).is_err());
    }
}
