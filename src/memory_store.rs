use crate::errors::AppError;
use crate::models::*;
use crate::store::{next_balance, OrderStore};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Writes a test can make fail once with [`MemoryStore::fail_once`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailPoint {
    InsertOrder,
    UpdateOrderPayment,
    UpdateOrderStatus,
    RecordPaymentEvent,
}

#[derive(Default)]
struct Tables {
    clients: HashMap<Uuid, Client>,
    companies: HashMap<Uuid, Company>,
    services: HashMap<Uuid, Service>,
    orders: HashMap<Uuid, ServiceOrder>,
    payment_events: HashMap<String, serde_json::Value>,
    packages: HashMap<Uuid, CreditPackage>,
    accounts: HashMap<(OwnerType, Uuid), CreditAccount>,
    transactions: Vec<CreditTransaction>,
    purchases: HashMap<Uuid, CreditPurchase>,
    failures: HashSet<FailPoint>,
}

impl Tables {
    fn take_failure(&mut self, point: FailPoint) -> Result<(), AppError> {
        if self.failures.remove(&point) {
            return Err(AppError::ExternalApiError(format!(
                "store unavailable during {:?}",
                point
            )));
        }
        Ok(())
    }

    fn apply_credit(&mut self, mutation: CreditMutation) -> Result<CreditTransaction, AppError> {
        let key = (mutation.owner_type, mutation.owner_id);

        let (credit_id, balance_before) = match self.accounts.get(&key) {
            Some(account) => (account.id, account.balance),
            None => (Uuid::new_v4(), 0),
        };
        let balance_after = next_balance(balance_before, mutation.delta)?;
        let now = Utc::now();

        self.accounts.insert(
            key,
            CreditAccount {
                id: credit_id,
                owner_type: mutation.owner_type,
                owner_id: mutation.owner_id,
                balance: balance_after,
                updated_at: now,
            },
        );

        let transaction = CreditTransaction {
            id: Uuid::new_v4(),
            credit_id,
            owner_type: mutation.owner_type,
            owner_id: mutation.owner_id,
            transaction_type: mutation.transaction_type,
            amount: mutation.delta.abs(),
            balance_before,
            balance_after,
            description: mutation.description,
            reference_id: mutation.reference_id,
            created_at: now,
        };
        self.transactions.push(transaction.clone());
        Ok(transaction)
    }
}

fn apply_payment_update(
    status: &mut String,
    fields: [&mut Option<String>; 4],
    update: &OrderPaymentUpdate,
) {
    *status = update.status.clone();
    let [payment_id, pix_copy_paste, qr_code_image, invoice_url] = fields;
    for (slot, value) in [
        (payment_id, &update.asaas_payment_id),
        (pix_copy_paste, &update.pix_copy_paste),
        (qr_code_image, &update.qr_code_image),
        (invoice_url, &update.invoice_url),
    ] {
        if value.is_some() {
            *slot = value.clone();
        }
    }
}

/// A thread-safe in-memory store.
///
/// Backs the automated tests in place of Supabase; one lock guards all
/// tables so multi-table writes are atomic.
#[derive(Default, Clone)]
pub struct MemoryStore {
    tables: Arc<RwLock<Tables>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put_client(&self, client: Client) {
        self.tables.write().await.clients.insert(client.id, client);
    }

    pub async fn put_company(&self, company: Company) {
        self.tables.write().await.companies.insert(company.id, company);
    }

    pub async fn put_service(&self, service: Service) {
        self.tables.write().await.services.insert(service.id, service);
    }

    pub async fn put_credit_package(&self, package: CreditPackage) {
        self.tables.write().await.packages.insert(package.id, package);
    }

    pub async fn order_count(&self) -> usize {
        self.tables.read().await.orders.len()
    }

    /// Makes the next call through `point` fail with a store error.
    pub async fn fail_once(&self, point: FailPoint) {
        self.tables.write().await.failures.insert(point);
    }
}

#[async_trait]
impl OrderStore for MemoryStore {
    async fn get_client(&self, id: Uuid) -> Result<Option<Client>, AppError> {
        Ok(self.tables.read().await.clients.get(&id).cloned())
    }

    async fn get_company(&self, id: Uuid) -> Result<Option<Company>, AppError> {
        Ok(self.tables.read().await.companies.get(&id).cloned())
    }

    async fn get_service(&self, id: Uuid) -> Result<Option<Service>, AppError> {
        Ok(self.tables.read().await.services.get(&id).cloned())
    }

    async fn find_order_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<ServiceOrder>, AppError> {
        let tables = self.tables.read().await;
        Ok(tables
            .orders
            .values()
            .find(|o| o.idempotency_key == key)
            .cloned())
    }

    async fn get_order(&self, id: Uuid) -> Result<Option<ServiceOrder>, AppError> {
        Ok(self.tables.read().await.orders.get(&id).cloned())
    }

    async fn insert_order(&self, order: ServiceOrder) -> Result<InsertOutcome, AppError> {
        let mut tables = self.tables.write().await;
        tables.take_failure(FailPoint::InsertOrder)?;
        if let Some(existing) = tables
            .orders
            .values()
            .find(|o| o.idempotency_key == order.idempotency_key)
        {
            return Ok(InsertOutcome::Existing(existing.clone()));
        }
        tables.orders.insert(order.id, order.clone());
        Ok(InsertOutcome::Inserted(order))
    }

    async fn update_order_payment(
        &self,
        id: Uuid,
        update: &OrderPaymentUpdate,
    ) -> Result<Option<ServiceOrder>, AppError> {
        let mut tables = self.tables.write().await;
        tables.take_failure(FailPoint::UpdateOrderPayment)?;
        Ok(tables.orders.get_mut(&id).map(|order| {
            apply_payment_update(
                &mut order.status,
                [
                    &mut order.asaas_payment_id,
                    &mut order.pix_copy_paste,
                    &mut order.qr_code_image,
                    &mut order.invoice_url,
                ],
                update,
            );
            order.updated_at = Utc::now();
            order.clone()
        }))
    }

    async fn transition_order_status(
        &self,
        id: Uuid,
        from: &str,
        to: &str,
    ) -> Result<Option<ServiceOrder>, AppError> {
        let mut tables = self.tables.write().await;
        Ok(tables
            .orders
            .get_mut(&id)
            .filter(|order| order.status == from)
            .map(|order| {
                order.status = to.to_string();
                order.updated_at = Utc::now();
                order.clone()
            }))
    }

    async fn update_order_status_by_payment_id(
        &self,
        payment_id: &str,
        status: &str,
    ) -> Result<Option<ServiceOrder>, AppError> {
        let mut tables = self.tables.write().await;
        tables.take_failure(FailPoint::UpdateOrderStatus)?;
        Ok(tables
            .orders
            .values_mut()
            .find(|o| o.asaas_payment_id.as_deref() == Some(payment_id))
            .map(|order| {
                order.status = status.to_string();
                order.updated_at = Utc::now();
                order.clone()
            }))
    }

    async fn payment_event_exists(&self, event_id: &str) -> Result<bool, AppError> {
        Ok(self
            .tables
            .read()
            .await
            .payment_events
            .contains_key(event_id))
    }

    async fn record_payment_event(
        &self,
        event_id: &str,
        _payment_id: Option<&str>,
        _event: &str,
        payload: serde_json::Value,
    ) -> Result<bool, AppError> {
        let mut tables = self.tables.write().await;
        tables.take_failure(FailPoint::RecordPaymentEvent)?;
        if tables.payment_events.contains_key(event_id) {
            return Ok(false);
        }
        tables.payment_events.insert(event_id.to_string(), payload);
        Ok(true)
    }

    async fn list_credit_packages(&self) -> Result<Vec<CreditPackage>, AppError> {
        let tables = self.tables.read().await;
        let mut packages: Vec<CreditPackage> = tables
            .packages
            .values()
            .filter(|p| p.active)
            .cloned()
            .collect();
        packages.sort_by_key(|p| p.price);
        Ok(packages)
    }

    async fn get_credit_package(&self, id: Uuid) -> Result<Option<CreditPackage>, AppError> {
        Ok(self.tables.read().await.packages.get(&id).cloned())
    }

    async fn get_credit_account(
        &self,
        owner_type: OwnerType,
        owner_id: Uuid,
    ) -> Result<Option<CreditAccount>, AppError> {
        Ok(self
            .tables
            .read()
            .await
            .accounts
            .get(&(owner_type, owner_id))
            .cloned())
    }

    async fn list_credit_transactions(
        &self,
        owner_type: OwnerType,
        owner_id: Uuid,
        limit: i64,
    ) -> Result<Vec<CreditTransaction>, AppError> {
        let tables = self.tables.read().await;
        Ok(tables
            .transactions
            .iter()
            .rev()
            .filter(|t| t.owner_type == owner_type && t.owner_id == owner_id)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn apply_credit(&self, mutation: CreditMutation) -> Result<CreditTransaction, AppError> {
        self.tables.write().await.apply_credit(mutation)
    }

    async fn insert_credit_purchase(
        &self,
        purchase: CreditPurchase,
    ) -> Result<CreditPurchase, AppError> {
        self.tables
            .write()
            .await
            .purchases
            .insert(purchase.id, purchase.clone());
        Ok(purchase)
    }

    async fn get_credit_purchase(&self, id: Uuid) -> Result<Option<CreditPurchase>, AppError> {
        Ok(self.tables.read().await.purchases.get(&id).cloned())
    }

    async fn update_credit_purchase_payment(
        &self,
        id: Uuid,
        update: &OrderPaymentUpdate,
    ) -> Result<Option<CreditPurchase>, AppError> {
        let mut tables = self.tables.write().await;
        Ok(tables.purchases.get_mut(&id).map(|purchase| {
            apply_payment_update(
                &mut purchase.status,
                [
                    &mut purchase.asaas_payment_id,
                    &mut purchase.pix_copy_paste,
                    &mut purchase.qr_code_image,
                    &mut purchase.invoice_url,
                ],
                update,
            );
            purchase.updated_at = Utc::now();
            purchase.clone()
        }))
    }

    async fn settle_credit_purchase(
        &self,
        payment_id: &str,
    ) -> Result<Option<CreditTransaction>, AppError> {
        let mut tables = self.tables.write().await;
        let Some(purchase) = tables
            .purchases
            .values()
            .find(|p| p.asaas_payment_id.as_deref() == Some(payment_id) && p.status != STATUS_PAID)
            .cloned()
        else {
            return Ok(None);
        };

        let transaction = tables.apply_credit(purchase.credit_mutation())?;
        if let Some(stored) = tables.purchases.get_mut(&purchase.id) {
            stored.status = STATUS_PAID.to_string();
            stored.updated_at = Utc::now();
        }
        Ok(Some(transaction))
    }
}
