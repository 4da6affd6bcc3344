use crate::errors::AppError;
use crate::models::*;
use crate::store::{next_balance, OrderStore};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client as HttpClient, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use std::time::Duration;
use uuid::Uuid;

/// Optimistic balance updates give up after this many lost races.
const MAX_BALANCE_RETRIES: usize = 5;

/// Supabase REST (PostgREST) implementation of [`OrderStore`].
///
/// Talks to `{base_url}/rest/v1/{table}` with the project key sent both as
/// `apikey` and as bearer token. Filters use PostgREST operators
/// (`col=eq.value`), and writes ask for `Prefer: return=representation`.
#[derive(Clone)]
pub struct PostgrestStore {
    client: HttpClient,
    rest_url: String,
    api_key: String,
}

type Filters<'a> = Vec<(&'a str, String)>;

impl PostgrestStore {
    pub fn new(base_url: &str, api_key: String) -> Result<Self, AppError> {
        let client = HttpClient::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(|e| {
                AppError::ExternalApiError(format!("Failed to create PostgREST client: {}", e))
            })?;

        Ok(Self {
            client,
            rest_url: format!("{}/rest/v1", base_url.trim_end_matches('/')),
            api_key,
        })
    }

    fn request(&self, method: Method, table: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, format!("{}/{}", self.rest_url, table))
            .header("apikey", &self.api_key)
            .header("Authorization", format!("Bearer {}", self.api_key))
    }

    async fn select<T: DeserializeOwned>(
        &self,
        table: &str,
        filters: Filters<'_>,
    ) -> Result<Vec<T>, AppError> {
        let mut query: Filters<'_> = vec![("select", "*".to_string())];
        query.extend(filters);

        let response = self
            .request(Method::GET, table)
            .query(&query)
            .send()
            .await
            .map_err(|e| AppError::ExternalApiError(format!("PostgREST request failed: {}", e)))?;

        parse_rows(table, response).await
    }

    async fn select_one<T: DeserializeOwned>(
        &self,
        table: &str,
        mut filters: Filters<'_>,
    ) -> Result<Option<T>, AppError> {
        filters.push(("limit", "1".to_string()));
        Ok(self.select(table, filters).await?.into_iter().next())
    }

    /// Inserts one row. Returns `None` when a unique constraint rejected it.
    async fn insert<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        table: &str,
        body: &B,
    ) -> Result<Option<T>, AppError> {
        let response = self
            .request(Method::POST, table)
            .header("Prefer", "return=representation")
            .json(body)
            .send()
            .await
            .map_err(|e| AppError::ExternalApiError(format!("PostgREST insert failed: {}", e)))?;

        if response.status() == StatusCode::CONFLICT {
            tracing::debug!("PostgREST insert into {} hit a unique constraint", table);
            return Ok(None);
        }

        let rows: Vec<T> = parse_rows(table, response).await?;
        rows.into_iter().next().map(Some).ok_or_else(|| {
            AppError::ExternalApiError(format!("PostgREST insert into {} returned no row", table))
        })
    }

    async fn update<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        table: &str,
        filters: Filters<'_>,
        body: &B,
    ) -> Result<Vec<T>, AppError> {
        let response = self
            .request(Method::PATCH, table)
            .header("Prefer", "return=representation")
            .query(&filters)
            .json(body)
            .send()
            .await
            .map_err(|e| AppError::ExternalApiError(format!("PostgREST update failed: {}", e)))?;

        parse_rows(table, response).await
    }
}

async fn parse_rows<T: DeserializeOwned>(
    table: &str,
    response: reqwest::Response,
) -> Result<Vec<T>, AppError> {
    if !response.status().is_success() {
        let status = response.status();
        let error_text = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        return Err(AppError::ExternalApiError(format!(
            "PostgREST {} returned {}: {}",
            table, status, error_text
        )));
    }

    response.json().await.map_err(|e| {
        AppError::ExternalApiError(format!("Failed to parse PostgREST {} rows: {}", table, e))
    })
}

fn eq(value: impl ToString) -> String {
    format!("eq.{}", value.to_string())
}

fn neq(value: impl ToString) -> String {
    format!("neq.{}", value.to_string())
}

/// PATCH body that leaves unset charge fields untouched.
fn payment_update_body(update: &OrderPaymentUpdate) -> serde_json::Value {
    let mut body = json!({ "status": update.status, "updated_at": Utc::now() });
    for (column, value) in [
        ("asaas_payment_id", &update.asaas_payment_id),
        ("pix_copy_paste", &update.pix_copy_paste),
        ("qr_code_image", &update.qr_code_image),
        ("invoice_url", &update.invoice_url),
    ] {
        if let Some(value) = value {
            body[column] = json!(value);
        }
    }
    body
}

#[async_trait]
impl OrderStore for PostgrestStore {
    async fn get_client(&self, id: Uuid) -> Result<Option<Client>, AppError> {
        self.select_one("clients", vec![("id", eq(id))]).await
    }

    async fn get_company(&self, id: Uuid) -> Result<Option<Company>, AppError> {
        self.select_one("companies", vec![("id", eq(id))]).await
    }

    async fn get_service(&self, id: Uuid) -> Result<Option<Service>, AppError> {
        self.select_one("services", vec![("id", eq(id))]).await
    }

    async fn find_order_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<ServiceOrder>, AppError> {
        self.select_one("service_orders", vec![("idempotency_key", eq(key))])
            .await
    }

    async fn get_order(&self, id: Uuid) -> Result<Option<ServiceOrder>, AppError> {
        self.select_one("service_orders", vec![("id", eq(id))]).await
    }

    async fn insert_order(&self, order: ServiceOrder) -> Result<InsertOutcome, AppError> {
        match self.insert("service_orders", &order).await? {
            Some(inserted) => Ok(InsertOutcome::Inserted(inserted)),
            None => {
                let existing = self
                    .find_order_by_idempotency_key(&order.idempotency_key)
                    .await?
                    .ok_or_else(|| {
                        AppError::InternalError(format!(
                            "Idempotency key {} conflicted but no order found",
                            order.idempotency_key
                        ))
                    })?;
                Ok(InsertOutcome::Existing(existing))
            }
        }
    }

    async fn update_order_payment(
        &self,
        id: Uuid,
        update: &OrderPaymentUpdate,
    ) -> Result<Option<ServiceOrder>, AppError> {
        let body = payment_update_body(update);
        let rows: Vec<ServiceOrder> = self
            .update("service_orders", vec![("id", eq(id))], &body)
            .await?;
        Ok(rows.into_iter().next())
    }

    async fn transition_order_status(
        &self,
        id: Uuid,
        from: &str,
        to: &str,
    ) -> Result<Option<ServiceOrder>, AppError> {
        let rows: Vec<ServiceOrder> = self
            .update(
                "service_orders",
                vec![("id", eq(id)), ("status", eq(from))],
                &json!({ "status": to, "updated_at": Utc::now() }),
            )
            .await?;
        Ok(rows.into_iter().next())
    }

    async fn update_order_status_by_payment_id(
        &self,
        payment_id: &str,
        status: &str,
    ) -> Result<Option<ServiceOrder>, AppError> {
        let rows: Vec<ServiceOrder> = self
            .update(
                "service_orders",
                vec![("asaas_payment_id", eq(payment_id))],
                &json!({ "status": status, "updated_at": Utc::now() }),
            )
            .await?;
        Ok(rows.into_iter().next())
    }

    async fn payment_event_exists(&self, event_id: &str) -> Result<bool, AppError> {
        let row: Option<serde_json::Value> = self
            .select_one("payment_webhook_events", vec![("event_id", eq(event_id))])
            .await?;
        Ok(row.is_some())
    }

    async fn record_payment_event(
        &self,
        event_id: &str,
        payment_id: Option<&str>,
        event: &str,
        payload: serde_json::Value,
    ) -> Result<bool, AppError> {
        let inserted: Option<serde_json::Value> = self
            .insert(
                "payment_webhook_events",
                &json!({
                    "event_id": event_id,
                    "payment_id": payment_id,
                    "event": event,
                    "payload": payload,
                    "received_at": Utc::now(),
                }),
            )
            .await?;
        Ok(inserted.is_some())
    }

    async fn list_credit_packages(&self) -> Result<Vec<CreditPackage>, AppError> {
        self.select(
            "credit_packages",
            vec![("active", eq(true)), ("order", "price.asc".to_string())],
        )
        .await
    }

    async fn get_credit_package(&self, id: Uuid) -> Result<Option<CreditPackage>, AppError> {
        self.select_one("credit_packages", vec![("id", eq(id))]).await
    }

    async fn get_credit_account(
        &self,
        owner_type: OwnerType,
        owner_id: Uuid,
    ) -> Result<Option<CreditAccount>, AppError> {
        self.select_one(
            "credits",
            vec![
                ("owner_type", eq(owner_type.as_str())),
                ("owner_id", eq(owner_id)),
            ],
        )
        .await
    }

    async fn list_credit_transactions(
        &self,
        owner_type: OwnerType,
        owner_id: Uuid,
        limit: i64,
    ) -> Result<Vec<CreditTransaction>, AppError> {
        self.select(
            "credit_transactions",
            vec![
                ("owner_type", eq(owner_type.as_str())),
                ("owner_id", eq(owner_id)),
                ("order", "created_at.desc".to_string()),
                ("limit", limit.to_string()),
            ],
        )
        .await
    }

    /// PostgREST has no multi-statement transactions, so the balance is moved
    /// with a compare-and-set on the previous balance and retried on a lost
    /// race. The ledger row is written after the balance moved.
    async fn apply_credit(&self, mutation: CreditMutation) -> Result<CreditTransaction, AppError> {
        for attempt in 1..=MAX_BALANCE_RETRIES {
            let account = match self
                .get_credit_account(mutation.owner_type, mutation.owner_id)
                .await?
            {
                Some(account) => account,
                None => {
                    let created: Option<CreditAccount> = self
                        .insert(
                            "credits",
                            &CreditAccount {
                                id: Uuid::new_v4(),
                                owner_type: mutation.owner_type,
                                owner_id: mutation.owner_id,
                                balance: 0,
                                updated_at: Utc::now(),
                            },
                        )
                        .await?;
                    match created {
                        Some(account) => account,
                        // Created concurrently; read it on the next attempt.
                        None => continue,
                    }
                }
            };

            let balance_after = next_balance(account.balance, mutation.delta)?;
            let moved: Vec<CreditAccount> = self
                .update(
                    "credits",
                    vec![
                        ("id", eq(account.id)),
                        ("balance", eq(account.balance)),
                    ],
                    &json!({ "balance": balance_after, "updated_at": Utc::now() }),
                )
                .await?;

            if moved.is_empty() {
                tracing::debug!(
                    "Credit balance for {} {} changed concurrently (attempt {})",
                    mutation.owner_type.as_str(),
                    mutation.owner_id,
                    attempt
                );
                continue;
            }

            let transaction = CreditTransaction {
                id: Uuid::new_v4(),
                credit_id: account.id,
                owner_type: mutation.owner_type,
                owner_id: mutation.owner_id,
                transaction_type: mutation.transaction_type,
                amount: mutation.delta.abs(),
                balance_before: account.balance,
                balance_after,
                description: mutation.description.clone(),
                reference_id: mutation.reference_id.clone(),
                created_at: Utc::now(),
            };

            return self
                .insert("credit_transactions", &transaction)
                .await?
                .ok_or_else(|| {
                    AppError::InternalError(format!(
                        "Credit transaction {} rejected as duplicate",
                        transaction.id
                    ))
                });
        }

        Err(AppError::Conflict(format!(
            "Credit balance for {} {} kept changing, try again",
            mutation.owner_type.as_str(),
            mutation.owner_id
        )))
    }

    async fn insert_credit_purchase(
        &self,
        purchase: CreditPurchase,
    ) -> Result<CreditPurchase, AppError> {
        self.insert("credit_purchases", &purchase)
            .await?
            .ok_or_else(|| {
                AppError::InternalError(format!(
                    "Credit purchase {} rejected as duplicate",
                    purchase.id
                ))
            })
    }

    async fn get_credit_purchase(&self, id: Uuid) -> Result<Option<CreditPurchase>, AppError> {
        self.select_one("credit_purchases", vec![("id", eq(id))]).await
    }

    async fn update_credit_purchase_payment(
        &self,
        id: Uuid,
        update: &OrderPaymentUpdate,
    ) -> Result<Option<CreditPurchase>, AppError> {
        let rows: Vec<CreditPurchase> = self
            .update(
                "credit_purchases",
                vec![("id", eq(id))],
                &payment_update_body(update),
            )
            .await?;
        Ok(rows.into_iter().next())
    }

    /// Claims the purchase with a compare-and-set on its status, then grants
    /// the credits. The claim is undone if the grant fails so a redelivered
    /// confirmation can settle it.
    async fn settle_credit_purchase(
        &self,
        payment_id: &str,
    ) -> Result<Option<CreditTransaction>, AppError> {
        let purchase: Option<CreditPurchase> = self
            .select_one(
                "credit_purchases",
                vec![
                    ("asaas_payment_id", eq(payment_id)),
                    ("status", neq(STATUS_PAID)),
                ],
            )
            .await?;
        let Some(purchase) = purchase else {
            return Ok(None);
        };

        let claimed: Vec<CreditPurchase> = self
            .update(
                "credit_purchases",
                vec![("id", eq(purchase.id)), ("status", eq(&purchase.status))],
                &json!({ "status": STATUS_PAID, "updated_at": Utc::now() }),
            )
            .await?;
        if claimed.is_empty() {
            tracing::debug!("Credit purchase {} settled concurrently", purchase.id);
            return Ok(None);
        }

        match self.apply_credit(purchase.credit_mutation()).await {
            Ok(transaction) => Ok(Some(transaction)),
            Err(e) => {
                let reverted: Result<Vec<CreditPurchase>, AppError> = self
                    .update(
                        "credit_purchases",
                        vec![("id", eq(purchase.id)), ("status", eq(STATUS_PAID))],
                        &json!({ "status": purchase.status, "updated_at": Utc::now() }),
                    )
                    .await;
                if let Err(revert_err) = reverted {
                    tracing::error!(
                        "Credit purchase {} is marked paid without credits: {}",
                        purchase.id,
                        revert_err
                    );
                }
                Err(e)
            }
        }
    }
}
