use crate::errors::{AppError, ResultExt};
use crate::models::*;
use crate::money::Cents;
use crate::split::SplitEntry;
use crate::store::{next_balance, OrderStore};
use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

/// Direct Postgres implementation of [`OrderStore`].
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct ClientRow {
    id: Uuid,
    company_id: Option<Uuid>,
    name: String,
    cpf_cnpj: Option<String>,
    email: Option<String>,
    phone: Option<String>,
    data_nascimento: Option<NaiveDate>,
}

impl From<ClientRow> for Client {
    fn from(row: ClientRow) -> Self {
        Client {
            id: row.id,
            company_id: row.company_id,
            name: row.name,
            cpf_cnpj: row.cpf_cnpj,
            email: row.email,
            phone: row.phone,
            birth_date: row.data_nascimento,
        }
    }
}

#[derive(sqlx::FromRow)]
struct ServiceRow {
    id: Uuid,
    name: String,
    category: Option<String>,
    base_price: Option<BigDecimal>,
    operator_price: Option<BigDecimal>,
    reseller_price: Option<BigDecimal>,
    active: bool,
}

fn cents_or_zero(value: Option<BigDecimal>) -> Result<Cents, AppError> {
    match value {
        Some(v) => Cents::try_from(&v),
        None => Ok(Cents::ZERO),
    }
}

impl TryFrom<ServiceRow> for Service {
    type Error = AppError;

    fn try_from(row: ServiceRow) -> Result<Self, Self::Error> {
        Ok(Service {
            id: row.id,
            name: row.name,
            category: row.category,
            base_price: cents_or_zero(row.base_price)?,
            operator_price: cents_or_zero(row.operator_price)?,
            reseller_price: cents_or_zero(row.reseller_price)?,
            active: row.active,
        })
    }
}

#[derive(sqlx::FromRow)]
struct OrderRow {
    id: Uuid,
    idempotency_key: String,
    request_fingerprint: String,
    client_id: Uuid,
    service_id: Uuid,
    company_id: Uuid,
    amount: BigDecimal,
    status: String,
    asaas_payment_id: Option<String>,
    pix_copy_paste: Option<String>,
    qr_code_image: Option<String>,
    invoice_url: Option<String>,
    split: serde_json::Value,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<OrderRow> for ServiceOrder {
    type Error = AppError;

    fn try_from(row: OrderRow) -> Result<Self, Self::Error> {
        let split: Vec<SplitEntry> = serde_json::from_value(row.split).map_err(|e| {
            AppError::InternalError(format!("Corrupt split on order {}: {}", row.id, e))
        })?;
        Ok(ServiceOrder {
            id: row.id,
            idempotency_key: row.idempotency_key,
            request_fingerprint: row.request_fingerprint,
            client_id: row.client_id,
            service_id: row.service_id,
            company_id: row.company_id,
            amount: Cents::try_from(&row.amount)?,
            status: row.status,
            asaas_payment_id: row.asaas_payment_id,
            pix_copy_paste: row.pix_copy_paste,
            qr_code_image: row.qr_code_image,
            invoice_url: row.invoice_url,
            split,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct PackageRow {
    id: Uuid,
    name: String,
    credits: i64,
    price: BigDecimal,
    active: bool,
}

impl TryFrom<PackageRow> for CreditPackage {
    type Error = AppError;

    fn try_from(row: PackageRow) -> Result<Self, Self::Error> {
        Ok(CreditPackage {
            id: row.id,
            name: row.name,
            credits: row.credits,
            price: Cents::try_from(&row.price)?,
            active: row.active,
        })
    }
}

#[derive(sqlx::FromRow)]
struct AccountRow {
    id: Uuid,
    owner_type: String,
    owner_id: Uuid,
    balance: i64,
    updated_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct TransactionRow {
    id: Uuid,
    credit_id: Uuid,
    owner_type: String,
    owner_id: Uuid,
    transaction_type: String,
    amount: i64,
    balance_before: i64,
    balance_after: i64,
    description: Option<String>,
    reference_id: Option<String>,
    created_at: DateTime<Utc>,
}

fn owner_type_column(raw: &str) -> Result<OwnerType, AppError> {
    OwnerType::parse(raw)
        .ok_or_else(|| AppError::InternalError(format!("Unknown credit owner_type '{}'", raw)))
}

impl TryFrom<TransactionRow> for CreditTransaction {
    type Error = AppError;

    fn try_from(row: TransactionRow) -> Result<Self, Self::Error> {
        Ok(CreditTransaction {
            id: row.id,
            credit_id: row.credit_id,
            owner_type: owner_type_column(&row.owner_type)?,
            owner_id: row.owner_id,
            transaction_type: CreditTransactionType::parse(&row.transaction_type).ok_or_else(
                || {
                    AppError::InternalError(format!(
                        "Unknown credit transaction_type '{}'",
                        row.transaction_type
                    ))
                },
            )?,
            amount: row.amount,
            balance_before: row.balance_before,
            balance_after: row.balance_after,
            description: row.description,
            reference_id: row.reference_id,
            created_at: row.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct PurchaseRow {
    id: Uuid,
    owner_type: String,
    owner_id: Uuid,
    package_id: Uuid,
    credits: i64,
    amount: BigDecimal,
    status: String,
    asaas_payment_id: Option<String>,
    pix_copy_paste: Option<String>,
    qr_code_image: Option<String>,
    invoice_url: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<PurchaseRow> for CreditPurchase {
    type Error = AppError;

    fn try_from(row: PurchaseRow) -> Result<Self, Self::Error> {
        Ok(CreditPurchase {
            id: row.id,
            owner_type: owner_type_column(&row.owner_type)?,
            owner_id: row.owner_id,
            package_id: row.package_id,
            credits: row.credits,
            amount: Cents::try_from(&row.amount)?,
            status: row.status,
            asaas_payment_id: row.asaas_payment_id,
            pix_copy_paste: row.pix_copy_paste,
            qr_code_image: row.qr_code_image,
            invoice_url: row.invoice_url,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

const PURCHASE_COLUMNS: &str = "id, owner_type, owner_id, package_id, credits, amount, status, \
     asaas_payment_id, pix_copy_paste, qr_code_image, invoice_url, created_at, updated_at";

const ORDER_COLUMNS: &str = "id, idempotency_key, request_fingerprint, client_id, service_id, \
     company_id, amount, status, asaas_payment_id, pix_copy_paste, qr_code_image, invoice_url, \
     split, created_at, updated_at";

#[async_trait]
impl OrderStore for PgStore {
    async fn get_client(&self, id: Uuid) -> Result<Option<Client>, AppError> {
        let row = sqlx::query_as::<_, ClientRow>(
            "SELECT id, company_id, name, cpf_cnpj, email, phone, data_nascimento \
             FROM clients WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("fetching client")?;

        Ok(row.map(Client::from))
    }

    async fn get_company(&self, id: Uuid) -> Result<Option<Company>, AppError> {
        let row = sqlx::query_as::<
            _,
            (
                Uuid,
                String,
                Option<String>,
                Option<String>,
                Option<String>,
                Option<String>,
                Option<String>,
            ),
        >(
            "SELECT id, name, cnpj, asaas_wallet_id, wallet_id, reseller_wallet_id, subaccount_status \
             FROM companies WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("fetching company")?;

        Ok(row.map(
            |(id, name, cnpj, asaas_wallet_id, wallet_id, reseller_wallet_id, subaccount_status)| {
                Company {
                    id,
                    name,
                    cnpj,
                    asaas_wallet_id,
                    wallet_id,
                    reseller_wallet_id,
                    subaccount_status,
                }
            },
        ))
    }

    async fn get_service(&self, id: Uuid) -> Result<Option<Service>, AppError> {
        let row = sqlx::query_as::<_, ServiceRow>(
            "SELECT id, name, category, base_price, operator_price, reseller_price, active \
             FROM services WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("fetching service")?;

        row.map(Service::try_from).transpose()
    }

    async fn find_order_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<ServiceOrder>, AppError> {
        let row = sqlx::query_as::<_, OrderRow>(&format!(
            "SELECT {} FROM service_orders WHERE idempotency_key = $1",
            ORDER_COLUMNS
        ))
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .context("fetching order by idempotency key")?;

        row.map(ServiceOrder::try_from).transpose()
    }

    async fn get_order(&self, id: Uuid) -> Result<Option<ServiceOrder>, AppError> {
        let row = sqlx::query_as::<_, OrderRow>(&format!(
            "SELECT {} FROM service_orders WHERE id = $1",
            ORDER_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("fetching order")?;

        row.map(ServiceOrder::try_from).transpose()
    }

    async fn insert_order(&self, order: ServiceOrder) -> Result<InsertOutcome, AppError> {
        let split = serde_json::to_value(&order.split)
            .map_err(|e| AppError::InternalError(format!("Failed to serialize split: {}", e)))?;

        let inserted = sqlx::query_as::<_, OrderRow>(&format!(
            r#"
            INSERT INTO service_orders ({cols})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            ON CONFLICT (idempotency_key) DO NOTHING
            RETURNING {cols}
            "#,
            cols = ORDER_COLUMNS
        ))
        .bind(order.id)
        .bind(&order.idempotency_key)
        .bind(&order.request_fingerprint)
        .bind(order.client_id)
        .bind(order.service_id)
        .bind(order.company_id)
        .bind(order.amount.to_decimal())
        .bind(&order.status)
        .bind(&order.asaas_payment_id)
        .bind(&order.pix_copy_paste)
        .bind(&order.qr_code_image)
        .bind(&order.invoice_url)
        .bind(split)
        .bind(order.created_at)
        .bind(order.updated_at)
        .fetch_optional(&self.pool)
        .await
        .context("inserting service order")?;

        match inserted {
            Some(row) => Ok(InsertOutcome::Inserted(ServiceOrder::try_from(row)?)),
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
        let row = sqlx::query_as::<_, OrderRow>(&format!(
            r#"
            UPDATE service_orders
            SET status = $2,
                asaas_payment_id = COALESCE($3, asaas_payment_id),
                pix_copy_paste = COALESCE($4, pix_copy_paste),
                qr_code_image = COALESCE($5, qr_code_image),
                invoice_url = COALESCE($6, invoice_url),
                updated_at = now()
            WHERE id = $1
            RETURNING {}
            "#,
            ORDER_COLUMNS
        ))
        .bind(id)
        .bind(&update.status)
        .bind(&update.asaas_payment_id)
        .bind(&update.pix_copy_paste)
        .bind(&update.qr_code_image)
        .bind(&update.invoice_url)
        .fetch_optional(&self.pool)
        .await
        .context("updating order payment")?;

        row.map(ServiceOrder::try_from).transpose()
    }

    async fn transition_order_status(
        &self,
        id: Uuid,
        from: &str,
        to: &str,
    ) -> Result<Option<ServiceOrder>, AppError> {
        let row = sqlx::query_as::<_, OrderRow>(&format!(
            "UPDATE service_orders SET status = $3, updated_at = now() \
             WHERE id = $1 AND status = $2 RETURNING {}",
            ORDER_COLUMNS
        ))
        .bind(id)
        .bind(from)
        .bind(to)
        .fetch_optional(&self.pool)
        .await
        .context("transitioning order status")?;

        row.map(ServiceOrder::try_from).transpose()
    }

    async fn update_order_status_by_payment_id(
        &self,
        payment_id: &str,
        status: &str,
    ) -> Result<Option<ServiceOrder>, AppError> {
        let row = sqlx::query_as::<_, OrderRow>(&format!(
            "UPDATE service_orders SET status = $2, updated_at = now() \
             WHERE asaas_payment_id = $1 RETURNING {}",
            ORDER_COLUMNS
        ))
        .bind(payment_id)
        .bind(status)
        .fetch_optional(&self.pool)
        .await
        .context("updating order status by payment id")?;

        row.map(ServiceOrder::try_from).transpose()
    }

    async fn payment_event_exists(&self, event_id: &str) -> Result<bool, AppError> {
        let (exists,): (bool,) = sqlx::query_as(
            "SELECT EXISTS (SELECT 1 FROM payment_webhook_events WHERE event_id = $1)",
        )
        .bind(event_id)
        .fetch_one(&self.pool)
        .await
        .context("checking payment webhook event")?;

        Ok(exists)
    }

    async fn record_payment_event(
        &self,
        event_id: &str,
        payment_id: Option<&str>,
        event: &str,
        payload: serde_json::Value,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            INSERT INTO payment_webhook_events (event_id, payment_id, event, payload, received_at)
            VALUES ($1, $2, $3, $4, now())
            ON CONFLICT (event_id) DO NOTHING
            "#,
        )
        .bind(event_id)
        .bind(payment_id)
        .bind(event)
        .bind(payload)
        .execute(&self.pool)
        .await
        .context("recording payment webhook event")?;

        Ok(result.rows_affected() == 1)
    }

    async fn list_credit_packages(&self) -> Result<Vec<CreditPackage>, AppError> {
        let rows = sqlx::query_as::<_, PackageRow>(
            "SELECT id, name, credits, price, active FROM credit_packages \
             WHERE active = true ORDER BY price ASC",
        )
        .fetch_all(&self.pool)
        .await
        .context("listing credit packages")?;

        rows.into_iter().map(CreditPackage::try_from).collect()
    }

    async fn get_credit_package(&self, id: Uuid) -> Result<Option<CreditPackage>, AppError> {
        let row = sqlx::query_as::<_, PackageRow>(
            "SELECT id, name, credits, price, active FROM credit_packages WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("fetching credit package")?;

        row.map(CreditPackage::try_from).transpose()
    }

    async fn get_credit_account(
        &self,
        owner_type: OwnerType,
        owner_id: Uuid,
    ) -> Result<Option<CreditAccount>, AppError> {
        let row = sqlx::query_as::<_, AccountRow>(
            "SELECT id, owner_type, owner_id, balance, updated_at FROM credits \
             WHERE owner_type = $1 AND owner_id = $2",
        )
        .bind(owner_type.as_str())
        .bind(owner_id)
        .fetch_optional(&self.pool)
        .await
        .context("fetching credit account")?;

        row.map(|r| {
            Ok(CreditAccount {
                id: r.id,
                owner_type: owner_type_column(&r.owner_type)?,
                owner_id: r.owner_id,
                balance: r.balance,
                updated_at: r.updated_at,
            })
        })
        .transpose()
    }

    async fn list_credit_transactions(
        &self,
        owner_type: OwnerType,
        owner_id: Uuid,
        limit: i64,
    ) -> Result<Vec<CreditTransaction>, AppError> {
        let rows = sqlx::query_as::<_, TransactionRow>(
            r#"
            SELECT id, credit_id, owner_type, owner_id, transaction_type, amount,
                   balance_before, balance_after, description, reference_id, created_at
            FROM credit_transactions
            WHERE owner_type = $1 AND owner_id = $2
            ORDER BY created_at DESC
            LIMIT $3
            "#,
        )
        .bind(owner_type.as_str())
        .bind(owner_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("listing credit transactions")?;

        rows.into_iter().map(CreditTransaction::try_from).collect()
    }

    async fn apply_credit(&self, mutation: CreditMutation) -> Result<CreditTransaction, AppError> {
        let mut tx = self.pool.begin().await.context("starting credit transaction")?;
        let transaction = apply_credit_in(&mut *tx, &mutation).await?;
        tx.commit().await.context("committing credit transaction")?;
        Ok(transaction)
    }

    async fn insert_credit_purchase(
        &self,
        purchase: CreditPurchase,
    ) -> Result<CreditPurchase, AppError> {
        let row = sqlx::query_as::<_, PurchaseRow>(&format!(
            r#"
            INSERT INTO credit_purchases ({cols})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            RETURNING {cols}
            "#,
            cols = PURCHASE_COLUMNS
        ))
        .bind(purchase.id)
        .bind(purchase.owner_type.as_str())
        .bind(purchase.owner_id)
        .bind(purchase.package_id)
        .bind(purchase.credits)
        .bind(purchase.amount.to_decimal())
        .bind(&purchase.status)
        .bind(&purchase.asaas_payment_id)
        .bind(&purchase.pix_copy_paste)
        .bind(&purchase.qr_code_image)
        .bind(&purchase.invoice_url)
        .bind(purchase.created_at)
        .bind(purchase.updated_at)
        .fetch_one(&self.pool)
        .await
        .context("inserting credit purchase")?;

        CreditPurchase::try_from(row)
    }

    async fn get_credit_purchase(&self, id: Uuid) -> Result<Option<CreditPurchase>, AppError> {
        let row = sqlx::query_as::<_, PurchaseRow>(&format!(
            "SELECT {} FROM credit_purchases WHERE id = $1",
            PURCHASE_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("fetching credit purchase")?;

        row.map(CreditPurchase::try_from).transpose()
    }

    async fn update_credit_purchase_payment(
        &self,
        id: Uuid,
        update: &OrderPaymentUpdate,
    ) -> Result<Option<CreditPurchase>, AppError> {
        let row = sqlx::query_as::<_, PurchaseRow>(&format!(
            r#"
            UPDATE credit_purchases
            SET status = $2,
                asaas_payment_id = COALESCE($3, asaas_payment_id),
                pix_copy_paste = COALESCE($4, pix_copy_paste),
                qr_code_image = COALESCE($5, qr_code_image),
                invoice_url = COALESCE($6, invoice_url),
                updated_at = now()
            WHERE id = $1
            RETURNING {}
            "#,
            PURCHASE_COLUMNS
        ))
        .bind(id)
        .bind(&update.status)
        .bind(&update.asaas_payment_id)
        .bind(&update.pix_copy_paste)
        .bind(&update.qr_code_image)
        .bind(&update.invoice_url)
        .fetch_optional(&self.pool)
        .await
        .context("updating credit purchase payment")?;

        row.map(CreditPurchase::try_from).transpose()
    }

    async fn settle_credit_purchase(
        &self,
        payment_id: &str,
    ) -> Result<Option<CreditTransaction>, AppError> {
        let mut tx = self.pool.begin().await.context("starting settlement transaction")?;

        let row = sqlx::query_as::<_, PurchaseRow>(&format!(
            "SELECT {} FROM credit_purchases \
             WHERE asaas_payment_id = $1 AND status <> $2 FOR UPDATE",
            PURCHASE_COLUMNS
        ))
        .bind(payment_id)
        .bind(STATUS_PAID)
        .fetch_optional(&mut *tx)
        .await
        .context("locking credit purchase")?;

        let Some(row) = row else {
            return Ok(None);
        };
        let purchase = CreditPurchase::try_from(row)?;

        sqlx::query("UPDATE credit_purchases SET status = $2, updated_at = now() WHERE id = $1")
            .bind(purchase.id)
            .bind(STATUS_PAID)
            .execute(&mut *tx)
            .await
            .context("marking credit purchase paid")?;

        let transaction = apply_credit_in(&mut *tx, &purchase.credit_mutation()).await?;

        tx.commit().await.context("committing settlement transaction")?;
        Ok(Some(transaction))
    }
}

/// Balance change plus ledger row inside the caller's transaction.
async fn apply_credit_in(
    conn: &mut PgConnection,
    mutation: &CreditMutation,
) -> Result<CreditTransaction, AppError> {
    // Make sure the account row exists, then lock it.
    sqlx::query(
        r#"
        INSERT INTO credits (id, owner_type, owner_id, balance, updated_at)
        VALUES ($1, $2, $3, 0, now())
        ON CONFLICT (owner_type, owner_id) DO NOTHING
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(mutation.owner_type.as_str())
    .bind(mutation.owner_id)
    .execute(&mut *conn)
    .await
    .context("creating credit account")?;

    let (credit_id, balance_before): (Uuid, i64) = sqlx::query_as(
        "SELECT id, balance FROM credits WHERE owner_type = $1 AND owner_id = $2 FOR UPDATE",
    )
    .bind(mutation.owner_type.as_str())
    .bind(mutation.owner_id)
    .fetch_one(&mut *conn)
    .await
    .context("locking credit account")?;

    let balance_after = next_balance(balance_before, mutation.delta)?;

    sqlx::query("UPDATE credits SET balance = $2, updated_at = now() WHERE id = $1")
        .bind(credit_id)
        .bind(balance_after)
        .execute(&mut *conn)
        .await
        .context("updating credit balance")?;

    let row = sqlx::query_as::<_, TransactionRow>(
        r#"
        INSERT INTO credit_transactions
            (id, credit_id, owner_type, owner_id, transaction_type, amount,
             balance_before, balance_after, description, reference_id, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, now())
        RETURNING id, credit_id, owner_type, owner_id, transaction_type, amount,
                  balance_before, balance_after, description, reference_id, created_at
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(credit_id)
    .bind(mutation.owner_type.as_str())
    .bind(mutation.owner_id)
    .bind(mutation.transaction_type.as_str())
    .bind(mutation.delta.abs())
    .bind(balance_before)
    .bind(balance_after)
    .bind(&mutation.description)
    .bind(&mutation.reference_id)
    .fetch_one(&mut *conn)
    .await
    .context("inserting credit transaction")?;

    CreditTransaction::try_from(row)
}
