use crate::money::Cents;
use crate::split::SplitEntry;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============ Store records ============

/// Client (customer) record from `clients`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Client {
    pub id: Uuid,
    #[serde(default)]
    pub company_id: Option<Uuid>,
    pub name: String,
    #[serde(default)]
    pub cpf_cnpj: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default, rename = "data_nascimento")]
    pub birth_date: Option<NaiveDate>,
}

/// Company (sub-licensee) record from `companies`.
///
/// Two wallet columns exist in the wild: `asaas_wallet_id` is canonical,
/// `wallet_id` is read only as a fallback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Company {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub cnpj: Option<String>,
    #[serde(default)]
    pub asaas_wallet_id: Option<String>,
    #[serde(default)]
    pub wallet_id: Option<String>,
    #[serde(default)]
    pub reseller_wallet_id: Option<String>,
    #[serde(default)]
    pub subaccount_status: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WalletSource {
    AsaasWalletId,
    LegacyWalletId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedWallet {
    pub wallet_id: String,
    pub source: WalletSource,
}

impl Company {
    /// Wallet that receives this company's split share, if any.
    pub fn resolve_wallet(&self) -> Option<ResolvedWallet> {
        let clean = |w: &Option<String>| {
            w.as_deref()
                .map(str::trim)
                .filter(|w| !w.is_empty())
                .map(str::to_string)
        };

        if let Some(wallet_id) = clean(&self.asaas_wallet_id) {
            return Some(ResolvedWallet {
                wallet_id,
                source: WalletSource::AsaasWalletId,
            });
        }

        clean(&self.wallet_id).map(|wallet_id| {
            tracing::warn!(
                "Company {} has no asaas_wallet_id, falling back to legacy wallet_id",
                self.id
            );
            ResolvedWallet {
                wallet_id,
                source: WalletSource::LegacyWalletId,
            }
        })
    }
}

/// Billable service from `services` with its three price components.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Service {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default, deserialize_with = "crate::money::zero_if_null")]
    pub base_price: Cents,
    #[serde(default, deserialize_with = "crate::money::zero_if_null")]
    pub operator_price: Cents,
    #[serde(default, deserialize_with = "crate::money::zero_if_null")]
    pub reseller_price: Cents,
    pub active: bool,
}

/// Placeholder status held while the relay creates the charge.
pub const STATUS_RELAY_PENDING: &str = "RELAY_PENDING";
/// The relay call failed; the same idempotency key may try again.
pub const STATUS_RELAY_FAILED: &str = "RELAY_FAILED";
/// Credit purchase whose charge was paid and whose credits were granted.
pub const STATUS_PAID: &str = "PAID";

/// Service order. Reserved under its idempotency key before the relay is
/// called and filled in with the gateway charge afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceOrder {
    pub id: Uuid,
    pub idempotency_key: String,
    pub request_fingerprint: String,
    pub client_id: Uuid,
    pub service_id: Uuid,
    pub company_id: Uuid,
    pub amount: Cents,
    pub status: String,
    #[serde(default)]
    pub asaas_payment_id: Option<String>,
    #[serde(default)]
    pub pix_copy_paste: Option<String>,
    #[serde(default)]
    pub qr_code_image: Option<String>,
    #[serde(default)]
    pub invoice_url: Option<String>,
    #[serde(default)]
    pub split: Vec<SplitEntry>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Status change for an order or credit purchase. Charge fields that are
/// `None` keep their stored value.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct OrderPaymentUpdate {
    pub status: String,
    pub asaas_payment_id: Option<String>,
    pub pix_copy_paste: Option<String>,
    pub qr_code_image: Option<String>,
    pub invoice_url: Option<String>,
}

impl OrderPaymentUpdate {
    pub fn new(status: impl Into<String>) -> Self {
        Self {
            status: status.into(),
            ..Default::default()
        }
    }
}

/// Result of inserting an order under an idempotency key.
#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome {
    Inserted(ServiceOrder),
    /// Another order already holds the key; that order is returned.
    Existing(ServiceOrder),
}

// ============ Credits ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OwnerType {
    Client,
    Company,
}

impl OwnerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OwnerType::Client => "client",
            OwnerType::Company => "company",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "client" => Some(OwnerType::Client),
            "company" => Some(OwnerType::Company),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CreditTransactionType {
    Purchase,
    Consumption,
}

impl CreditTransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CreditTransactionType::Purchase => "purchase",
            CreditTransactionType::Consumption => "consumption",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "purchase" => Some(CreditTransactionType::Purchase),
            "consumption" => Some(CreditTransactionType::Consumption),
            _ => None,
        }
    }
}

/// Balance holder from `credits`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreditAccount {
    pub id: Uuid,
    pub owner_type: OwnerType,
    pub owner_id: Uuid,
    pub balance: i64,
    pub updated_at: DateTime<Utc>,
}

/// Ledger row from `credit_transactions`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreditTransaction {
    pub id: Uuid,
    pub credit_id: Uuid,
    pub owner_type: OwnerType,
    pub owner_id: Uuid,
    pub transaction_type: CreditTransactionType,
    pub amount: i64,
    pub balance_before: i64,
    pub balance_after: i64,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub reference_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreditPackage {
    pub id: Uuid,
    pub name: String,
    pub credits: i64,
    pub price: Cents,
    pub active: bool,
}

/// Package bought with a PIX charge; credits are granted once it is paid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreditPurchase {
    pub id: Uuid,
    pub owner_type: OwnerType,
    pub owner_id: Uuid,
    pub package_id: Uuid,
    pub credits: i64,
    pub amount: Cents,
    pub status: String,
    #[serde(default)]
    pub asaas_payment_id: Option<String>,
    #[serde(default)]
    pub pix_copy_paste: Option<String>,
    #[serde(default)]
    pub qr_code_image: Option<String>,
    #[serde(default)]
    pub invoice_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CreditPurchase {
    /// Ledger entry granted when the charge is paid.
    pub fn credit_mutation(&self) -> CreditMutation {
        CreditMutation {
            owner_type: self.owner_type,
            owner_id: self.owner_id,
            delta: self.credits,
            transaction_type: CreditTransactionType::Purchase,
            description: Some(format!(
                "Credit purchase {} ({} BRL)",
                self.id, self.amount
            )),
            reference_id: Some(self.id.to_string()),
        }
    }
}

/// A signed balance change to apply atomically.
#[derive(Debug, Clone, PartialEq)]
pub struct CreditMutation {
    pub owner_type: OwnerType,
    pub owner_id: Uuid,
    /// Positive for purchases, negative for consumption.
    pub delta: i64,
    pub transaction_type: CreditTransactionType,
    pub description: Option<String>,
    pub reference_id: Option<String>,
}

// ============ API requests / responses ============

/// Body of `POST /api/payments/create-service-order`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateServiceOrderRequest {
    #[serde(alias = "customer_id", alias = "clientId", alias = "client_id")]
    pub customer_id: Uuid,
    #[serde(alias = "service_id")]
    pub service_id: Uuid,
    #[serde(alias = "company_id")]
    pub company_id: Uuid,
    /// Decimal reais, kept raw so validation errors name the input.
    #[serde(default)]
    pub amount: serde_json::Value,
    /// Idempotency key when the caller cannot set the header.
    #[serde(default, alias = "request_id")]
    pub request_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceOrderResponse {
    pub id: Uuid,
    pub status: String,
    pub amount: Cents,
    pub payment_id: Option<String>,
    pub split: Vec<SplitEntry>,
    pub pix_copy_paste: Option<String>,
    pub qr_code_image: Option<String>,
    pub qr_code_available: bool,
    pub invoice_url: Option<String>,
    pub idempotency_key: String,
    pub replayed: bool,
    pub created_at: DateTime<Utc>,
}

impl ServiceOrderResponse {
    pub fn from_order(order: ServiceOrder, replayed: bool) -> Self {
        Self {
            id: order.id,
            status: order.status,
            amount: order.amount,
            payment_id: order.asaas_payment_id,
            split: order.split,
            qr_code_available: order.qr_code_image.is_some(),
            pix_copy_paste: order.pix_copy_paste,
            qr_code_image: order.qr_code_image,
            invoice_url: order.invoice_url,
            idempotency_key: order.idempotency_key,
            replayed,
            created_at: order.created_at,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerQuery {
    #[serde(alias = "owner_type")]
    pub owner_type: OwnerType,
    #[serde(alias = "owner_id")]
    pub owner_id: Uuid,
    #[serde(default)]
    pub limit: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PurchaseCreditsRequest {
    #[serde(alias = "owner_type")]
    pub owner_type: OwnerType,
    #[serde(alias = "owner_id")]
    pub owner_id: Uuid,
    #[serde(alias = "package_id")]
    pub package_id: Uuid,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeCreditsRequest {
    #[serde(alias = "owner_type")]
    pub owner_type: OwnerType,
    #[serde(alias = "owner_id")]
    pub owner_id: Uuid,
    pub amount: i64,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, alias = "reference_id")]
    pub reference_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreditPurchaseResponse {
    pub id: Uuid,
    pub owner_type: OwnerType,
    pub owner_id: Uuid,
    pub package_id: Uuid,
    pub credits: i64,
    pub amount: Cents,
    pub status: String,
    pub payment_id: Option<String>,
    pub pix_copy_paste: Option<String>,
    pub qr_code_image: Option<String>,
    pub qr_code_available: bool,
    pub invoice_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<CreditPurchase> for CreditPurchaseResponse {
    fn from(purchase: CreditPurchase) -> Self {
        Self {
            id: purchase.id,
            owner_type: purchase.owner_type,
            owner_id: purchase.owner_id,
            package_id: purchase.package_id,
            credits: purchase.credits,
            amount: purchase.amount,
            status: purchase.status,
            payment_id: purchase.asaas_payment_id,
            qr_code_available: purchase.qr_code_image.is_some(),
            pix_copy_paste: purchase.pix_copy_paste,
            qr_code_image: purchase.qr_code_image,
            invoice_url: purchase.invoice_url,
            created_at: purchase.created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreditBalanceResponse {
    pub owner_type: OwnerType,
    pub owner_id: Uuid,
    pub balance: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreditMutationResponse {
    pub transaction: CreditTransaction,
    pub balance: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompanyWalletReport {
    pub company_id: Uuid,
    pub asaas_wallet_id: Option<String>,
    pub legacy_wallet_id: Option<String>,
    pub resolved: Option<ResolvedWallet>,
    pub columns_disagree: bool,
    /// `None` when the gateway is not configured.
    pub gateway_verified: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    #[serde(alias = "session_id")]
    pub session_id: String,
    pub message: String,
    #[serde(default, alias = "client_id")]
    pub client_id: Option<Uuid>,
}
