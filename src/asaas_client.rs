use crate::errors::AppError;
use reqwest;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use tracing;

const PAGE_SIZE: usize = 100;

/// Charge as returned by `GET /payments/{id}`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AsaasPayment {
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub billing_type: Option<String>,
    #[serde(default)]
    pub invoice_url: Option<String>,
    #[serde(default)]
    pub external_reference: Option<String>,
}

/// `GET /payments/{id}/pixQrCode`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AsaasPixQrCode {
    pub encoded_image: Option<String>,
    pub payload: Option<String>,
    #[serde(default)]
    pub expiration_date: Option<String>,
}

/// Sub-account from `GET /accounts`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AsaasAccount {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub wallet_id: Option<String>,
    #[serde(default)]
    pub cpf_cnpj: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct AsaasWallet {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AsaasPage<T> {
    #[serde(default = "Vec::new")]
    data: Vec<T>,
    #[serde(default)]
    has_more: bool,
}

/// Client for the Asaas payment gateway REST API.
///
/// Authenticates with the `access_token` header. Sandbox and production
/// live on different base URLs, chosen in [`crate::config::Config`].
#[derive(Clone)]
pub struct AsaasClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl AsaasClient {
    /// Creates a new `AsaasClient`.
    ///
    /// # Arguments
    ///
    /// * `base_url` - Gateway base URL including the version segment.
    /// * `api_key` - Account API key.
    pub fn new(base_url: String, api_key: String) -> Result<Self, AppError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| {
                AppError::ExternalApiError(format!("Failed to create Asaas client: {}", e))
            })?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, AppError> {
        let url = format!("{}{}", self.base_url, path);
        tracing::debug!("Asaas GET {}", url);

        let response = self
            .client
            .get(&url)
            .header("access_token", &self.api_key)
            .query(query)
            .send()
            .await
            .map_err(|e| AppError::ExternalApiError(format!("Asaas request failed: {}", e)))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(AppError::NotFound(format!("Asaas resource {} not found", path)));
        }

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(AppError::ExternalApiError(format!(
                "Asaas returned {}: {}",
                status, error_text
            )));
        }

        response.json().await.map_err(|e| {
            AppError::ExternalApiError(format!("Failed to parse Asaas response: {}", e))
        })
    }

    /// Gets a charge by its gateway id.
    pub async fn get_payment(&self, payment_id: &str) -> Result<AsaasPayment, AppError> {
        self.get_json(&format!("/payments/{}", payment_id), &[])
            .await
    }

    /// Finds the charge created for an external reference, if any.
    pub async fn find_payment_by_reference(
        &self,
        external_reference: &str,
    ) -> Result<Option<AsaasPayment>, AppError> {
        let page: AsaasPage<AsaasPayment> = self
            .get_json(
                "/payments",
                &[("externalReference", external_reference.to_string())],
            )
            .await?;
        Ok(page.data.into_iter().next())
    }

    /// Gets the PIX QR code of a charge.
    pub async fn get_pix_qr_code(&self, payment_id: &str) -> Result<AsaasPixQrCode, AppError> {
        self.get_json(&format!("/payments/{}/pixQrCode", payment_id), &[])
            .await
    }

    /// Wallet ids of the authenticated account.
    pub async fn list_wallets(&self) -> Result<Vec<String>, AppError> {
        let page: AsaasPage<AsaasWallet> = self.get_json("/wallets", &[]).await?;
        Ok(page.data.into_iter().map(|w| w.id).collect())
    }

    /// All sub-accounts, following pagination.
    pub async fn list_subaccounts(&self) -> Result<Vec<AsaasAccount>, AppError> {
        let mut accounts = Vec::new();
        let mut offset = 0;
        loop {
            let page: AsaasPage<AsaasAccount> = self
                .get_json(
                    "/accounts",
                    &[
                        ("offset", offset.to_string()),
                        ("limit", PAGE_SIZE.to_string()),
                    ],
                )
                .await?;
            let fetched = page.data.len();
            accounts.extend(page.data);
            if !page.has_more || fetched == 0 {
                break;
            }
            offset += fetched;
        }
        tracing::debug!("Fetched {} Asaas sub-accounts", accounts.len());
        Ok(accounts)
    }

    /// Whether a wallet belongs to this account or one of its sub-accounts.
    pub async fn wallet_exists(&self, wallet_id: &str) -> Result<bool, AppError> {
        if self.list_wallets().await?.iter().any(|w| w == wallet_id) {
            return Ok(true);
        }
        Ok(self
            .list_subaccounts()
            .await?
            .iter()
            .any(|a| a.wallet_id.as_deref() == Some(wallet_id)))
    }
}

/// Maps a gateway charge status to the order status we store.
pub fn order_status_for_payment(status: &str) -> &'static str {
    match status {
        "RECEIVED" | "RECEIVED_IN_CASH" => "RECEIVED",
        "CONFIRMED" => "CONFIRMED",
        "OVERDUE" => "OVERDUE",
        "REFUNDED" | "REFUND_REQUESTED" | "REFUND_IN_PROGRESS" => "REFUNDED",
        "DELETED" => "CANCELLED",
        _ => "PENDING",
    }
}
