use crate::contact::clean_tax_id;
use crate::errors::{AppError, ResultExt};
use crate::models::*;
use crate::payments::{charge_update, relay_customer};
use crate::relay_client::{RelayChargeRequest, RelayClient, RelayCreditPackage, RelayCustomer};
use crate::store::OrderStore;
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use uuid::Uuid;

pub const DEFAULT_TRANSACTION_LIMIT: i64 = 50;
pub const MAX_TRANSACTION_LIMIT: i64 = 200;

/// Prepaid credit ledger for clients and companies.
///
/// Credits are bought through a PIX charge and only land on the balance
/// once the gateway confirms payment.
#[derive(Clone)]
pub struct CreditService {
    store: Arc<dyn OrderStore>,
    relay: RelayClient,
    payment_due_days: i64,
}

impl CreditService {
    pub fn new(store: Arc<dyn OrderStore>, relay: RelayClient, payment_due_days: i64) -> Self {
        Self {
            store,
            relay,
            payment_due_days,
        }
    }

    pub async fn packages(&self) -> Result<Vec<CreditPackage>, AppError> {
        self.store
            .list_credit_packages()
            .await
            .context("listing credit packages")
    }

    /// Newest transactions first. `limit` defaults to 50 and is capped at 200.
    pub async fn transactions(
        &self,
        owner_type: OwnerType,
        owner_id: Uuid,
        limit: Option<i64>,
    ) -> Result<Vec<CreditTransaction>, AppError> {
        let limit = match limit {
            None => DEFAULT_TRANSACTION_LIMIT,
            Some(l) if l <= 0 => {
                return Err(AppError::BadRequest(format!(
                    "limit must be positive, got {}",
                    l
                )))
            }
            Some(l) => l.min(MAX_TRANSACTION_LIMIT),
        };

        self.store
            .list_credit_transactions(owner_type, owner_id, limit)
            .await
            .context("listing credit transactions")
    }

    /// Current balance; an owner without an account has zero.
    pub async fn balance(
        &self,
        owner_type: OwnerType,
        owner_id: Uuid,
    ) -> Result<CreditBalanceResponse, AppError> {
        let balance = self
            .store
            .get_credit_account(owner_type, owner_id)
            .await
            .context("loading credit account")?
            .map(|account| account.balance)
            .unwrap_or(0);

        Ok(CreditBalanceResponse {
            owner_type,
            owner_id,
            balance,
        })
    }

    /// Opens a PIX charge for a credit package.
    ///
    /// No credits move here. The purchase is stored as `RELAY_PENDING`,
    /// then carries the charge the relay created; the package credits are
    /// granted when the gateway confirms that charge (see
    /// [`OrderStore::settle_credit_purchase`]).
    pub async fn purchase(
        &self,
        request: &PurchaseCreditsRequest,
    ) -> Result<CreditPurchase, AppError> {
        let package = self
            .store
            .get_credit_package(request.package_id)
            .await
            .context("loading credit package")?
            .filter(|p| p.active)
            .ok_or_else(|| {
                AppError::NotFound(format!(
                    "credit package {} not found or inactive",
                    request.package_id
                ))
            })?;

        if package.credits <= 0 || package.price.0 <= 0 {
            return Err(AppError::InternalError(format!(
                "credit package {} grants {} credits for {} BRL",
                package.id, package.credits, package.price
            )));
        }

        let customer = self.payer(request.owner_type, request.owner_id).await?;

        let now = Utc::now();
        let purchase = self
            .store
            .insert_credit_purchase(CreditPurchase {
                id: Uuid::new_v4(),
                owner_type: request.owner_type,
                owner_id: request.owner_id,
                package_id: package.id,
                credits: package.credits,
                amount: package.price,
                status: STATUS_RELAY_PENDING.to_string(),
                asaas_payment_id: None,
                pix_copy_paste: None,
                qr_code_image: None,
                invoice_url: None,
                created_at: now,
                updated_at: now,
            })
            .await
            .context("reserving credit purchase")?;

        let charge = RelayChargeRequest {
            external_reference: purchase.id.to_string(),
            billing_type: "PIX",
            value: package.price,
            due_date: (now + ChronoDuration::days(self.payment_due_days)).date_naive(),
            description: format!("{} ({} credits)", package.name, package.credits),
            customer,
            service: None,
            company: None,
            credit_package: Some(RelayCreditPackage {
                id: package.id,
                name: package.name.clone(),
                credits: package.credits,
            }),
            split: Vec::new(),
        };

        let result = match self.relay.create_charge(&charge).await {
            Ok(result) => result,
            Err(e) => {
                if let Err(mark_err) = self
                    .store
                    .update_credit_purchase_payment(
                        purchase.id,
                        &OrderPaymentUpdate::new(STATUS_RELAY_FAILED),
                    )
                    .await
                {
                    tracing::error!(
                        "Could not mark credit purchase {} as relay-failed: {}",
                        purchase.id,
                        mark_err
                    );
                }
                return Err(e);
            }
        };

        let payment_id = result.payment_id.clone();
        let purchase = self
            .store
            .update_credit_purchase_payment(purchase.id, &charge_update(result))
            .await
            .map_err(|e| {
                tracing::error!(
                    "Charge {} was created for credit purchase {} but could not be stored: {}",
                    payment_id,
                    purchase.id,
                    e
                );
                e
            })
            .context("persisting credit purchase charge")?
            .ok_or_else(|| {
                AppError::InternalError(format!(
                    "credit purchase {} disappeared before charge {} was stored",
                    purchase.id, payment_id
                ))
            })?;

        tracing::info!(
            "{} {} opened purchase {} of {} credits (charge {})",
            request.owner_type.as_str(),
            request.owner_id,
            purchase.id,
            package.credits,
            payment_id
        );
        Ok(purchase)
    }

    pub async fn get_purchase(&self, id: Uuid) -> Result<CreditPurchase, AppError> {
        self.store
            .get_credit_purchase(id)
            .await
            .context("loading credit purchase")?
            .ok_or_else(|| AppError::NotFound(format!("credit purchase {} not found", id)))
    }

    async fn payer(&self, owner_type: OwnerType, owner_id: Uuid) -> Result<RelayCustomer, AppError> {
        match owner_type {
            OwnerType::Client => {
                let client = self
                    .store
                    .get_client(owner_id)
                    .await
                    .context("loading client")?
                    .ok_or_else(|| AppError::NotFound(format!("client {} not found", owner_id)))?;
                Ok(relay_customer(&client))
            }
            OwnerType::Company => {
                let company = self
                    .store
                    .get_company(owner_id)
                    .await
                    .context("loading company")?
                    .ok_or_else(|| {
                        AppError::NotFound(format!("company {} not found", owner_id))
                    })?;
                Ok(RelayCustomer {
                    id: company.id,
                    cpf_cnpj: company.cnpj.as_deref().and_then(clean_tax_id),
                    name: company.name,
                    email: None,
                    mobile_phone: None,
                    birth_date: None,
                })
            }
        }
    }

    /// Debits credits; fails with `InsufficientCredits` instead of going negative.
    pub async fn consume(
        &self,
        request: &ConsumeCreditsRequest,
    ) -> Result<CreditMutationResponse, AppError> {
        if request.amount <= 0 {
            return Err(AppError::BadRequest(format!(
                "amount must be positive, got {}",
                request.amount
            )));
        }

        let transaction = self
            .store
            .apply_credit(CreditMutation {
                owner_type: request.owner_type,
                owner_id: request.owner_id,
                delta: -request.amount,
                transaction_type: CreditTransactionType::Consumption,
                description: request.description.clone(),
                reference_id: request.reference_id.clone(),
            })
            .await?;

        tracing::info!(
            "{} {} consumed {} credits (balance {})",
            request.owner_type.as_str(),
            request.owner_id,
            request.amount,
            transaction.balance_after
        );

        Ok(CreditMutationResponse {
            balance: transaction.balance_after,
            transaction,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_store::MemoryStore;
    use crate::money::Cents;
    use serde_json::json;
    use std::time::Duration;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn package(credits: i64, active: bool) -> CreditPackage {
        CreditPackage {
            id: Uuid::new_v4(),
            name: format!("{} credits", credits),
            credits,
            price: Cents(credits * 100),
            active,
        }
    }

    fn company(id: Uuid) -> Company {
        Company {
            id,
            name: "Clinica Centro".to_string(),
            cnpj: Some("12.345.678/0001-95".to_string()),
            asaas_wallet_id: None,
            wallet_id: None,
            reseller_wallet_id: None,
            subaccount_status: None,
        }
    }

    fn credit_service(store: MemoryStore, relay_url: &str) -> CreditService {
        let relay = RelayClient::new(
            format!("{}/webhook/pix", relay_url),
            None,
            Duration::from_secs(2),
        )
        .unwrap()
        .with_retry_backoff(Duration::from_millis(10));
        CreditService::new(Arc::new(store), relay, 3)
    }

    #[tokio::test]
    async fn test_purchase_opens_charge_without_granting_credits() {
        let relay = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/webhook/pix"))
            .and(body_partial_json(json!({
                "billingType": "PIX",
                "value": 100.0,
                "customer": {"cpfCnpj": "12345678000195"},
                "creditPackage": {"credits": 100},
                "split": []
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "pay_credit_1",
                "status": "PENDING",
                "payload": "000201",
                "encodedImage": "img"
            })))
            .expect(1)
            .mount(&relay)
            .await;

        let store = MemoryStore::new();
        let pack = package(100, true);
        let owner_id = Uuid::new_v4();
        store.put_credit_package(pack.clone()).await;
        store.put_company(company(owner_id)).await;
        let credits = credit_service(store.clone(), &relay.uri());

        let purchase = credits
            .purchase(&PurchaseCreditsRequest {
                owner_type: OwnerType::Company,
                owner_id,
                package_id: pack.id,
            })
            .await
            .unwrap();
        assert_eq!(purchase.status, "PENDING");
        assert_eq!(purchase.asaas_payment_id.as_deref(), Some("pay_credit_1"));
        assert_eq!(purchase.credits, 100);
        assert_eq!(purchase.amount, Cents(10000));

        let balance = credits.balance(OwnerType::Company, owner_id).await.unwrap();
        assert_eq!(balance.balance, 0);
        assert_eq!(credits.get_purchase(purchase.id).await.unwrap(), purchase);
    }

    #[tokio::test]
    async fn test_settled_purchase_grants_credits_once() {
        let relay = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/webhook/pix"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"id": "pay_credit_2"})),
            )
            .mount(&relay)
            .await;

        let store = MemoryStore::new();
        let pack = package(100, true);
        let owner_id = Uuid::new_v4();
        store.put_credit_package(pack.clone()).await;
        store.put_company(company(owner_id)).await;
        let credits = credit_service(store.clone(), &relay.uri());

        let purchase = credits
            .purchase(&PurchaseCreditsRequest {
                owner_type: OwnerType::Company,
                owner_id,
                package_id: pack.id,
            })
            .await
            .unwrap();

        let granted = store
            .settle_credit_purchase("pay_credit_2")
            .await
            .unwrap()
            .expect("purchase settles");
        assert_eq!(granted.balance_after, 100);
        assert_eq!(granted.reference_id, Some(purchase.id.to_string()));
        assert!(store
            .settle_credit_purchase("pay_credit_2")
            .await
            .unwrap()
            .is_none());
        assert_eq!(credits.get_purchase(purchase.id).await.unwrap().status, STATUS_PAID);

        let spent = credits
            .consume(&ConsumeCreditsRequest {
                owner_type: OwnerType::Company,
                owner_id,
                amount: 30,
                description: Some("consulta".to_string()),
                reference_id: None,
            })
            .await
            .unwrap();
        assert_eq!(spent.transaction.balance_before, 100);
        assert_eq!(spent.balance, 70);

        let history = credits
            .transactions(OwnerType::Company, owner_id, None)
            .await
            .unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(
            history[0].transaction_type,
            CreditTransactionType::Consumption
        );
    }

    #[tokio::test]
    async fn test_relay_rejection_marks_purchase_failed() {
        let relay = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/webhook/pix"))
            .respond_with(ResponseTemplate::new(400).set_body_string("invalid customer"))
            .mount(&relay)
            .await;

        let store = MemoryStore::new();
        let pack = package(10, true);
        let owner_id = Uuid::new_v4();
        store.put_credit_package(pack.clone()).await;
        store.put_company(company(owner_id)).await;
        let credits = credit_service(store.clone(), &relay.uri());

        let result = credits
            .purchase(&PurchaseCreditsRequest {
                owner_type: OwnerType::Company,
                owner_id,
                package_id: pack.id,
            })
            .await;
        assert!(matches!(result, Err(AppError::RelayUnreachable(_))));
        assert_eq!(
            credits
                .balance(OwnerType::Company, owner_id)
                .await
                .unwrap()
                .balance,
            0
        );
    }

    #[tokio::test]
    async fn test_unknown_payer_is_rejected_before_relay() {
        let relay = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "pay_x"})))
            .expect(0)
            .mount(&relay)
            .await;

        let store = MemoryStore::new();
        let pack = package(10, true);
        store.put_credit_package(pack.clone()).await;
        let credits = credit_service(store, &relay.uri());

        let result = credits
            .purchase(&PurchaseCreditsRequest {
                owner_type: OwnerType::Client,
                owner_id: Uuid::new_v4(),
                package_id: pack.id,
            })
            .await;
        assert!(matches!(result, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_consume_rejects_overdraft_and_bad_amounts() {
        let credits = credit_service(MemoryStore::new(), "http://127.0.0.1:9");
        let owner_id = Uuid::new_v4();
        let consume = |amount| ConsumeCreditsRequest {
            owner_type: OwnerType::Client,
            owner_id,
            amount,
            description: None,
            reference_id: None,
        };

        assert!(matches!(
            credits.consume(&consume(1)).await,
            Err(AppError::InsufficientCredits { balance: 0, requested: 1 })
        ));
        assert!(matches!(
            credits.consume(&consume(0)).await,
            Err(AppError::BadRequest(_))
        ));
        assert_eq!(
            credits
                .balance(OwnerType::Client, owner_id)
                .await
                .unwrap()
                .balance,
            0
        );
    }

    #[tokio::test]
    async fn test_inactive_package_cannot_be_bought() {
        let store = MemoryStore::new();
        let pack = package(10, false);
        store.put_credit_package(pack.clone()).await;
        let credits = credit_service(store, "http://127.0.0.1:9");

        let result = credits
            .purchase(&PurchaseCreditsRequest {
                owner_type: OwnerType::Client,
                owner_id: Uuid::new_v4(),
                package_id: pack.id,
            })
            .await;
        assert!(matches!(result, Err(AppError::NotFound(_))));
        assert!(credits.packages().await.unwrap().is_empty());
    }
}
