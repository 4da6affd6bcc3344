use crate::asaas_client::{order_status_for_payment, AsaasClient, AsaasPayment};
use crate::contact::{clean_tax_id, is_valid_email, normalize_br_phone};
use crate::errors::{AppError, ResultExt};
use crate::models::*;
use crate::money::Cents;
use crate::relay_client::{
    RelayChargeRequest, RelayChargeResult, RelayClient, RelayCompany, RelayCustomer,
    RelayService, RelaySplit,
};
use crate::split::{allocate, service_payees, split_total, SplitEntry};
use crate::store::OrderStore;
use chrono::{Duration as ChronoDuration, Utc};
use moka::future::Cache;
use regex::Regex;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::sync::{Arc, OnceLock};
use uuid::Uuid;

/// A `RELAY_PENDING` order older than this with no live claim is assumed
/// to have lost its relay answer.
const STALE_RELAY_MINUTES: i64 = 10;

/// Payment-order relay.
///
/// Validates an order request, computes the wallet split, reserves the
/// order under its idempotency key, asks the automation relay to create
/// the PIX charge and stores the charge on the reserved order. Every step
/// before the reservation is a pure lookup, so a rejected request never
/// reaches the gateway.
#[derive(Clone)]
pub struct PaymentOrderService {
    store: Arc<dyn OrderStore>,
    relay: RelayClient,
    asaas: Option<AsaasClient>,
    /// Idempotency keys currently being processed (value: unix timestamp).
    in_flight: Cache<String, i64>,
    platform_wallet_id: String,
    payment_due_days: i64,
}

fn idempotency_key_regex() -> &'static Regex {
    static KEY: OnceLock<Regex> = OnceLock::new();
    KEY.get_or_init(|| Regex::new(r"^[A-Za-z0-9_\-:.]{8,128}$").expect("key regex is valid"))
}

/// Parses the raw JSON amount (number or string) into cents.
pub fn parse_amount(raw: &Value) -> Result<Cents, AppError> {
    match raw {
        Value::Number(n) => Cents::parse_positive(&n.to_string()),
        Value::String(s) => Cents::parse_positive(s),
        Value::Null => Err(AppError::InvalidAmount("amount is required".to_string())),
        other => Err(AppError::InvalidAmount(format!(
            "amount must be a decimal number, got {}",
            other
        ))),
    }
}

/// Picks the caller's idempotency key or generates one.
///
/// The header wins over the body field. Keys must be 8 to 128 characters
/// of `[A-Za-z0-9_-:.]`.
pub fn resolve_idempotency_key(
    header: Option<&str>,
    body: Option<&str>,
) -> Result<String, AppError> {
    let supplied = header
        .or(body)
        .map(str::trim)
        .filter(|k| !k.is_empty());

    match supplied {
        Some(key) if idempotency_key_regex().is_match(key) => Ok(key.to_string()),
        Some(key) => Err(AppError::BadRequest(format!(
            "invalid idempotency key '{}': expected 8-128 characters of [A-Za-z0-9_-:.]",
            key
        ))),
        None => Ok(Uuid::new_v4().to_string()),
    }
}

/// SHA-256 of the normalized request, used to tell a replay from key reuse.
pub fn request_fingerprint(
    customer_id: Uuid,
    service_id: Uuid,
    company_id: Uuid,
    amount: Cents,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(
        format!(
            "{}|{}|{}|{}",
            customer_id, service_id, company_id, amount.0
        )
        .as_bytes(),
    );
    hex::encode(hasher.finalize())
}

/// Customer block for a client, with contact data the gateway would reject
/// left out.
pub fn relay_customer(client: &Client) -> RelayCustomer {
    let cpf_cnpj = client.cpf_cnpj.as_deref().and_then(|raw| {
        let cleaned = clean_tax_id(raw);
        if cleaned.is_none() {
            tracing::warn!("Client {} has an invalid CPF/CNPJ, omitting it", client.id);
        }
        cleaned
    });
    let email = client
        .email
        .as_deref()
        .map(str::trim)
        .filter(|e| is_valid_email(e))
        .map(str::to_string);
    let mobile_phone = client.phone.as_deref().and_then(|raw| {
        let normalized = normalize_br_phone(raw);
        if normalized.is_none() && !raw.trim().is_empty() {
            tracing::warn!("Client {} has an invalid phone number, omitting it", client.id);
        }
        normalized
    });

    RelayCustomer {
        id: client.id,
        name: client.name.clone(),
        cpf_cnpj,
        email,
        mobile_phone,
        birth_date: client.birth_date,
    }
}

/// Charge fields to store once the relay answered.
pub fn charge_update(result: RelayChargeResult) -> OrderPaymentUpdate {
    OrderPaymentUpdate {
        status: result.status,
        asaas_payment_id: Some(result.payment_id),
        pix_copy_paste: result.pix_copy_paste,
        qr_code_image: result.qr_code_image,
        invoice_url: result.invoice_url,
    }
}

/// Outcome of `create_service_order`.
#[derive(Debug, Clone)]
pub struct CreatedOrder {
    pub order: ServiceOrder,
    pub replayed: bool,
}

/// What an idempotency key already points at.
enum KeyState {
    Free,
    Created(ServiceOrder),
    RelayFailed(ServiceOrder),
}

fn classify(order: ServiceOrder, key: &str, fingerprint: &str) -> Result<KeyState, AppError> {
    if order.request_fingerprint != fingerprint {
        return Err(AppError::Conflict(format!(
            "idempotency key {} was already used for order {} with a different request",
            key, order.id
        )));
    }
    match order.status.as_str() {
        STATUS_RELAY_PENDING => Err(AppError::Conflict(format!(
            "order {} for idempotency key {} is waiting on the relay; \
             check GET /api/payments/{}?refresh=true",
            order.id, key, order.id
        ))),
        STATUS_RELAY_FAILED => Ok(KeyState::RelayFailed(order)),
        _ => Ok(KeyState::Created(order)),
    }
}

fn replayed(order: ServiceOrder, key: &str) -> CreatedOrder {
    tracing::info!("↺ Replaying order {} for key {}", order.id, key);
    CreatedOrder {
        order,
        replayed: true,
    }
}

impl PaymentOrderService {
    pub fn new(
        store: Arc<dyn OrderStore>,
        relay: RelayClient,
        asaas: Option<AsaasClient>,
        in_flight: Cache<String, i64>,
        platform_wallet_id: String,
        payment_due_days: i64,
    ) -> Self {
        Self {
            store,
            relay,
            asaas,
            in_flight,
            platform_wallet_id,
            payment_due_days,
        }
    }

    /// Creates (or replays) a PIX service order.
    ///
    /// # Arguments
    ///
    /// * `request` - Customer, service, company and amount.
    /// * `idempotency_key` - Key from the `Idempotency-Key` header, if any.
    ///
    /// # Returns
    ///
    /// * `Result<CreatedOrder, AppError>` - The persisted order, flagged as
    ///   replayed when an earlier submission with the same key already
    ///   created it. A key whose order is still waiting on the relay
    ///   answers `Conflict`; one whose relay call failed is retried on the
    ///   same order.
    pub async fn create_service_order(
        &self,
        request: &CreateServiceOrderRequest,
        idempotency_key: Option<&str>,
    ) -> Result<CreatedOrder, AppError> {
        let amount = parse_amount(&request.amount)?;
        let key = resolve_idempotency_key(idempotency_key, request.request_id.as_deref())?;
        let fingerprint = request_fingerprint(
            request.customer_id,
            request.service_id,
            request.company_id,
            amount,
        );

        if let KeyState::Created(order) = self.key_state(&key, &fingerprint).await? {
            return Ok(replayed(order, &key));
        }

        // Claim the key; a concurrent duplicate sees a non-fresh entry.
        let claimed = self
            .in_flight
            .entry(key.clone())
            .or_insert(Utc::now().timestamp())
            .await;
        if !claimed.is_fresh() {
            tracing::warn!(
                "⏭ Order {} already in flight (since {}), rejecting duplicate",
                key,
                claimed.value()
            );
            return Err(AppError::Conflict(format!(
                "order with idempotency key {} is already being processed",
                key
            )));
        }

        let result = self
            .create_claimed(request, amount, &key, &fingerprint)
            .await;
        self.in_flight.invalidate(&key).await;
        result
    }

    async fn key_state(&self, key: &str, fingerprint: &str) -> Result<KeyState, AppError> {
        let existing = self
            .store
            .find_order_by_idempotency_key(key)
            .await
            .context("checking idempotency key")?;

        match existing {
            Some(order) => classify(order, key, fingerprint),
            None => Ok(KeyState::Free),
        }
    }

    async fn create_claimed(
        &self,
        request: &CreateServiceOrderRequest,
        amount: Cents,
        key: &str,
        fingerprint: &str,
    ) -> Result<CreatedOrder, AppError> {
        // The previous holder of the claim may have changed the order
        // after our first lookup.
        let failed = match self.key_state(key, fingerprint).await? {
            KeyState::Created(order) => return Ok(replayed(order, key)),
            KeyState::RelayFailed(order) => Some(order),
            KeyState::Free => None,
        };

        let service = self
            .store
            .get_service(request.service_id)
            .await
            .context("loading service")?
            .filter(|s| s.active)
            .ok_or_else(|| {
                AppError::ServiceNotFound(format!(
                    "service {} does not exist or is inactive",
                    request.service_id
                ))
            })?;

        let company = self
            .store
            .get_company(request.company_id)
            .await
            .context("loading company")?
            .ok_or_else(|| {
                AppError::NotFound(format!("company {} not found", request.company_id))
            })?;

        let wallet = company.resolve_wallet().ok_or_else(|| {
            AppError::CompanyWalletMissing(format!(
                "company {} ({}) has no gateway wallet id; finish its sub-account onboarding \
                 before charging",
                company.id, company.name
            ))
        })?;

        let client = self
            .store
            .get_client(request.customer_id)
            .await
            .context("loading client")?
            .ok_or_else(|| {
                AppError::NotFound(format!("client {} not found", request.customer_id))
            })?;

        let order = match failed {
            Some(failed) => {
                if let Some(order) = self.reconcile_with_gateway(&failed).await? {
                    return Ok(replayed(order, key));
                }
                tracing::info!("Retrying relay for order {} (key {})", failed.id, key);
                self.store
                    .transition_order_status(failed.id, STATUS_RELAY_FAILED, STATUS_RELAY_PENDING)
                    .await
                    .context("reclaiming failed order")?
                    .ok_or_else(|| {
                        AppError::Conflict(format!(
                            "order {} for idempotency key {} changed while retrying",
                            failed.id, key
                        ))
                    })?
            }
            None => {
                let payees = service_payees(
                    &self.platform_wallet_id,
                    &wallet.wallet_id,
                    &company,
                    &service,
                );
                let split = allocate(amount, &payees, 0);
                debug_assert_eq!(split_total(&split), amount);
                tracing::info!(
                    "Order {}: {} BRL for service {} split as {:?}",
                    key,
                    amount,
                    service.id,
                    split
                );
                self.reserve_order(key, fingerprint, &client, &service, &company, amount, split)
                    .await?
            }
        };

        let charge = self.build_charge(
            key,
            order.amount,
            &client,
            &company,
            &wallet.wallet_id,
            &service,
            &order.split,
        );
        let result = match self.relay.create_charge(&charge).await {
            Ok(result) => result,
            Err(e) => {
                if let Err(mark_err) = self
                    .store
                    .transition_order_status(order.id, STATUS_RELAY_PENDING, STATUS_RELAY_FAILED)
                    .await
                {
                    tracing::error!(
                        "Could not mark order {} as relay-failed: {}",
                        order.id,
                        mark_err
                    );
                }
                return Err(e);
            }
        };

        if result.qr_code_image.is_none() {
            tracing::warn!(
                "Relay returned no QR code for payment {}; storing order without it",
                result.payment_id
            );
        }

        let payment_id = result.payment_id.clone();
        let stored = self
            .store
            .update_order_payment(order.id, &charge_update(result))
            .await
            .map_err(|e| {
                tracing::error!(
                    "Charge {} was created for order {} but could not be stored: {}",
                    payment_id,
                    order.id,
                    e
                );
                e
            })
            .context("persisting charge")?
            .ok_or_else(|| {
                AppError::InternalError(format!(
                    "order {} disappeared before charge {} was stored",
                    order.id, payment_id
                ))
            })?;

        tracing::info!("✓ Order {} created for key {}", stored.id, key);
        Ok(CreatedOrder {
            order: stored,
            replayed: false,
        })
    }

    /// Inserts the order under its idempotency key before the relay runs.
    #[allow(clippy::too_many_arguments)]
    async fn reserve_order(
        &self,
        key: &str,
        fingerprint: &str,
        client: &Client,
        service: &Service,
        company: &Company,
        amount: Cents,
        split: Vec<SplitEntry>,
    ) -> Result<ServiceOrder, AppError> {
        let now = Utc::now();
        let placeholder = ServiceOrder {
            id: Uuid::new_v4(),
            idempotency_key: key.to_string(),
            request_fingerprint: fingerprint.to_string(),
            client_id: client.id,
            service_id: service.id,
            company_id: company.id,
            amount,
            status: STATUS_RELAY_PENDING.to_string(),
            asaas_payment_id: None,
            pix_copy_paste: None,
            qr_code_image: None,
            invoice_url: None,
            split,
            created_at: now,
            updated_at: now,
        };

        match self
            .store
            .insert_order(placeholder)
            .await
            .context("reserving order")?
        {
            InsertOutcome::Inserted(order) => Ok(order),
            InsertOutcome::Existing(order) => {
                tracing::warn!(
                    "Order for key {} was reserved concurrently as {}",
                    key,
                    order.id
                );
                match classify(order, key, fingerprint)? {
                    KeyState::Created(order) => Err(AppError::Conflict(format!(
                        "order {} for idempotency key {} was created concurrently",
                        order.id, key
                    ))),
                    _ => Err(AppError::Conflict(format!(
                        "order with idempotency key {} is already being processed",
                        key
                    ))),
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn build_charge(
        &self,
        key: &str,
        amount: Cents,
        client: &Client,
        company: &Company,
        company_wallet_id: &str,
        service: &Service,
        split: &[SplitEntry],
    ) -> RelayChargeRequest {
        RelayChargeRequest {
            external_reference: key.to_string(),
            billing_type: "PIX",
            value: amount,
            due_date: (Utc::now() + ChronoDuration::days(self.payment_due_days)).date_naive(),
            description: format!("{} - {}", service.name, company.name),
            customer: relay_customer(client),
            service: Some(RelayService {
                id: service.id,
                name: service.name.clone(),
                category: service.category.clone(),
            }),
            company: Some(RelayCompany {
                id: company.id,
                name: company.name.clone(),
                wallet_id: company_wallet_id.to_string(),
            }),
            credit_package: None,
            split: split
                .iter()
                .map(|entry| RelaySplit {
                    wallet_id: entry.wallet_id.clone(),
                    fixed_value: entry.value,
                })
                .collect(),
        }
    }

    /// Looks the order's charge up at the gateway by its idempotency key and
    /// stores it when found.
    ///
    /// Returns `None` when the gateway is not configured or has no such
    /// charge.
    async fn reconcile_with_gateway(
        &self,
        order: &ServiceOrder,
    ) -> Result<Option<ServiceOrder>, AppError> {
        let Some(asaas) = &self.asaas else {
            return Ok(None);
        };
        let Some(payment) = asaas
            .find_payment_by_reference(&order.idempotency_key)
            .await
            .context("looking up charge by reference")?
        else {
            return Ok(None);
        };

        tracing::info!(
            "Order {} matched gateway charge {} by reference",
            order.id,
            payment.id
        );
        let update = self.gateway_update(asaas, &payment, true).await;
        self.store
            .update_order_payment(order.id, &update)
            .await
            .context("storing reconciled charge")?
            .map(Some)
            .ok_or_else(|| AppError::NotFound(format!("order {} not found", order.id)))
    }

    /// Status update for a gateway charge, with the PIX QR code when the
    /// charge is still open and `with_qr_code` is set.
    async fn gateway_update(
        &self,
        asaas: &AsaasClient,
        payment: &AsaasPayment,
        with_qr_code: bool,
    ) -> OrderPaymentUpdate {
        let mut update = OrderPaymentUpdate {
            status: order_status_for_payment(&payment.status).to_string(),
            asaas_payment_id: Some(payment.id.clone()),
            invoice_url: payment.invoice_url.clone(),
            ..Default::default()
        };

        if with_qr_code && update.status == "PENDING" {
            match asaas.get_pix_qr_code(&payment.id).await {
                Ok(qr) => {
                    update.qr_code_image = qr.encoded_image;
                    update.pix_copy_paste = qr.payload;
                }
                Err(e) => tracing::warn!("Could not fetch QR code for {}: {}", payment.id, e),
            }
        }
        update
    }

    /// Loads an order, optionally refreshing its status from the gateway.
    ///
    /// A refresh also back-fills the PIX QR code when the relay did not
    /// return one. For an order whose charge was never stored, the refresh
    /// looks the charge up by idempotency key instead, and releases a stale
    /// reservation the gateway has no charge for.
    pub async fn get_order(&self, id: Uuid, refresh: bool) -> Result<ServiceOrder, AppError> {
        let order = self
            .store
            .get_order(id)
            .await
            .context("loading order")?
            .ok_or_else(|| AppError::NotFound(format!("order {} not found", id)))?;

        if !refresh {
            return Ok(order);
        }

        let Some(asaas) = &self.asaas else {
            tracing::debug!("Refresh requested for order {} but gateway is not configured", id);
            return Ok(order);
        };

        let Some(payment_id) = order.asaas_payment_id.as_deref() else {
            return self.refresh_unconfirmed(order).await;
        };

        let payment = asaas
            .get_payment(payment_id)
            .await
            .context("refreshing payment status")?;
        let update = self
            .gateway_update(asaas, &payment, order.qr_code_image.is_none())
            .await;

        if update.status == order.status
            && update.qr_code_image.is_none()
            && update.pix_copy_paste.is_none()
        {
            return Ok(order);
        }

        tracing::info!(
            "Order {} status {} -> {}",
            id,
            order.status,
            update.status
        );
        self.store
            .update_order_payment(id, &update)
            .await
            .context("updating order from gateway")?
            .ok_or_else(|| AppError::NotFound(format!("order {} not found", id)))
    }

    async fn refresh_unconfirmed(&self, order: ServiceOrder) -> Result<ServiceOrder, AppError> {
        if order.status != STATUS_RELAY_PENDING && order.status != STATUS_RELAY_FAILED {
            return Ok(order);
        }

        if let Some(reconciled) = self.reconcile_with_gateway(&order).await? {
            return Ok(reconciled);
        }

        let stale = Utc::now() - order.updated_at > ChronoDuration::minutes(STALE_RELAY_MINUTES);
        if order.status == STATUS_RELAY_PENDING
            && stale
            && !self.in_flight.contains_key(&order.idempotency_key)
        {
            tracing::warn!(
                "Order {} has waited on the relay since {} and the gateway has no charge; \
                 releasing key {}",
                order.id,
                order.updated_at,
                order.idempotency_key
            );
            if let Some(released) = self
                .store
                .transition_order_status(order.id, STATUS_RELAY_PENDING, STATUS_RELAY_FAILED)
                .await
                .context("releasing stale order")?
            {
                return Ok(released);
            }
        }
        Ok(order)
    }

    /// Reports both wallet columns of a company and which one is used.
    pub async fn company_wallet_report(
        &self,
        company_id: Uuid,
    ) -> Result<CompanyWalletReport, AppError> {
        let company = self
            .store
            .get_company(company_id)
            .await
            .context("loading company")?
            .ok_or_else(|| AppError::NotFound(format!("company {} not found", company_id)))?;

        let resolved = company.resolve_wallet();
        let columns_disagree = match (
            company.asaas_wallet_id.as_deref().map(str::trim),
            company.wallet_id.as_deref().map(str::trim),
        ) {
            (Some(a), Some(b)) if !a.is_empty() && !b.is_empty() => a != b,
            _ => false,
        };

        let gateway_verified = match (&self.asaas, &resolved) {
            (Some(asaas), Some(wallet)) => Some(
                asaas
                    .wallet_exists(&wallet.wallet_id)
                    .await
                    .context("verifying wallet with gateway")?,
            ),
            (Some(_), None) => Some(false),
            (None, _) => None,
        };

        Ok(CompanyWalletReport {
            company_id,
            asaas_wallet_id: company.asaas_wallet_id,
            legacy_wallet_id: company.wallet_id,
            resolved,
            columns_disagree,
            gateway_verified,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_amount() {
        assert_eq!(parse_amount(&json!(150.0)).unwrap(), Cents(15000));
        assert_eq!(parse_amount(&json!("99.90")).unwrap(), Cents(9990));
        assert_eq!(parse_amount(&json!(1)).unwrap(), Cents(100));

        for bad in [json!(0), json!(-5), json!("1.234"), json!("abc"), json!(null), json!(true)] {
            match parse_amount(&bad) {
                Err(AppError::InvalidAmount(_)) => {}
                other => panic!("expected InvalidAmount for {}, got {:?}", bad, other),
            }
        }
    }

    #[test]
    fn test_resolve_idempotency_key() {
        assert_eq!(
            resolve_idempotency_key(Some("order-12345"), Some("body-key-1")).unwrap(),
            "order-12345"
        );
        assert_eq!(
            resolve_idempotency_key(None, Some("body-key-1")).unwrap(),
            "body-key-1"
        );
        assert!(resolve_idempotency_key(Some("short"), None).is_err());
        assert!(resolve_idempotency_key(Some("has spaces in it"), None).is_err());

        let generated = resolve_idempotency_key(None, Some("   ")).unwrap();
        assert!(Uuid::parse_str(&generated).is_ok());
    }

    #[test]
    fn test_fingerprint_depends_on_every_field() {
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let base = request_fingerprint(a, b, c, Cents(100));
        assert_eq!(base, request_fingerprint(a, b, c, Cents(100)));
        assert_ne!(base, request_fingerprint(a, b, c, Cents(101)));
        assert_ne!(base, request_fingerprint(b, a, c, Cents(100)));
        assert_eq!(base.len(), 64);
    }

    #[derive(Clone, Default)]
    struct LogBuffer(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for LogBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_invalid_phone_is_logged_by_client_id_only() {
        let client = Client {
            id: Uuid::new_v4(),
            company_id: None,
            name: "Maria".to_string(),
            cpf_cnpj: None,
            email: None,
            phone: Some("0000-98765".to_string()),
            birth_date: None,
        };

        let buffer = LogBuffer::default();
        let writer = buffer.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::TRACE)
            .finish();
        let customer =
            tracing::subscriber::with_default(subscriber, || relay_customer(&client));

        assert!(customer.mobile_phone.is_none());
        let logs = String::from_utf8(buffer.0.lock().unwrap().clone()).unwrap();
        assert!(logs.contains(&client.id.to_string()));
        assert!(!logs.contains("98765"));
    }
}
