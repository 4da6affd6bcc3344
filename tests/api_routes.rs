/// Router-level tests: requests go through the full axum stack
/// (body limit, rate limiter, handlers) with mocked outbound services
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use moka::future::Cache;
use pix_relay::config::{Config, StoreBackend, ASAAS_SANDBOX_URL};
use pix_relay::credits::CreditService;
use pix_relay::handlers::AppState;
use pix_relay::memory_store::{FailPoint, MemoryStore};
use pix_relay::models::{Company, CreditPackage, Service};
use pix_relay::money::Cents;
use pix_relay::payments::PaymentOrderService;
use pix_relay::relay_client::RelayClient;
use pix_relay::routes::build_router;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;
use uuid::Uuid;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

const WEBHOOK_TOKEN: &str = "whsec_test_token";

struct TestApp {
    router: Router,
    store: MemoryStore,
    client_id: Uuid,
    service_id: Uuid,
    company_id: Uuid,
}

fn test_config(relay_url: &str) -> Config {
    Config {
        port: 0,
        store: StoreBackend::Postgrest {
            base_url: "http://localhost:54321".to_string(),
            api_key: "unused".to_string(),
        },
        relay_webhook_url: relay_url.to_string(),
        relay_chat_webhook_url: None,
        relay_timeout_secs: 1,
        asaas_api_key: None,
        asaas_base_url: ASAAS_SANDBOX_URL.to_string(),
        asaas_webhook_token: Some(WEBHOOK_TOKEN.to_string()),
        platform_wallet_id: "wallet_platform".to_string(),
        payment_due_days: 1,
    }
}

async fn test_app(relay_url: &str) -> TestApp {
    let store = MemoryStore::new();
    let client_id = Uuid::new_v4();
    let service_id = Uuid::new_v4();
    let company_id = Uuid::new_v4();

    store
        .put_client(pix_relay::models::Client {
            id: client_id,
            company_id: Some(company_id),
            name: "João Lima".to_string(),
            cpf_cnpj: None,
            email: None,
            phone: None,
            birth_date: None,
        })
        .await;
    store
        .put_company(Company {
            id: company_id,
            name: "Acme".to_string(),
            cnpj: None,
            asaas_wallet_id: Some("wallet_company".to_string()),
            wallet_id: None,
            reseller_wallet_id: None,
            subaccount_status: None,
        })
        .await;
    store
        .put_service(Service {
            id: service_id,
            name: "Consulta".to_string(),
            category: None,
            base_price: Cents(1000),
            operator_price: Cents(1000),
            reseller_price: Cents::ZERO,
            active: true,
        })
        .await;

    let config = test_config(relay_url);
    let shared: Arc<dyn pix_relay::store::OrderStore> = Arc::new(store.clone());
    let relay = RelayClient::new(config.relay_webhook_url.clone(), None, Duration::from_secs(1))
        .unwrap()
        .with_retry_backoff(Duration::from_millis(10));
    let payments = PaymentOrderService::new(
        shared.clone(),
        relay.clone(),
        None,
        Cache::builder().build(),
        config.platform_wallet_id.clone(),
        config.payment_due_days,
    );

    let state = Arc::new(AppState {
        store: shared.clone(),
        config,
        payments,
        credits: CreditService::new(shared, relay.clone(), 1),
        relay,
    });

    TestApp {
        router: build_router(state),
        store,
        client_id,
        service_id,
        company_id,
    }
}

fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .header("x-forwarded-for", "203.0.113.7")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn webhook_request(body: Value) -> Request<Body> {
    let mut request = json_request("POST", "/api/webhooks/asaas", body);
    request
        .headers_mut()
        .insert("asaas-access-token", WEBHOOK_TOKEN.parse().unwrap());
    request
}

fn get_request(uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header("x-forwarded-for", "203.0.113.7")
        .body(Body::empty())
        .unwrap()
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

impl TestApp {
    fn order_body(&self, amount: Value) -> Value {
        json!({
            "customerId": self.client_id,
            "serviceId": self.service_id,
            "companyId": self.company_id,
            "amount": amount
        })
    }
}

#[tokio::test]
async fn test_health_bypasses_rate_limiter() {
    let app = test_app("http://127.0.0.1:9").await;
    let request = Request::builder()
        .uri("/health")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&app.router, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
}

#[tokio::test]
async fn test_create_order_then_replay() {
    let relay = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "pay_route_1",
            "status": "PENDING",
            "payload": "000201"
        })))
        .expect(1)
        .mount(&relay)
        .await;
    let app = test_app(&relay.uri()).await;

    let mut request = json_request(
        "POST",
        "/api/payments/create-service-order",
        app.order_body(json!(20)),
    );
    request
        .headers_mut()
        .insert("Idempotency-Key", "route-key-0001".parse().unwrap());
    let (status, body) = send(&app.router, request).await;

    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["paymentId"], "pay_route_1");
    assert_eq!(body["replayed"], false);
    assert_eq!(body["qrCodeAvailable"], false);
    assert_eq!(
        body["split"],
        json!([
            {"walletId": "wallet_platform", "value": 10.0},
            {"walletId": "wallet_company", "value": 10.0}
        ])
    );

    let mut again = json_request(
        "POST",
        "/api/payments/create-service-order",
        app.order_body(json!("20.00")),
    );
    again
        .headers_mut()
        .insert("Idempotency-Key", "route-key-0001".parse().unwrap());
    let (status, replay) = send(&app.router, again).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(replay["replayed"], true);
    assert_eq!(replay["id"], body["id"]);

    let (status, fetched) = send(
        &app.router,
        get_request(&format!("/api/payments/{}", body["id"].as_str().unwrap())),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["paymentId"], "pay_route_1");
}

#[tokio::test]
async fn test_error_responses_carry_codes() {
    let app = test_app("http://127.0.0.1:9").await;

    let (status, body) = send(
        &app.router,
        json_request(
            "POST",
            "/api/payments/create-service-order",
            app.order_body(json!("-1")),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "INVALID_AMOUNT");

    let mut unknown_service = app.order_body(json!(10));
    unknown_service["serviceId"] = json!(Uuid::new_v4());
    let (status, body) = send(
        &app.router,
        json_request("POST", "/api/payments/create-service-order", unknown_service),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "SERVICE_NOT_FOUND");

    let (status, body) = send(&app.router, get_request(&format!("/api/payments/{}", Uuid::new_v4()))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "NOT_FOUND");
}

#[tokio::test]
async fn test_wallet_missing_is_unprocessable() {
    let app = test_app("http://127.0.0.1:9").await;
    app.store
        .put_company(Company {
            id: app.company_id,
            name: "Acme".to_string(),
            cnpj: None,
            asaas_wallet_id: None,
            wallet_id: None,
            reseller_wallet_id: None,
            subaccount_status: None,
        })
        .await;

    let (status, body) = send(
        &app.router,
        json_request(
            "POST",
            "/api/payments/create-service-order",
            app.order_body(json!(10)),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["code"], "COMPANY_WALLET_MISSING");
}

#[tokio::test]
async fn test_asaas_webhook_requires_token_and_updates_order() {
    let relay = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "pay_hook_1"})))
        .mount(&relay)
        .await;
    let app = test_app(&relay.uri()).await;

    let (_, created) = send(
        &app.router,
        json_request(
            "POST",
            "/api/payments/create-service-order",
            app.order_body(json!(20)),
        ),
    )
    .await;
    assert_eq!(created["status"], "PENDING");

    let event = json!({
        "id": "evt_hook_1",
        "event": "PAYMENT_RECEIVED",
        "payment": {"id": "pay_hook_1", "status": "RECEIVED"}
    });

    let (status, _) = send(
        &app.router,
        json_request("POST", "/api/webhooks/asaas", event.clone()),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let mut authed = json_request("POST", "/api/webhooks/asaas", event.clone());
    authed
        .headers_mut()
        .insert("asaas-access-token", WEBHOOK_TOKEN.parse().unwrap());
    let (status, body) = send(&app.router, authed).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["processed"], 1);

    let (_, order) = send(
        &app.router,
        get_request(&format!("/api/payments/{}", created["id"].as_str().unwrap())),
    )
    .await;
    assert_eq!(order["status"], "RECEIVED");

    let mut redelivered = json_request("POST", "/api/webhooks/asaas", json!([event]));
    redelivered
        .headers_mut()
        .insert("asaas-access-token", WEBHOOK_TOKEN.parse().unwrap());
    let (_, body) = send(&app.router, redelivered).await;
    assert_eq!(body["duplicates"], 1);
    assert_eq!(body["processed"], 0);
}

#[tokio::test]
async fn test_credit_purchase_credited_only_after_payment() {
    let relay = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "pay_credit_route",
            "status": "PENDING",
            "payload": "000201",
            "encodedImage": "img"
        })))
        .expect(1)
        .mount(&relay)
        .await;
    let app = test_app(&relay.uri()).await;
    let package_id = Uuid::new_v4();
    app.store
        .put_credit_package(CreditPackage {
            id: package_id,
            name: "Starter".to_string(),
            credits: 50,
            price: Cents(4990),
            active: true,
        })
        .await;
    let owner = app.company_id;
    let balance_uri = format!("/api/credits/balance?ownerType=company&ownerId={}", owner);

    let (status, packages) = send(&app.router, get_request("/api/credits/packages")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(packages[0]["price"], 49.9);

    let (status, bought) = send(
        &app.router,
        json_request(
            "POST",
            "/api/credits/purchase",
            json!({"ownerType": "company", "ownerId": owner, "packageId": package_id}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(bought["status"], "PENDING");
    assert_eq!(bought["paymentId"], "pay_credit_route");
    assert_eq!(bought["credits"], 50);
    assert_eq!(bought["qrCodeAvailable"], true);

    let (_, balance) = send(&app.router, get_request(&balance_uri)).await;
    assert_eq!(balance["balance"], 0);

    let (status, body) = send(
        &app.router,
        json_request(
            "POST",
            "/api/credits/consume",
            json!({"ownerType": "company", "ownerId": owner, "amount": 10}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "INSUFFICIENT_CREDITS");

    let (status, body) = send(
        &app.router,
        webhook_request(json!({
            "id": "evt_credit_received",
            "event": "PAYMENT_RECEIVED",
            "payment": {"id": "pay_credit_route", "status": "RECEIVED"}
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["processed"], 1);

    let (_, balance) = send(&app.router, get_request(&balance_uri)).await;
    assert_eq!(balance["balance"], 50);

    // A later confirmation of the same charge does not grant again.
    let (status, _) = send(
        &app.router,
        webhook_request(json!({
            "id": "evt_credit_confirmed",
            "event": "PAYMENT_CONFIRMED",
            "payment": {"id": "pay_credit_route", "status": "CONFIRMED"}
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (_, balance) = send(&app.router, get_request(&balance_uri)).await;
    assert_eq!(balance["balance"], 50);

    let (status, purchase) = send(
        &app.router,
        get_request(&format!(
            "/api/credits/purchases/{}",
            bought["id"].as_str().unwrap()
        )),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(purchase["status"], "PAID");

    let (_, history) = send(
        &app.router,
        get_request(&format!(
            "/api/credits/transactions?ownerType=company&ownerId={}&limit=10",
            owner
        )),
    )
    .await;
    assert_eq!(history.as_array().unwrap().len(), 1);
    assert_eq!(history[0]["transaction_type"], "purchase");
}

#[tokio::test]
async fn test_malformed_requests_get_structured_errors() {
    let app = test_app("http://127.0.0.1:9").await;

    let mut no_amount = app.order_body(json!(10));
    no_amount.as_object_mut().unwrap().remove("amount");
    let (status, body) = send(
        &app.router,
        json_request("POST", "/api/payments/create-service-order", no_amount),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "INVALID_AMOUNT");

    let mut bad_customer = app.order_body(json!(10));
    bad_customer["customerId"] = json!("not-a-uuid");
    let (status, body) = send(
        &app.router,
        json_request("POST", "/api/payments/create-service-order", bad_customer),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "BAD_REQUEST");
    assert!(body["error"].as_str().unwrap().contains("customerId"));

    let truncated = Request::builder()
        .method("POST")
        .uri("/api/credits/consume")
        .header("content-type", "application/json")
        .header("x-forwarded-for", "203.0.113.7")
        .body(Body::from("{\"ownerType\": \"company\""))
        .unwrap();
    let (status, body) = send(&app.router, truncated).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "BAD_REQUEST");

    let (status, body) = send(&app.router, get_request("/api/payments/not-a-uuid")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "BAD_REQUEST");

    let (status, body) = send(
        &app.router,
        get_request(&format!(
            "/api/credits/balance?ownerType=robot&ownerId={}",
            Uuid::new_v4()
        )),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "BAD_REQUEST");
}

#[tokio::test]
async fn test_webhook_failure_is_redelivered() {
    let relay = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "pay_hook_2"})))
        .mount(&relay)
        .await;
    let app = test_app(&relay.uri()).await;

    let (_, created) = send(
        &app.router,
        json_request(
            "POST",
            "/api/payments/create-service-order",
            app.order_body(json!(20)),
        ),
    )
    .await;
    let event = json!({
        "id": "evt_hook_2",
        "event": "PAYMENT_CONFIRMED",
        "payment": {"id": "pay_hook_2", "status": "CONFIRMED"}
    });

    app.store.fail_once(FailPoint::UpdateOrderStatus).await;
    let (status, body) = send(&app.router, webhook_request(event.clone())).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["failed"], 1);
    assert_eq!(body["processed"], 0);

    let (status, body) = send(&app.router, webhook_request(event)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["processed"], 1);
    assert_eq!(body["duplicates"], 0);

    let (_, order) = send(
        &app.router,
        get_request(&format!("/api/payments/{}", created["id"].as_str().unwrap())),
    )
    .await;
    assert_eq!(order["status"], "CONFIRMED");
}

#[tokio::test]
async fn test_chat_unconfigured_and_oversized_body() {
    let app = test_app("http://127.0.0.1:9").await;

    let (status, body) = send(
        &app.router,
        json_request(
            "POST",
            "/api/chat",
            json!({"sessionId": "s1", "message": "Oi, quero um orçamento"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["code"], "SERVICE_UNAVAILABLE");

    let huge = "x".repeat(2 * 1024 * 1024);
    let (status, _) = send(
        &app.router,
        json_request("POST", "/api/chat", json!({"sessionId": "s1", "message": huge})),
    )
    .await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
}
