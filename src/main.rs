use moka::future::Cache;
use pix_relay::asaas_client::AsaasClient;
use pix_relay::config::{Config, StoreBackend};
use pix_relay::credits::CreditService;
use pix_relay::db::Database;
use pix_relay::handlers::AppState;
use pix_relay::payments::PaymentOrderService;
use pix_relay::pg_store::PgStore;
use pix_relay::postgrest::PostgrestStore;
use pix_relay::relay_client::RelayClient;
use pix_relay::routes::build_router;
use pix_relay::store::OrderStore;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Main entry point for the application.
///
/// Initializes tracing, loads configuration, connects the store and the
/// outbound clients, then starts the Axum server.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pix_relay=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::from_env()?;

    let store: Arc<dyn OrderStore> = match &config.store {
        StoreBackend::Postgres { database_url } => {
            let db = Database::new(database_url).await?;
            tracing::info!("Database connection pool established");
            Arc::new(PgStore::new(db.pool))
        }
        StoreBackend::Postgrest { base_url, api_key } => {
            let store = PostgrestStore::new(base_url, api_key.clone())?;
            tracing::info!("Using Supabase REST store at {}", base_url);
            Arc::new(store)
        }
    };

    let relay = RelayClient::new(
        config.relay_webhook_url.clone(),
        config.relay_chat_webhook_url.clone(),
        Duration::from_secs(config.relay_timeout_secs),
    )?;
    tracing::info!(
        "✓ Relay client initialized ({}s timeout, chat {})",
        config.relay_timeout_secs,
        if config.relay_chat_webhook_url.is_some() {
            "enabled"
        } else {
            "disabled"
        }
    );

    let asaas = match &config.asaas_api_key {
        Some(api_key) => {
            let client = AsaasClient::new(config.asaas_base_url.clone(), api_key.clone())?;
            tracing::info!("✓ Asaas client initialized: {}", config.asaas_base_url);
            Some(client)
        }
        None => None,
    };

    // Idempotency keys being processed; TTL bounds a crashed request's claim
    let in_flight = Cache::builder()
        .time_to_live(Duration::from_secs(config.relay_timeout_secs * 2 + 30))
        .max_capacity(10_000)
        .build();

    let payments = PaymentOrderService::new(
        store.clone(),
        relay.clone(),
        asaas,
        in_flight,
        config.platform_wallet_id.clone(),
        config.payment_due_days,
    );

    let app_state = Arc::new(AppState {
        store: store.clone(),
        config: config.clone(),
        payments,
        credits: CreditService::new(store, relay.clone(), config.payment_due_days),
        relay,
    });

    let app = build_router(app_state);

    // Start server
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
