//! Prints the columns of the tables the relay uses and flags missing ones.
//!
//! Read-only. Useful when a Supabase project drifted from what the service
//! expects, most often around the two company wallet columns.

use dotenvy::dotenv;
use sqlx::postgres::PgPoolOptions;
use std::collections::HashSet;
use std::env;

const EXPECTED: &[(&str, &[&str])] = &[
    (
        "clients",
        &["id", "company_id", "name", "cpf_cnpj", "email", "phone", "data_nascimento"],
    ),
    (
        "companies",
        &["id", "name", "cnpj", "asaas_wallet_id", "wallet_id", "reseller_wallet_id"],
    ),
    (
        "services",
        &["id", "name", "base_price", "operator_price", "reseller_price", "active"],
    ),
    (
        "service_orders",
        &[
            "id",
            "idempotency_key",
            "request_fingerprint",
            "client_id",
            "service_id",
            "company_id",
            "amount",
            "status",
            "asaas_payment_id",
            "pix_copy_paste",
            "qr_code_image",
            "invoice_url",
            "split",
        ],
    ),
    (
        "payment_webhook_events",
        &["event_id", "payment_id", "event", "payload", "received_at"],
    ),
    ("credit_packages", &["id", "name", "credits", "price", "active"]),
    (
        "credit_purchases",
        &[
            "id",
            "owner_type",
            "owner_id",
            "package_id",
            "credits",
            "amount",
            "status",
            "asaas_payment_id",
            "pix_copy_paste",
            "qr_code_image",
            "invoice_url",
        ],
    ),
    ("credits", &["id", "owner_type", "owner_id", "balance", "updated_at"]),
    (
        "credit_transactions",
        &[
            "id",
            "credit_id",
            "owner_type",
            "owner_id",
            "transaction_type",
            "amount",
            "balance_before",
            "balance_after",
        ],
    ),
];

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    let database_url =
        env::var("DATABASE_URL").map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;
    let schema = env::var("DB_SCHEMA").unwrap_or_else(|_| "public".to_string());
    let pool = PgPoolOptions::new()
        .max_connections(1)
        .connect(&database_url)
        .await?;

    let mut problems = 0;
    for (table, expected) in EXPECTED {
        let columns: Vec<(String, String)> = sqlx::query_as(
            "SELECT column_name, data_type FROM information_schema.columns \
             WHERE table_schema = $1 AND table_name = $2 ORDER BY ordinal_position",
        )
        .bind(&schema)
        .bind(table)
        .fetch_all(&pool)
        .await?;

        if columns.is_empty() {
            println!("✗ {}.{}: table not found", schema, table);
            problems += 1;
            continue;
        }

        println!("{}.{}", schema, table);
        for (col, type_) in &columns {
            println!("  - {}: {}", col, type_);
        }

        let present: HashSet<&str> = columns.iter().map(|(c, _)| c.as_str()).collect();
        for missing in expected.iter().filter(|c| !present.contains(*c)) {
            println!("  ✗ missing column {}", missing);
            problems += 1;
        }
        println!();
    }

    if problems == 0 {
        println!("✓ Schema has every expected column");
    } else {
        println!("{} schema problem(s) found", problems);
    }

    Ok(())
}
