//! PIX payment-order relay.
//!
//! Accepts service orders, splits the amount between the platform and the
//! sub-licensee wallets, asks an n8n workflow to create the PIX charge at
//! the Asaas gateway, and keeps the resulting orders in Supabase.
//!
//! # Modules
//!
//! - `payments`: order validation, split and relay orchestration.
//! - `split`: exact-cent split allocation.
//! - `money`: integer centavo amounts.
//! - `relay_client`: n8n webhook client (charge and chat).
//! - `asaas_client`: Asaas gateway REST client.
//! - `circuit_breaker`: breaker guarding the relay.
//! - `store`: storage port, with `postgrest`, `pg_store` and `memory_store` adapters.
//! - `credits`: prepaid credit ledger.
//! - `contact`: CPF/CNPJ, phone and e-mail normalization.
//! - `handlers`, `webhook_handler`, `routes`, `extract`: HTTP surface.
//! - `config`, `db`, `errors`, `models`, `webhook_models`.

pub mod asaas_client;
pub mod circuit_breaker;
pub mod config;
pub mod contact;
pub mod credits;
pub mod db;
pub mod errors;
pub mod extract;
pub mod handlers;
pub mod memory_store;
pub mod models;
pub mod money;
pub mod payments;
pub mod pg_store;
pub mod postgrest;
pub mod relay_client;
pub mod routes;
pub mod split;
pub mod store;
pub mod webhook_handler;
pub mod webhook_models;
