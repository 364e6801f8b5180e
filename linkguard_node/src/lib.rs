// LinkGuard Node
//
// This crate implements a ban-evasion detection service. A trusted backend
// forwards one encrypted signal per user session, binding a device
// fingerprint to an account id; the node pairs it with the request's source
// IP and folds it into clusters of identifiers linked by shared values.
// Moderators then read those clusters to spot one person behind several
// accounts.
//
// # Architecture
//
// * **API Layer**: public ingest listener and a separate operator listener
// * **Crypto Layer**: RSA-OAEP key exchange, payload decryption and HMAC
//   claim authentication
// * **Merger**: create, extend or merge clusters under one critical section
// * **Storage Engine**: pluggable cluster stores with three attribute indices
//
// # Usage
//
// ```rust,no_run
// use linkguard_node::api::{ApiServer, AppState};
// use linkguard_node::config::Config;
// use std::sync::Arc;
//
// async fn example() -> Result<(), Box<dyn std::error::Error>> {
//     let config = Config::load(Some("config.toml"))?;
//     config.validate()?;
//
//     let state = Arc::new(AppState::from_config(&config)?);
//     ApiServer::new(config, state)
//         .start(async { let _ = tokio::signal::ctrl_c().await; })
//         .await?;
//     Ok(())
// }
// ```

/// HTTP listeners for the LinkGuard node.
///
/// * `POST /` ingests one encrypted signal
/// * `GET /keys` publishes the RSA public key
/// * `/internal/*` read-only operator views, on their own socket
pub mod api;

/// Configuration loading and validation.
pub mod config;

/// Key exchange, ingest decryption and claim authentication.
pub mod crypto;

/// Error types and their HTTP mapping.
pub mod error;

/// Cluster maintenance: create, extend and merge.
pub mod merger;

/// Cluster storage backends.
///
/// * `MemoryClusterStore` for development and tests
/// * `SqlClusterStore` for persistent deployments
pub mod storage;

/// Core types: signals, clusters and attribute kinds.
pub mod types;

pub use error::{LinkGuardError, Result};
