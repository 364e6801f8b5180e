// Shared fixtures for the API integration tests

#![allow(dead_code)]

use axum::body::Body;
use axum::http::{Request, Response};
use axum::Router;
use linkguard_node::api::{ingest_router, operator_router, AppState, OperatorState};
use linkguard_node::config::{CiphertextEncoding, Config, StorageEngineKind};
use linkguard_node::crypto::{seal_claim, KeyExchange, OriginVerifier};
use linkguard_node::storage::{ClusterStore, MemoryClusterStore};
use linkguard_node::types::ClaimPayload;
use once_cell::sync::Lazy;
use std::sync::Arc;
use tower::ServiceExt;

pub const ORIGIN: &str = "https://app.example.com";
pub const SERVER_SECRET: &str = "backend-shared-secret";
pub const OPERATOR_TOKEN: &str = "operator-read-token";

static KEYS: Lazy<Arc<KeyExchange>> = Lazy::new(|| {
    Arc::new(KeyExchange::from_pem(include_str!("../fixtures/test_private_key.pem")).unwrap())
});

pub fn keys() -> Arc<KeyExchange> {
    KEYS.clone()
}

pub fn test_config() -> Config {
    let mut config = Config::default();
    config.api.allowed_origins = vec![ORIGIN.to_string()];
    config.storage.engine = StorageEngineKind::Memory;
    config.secrets.server_secret = SERVER_SECRET.to_string();
    config.operator.token = OPERATOR_TOKEN.to_string();
    config
}

/// Both routers over one in-memory store.
pub struct TestNode {
    pub config: Config,
    pub state: Arc<AppState>,
    pub store: Arc<dyn ClusterStore>,
    pub ingest: Router,
    pub operator: Router,
}

impl TestNode {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: Config) -> Self {
        Self::with_store(config, Arc::new(MemoryClusterStore::new()))
    }

    pub fn with_store(config: Config, store: Arc<dyn ClusterStore>) -> Self {
        let state = Arc::new(AppState::new(&config, keys(), store.clone()));
        let operator_state = Arc::new(OperatorState::new(&config, store.clone()));

        Self {
            ingest: ingest_router(&config, state.clone()),
            operator: operator_router(operator_state),
            config,
            state,
            store,
        }
    }

    /// Encrypted body for a correctly signed claim.
    pub fn sealed(&self, fingerprint: &str, account_id: &str) -> String {
        let hash = OriginVerifier::new(SERVER_SECRET).sign(account_id).unwrap();
        self.sealed_with_hash(fingerprint, account_id, &hash)
    }

    pub fn sealed_with_hash(&self, fingerprint: &str, account_id: &str, hash: &str) -> String {
        let claim = ClaimPayload {
            fingerprint: fingerprint.to_string(),
            id: account_id.to_string(),
            hash: hash.to_string(),
        };
        seal_claim(
            keys().public_key(),
            &claim,
            self.config.api.ciphertext_encoding,
        )
        .unwrap()
    }

    pub async fn submit(&self, body: String, ip: &str) -> Response<axum::body::BoxBody> {
        let request = Request::builder()
            .method("POST")
            .uri("/")
            .header("origin", ORIGIN)
            .header("x-forwarded-for", ip)
            .body(Body::from(body))
            .unwrap();
        self.ingest.clone().oneshot(request).await.unwrap()
    }

    pub async fn operator_get(&self, uri: &str, token: Option<&str>) -> Response<axum::body::BoxBody> {
        let mut request = Request::builder().method("GET").uri(uri);
        if let Some(token) = token {
            request = request.header("authorization", format!("Bearer {}", token));
        }
        self.operator
            .clone()
            .oneshot(request.body(Body::empty()).unwrap())
            .await
            .unwrap()
    }
}

pub async fn body_bytes(response: Response<axum::body::BoxBody>) -> Vec<u8> {
    hyper::body::to_bytes(response.into_body())
        .await
        .unwrap()
        .to_vec()
}

pub async fn body_json(response: Response<axum::body::BoxBody>) -> serde_json::Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

pub fn hex_config() -> Config {
    let mut config = test_config();
    config.api.ciphertext_encoding = CiphertextEncoding::Hex;
    config
}
