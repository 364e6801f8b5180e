// API module for the LinkGuard node
//
// Two listeners: the public one accepts encrypted signals and hands out the
// public key; the operator one serves read-only cluster views to internal
// tooling and is meant to be bound to a private interface.

use crate::config::Config;
use crate::crypto::{IngestDecryptor, KeyExchange, OriginVerifier};
use crate::error::{LinkGuardError, Result};
use crate::merger::ClusterMerger;
use crate::storage::{create_store, ClusterStore};
use axum::{
    extract::DefaultBodyLimit,
    http::{header, HeaderValue, Method},
    middleware::from_fn_with_state,
    routing::{get, post},
    Router,
};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

pub mod handlers;
pub mod middleware;
pub mod operator;
pub mod rate_limit;

pub use middleware::{SourceIp, SourceIpLayer};
pub use rate_limit::RateLimiter;

/// Shared state of the public listener
pub struct AppState {
    pub merger: Arc<ClusterMerger>,
    pub decryptor: Arc<IngestDecryptor>,
    pub verifier: OriginVerifier,
    pub rate_limiter: Arc<RateLimiter>,
    pub keys: Arc<KeyExchange>,
    pub allowed_origins: Vec<String>,
}

impl AppState {
    /// Wire the ingest pipeline around an already loaded key and store.
    pub fn new(config: &Config, keys: Arc<KeyExchange>, store: Arc<dyn ClusterStore>) -> Self {
        Self {
            merger: Arc::new(ClusterMerger::new(store)),
            decryptor: Arc::new(IngestDecryptor::new(
                keys.clone(),
                config.api.ciphertext_encoding,
            )),
            verifier: OriginVerifier::new(&config.secrets.server_secret),
            rate_limiter: Arc::new(RateLimiter::from_config(&config.rate_limit)),
            keys,
            allowed_origins: config.api.allowed_origins.clone(),
        }
    }

    /// Load the private key and open the configured store.
    pub fn from_config(config: &Config) -> Result<Self> {
        let keys = Arc::new(KeyExchange::load(&config.secrets)?);
        let store = create_store(&config.storage)?;
        Ok(Self::new(config, keys, store))
    }
}

/// Shared state of the operator listener
pub struct OperatorState {
    pub store: Arc<dyn ClusterStore>,
    pub token: String,
    pub max_page_size: usize,
}

impl OperatorState {
    pub fn new(config: &Config, store: Arc<dyn ClusterStore>) -> Self {
        Self {
            store,
            token: config.operator.token.clone(),
            max_page_size: config.operator.max_page_size,
        }
    }
}

/// Public router: ingest, public key and health.
pub fn ingest_router(config: &Config, state: Arc<AppState>) -> Router {
    let origins: Vec<HeaderValue> = config
        .api
        .allowed_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("Ignoring invalid allowed origin {:?}", origin);
                None
            }
        })
        .collect();

    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        .route("/", post(handlers::ingest))
        .route("/keys", get(handlers::public_key))
        .route("/health", get(handlers::health_check))
        .layer(DefaultBodyLimit::max(config.api.max_body_bytes))
        .layer(SourceIpLayer::new(&config.api.source_ip_headers))
        .layer(cors)
        .layer(TimeoutLayer::new(config.api.request_timeout()))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Operator router: read-only cluster views behind the operator token.
pub fn operator_router(state: Arc<OperatorState>) -> Router {
    Router::new()
        .route("/internal/clusters", get(operator::list_clusters))
        .route("/internal/clusters/lookup", get(operator::lookup_cluster))
        .route("/internal/stats", get(operator::store_stats))
        .route_layer(from_fn_with_state(state.clone(), middleware::require_operator))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn parse_addr(name: &str, addr: &str) -> Result<SocketAddr> {
    addr.parse()
        .map_err(|e| LinkGuardError::Config(format!("Invalid {} {:?}: {}", name, addr, e)))
}

/// API Server
pub struct ApiServer {
    config: Config,
    state: Arc<AppState>,
    operator: Arc<OperatorState>,
}

impl ApiServer {
    /// Create a new API server over a loaded application state
    pub fn new(config: Config, state: Arc<AppState>) -> Self {
        let operator = Arc::new(OperatorState::new(&config, state.merger.store().clone()));
        Self {
            config,
            state,
            operator,
        }
    }

    /// Serve both listeners until `shutdown` resolves, then drain in-flight
    /// requests and return.
    pub async fn start<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let ingest_addr = parse_addr("api.bind_address", &self.config.api.bind_address)?;
        let operator_addr =
            parse_addr("operator.bind_address", &self.config.operator.bind_address)?;

        let ingest = axum::Server::try_bind(&ingest_addr).map_err(|e| {
            LinkGuardError::Config(format!("Failed to bind {}: {}", ingest_addr, e))
        })?;
        let operator = axum::Server::try_bind(&operator_addr).map_err(|e| {
            LinkGuardError::Config(format!("Failed to bind {}: {}", operator_addr, e))
        })?;

        let cleanup = self
            .state
            .rate_limiter
            .clone()
            .spawn_cleanup(self.config.rate_limit.cleanup_interval());

        let (stop_tx, stop_rx) = watch::channel(false);
        tokio::spawn(async move {
            shutdown.await;
            info!("Shutdown requested, draining listeners");
            let _ = stop_tx.send(true);
        });

        let mut ingest_stop = stop_rx.clone();
        let mut operator_stop = stop_rx;

        info!("Ingest API listening on {}", ingest_addr);
        info!("Operator API listening on {}", operator_addr);

        let ingest = ingest
            .serve(ingest_router(&self.config, self.state.clone()).into_make_service())
            .with_graceful_shutdown(async move {
                let _ = ingest_stop.changed().await;
            });
        let operator = operator
            .serve(operator_router(self.operator.clone()).into_make_service())
            .with_graceful_shutdown(async move {
                let _ = operator_stop.changed().await;
            });

        let result = tokio::try_join!(ingest, operator);
        cleanup.abort();

        result.map_err(|e| LinkGuardError::Internal(format!("Server error: {}", e)))?;
        info!("Listeners stopped");
        Ok(())
    }
}
