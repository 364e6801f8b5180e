// Ingest listener integration tests
//
// Drive the public router end to end: origin and source IP checks, rate
// limiting, decryption, claim authentication and the resulting clusters.

mod common;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use common::{body_bytes, body_json, hex_config, test_config, TestNode, ORIGIN, SERVER_SECRET};
use linkguard_node::crypto::OriginVerifier;
use linkguard_node::storage::{ClusterStore, ClusterWrite, MemoryClusterStore};
use linkguard_node::types::{AttributeKind, Cluster, ClusterId, Signal, StoreStats};
use linkguard_node::Result;
use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tower::ServiceExt;

fn set(values: &[&str]) -> BTreeSet<String> {
    values.iter().map(|s| s.to_string()).collect()
}

#[tokio::test]
async fn test_signals_create_extend_and_merge_clusters() {
    let node = TestNode::new();

    // Empty store: a new cluster
    let response = node.submit(node.sealed("fp1", "u1"), "203.0.113.1").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(body_bytes(response).await.is_empty());

    // Shared account id: the same cluster grows
    let response = node.submit(node.sealed("fp2", "u1"), "203.0.113.2").await;
    assert_eq!(response.status(), StatusCode::OK);

    let clusters = node.store.list(None, None).await.unwrap();
    assert_eq!(clusters.len(), 1);
    assert_eq!(clusters[0].fingerprints, set(&["fp1", "fp2"]));
    assert_eq!(clusters[0].ips, set(&["203.0.113.1", "203.0.113.2"]));
    let first = clusters[0].id;

    // An unrelated user
    let response = node.submit(node.sealed("fp9", "u9"), "198.51.100.9").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(node.store.stats().await.unwrap().clusters, 2);

    // A signal bridging both clusters merges them into the older one
    let response = node.submit(node.sealed("fp9", "u1"), "198.51.100.10").await;
    assert_eq!(response.status(), StatusCode::OK);

    let clusters = node.store.list(None, None).await.unwrap();
    assert_eq!(clusters.len(), 1);
    assert_eq!(clusters[0].id, first);
    assert_eq!(clusters[0].account_ids, set(&["u1", "u9"]));
    assert_eq!(clusters[0].fingerprints, set(&["fp1", "fp2", "fp9"]));
}

#[tokio::test]
async fn test_resubmission_is_idempotent() {
    let node = TestNode::new();
    let body = node.sealed("fp1", "u1");

    for _ in 0..3 {
        let response = node.submit(body.clone(), "203.0.113.1").await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    let stats = node.store.stats().await.unwrap();
    assert_eq!(
        (stats.clusters, stats.fingerprints, stats.account_ids, stats.ips),
        (1, 1, 1, 1)
    );
}

#[tokio::test]
async fn test_sixth_request_is_rate_limited_without_store_change() {
    let node = TestNode::new();

    for i in 0..5 {
        let response = node
            .submit(node.sealed(&format!("fp{}", i), "u1"), "203.0.113.50")
            .await;
        assert_eq!(response.status(), StatusCode::OK);
    }
    let before = node.store.list(None, None).await.unwrap();

    let response = node.submit(node.sealed("fp-new", "u-new"), "203.0.113.50").await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body_json(response).await["error"]["code"], 429);
    assert_eq!(node.store.list(None, None).await.unwrap(), before);

    // Another address still has its own budget
    let response = node.submit(node.sealed("fp-new", "u-new"), "203.0.113.51").await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_origin_is_enforced() {
    let node = TestNode::new();
    let body = node.sealed("fp1", "u1");

    for origin in [None, Some("https://evil.example")] {
        let mut request = Request::builder()
            .method("POST")
            .uri("/")
            .header("x-forwarded-for", "203.0.113.1");
        if let Some(origin) = origin {
            request = request.header("origin", origin);
        }
        let response = node
            .ingest
            .clone()
            .oneshot(request.body(Body::from(body.clone())).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    assert_eq!(node.store.stats().await.unwrap().clusters, 0);
}

#[tokio::test]
async fn test_missing_source_ip_is_rejected() {
    let node = TestNode::new();
    let request = Request::builder()
        .method("POST")
        .uri("/")
        .header("origin", ORIGIN)
        .body(Body::from(node.sealed("fp1", "u1")))
        .unwrap();

    let response = node.ingest.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(node.store.stats().await.unwrap().clusters, 0);
}

#[tokio::test]
async fn test_forwarded_header_supplies_source_ip() {
    let node = TestNode::new();
    let request = Request::builder()
        .method("POST")
        .uri("/")
        .header("origin", ORIGIN)
        .header("forwarded", "for=\"[2001:db8::7]:443\";proto=https")
        .body(Body::from(node.sealed("fp1", "u1")))
        .unwrap();

    let response = node.ingest.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let cluster = node.store.lookup(None, "u1").await.unwrap().unwrap();
    assert_eq!(cluster.ips, set(&["2001:db8::7"]));
}

#[tokio::test]
async fn test_undecryptable_payloads_are_rejected() {
    let node = TestNode::new();

    for body in ["", "not base64 at all", "aGVsbG8gd29ybGQ="] {
        let response = node.submit(body.to_string(), "203.0.113.1").await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "body {:?}", body);

        let json = body_json(response).await;
        assert_eq!(json["error"]["code"], 400);
        assert_eq!(json["error"]["message"], "Invalid payload");
    }

    assert_eq!(node.store.stats().await.unwrap().clusters, 0);
}

#[tokio::test]
async fn test_forged_claim_is_unauthorized() {
    let node = TestNode::new();

    let forged = node.sealed_with_hash("fp1", "u1", &"00".repeat(32));
    let response = node.submit(forged, "203.0.113.1").await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // A valid hash for one account does not vouch for another
    let hash = OriginVerifier::new(SERVER_SECRET)
        .sign("u1")
        .unwrap();
    let response = node
        .submit(node.sealed_with_hash("fp1", "admin", &hash), "203.0.113.1")
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    assert_eq!(node.store.stats().await.unwrap().clusters, 0);
}

#[tokio::test]
async fn test_hex_encoded_bodies() {
    let node = TestNode::with_config(hex_config());
    let response = node.submit(node.sealed("fp1", "u1"), "203.0.113.1").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(node.store.stats().await.unwrap().clusters, 1);
}

#[tokio::test]
async fn test_oversized_body_is_rejected() {
    let node = TestNode::new();
    let body = "A".repeat(node.config.api.max_body_bytes + 1);
    let response = node.submit(body, "203.0.113.1").await;
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn test_public_key_endpoint() {
    let node = TestNode::new();

    let request = Request::builder()
        .uri("/keys")
        .header("origin", ORIGIN)
        .body(Body::empty())
        .unwrap();
    let response = node.ingest.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("access-control-allow-origin").unwrap(),
        ORIGIN
    );

    let pem = body_json(response).await;
    let pem = pem.as_str().unwrap();
    assert!(pem.starts_with("-----BEGIN PUBLIC KEY-----"));
    assert_eq!(pem, node.state.keys.public_key_pem());

    // CORS never echoes an origin outside the allow-list
    let request = Request::builder()
        .uri("/keys")
        .header("origin", "https://evil.example")
        .body(Body::empty())
        .unwrap();
    let response = node.ingest.clone().oneshot(request).await.unwrap();
    assert!(response
        .headers()
        .get("access-control-allow-origin")
        .is_none());
}

#[tokio::test]
async fn test_health_check() {
    let node = TestNode::new();
    let request = Request::builder()
        .uri("/health")
        .body(Body::empty())
        .unwrap();
    let response = node.ingest.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["status"], "healthy");
}

/// Memory store whose writes wait on a gate once armed.
struct GatedStore {
    inner: MemoryClusterStore,
    armed: AtomicBool,
    gate: Semaphore,
}

impl GatedStore {
    fn new() -> Self {
        Self {
            inner: MemoryClusterStore::new(),
            armed: AtomicBool::new(false),
            gate: Semaphore::new(0),
        }
    }
}

#[async_trait]
impl ClusterStore for GatedStore {
    async fn find_matching(&self, signal: &Signal) -> Result<Vec<Cluster>> {
        self.inner.find_matching(signal).await
    }

    async fn apply(&self, write: ClusterWrite) -> Result<ClusterId> {
        if self.armed.load(Ordering::SeqCst) {
            if let Ok(permit) = self.gate.acquire().await {
                permit.forget();
            }
        }
        self.inner.apply(write).await
    }

    async fn get(&self, id: ClusterId) -> Result<Option<Cluster>> {
        self.inner.get(id).await
    }

    async fn lookup(&self, kind: Option<AttributeKind>, value: &str) -> Result<Option<Cluster>> {
        self.inner.lookup(kind, value).await
    }

    async fn list(&self, limit: Option<usize>, offset: Option<usize>) -> Result<Vec<Cluster>> {
        self.inner.list(limit, offset).await
    }

    async fn stats(&self) -> Result<StoreStats> {
        self.inner.stats().await
    }
}

#[tokio::test]
async fn test_timed_out_request_still_completes_merge() {
    let mut config = test_config();
    config.api.request_timeout_secs = 1;
    let gated = Arc::new(GatedStore::new());
    let node = TestNode::with_store(config, gated.clone());

    node.state
        .merger
        .ingest(&Signal::new("fp1", "u1", "203.0.113.1"))
        .await
        .unwrap();
    node.state
        .merger
        .ingest(&Signal::new("fp9", "u9", "198.51.100.9"))
        .await
        .unwrap();
    let before = node.store.list(None, None).await.unwrap();
    assert_eq!(before.len(), 2);

    // The bridging write is held back until after the response times out
    gated.armed.store(true, Ordering::SeqCst);
    let response = node.submit(node.sealed("fp9", "u1"), "198.51.100.10").await;
    assert_eq!(response.status(), StatusCode::REQUEST_TIMEOUT);
    assert_eq!(node.store.list(None, None).await.unwrap(), before);

    gated.gate.add_permits(1);
    let mut clusters = Vec::new();
    for _ in 0..250 {
        clusters = node.store.list(None, None).await.unwrap();
        if clusters.len() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    assert_eq!(clusters.len(), 1);
    assert_eq!(clusters[0].id, before[0].id);
    assert_eq!(clusters[0].account_ids, set(&["u1", "u9"]));
    assert_eq!(
        clusters[0].ips,
        set(&["198.51.100.10", "198.51.100.9", "203.0.113.1"])
    );

    let mut seen = HashSet::new();
    for (kind, value) in clusters.iter().flat_map(|c| c.iter_attributes()) {
        assert!(seen.insert((kind, value.to_string())));
    }
}
