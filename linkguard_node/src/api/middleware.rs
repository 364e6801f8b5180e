// API middleware for the LinkGuard node
//
// Source IP extraction for the ingest listener, the origin allow-list check
// and bearer token authentication for the operator listener.

use crate::api::OperatorState;
use crate::error::{LinkGuardError, Result};
use axum::{
    extract::State,
    http::{header, HeaderMap, HeaderName, Request},
    middleware::Next,
    response::Response,
};
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::task::{Context, Poll};
use subtle::ConstantTimeEq;
use tower::{Layer, Service};
use tracing::{debug, warn};

/// Client address resolved from proxy headers, `None` when no configured
/// header carried a valid IP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceIp(pub Option<IpAddr>);

/// Strip an optional port (and IPv6 brackets) from a `Forwarded` node.
fn strip_port(node: &str) -> &str {
    if let Some(rest) = node.strip_prefix('[') {
        return rest.find(']').map_or(rest, |end| &rest[..end]);
    }
    match node.rfind(':') {
        // Only IPv4 carries a bare `:port`; a colon in IPv6 is part of it
        Some(colon) if node[..colon].contains('.') => &node[..colon],
        _ => node,
    }
}

/// First `for=` address of an RFC 7239 `Forwarded` header.
fn parse_forwarded(value: &str) -> Option<IpAddr> {
    value
        .split(',')
        .flat_map(|element| element.split(';'))
        .filter_map(|pair| {
            let (key, node) = pair.trim().split_once('=')?;
            key.eq_ignore_ascii_case("for")
                .then(|| node.trim().trim_matches('"'))
        })
        .next()
        .and_then(|node| IpAddr::from_str(strip_port(node)).ok())
}

/// Resolve the source IP from `headers`, trying `names` in priority order.
pub fn extract_source_ip(headers: &HeaderMap, names: &[HeaderName]) -> Option<IpAddr> {
    for name in names {
        let Some(value) = headers.get(name).and_then(|v| v.to_str().ok()) else {
            continue;
        };

        let ip = if *name == header::FORWARDED {
            parse_forwarded(value)
        } else {
            // Lists carry the client first, then each proxy
            value
                .split(',')
                .next()
                .and_then(|first| IpAddr::from_str(first.trim()).ok())
        };

        if let Some(ip) = ip {
            debug!("Extracted source IP from {} header: {}", name, ip);
            return Some(ip);
        }
    }
    None
}

/// Layer inserting a `SourceIp` extension into every request.
#[derive(Clone)]
pub struct SourceIpLayer {
    headers: Arc<[HeaderName]>,
}

impl SourceIpLayer {
    /// Build from configured header names; names that are not valid header
    /// names are skipped.
    pub fn new(names: &[String]) -> Self {
        let headers: Vec<HeaderName> = names
            .iter()
            .filter_map(|name| {
                let lowered = name.trim().to_ascii_lowercase();
                match HeaderName::from_bytes(lowered.as_bytes()) {
                    Ok(header) => Some(header),
                    Err(_) => {
                        warn!("Ignoring invalid source IP header name {:?}", name);
                        None
                    }
                }
            })
            .collect();
        Self {
            headers: headers.into(),
        }
    }
}

impl<S> Layer<S> for SourceIpLayer {
    type Service = SourceIpService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        SourceIpService {
            inner,
            headers: self.headers.clone(),
        }
    }
}

/// Service implementation for `SourceIpLayer`
#[derive(Clone)]
pub struct SourceIpService<S> {
    inner: S,
    headers: Arc<[HeaderName]>,
}

impl<S, B> Service<Request<B>> for SourceIpService<S>
where
    S: Service<Request<B>>,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = S::Future;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<B>) -> Self::Future {
        let ip = extract_source_ip(req.headers(), &self.headers);
        req.extensions_mut().insert(SourceIp(ip));
        self.inner.call(req)
    }
}

/// Require an `Origin` header naming one of the allowed origins.
pub fn check_origin(headers: &HeaderMap, allowed: &[String]) -> Result<()> {
    let origin = headers
        .get(header::ORIGIN)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().trim_end_matches('/'))
        .ok_or_else(|| LinkGuardError::Forbidden("missing Origin header".to_string()))?;

    if allowed
        .iter()
        .any(|candidate| candidate.trim_end_matches('/') == origin)
    {
        Ok(())
    } else {
        Err(LinkGuardError::Forbidden(format!(
            "origin {:?} is not allowed",
            origin
        )))
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
}

/// Operator listener authentication: `Authorization: Bearer <token>`.
pub async fn require_operator<B>(
    State(state): State<Arc<OperatorState>>,
    request: Request<B>,
    next: Next<B>,
) -> Result<Response> {
    let expected = state.token.as_bytes();
    let authorized = match bearer_token(request.headers()) {
        Some(token) => !expected.is_empty() && bool::from(token.as_bytes().ct_eq(expected)),
        None => false,
    };

    if !authorized {
        warn!("Rejected operator request to {}", request.uri().path());
        return Err(LinkGuardError::Authentication(
            "invalid operator token".to_string(),
        ));
    }

    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn names(list: &[&'static str]) -> Vec<HeaderName> {
        list.iter().copied().map(HeaderName::from_static).collect()
    }

    fn default_names() -> Vec<HeaderName> {
        names(&[
            "forwarded",
            "x-forwarded-for",
            "x-real-ip",
            "cf-connecting-ip",
            "true-client-ip",
        ])
    }

    #[test]
    fn test_forwarded_header_forms() {
        assert_eq!(
            parse_forwarded("for=192.0.2.60;proto=http;by=203.0.113.43"),
            Some("192.0.2.60".parse().unwrap())
        );
        assert_eq!(
            parse_forwarded("For=\"[2001:db8:cafe::17]:4711\""),
            Some("2001:db8:cafe::17".parse().unwrap())
        );
        assert_eq!(
            parse_forwarded("for=198.51.100.17:8080, for=192.0.2.43"),
            Some("198.51.100.17".parse().unwrap())
        );
        assert_eq!(parse_forwarded("for=unknown"), None);
        assert_eq!(parse_forwarded("proto=https"), None);
    }

    #[test]
    fn test_header_priority() {
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", HeaderValue::from_static("10.0.0.3"));
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.7, 10.0.0.1"),
        );
        assert_eq!(
            extract_source_ip(&headers, &default_names()),
            Some("203.0.113.7".parse().unwrap())
        );

        // Restricting the list skips headers that are present
        assert_eq!(
            extract_source_ip(&headers, &names(&["x-real-ip"])),
            Some("10.0.0.3".parse().unwrap())
        );
    }

    #[test]
    fn test_invalid_values_fall_through() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("garbage"));
        headers.insert("cf-connecting-ip", HeaderValue::from_static("198.51.100.9"));
        assert_eq!(
            extract_source_ip(&headers, &default_names()),
            Some("198.51.100.9".parse().unwrap())
        );

        assert_eq!(extract_source_ip(&HeaderMap::new(), &default_names()), None);
    }

    #[test]
    fn test_layer_skips_invalid_names() {
        let layer = SourceIpLayer::new(&["X-Real-IP".to_string(), "bad header".to_string()]);
        assert_eq!(layer.headers.len(), 1);
        assert_eq!(layer.headers[0], "x-real-ip");
    }

    #[test]
    fn test_check_origin() {
        let allowed = vec!["https://app.example.com".to_string()];

        let mut headers = HeaderMap::new();
        assert!(matches!(
            check_origin(&headers, &allowed),
            Err(LinkGuardError::Forbidden(_))
        ));

        headers.insert(header::ORIGIN, HeaderValue::from_static("https://evil.example"));
        assert!(check_origin(&headers, &allowed).is_err());

        headers.insert(header::ORIGIN, HeaderValue::from_static("https://app.example.com"));
        assert!(check_origin(&headers, &allowed).is_ok());
    }

    #[test]
    fn test_bearer_token() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(bearer_token(&headers), None);
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer tok"));
        assert_eq!(bearer_token(&headers), Some("tok"));
    }
}
