//! Host-based forwarding to registered peers.

use std::net::SocketAddr;
use axum::{
    body::Body,
    extract::{Request, State},
    http::{header, HeaderMap, Uri, Version},
    middleware::Next,
    response::{IntoResponse, Response},
};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use shared::protocol::HEADER_HOST;
use shared::types::DnsRecord;
use crate::api::routes::AppState;
use crate::error::GatewayError;

pub type ProxyClient = Client<HttpConnector, Body>;

pub fn client() -> ProxyClient {
    Client::builder(TokioExecutor::new()).build_http()
}

/// Hostname a request is addressed to: the explicit gateway header if
/// present, otherwise `Host` without its port.
pub fn target_host(headers: &HeaderMap) -> Option<String> {
    let raw = headers
        .get(HEADER_HOST)
        .or_else(|| headers.get(header::HOST))?
        .to_str()
        .ok()?;
    let host = match raw.rsplit_once(':') {
        Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => raw,
    };
    let host = host.trim().trim_end_matches('.').to_ascii_lowercase();
    (!host.is_empty()).then_some(host)
}

/// Forward requests for registered hostnames; pass everything else on.
pub async fn forward_by_host(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let Some(host) = target_host(request.headers()) else {
        return next.run(request).await;
    };

    match state.store.get_record(&host).await {
        Ok(Some(record)) => match forward(&state, record, request).await {
            Ok(response) => response,
            Err(e) => e.into_response(),
        },
        Ok(None) => next.run(request).await,
        Err(e) => GatewayError::from(e).into_response(),
    }
}

async fn forward(
    state: &AppState,
    record: DnsRecord,
    request: Request,
) -> Result<Response, GatewayError> {
    let lookup = match state
        .cache
        .resolve(&record.hostname, &record.lookup_hostname)
        .await
    {
        Ok(lookup) => lookup,
        Err(e) => return Err(upstream(record, e.to_string())),
    };

    let (mut parts, body) = request.into_parts();
    let upstream_addr = SocketAddr::new(lookup.address, record.port);
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    parts.uri = match format!("http://{}{}", upstream_addr, path_and_query).parse::<Uri>() {
        Ok(uri) => uri,
        Err(e) => return Err(GatewayError::Internal(format!("Bad upstream URI: {}", e))),
    };
    parts.version = Version::HTTP_11;

    tracing::debug!("Forwarding {} {} to {}", parts.method, path_and_query, upstream_addr);

    match state.proxy.request(Request::from_parts(parts, body)).await {
        Ok(response) => Ok(response.map(Body::new)),
        Err(e) => Err(upstream(record, e.to_string())),
    }
}

fn upstream(record: DnsRecord, reason: String) -> GatewayError {
    GatewayError::UpstreamUnavailable {
        record: Box::new(record),
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderValue, StatusCode};
    use axum::Router;
    use tower::ServiceExt;
    use crate::api::routes::{router, tests::{body_string, test_state}};
    use crate::store::sample_record;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_static(*value));
        }
        map
    }

    #[test]
    fn test_target_host() {
        assert_eq!(target_host(&headers(&[("host", "Peer-GW.local:8080")])).as_deref(), Some("peer-gw.local"));
        assert_eq!(
            target_host(&headers(&[("host", "gw.local"), ("x-dweb-cloud-host", "b1-gw.local")])).as_deref(),
            Some("b1-gw.local")
        );
        assert!(target_host(&HeaderMap::new()).is_none());
    }

    async fn spawn_peer() -> u16 {
        let app = Router::new().fallback(|req: Request| async move {
            format!("{} {}", req.method(), req.uri())
        });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        port
    }

    #[tokio::test]
    async fn test_registered_host_is_forwarded() {
        let state = test_state();
        let mut record = sample_record("b01-gw.local");
        record.port = spawn_peer().await;
        state.store.put_record(record).await.unwrap();

        let req = axum::http::Request::builder()
            .method("PUT")
            .uri("/items/7?x=1")
            .header("host", "b01-gw.local:8080")
            .body(Body::from("payload"))
            .unwrap();
        let resp = router(state).oneshot(req).await.unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_string(resp).await, "PUT /items/7?x=1");
    }

    #[tokio::test]
    async fn test_unreachable_peer_is_502() {
        let state = test_state();
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let mut record = sample_record("b02-gw.local");
        record.port = listener.local_addr().unwrap().port();
        drop(listener);
        state.store.put_record(record).await.unwrap();

        let req = axum::http::Request::builder()
            .uri("/")
            .header("host", "b02-gw.local")
            .body(Body::empty())
            .unwrap();
        let resp = router(state).oneshot(req).await.unwrap();

        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        let body: serde_json::Value = serde_json::from_str(&body_string(resp).await).unwrap();
        assert_eq!(body["record"]["hostname"], "b02-gw.local");
    }
}
