use axum::{
    extract::{Query, State},
    Json,
};
use serde::Deserialize;
use shared::types::DnsRecord;
use crate::api::routes::AppState;
use crate::error::GatewayError;

#[derive(Debug, Deserialize)]
pub struct QueryParams {
    pub hostname: Option<String>,
    pub address: Option<String>,
}

/// `GET /query?hostname=` or `?address=`: the stored record with its cached
/// lookup attached.
pub async fn query(
    State(state): State<AppState>,
    Query(params): Query<QueryParams>,
) -> Result<Json<DnsRecord>, GatewayError> {
    let hostname = match (params.hostname, params.address) {
        (Some(hostname), _) => hostname.to_ascii_lowercase(),
        (None, Some(address)) => state
            .store
            .get_hostname_by_address(&address)
            .await?
            .ok_or_else(|| GatewayError::NotFound(format!("address {}", address)))?,
        (None, None) => {
            return Err(GatewayError::NotFound(
                "hostname or address required".to_string(),
            ))
        }
    };

    let mut record = state
        .store
        .get_record(&hostname)
        .await?
        .ok_or_else(|| GatewayError::NotFound(format!("hostname {}", hostname)))?;
    record.lookup = state.cache.peek(&hostname);

    Ok(Json(record))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::StatusCode;
    use tower::ServiceExt;
    use shared::types::AddressRecord;
    use crate::api::routes::{router, tests::{body_string, test_state}, AppState};
    use crate::store::sample_record;

    async fn get(state: AppState, uri: &str) -> (StatusCode, String) {
        let req = axum::http::Request::builder()
            .uri(uri)
            .header("host", "gw.local")
            .body(Body::empty())
            .unwrap();
        let resp = router(state).oneshot(req).await.unwrap();
        (resp.status(), body_string(resp).await)
    }

    async fn seeded() -> AppState {
        let state = test_state();
        state.store.put_record(sample_record("b01-gw.local")).await.unwrap();
        state
            .store
            .put_address(AddressRecord {
                address: "b01".to_string(),
                hostname: "b01-gw.local".to_string(),
            })
            .await
            .unwrap();
        state
    }

    #[tokio::test]
    async fn test_query_by_hostname_and_address() {
        let state = seeded().await;

        let (status, body) = get(state.clone(), "/query?hostname=b01-gw.local").await;
        assert_eq!(status, StatusCode::OK);
        let record: DnsRecord = serde_json::from_str(&body).unwrap();
        assert_eq!(record.port, 9001);
        assert!(record.lookup.is_none());

        let (status, body) = get(state, "/query?address=b01").await;
        assert_eq!(status, StatusCode::OK);
        let record: DnsRecord = serde_json::from_str(&body).unwrap();
        assert_eq!(record.hostname, "b01-gw.local");
    }

    #[tokio::test]
    async fn test_query_attaches_cached_lookup() {
        let state = seeded().await;
        state.cache.resolve("b01-gw.local", "127.0.0.1").await.unwrap();

        let (_, body) = get(state, "/query?hostname=b01-gw.local").await;
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["lookup"]["address"], "127.0.0.1");
        assert_eq!(json["lookup"]["family"], 4);
    }

    #[tokio::test]
    async fn test_query_missing_is_404() {
        let state = seeded().await;
        assert_eq!(get(state.clone(), "/query?hostname=nobody-gw.local").await.0, StatusCode::NOT_FOUND);
        assert_eq!(get(state.clone(), "/query?address=b99").await.0, StatusCode::NOT_FOUND);
        assert_eq!(get(state, "/query").await.0, StatusCode::NOT_FOUND);
    }
}
