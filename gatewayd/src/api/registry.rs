use axum::{
    extract::{Request, State},
    Json,
};
use shared::codec;
use shared::signing::verify_request;
use shared::types::{AddressRecord, AuthAlgorithm, DnsRecord, RegistryInfo, ServiceMode};
use crate::api::routes::AppState;
use crate::error::GatewayError;

const MAX_REGISTRY_BODY: usize = 64 * 1024;

/// `POST /registry`: bind the signer's hostname to its advertised service.
pub async fn register(
    State(state): State<AppState>,
    request: Request,
) -> Result<Json<DnsRecord>, GatewayError> {
    let (parts, body) = request.into_parts();

    let pending = verify_request(&parts.uri, parts.method.as_str(), &parts.headers)
        .map_err(|e| GatewayError::Authentication(e.to_string()))?;
    if !pending.to_hostname.eq_ignore_ascii_case(&state.gateway.hostname) {
        return Err(GatewayError::Authentication(format!(
            "request addressed to {}",
            pending.to_hostname
        )));
    }

    let body = axum::body::to_bytes(body, MAX_REGISTRY_BODY)
        .await
        .map_err(|e| GatewayError::Authentication(format!("unreadable body: {}", e)))?;
    if !pending.verify(Some(&body)) {
        return Err(GatewayError::Authentication("signature mismatch".to_string()));
    }

    let info: RegistryInfo = serde_json::from_slice(&body)
        .map_err(|e| GatewayError::UnsupportedFeature(format!("registry info: {}", e)))?;

    match info.auth.algorithm.parse::<AuthAlgorithm>() {
        Ok(AuthAlgorithm::Bioforestchain) => {}
        Ok(AuthAlgorithm::Web3) => {
            return Err(GatewayError::UnsupportedFeature("algorithm web3".to_string()))
        }
        Err(other) => {
            return Err(GatewayError::UnsupportedFeature(format!("algorithm {}", other)))
        }
    }
    let mode = match info.service.mode.parse::<ServiceMode>() {
        Ok(ServiceMode::Http) => ServiceMode::Http,
        Ok(ServiceMode::Vm) => {
            return Err(GatewayError::UnsupportedFeature("mode vm".to_string()))
        }
        Err(other) => return Err(GatewayError::UnsupportedFeature(format!("mode {}", other))),
    };

    let declared_key = codec::decode(&info.auth.public_key)
        .map_err(|e| GatewayError::Authorization(format!("public key: {}", e)))?;
    if declared_key != pending.public_key {
        return Err(GatewayError::Authorization(
            "public key does not match signature".to_string(),
        ));
    }

    let from_hostname = pending.from_hostname.to_ascii_lowercase();
    let suffix = state.gateway.peer_suffix();
    if !from_hostname.ends_with(&suffix) || from_hostname.len() == suffix.len() {
        return Err(GatewayError::Authorization(format!(
            "{} is not under {}",
            from_hostname, suffix
        )));
    }

    let peer_address = pending.address();
    if let Some(existing) = state.store.get_record(&from_hostname).await? {
        if existing.peer_address != peer_address {
            return Err(GatewayError::Authorization(format!(
                "{} belongs to another key",
                from_hostname
            )));
        }
    }

    let record = DnsRecord {
        mode,
        origin: format!("{}://{}:{}", state.gateway.scheme, from_hostname, state.port),
        hostname: from_hostname.clone(),
        lookup_hostname: info
            .service
            .hostname
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| from_hostname.clone()),
        port: info.service.port,
        public_key: pending.public_key.clone(),
        peer_address: peer_address.clone(),
        lookup: None,
    };

    state.store.put_record(record.clone()).await?;
    state
        .store
        .put_address(AddressRecord {
            address: peer_address,
            hostname: from_hostname.clone(),
        })
        .await?;
    state.cache.invalidate(&from_hostname);

    tracing::info!(
        "Registered {} -> {}:{}",
        record.hostname,
        record.lookup_hostname,
        record.port
    );

    Ok(Json(record))
}
