use std::sync::Arc;
use axum::{
    extract::Request,
    http::{header, Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use shared::protocol::{NOT_FOUND_BODY, QUERY_PATH, REGISTRY_PATH};
use crate::api::{query, registry};
use crate::config::GatewayConfig;
use crate::lookup_cache::LookupCache;
use crate::proxy::{self, ProxyClient};
use crate::store::RecordStore;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn RecordStore>,
    pub cache: LookupCache,
    pub gateway: Arc<GatewayConfig>,
    /// Port written into issued origins
    pub port: u16,
    pub proxy: ProxyClient,
}

/// Requests for a registered peer hostname are forwarded before routing;
/// everything else reaches the registry endpoints or the 404 fallback.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route(REGISTRY_PATH, post(registry::register).fallback(not_found))
        .route(QUERY_PATH, get(query::query).fallback(not_found))
        .fallback(not_found)
        .layer(middleware::from_fn_with_state(state.clone(), proxy::forward_by_host))
        .layer(middleware::from_fn(cors_preflight))
        .with_state(state)
}

async fn not_found() -> (StatusCode, &'static str) {
    (StatusCode::NOT_FOUND, NOT_FOUND_BODY)
}

async fn cors_preflight(request: Request, next: Next) -> Response {
    if request.method() != Method::OPTIONS {
        return next.run(request).await;
    }
    (
        StatusCode::NO_CONTENT,
        [
            (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
            (header::ACCESS_CONTROL_ALLOW_METHODS, "*"),
            (header::ACCESS_CONTROL_ALLOW_HEADERS, "*"),
            (header::ACCESS_CONTROL_MAX_AGE, "86400"),
        ],
    )
        .into_response()
}
