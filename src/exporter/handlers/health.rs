use crate::{exporter::GIT_COMMIT_HASH, metrics::MetricRegistry};
use axum::{
    body::Body,
    extract::Extension,
    http::{HeaderMap, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Json},
};
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Serialize, Deserialize, Debug)]
pub struct Health {
    commit: String,
    name: String,
    version: String,
    metrics: usize,
}

fn create_health_response(registry: &MetricRegistry) -> Health {
    Health {
        commit: GIT_COMMIT_HASH.to_string(),
        name: env!("CARGO_PKG_NAME").to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        metrics: registry.families().len(),
    }
}

// Only GET carries a body
fn create_response_body(method: &Method, health: &Health) -> Body {
    if *method == Method::GET {
        Json(health).into_response().into_body()
    } else {
        Body::empty()
    }
}

// X-App: name:version:shorthash
fn create_app_headers(health: &Health) -> HeaderMap {
    let short_hash = health.commit.get(..7).unwrap_or_default();
    let header_value = format!("{}:{}:{}", health.name, health.version, short_hash);

    let mut headers = HeaderMap::new();
    match header_value.parse::<HeaderValue>() {
        Ok(value) => {
            headers.insert("X-App", value);
        }
        Err(err) => debug!("Failed to parse X-App header: {}", err),
    }
    headers
}

pub async fn health(
    method: Method,
    Extension(registry): Extension<MetricRegistry>,
) -> impl IntoResponse {
    let health = create_health_response(&registry);
    let body = create_response_body(&method, &health);
    let headers = create_app_headers(&health);

    (StatusCode::OK, headers, body)
}
