use crate::metrics::MetricRegistry;
use axum::{
    extract::Extension,
    http::{HeaderMap, HeaderValue, StatusCode},
    response::IntoResponse,
};
use tracing::{debug, error};

/// Render the latest successful poll results; never triggers a poll.
pub async fn metrics(Extension(registry): Extension<MetricRegistry>) -> impl IntoResponse {
    let mut headers = HeaderMap::new();
    headers.insert(
        "content-type",
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );

    match registry.render() {
        Ok(metrics) => {
            debug!("rendered metrics");
            (StatusCode::OK, headers, metrics)
        }
        Err(e) => {
            error!("Failed to render metrics: {e:#}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                headers,
                format!("Error rendering metrics: {e}"),
            )
        }
    }
}
