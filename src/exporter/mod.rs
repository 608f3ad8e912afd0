use crate::{
    cli::telemetry::shutdown_tracer,
    config::Config,
    jira::SearchClient,
    metrics::MetricRegistry,
    scheduler::Scheduler,
};
use anyhow::{Context, Result};
use axum::{
    Extension, Router,
    body::Body,
    http::{HeaderName, HeaderValue, Request},
    middleware::{Next, from_fn},
    response::Response,
    routing::get,
};
use opentelemetry::global;
use opentelemetry::trace::{TraceContextExt, TraceId};
use opentelemetry_http::HeaderExtractor;
use std::{net::SocketAddr, time::Duration};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::{
    request_id::PropagateRequestIdLayer, set_header::SetRequestHeaderLayer, trace::TraceLayer,
};
use tracing::{Span, error, info, info_span};
use tracing_opentelemetry::OpenTelemetrySpanExt;
use ulid::Ulid;

mod handlers;
mod shutdown;

pub use shutdown::shutdown_signal;

pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = if let Some(hash) = built_info::GIT_COMMIT_HASH {
    hash
} else {
    ":-("
};

/// Run the exporter until SIGINT/SIGTERM.
///
/// Fatal setup errors (duplicate metrics, bad headers, bind failure) are
/// returned before anything is served.
///
/// # Errors
///
/// Returns an error if the registry, the HTTP client or the listener cannot be set up
pub async fn new(http_addr: SocketAddr, config: Config) -> Result<()> {
    let registry = MetricRegistry::new(&config.metrics).context("failed to setup gauges")?;
    let client = SearchClient::new(&config)?;

    let listener = TcpListener::bind(http_addr)
        .await
        .with_context(|| format!("Failed to bind to {http_addr}"))?;

    let token = CancellationToken::new();
    let signal_token = token.clone();
    tokio::spawn(async move {
        tokio::select! {
            () = shutdown_signal() => info!("Shutting down..."),
            () = signal_token.cancelled() => {}
        }
        signal_token.cancel();
    });

    serve(listener, registry, client, token).await?;

    shutdown_tracer();

    Ok(())
}

/// Serve `/metrics` and `/health` on `listener` while the scheduler polls.
///
/// Cancelling `token` stops accepting connections, stops every poll task and
/// returns once all of them have exited.
///
/// # Errors
///
/// Returns an error if the scheduler task panicked
pub async fn serve(
    listener: TcpListener,
    registry: MetricRegistry,
    client: SearchClient,
    token: CancellationToken,
) -> Result<()> {
    let bind_addr = listener.local_addr()?;

    let scheduler = Scheduler::new(client, registry.clone());
    let poller = tokio::spawn({
        let token = token.clone();
        async move { scheduler.run(token).await }
    });

    println!(
        "{} {} - Listening on {bind_addr}\n\nPolled metrics:\n{}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        format_list(
            &registry
                .families()
                .iter()
                .map(|f| format!(
                    "{} (every {})",
                    f.published_name(),
                    humantime::format_duration(f.definition().interval)
                ))
                .collect::<Vec<_>>()
        ),
    );

    let app = router(registry);

    let shutdown = token.clone();
    if let Err(e) = axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
    {
        error!(error=%e, "server error");
    }

    // a failed server must not leave the pollers running
    token.cancel();
    poller.await.context("poll scheduler failed")?;

    info!("shutting down");

    Ok(())
}

fn router(registry: MetricRegistry) -> Router {
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(make_span)
        .on_response(on_response);

    Router::new()
        .route("/metrics", get(handlers::metrics))
        .route("/health", get(handlers::health).options(handlers::health))
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestHeaderLayer::if_not_present(
                    HeaderName::from_static("x-request-id"),
                    |_req: &_| HeaderValue::from_str(Ulid::new().to_string().as_str()).ok(),
                ))
                .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
                    "x-request-id",
                )))
                .layer(trace_layer)
                .layer(from_fn(add_trace_headers))
                .layer(Extension(registry)),
        )
}

// Helper to format a list of items with a leading dash and indentation for the
// start up message
fn format_list<T: std::fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(|i| format!("  - {i}"))
        .collect::<Vec<_>>()
        .join("\n")
}

fn make_span(request: &Request<Body>) -> Span {
    let parent_cx =
        global::get_text_map_propagator(|prop| prop.extract(&HeaderExtractor(request.headers())));

    let header = |name: &str, default: &'static str| {
        request
            .headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or(default)
            .to_string()
    };

    let span = info_span!(
        "http.server.request",
        otel.kind = "server",
        http.method = request.method().as_str(),
        http.route = request.uri().path(),
        http.target = %request.uri(),
        http.user_agent = header("user-agent", "unknown"),
        request_id = header("x-request-id", "none"),
        otel.status_code = tracing::field::Empty,
    );

    let _ = span.set_parent(parent_cx);

    span
}

fn on_response<B>(response: &axum::http::Response<B>, latency: Duration, span: &Span) {
    let status_code = if response.status().is_server_error() {
        "ERROR"
    } else {
        "OK"
    };
    span.record("otel.status_code", status_code);

    let elapsed_ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
    let trace_id = span.context().span().span_context().trace_id();

    if trace_id == TraceId::INVALID {
        info!(
            parent: span,
            status = response.status().as_u16(),
            elapsed_ms,
            "request completed"
        );
    } else {
        info!(
            parent: span,
            status = response.status().as_u16(),
            elapsed_ms,
            trace_id = %trace_id,
            "request completed"
        );
    }
}

async fn add_trace_headers(req: Request<Body>, next: Next) -> Response {
    let mut res = next.run(req).await;

    let span_context = Span::current().context().span().span_context().clone();

    if span_context.is_valid()
        && let Ok(val) = HeaderValue::from_str(&span_context.trace_id().to_string())
    {
        res.headers_mut()
            .insert(HeaderName::from_static("x-trace-id"), val);
    }

    res
}
