//! Query executor: one bounded search request per poll cycle.

mod response;

pub use response::{Issue, SearchResponse};

use crate::{
    config::{Config, MetricDefinition},
    metrics::Observations,
};
use anyhow::{Context, Result};
use reqwest::{StatusCode, header::HeaderMap};
use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;
use tracing::{debug, instrument};
use url::Url;

pub const SEARCH_PATH: &str = "/rest/api/2/search";

/// Why a poll cycle produced no observations.
#[derive(Debug, Error)]
pub enum PollError {
    #[error("failed to build search URL from '{base_url}': {source}")]
    Url {
        base_url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("request to {url} failed: {source}")]
    Transport {
        url: Url,
        #[source]
        source: reqwest::Error,
    },

    #[error("received status {status} for {url}")]
    Status { url: Url, status: StatusCode },

    #[error("failed to decode response from {url}: {source}")]
    Decode {
        url: Url,
        #[source]
        source: serde_json::Error,
    },
}

impl PollError {
    /// Short name of the failing stage, used as a metric label.
    pub const fn stage(&self) -> &'static str {
        match self {
            Self::Url { .. } => "url",
            Self::Transport { .. } => "transport",
            Self::Status { .. } => "status",
            Self::Decode { .. } => "decode",
        }
    }
}

/// Issues search requests against one Jira instance.
///
/// Holds no per-request state, so a single instance is shared by every poll
/// task.
#[derive(Clone)]
pub struct SearchClient {
    http: reqwest::Client,
    base_url: String,
    login: String,
    password: SecretString,
    headers: HeaderMap,
    max_results: u32,
}

impl SearchClient {
    /// Build a client from the loaded configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying HTTP client cannot be created
    pub fn new(config: &Config) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .timeout(config.request_timeout)
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            http,
            base_url: config.base_url.clone(),
            login: config.login.clone(),
            password: config.password.clone(),
            headers: config.http_headers.clone(),
            max_results: config.max_results,
        })
    }

    /// Search URL for a definition: the query, the result cap and only the
    /// field needed for label extraction.
    ///
    /// # Errors
    ///
    /// Returns `PollError::Url` if the base URL cannot be parsed
    pub fn search_url(&self, definition: &MetricDefinition) -> Result<Url, PollError> {
        let fields = definition
            .group_by
            .as_ref()
            .map_or("key", |g| g.field.as_str());

        let endpoint = format!("{}{SEARCH_PATH}", self.base_url.trim_end_matches('/'));
        let max_results = self.max_results.to_string();

        Url::parse_with_params(
            &endpoint,
            &[
                ("jql", definition.jql.as_str()),
                ("maxResults", max_results.as_str()),
                ("fields", fields),
            ],
        )
        .map_err(|source| PollError::Url {
            base_url: self.base_url.clone(),
            source,
        })
    }

    /// Run one search for `definition`.
    ///
    /// # Errors
    ///
    /// Returns a `PollError` describing the stage that failed; nothing is
    /// retried
    #[instrument(
        skip(self, definition),
        level = "debug",
        fields(otel.kind = "client", metric = %definition.name)
    )]
    pub async fn search(&self, definition: &MetricDefinition) -> Result<Observations, PollError> {
        let url = self.search_url(definition)?;

        debug!(%url, "checking");

        // static headers first, auth last so it always wins
        let response = self
            .http
            .get(url.clone())
            .headers(self.headers.clone())
            .basic_auth(&self.login, Some(self.password.expose_secret()))
            .send()
            .await
            .map_err(|source| PollError::Transport {
                url: url.clone(),
                source,
            })?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(PollError::Status { url, status });
        }

        let body = response
            .bytes()
            .await
            .map_err(|source| PollError::Transport {
                url: url.clone(),
                source,
            })?;

        let result: SearchResponse =
            serde_json::from_slice(&body).map_err(|source| PollError::Decode { url, source })?;

        Ok(result.observations(definition.group_by.as_ref()))
    }
}
