//! Exporter configuration.
//!
//! Loaded once at startup from YAML (a file or stdin) and never mutated
//! afterwards. Every validation failure here is fatal: the process exits
//! before anything is served.

use anyhow::{Context, Result, anyhow, bail};
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderName, HeaderValue};
use secrecy::SecretString;
use serde::Deserialize;
use std::{
    collections::{BTreeMap, HashSet},
    env,
    io::Read,
    path::PathBuf,
    time::Duration,
};
use tracing::warn;

/// Environment variable consulted when the config carries no password.
pub const PASSWORD_ENV: &str = "JIRA_PASSWORD";

pub const DEFAULT_INTERVAL: &str = "5m";
pub const DEFAULT_MAX_RESULTS: u32 = 100;
pub const DEFAULT_REQUEST_TIMEOUT: &str = "30s";

/// Where to read the configuration from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConfigSource {
    Stdin,
    File(PathBuf),
}

impl ConfigSource {
    /// `-` means standard input, anything else is a path.
    pub fn from_arg(arg: &str) -> Self {
        if arg == "-" {
            Self::Stdin
        } else {
            Self::File(PathBuf::from(arg))
        }
    }
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stdin => write!(f, "<stdin>"),
            Self::File(path) => write!(f, "{}", path.display()),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawConfig {
    #[serde(rename = "baseURL")]
    base_url: String,
    login: String,
    password: Option<String>,
    #[serde(default)]
    http_headers: BTreeMap<String, String>,
    max_results: Option<u32>,
    request_timeout: Option<String>,
    #[serde(default)]
    metrics: Vec<RawMetric>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMetric {
    name: String,
    help: Option<String>,
    jql: String,
    interval: Option<String>,
    #[serde(default)]
    labels: BTreeMap<String, String>,
    group_by: Option<RawGroupBy>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawGroupBy {
    Field(String),
    Detailed { field: String, label: Option<String> },
}

/// Issue field whose sub-values become the dynamic label of a metric.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupBy {
    /// Name of the issue field requested from the search API, e.g. `components`.
    pub field: String,
    /// Label name the sub-values are published under.
    pub label: String,
}

/// Static description of one thing to poll and publish.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MetricDefinition {
    pub name: String,
    pub help: String,
    pub jql: String,
    pub interval: Duration,
    pub labels: BTreeMap<String, String>,
    pub group_by: Option<GroupBy>,
}

#[derive(Debug)]
pub struct Config {
    pub base_url: String,
    pub login: String,
    pub password: SecretString,
    pub http_headers: HeaderMap,
    pub max_results: u32,
    pub request_timeout: Duration,
    pub metrics: Vec<MetricDefinition>,
}

impl Config {
    /// Read and validate the configuration from `source`.
    ///
    /// # Errors
    ///
    /// Returns an error if the source cannot be read or the content is invalid
    pub fn load(source: &ConfigSource) -> Result<Self> {
        let data = match source {
            ConfigSource::Stdin => {
                let mut data = String::new();
                std::io::stdin()
                    .read_to_string(&mut data)
                    .context("failed to read configuration from stdin")?;
                data
            }
            ConfigSource::File(path) => std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?,
        };

        Self::from_yaml(&data).with_context(|| format!("invalid configuration in {source}"))
    }

    /// Parse and validate a YAML document.
    ///
    /// # Errors
    ///
    /// Returns an error on malformed YAML, bad intervals or headers, duplicate
    /// metric names or missing credentials
    pub fn from_yaml(data: &str) -> Result<Self> {
        let raw: RawConfig = serde_yaml::from_str(data).context("failed to parse config data")?;

        let password = resolve_password(raw.password)?;
        let http_headers = parse_headers(&raw.http_headers)?;

        let request_timeout = parse_interval(
            raw.request_timeout
                .as_deref()
                .unwrap_or(DEFAULT_REQUEST_TIMEOUT),
        )
        .context("invalid requestTimeout")?;

        let max_results = raw.max_results.unwrap_or(DEFAULT_MAX_RESULTS);
        if max_results == 0 {
            bail!("maxResults must be greater than zero");
        }

        let mut seen = HashSet::new();
        let mut metrics = Vec::with_capacity(raw.metrics.len());

        for (idx, m) in raw.metrics.into_iter().enumerate() {
            let definition =
                MetricDefinition::try_from(m).with_context(|| format!("invalid metric {idx}"))?;

            if !seen.insert(definition.name.clone()) {
                bail!("duplicate metric name '{}'", definition.name);
            }

            metrics.push(definition);
        }

        Ok(Self {
            base_url: raw.base_url,
            login: raw.login,
            password,
            http_headers,
            max_results,
            request_timeout,
            metrics,
        })
    }
}

impl TryFrom<RawMetric> for MetricDefinition {
    type Error = anyhow::Error;

    fn try_from(raw: RawMetric) -> Result<Self> {
        let name = raw.name.trim().to_string();
        if name.is_empty() {
            bail!("metric name must not be empty");
        }

        let interval = parse_interval(raw.interval.as_deref().unwrap_or(DEFAULT_INTERVAL))
            .with_context(|| format!("invalid interval for metric '{name}'"))?;

        let help = match raw.help {
            Some(help) if !help.trim().is_empty() => help,
            _ => format!("Number of Jira issues matching: {}", raw.jql),
        };

        let group_by = raw.group_by.map(|g| match g {
            RawGroupBy::Field(field) => GroupBy {
                label: field.clone(),
                field,
            },
            RawGroupBy::Detailed { field, label } => GroupBy {
                label: label.unwrap_or_else(|| field.clone()),
                field,
            },
        });

        Ok(Self {
            name,
            help,
            jql: raw.jql,
            interval,
            labels: raw.labels,
            group_by,
        })
    }
}

/// Parse a human readable duration such as `5m` or `1h30m`; zero is rejected.
pub fn parse_interval(value: &str) -> Result<Duration> {
    let interval = humantime::parse_duration(value.trim())
        .with_context(|| format!("cannot parse duration '{value}'"))?;

    if interval.is_zero() {
        return Err(anyhow!("duration '{value}' must be greater than zero"));
    }

    Ok(interval)
}

fn resolve_password(password: Option<String>) -> Result<SecretString> {
    match password.filter(|p| !p.is_empty()) {
        Some(password) => Ok(SecretString::from(password)),
        None => env::var(PASSWORD_ENV)
            .ok()
            .filter(|p| !p.is_empty())
            .map(SecretString::from)
            .ok_or_else(|| anyhow!("{PASSWORD_ENV} environment variable not set")),
    }
}

fn parse_headers(headers: &BTreeMap<String, String>) -> Result<HeaderMap> {
    let mut map = HeaderMap::with_capacity(headers.len());

    for (name, value) in headers {
        let header = HeaderName::from_bytes(name.as_bytes())
            .with_context(|| format!("invalid header name '{name}'"))?;

        // basic auth is attached to every request and must not be shadowed
        if header == AUTHORIZATION {
            warn!(header = %name, "ignoring configured header, basic auth takes precedence");
            continue;
        }

        let value = HeaderValue::from_str(value)
            .with_context(|| format!("invalid value for header '{name}'"))?;
        map.insert(header, value);
    }

    Ok(map)
}
