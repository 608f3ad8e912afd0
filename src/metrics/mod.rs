//! Metric registry: one gauge family per metric definition.
//!
//! Each family is written by exactly one poll task and read by any number of
//! concurrent scrapes. Individual gauge values are atomic; a scrape racing a
//! multi-label write may see some labels from the new cycle and some from the
//! previous one, but never a partially written value.

mod poll;

pub use poll::{PollStats, PollTimer};

use crate::config::MetricDefinition;
use anyhow::{Context, Result, bail};
use prometheus::{Encoder, GaugeVec, Opts, Registry, TextEncoder};
use std::{
    collections::{BTreeMap, HashSet},
    sync::Arc,
};
use tracing::debug;

/// Prefix of every published gauge family.
pub const METRIC_PREFIX: &str = "jira";

/// Published metric name for a definition name.
pub fn published_name(name: &str) -> String {
    format!("{METRIC_PREFIX}_{name}")
}

/// Result of one successful poll cycle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Observations {
    /// Ungrouped metric: a single value without a dynamic label.
    Total(u64),
    /// Issue count per dynamic label value.
    Grouped(BTreeMap<String, u64>),
}

/// The gauge family owned by a single metric definition.
#[derive(Clone)]
pub struct MetricFamily {
    definition: Arc<MetricDefinition>,
    published_name: String,
    gauge: GaugeVec,
}

impl MetricFamily {
    fn new(definition: MetricDefinition) -> Result<Self> {
        let published_name = published_name(&definition.name);

        // the client library accepts a repeated label name and renders an
        // unparseable series
        if let Some(group_by) = &definition.group_by
            && definition.labels.contains_key(&group_by.label)
        {
            bail!(
                "metric '{published_name}': groupBy label '{}' collides with a static label",
                group_by.label
            );
        }

        let opts = Opts::new(published_name.as_str(), definition.help.as_str()).const_labels(
            definition
                .labels
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        );

        let variable_labels: Vec<&str> = definition
            .group_by
            .as_ref()
            .map(|g| vec![g.label.as_str()])
            .unwrap_or_default();

        let gauge = GaugeVec::new(opts, &variable_labels)
            .with_context(|| format!("invalid gauge definition for '{published_name}'"))?;

        // ungrouped families are exposed from setup, starting at zero
        if variable_labels.is_empty() {
            let no_labels: [&str; 0] = [];
            gauge.with_label_values(&no_labels).set(0.0);
        }

        Ok(Self {
            definition: Arc::new(definition),
            published_name,
            gauge,
        })
    }

    pub fn definition(&self) -> &MetricDefinition {
        &self.definition
    }

    /// Definition name, used to label logs and poll stats.
    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn published_name(&self) -> &str {
        &self.published_name
    }

    /// Replace the family's state with the observations of a new cycle.
    ///
    /// New values are written first and labels missing from `observations`
    /// are removed afterwards, so a concurrent scrape never loses a label that
    /// is present both before and after the write.
    pub fn publish(&self, observations: &Observations) {
        match observations {
            Observations::Total(total) => {
                let no_labels: [&str; 0] = [];
                self.gauge
                    .with_label_values(&no_labels)
                    .set(count_value(*total));
            }
            Observations::Grouped(counts) => {
                for (value, count) in counts {
                    self.gauge
                        .with_label_values(&[value.as_str()])
                        .set(count_value(*count));
                }

                for stale in self.label_values() {
                    if !counts.contains_key(&stale) {
                        debug!(metric = %self.published_name, value = %stale, "removing stale label");
                        if let Err(e) = self.gauge.remove_label_values(&[stale.as_str()]) {
                            debug!(
                                metric = %self.published_name,
                                value = %stale,
                                "failed to remove label: {e}"
                            );
                        }
                    }
                }
            }
        }
    }

    /// Current `label value -> gauge value` pairs; the key is empty for
    /// ungrouped families.
    pub fn snapshot(&self) -> BTreeMap<String, f64> {
        let label = self.definition.group_by.as_ref().map(|g| g.label.as_str());
        let mut values = BTreeMap::new();

        for family in prometheus::core::Collector::collect(&self.gauge) {
            for metric in family.get_metric() {
                let key = label
                    .and_then(|label| {
                        metric
                            .get_label()
                            .iter()
                            .find(|pair| pair.name() == label)
                            .map(|pair| pair.value().to_string())
                    })
                    .unwrap_or_default();
                values.insert(key, metric.get_gauge().value());
            }
        }

        values
    }

    fn label_values(&self) -> Vec<String> {
        self.snapshot().into_keys().collect()
    }
}

#[allow(clippy::cast_precision_loss)]
fn count_value(count: u64) -> f64 {
    count as f64
}

/// Holds every gauge family plus the exporter's own poll stats.
#[derive(Clone)]
pub struct MetricRegistry {
    registry: Registry,
    families: Arc<[MetricFamily]>,
    polls: PollStats,
}

impl MetricRegistry {
    /// Register one gauge family per definition.
    ///
    /// Published names are checked for duplicates before anything is
    /// registered, so a failing setup leaves no partial registration behind.
    ///
    /// # Errors
    ///
    /// Returns an error on duplicate published names or invalid metric/label names
    pub fn new(definitions: &[MetricDefinition]) -> Result<Self> {
        let mut seen = HashSet::with_capacity(definitions.len());
        for definition in definitions {
            let name = published_name(&definition.name);
            if !seen.insert(name.clone()) {
                bail!("duplicate metric '{name}'");
            }
        }

        let families = definitions
            .iter()
            .cloned()
            .map(MetricFamily::new)
            .collect::<Result<Vec<_>>>()?;

        let registry = Registry::new();
        for family in &families {
            registry
                .register(Box::new(family.gauge.clone()))
                .with_context(|| format!("failed to register '{}'", family.published_name))?;
            debug!(metric = %family.published_name, "registered gauge family");
        }

        let polls = PollStats::new()?;
        polls.register(&registry)?;

        Ok(Self {
            registry,
            families: families.into(),
            polls,
        })
    }

    pub fn families(&self) -> &[MetricFamily] {
        &self.families
    }

    pub fn polls(&self) -> &PollStats {
        &self.polls
    }

    pub fn gather(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// Render the current state in the prometheus text exposition format.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .context("failed to encode metrics")?;

        String::from_utf8(buffer).context("metrics output is not valid UTF-8")
    }
}
