use crate::{config::GroupBy, metrics::Observations};
use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};

/// Subset of `/rest/api/2/search` we care about.
#[derive(Debug, Default, Deserialize)]
pub struct SearchResponse {
    /// Number of issues matching the query, regardless of `maxResults`.
    #[serde(default)]
    pub total: Option<u64>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub issues: Vec<Issue>,
}

#[derive(Debug, Default, Deserialize)]
pub struct Issue {
    #[serde(default, deserialize_with = "null_as_default")]
    pub fields: Map<String, Value>,
}

// `default` only covers a missing key, Jira also sends explicit nulls
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

impl SearchResponse {
    /// Count issues per sub-value of `group_by`, or the total when ungrouped.
    pub fn observations(&self, group_by: Option<&GroupBy>) -> Observations {
        let Some(group_by) = group_by else {
            let returned = u64::try_from(self.issues.len()).unwrap_or(u64::MAX);
            return Observations::Total(self.total.unwrap_or(returned));
        };

        let mut counts = BTreeMap::new();
        for issue in &self.issues {
            let values: BTreeSet<&str> = issue
                .fields
                .get(&group_by.field)
                .map(sub_values)
                .unwrap_or_default()
                .into_iter()
                .collect();

            for value in values {
                *counts.entry(value.to_string()).or_insert(0) += 1;
            }
        }

        Observations::Grouped(counts)
    }
}

// Jira fields come as plain strings (labels), objects with a `name`
// (components, versions, priority) or a `value` (custom select fields),
// either alone or in a list.
fn sub_values(field: &Value) -> Vec<&str> {
    match field {
        Value::String(s) => vec![s.as_str()],
        Value::Object(obj) => obj
            .get("name")
            .or_else(|| obj.get("value"))
            .and_then(Value::as_str)
            .into_iter()
            .collect(),
        Value::Array(items) => items.iter().flat_map(sub_values).collect(),
        _ => Vec::new(),
    }
}
