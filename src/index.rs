//! Searchable, denormalized copy of the remote tool catalog.
//!
//! Updates are whole-service only so a reader never sees half of a
//! service's tool set.

use std::sync::{Arc, PoisonError, RwLock};

use rmcp::model::{JsonObject, Tool};
use serde::Serialize;
use serde_json::Value;

/// Parameter as pulled out of a tool's input schema.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParameterInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub description: String,
    pub required: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexEntry {
    pub display_name: String,
    /// Original name on the owning service
    pub name: String,
    pub description: String,
    #[serde(rename = "service")]
    pub service_name: String,
    pub service_description: String,
    pub parameters: Vec<ParameterInfo>,
    pub input_schema: Arc<JsonObject>,
}

impl IndexEntry {
    pub fn from_tool(
        tool: &Tool,
        display_name: impl Into<String>,
        service_name: impl Into<String>,
        service_description: impl Into<String>,
    ) -> Self {
        Self {
            display_name: display_name.into(),
            name: tool.name.to_string(),
            description: tool.description.as_deref().unwrap_or_default().to_string(),
            service_name: service_name.into(),
            service_description: service_description.into(),
            parameters: parameters_from_schema(&tool.input_schema),
            input_schema: tool.input_schema.clone(),
        }
    }

    pub fn required_parameters(&self) -> impl Iterator<Item = &str> {
        self.parameters
            .iter()
            .filter(|p| p.required)
            .map(|p| p.name.as_str())
    }

    fn matches(&self, query: &str) -> bool {
        self.name.to_lowercase().contains(query)
            || self.display_name.to_lowercase().contains(query)
            || self.description.to_lowercase().contains(query)
            || self.service_name.to_lowercase().contains(query)
            || self.service_description.to_lowercase().contains(query)
            || self.parameters.iter().any(|p| {
                p.name.to_lowercase().contains(query)
                    || p.description.to_lowercase().contains(query)
            })
    }

    /// Ranking for an already lowercased, non-empty query.
    ///
    /// Name tiers are exclusive (exact 100, prefix 50, substring 30); the
    /// description adds 10, each parameter name 5, each parameter description 3.
    fn score(&self, query: &str) -> u32 {
        let name = self.name.to_lowercase();
        let display = self.display_name.to_lowercase();

        let mut score = if name == query || display == query {
            100
        } else if name.starts_with(query) || display.starts_with(query) {
            50
        } else if name.contains(query) || display.contains(query) {
            30
        } else {
            0
        };

        if self.description.to_lowercase().contains(query) {
            score += 10;
        }
        for param in &self.parameters {
            if param.name.to_lowercase().contains(query) {
                score += 5;
            }
            if param.description.to_lowercase().contains(query) {
                score += 3;
            }
        }
        score
    }
}

/// Pull `properties` and `required` out of a JSON-schema object.
pub fn parameters_from_schema(schema: &JsonObject) -> Vec<ParameterInfo> {
    let required: Vec<&str> = schema
        .get("required")
        .and_then(Value::as_array)
        .map(|names| names.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();

    let Some(properties) = schema.get("properties").and_then(Value::as_object) else {
        return Vec::new();
    };

    properties
        .iter()
        .map(|(name, prop)| ParameterInfo {
            name: name.clone(),
            kind: prop
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or("any")
                .to_string(),
            description: prop
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            required: required.contains(&name.as_str()),
        })
        .collect()
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    #[serde(flatten)]
    pub entry: IndexEntry,
    pub score: u32,
}

/// Per-service rollup of the index.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceSummary {
    pub name: String,
    pub description: String,
    pub tool_count: usize,
}

#[derive(Default)]
pub struct ToolIndex {
    entries: RwLock<Vec<IndexEntry>>,
}

impl ToolIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, entries: Vec<IndexEntry>) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(entries);
    }

    /// Swap a service's entries for `entries` in one step.
    ///
    /// Another service's entry under one of the new display names is dropped
    /// too, matching the registry where the latest registration wins.
    pub fn replace_service(&self, service: &str, entries: Vec<IndexEntry>) {
        let mut all = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        all.retain(|e| {
            e.service_name != service
                && !entries.iter().any(|n| n.display_name == e.display_name)
        });
        all.extend(entries);
    }

    pub fn remove_all_for_service(&self, service: &str) -> usize {
        let mut all = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let before = all.len();
        all.retain(|e| e.service_name != service);
        before - all.len()
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Look up by display name, then by original name.
    pub fn get(&self, name: &str) -> Option<IndexEntry> {
        let all = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        all.iter()
            .find(|e| e.display_name == name)
            .or_else(|| all.iter().find(|e| e.name == name))
            .cloned()
    }

    /// Entry for `original` as registered by `service`.
    pub fn entry(&self, service: &str, original: &str) -> Option<IndexEntry> {
        let all = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        all.iter()
            .find(|e| e.service_name == service && e.name == original)
            .cloned()
    }

    /// Case-insensitive search, best score first, insertion order on ties.
    ///
    /// An empty query returns every entry (after the service filter) with
    /// score 0.
    pub fn search(&self, query: &str, service: Option<&str>, limit: usize) -> Vec<SearchHit> {
        let query = query.trim().to_lowercase();
        let all = self.entries.read().unwrap_or_else(PoisonError::into_inner);

        let mut hits: Vec<SearchHit> = all
            .iter()
            .filter(|e| service.map_or(true, |s| e.service_name == s))
            .filter(|e| query.is_empty() || e.matches(&query))
            .map(|e| SearchHit {
                score: if query.is_empty() { 0 } else { e.score(&query) },
                entry: e.clone(),
            })
            .collect();

        // Stable sort keeps insertion order among equal scores
        hits.sort_by(|a, b| b.score.cmp(&a.score));
        hits.truncate(limit);
        hits
    }

    /// One row per owning service, in first-seen order.
    pub fn services(&self) -> Vec<ServiceSummary> {
        let all = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let mut out: Vec<ServiceSummary> = Vec::new();
        for entry in all.iter() {
            match out.iter_mut().find(|s| s.name == entry.service_name) {
                Some(summary) => summary.tool_count += 1,
                None => out.push(ServiceSummary {
                    name: entry.service_name.clone(),
                    description: entry.service_description.clone(),
                    tool_count: 1,
                }),
            }
        }
        out
    }
}
