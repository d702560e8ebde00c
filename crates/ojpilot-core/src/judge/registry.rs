//! Process-wide adapter registry.
//!
//! Adapters register once at startup; resolution happens by name or by
//! capability. Capability resolution returns the first match in
//! registration order, which keeps it deterministic.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;

use super::{Capability, ConfigField, JudgeAdapter};

/// Transport-facing summary of one registered adapter.
#[derive(Debug, Clone, Serialize)]
pub struct AdapterSummary {
    /// Registry key.
    pub name: String,
    /// Human-readable name.
    pub display_name: String,
    /// Adapter version.
    pub version: String,
    /// Declared capability set.
    pub capabilities: Vec<Capability>,
    /// Ordered configuration schema.
    pub config_schema: Vec<ConfigField>,
}

/// Registered adapters, resolvable by name and by capability.
#[derive(Default)]
pub struct AdapterRegistry {
    ordered: Vec<Arc<dyn JudgeAdapter>>,
    by_name: HashMap<String, usize>,
}

impl AdapterRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter. A second registration under the same name
    /// replaces the first.
    pub fn register(&mut self, adapter: Arc<dyn JudgeAdapter>) {
        let name = adapter.name().to_string();
        if let Some(&index) = self.by_name.get(&name) {
            self.ordered[index] = adapter;
        } else {
            self.by_name.insert(name, self.ordered.len());
            self.ordered.push(adapter);
        }
    }

    /// Resolve an adapter by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn JudgeAdapter>> {
        self.by_name
            .get(name)
            .map(|&index| Arc::clone(&self.ordered[index]))
    }

    /// Resolve the first registered adapter declaring `capability`.
    pub fn by_capability(&self, capability: Capability) -> Option<Arc<dyn JudgeAdapter>> {
        self.ordered
            .iter()
            .find(|a| a.capabilities().contains(&capability))
            .map(Arc::clone)
    }

    /// All adapters in registration order.
    pub fn all(&self) -> impl Iterator<Item = &Arc<dyn JudgeAdapter>> {
        self.ordered.iter()
    }

    /// Transport-facing summaries in registration order.
    pub fn summaries(&self) -> Vec<AdapterSummary> {
        self.ordered
            .iter()
            .map(|a| AdapterSummary {
                name: a.name().to_string(),
                display_name: a.display_name().to_string(),
                version: a.version().to_string(),
                capabilities: a.capabilities().to_vec(),
                config_schema: a.config_schema(),
            })
            .collect()
    }

    /// Number of registered adapters.
    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }
}
