//! Model Registry
//!
//! Canonical map of logical models to the concrete providers that can serve
//! them. Populated by the catalog feed, read by the selector on every plan.
//!
//! # Concurrency
//!
//! The registry is read-mostly. Readers clone an `Arc` to the current
//! snapshot under a short read lock and then work without any lock held.
//! Writers take a write gate, copy the map under a read lock, edit the copy
//! with no lock on the map, and take the write lock only to swap the `Arc`.
//! A reader never observes a half-written provider list and only waits for
//! that swap.
//!
//! ```text
//! register([m1, m2]) ──> gate ──> clone map ──> upsert ──> swap Arc
//!                                                            │
//! lookup("m1") ──> read lock ──> clone Arc ──────────────────┘
//! ```

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use super::error::RoutingError;

// ============================================================================
// Provider Configuration
// ============================================================================

/// Capability flags of one provider offering
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderCapabilities {
    /// Supports streamed responses
    pub streaming: bool,

    /// Supports tool/function calling
    pub function_calling: bool,

    /// Accepts image input
    pub vision: bool,
}

impl ProviderCapabilities {
    /// All capabilities enabled
    #[must_use]
    pub fn all() -> Self {
        Self {
            streaming: true,
            function_calling: true,
            vision: true,
        }
    }

    /// Whether these capabilities cover everything `required` asks for
    #[must_use]
    pub fn satisfies(&self, required: &CapabilityRequirements) -> bool {
        (!required.streaming || self.streaming)
            && (!required.function_calling || self.function_calling)
            && (!required.vision || self.vision)
    }
}

/// Capabilities a request needs from its provider
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CapabilityRequirements {
    /// Streaming required
    pub streaming: bool,

    /// Function calling required
    pub function_calling: bool,

    /// Vision input required
    pub vision: bool,
}

impl CapabilityRequirements {
    /// No requirements
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }
}

fn default_available() -> bool {
    true
}

/// One provider's offering of a logical model
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Provider name, the key shared with the circuit breaker bank
    pub provider: String,

    /// Model identifier actually sent upstream
    pub provider_model_id: String,

    /// Lower is preferred
    #[serde(default)]
    pub priority: u32,

    /// Cost per 1k input tokens
    #[serde(default)]
    pub input_cost_per_1k: f64,

    /// Cost per 1k output tokens
    #[serde(default)]
    pub output_cost_per_1k: f64,

    /// Maximum output tokens this provider allows
    #[serde(default)]
    pub max_output_tokens: Option<u32>,

    /// Capability flags
    #[serde(default)]
    pub capabilities: ProviderCapabilities,

    /// Operator kill-switch, independent of circuit state
    #[serde(default = "default_available")]
    pub available: bool,

    /// Whether calls need provider credentials configured
    #[serde(default)]
    pub requires_credentials: bool,
}

impl ProviderConfig {
    /// Create an available provider offering with priority 0 and zero cost
    pub fn new(provider: impl Into<String>, provider_model_id: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            provider_model_id: provider_model_id.into(),
            priority: 0,
            input_cost_per_1k: 0.0,
            output_cost_per_1k: 0.0,
            max_output_tokens: None,
            capabilities: ProviderCapabilities::default(),
            available: true,
            requires_credentials: false,
        }
    }

    /// Set priority
    #[must_use]
    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    /// Set per-1k token costs
    #[must_use]
    pub fn with_cost(mut self, input_per_1k: f64, output_per_1k: f64) -> Self {
        self.input_cost_per_1k = input_per_1k;
        self.output_cost_per_1k = output_per_1k;
        self
    }

    /// Set capability flags
    #[must_use]
    pub fn with_capabilities(mut self, capabilities: ProviderCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Set the maximum output tokens
    #[must_use]
    pub fn with_max_output_tokens(mut self, max: u32) -> Self {
        self.max_output_tokens = Some(max);
        self
    }

    /// Set the static availability flag
    #[must_use]
    pub fn with_available(mut self, available: bool) -> Self {
        self.available = available;
        self
    }

    /// Mark as requiring credentials
    #[must_use]
    pub fn requiring_credentials(mut self) -> Self {
        self.requires_credentials = true;
        self
    }

    /// Combined cost used as the last ranking signal
    #[must_use]
    pub fn combined_cost(&self) -> f64 {
        self.input_cost_per_1k + self.output_cost_per_1k
    }
}

// ============================================================================
// Logical Model
// ============================================================================

/// Input/output modality
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Modality {
    /// Plain text
    Text,
    /// Images
    Image,
    /// Audio
    Audio,
    /// Video
    Video,
}

/// A model as callers request it, independent of who serves it
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogicalModel {
    /// Identifier callers use (e.g. `gemini-1.5-flash`)
    pub id: String,

    /// Human-readable name
    #[serde(default)]
    pub display_name: String,

    /// Context window in tokens
    #[serde(default)]
    pub context_length: u32,

    /// Supported modalities
    #[serde(default)]
    pub modalities: Vec<Modality>,

    /// Free-form capability tags
    #[serde(default)]
    pub capabilities: Vec<String>,

    /// Providers offering this model, in catalog order
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
}

impl LogicalModel {
    /// Create a text model with no providers
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            display_name: id.clone(),
            id,
            context_length: 0,
            modalities: vec![Modality::Text],
            capabilities: Vec::new(),
            providers: Vec::new(),
        }
    }

    /// Add a provider offering
    #[must_use]
    pub fn with_provider(mut self, provider: ProviderConfig) -> Self {
        self.providers.push(provider);
        self
    }

    /// Replace the provider list
    #[must_use]
    pub fn with_providers(mut self, providers: Vec<ProviderConfig>) -> Self {
        self.providers = providers;
        self
    }

    /// Set the context length
    #[must_use]
    pub fn with_context_length(mut self, context_length: u32) -> Self {
        self.context_length = context_length;
        self
    }

    /// Find a provider offering by name
    #[must_use]
    pub fn provider(&self, name: &str) -> Option<&ProviderConfig> {
        self.providers.iter().find(|p| p.provider == name)
    }

    /// Drop duplicate provider names, keeping the first occurrence
    ///
    /// Returns the names that were dropped.
    fn dedupe_providers(&mut self) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut dropped = Vec::new();
        self.providers.retain(|p| {
            if seen.insert(p.provider.clone()) {
                true
            } else {
                dropped.push(p.provider.clone());
                false
            }
        });
        dropped
    }
}

// ============================================================================
// Registry
// ============================================================================

type ModelMap = BTreeMap<String, Arc<LogicalModel>>;

fn dedupe_all(models: impl IntoIterator<Item = LogicalModel>) -> Vec<LogicalModel> {
    models
        .into_iter()
        .map(|mut model| {
            let dropped = model.dedupe_providers();
            if !dropped.is_empty() {
                tracing::warn!(
                    model = %model.id,
                    duplicates = ?dropped,
                    "Duplicate provider entries dropped"
                );
            }
            model
        })
        .collect()
}

fn upsert(map: &mut ModelMap, model: LogicalModel) {
    tracing::debug!(
        model = %model.id,
        providers = model.providers.len(),
        "Registered model"
    );
    map.insert(model.id.clone(), Arc::new(model));
}

/// Point-in-time view of every registered model
///
/// Iterating is restartable: call [`RegistrySnapshot::iter`] as often as
/// needed, it always walks the same snapshot.
#[derive(Clone, Debug)]
pub struct RegistrySnapshot {
    models: Arc<ModelMap>,
}

impl RegistrySnapshot {
    /// Iterate models in id order
    pub fn iter(&self) -> impl Iterator<Item = &Arc<LogicalModel>> + '_ {
        self.models.values()
    }

    /// Number of models in the snapshot
    #[must_use]
    pub fn len(&self) -> usize {
        self.models.len()
    }

    /// Whether the snapshot is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// Total provider offerings across all models
    #[must_use]
    pub fn provider_offerings(&self) -> usize {
        self.models.values().map(|m| m.providers.len()).sum()
    }
}

impl<'a> IntoIterator for &'a RegistrySnapshot {
    type Item = &'a Arc<LogicalModel>;
    type IntoIter = std::collections::btree_map::Values<'a, String, Arc<LogicalModel>>;

    fn into_iter(self) -> Self::IntoIter {
        self.models.values()
    }
}

/// Registry of logical models
///
/// Owned by the composition root and injected into the selector; there is
/// no global instance.
#[derive(Debug, Default)]
pub struct ModelRegistry {
    models: RwLock<Arc<ModelMap>>,
    /// Serialises writers so each one edits the latest map
    write_gate: Mutex<()>,
}

impl ModelRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert models
    ///
    /// Each model's provider list replaces any previous list for that id
    /// (last writer wins per model, lists are never merged). Registering a
    /// model with no providers leaves it known but unservable.
    pub fn register(&self, models: impl IntoIterator<Item = LogicalModel>) {
        let incoming = dedupe_all(models);
        if incoming.is_empty() {
            return;
        }
        self.update(|map| {
            for model in incoming {
                upsert(map, model);
            }
        });
    }

    /// Replace the whole catalog
    ///
    /// Models in `models` are upserted. Known models missing from `models`
    /// stay known with an empty provider list, so lookups keep answering
    /// `NoProviders` rather than `ModelNotFound`. Returns how many models
    /// were emptied this way.
    pub fn replace_all(&self, models: impl IntoIterator<Item = LogicalModel>) -> usize {
        let incoming = dedupe_all(models);
        let mut emptied = 0;
        self.update(|map| {
            let listed: HashSet<&str> = incoming.iter().map(|m| m.id.as_str()).collect();
            for (id, model) in map.iter_mut() {
                if !listed.contains(id.as_str()) && !model.providers.is_empty() {
                    let mut retired = (**model).clone();
                    retired.providers.clear();
                    *model = Arc::new(retired);
                    emptied += 1;
                    tracing::info!(model = %id, "Model dropped from catalog, providers cleared");
                }
            }
            for model in incoming {
                upsert(map, model);
            }
        });
        emptied
    }

    /// Apply `edit` to a private copy of the map and publish it
    fn update(&self, edit: impl FnOnce(&mut ModelMap)) {
        let _writer = self.write_gate.lock();
        let mut next: ModelMap = (**self.models.read()).clone();
        edit(&mut next);
        *self.models.write() = Arc::new(next);
    }

    /// Replace one model's provider list
    pub fn set_providers(&self, model_id: &str, providers: Vec<ProviderConfig>) {
        let model = self.lookup(model_id).map_or_else(
            |_| LogicalModel::new(model_id),
            |existing| (*existing).clone(),
        );
        self.register([model.with_providers(providers)]);
    }

    /// Look up a model by id
    ///
    /// A known model with zero providers is returned as-is.
    pub fn lookup(&self, model_id: &str) -> Result<Arc<LogicalModel>, RoutingError> {
        self.models
            .read()
            .get(model_id)
            .cloned()
            .ok_or_else(|| RoutingError::ModelNotFound(model_id.to_string()))
    }

    /// Whether a model id is registered
    #[must_use]
    pub fn contains(&self, model_id: &str) -> bool {
        self.models.read().contains_key(model_id)
    }

    /// Snapshot of every registered model
    #[must_use]
    pub fn all(&self) -> RegistrySnapshot {
        RegistrySnapshot {
            models: self.models.read().clone(),
        }
    }

    /// Number of registered models
    #[must_use]
    pub fn model_count(&self) -> usize {
        self.models.read().len()
    }

    /// Every distinct provider name across the registry
    #[must_use]
    pub fn provider_names(&self) -> Vec<String> {
        let snapshot = self.all();
        let mut names: Vec<String> = snapshot
            .iter()
            .flat_map(|m| m.providers.iter().map(|p| p.provider.clone()))
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        names.sort();
        names
    }
}
