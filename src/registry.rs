//! The backend registry: the process-wide authoritative mapping from
//! backend URL to the model it serves, its type, labels and liveness.
//!
//! Readers take a single `Arc` clone of the current snapshot at request
//! entry and use it for the lifetime of that request; the registry is
//! never locked for longer than the time it takes to clone an `Arc`.
//! Discovery publishes whole new snapshots rather than mutating entries
//! in place, so a writer never blocks a reader and a reader never sees
//! a half-updated set.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// The kind of inference a backend serves. Drives whether the proxy
/// treats a request as chat, completion, embedding or rerank traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelType {
    Chat,
    Completion,
    Embedding,
    Rerank,
}

impl Default for ModelType {
    fn default() -> Self {
        ModelType::Chat
    }
}

impl fmt::Display for ModelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ModelType::Chat => "chat",
            ModelType::Completion => "completion",
            ModelType::Embedding => "embedding",
            ModelType::Rerank => "rerank",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for ModelType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "chat" => Ok(ModelType::Chat),
            "completion" => Ok(ModelType::Completion),
            "embedding" => Ok(ModelType::Embedding),
            "rerank" => Ok(ModelType::Rerank),
            other => Err(format!("unknown model type {}", other)),
        }
    }
}

/// A single model-serving process reachable at `url`. `url` is the
/// unique primary key: two endpoints may share a model name, but never
/// a URL.
#[derive(Debug, Clone)]
pub struct BackendEndpoint {
    pub url: String,
    pub model: String,
    pub model_type: ModelType,
    pub labels: HashMap<String, String>,
    pub first_seen: Instant,
}

impl BackendEndpoint {
    pub fn new(url: impl Into<String>, model: impl Into<String>) -> Self {
        BackendEndpoint {
            url: url.into(),
            model: model.into(),
            model_type: ModelType::Chat,
            labels: HashMap::new(),
            first_seen: Instant::now(),
        }
    }

    pub fn with_model_type(mut self, model_type: ModelType) -> Self {
        self.model_type = model_type;
        self
    }

    pub fn with_labels(mut self, labels: HashMap<String, String>) -> Self {
        self.labels = labels;
        self
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(|s| s.as_str())
    }
}

impl PartialEq for BackendEndpoint {
    fn eq(&self, other: &Self) -> bool {
        self.url == other.url
    }
}
impl Eq for BackendEndpoint {}

type Snapshot = Vec<BackendEndpoint>;

/// Process-wide authoritative set of backends. Mutated only by the
/// discovery subsystem; read concurrently by every request and by the
/// stats scraper.
#[derive(Clone)]
pub struct BackendRegistry {
    inner: Arc<RwLock<Arc<Snapshot>>>,
}

impl Default for BackendRegistry {
    fn default() -> Self {
        BackendRegistry {
            inner: Arc::new(RwLock::new(Arc::new(Vec::new()))),
        }
    }
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a whole new snapshot of the backend set. In-flight
    /// requests holding a previous snapshot are unaffected.
    pub fn publish(&self, endpoints: Vec<BackendEndpoint>) {
        *self.inner.write() = Arc::new(endpoints);
    }

    /// Take a cheap, stable reference to the current snapshot.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.inner.read().clone()
    }

    /// Candidates serving the given model name, in no particular order
    /// (policies are responsible for any ordering they need, e.g.
    /// round-robin's mandatory sort-by-URL).
    pub fn endpoints_for_model(&self, model: &str) -> Vec<BackendEndpoint> {
        self.snapshot()
            .iter()
            .filter(|e| e.model == model)
            .cloned()
            .collect()
    }

    /// The union of model names currently registered, for `/v1/models`.
    pub fn models(&self) -> Vec<String> {
        let snapshot = self.snapshot();
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        for e in snapshot.iter() {
            if seen.insert(e.model.clone()) {
                out.push(e.model.clone());
            }
        }
        out
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
