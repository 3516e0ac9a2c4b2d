use std::sync::Arc;

use crate::config::BackendSpec;
use crate::registry::{BackendEndpoint, ModelType};

use super::Provider;

/// Immutable for the lifetime of the provider: built once from the CLI
/// or dynamic-config's parallel lists, never mutated afterward. A
/// dynamic-config reload that changes the static list builds a brand
/// new `StaticProvider` rather than mutating this one.
pub struct StaticProvider {
    endpoints: Arc<Vec<BackendEndpoint>>,
}

impl StaticProvider {
    pub fn new(backends: &[BackendSpec]) -> Self {
        let endpoints = backends
            .iter()
            .map(|b| {
                let model_type = b.model_type.parse::<ModelType>().unwrap_or_default();
                BackendEndpoint::new(b.url.clone(), b.model.clone())
                    .with_model_type(model_type)
                    .with_labels(b.labels.clone())
            })
            .collect();
        StaticProvider {
            endpoints: Arc::new(endpoints),
        }
    }
}

impl Provider for StaticProvider {
    fn list(&self) -> Arc<Vec<BackendEndpoint>> {
        self.endpoints.clone()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn static_provider_lists_every_configured_backend() {
        let provider = StaticProvider::new(&[
            BackendSpec {
                url: "http://a".into(),
                model: "m".into(),
                model_type: "chat".into(),
                labels: HashMap::new(),
            },
            BackendSpec {
                url: "http://b".into(),
                model: "m".into(),
                model_type: "embedding".into(),
                labels: HashMap::new(),
            },
        ]);
        let list = provider.list();
        assert_eq!(list.len(), 2);
        assert_eq!(list[1].model_type, ModelType::Embedding);
    }

    #[test]
    fn static_provider_snapshot_is_stable_across_calls() {
        let provider = StaticProvider::new(&[BackendSpec {
            url: "http://a".into(),
            model: "m".into(),
            model_type: "chat".into(),
            labels: HashMap::new(),
        }]);
        let first = provider.list();
        let second = provider.list();
        assert!(Arc::ptr_eq(&first, &second));
    }
}
