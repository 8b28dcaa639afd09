//! Registry of live backend instances.
//!
//! ```ignore
//! let mut registry = BackendRegistry::new();
//! registry.register(Arc::new(MyBackend::new()));
//!
//! let backend = registry.get("my-backend").unwrap();
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use switchyard_core::BackendDescriptor;

use super::Backend;

/// Name -> backend map. Iteration is in name order.
#[derive(Default, Clone)]
pub struct BackendRegistry {
    backends: BTreeMap<String, Arc<dyn Backend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a backend under its own name.
    ///
    /// A backend with the same name is replaced.
    pub fn register(&mut self, backend: Arc<dyn Backend>) {
        let name = backend.name().to_string();
        if self.backends.insert(name.clone(), backend).is_some() {
            tracing::warn!(backend = %name, "Replaced previously registered backend");
        }
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Backend>> {
        self.backends.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.backends.contains_key(name)
    }

    /// Registered names in sorted order.
    pub fn names(&self) -> Vec<&str> {
        self.backends.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<dyn Backend>)> {
        self.backends.iter().map(|(name, b)| (name.as_str(), b))
    }

    /// Descriptors built from each backend's advertised capabilities.
    ///
    /// Health is left `Closed`; callers overlay the breaker state.
    pub fn descriptors(&self) -> Vec<BackendDescriptor> {
        self.backends
            .iter()
            .map(|(name, backend)| BackendDescriptor::new(name.clone(), backend.capabilities()))
            .collect()
    }
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("backends", &self.names())
            .finish()
    }
}
