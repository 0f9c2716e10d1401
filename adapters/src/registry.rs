use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("adapter not found: {0}")]
    NotFound(String),
    #[error("version not found for adapter {adapter_id}: {version}")]
    VersionNotFound { adapter_id: String, version: String },
    #[error("version already exists for adapter {adapter_id}: {version}")]
    VersionAlreadyExists { adapter_id: String, version: String },
    #[error("no previous activation to roll back to for adapter: {0}")]
    NothingToRollBack(String),
}

#[derive(Clone)]
pub struct Resolved<T: ?Sized> {
    pub adapter_id: String,
    pub version: String,
    pub adapter: Arc<T>,
}

/// Versions of one adapter id, in registration order. The active slot plus
/// one remembered predecessor is the whole activation state: hot swap moves
/// the predecessor aside, rollback swaps the two. There is deliberately no
/// deeper history; operational rollback is one step, and a second rollback
/// swaps forward again.
struct Binding<T: ?Sized> {
    versions: Vec<(String, Arc<T>)>,
    active: usize,
    previous: Option<usize>,
}

impl<T: ?Sized> Binding<T> {
    fn index_of(&self, version: &str) -> Option<usize> {
        self.versions.iter().position(|(v, _)| v == version)
    }

    fn resolved(&self, adapter_id: &str, index: usize) -> Resolved<T> {
        let (version, adapter) = &self.versions[index];
        Resolved {
            adapter_id: adapter_id.to_string(),
            version: version.clone(),
            adapter: adapter.clone(),
        }
    }
}

/// Versioned registry for one adapter capability; embedders, rerankers,
/// translators, and extractors each get their own instance. Containers pin
/// an exact (id, version) pair, so an unpinned resolve is only used by
/// operator tooling.
pub struct AdapterRegistry<T: ?Sized> {
    bindings: HashMap<String, Binding<T>>,
}

impl<T: ?Sized> Default for AdapterRegistry<T> {
    fn default() -> Self {
        Self {
            bindings: HashMap::new(),
        }
    }
}

impl<T: ?Sized> AdapterRegistry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new version. The first version of an id becomes active;
    /// later ones are available for pinning until activated.
    pub fn register(
        &mut self,
        adapter_id: impl Into<String>,
        version: impl Into<String>,
        adapter: Arc<T>,
    ) -> Result<(), RegistryError> {
        let adapter_id = adapter_id.into();
        let version = version.into();

        match self.bindings.get_mut(&adapter_id) {
            None => {
                self.bindings.insert(
                    adapter_id,
                    Binding {
                        versions: vec![(version, adapter)],
                        active: 0,
                        previous: None,
                    },
                );
                Ok(())
            }
            Some(binding) => {
                if binding.index_of(&version).is_some() {
                    return Err(RegistryError::VersionAlreadyExists {
                        adapter_id,
                        version,
                    });
                }
                binding.versions.push((version, adapter));
                Ok(())
            }
        }
    }

    /// Hot swap: make `version` active and remember the displaced one as
    /// the rollback target. Re-activating the current version is a no-op
    /// and does not clobber the rollback slot.
    pub fn activate(
        &mut self,
        adapter_id: &str,
        version: &str,
    ) -> Result<Resolved<T>, RegistryError> {
        let binding = self
            .bindings
            .get_mut(adapter_id)
            .ok_or_else(|| RegistryError::NotFound(adapter_id.to_string()))?;

        let index = binding.index_of(version).ok_or_else(|| {
            RegistryError::VersionNotFound {
                adapter_id: adapter_id.to_string(),
                version: version.to_string(),
            }
        })?;

        if index != binding.active {
            binding.previous = Some(binding.active);
            binding.active = index;
        }

        Ok(binding.resolved(adapter_id, index))
    }

    /// Resolve an id, optionally pinned to an exact version. Unpinned
    /// resolution returns whatever is active.
    pub fn resolve(
        &self,
        adapter_id: &str,
        version: Option<&str>,
    ) -> Result<Resolved<T>, RegistryError> {
        let binding = self
            .bindings
            .get(adapter_id)
            .ok_or_else(|| RegistryError::NotFound(adapter_id.to_string()))?;

        let index = match version {
            Some(version) => binding.index_of(version).ok_or_else(|| {
                RegistryError::VersionNotFound {
                    adapter_id: adapter_id.to_string(),
                    version: version.to_string(),
                }
            })?,
            None => binding.active,
        };

        Ok(binding.resolved(adapter_id, index))
    }

    /// Swap the active version with the remembered predecessor.
    pub fn rollback(&mut self, adapter_id: &str) -> Result<Resolved<T>, RegistryError> {
        let binding = self
            .bindings
            .get_mut(adapter_id)
            .ok_or_else(|| RegistryError::NotFound(adapter_id.to_string()))?;

        let Some(previous) = binding.previous else {
            return Err(RegistryError::NothingToRollBack(adapter_id.to_string()));
        };

        binding.previous = Some(binding.active);
        binding.active = previous;
        Ok(binding.resolved(adapter_id, previous))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedder::{DeterministicEmbedder, TextEmbedder};

    fn embedder(version: &str) -> Arc<dyn TextEmbedder> {
        Arc::new(DeterministicEmbedder::new("local-hash", version, 16))
    }

    #[test]
    fn first_registration_becomes_active() {
        let mut registry: AdapterRegistry<dyn TextEmbedder> = AdapterRegistry::new();
        registry.register("local-hash", "1", embedder("1")).unwrap();
        registry.register("local-hash", "2", embedder("2")).unwrap();

        assert_eq!(registry.resolve("local-hash", None).unwrap().version, "1");
        assert_eq!(
            registry.resolve("local-hash", Some("2")).unwrap().version,
            "2"
        );
    }

    #[test]
    fn duplicate_version_is_rejected() {
        let mut registry: AdapterRegistry<dyn TextEmbedder> = AdapterRegistry::new();
        registry.register("local-hash", "1", embedder("1")).unwrap();

        let err = registry
            .register("local-hash", "1", embedder("1"))
            .unwrap_err();
        assert_eq!(
            err,
            RegistryError::VersionAlreadyExists {
                adapter_id: "local-hash".to_string(),
                version: "1".to_string(),
            }
        );
    }

    #[test]
    fn unknown_id_and_version_are_typed_errors() {
        let registry: AdapterRegistry<dyn TextEmbedder> = AdapterRegistry::new();
        assert!(matches!(
            registry.resolve("missing", None),
            Err(RegistryError::NotFound(_))
        ));

        let mut registry: AdapterRegistry<dyn TextEmbedder> = AdapterRegistry::new();
        registry.register("local-hash", "1", embedder("1")).unwrap();
        assert!(matches!(
            registry.resolve("local-hash", Some("9")),
            Err(RegistryError::VersionNotFound { .. })
        ));
    }

    #[test]
    fn rollback_swaps_with_the_displaced_version() {
        let mut registry: AdapterRegistry<dyn TextEmbedder> = AdapterRegistry::new();
        registry.register("local-hash", "1", embedder("1")).unwrap();
        registry.register("local-hash", "2", embedder("2")).unwrap();

        registry.activate("local-hash", "2").unwrap();
        assert_eq!(registry.resolve("local-hash", None).unwrap().version, "2");

        let rolled = registry.rollback("local-hash").unwrap();
        assert_eq!(rolled.version, "1");
        assert_eq!(registry.resolve("local-hash", None).unwrap().version, "1");

        // A second rollback swaps forward again.
        assert_eq!(registry.rollback("local-hash").unwrap().version, "2");
    }

    #[test]
    fn rollback_without_prior_activation_fails() {
        let mut registry: AdapterRegistry<dyn TextEmbedder> = AdapterRegistry::new();
        registry.register("local-hash", "1", embedder("1")).unwrap();

        assert!(matches!(
            registry.rollback("local-hash"),
            Err(RegistryError::NothingToRollBack(_))
        ));
    }

    #[test]
    fn reactivating_the_active_version_keeps_the_rollback_slot() {
        let mut registry: AdapterRegistry<dyn TextEmbedder> = AdapterRegistry::new();
        registry.register("local-hash", "1", embedder("1")).unwrap();
        registry.register("local-hash", "2", embedder("2")).unwrap();

        registry.activate("local-hash", "2").unwrap();
        registry.activate("local-hash", "2").unwrap();

        assert_eq!(registry.rollback("local-hash").unwrap().version, "1");
    }
}
