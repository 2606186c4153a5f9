//! Service registry (spec §4.A) — stores `ServiceManifest`s, seeds the
//! built-in catalogue, and resolves the best `ExecutionDescriptor` for a
//! given node tier. The on-disk persistence path follows a
//! `Config::from_env`-style pattern: a default baked into the type,
//! overridable, with explicit, logged fallback.

mod builtins;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use llmir_core::{ManifestKey, NodeTier, ServiceManifest};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("manifest '{0}' failed invariant validation: {1}")]
    InvalidManifest(String, String),
    #[error("manifest '{id}' version '{version}' already registered")]
    AlreadyRegistered { id: String, version: semver::Version },
    #[error("no manifest found for service id '{0}'")]
    NotFound(String),
    #[error("no descriptor in '{service_id}' is compatible with tier {tier} (compatible tiers: [{}])", compatible_tiers.iter().map(ToString::to_string).collect::<Vec<_>>().join(", "))]
    NoCompatibleDescriptor { service_id: String, tier: NodeTier, compatible_tiers: Vec<NodeTier> },
    #[error("I/O error persisting registry at {path}: {source}")]
    Io { path: PathBuf, #[source] source: std::io::Error },
    #[error("malformed manifest file {path}: {source}")]
    Deserialize { path: PathBuf, #[source] source: serde_json::Error },
}

/// In-memory registry over built-in and user-registered manifests.
///
/// Built-ins are seeded at construction and can be shadowed (not removed)
/// by a higher-version user manifest with the same id; `find` always
/// prefers the highest semver among matches.
pub struct ServiceRegistry {
    manifests: RwLock<BTreeMap<ManifestKey, Arc<ServiceManifest>>>,
    user_manifest_dir: Option<PathBuf>,
}

impl ServiceRegistry {
    /// Construct with the built-in catalogue seeded and no persistence directory.
    pub fn new() -> Self {
        let mut manifests = BTreeMap::new();
        for m in builtins::builtin_manifests() {
            manifests.insert(m.key(), Arc::new(m));
        }
        Self { manifests: RwLock::new(manifests), user_manifest_dir: None }
    }

    /// Construct and load any previously persisted user manifests from `dir`
    /// (one `*.json` file per manifest, named `<id>@<version>.json`).
    pub fn load_from_dir(dir: impl AsRef<Path>) -> Result<Self, RegistryError> {
        let dir = dir.as_ref().to_path_buf();
        let mut registry = Self::new();
        registry.user_manifest_dir = Some(dir.clone());

        if !dir.exists() {
            tracing::info!(path = %dir.display(), "no persisted user manifests, starting with built-ins only");
            return Ok(registry);
        }

        let entries = std::fs::read_dir(&dir)
            .map_err(|e| RegistryError::Io { path: dir.clone(), source: e })?;
        for entry in entries {
            let entry = entry.map_err(|e| RegistryError::Io { path: dir.clone(), source: e })?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = std::fs::read(&path).map_err(|e| RegistryError::Io { path: path.clone(), source: e })?;
            let manifest: ServiceManifest =
                serde_json::from_slice(&bytes).map_err(|e| RegistryError::Deserialize { path: path.clone(), source: e })?;
            manifest
                .validate_invariants()
                .map_err(|msg| RegistryError::InvalidManifest(manifest.id.clone(), msg))?;
            tracing::info!(service_id = %manifest.id, version = %manifest.version, "loaded persisted manifest");
            registry.manifests.write().unwrap().insert(manifest.key(), Arc::new(manifest));
        }
        Ok(registry)
    }

    /// Register a new manifest. Validates invariants, refuses exact
    /// `(id, version)` collisions (spec §4.A `register`), and persists it
    /// to `user_manifest_dir` when one is configured.
    pub fn register(&self, manifest: ServiceManifest) -> Result<(), RegistryError> {
        manifest
            .validate_invariants()
            .map_err(|msg| RegistryError::InvalidManifest(manifest.id.clone(), msg))?;

        let key = manifest.key();
        {
            let mut guard = self.manifests.write().unwrap();
            if guard.contains_key(&key) {
                return Err(RegistryError::AlreadyRegistered { id: key.0, version: key.1 });
            }
            guard.insert(key.clone(), Arc::new(manifest.clone()));
        }

        if let Some(dir) = &self.user_manifest_dir {
            std::fs::create_dir_all(dir).map_err(|e| RegistryError::Io { path: dir.clone(), source: e })?;
            let path = dir.join(format!("{}@{}.json", key.0, key.1));
            let bytes = serde_json::to_vec_pretty(&manifest)
                .map_err(|e| RegistryError::Deserialize { path: path.clone(), source: e })?;
            std::fs::write(&path, bytes).map_err(|e| RegistryError::Io { path, source: e })?;
        }
        tracing::info!(service_id = %key.0, version = %key.1, "registered manifest");
        Ok(())
    }

    /// Remove a manifest by exact id+version. Built-ins may be unregistered
    /// (spec §4.A makes no exception for them) but are not re-seeded.
    pub fn unregister(&self, id: &str, version: &semver::Version) -> Result<(), RegistryError> {
        let key = (id.to_owned(), version.clone());
        let removed = self.manifests.write().unwrap().remove(&key).is_some();
        if !removed {
            return Err(RegistryError::NotFound(id.to_owned()));
        }
        if let Some(dir) = &self.user_manifest_dir {
            let path = dir.join(format!("{id}@{version}.json"));
            let _ = std::fs::remove_file(path);
        }
        tracing::info!(service_id = %id, %version, "unregistered manifest");
        Ok(())
    }

    /// Find the highest-semver manifest registered under `id`.
    pub fn find(&self, id: &str) -> Option<Arc<ServiceManifest>> {
        self.manifests
            .read()
            .unwrap()
            .range((id.to_owned(), semver::Version::new(0, 0, 0))..)
            .take_while(|((mid, _), _)| mid == id)
            .map(|(_, m)| m.clone())
            .max_by(|a, b| a.version.cmp(&b.version))
    }

    /// Find an exact `(id, version)` pair.
    pub fn find_exact(&self, id: &str, version: &semver::Version) -> Option<Arc<ServiceManifest>> {
        self.manifests.read().unwrap().get(&(id.to_owned(), version.clone())).cloned()
    }

    /// Resolve the best-fit execution descriptor for `id` against `tier`,
    /// honoring the manifest's descriptor preference order (spec §4.A
    /// `resolve_for_node`: "first compatible descriptor wins").
    pub fn resolve_for_node(
        &self,
        id: &str,
        tier: NodeTier,
    ) -> Result<(Arc<ServiceManifest>, usize), RegistryError> {
        let manifest = self.find(id).ok_or_else(|| RegistryError::NotFound(id.to_owned()))?;
        let idx = manifest.descriptors.iter().position(|d| d.is_compatible_with(tier)).ok_or_else(|| {
            let mut compatible_tiers: Vec<NodeTier> = manifest.descriptors.iter().flat_map(|d| d.compatible_tiers().iter().copied()).collect();
            compatible_tiers.sort();
            compatible_tiers.dedup();
            RegistryError::NoCompatibleDescriptor { service_id: id.to_owned(), tier, compatible_tiers }
        })?;
        Ok((manifest, idx))
    }

    /// Free-text search over id, category, and port names (spec §4.A `search`).
    pub fn search(&self, query: &str) -> Vec<Arc<ServiceManifest>> {
        let needle = query.to_ascii_lowercase();
        self.manifests
            .read()
            .unwrap()
            .values()
            .filter(|m| {
                m.id.to_ascii_lowercase().contains(&needle)
                    || m.category.to_ascii_lowercase().contains(&needle)
                    || m.inputs.iter().any(|p| p.name.to_ascii_lowercase().contains(&needle))
                    || m.outputs.iter().any(|p| p.name.to_ascii_lowercase().contains(&needle))
            })
            .cloned()
            .collect()
    }

    /// Every manifest currently registered, for the compiler's lookups.
    pub fn all(&self) -> Vec<Arc<ServiceManifest>> {
        self.manifests.read().unwrap().values().cloned().collect()
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_are_seeded_and_valid() {
        let registry = ServiceRegistry::new();
        let all = registry.all();
        assert!(!all.is_empty());
        for m in &all {
            m.validate_invariants().unwrap();
        }
    }

    #[test]
    fn register_then_find_round_trips() {
        let registry = ServiceRegistry::new();
        let manifest = builtins::test_manifest("custom.test-service", "1.0.0");
        registry.register(manifest.clone()).unwrap();
        let found = registry.find("custom.test-service").unwrap();
        assert_eq!(found.id, "custom.test-service");
    }

    #[test]
    fn register_duplicate_version_is_rejected() {
        let registry = ServiceRegistry::new();
        let manifest = builtins::test_manifest("custom.dup", "1.0.0");
        registry.register(manifest.clone()).unwrap();
        let err = registry.register(manifest).unwrap_err();
        assert!(matches!(err, RegistryError::AlreadyRegistered { .. }));
    }

    #[test]
    fn find_prefers_highest_semver() {
        let registry = ServiceRegistry::new();
        registry.register(builtins::test_manifest("custom.versioned", "1.0.0")).unwrap();
        registry.register(builtins::test_manifest("custom.versioned", "2.1.0")).unwrap();
        let found = registry.find("custom.versioned").unwrap();
        assert_eq!(found.version, semver::Version::parse("2.1.0").unwrap());
    }

    #[test]
    fn persists_and_reloads_from_dir() {
        let dir = tempfile::tempdir().unwrap();
        {
            let registry = ServiceRegistry::load_from_dir(dir.path()).unwrap();
            registry.register(builtins::test_manifest("custom.persisted", "1.0.0")).unwrap();
        }
        let reloaded = ServiceRegistry::load_from_dir(dir.path()).unwrap();
        assert!(reloaded.find("custom.persisted").is_some());
    }

    #[test]
    fn resolve_for_node_rejects_incompatible_tier() {
        let registry = ServiceRegistry::new();
        let manifest = builtins::test_manifest("custom.mcu-only", "1.0.0");
        registry.register(manifest).unwrap();
        let result = registry.resolve_for_node("custom.mcu-only", NodeTier::Mcu);
        assert!(result.is_ok());
        let result = registry.resolve_for_node("custom.mcu-only", NodeTier::Central);
        assert!(matches!(result, Err(RegistryError::NoCompatibleDescriptor { .. })));
    }

    /// Spec §8 testable property 6: a manifest with descriptors
    /// `[{WASM, tiers:[CENTRAL,LINUX]}, {HTTP, tiers:[CENTRAL]}]` resolves
    /// `tier=LINUX` to WASM, and `tier=MCU` fails listing `[CENTRAL,LINUX]`.
    #[test]
    fn descriptor_selection_picks_first_compatible_and_lists_tiers_on_failure() {
        use llmir_core::ExecutionDescriptor;

        let mut manifest = builtins::test_manifest("custom.multi-format", "1.0.0");
        manifest.descriptors = vec![
            ExecutionDescriptor::Wasm {
                binary_url: "https://example.invalid/module.wasm".into(),
                sha256: "deadbeef".into(),
                memory_pages: 16,
                exported_function: "run".into(),
                abi: "wasm32-wasi".into(),
                compatible_tiers: vec![NodeTier::Central, NodeTier::Linux],
            },
            ExecutionDescriptor::Http {
                url_template: "https://example.invalid/run".into(),
                method: "POST".into(),
                auth: None,
                request_mapping: Default::default(),
                response_mapping: Default::default(),
                output_field_map: Default::default(),
                headers: Default::default(),
                compatible_tiers: vec![NodeTier::Central],
            },
        ];

        let registry = ServiceRegistry::new();
        registry.register(manifest).unwrap();

        let (_, idx) = registry.resolve_for_node("custom.multi-format", NodeTier::Linux).unwrap();
        assert_eq!(idx, 0, "LINUX is only compatible with the WASM descriptor");

        match registry.resolve_for_node("custom.multi-format", NodeTier::Mcu) {
            Err(RegistryError::NoCompatibleDescriptor { compatible_tiers, .. }) => {
                assert_eq!(compatible_tiers, vec![NodeTier::Central, NodeTier::Linux]);
            }
            other => panic!("expected NoCompatibleDescriptor, got {other:?}"),
        }
    }
}
