//! Artifacts: the unit of code a container is loaded from.
//!
//! Plugin code is compiled into the host binary; an [`Artifact`] groups the
//! plugin types and exported services of one logical plugin library. The
//! [`ArtifactCatalog`] maps names used in plugin manifests to artifacts.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use linkme::distributed_slice;

use crate::plugin::{Plugin, PluginType};
use crate::service::ServiceRegistration;

/// Built-in artifacts always loaded into the host container.
///
/// ```rust,ignore
/// #[distributed_slice(kestrel_core::HOST_ARTIFACTS)]
/// #[linkme(crate = kestrel_core::linkme)]
/// fn help_artifact() -> Artifact {
///     Artifact::new("builtin-help", "0.1.0").plugin::<HelpPlugin>()
/// }
/// ```
#[distributed_slice]
pub static HOST_ARTIFACTS: [fn() -> Artifact];

/// A named bundle of plugin types and services.
///
/// An artifact without plugin types is dependency-only: its services are
/// registered but nothing is classified.
#[derive(Clone)]
pub struct Artifact {
    name: String,
    version: String,
    plugins: Vec<PluginType>,
    services: Vec<ServiceRegistration>,
}

impl Artifact {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            plugins: Vec::new(),
            services: Vec::new(),
        }
    }

    pub fn plugin<P: Plugin>(mut self) -> Self {
        self.plugins.push(PluginType::of::<P>());
        self
    }

    pub fn service(mut self, registration: ServiceRegistration) -> Self {
        self.services.push(registration);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn plugins(&self) -> &[PluginType] {
        &self.plugins
    }

    pub fn services(&self) -> &[ServiceRegistration] {
        &self.services
    }

    pub fn is_dependency_only(&self) -> bool {
        self.plugins.is_empty()
    }
}

impl fmt::Debug for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Artifact")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("plugins", &self.plugins)
            .field("services", &self.services.len())
            .finish()
    }
}

type ArtifactFactory = Arc<dyn Fn() -> Artifact + Send + Sync>;

/// Name-to-artifact lookup used when reading plugin manifests.
#[derive(Clone, Default)]
pub struct ArtifactCatalog {
    entries: BTreeMap<String, ArtifactFactory>,
}

impl ArtifactCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an artifact factory under `name`, replacing any previous entry.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn() -> Artifact + Send + Sync + 'static,
    {
        self.entries.insert(name.into(), Arc::new(factory));
        self
    }

    /// Registers an already-built artifact under its own name.
    pub fn insert(&mut self, artifact: Artifact) -> &mut Self {
        let name = artifact.name.clone();
        self.register(name, move || artifact.clone())
    }

    pub fn get(&self, name: &str) -> Option<Artifact> {
        self.entries.get(name).map(|f| f())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Artifacts contributed through [`HOST_ARTIFACTS`].
    pub fn builtin() -> Vec<Artifact> {
        HOST_ARTIFACTS.iter().map(|f| f()).collect()
    }
}

impl fmt::Debug for ArtifactCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.entries.keys()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_lookup() {
        let mut catalog = ArtifactCatalog::new();
        catalog.insert(Artifact::new("shared-lib", "1.0.0"));
        catalog.register("other", || Artifact::new("other", "2.0.0"));

        let a = catalog.get("shared-lib").unwrap();
        assert!(a.is_dependency_only());
        assert_eq!(catalog.get("other").unwrap().version(), "2.0.0");
        assert!(catalog.get("missing").is_none());
        assert_eq!(catalog.names().collect::<Vec<_>>(), vec!["other", "shared-lib"]);
    }
}
