//! Module containers.
//!
//! A [`ModuleContainer`] groups the plugin types of one set of artifacts with
//! its own [`ServiceRegistry`]. The host container is permanent and loaded
//! first; every other container inherits the host's singletons read-only and
//! can be unloaded independently.
//!
//! Loading only classifies declarations and registers creation rules.
//! Singleton plugins are built by [`ModuleContainer::initialize`]; a plugin
//! that fails to build or initialise is removed and the container stays
//! loaded.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use tracing::{debug, error, info, warn};

use crate::error::{LoadError, RegistryError};
use crate::plugin::artifact::Artifact;
use crate::plugin::classify::classify;
use crate::plugin::descriptor::PluginDescriptor;
use crate::service::{Lifetime, ServiceArc, ServiceRegistration, ServiceRegistry, ServiceScope};

/// Name of the permanent host container.
pub const HOST_CONTAINER: &str = "host";

pub struct ModuleContainer {
    name: String,
    is_host: bool,
    registry: Arc<ServiceRegistry>,
    artifacts: Vec<(String, String)>,
    plugins: RwLock<Vec<Arc<PluginDescriptor>>>,
    alive: AtomicBool,
}

impl ModuleContainer {
    /// Loads the host container. `shared` are framework-level instances
    /// (transport, contacts, settings) that every container inherits.
    pub fn load_host(
        artifacts: Vec<Artifact>,
        shared: Vec<ServiceRegistration>,
    ) -> Result<Self, LoadError> {
        let registry = Arc::new(ServiceRegistry::new(HOST_CONTAINER));
        for registration in shared {
            registry.add(registration)?;
        }
        Self::build(HOST_CONTAINER, true, artifacts, registry)
    }

    /// Loads a removable container on top of `host`.
    pub fn load(
        name: &str,
        artifacts: Vec<Artifact>,
        host: &ModuleContainer,
    ) -> Result<Self, LoadError> {
        if name == HOST_CONTAINER {
            return Err(LoadError::ContainerExists(name.to_string()));
        }
        let registry = Arc::new(ServiceRegistry::new(name));
        let inherited = registry.inherit_from(&host.registry)?;
        debug!(container = name, inherited, "Inherited host singletons");
        Self::build(name, false, artifacts, registry)
    }

    fn build(
        name: &str,
        is_host: bool,
        artifacts: Vec<Artifact>,
        registry: Arc<ServiceRegistry>,
    ) -> Result<Self, LoadError> {
        info!(container = name, artifacts = artifacts.len(), "Loading container");

        let mut plugins: Vec<Arc<PluginDescriptor>> = Vec::new();
        let mut loaded_artifacts = Vec::with_capacity(artifacts.len());

        for artifact in &artifacts {
            loaded_artifacts.push((artifact.name().to_string(), artifact.version().to_string()));

            for service in artifact.services() {
                if let Err(e) = registry.add(service.clone()) {
                    warn!(
                        container = name,
                        artifact  = artifact.name(),
                        error     = %e,
                        "Skipping artifact service"
                    );
                }
            }

            if artifact.is_dependency_only() {
                debug!(container = name, artifact = artifact.name(), "Dependency-only artifact");
                continue;
            }

            let before = plugins.len();
            for plugin_type in artifact.plugins() {
                let classified = match classify(*plugin_type, name) {
                    Ok(c) => c,
                    Err(e) => {
                        error!(
                            container = name,
                            artifact  = artifact.name(),
                            error     = %e,
                            "Plugin type rejected"
                        );
                        continue;
                    }
                };
                for rejected in &classified.rejected {
                    warn!(
                        container = name,
                        artifact  = artifact.name(),
                        error     = %rejected,
                        "Command handler rejected"
                    );
                }

                let desc = classified.descriptor;
                if plugins.iter().any(|p| p.metadata.id == desc.metadata.id) {
                    error!(
                        container = name,
                        plugin    = %desc.metadata.name,
                        id        = %desc.metadata.id,
                        "Duplicate plugin identifier"
                    );
                    continue;
                }

                let pt = desc.plugin_type;
                let registration = ServiceRegistration::erased(
                    pt.type_id(),
                    pt.type_name(),
                    desc.lifetime,
                    Arc::new(move |scope: &ServiceScope| pt.construct(scope)),
                );
                if let Err(e) = registry.add(registration) {
                    error!(
                        container = name,
                        plugin    = %desc.metadata.name,
                        error     = %e,
                        "Cannot register plugin type"
                    );
                    continue;
                }

                info!(
                    container  = name,
                    plugin     = %desc.metadata.name,
                    authors    = %desc.metadata.authors.join(", "),
                    version    = %desc.metadata.version,
                    lifetime   = %desc.lifetime,
                    capability = %desc.capability,
                    commands   = desc.commands.len(),
                    "Add plugin"
                );
                plugins.push(Arc::new(desc));
            }

            if plugins.len() == before {
                warn!(
                    container = name,
                    artifact  = artifact.name(),
                    "Artifact contains no usable plugin type"
                );
            }
        }

        if plugins.is_empty() && !is_host {
            return Err(LoadError::NoUsablePlugins(name.to_string()));
        }

        Ok(Self {
            name: name.to_string(),
            is_host,
            registry,
            artifacts: loaded_artifacts,
            plugins: RwLock::new(plugins),
            alive: AtomicBool::new(true),
        })
    }

    /// Builds singleton plugins and runs their `on_initialized` hooks.
    ///
    /// Returns the names of the plugins that failed and were removed.
    pub async fn initialize(&self) -> Vec<String> {
        let scope = self.registry.create_scope();
        let mut failed = Vec::new();

        for desc in self.plugins() {
            if desc.lifetime != Lifetime::Singleton {
                continue;
            }
            let result = match self.instance(&desc, &scope) {
                Ok(instance) => match desc.plugin_type.view(&instance) {
                    Some(plugin) => plugin.on_initialized().await,
                    None => Err(RegistryError::TypeMismatch(desc.metadata.name.clone()).into()),
                },
                Err(e) => Err(e.into()),
            };
            if let Err(e) = result {
                error!(
                    container = %self.name,
                    plugin    = %desc.metadata.name,
                    error     = %format!("{e:#}"),
                    "Plugin initialization failed, removing"
                );
                self.remove_plugin(&desc);
                failed.push(desc.metadata.name.clone());
            }
        }
        failed
    }

    /// Runs `on_uninitialized` for created singletons and drops every
    /// descriptor and instance. The host container cannot be unloaded.
    pub async fn unload(&self) -> Result<(), LoadError> {
        if self.is_host {
            return Err(LoadError::HostContainer);
        }
        self.shutdown().await;
        Ok(())
    }

    /// Like [`unload`](Self::unload), for any container. Used at process exit.
    pub async fn shutdown(&self) {
        if !self.alive.swap(false, Ordering::AcqRel) {
            return;
        }
        let scope = self.registry.create_scope();
        for desc in self.plugins() {
            let type_id = desc.plugin_type.type_id();
            if desc.lifetime != Lifetime::Singleton || !scope.is_created(type_id) {
                continue;
            }
            let Ok(instance) = self.instance(&desc, &scope) else {
                continue;
            };
            if let Some(plugin) = desc.plugin_type.view(&instance)
                && let Err(e) = plugin.on_uninitialized().await
            {
                warn!(
                    container = %self.name,
                    plugin    = %desc.metadata.name,
                    error     = %format!("{e:#}"),
                    "Plugin uninitialization failed"
                );
            }
        }
        self.plugins.write().clear();
        self.registry.clear();
        info!(container = %self.name, "Container unloaded");
    }

    /// Resolves the plugin instance for `desc` in `scope`.
    pub fn instance(
        &self,
        desc: &PluginDescriptor,
        scope: &ServiceScope,
    ) -> Result<ServiceArc, RegistryError> {
        let pt = desc.plugin_type;
        scope.resolve_erased(pt.type_id(), pt.type_name())
    }

    fn remove_plugin(&self, desc: &PluginDescriptor) {
        self.plugins.write().retain(|p| p.metadata.id != desc.metadata.id);
        if let Err(e) = self.registry.remove(desc.plugin_type.type_id()) {
            debug!(container = %self.name, error = %e, "Plugin registration already gone");
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_host(&self) -> bool {
        self.is_host
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    /// `(name, version)` of every artifact this container was loaded from.
    pub fn artifacts(&self) -> &[(String, String)] {
        &self.artifacts
    }

    pub fn plugins(&self) -> Vec<Arc<PluginDescriptor>> {
        self.plugins.read().clone()
    }
}

impl std::fmt::Debug for ModuleContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleContainer")
            .field("name", &self.name)
            .field("is_host", &self.is_host)
            .field("plugins", &self.plugins.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;

    use super::*;
    use crate::plugin::Plugin;
    use crate::plugin::decl::{MethodDecl, PluginTypeDecl};

    static UNINIT: AtomicUsize = AtomicUsize::new(0);

    struct Good;

    #[async_trait]
    impl Plugin for Good {
        fn describe() -> PluginTypeDecl {
            PluginTypeDecl::basic::<Self>()
                .identifier("0b6b2d1c-3f0e-4c55-8f33-5b7c0c1d2e01")
                .lifetime(Lifetime::Singleton)
                .method(MethodDecl::new("good").command_handler().invoke(|_| Ok(())))
        }

        fn construct(_: &ServiceScope) -> anyhow::Result<Self> {
            Ok(Good)
        }

        async fn on_uninitialized(&self) -> anyhow::Result<()> {
            UNINIT.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct NoLifetime;

    impl Plugin for NoLifetime {
        fn describe() -> PluginTypeDecl {
            PluginTypeDecl::basic::<Self>().identifier("0b6b2d1c-3f0e-4c55-8f33-5b7c0c1d2e02")
        }

        fn construct(_: &ServiceScope) -> anyhow::Result<Self> {
            Ok(NoLifetime)
        }
    }

    struct Broken;

    impl Plugin for Broken {
        fn describe() -> PluginTypeDecl {
            PluginTypeDecl::basic::<Self>()
                .identifier("0b6b2d1c-3f0e-4c55-8f33-5b7c0c1d2e03")
                .lifetime(Lifetime::Singleton)
                .method(MethodDecl::new("broken").command_handler().invoke(|_| Ok(())))
        }

        fn construct(_: &ServiceScope) -> anyhow::Result<Self> {
            anyhow::bail!("missing database")
        }
    }

    fn host() -> ModuleContainer {
        ModuleContainer::load_host(Vec::new(), Vec::new()).unwrap()
    }

    #[test]
    fn test_malformed_type_is_excluded() {
        let artifact = Artifact::new("mixed", "1.0.0")
            .plugin::<Good>()
            .plugin::<NoLifetime>();
        let container = ModuleContainer::load("mixed", vec![artifact], &host()).unwrap();
        let plugins = container.plugins();
        assert_eq!(plugins.len(), 1);
        assert_eq!(plugins[0].metadata.name, "Good");
    }

    #[test]
    fn test_container_without_plugins_fails() {
        let artifact = Artifact::new("bad", "1.0.0").plugin::<NoLifetime>();
        let err = ModuleContainer::load("bad", vec![artifact], &host()).unwrap_err();
        assert_eq!(err, LoadError::NoUsablePlugins("bad".into()));
    }

    #[test]
    fn test_dependency_only_artifact_services_resolve() {
        let lib = Artifact::new("lib", "2.0.0")
            .service(ServiceRegistration::instance(Arc::new(42_u32)));
        let plugin = Artifact::new("plugin", "1.0.0").plugin::<Good>();
        let container = ModuleContainer::load("deps", vec![lib, plugin], &host()).unwrap();
        let value = container.registry().create_scope().resolve::<u32>().unwrap();
        assert_eq!(*value, 42);
    }

    #[tokio::test]
    async fn test_failed_singleton_is_removed_but_container_stays() {
        let artifact = Artifact::new("broken", "1.0.0").plugin::<Broken>();
        let container = ModuleContainer::load("broken", vec![artifact], &host()).unwrap();
        let failed = container.initialize().await;
        assert_eq!(failed, vec!["Broken".to_string()]);
        assert!(container.plugins().is_empty());
        assert!(container.is_alive());
    }

    #[tokio::test]
    async fn test_unload_runs_hooks_and_protects_host() {
        let artifact = Artifact::new("good", "1.0.0").plugin::<Good>();
        let container = ModuleContainer::load("good", vec![artifact], &host()).unwrap();
        assert!(container.initialize().await.is_empty());

        let before = UNINIT.load(Ordering::SeqCst);
        container.unload().await.unwrap();
        assert_eq!(UNINIT.load(Ordering::SeqCst), before + 1);
        assert!(!container.is_alive());
        assert!(container.plugins().is_empty());

        assert_eq!(host().unload().await.unwrap_err(), LoadError::HostContainer);
    }
}
