//! Per-container service registry.
//!
//! Every [`ModuleContainer`](crate::ModuleContainer) owns one
//! [`ServiceRegistry`]. Registrations are keyed by the `TypeId` of the
//! service type, which may be a trait-object type such as `dyn Transport`.
//! Values are stored type-erased as [`ServiceArc`], an `Arc<dyn Any>` whose
//! concrete type is `Arc<T>`; [`ServiceScope::resolve`] downcasts back.
//!
//! Singleton instances registered on the host container are inherited by
//! every other container as read-only registrations.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, RwLock};

use crate::error::RegistryError;

/// Type-erased shared service value. Holds an `Arc<T>`.
pub type ServiceArc = Arc<dyn Any + Send + Sync>;

/// Erased factory producing a [`ServiceArc`].
pub type ServiceFactory = Arc<dyn Fn(&ServiceScope) -> anyhow::Result<ServiceArc> + Send + Sync>;

/// How long a resolved instance lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lifetime {
    /// One instance per container, created once and shared.
    Singleton,
    /// One instance per [`ServiceScope`] (one scope per invocation).
    Scoped,
    /// A fresh instance on every resolve.
    Transient,
}

impl fmt::Display for Lifetime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Singleton => "singleton",
            Self::Scoped => "scoped",
            Self::Transient => "transient",
        };
        f.write_str(s)
    }
}

#[derive(Clone)]
enum Provider {
    Instance(ServiceArc),
    Factory(ServiceFactory),
}

// ─── ServiceRegistration ──────────────────────────────────────────────────────

/// A creation rule for one service type.
#[derive(Clone)]
pub struct ServiceRegistration {
    type_id: TypeId,
    type_name: &'static str,
    lifetime: Lifetime,
    provider: Provider,
    inherited: bool,
}

impl ServiceRegistration {
    /// A singleton backed by an existing shared value.
    pub fn instance<T>(value: Arc<T>) -> Self
    where
        T: ?Sized + Send + Sync + 'static,
    {
        Self {
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
            lifetime: Lifetime::Singleton,
            provider: Provider::Instance(Arc::new(value)),
            inherited: false,
        }
    }

    pub fn singleton<T, F>(factory: F) -> Self
    where
        T: ?Sized + Send + Sync + 'static,
        F: Fn(&ServiceScope) -> anyhow::Result<Arc<T>> + Send + Sync + 'static,
    {
        Self::typed(Lifetime::Singleton, factory)
    }

    pub fn scoped<T, F>(factory: F) -> Self
    where
        T: ?Sized + Send + Sync + 'static,
        F: Fn(&ServiceScope) -> anyhow::Result<Arc<T>> + Send + Sync + 'static,
    {
        Self::typed(Lifetime::Scoped, factory)
    }

    pub fn transient<T, F>(factory: F) -> Self
    where
        T: ?Sized + Send + Sync + 'static,
        F: Fn(&ServiceScope) -> anyhow::Result<Arc<T>> + Send + Sync + 'static,
    {
        Self::typed(Lifetime::Transient, factory)
    }

    fn typed<T, F>(lifetime: Lifetime, factory: F) -> Self
    where
        T: ?Sized + Send + Sync + 'static,
        F: Fn(&ServiceScope) -> anyhow::Result<Arc<T>> + Send + Sync + 'static,
    {
        let erased: ServiceFactory =
            Arc::new(move |scope| factory(scope).map(|v| Arc::new(v) as ServiceArc));
        Self::erased(
            TypeId::of::<T>(),
            std::any::type_name::<T>(),
            lifetime,
            erased,
        )
    }

    /// A registration whose factory already produces a [`ServiceArc`].
    pub fn erased(
        type_id: TypeId,
        type_name: &'static str,
        lifetime: Lifetime,
        factory: ServiceFactory,
    ) -> Self {
        Self {
            type_id,
            type_name,
            lifetime,
            provider: Provider::Factory(factory),
            inherited: false,
        }
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn lifetime(&self) -> Lifetime {
        self.lifetime
    }

    /// Whether this registration was copied from the host container.
    pub fn is_inherited(&self) -> bool {
        self.inherited
    }
}

impl fmt::Debug for ServiceRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceRegistration")
            .field("type_name", &self.type_name)
            .field("lifetime", &self.lifetime)
            .field("inherited", &self.inherited)
            .finish()
    }
}

// ─── ServiceRegistry ──────────────────────────────────────────────────────────

/// Mapping from service types to creation rules, plus the singleton cache.
pub struct ServiceRegistry {
    container: String,
    registrations: RwLock<HashMap<TypeId, ServiceRegistration>>,
    singletons: RwLock<HashMap<TypeId, ServiceArc>>,
    /// Serializes first construction of each singleton.
    gates: Mutex<HashMap<TypeId, Arc<Mutex<()>>>>,
    alive: AtomicBool,
}

impl ServiceRegistry {
    pub fn new(container: impl Into<String>) -> Self {
        Self {
            container: container.into(),
            registrations: RwLock::new(HashMap::new()),
            singletons: RwLock::new(HashMap::new()),
            gates: Mutex::new(HashMap::new()),
            alive: AtomicBool::new(true),
        }
    }

    pub fn container(&self) -> &str {
        &self.container
    }

    /// Adds a registration. Exactly one registration per type is allowed.
    pub fn add(&self, registration: ServiceRegistration) -> Result<(), RegistryError> {
        let mut regs = self.registrations.write();
        if let Some(existing) = regs.get(&registration.type_id) {
            let name = registration.type_name.to_string();
            return Err(if existing.inherited {
                RegistryError::ReadOnly(name)
            } else {
                RegistryError::AlreadyRegistered(name)
            });
        }
        regs.insert(registration.type_id, registration);
        Ok(())
    }

    /// Removes a local registration and its cached singleton.
    pub fn remove(&self, type_id: TypeId) -> Result<(), RegistryError> {
        let mut regs = self.registrations.write();
        match regs.get(&type_id) {
            None => return Err(RegistryError::NotRegistered(format!("{type_id:?}"))),
            Some(reg) if reg.inherited => {
                return Err(RegistryError::ReadOnly(reg.type_name.to_string()));
            }
            Some(_) => {}
        }
        regs.remove(&type_id);
        self.singletons.write().remove(&type_id);
        self.gates.lock().remove(&type_id);
        Ok(())
    }

    pub fn contains(&self, type_id: TypeId) -> bool {
        self.registrations.read().contains_key(&type_id)
    }

    pub fn len(&self) -> usize {
        self.registrations.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copies every singleton of `host` into this registry as a read-only
    /// instance registration.
    ///
    /// Host singletons that have not been created yet are created now.
    pub fn inherit_from(&self, host: &Arc<ServiceRegistry>) -> Result<usize, RegistryError> {
        let singles: Vec<(TypeId, &'static str)> = host
            .registrations
            .read()
            .values()
            .filter(|r| r.lifetime == Lifetime::Singleton)
            .map(|r| (r.type_id, r.type_name))
            .collect();

        let scope = host.create_scope();
        let mut count = 0;
        for (type_id, type_name) in singles {
            let value = scope.resolve_erased(type_id, type_name)?;
            self.add(ServiceRegistration {
                type_id,
                type_name,
                lifetime: Lifetime::Singleton,
                provider: Provider::Instance(value),
                inherited: true,
            })?;
            count += 1;
        }
        Ok(count)
    }

    /// Drops every registration and cached instance. Later resolves fail
    /// with [`RegistryError::Unloaded`].
    pub fn clear(&self) {
        self.alive.store(false, Ordering::Release);
        self.registrations.write().clear();
        self.singletons.write().clear();
        self.gates.lock().clear();
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Opens a resolution scope. Scoped instances live as long as the scope.
    pub fn create_scope(self: &Arc<Self>) -> ServiceScope {
        ServiceScope {
            registry: Arc::clone(self),
            scoped: Mutex::new(HashMap::new()),
            resolving: Mutex::new(Vec::new()),
        }
    }

    fn cached_singleton(&self, type_id: TypeId) -> Option<ServiceArc> {
        self.singletons.read().get(&type_id).cloned()
    }

    fn singleton_gate(&self, type_id: TypeId) -> Arc<Mutex<()>> {
        Arc::clone(self.gates.lock().entry(type_id).or_default())
    }
}

impl fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("container", &self.container)
            .field("registrations", &self.len())
            .finish()
    }
}

// ─── ServiceScope ─────────────────────────────────────────────────────────────

/// A resolution scope over one registry.
pub struct ServiceScope {
    registry: Arc<ServiceRegistry>,
    scoped: Mutex<HashMap<TypeId, ServiceArc>>,
    resolving: Mutex<Vec<TypeId>>,
}

impl ServiceScope {
    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    /// Resolves `T` as registered in this scope's container.
    pub fn resolve<T>(&self) -> Result<Arc<T>, RegistryError>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        let name = std::any::type_name::<T>();
        let value = self.resolve_erased(TypeId::of::<T>(), name)?;
        value
            .downcast_ref::<Arc<T>>()
            .cloned()
            .ok_or_else(|| RegistryError::TypeMismatch(name.to_string()))
    }

    /// Resolves a service by type id, returning the erased value.
    pub fn resolve_erased(
        &self,
        type_id: TypeId,
        type_name: &str,
    ) -> Result<ServiceArc, RegistryError> {
        if !self.registry.is_alive() {
            return Err(RegistryError::Unloaded(self.registry.container.clone()));
        }

        let (lifetime, provider) = {
            let regs = self.registry.registrations.read();
            let reg = regs
                .get(&type_id)
                .ok_or_else(|| RegistryError::NotRegistered(type_name.to_string()))?;
            (reg.lifetime, reg.provider.clone())
        };

        let factory = match provider {
            Provider::Instance(value) => return Ok(value),
            Provider::Factory(factory) => factory,
        };

        match lifetime {
            Lifetime::Singleton => {
                if let Some(value) = self.registry.cached_singleton(type_id) {
                    return Ok(value);
                }
                // A singleton this scope is already building is a cycle, and
                // must fail before waiting on its own gate.
                if self.resolving.lock().contains(&type_id) {
                    return Err(RegistryError::Cycle(type_name.to_string()));
                }
                let gate = self.registry.singleton_gate(type_id);
                let _building = gate.lock();
                if let Some(value) = self.registry.cached_singleton(type_id) {
                    return Ok(value);
                }
                let value = self.construct(type_id, type_name, &factory)?;
                self.registry
                    .singletons
                    .write()
                    .insert(type_id, Arc::clone(&value));
                Ok(value)
            }
            Lifetime::Scoped => {
                if let Some(value) = self.scoped.lock().get(&type_id).cloned() {
                    return Ok(value);
                }
                let value = self.construct(type_id, type_name, &factory)?;
                let mut cache = self.scoped.lock();
                Ok(cache.entry(type_id).or_insert(value).clone())
            }
            Lifetime::Transient => self.construct(type_id, type_name, &factory),
        }
    }

    /// Whether a singleton of this type has already been created.
    pub fn is_created(&self, type_id: TypeId) -> bool {
        self.registry.cached_singleton(type_id).is_some()
    }

    fn construct(
        &self,
        type_id: TypeId,
        type_name: &str,
        factory: &ServiceFactory,
    ) -> Result<ServiceArc, RegistryError> {
        {
            let mut stack = self.resolving.lock();
            if stack.contains(&type_id) {
                return Err(RegistryError::Cycle(type_name.to_string()));
            }
            stack.push(type_id);
        }

        // No lock is held while the factory runs; it may resolve further services.
        let result = factory(self);

        self.resolving.lock().retain(|id| *id != type_id);

        result.map_err(|e| match e.downcast::<RegistryError>() {
            Ok(RegistryError::Cycle(name)) => RegistryError::Cycle(name),
            Ok(other) => RegistryError::Construction {
                name: type_name.to_string(),
                reason: other.to_string(),
            },
            Err(e) => RegistryError::Construction {
                name: type_name.to_string(),
                reason: format!("{e:#}"),
            },
        })
    }
}

impl fmt::Debug for ServiceScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceScope")
            .field("container", &self.registry.container)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    trait Greeter: Send + Sync {
        fn greet(&self) -> String;
    }

    struct English;

    impl Greeter for English {
        fn greet(&self) -> String {
            "hello".into()
        }
    }

    struct Counter(usize);

    fn registry() -> Arc<ServiceRegistry> {
        Arc::new(ServiceRegistry::new("test"))
    }

    #[test]
    fn test_resolve_trait_object_instance() {
        let reg = registry();
        reg.add(ServiceRegistration::instance::<dyn Greeter>(Arc::new(English)))
            .unwrap();
        let greeter = reg.create_scope().resolve::<dyn Greeter>().unwrap();
        assert_eq!(greeter.greet(), "hello");
    }

    #[test]
    fn test_duplicate_registration_is_rejected() {
        let reg = registry();
        reg.add(ServiceRegistration::instance(Arc::new(Counter(0))))
            .unwrap();
        let err = reg
            .add(ServiceRegistration::instance(Arc::new(Counter(1))))
            .unwrap_err();
        assert!(matches!(err, RegistryError::AlreadyRegistered(_)));
    }

    #[test]
    fn test_lifetimes() {
        let made = Arc::new(AtomicUsize::new(0));
        let reg = registry();

        let m = Arc::clone(&made);
        reg.add(ServiceRegistration::scoped(move |_| {
            Ok(Arc::new(Counter(m.fetch_add(1, Ordering::SeqCst))))
        }))
        .unwrap();

        let s1 = reg.create_scope();
        let a = s1.resolve::<Counter>().unwrap();
        let b = s1.resolve::<Counter>().unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        let c = reg.create_scope().resolve::<Counter>().unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(made.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_singleton_created_once() {
        let made = Arc::new(AtomicUsize::new(0));
        let reg = registry();
        let m = Arc::clone(&made);
        reg.add(ServiceRegistration::singleton(move |_| {
            m.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(Counter(7)))
        }))
        .unwrap();

        for _ in 0..3 {
            assert_eq!(reg.create_scope().resolve::<Counter>().unwrap().0, 7);
        }
        assert_eq!(made.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_concurrent_first_resolve_builds_singleton_once() {
        let made = Arc::new(AtomicUsize::new(0));
        let reg = registry();
        let m = Arc::clone(&made);
        reg.add(ServiceRegistration::singleton(move |_| {
            m.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(std::time::Duration::from_millis(50));
            Ok(Arc::new(Counter(9)))
        }))
        .unwrap();

        let barrier = std::sync::Barrier::new(8);
        let resolved: Vec<Arc<Counter>> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    s.spawn(|| {
                        barrier.wait();
                        reg.create_scope().resolve::<Counter>().unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(made.load(Ordering::SeqCst), 1);
        assert!(resolved.iter().all(|c| Arc::ptr_eq(c, &resolved[0])));
    }

    #[test]
    fn test_singleton_cycle_is_reported() {
        #[derive(Debug)]
        struct A;
        struct B;
        let reg = registry();
        reg.add(ServiceRegistration::singleton(|s: &ServiceScope| {
            s.resolve::<B>()?;
            Ok(Arc::new(A))
        }))
        .unwrap();
        reg.add(ServiceRegistration::singleton(|s: &ServiceScope| {
            s.resolve::<A>()?;
            Ok(Arc::new(B))
        }))
        .unwrap();

        let err = reg.create_scope().resolve::<A>().unwrap_err();
        assert!(matches!(err, RegistryError::Cycle(_)), "{err:?}");
        assert!(!reg.create_scope().is_created(TypeId::of::<A>()));
    }

    #[test]
    fn test_transient_is_fresh() {
        let reg = registry();
        reg.add(ServiceRegistration::transient(|_| Ok(Arc::new(Counter(1)))))
            .unwrap();
        let scope = reg.create_scope();
        let a = scope.resolve::<Counter>().unwrap();
        let b = scope.resolve::<Counter>().unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_cycle_is_reported() {
        #[derive(Debug)]
        struct A;
        struct B;
        let reg = registry();
        reg.add(ServiceRegistration::transient(|s: &ServiceScope| {
            s.resolve::<B>()?;
            Ok(Arc::new(A))
        }))
        .unwrap();
        reg.add(ServiceRegistration::transient(|s: &ServiceScope| {
            s.resolve::<A>()?;
            Ok(Arc::new(B))
        }))
        .unwrap();

        let err = reg.create_scope().resolve::<A>().unwrap_err();
        assert!(matches!(err, RegistryError::Cycle(_)), "{err:?}");
    }

    #[test]
    fn test_inherited_singletons_are_read_only() {
        let host = registry();
        host.add(ServiceRegistration::instance::<dyn Greeter>(Arc::new(English)))
            .unwrap();

        let child = Arc::new(ServiceRegistry::new("child"));
        assert_eq!(child.inherit_from(&host).unwrap(), 1);
        assert!(child.create_scope().resolve::<dyn Greeter>().is_ok());

        let err = child
            .add(ServiceRegistration::instance::<dyn Greeter>(Arc::new(English)))
            .unwrap_err();
        assert!(matches!(err, RegistryError::ReadOnly(_)));
        assert!(matches!(
            child.remove(TypeId::of::<dyn Greeter>()),
            Err(RegistryError::ReadOnly(_))
        ));
    }

    #[test]
    fn test_cleared_registry_rejects_resolves() {
        let reg = registry();
        reg.add(ServiceRegistration::instance(Arc::new(Counter(0))))
            .unwrap();
        let scope = reg.create_scope();
        reg.clear();
        assert!(matches!(
            scope.resolve::<Counter>(),
            Err(RegistryError::Unloaded(_))
        ));
    }
}
