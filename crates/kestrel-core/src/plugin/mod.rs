//! Plugin types, their declarations and the descriptors built from them.
//!
//! A plugin type is any `Send + Sync` struct implementing [`Plugin`]. It
//! describes itself through [`Plugin::describe`] without being constructed;
//! the container classifies that declaration into a
//! [`PluginDescriptor`](descriptor::PluginDescriptor) at load time and only
//! constructs instances when they are needed.

pub mod artifact;
pub mod classify;
pub mod decl;
pub mod descriptor;

use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::message::MessageContext;
use crate::service::{ServiceArc, ServiceScope};

use self::decl::PluginTypeDecl;

// ─── PluginCapability ─────────────────────────────────────────────────────────

/// The base capability a plugin type declares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PluginCapability {
    /// Handles commands and messages. Must declare an explicit lifetime.
    Basic,
    /// A shared service plugin. Always a singleton.
    Service,
}

impl fmt::Display for PluginCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Basic => f.write_str("basic"),
            Self::Service => f.write_str("service"),
        }
    }
}

// ─── Plugin trait ─────────────────────────────────────────────────────────────

/// A plugin type hosted by a module container.
///
/// Lifecycle hooks default to no-ops. `on_executing` / `on_executed` wrap
/// every command invocation on this plugin's instance.
#[async_trait]
pub trait Plugin: Any + Send + Sync {
    /// Static declaration of this type. Must not construct the plugin.
    fn describe() -> PluginTypeDecl
    where
        Self: Sized;

    /// Builds an instance, resolving dependencies from `services`.
    fn construct(services: &ServiceScope) -> anyhow::Result<Self>
    where
        Self: Sized;

    async fn on_initialized(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_uninitialized(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_executing(&self, _context: &MessageContext) {}

    async fn on_executed(&self, _context: &MessageContext) {}
}

// ─── PluginType ───────────────────────────────────────────────────────────────

/// A type-erased handle to a [`Plugin`] implementation.
///
/// Instances are stored in the container registry as [`ServiceArc`]s holding
/// an `Arc<P>`; this handle knows how to build and view them.
#[derive(Clone, Copy)]
pub struct PluginType {
    type_id: TypeId,
    type_name: &'static str,
    describe: fn() -> PluginTypeDecl,
    construct: fn(&ServiceScope) -> anyhow::Result<ServiceArc>,
    view: fn(&ServiceArc) -> Option<Arc<dyn Plugin>>,
}

impl PluginType {
    pub fn of<P: Plugin>() -> Self {
        Self {
            type_id: TypeId::of::<P>(),
            type_name: std::any::type_name::<P>(),
            describe: P::describe,
            construct: construct_erased::<P>,
            view: view_erased::<P>,
        }
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn describe(&self) -> PluginTypeDecl {
        (self.describe)()
    }

    pub fn construct(&self, services: &ServiceScope) -> anyhow::Result<ServiceArc> {
        (self.construct)(services)
    }

    /// Views an erased instance as a `dyn Plugin` for lifecycle hooks.
    pub fn view(&self, instance: &ServiceArc) -> Option<Arc<dyn Plugin>> {
        (self.view)(instance)
    }
}

impl fmt::Debug for PluginType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PluginType").field(&self.type_name).finish()
    }
}

fn construct_erased<P: Plugin>(services: &ServiceScope) -> anyhow::Result<ServiceArc> {
    let plugin = P::construct(services)?;
    Ok(Arc::new(Arc::new(plugin)))
}

fn view_erased<P: Plugin>(instance: &ServiceArc) -> Option<Arc<dyn Plugin>> {
    instance
        .downcast_ref::<Arc<P>>()
        .map(|p| Arc::clone(p) as Arc<dyn Plugin>)
}
