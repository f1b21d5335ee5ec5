//! # Kestrel Core
//!
//! The plugin-hosting engine of the Kestrel chat-bot framework.
//!
//! This crate provides:
//! - [`ModuleContainer`]s: isolated groups of plugin types with their own
//!   [`ServiceRegistry`]
//! - The descriptor builder that classifies plugin declarations into
//!   [`PluginDescriptor`] / [`CommandDescriptor`] tables at load time
//! - The [`Dispatcher`], which binds tokenized command lines to handler
//!   parameters and drains the produced response sequences
//! - The [`WaiterRegistry`], which parks a response sequence until the next
//!   message of the same conversation arrives (or a timeout elapses)
//!
//! Transports and the contacts roster are external collaborators, modelled
//! by the [`Transport`] and [`ContactsProvider`] traits.
//!
//! # Example
//!
//! ```rust,ignore
//! use kestrel_core::prelude::*;
//!
//! struct Greeter;
//!
//! #[async_trait::async_trait]
//! impl Plugin for Greeter {
//!     fn describe() -> PluginTypeDecl {
//!         PluginTypeDecl::basic::<Self>()
//!             .identifier("1e1e623a-d89d-49ad-b801-f93dd94cf2d7")
//!             .lifetime(Lifetime::Singleton)
//!             .method(
//!                 MethodDecl::new("hello")
//!                     .command_handler()
//!                     .param(ParamDecl::value::<String>("content").default("world").argument())
//!                     .invoke(|mut inv| {
//!                         let content: String = inv.take("content")?;
//!                         Ok(Response::text(format!("hello {content}")))
//!                     }),
//!             )
//!     }
//!
//!     fn construct(_: &ServiceScope) -> anyhow::Result<Self> {
//!         Ok(Greeter)
//!     }
//! }
//! ```

pub mod command;
pub mod contacts;
pub mod container;
pub mod dispatcher;
pub mod error;
pub mod invocation;
pub mod message;
pub mod plugin;
pub mod response;
pub mod service;
pub mod transport;
pub mod waiter;

pub use command::{BoundArgs, CommandLine, shell_split};
pub use contacts::{ContactsProvider, MemoryContacts, enrich};
pub use container::{HOST_CONTAINER, ModuleContainer};
pub use dispatcher::{CommandSummary, CommandTable, DispatchOptions, Dispatcher};
pub use error::{
    BindingError, ClassificationError, DispatchError, DispatchResult, LoadError, RegistryError,
};
pub use invocation::Invocation;
pub use message::{
    Authority, ChannelInfo, ConversationId, InboundMessage, MemberInfo, MemberRole,
    MessageContext, Response,
};
pub use plugin::artifact::{Artifact, ArtifactCatalog, HOST_ARTIFACTS};
pub use plugin::decl::{
    ArgumentAttr, BindingModel, CommandAttr, Deferred, MethodDecl, OptionAttr, ParamAttr,
    ParamDecl, PluginTypeDecl, TypeInfo,
};
pub use plugin::descriptor::{
    BindingKind, CommandDescriptor, ParameterDescriptor, PluginDescriptor, PluginMetadata,
    ReturnShape,
};
pub use plugin::{Plugin, PluginCapability, PluginType};
pub use response::{ResponseStream, Yielder};
pub use service::{Lifetime, ServiceArc, ServiceRegistration, ServiceRegistry, ServiceScope};
pub use transport::{BoxedTransport, DynamicValue, Transport, TransportError};
pub use waiter::{Conversation, PendingWaiter, WaiterRegistry, WaiterState};

// Re-exported so the built-in artifact slice can be extended from other crates.
#[doc(hidden)]
pub use linkme;

/// Commonly used items for plugin authors.
pub mod prelude {
    pub use crate::{
        ArgumentAttr, Artifact, Authority, BindingModel, BoundArgs, CommandAttr, Conversation,
        Deferred, Invocation, Lifetime, MessageContext, MethodDecl, OptionAttr, ParamDecl,
        Plugin, PluginCapability, PluginTypeDecl, Response, ResponseStream, ServiceRegistration,
        ServiceScope, Yielder,
    };
}
