//! # Kestrel
//!
//! A chat-bot framework that hosts plugins in isolated module containers.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐     ┌────────────────┐     ┌─────────────────────────────────────┐
//! │ Transport │────▶│ KestrelRuntime │────▶│ waiter registry (pending replies)   │
//! │           │◀──┐ │  enrich, gate  │────▶│ Dispatcher ──▶ container "host"     │
//! └───────────┘   │ └────────────────┘     │            ──▶ container "weather"  │
//!                 └────── responses ───────│            ──▶ ...                  │
//!                                          └─────────────────────────────────────┘
//! ```
//!
//! - **Containers**: one per plugin directory, each with its own service
//!   registry; loaded and unloaded at runtime
//! - **Plugins**: types implementing [`Plugin`](prelude::Plugin) that declare
//!   their commands, parameters and lifetime up front
//! - **Conversations**: a handler can await the next message of the same
//!   user in the same channel, with a timeout
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use kestrel::prelude::*;
//!
//! struct Dice;
//!
//! impl Plugin for Dice {
//!     fn describe() -> PluginTypeDecl {
//!         PluginTypeDecl::basic::<Self>()
//!             .identifier("8e3bd1b6-4f1f-4c55-9d3e-1a2b3c4d5e6f")
//!             .lifetime(Lifetime::Singleton)
//!             .method(
//!                 MethodDecl::new("roll")
//!                     .command_handler()
//!                     .param(ParamDecl::value::<u32>("sides").argument().default("6"))
//!                     .invoke(|mut inv| {
//!                         let sides: u32 = inv.take("sides")?;
//!                         Ok(inv.reply(format!("rolled a d{sides}")))
//!                     }),
//!             )
//!     }
//!
//!     fn construct(_: &ServiceScope) -> anyhow::Result<Self> {
//!         Ok(Dice)
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let runtime = KestrelRuntime::builder()
//!         .transport(Arc::new(MyTransport::default()))
//!         .artifact(Artifact::new("dice", "1.0.0").plugin::<Dice>())
//!         .build()?;
//!     runtime.run().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Features
//!
//! - `yaml-config`: also read `kestrel.yaml`
//! - `json-log`: JSON log output

pub use kestrel_core as core;
pub use kestrel_runtime as runtime;

/// Everything a plugin crate or bot binary usually needs.
pub mod prelude {
    pub use kestrel_core::prelude::*;
    pub use kestrel_core::{
        ArtifactCatalog, ContactsProvider, ConversationId, DispatchError, InboundMessage,
        MemoryContacts, Transport, TransportError,
    };
    pub use kestrel_runtime::prelude::*;
    pub use kestrel_runtime::{
        ConfigLoader, KestrelConfig, KestrelRuntime, PluginSettings, Routed, RuntimeError,
    };
}
