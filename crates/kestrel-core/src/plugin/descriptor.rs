//! Descriptors: the immutable, classified form of plugin declarations.

use std::fmt;
use std::sync::Arc;

use uuid::Uuid;

use crate::message::Authority;
use crate::plugin::decl::{Converter, Injector, Invoker, MessageHook, ModelSchema, TypeInfo};
use crate::plugin::{PluginCapability, PluginType};
use crate::service::Lifetime;

/// How a parameter gets its value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindingKind {
    NamedOption { name: String, abbr: Option<char> },
    Positional,
    NestedModel { fields: Vec<ParameterDescriptor> },
    Injected,
}

/// Classification of a handler's declared result type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReturnShape {
    /// `()`
    NoResult,
    /// `Deferred<()>`
    DeferredUnit,
    /// `Deferred<Response>`
    DeferredResponse,
    /// `Response`
    Response,
    /// `Vec<Response>`
    EagerSequence,
    /// `ResponseStream`
    LazySequence,
    /// Anything else; forwarded to the transport uninterpreted.
    Dynamic,
}

#[derive(Clone)]
pub struct ParameterDescriptor {
    pub name: String,
    pub ty: TypeInfo,
    pub kind: BindingKind,
    pub default: Option<String>,
    pub description: Option<String>,
    /// `Unspecified` when the parameter has no authority requirement.
    pub authority: Authority,
    pub(crate) converter: Option<Converter>,
    pub(crate) injector: Option<Injector>,
    pub(crate) model: Option<ModelSchema>,
}

impl ParameterDescriptor {
    /// Whether binding fails when no value is supplied.
    pub fn is_required(&self) -> bool {
        match &self.kind {
            BindingKind::NamedOption { .. } | BindingKind::Positional => self.default.is_none(),
            BindingKind::NestedModel { .. } | BindingKind::Injected => false,
        }
    }

    /// A `bool` option, set by its presence alone.
    pub fn is_flag(&self) -> bool {
        matches!(self.kind, BindingKind::NamedOption { .. }) && self.ty.is::<bool>()
    }

    /// Usage form, e.g. `<content>`, `[--age <u8>]`.
    pub fn usage(&self) -> String {
        let body = match &self.kind {
            BindingKind::Positional => format!("<{}>", self.name),
            BindingKind::NamedOption { name, abbr } if self.is_flag() => match abbr {
                Some(a) => format!("-{a}|--{name}"),
                None => format!("--{name}"),
            },
            BindingKind::NamedOption { name, abbr } => match abbr {
                Some(a) => format!("-{a}|--{name} <{}>", self.ty.short_name()),
                None => format!("--{name} <{}>", self.ty.short_name()),
            },
            BindingKind::NestedModel { fields } => {
                return fields
                    .iter()
                    .map(ParameterDescriptor::usage)
                    .collect::<Vec<_>>()
                    .join(" ");
            }
            BindingKind::Injected => return String::new(),
        };
        if self.is_required() {
            body
        } else {
            format!("[{body}]")
        }
    }
}

impl PartialEq for ParameterDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.ty == other.ty
            && self.kind == other.kind
            && self.default == other.default
            && self.description == other.description
            && self.authority == other.authority
    }
}

impl Eq for ParameterDescriptor {}

impl fmt::Debug for ParameterDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParameterDescriptor")
            .field("name", &self.name)
            .field("ty", &self.ty)
            .field("kind", &self.kind)
            .field("default", &self.default)
            .field("authority", &self.authority)
            .finish()
    }
}

pub struct CommandDescriptor {
    pub name: String,
    pub method: String,
    pub description: Option<String>,
    pub authority: Authority,
    pub return_shape: ReturnShape,
    pub return_type: TypeInfo,
    pub parameters: Vec<ParameterDescriptor>,
    pub(crate) invoker: Invoker,
    pub(crate) parser: clap::Command,
}

impl CommandDescriptor {
    pub fn usage(&self) -> String {
        let mut parts = vec![self.name.clone()];
        parts.extend(
            self.parameters
                .iter()
                .map(ParameterDescriptor::usage)
                .filter(|u| !u.is_empty()),
        );
        parts.join(" ")
    }
}

impl fmt::Debug for CommandDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandDescriptor")
            .field("name", &self.name)
            .field("method", &self.method)
            .field("authority", &self.authority)
            .field("return_shape", &self.return_shape)
            .field("parameters", &self.parameters)
            .finish()
    }
}

/// Identity of a plugin type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginMetadata {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub version: String,
    pub authors: Vec<String>,
    pub index: i32,
}

/// The classified form of one plugin type, owned by its container.
pub struct PluginDescriptor {
    pub metadata: PluginMetadata,
    pub lifetime: Lifetime,
    pub capability: PluginCapability,
    pub container: String,
    pub plugin_type: PluginType,
    /// Ordered command table; names are unique.
    pub commands: Vec<Arc<CommandDescriptor>>,
    pub(crate) message_hook: Option<MessageHook>,
}

impl PluginDescriptor {
    pub fn command(&self, name: &str) -> Option<&Arc<CommandDescriptor>> {
        self.commands.iter().find(|c| c.name == name)
    }

    pub fn has_message_hook(&self) -> bool {
        self.message_hook.is_some()
    }
}

impl fmt::Debug for PluginDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginDescriptor")
            .field("metadata", &self.metadata)
            .field("lifetime", &self.lifetime)
            .field("capability", &self.capability)
            .field("container", &self.container)
            .field("commands", &self.commands)
            .finish()
    }
}
