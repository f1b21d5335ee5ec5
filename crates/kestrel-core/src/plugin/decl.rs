//! Declarations: what a plugin type says about itself before it is built.
//!
//! These values are the input of classification. They carry type identities
//! ([`TypeInfo`]) and erased callables, but no behaviour of their own.
//!
//! ```rust,ignore
//! PluginTypeDecl::basic::<Demo>()
//!     .identifier("1e1e623a-d89d-49ad-b801-f93dd94cf2d7")
//!     .lifetime(Lifetime::Singleton)
//!     .method(
//!         MethodDecl::new("echo")
//!             .command_handler()
//!             .param(ParamDecl::value::<String>("content").argument())
//!             .invoke(|mut inv| Ok(Response::text(inv.take::<String>("content")?))),
//!     )
//! ```

use std::any::{Any, TypeId};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::command::BoundArgs;
use crate::invocation::Invocation;
use crate::message::Authority;
use crate::plugin::{Plugin, PluginCapability};
use crate::response::ResponseStream;
use crate::service::{Lifetime, ServiceArc};

/// A boxed future resolving to a handler result.
pub type Deferred<T> = BoxFuture<'static, anyhow::Result<T>>;

/// A handler result before its return shape is interpreted.
pub type ErasedOutput = Box<dyn Any + Send>;

/// One bound parameter value.
pub type BoundValue = Box<dyn Any + Send>;

/// Erased handler entry point.
pub type Invoker = Arc<dyn Fn(Invocation) -> anyhow::Result<ErasedOutput> + Send + Sync>;

/// Erased message hook entry point.
pub type MessageHook = Arc<dyn Fn(Invocation) -> anyhow::Result<ResponseStream> + Send + Sync>;

/// Converts one text token into a typed value.
pub type Converter = fn(&str) -> Result<BoundValue, String>;

/// Extracts a typed `Arc<T>` from an erased service value.
pub type Injector = fn(&ServiceArc) -> Option<BoundValue>;

// ─── TypeInfo ─────────────────────────────────────────────────────────────────

/// Runtime identity of a declared type.
#[derive(Clone, Copy)]
pub struct TypeInfo {
    pub id: TypeId,
    pub name: &'static str,
}

impl TypeInfo {
    pub fn of<T: ?Sized + 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }

    pub fn is<T: ?Sized + 'static>(&self) -> bool {
        self.id == TypeId::of::<T>()
    }

    /// The last path segment of the type name, without generics.
    pub fn short_name(&self) -> &'static str {
        let base = self.name.split('<').next().unwrap_or(self.name);
        base.rsplit("::").next().unwrap_or(base)
    }
}

impl PartialEq for TypeInfo {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for TypeInfo {}

impl fmt::Debug for TypeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

// ─── Plugin type declaration ──────────────────────────────────────────────────

/// Everything a plugin type declares about itself.
#[derive(Clone)]
pub struct PluginTypeDecl {
    pub type_info: TypeInfo,
    pub capability: PluginCapability,
    pub lifetime: Option<Lifetime>,
    pub identifier: Option<String>,
    /// Ordering index; message hooks run in ascending index order.
    pub index: i32,
    pub name: Option<String>,
    pub description: Option<String>,
    pub version: Option<String>,
    pub authors: Vec<String>,
    pub methods: Vec<MethodDecl>,
    pub message_hook: Option<MessageHook>,
}

impl PluginTypeDecl {
    /// A command/message handling plugin.
    pub fn basic<P: Plugin>() -> Self {
        Self::with_capability::<P>(PluginCapability::Basic)
    }

    /// A shared service plugin. Its lifetime is always singleton.
    pub fn service<P: Plugin>() -> Self {
        Self::with_capability::<P>(PluginCapability::Service)
    }

    fn with_capability<P: Plugin>(capability: PluginCapability) -> Self {
        Self {
            type_info: TypeInfo::of::<P>(),
            capability,
            lifetime: None,
            identifier: None,
            index: 0,
            name: None,
            description: None,
            version: None,
            authors: Vec::new(),
            methods: Vec::new(),
            message_hook: None,
        }
    }

    pub fn lifetime(mut self, lifetime: Lifetime) -> Self {
        self.lifetime = Some(lifetime);
        self
    }

    pub fn identifier(mut self, id: impl Into<String>) -> Self {
        self.identifier = Some(id.into());
        self
    }

    pub fn index(mut self, index: i32) -> Self {
        self.index = index;
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn author(mut self, author: impl Into<String>) -> Self {
        self.authors.push(author.into());
        self
    }

    pub fn method(mut self, method: MethodDecl) -> Self {
        self.methods.push(method);
        self
    }

    /// Reacts to every inbound message that is not a command.
    pub fn on_message<F>(mut self, hook: F) -> Self
    where
        F: Fn(Invocation) -> anyhow::Result<ResponseStream> + Send + Sync + 'static,
    {
        self.message_hook = Some(Arc::new(hook));
        self
    }
}

impl fmt::Debug for PluginTypeDecl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginTypeDecl")
            .field("type", &self.type_info)
            .field("capability", &self.capability)
            .field("identifier", &self.identifier)
            .field("methods", &self.methods.len())
            .finish()
    }
}

// ─── Method declaration ───────────────────────────────────────────────────────

/// Marks a method as a command handler.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandAttr {
    /// Explicit command name. Defaults to the normalised method name.
    pub name: Option<String>,
    pub authority: Authority,
}

#[derive(Clone)]
pub struct MethodDecl {
    pub name: String,
    pub command: Option<CommandAttr>,
    pub description: Option<String>,
    pub params: Vec<ParamDecl>,
    pub returns: Option<TypeInfo>,
    pub(crate) invoker: Option<Invoker>,
}

impl MethodDecl {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: None,
            description: None,
            params: Vec::new(),
            returns: None,
            invoker: None,
        }
    }

    pub fn command_handler(mut self) -> Self {
        self.command.get_or_insert_with(CommandAttr::default);
        self
    }

    /// Marks the method as a handler for the given command name.
    pub fn named(mut self, command: impl Into<String>) -> Self {
        self.command.get_or_insert_with(CommandAttr::default).name = Some(command.into());
        self
    }

    /// Minimum authority required to run the command.
    pub fn authority(mut self, authority: Authority) -> Self {
        self.command.get_or_insert_with(CommandAttr::default).authority = authority;
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn param(mut self, param: ParamDecl) -> Self {
        self.params.push(param);
        self
    }

    /// Sets the handler body. The declared result type `R` decides the
    /// return shape of the command.
    pub fn invoke<R, F>(mut self, handler: F) -> Self
    where
        R: Send + 'static,
        F: Fn(Invocation) -> anyhow::Result<R> + Send + Sync + 'static,
    {
        self.returns = Some(TypeInfo::of::<R>());
        self.invoker = Some(Arc::new(move |inv| {
            handler(inv).map(|r| Box::new(r) as ErasedOutput)
        }));
        self
    }
}

impl fmt::Debug for MethodDecl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodDecl")
            .field("name", &self.name)
            .field("command", &self.command)
            .field("params", &self.params)
            .field("returns", &self.returns)
            .finish()
    }
}

// ─── Parameter declaration ────────────────────────────────────────────────────

/// A named option: `--name value` or `-x value`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptionAttr {
    pub name: String,
    pub abbr: Option<char>,
    pub default: Option<String>,
}

impl OptionAttr {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            abbr: None,
            default: None,
        }
    }

    pub fn abbr(mut self, abbr: char) -> Self {
        self.abbr = Some(abbr);
        self
    }

    pub fn default(mut self, default: impl Into<String>) -> Self {
        self.default = Some(default.into());
        self
    }
}

/// A positional argument.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArgumentAttr {
    pub default: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamAttr {
    Option(OptionAttr),
    Argument(ArgumentAttr),
    Description(String),
    /// Minimum authority required to supply a value for this parameter.
    Authority(Authority),
}

/// Schema of a [`BindingModel`] parameter.
#[derive(Clone, Copy)]
pub struct ModelSchema {
    pub fields: fn() -> Vec<ParamDecl>,
    pub build: fn(&mut BoundArgs) -> anyhow::Result<BoundValue>,
}

/// A type whose fields are bound as one group of options and arguments.
pub trait BindingModel: Send + 'static {
    /// The fields, each declared as an option or an argument.
    fn fields() -> Vec<ParamDecl>;

    /// Assembles the model from its bound fields.
    fn bind(args: &mut BoundArgs) -> anyhow::Result<Self>
    where
        Self: Sized;
}

#[derive(Clone)]
pub struct ParamDecl {
    pub name: String,
    pub ty: TypeInfo,
    pub attrs: Vec<ParamAttr>,
    /// Parameter-level default; wins over a default given on the attribute.
    pub default: Option<String>,
    pub(crate) converter: Option<Converter>,
    pub(crate) injector: Option<Injector>,
    pub(crate) model: Option<ModelSchema>,
}

impl ParamDecl {
    /// A value parsed from text with `FromStr`.
    ///
    /// Without an [`option`](Self::option) or [`argument`](Self::argument)
    /// attribute the parameter is injected from the container registry.
    pub fn value<T>(name: impl Into<String>) -> Self
    where
        T: FromStr + Send + Sync + 'static,
        T::Err: fmt::Display,
    {
        Self {
            name: name.into(),
            ty: TypeInfo::of::<T>(),
            attrs: Vec::new(),
            default: None,
            converter: Some(convert::<T>),
            injector: Some(inject::<T>),
            model: None,
        }
    }

    /// A service resolved from the registry and bound as `Arc<T>`.
    pub fn service<T>(name: impl Into<String>) -> Self
    where
        T: ?Sized + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            ty: TypeInfo::of::<T>(),
            attrs: Vec::new(),
            default: None,
            converter: None,
            injector: Some(inject::<T>),
            model: None,
        }
    }

    /// A nested model bound from its own options and arguments.
    pub fn model<M: BindingModel>(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ty: TypeInfo::of::<M>(),
            attrs: Vec::new(),
            default: None,
            converter: None,
            injector: None,
            model: Some(ModelSchema {
                fields: M::fields,
                build: build_model::<M>,
            }),
        }
    }

    pub fn attr(mut self, attr: ParamAttr) -> Self {
        self.attrs.push(attr);
        self
    }

    /// Binds the parameter positionally.
    pub fn argument(self) -> Self {
        self.attr(ParamAttr::Argument(ArgumentAttr::default()))
    }

    /// Binds the parameter as `--name`.
    pub fn option(self, name: impl Into<String>) -> Self {
        self.attr(ParamAttr::Option(OptionAttr::new(name)))
    }

    /// Binds the parameter as `--name` / `-abbr`.
    pub fn option_abbr(self, name: impl Into<String>, abbr: char) -> Self {
        self.attr(ParamAttr::Option(OptionAttr::new(name).abbr(abbr)))
    }

    pub fn default(mut self, default: impl Into<String>) -> Self {
        self.default = Some(default.into());
        self
    }

    pub fn describe(self, description: impl Into<String>) -> Self {
        self.attr(ParamAttr::Description(description.into()))
    }

    pub fn authority(self, authority: Authority) -> Self {
        self.attr(ParamAttr::Authority(authority))
    }

    pub fn has_converter(&self) -> bool {
        self.converter.is_some()
    }

    pub fn is_model(&self) -> bool {
        self.model.is_some()
    }
}

impl fmt::Debug for ParamDecl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParamDecl")
            .field("name", &self.name)
            .field("ty", &self.ty)
            .field("attrs", &self.attrs)
            .field("default", &self.default)
            .finish()
    }
}

fn convert<T>(text: &str) -> Result<BoundValue, String>
where
    T: FromStr + Send + 'static,
    T::Err: fmt::Display,
{
    text.parse::<T>()
        .map(|v| Box::new(v) as BoundValue)
        .map_err(|e| e.to_string())
}

fn inject<T>(service: &ServiceArc) -> Option<BoundValue>
where
    T: ?Sized + Send + Sync + 'static,
{
    service
        .downcast_ref::<Arc<T>>()
        .map(|v| Box::new(Arc::clone(v)) as BoundValue)
}

fn build_model<M: BindingModel>(args: &mut BoundArgs) -> anyhow::Result<BoundValue> {
    M::bind(args).map(|m| Box::new(m) as BoundValue)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_name() {
        assert_eq!(TypeInfo::of::<String>().short_name(), "String");
        assert_eq!(TypeInfo::of::<Vec<u8>>().short_name(), "Vec");
    }

    #[test]
    fn test_converter_reports_parse_errors() {
        let decl = ParamDecl::value::<u8>("age").argument();
        let convert = decl.converter.unwrap();
        let value = convert("14").unwrap();
        assert_eq!(*value.downcast::<u8>().unwrap(), 14);
        assert!(convert("300").is_err());
    }

    #[test]
    fn test_method_invoke_records_return_type() {
        let m = MethodDecl::new("ping")
            .command_handler()
            .invoke(|_| Ok(crate::Response::text("pong")));
        assert!(m.returns.unwrap().is::<crate::Response>());
        assert_eq!(m.command, Some(CommandAttr::default()));
    }
}
