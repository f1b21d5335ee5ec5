use std::collections::{HashMap, HashSet};
use std::fmt;

use anyhow::anyhow;
use clap::ArgMatches;

use crate::command::{CommandLine, parser};
use crate::error::{BindingError, DispatchError};
use crate::message::Authority;
use crate::plugin::decl::BoundValue;
use crate::plugin::descriptor::{BindingKind, CommandDescriptor, ParameterDescriptor};
use crate::service::ServiceScope;

/// Parameter values bound for one invocation, keyed by parameter name.
#[derive(Default)]
pub struct BoundArgs {
    values: HashMap<String, BoundValue>,
    supplied: HashSet<String>,
}

impl BoundArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<T: Send + 'static>(&mut self, name: impl Into<String>, value: T) {
        self.values.insert(name.into(), Box::new(value));
    }

    pub(crate) fn insert_boxed(&mut self, name: &str, value: BoundValue, supplied: bool) {
        self.values.insert(name.to_string(), value);
        if supplied {
            self.supplied.insert(name.to_string());
        }
    }

    /// Removes a bound value, downcasting it to `T`.
    ///
    /// Values parsed from text are bound as `T`; injected services as `Arc<T>`.
    pub fn take<T: 'static>(&mut self, name: &str) -> anyhow::Result<T> {
        let value = self
            .values
            .remove(name)
            .ok_or_else(|| anyhow!("parameter '{name}' is not bound"))?;
        value.downcast::<T>().map(|v| *v).map_err(|_| {
            anyhow!(
                "parameter '{name}' is not a {}",
                std::any::type_name::<T>()
            )
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    /// Whether the value came from the command line rather than a default.
    pub fn was_supplied(&self, name: &str) -> bool {
        self.supplied.contains(name)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl fmt::Debug for BoundArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundArgs")
            .field("names", &self.values.keys().collect::<Vec<_>>())
            .field("supplied", &self.supplied)
            .finish()
    }
}

struct Binder<'a> {
    command: &'a CommandDescriptor,
    authority: Authority,
    scope: &'a ServiceScope,
    matches: ArgMatches,
}

/// Binds a command line to a command's parameters.
///
/// Fails before anything runs when the caller lacks the command's authority,
/// or a parameter-level authority for a value they supplied.
pub(crate) fn bind(
    command: &CommandDescriptor,
    line: &CommandLine,
    authority: Authority,
    scope: &ServiceScope,
) -> Result<BoundArgs, DispatchError> {
    if authority < command.authority {
        return Err(DispatchError::AuthorityDenied {
            command: command.name.clone(),
            required: command.authority,
            actual: authority,
        });
    }

    let matches = parser::parse(&command.parser, &line.tokens)?;
    let binder = Binder {
        command,
        authority,
        scope,
        matches,
    };
    binder.bind_all("", &command.parameters)
}

impl Binder<'_> {
    fn bind_all(
        &self,
        prefix: &str,
        params: &[ParameterDescriptor],
    ) -> Result<BoundArgs, DispatchError> {
        let mut args = BoundArgs::new();
        for param in params {
            let id = parser::arg_id(prefix, &param.name);
            match &param.kind {
                BindingKind::Positional | BindingKind::NamedOption { .. } => {
                    let token = parser::supplied(&self.matches, &id, param);
                    self.bind_text(param, token, &mut args)?;
                }
                BindingKind::Injected => {
                    let value = self.inject(param)?;
                    args.insert_boxed(&param.name, value, false);
                }
                BindingKind::NestedModel { fields } => {
                    let mut inner = self.bind_all(&id, fields)?;
                    let supplied = fields.iter().any(|f| inner.was_supplied(&f.name));
                    let build = param.model.ok_or_else(|| {
                        BindingError::Model {
                            parameter: param.name.clone(),
                            reason: "no model schema".into(),
                        }
                    })?;
                    let value = (build.build)(&mut inner).map_err(|e| BindingError::Model {
                        parameter: param.name.clone(),
                        reason: format!("{e:#}"),
                    })?;
                    args.insert_boxed(&param.name, value, supplied);
                }
            }
        }
        Ok(args)
    }

    fn bind_text(
        &self,
        param: &ParameterDescriptor,
        token: Option<&str>,
        args: &mut BoundArgs,
    ) -> Result<(), DispatchError> {
        let (text, supplied) = match (token, param.default.as_deref()) {
            (Some(t), _) => (t, true),
            (None, Some(d)) => (d, false),
            (None, None) => return Err(BindingError::MissingValue(param.name.clone()).into()),
        };

        if supplied && self.authority < param.authority {
            return Err(DispatchError::AuthorityDenied {
                command: self.command.name.clone(),
                required: param.authority,
                actual: self.authority,
            });
        }

        let convert = param.converter.ok_or_else(|| BindingError::Conversion {
            parameter: param.name.clone(),
            value: text.to_string(),
            reason: "no text conversion".into(),
        })?;
        let value = convert(text).map_err(|reason| BindingError::Conversion {
            parameter: param.name.clone(),
            value: text.to_string(),
            reason,
        })?;
        args.insert_boxed(&param.name, value, supplied);
        Ok(())
    }

    fn inject(&self, param: &ParameterDescriptor) -> Result<BoundValue, BindingError> {
        let service_error = |reason: String| BindingError::Service {
            parameter: param.name.clone(),
            type_name: param.ty.name.to_string(),
            reason,
        };
        let service = self
            .scope
            .resolve_erased(param.ty.id, param.ty.name)
            .map_err(|e| service_error(e.to_string()))?;
        let inject = param
            .injector
            .ok_or_else(|| service_error("parameter is not injectable".into()))?;
        inject(&service).ok_or_else(|| service_error("unexpected stored type".into()))
    }
}
