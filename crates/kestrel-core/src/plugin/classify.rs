//! Classification of plugin declarations into descriptors.
//!
//! Runs once per plugin type at container load. Type-level problems
//! (lifetime, identity, duplicate handlers or commands) reject the whole
//! type; a malformed method or parameter only drops that one command and is
//! reported alongside the descriptor.

use std::collections::HashSet;
use std::sync::Arc;

use uuid::Uuid;

use crate::command::command_parser;
use crate::error::ClassificationError;
use crate::message::{Authority, Response};
use crate::plugin::decl::{Deferred, MethodDecl, ParamAttr, ParamDecl, PluginTypeDecl, TypeInfo};
use crate::plugin::descriptor::{
    BindingKind, CommandDescriptor, ParameterDescriptor, PluginDescriptor, PluginMetadata,
    ReturnShape,
};
use crate::plugin::{PluginCapability, PluginType};
use crate::response::ResponseStream;
use crate::service::Lifetime;

pub const DEFAULT_DESCRIPTION: &str = "Nothing here.";
pub const DEFAULT_VERSION: &str = "0.0.1-alpha";
pub const DEFAULT_AUTHOR: &str = "anonymous";

/// A classified plugin type plus the members that were dropped from it.
#[derive(Debug)]
pub struct Classified {
    pub descriptor: PluginDescriptor,
    pub rejected: Vec<ClassificationError>,
}

/// Classifies a plugin type from its own declaration.
pub fn classify(plugin_type: PluginType, container: &str) -> Result<Classified, ClassificationError> {
    classify_decl(plugin_type.describe(), plugin_type, container)
}

pub fn classify_decl(
    decl: PluginTypeDecl,
    plugin_type: PluginType,
    container: &str,
) -> Result<Classified, ClassificationError> {
    let type_name = decl.type_info.short_name().to_string();

    let lifetime = match decl.capability {
        PluginCapability::Service => Lifetime::Singleton,
        PluginCapability::Basic => decl
            .lifetime
            .ok_or_else(|| ClassificationError::MissingLifetime {
                type_name: type_name.clone(),
            })?,
    };

    let raw_id = decl
        .identifier
        .as_deref()
        .ok_or_else(|| ClassificationError::MissingIdentifier {
            type_name: type_name.clone(),
        })?;
    let id = Uuid::parse_str(raw_id).map_err(|e| ClassificationError::InvalidIdentifier {
        type_name: type_name.clone(),
        id: raw_id.to_string(),
        reason: e.to_string(),
    })?;

    let mut seen_methods = HashSet::new();
    for method in decl.methods.iter().filter(|m| m.command.is_some()) {
        if !seen_methods.insert(method.name.as_str()) {
            return Err(ClassificationError::DuplicateMethod {
                type_name,
                method: method.name.clone(),
            });
        }
    }

    let mut commands: Vec<Arc<CommandDescriptor>> = Vec::new();
    let mut rejected = Vec::new();
    for method in decl.methods.iter().filter(|m| m.command.is_some()) {
        match classify_method(&type_name, method) {
            Ok(command) => {
                if commands.iter().any(|c| c.name == command.name) {
                    return Err(ClassificationError::DuplicateCommand {
                        type_name,
                        command: command.name,
                    });
                }
                commands.push(Arc::new(command));
            }
            Err(err) => rejected.push(err),
        }
    }

    let metadata = PluginMetadata {
        id,
        name: decl.name.clone().unwrap_or_else(|| type_name.clone()),
        description: decl
            .description
            .clone()
            .unwrap_or_else(|| DEFAULT_DESCRIPTION.to_string()),
        version: decl
            .version
            .clone()
            .unwrap_or_else(|| DEFAULT_VERSION.to_string()),
        authors: if decl.authors.is_empty() {
            vec![DEFAULT_AUTHOR.to_string()]
        } else {
            decl.authors.clone()
        },
        index: decl.index,
    };

    Ok(Classified {
        descriptor: PluginDescriptor {
            metadata,
            lifetime,
            capability: decl.capability,
            container: container.to_string(),
            plugin_type,
            commands,
            message_hook: decl.message_hook,
        },
        rejected,
    })
}

/// Lower-cases a method name and drops underscores.
pub fn normalize_command_name(method: &str) -> String {
    method
        .chars()
        .filter(|c| *c != '_')
        .flat_map(char::to_lowercase)
        .collect()
}

/// Maps a declared result type onto its return shape.
pub fn return_shape(ty: &TypeInfo) -> ReturnShape {
    if ty.is::<()>() {
        ReturnShape::NoResult
    } else if ty.is::<Deferred<()>>() {
        ReturnShape::DeferredUnit
    } else if ty.is::<Deferred<Response>>() {
        ReturnShape::DeferredResponse
    } else if ty.is::<Response>() {
        ReturnShape::Response
    } else if ty.is::<Vec<Response>>() {
        ReturnShape::EagerSequence
    } else if ty.is::<ResponseStream>() {
        ReturnShape::LazySequence
    } else {
        ReturnShape::Dynamic
    }
}

fn classify_method(
    type_name: &str,
    method: &MethodDecl,
) -> Result<CommandDescriptor, ClassificationError> {
    let attr = method.command.clone().unwrap_or_default();
    let (Some(invoker), Some(returns)) = (method.invoker.clone(), method.returns) else {
        return Err(ClassificationError::MissingInvoker {
            type_name: type_name.to_string(),
            method: method.name.clone(),
        });
    };

    let param_error = |parameter: &str, reason: String| ClassificationError::Parameter {
        type_name: type_name.to_string(),
        method: method.name.clone(),
        parameter: parameter.to_string(),
        reason,
    };

    let mut parameters = Vec::with_capacity(method.params.len());
    let mut names = HashSet::new();
    for param in &method.params {
        if !names.insert(param.name.as_str()) {
            return Err(param_error(&param.name, "duplicate parameter name".into()));
        }
        let desc = classify_param(param, false).map_err(|r| param_error(&param.name, r))?;
        parameters.push(desc);
    }
    check_option_names(&parameters).map_err(|(p, r)| param_error(&p, r))?;

    let name = match attr.name {
        Some(name) => name,
        None => normalize_command_name(&method.name),
    };

    let parser = command_parser(&name, &parameters);
    Ok(CommandDescriptor {
        name,
        method: method.name.clone(),
        description: method.description.clone(),
        authority: attr.authority,
        return_shape: return_shape(&returns),
        return_type: returns,
        parser,
        parameters,
        invoker,
    })
}

fn classify_param(param: &ParamDecl, in_model: bool) -> Result<ParameterDescriptor, String> {
    let mut binding = None;
    let mut description = None;
    let mut authority = Authority::Unspecified;
    for attr in &param.attrs {
        match attr {
            ParamAttr::Option(_) | ParamAttr::Argument(_) => {
                if binding.replace(attr).is_some() {
                    return Err("declares more than one binding kind".into());
                }
            }
            ParamAttr::Description(text) => description = Some(text.clone()),
            ParamAttr::Authority(level) => authority = authority.max(*level),
        }
    }

    let (kind, default) = match binding {
        Some(ParamAttr::Option(opt)) => {
            if opt.name.is_empty() || opt.name.starts_with('-') || opt.name.contains(['=', ' ']) {
                return Err(format!("invalid option name '{}'", opt.name));
            }
            if let Some(abbr) = opt.abbr
                && !abbr.is_alphanumeric()
            {
                return Err(format!("invalid option abbreviation '{abbr}'"));
            }
            let kind = BindingKind::NamedOption {
                name: opt.name.clone(),
                abbr: opt.abbr,
            };
            let default = param.default.clone().or_else(|| opt.default.clone());
            // An absent flag reads as false.
            let default = match default {
                None if param.ty.is::<bool>() => Some("false".to_string()),
                other => other,
            };
            (kind, default)
        }
        Some(ParamAttr::Argument(arg)) => (
            BindingKind::Positional,
            param.default.clone().or_else(|| arg.default.clone()),
        ),
        _ => {
            return match (&param.model, in_model) {
                (Some(_), true) => Err("nested models cannot nest further".into()),
                (None, true) => Err("model fields must be options or arguments".into()),
                (Some(schema), false) => {
                    let fields = (schema.fields)()
                        .iter()
                        .map(|f| {
                            classify_param(f, true).map_err(|r| format!("field '{}': {r}", f.name))
                        })
                        .collect::<Result<Vec<_>, _>>()?;
                    Ok(ParameterDescriptor {
                        name: param.name.clone(),
                        ty: param.ty,
                        kind: BindingKind::NestedModel { fields },
                        default: None,
                        description,
                        authority,
                        converter: None,
                        injector: None,
                        model: Some(*schema),
                    })
                }
                (None, false) => {
                    if param.injector.is_none() {
                        return Err(format!("type {} cannot be injected", param.ty.name));
                    }
                    Ok(ParameterDescriptor {
                        name: param.name.clone(),
                        ty: param.ty,
                        kind: BindingKind::Injected,
                        default: None,
                        description,
                        authority,
                        converter: None,
                        injector: param.injector,
                        model: None,
                    })
                }
            };
        }
    };

    let Some(converter) = param.converter else {
        return Err(format!("type {} has no text conversion", param.ty.name));
    };
    if let Some(text) = &default {
        converter(text).map_err(|e| format!("invalid default '{text}': {e}"))?;
    }

    Ok(ParameterDescriptor {
        name: param.name.clone(),
        ty: param.ty,
        kind,
        default,
        description,
        authority,
        converter: Some(converter),
        injector: None,
        model: None,
    })
}

/// Option names and abbreviations must be unique across one command line,
/// model fields included.
fn check_option_names(params: &[ParameterDescriptor]) -> Result<(), (String, String)> {
    fn walk<'a>(
        params: &'a [ParameterDescriptor],
        names: &mut HashSet<&'a str>,
        abbrs: &mut HashSet<char>,
    ) -> Result<(), (String, String)> {
        for p in params {
            match &p.kind {
                BindingKind::NamedOption { name, abbr } => {
                    if !names.insert(name.as_str()) {
                        return Err((p.name.clone(), format!("option --{name} is declared twice")));
                    }
                    if let Some(a) = abbr
                        && !abbrs.insert(*a)
                    {
                        return Err((p.name.clone(), format!("option -{a} is declared twice")));
                    }
                }
                BindingKind::NestedModel { fields } => walk(fields, names, abbrs)?,
                BindingKind::Positional | BindingKind::Injected => {}
            }
        }
        Ok(())
    }
    walk(params, &mut HashSet::new(), &mut HashSet::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::BoundArgs;
    use crate::plugin::Plugin;
    use crate::plugin::decl::{BindingModel, OptionAttr};
    use crate::service::ServiceScope;

    const ID: &str = "1e1e623a-d89d-49ad-b801-f93dd94cf2d7";

    struct Probe;

    impl Plugin for Probe {
        fn describe() -> PluginTypeDecl {
            PluginTypeDecl::basic::<Self>()
                .identifier(ID)
                .lifetime(Lifetime::Scoped)
        }

        fn construct(_: &ServiceScope) -> anyhow::Result<Self> {
            Ok(Probe)
        }
    }

    struct Profile;

    impl BindingModel for Profile {
        fn fields() -> Vec<ParamDecl> {
            vec![
                ParamDecl::value::<String>("name").option("name"),
                ParamDecl::value::<u8>("age").attr(ParamAttr::Option(
                    OptionAttr::new("age").default("14"),
                )),
            ]
        }

        fn bind(_: &mut BoundArgs) -> anyhow::Result<Self> {
            Ok(Profile)
        }
    }

    struct Nested;

    impl BindingModel for Nested {
        fn fields() -> Vec<ParamDecl> {
            vec![ParamDecl::model::<Profile>("inner")]
        }

        fn bind(_: &mut BoundArgs) -> anyhow::Result<Self> {
            Ok(Nested)
        }
    }

    fn run(decl: PluginTypeDecl) -> Result<Classified, ClassificationError> {
        classify_decl(decl, PluginType::of::<Probe>(), "test")
    }

    fn base() -> PluginTypeDecl {
        Probe::describe()
    }

    fn unit_handler(name: &str) -> MethodDecl {
        MethodDecl::new(name).command_handler().invoke(|_| Ok(()))
    }

    #[test]
    fn test_identity_defaults() {
        let c = run(base()).unwrap();
        let meta = &c.descriptor.metadata;
        assert_eq!(meta.name, "Probe");
        assert_eq!(meta.description, DEFAULT_DESCRIPTION);
        assert_eq!(meta.version, DEFAULT_VERSION);
        assert_eq!(meta.authors, vec![DEFAULT_AUTHOR.to_string()]);
        assert_eq!(meta.id.to_string(), ID);
        assert_eq!(c.descriptor.lifetime, Lifetime::Scoped);
    }

    #[test]
    fn test_missing_lifetime_and_identifier() {
        let mut decl = base();
        decl.lifetime = None;
        assert!(matches!(
            run(decl),
            Err(ClassificationError::MissingLifetime { .. })
        ));

        let mut decl = base();
        decl.identifier = None;
        assert!(matches!(
            run(decl),
            Err(ClassificationError::MissingIdentifier { .. })
        ));

        assert!(matches!(
            run(base().identifier("not-a-guid")),
            Err(ClassificationError::InvalidIdentifier { .. })
        ));
    }

    #[test]
    fn test_service_capability_is_forced_singleton() {
        let decl = PluginTypeDecl::service::<Probe>()
            .identifier(ID)
            .lifetime(Lifetime::Transient);
        let c = run(decl).unwrap();
        assert_eq!(c.descriptor.lifetime, Lifetime::Singleton);
    }

    #[test]
    fn test_only_marked_methods_become_commands() {
        let decl = base()
            .method(unit_handler("Echo_Root"))
            .method(MethodDecl::new("helper").invoke(|_| Ok(())))
            .method(unit_handler("ping").named("p"));
        let c = run(decl).unwrap();
        let names: Vec<_> = c.descriptor.commands.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["echoroot", "p"]);
    }

    #[test]
    fn test_duplicate_handler_fails_type() {
        let decl = base().method(unit_handler("echo")).method(unit_handler("echo"));
        assert!(matches!(
            run(decl),
            Err(ClassificationError::DuplicateMethod { .. })
        ));

        let decl = base()
            .method(unit_handler("echo"))
            .method(unit_handler("other").named("echo"));
        assert!(matches!(
            run(decl),
            Err(ClassificationError::DuplicateCommand { .. })
        ));
    }

    #[test]
    fn test_return_shape_precedence() {
        assert_eq!(return_shape(&TypeInfo::of::<()>()), ReturnShape::NoResult);
        assert_eq!(
            return_shape(&TypeInfo::of::<Deferred<()>>()),
            ReturnShape::DeferredUnit
        );
        assert_eq!(
            return_shape(&TypeInfo::of::<Deferred<Response>>()),
            ReturnShape::DeferredResponse
        );
        assert_eq!(return_shape(&TypeInfo::of::<Response>()), ReturnShape::Response);
        assert_eq!(
            return_shape(&TypeInfo::of::<Vec<Response>>()),
            ReturnShape::EagerSequence
        );
        assert_eq!(
            return_shape(&TypeInfo::of::<ResponseStream>()),
            ReturnShape::LazySequence
        );
        assert_eq!(return_shape(&TypeInfo::of::<String>()), ReturnShape::Dynamic);
    }

    #[test]
    fn test_parameter_binding_kinds() {
        let decl = base().method(
            MethodDecl::new("model")
                .command_handler()
                .param(ParamDecl::model::<Profile>("profile"))
                .param(
                    ParamDecl::value::<String>("description")
                        .attr(ParamAttr::Argument(crate::ArgumentAttr {
                            default: Some("no description".into()),
                        })),
                )
                .param(ParamDecl::service::<String>("svc"))
                .param(ParamDecl::value::<u8>("plain"))
                .invoke(|_| Ok(())),
        );
        let c = run(decl).unwrap();
        let params = &c.descriptor.commands[0].parameters;

        let BindingKind::NestedModel { fields } = &params[0].kind else {
            panic!("expected nested model");
        };
        assert_eq!(fields.len(), 2);
        assert_eq!(fields[1].default.as_deref(), Some("14"));
        assert_eq!(params[1].kind, BindingKind::Positional);
        assert_eq!(params[1].default.as_deref(), Some("no description"));
        assert_eq!(params[2].kind, BindingKind::Injected);
        assert_eq!(params[3].kind, BindingKind::Injected);
    }

    #[test]
    fn test_parameter_default_wins_over_attribute_default() {
        let decl = base().method(
            MethodDecl::new("o")
                .command_handler()
                .param(
                    ParamDecl::value::<u8>("n")
                        .attr(ParamAttr::Option(OptionAttr::new("n").default("1")))
                        .default("2"),
                )
                .invoke(|_| Ok(())),
        );
        let c = run(decl).unwrap();
        assert_eq!(c.descriptor.commands[0].parameters[0].default.as_deref(), Some("2"));
    }

    #[test]
    fn test_bad_members_are_isolated() {
        let decl = base()
            .method(unit_handler("good"))
            .method(
                MethodDecl::new("nested")
                    .command_handler()
                    .param(ParamDecl::model::<Nested>("n"))
                    .invoke(|_| Ok(())),
            )
            .method(
                MethodDecl::new("baddefault")
                    .command_handler()
                    .param(ParamDecl::value::<u8>("n").argument().default("many"))
                    .invoke(|_| Ok(())),
            )
            .method(
                MethodDecl::new("twokinds")
                    .command_handler()
                    .param(ParamDecl::value::<u8>("n").argument().option("n"))
                    .invoke(|_| Ok(())),
            )
            .method(MethodDecl::new("noinvoker").command_handler());

        let c = run(decl).unwrap();
        assert_eq!(c.descriptor.commands.len(), 1);
        assert_eq!(c.descriptor.commands[0].name, "good");
        assert_eq!(c.rejected.len(), 4);
        assert!(c.rejected.iter().any(|e| matches!(
            e,
            ClassificationError::Parameter { reason, .. } if reason.contains("nest further")
        )));
        assert!(c
            .rejected
            .iter()
            .any(|e| matches!(e, ClassificationError::MissingInvoker { .. })));
    }

    #[test]
    fn test_duplicate_option_names_rejected() {
        let decl = base().method(
            MethodDecl::new("dup")
                .command_handler()
                .param(ParamDecl::model::<Profile>("profile"))
                .param(ParamDecl::value::<String>("other").option("name"))
                .invoke(|_| Ok(())),
        );
        let c = run(decl).unwrap();
        assert!(c.descriptor.commands.is_empty());
        assert_eq!(c.rejected.len(), 1);
    }

    #[test]
    fn test_normalize_command_name() {
        assert_eq!(normalize_command_name("EchoRoot"), "echoroot");
        assert_eq!(normalize_command_name("echo_root"), "echoroot");
    }
}
