//! Per-command clap parsers.
//!
//! Each classified command gets a [`clap::Command`] built from its parameter
//! descriptors, so the shape of the command decides whether `--loud bob`
//! is a flag followed by an argument or an option with a value.

use clap::error::{ContextKind, ContextValue, ErrorKind};
use clap::{Arg, ArgAction, ArgMatches, Command};

use crate::error::BindingError;
use crate::plugin::descriptor::{BindingKind, ParameterDescriptor};

/// Builds the parser for one command.
pub(crate) fn command_parser(name: &str, params: &[ParameterDescriptor]) -> Command {
    let mut args = Vec::new();
    let mut index = 0;
    collect_args("", params, &mut args, &mut index);

    Command::new(name.to_string())
        .no_binary_name(true)
        .disable_help_flag(true)
        .disable_version_flag(true)
        .args_override_self(true)
        .args(args)
}

/// Identifier of a parameter's clap argument; model fields are
/// `model.field`.
pub(crate) fn arg_id(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}

fn collect_args(prefix: &str, params: &[ParameterDescriptor], args: &mut Vec<Arg>, index: &mut usize) {
    for param in params {
        let id = arg_id(prefix, &param.name);
        let arg = match &param.kind {
            BindingKind::Positional => {
                *index += 1;
                Arg::new(id)
                    .index(*index)
                    .value_name(param.name.clone())
                    .action(ArgAction::Set)
                    .allow_negative_numbers(true)
            }
            BindingKind::NamedOption { name, abbr } => {
                let mut arg = Arg::new(id).long(name.clone());
                if let Some(abbr) = abbr {
                    arg = arg.short(*abbr);
                }
                if param.is_flag() {
                    arg.action(ArgAction::SetTrue)
                } else {
                    arg.value_name(param.ty.short_name().to_string())
                        .action(ArgAction::Set)
                        .allow_negative_numbers(true)
                }
            }
            BindingKind::NestedModel { fields } => {
                collect_args(&id, fields, args, index);
                continue;
            }
            BindingKind::Injected => continue,
        };
        let arg = match &param.description {
            Some(text) => arg.help(text.clone()),
            None => arg,
        };
        args.push(arg);
    }
}

/// Parses the tokens after the command name.
pub(crate) fn parse(parser: &Command, tokens: &[String]) -> Result<ArgMatches, BindingError> {
    parser
        .clone()
        .try_get_matches_from(tokens)
        .map_err(syntax_error)
}

/// The raw text supplied for a parameter, `"true"` for a set flag.
pub(crate) fn supplied<'m>(
    matches: &'m ArgMatches,
    id: &str,
    param: &ParameterDescriptor,
) -> Option<&'m str> {
    if param.is_flag() {
        let set = matches.try_get_one::<bool>(id).ok().flatten().copied();
        set.unwrap_or(false).then_some("true")
    } else {
        matches
            .try_get_one::<String>(id)
            .ok()
            .flatten()
            .map(String::as_str)
    }
}

fn syntax_error(err: clap::Error) -> BindingError {
    let invalid = match err.get(ContextKind::InvalidArg) {
        Some(ContextValue::String(arg)) => Some(arg.clone()),
        _ => None,
    };
    match (err.kind(), invalid) {
        (ErrorKind::UnknownArgument, Some(arg)) if arg.starts_with('-') => {
            BindingError::UnknownOption(arg)
        }
        (ErrorKind::UnknownArgument, Some(arg)) => BindingError::UnexpectedArgument(arg),
        _ => {
            let rendered = err.to_string();
            let first = rendered.lines().next().unwrap_or_default();
            BindingError::Malformed(first.trim_start_matches("error: ").to_string())
        }
    }
}
