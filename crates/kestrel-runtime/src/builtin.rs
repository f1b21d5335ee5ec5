//! Built-in host artifacts.

use std::fmt::Write;
use std::sync::Arc;

use kestrel_core::linkme::distributed_slice;
use kestrel_core::prelude::*;
use kestrel_core::{BindingKind, CommandTable, HOST_ARTIFACTS, ParameterDescriptor};

/// Name of the artifact carrying [`HelpPlugin`].
pub const HELP_ARTIFACT: &str = "kestrel-help";

#[distributed_slice(HOST_ARTIFACTS)]
#[linkme(crate = kestrel_core::linkme)]
fn help_artifact() -> Artifact {
    Artifact::new(HELP_ARTIFACT, env!("CARGO_PKG_VERSION")).plugin::<HelpPlugin>()
}

/// `help [command]`: lists the commands the caller may run, or explains one.
pub struct HelpPlugin {
    commands: Arc<CommandTable>,
}

impl Plugin for HelpPlugin {
    fn describe() -> PluginTypeDecl {
        PluginTypeDecl::service::<Self>()
            .identifier("0b6c1f0e-3f59-4a52-9a0c-5b2f4c0d7e11")
            .index(i32::MIN)
            .name("Help")
            .description("Lists available commands.")
            .version(env!("CARGO_PKG_VERSION"))
            .author("kestrel")
            .method(
                MethodDecl::new("help")
                    .command_handler()
                    .description("Show commands, or the parameters of one command.")
                    .param(
                        ParamDecl::value::<String>("command")
                            .argument()
                            .default("")
                            .describe("Command to explain"),
                    )
                    .invoke(|mut inv| {
                        let help = inv.plugin::<HelpPlugin>()?;
                        let command: String = inv.take("command")?;
                        let text = if command.is_empty() {
                            help.overview(inv.context().authority)
                        } else {
                            help.explain(&command)
                        };
                        Ok(inv.reply(text))
                    }),
            )
    }

    fn construct(services: &ServiceScope) -> anyhow::Result<Self> {
        Ok(Self {
            commands: services.resolve::<CommandTable>()?,
        })
    }
}

impl HelpPlugin {
    fn overview(&self, authority: Authority) -> String {
        let mut out = String::from("Available commands:");
        for summary in self.commands.summaries() {
            if summary.authority > authority {
                continue;
            }
            let _ = write!(out, "\n  {}", summary.usage);
            if let Some(description) = &summary.description {
                let _ = write!(out, " - {description}");
            }
        }
        out
    }

    fn explain(&self, name: &str) -> String {
        let Some(command) = self.commands.get(name) else {
            return format!("Unknown command: {name}");
        };

        let mut out = format!("Usage: {}", command.usage());
        if let Some(description) = &command.description {
            let _ = write!(out, "\n{description}");
        }
        if command.authority > Authority::Public {
            let _ = write!(out, "\nRequires {} authority.", command.authority);
        }
        describe_parameters(&mut out, &command.parameters);
        out
    }
}

fn describe_parameters(out: &mut String, parameters: &[ParameterDescriptor]) {
    for p in parameters {
        let label = match &p.kind {
            BindingKind::Injected => continue,
            BindingKind::NestedModel { fields } => {
                describe_parameters(out, fields);
                continue;
            }
            BindingKind::Positional => format!("<{}>", p.name),
            BindingKind::NamedOption { name, abbr: Some(a) } => format!("-{a}, --{name}"),
            BindingKind::NamedOption { name, abbr: None } => format!("--{name}"),
        };
        let _ = write!(out, "\n  {label}");
        if let Some(description) = &p.description {
            let _ = write!(out, "  {description}");
        }
        if let Some(default) = p.default.as_deref().filter(|d| !d.is_empty()) {
            let _ = write!(out, " (default: {default})");
        }
    }
}
