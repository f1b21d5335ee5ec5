//! Tokenizing message text into a command line.
//!
//! Tokens are only split here; options and flags are resolved against the
//! command's own parser during binding.

/// A tokenized command: its name and the shell-split tokens after it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandLine {
    pub command: String,
    pub tokens: Vec<String>,
}

impl CommandLine {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, value: impl Into<String>) -> Self {
        self.tokens.push(value.into());
        self
    }

    /// Appends `--name value`.
    pub fn option(mut self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.tokens.push(format!("--{}", name.as_ref()));
        self.tokens.push(value.into());
        self
    }

    /// Appends `--name`.
    pub fn flag(mut self, name: impl AsRef<str>) -> Self {
        self.tokens.push(format!("--{}", name.as_ref()));
        self
    }

    /// Parses `text` as a command if it starts with `prefix`.
    ///
    /// Returns `None` for ordinary messages and for a bare prefix.
    pub fn parse(text: &str, prefix: &str) -> Option<Self> {
        let rest = text.trim_start().strip_prefix(prefix)?;
        let mut tokens = shell_split(rest).into_iter();
        let command = tokens.next()?;
        Some(Self {
            command,
            tokens: tokens.collect(),
        })
    }
}

/// Splits a string into arguments following basic shell quoting rules.
///
/// Whitespace separates arguments; single and double quotes group; a
/// backslash inside double quotes escapes the next character.
pub fn shell_split(input: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut in_single = false;
    let mut in_double = false;
    let mut escaped = false;

    for ch in input.chars() {
        if escaped {
            current.push(ch);
            escaped = false;
            continue;
        }

        match ch {
            '\\' if in_double => escaped = true,
            '\'' if !in_double => {
                in_single = !in_single;
                quoted = true;
            }
            '"' if !in_single => {
                in_double = !in_double;
                quoted = true;
            }
            c if c.is_whitespace() && !in_single && !in_double => {
                if !current.is_empty() || quoted {
                    args.push(std::mem::take(&mut current));
                }
                quoted = false;
            }
            _ => current.push(ch),
        }
    }

    if !current.is_empty() || quoted {
        args.push(current);
    }

    args
}
