//! Command lines and parameter binding.

mod binding;
mod line;
mod parser;

pub(crate) use binding::bind;
pub use binding::BoundArgs;
pub use line::{CommandLine, shell_split};
pub(crate) use parser::command_parser;
