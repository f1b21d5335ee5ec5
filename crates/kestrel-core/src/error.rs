//! Error types for the Kestrel core.
//!
//! Load-time failures ([`LoadError`], [`ClassificationError`],
//! [`RegistryError`]) are recovered at the smallest possible granularity and
//! reported through logs. Dispatch-time failures ([`DispatchError`]) are
//! turned into a user-visible failure response by the dispatcher.

use std::time::Duration;

use thiserror::Error;

use crate::message::{Authority, ConversationId};

/// A plugin type, method or parameter declaration that cannot be classified.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClassificationError {
    /// A non-service plugin did not declare its lifetime.
    #[error("the plugin lifetime is undefined: {type_name}")]
    MissingLifetime { type_name: String },

    /// The plugin did not declare an identifier.
    #[error("the plugin identifier is undefined: {type_name}")]
    MissingIdentifier { type_name: String },

    /// The declared identifier is not a 128-bit id.
    #[error("invalid plugin identifier '{id}' on {type_name}: {reason}")]
    InvalidIdentifier {
        type_name: String,
        id: String,
        reason: String,
    },

    /// Two methods with the same name were declared.
    #[error("duplicate method '{method}' with command handler definition on {type_name}")]
    DuplicateMethod { type_name: String, method: String },

    /// Two handlers resolve to the same command name.
    #[error("duplicate command '{command}' on {type_name}")]
    DuplicateCommand { type_name: String, command: String },

    /// A method is marked as command handler but has no invoker.
    #[error("command handler {type_name}::{method} has no invoker")]
    MissingInvoker { type_name: String, method: String },

    /// A parameter declaration is malformed.
    #[error("parameter '{parameter}' of {type_name}::{method}: {reason}")]
    Parameter {
        type_name: String,
        method: String,
        parameter: String,
        reason: String,
    },
}

/// Errors raised by a container's service registry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// The type already has a registration in this container.
    #[error("service '{0}' is already registered")]
    AlreadyRegistered(String),

    /// The type is an inherited host singleton.
    #[error("service '{0}' is inherited from the host container and is read-only")]
    ReadOnly(String),

    /// The type was never registered.
    #[error("service '{0}' is not registered")]
    NotRegistered(String),

    /// Resolving the type requires itself.
    #[error("cyclic dependency while resolving '{0}'")]
    Cycle(String),

    /// The factory failed.
    #[error("failed to construct '{name}': {reason}")]
    Construction { name: String, reason: String },

    /// The stored value does not have the requested type.
    #[error("service '{0}' has an unexpected stored type")]
    TypeMismatch(String),

    /// The owning container has been unloaded.
    #[error("container '{0}' has been unloaded")]
    Unloaded(String),
}

/// Errors raised while loading or unloading a module container.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError {
    /// No artifact with this name is known to the catalog.
    #[error("unknown artifact '{0}'")]
    UnknownArtifact(String),

    /// An artifact manifest could not be read.
    #[error("invalid artifact manifest '{path}': {reason}")]
    Manifest { path: String, reason: String },

    /// A container with this name is already loaded.
    #[error("container '{0}' is already loaded")]
    ContainerExists(String),

    /// No container with this name is loaded.
    #[error("container '{0}' is not loaded")]
    ContainerNotFound(String),

    /// Every plugin type of the container failed classification.
    #[error("container '{0}' has no usable plugin types")]
    NoUsablePlugins(String),

    /// The host container is permanent.
    #[error("the host container cannot be unloaded")]
    HostContainer,

    /// Registering a service or plugin type failed.
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// A failure while binding a command line to handler parameters.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BindingError {
    /// A required parameter has no token and no default.
    #[error("missing required parameter '{0}'")]
    MissingValue(String),

    /// A token could not be converted to the declared type.
    #[error("cannot convert '{value}' for parameter '{parameter}': {reason}")]
    Conversion {
        parameter: String,
        value: String,
        reason: String,
    },

    /// An injected service could not be resolved.
    #[error("cannot resolve '{type_name}' for parameter '{parameter}': {reason}")]
    Service {
        parameter: String,
        type_name: String,
        reason: String,
    },

    /// A nested model could not be assembled from its bound fields.
    #[error("cannot build model for parameter '{parameter}': {reason}")]
    Model { parameter: String, reason: String },

    /// More positional tokens than declared arguments.
    #[error("unexpected argument '{0}'")]
    UnexpectedArgument(String),

    /// An option that no parameter declares.
    #[error("unknown option '{0}'")]
    UnknownOption(String),

    /// Any other command-line syntax problem, such as an option missing its
    /// value.
    #[error("malformed command line: {0}")]
    Malformed(String),
}

/// Errors surfaced while dispatching one inbound message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    /// No active container declares this command.
    #[error("command not found: {0}")]
    CommandNotFound(String),

    /// Parameter binding failed; the handler was not invoked.
    #[error(transparent)]
    Binding(#[from] BindingError),

    /// The invoking context lacks the required authority.
    #[error("'{command}' requires {required} authority (caller has {actual})")]
    AuthorityDenied {
        command: String,
        required: Authority,
        actual: Authority,
    },

    /// No matching message arrived before the waiter timed out.
    #[error("timed out after {0:?} waiting for the next message")]
    ConversationTimeout(Duration),

    /// A second suspend request for a conversation that already waits.
    #[error("a waiter is already pending for conversation {0}")]
    DuplicateWaiter(ConversationId),

    /// Handler code failed or panicked.
    #[error("{plugin}::{command} failed: {reason}")]
    Handler {
        plugin: String,
        command: String,
        reason: String,
    },
}

impl DispatchError {
    /// The text sent back to the conversation when this error ends a dispatch.
    pub fn user_message(&self) -> String {
        match self {
            Self::CommandNotFound(name) => format!("Unknown command: {name}"),
            Self::Binding(err) => format!("Invalid arguments: {err}"),
            Self::AuthorityDenied { required, .. } => {
                format!("Permission denied: {required} authority is required.")
            }
            Self::ConversationTimeout(_) => "Timed out waiting for your reply.".to_string(),
            Self::DuplicateWaiter(_) | Self::Handler { .. } => {
                "An error occurred while executing the command.".to_string()
            }
        }
    }
}

/// Result type for dispatch operations.
pub type DispatchResult<T> = Result<T, DispatchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_message_hides_handler_details() {
        let err = DispatchError::Handler {
            plugin: "demo".into(),
            command: "boom".into(),
            reason: "index out of bounds".into(),
        };
        assert!(!err.user_message().contains("index"));
        assert!(err.to_string().contains("index out of bounds"));
    }

    #[test]
    fn test_binding_error_is_transparent() {
        let err = DispatchError::from(BindingError::MissingValue("content".into()));
        assert_eq!(err.to_string(), "missing required parameter 'content'");
    }
}
