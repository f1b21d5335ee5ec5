//! The outbound side of a chat-platform connector.

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::message::{ConversationId, Response};

/// An opaque handler result, forwarded to the transport for interpretation.
pub type DynamicValue = Box<dyn Any + Send>;

/// Errors reported by a transport when sending fails.
///
/// The core logs these and never retries.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("transport is not connected")]
    NotConnected,

    #[error("failed to send to {conversation}: {reason}")]
    SendFailed { conversation: String, reason: String },

    #[error("unsupported dynamic value: {0}")]
    Unsupported(String),
}

/// Sends response values to a conversation.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Delivers one response to the conversation.
    async fn send(&self, conversation: &ConversationId, response: &Response)
    -> Result<(), TransportError>;

    /// Interprets a handler result that is not a known response shape.
    ///
    /// The default implementation rejects the value.
    async fn forward_dynamic(
        &self,
        conversation: &ConversationId,
        value: DynamicValue,
    ) -> Result<(), TransportError> {
        let _ = (conversation, value);
        Err(TransportError::Unsupported(
            "this transport does not interpret dynamic values".into(),
        ))
    }
}

/// Shared, type-erased transport handle.
pub type BoxedTransport = Arc<dyn Transport>;
