//! What a handler receives when it is invoked.

use std::sync::Arc;

use crate::command::BoundArgs;
use crate::message::{MessageContext, Response};
use crate::plugin::Plugin;
use crate::service::{ServiceArc, ServiceScope};
use crate::waiter::Conversation;

/// One handler invocation: the plugin instance, bound arguments, the
/// message context and the invocation's service scope.
pub struct Invocation {
    instance: ServiceArc,
    args: BoundArgs,
    context: MessageContext,
    conversation: Conversation,
    scope: Arc<ServiceScope>,
}

impl Invocation {
    pub(crate) fn new(
        instance: ServiceArc,
        args: BoundArgs,
        context: MessageContext,
        conversation: Conversation,
        scope: Arc<ServiceScope>,
    ) -> Self {
        Self {
            instance,
            args,
            context,
            conversation,
            scope,
        }
    }

    /// The plugin instance the handler belongs to.
    pub fn plugin<P: Plugin>(&self) -> anyhow::Result<Arc<P>> {
        self.instance.downcast_ref::<Arc<P>>().cloned().ok_or_else(|| {
            anyhow::anyhow!("invocation is not bound to {}", std::any::type_name::<P>())
        })
    }

    /// Takes a bound parameter value by name.
    pub fn take<T: 'static>(&mut self, name: &str) -> anyhow::Result<T> {
        self.args.take(name)
    }

    pub fn args(&mut self) -> &mut BoundArgs {
        &mut self.args
    }

    pub fn context(&self) -> &MessageContext {
        &self.context
    }

    /// Handle for suspending on the next message of this conversation.
    pub fn conversation(&self) -> Conversation {
        self.conversation.clone()
    }

    pub fn services(&self) -> &Arc<ServiceScope> {
        &self.scope
    }

    /// A response quoting the invoking message.
    pub fn reply(&self, text: impl Into<String>) -> Response {
        Response::reply(text, self.context.message.message_id.clone())
    }
}

impl std::fmt::Debug for Invocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Invocation")
            .field("args", &self.args)
            .field("conversation", &self.conversation)
            .finish()
    }
}
