//! Conversation waiters: parking a handler until the next message arrives.
//!
//! At most one waiter is pending per [`ConversationId`]. A waiter resolves
//! exactly once: the matching inbound message and the timeout race by
//! removing the entry from the registry under its lock, and whichever
//! removes it first wins.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::futures::Notified;
use tokio::sync::{Notify, oneshot};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{DispatchError, DispatchResult};
use crate::message::{ConversationId, MessageContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaiterState {
    Pending,
    Resolved,
    TimedOut,
}

struct Entry {
    id: u64,
    created_at: Instant,
    sender: oneshot::Sender<MessageContext>,
}

/// Pending "wait for next message" requests keyed by conversation.
#[derive(Default)]
pub struct WaiterRegistry {
    entries: Mutex<HashMap<ConversationId, Entry>>,
    next_id: AtomicU64,
    registered: Notify,
    resolved: AtomicU64,
    timed_out: AtomicU64,
}

impl WaiterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a waiter for `conversation`.
    ///
    /// A second request while one is pending is rejected with
    /// [`DispatchError::DuplicateWaiter`]; the first stays pending.
    pub fn register(
        self: &Arc<Self>,
        conversation: ConversationId,
        timeout: Duration,
    ) -> DispatchResult<PendingWaiter> {
        let (sender, receiver) = oneshot::channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut entries = self.entries.lock();
            if entries.contains_key(&conversation) {
                return Err(DispatchError::DuplicateWaiter(conversation));
            }
            entries.insert(
                conversation.clone(),
                Entry {
                    id,
                    created_at: Instant::now(),
                    sender,
                },
            );
        }
        self.registered.notify_waiters();
        debug!(conversation = %conversation, ?timeout, "Waiter registered");

        Ok(PendingWaiter {
            registry: Arc::clone(self),
            conversation,
            id,
            timeout,
            receiver: Some(receiver),
            state: WaiterState::Pending,
        })
    }

    /// Hands `context` to the waiter pending on its conversation.
    ///
    /// Gives the message back when no live waiter exists.
    pub fn try_resolve(&self, context: MessageContext) -> Result<(), MessageContext> {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.remove(context.conversation()) else {
            return Err(context);
        };
        // Sent under the lock so a racing timeout finds the value in the channel.
        match entry.sender.send(context) {
            Ok(()) => {
                self.resolved.fetch_add(1, Ordering::Relaxed);
                debug!(
                    waited_ms = entry.created_at.elapsed().as_millis() as u64,
                    "Waiter resolved"
                );
                Ok(())
            }
            Err(context) => Err(context),
        }
    }

    pub fn is_pending(&self, conversation: &ConversationId) -> bool {
        self.entries.lock().contains_key(conversation)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Completes when any waiter is registered after this call.
    pub fn registered(&self) -> Notified<'_> {
        self.registered.notified()
    }

    /// Number of waiters resolved by a message so far.
    pub fn resolved_count(&self) -> u64 {
        self.resolved.load(Ordering::Relaxed)
    }

    /// Number of waiters that timed out so far.
    pub fn timed_out_count(&self) -> u64 {
        self.timed_out.load(Ordering::Relaxed)
    }

    fn remove_if(&self, conversation: &ConversationId, id: u64) -> bool {
        let mut entries = self.entries.lock();
        if entries.get(conversation).is_some_and(|e| e.id == id) {
            entries.remove(conversation);
            true
        } else {
            false
        }
    }
}

impl fmt::Debug for WaiterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaiterRegistry")
            .field("pending", &self.len())
            .finish()
    }
}

/// A registered waiter, owned by the suspended handler.
pub struct PendingWaiter {
    registry: Arc<WaiterRegistry>,
    conversation: ConversationId,
    id: u64,
    timeout: Duration,
    receiver: Option<oneshot::Receiver<MessageContext>>,
    state: WaiterState,
}

impl PendingWaiter {
    pub fn state(&self) -> WaiterState {
        self.state
    }

    pub fn conversation(&self) -> &ConversationId {
        &self.conversation
    }

    /// Waits for the next message of the conversation or the timeout.
    ///
    /// Waiting again after completion yields `ConversationTimeout`.
    pub async fn wait(&mut self) -> DispatchResult<MessageContext> {
        let Some(mut receiver) = self.receiver.take() else {
            return Err(DispatchError::ConversationTimeout(self.timeout));
        };

        match tokio::time::timeout(self.timeout, &mut receiver).await {
            Ok(Ok(context)) => {
                self.state = WaiterState::Resolved;
                Ok(context)
            }
            Ok(Err(_)) => {
                self.state = WaiterState::TimedOut;
                Err(DispatchError::ConversationTimeout(self.timeout))
            }
            Err(_) => {
                if !self.registry.remove_if(&self.conversation, self.id)
                    && let Ok(context) = receiver.try_recv()
                {
                    self.state = WaiterState::Resolved;
                    return Ok(context);
                }
                self.state = WaiterState::TimedOut;
                self.registry.timed_out.fetch_add(1, Ordering::Relaxed);
                warn!(
                    conversation = %self.conversation,
                    timeout_secs = self.timeout.as_secs_f64(),
                    "Conversation waiter timed out"
                );
                Err(DispatchError::ConversationTimeout(self.timeout))
            }
        }
    }
}

impl Drop for PendingWaiter {
    fn drop(&mut self) {
        if self.state == WaiterState::Pending {
            self.registry.remove_if(&self.conversation, self.id);
        }
    }
}

impl fmt::Debug for PendingWaiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingWaiter")
            .field("conversation", &self.conversation)
            .field("timeout", &self.timeout)
            .field("state", &self.state)
            .finish()
    }
}

/// Handle given to handler code for suspending on the next message.
#[derive(Clone)]
pub struct Conversation {
    id: ConversationId,
    waiters: Arc<WaiterRegistry>,
}

impl Conversation {
    pub fn new(id: ConversationId, waiters: Arc<WaiterRegistry>) -> Self {
        Self { id, waiters }
    }

    pub fn id(&self) -> &ConversationId {
        &self.id
    }

    /// Suspends until the next message of this conversation.
    ///
    /// Fails with [`DispatchError::ConversationTimeout`] (inside the
    /// `anyhow::Error`) when nothing arrives in time.
    pub async fn next_message(&self, timeout: Duration) -> anyhow::Result<MessageContext> {
        let mut waiter = self.waiters.register(self.id.clone(), timeout)?;
        Ok(waiter.wait().await?)
    }
}

impl fmt::Debug for Conversation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Conversation").field(&self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::InboundMessage;

    fn conv() -> ConversationId {
        ConversationId::new("group", "alice")
    }

    fn message(text: &str) -> MessageContext {
        MessageContext::public(InboundMessage::new(conv(), text))
    }

    #[tokio::test(start_paused = true)]
    async fn test_message_resolves_waiter() {
        let registry = Arc::new(WaiterRegistry::new());
        let mut waiter = registry.register(conv(), Duration::from_secs(5)).unwrap();

        let r = Arc::clone(&registry);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            assert!(r.try_resolve(message("reply")).is_ok());
        });

        let ctx = waiter.wait().await.unwrap();
        assert_eq!(ctx.text(), "reply");
        assert_eq!(waiter.state(), WaiterState::Resolved);
        assert_eq!(registry.resolved_count(), 1);
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_then_late_message_is_not_consumed() {
        let registry = Arc::new(WaiterRegistry::new());
        let mut waiter = registry.register(conv(), Duration::from_secs(5)).unwrap();

        let err = waiter.wait().await.unwrap_err();
        assert_eq!(err, DispatchError::ConversationTimeout(Duration::from_secs(5)));
        assert_eq!(waiter.state(), WaiterState::TimedOut);
        assert_eq!(registry.timed_out_count(), 1);

        let late = registry.try_resolve(message("late")).unwrap_err();
        assert_eq!(late.text(), "late");
        assert_eq!(registry.resolved_count(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_waiter_keeps_first() {
        let registry = Arc::new(WaiterRegistry::new());
        let _first = registry.register(conv(), Duration::from_secs(5)).unwrap();
        let err = registry.register(conv(), Duration::from_secs(5)).unwrap_err();
        assert_eq!(err, DispatchError::DuplicateWaiter(conv()));
        assert!(registry.is_pending(&conv()));
    }

    #[tokio::test]
    async fn test_partial_identity_does_not_match() {
        let registry = Arc::new(WaiterRegistry::new());
        let _w = registry.register(conv(), Duration::from_secs(5)).unwrap();
        let other = MessageContext::public(InboundMessage::new(
            conv().with_sub_channel("thread"),
            "x",
        ));
        assert!(registry.try_resolve(other).is_err());
        assert!(registry.is_pending(&conv()));
    }

    #[tokio::test]
    async fn test_dropped_waiter_is_removed() {
        let registry = Arc::new(WaiterRegistry::new());
        drop(registry.register(conv(), Duration::from_secs(5)).unwrap());
        assert!(!registry.is_pending(&conv()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_conversation_timeout_downcasts() {
        let registry = Arc::new(WaiterRegistry::new());
        let conversation = Conversation::new(conv(), registry);
        let err = conversation
            .next_message(Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DispatchError>(),
            Some(DispatchError::ConversationTimeout(_))
        ));
    }
}
