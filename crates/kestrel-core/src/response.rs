//! Lazy response sequences.
//!
//! A [`ResponseStream`] wraps a producer future that emits values through a
//! [`Yielder`]. The producer is not spawned: it only runs while the consumer
//! polls the stream, and every `reply(..).await` parks it until the value has
//! been pulled. Awaiting anything else inside the producer (such as the next
//! message of the conversation) suspends the sequence without holding a
//! worker thread.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use futures::future::BoxFuture;
use parking_lot::Mutex;

use crate::message::Response;

type Slot = Arc<Mutex<VecDeque<Response>>>;

/// Emits values into a [`ResponseStream`].
#[derive(Clone)]
pub struct Yielder {
    slot: Slot,
}

impl Yielder {
    /// Hands one value to the consumer and waits until it is pulled.
    pub fn reply(&self, response: impl Into<Response>) -> YieldNow {
        self.slot.lock().push_back(response.into());
        YieldNow { yielded: false }
    }
}

impl fmt::Debug for Yielder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Yielder")
            .field("queued", &self.slot.lock().len())
            .finish()
    }
}

/// Returned by [`Yielder::reply`]; pending exactly once.
#[must_use = "the value is only handed over when this is awaited"]
pub struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            Poll::Ready(())
        } else {
            self.yielded = true;
            cx.waker().wake_by_ref();
            Poll::Pending
        }
    }
}

/// A lazily produced sequence of responses.
pub struct ResponseStream {
    slot: Slot,
    producer: Option<BoxFuture<'static, anyhow::Result<()>>>,
    failure: Option<anyhow::Error>,
}

impl ResponseStream {
    /// Creates a stream driven by `producer`.
    ///
    /// ```rust,ignore
    /// ResponseStream::new(|y| async move {
    ///     y.reply("first").await;
    ///     y.reply("second").await;
    ///     Ok(())
    /// })
    /// ```
    pub fn new<F, Fut>(producer: F) -> Self
    where
        F: FnOnce(Yielder) -> Fut,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let slot: Slot = Arc::default();
        let fut = producer(Yielder {
            slot: Arc::clone(&slot),
        });
        Self {
            slot,
            producer: Some(Box::pin(fut)),
            failure: None,
        }
    }

    /// A stream with nothing to produce.
    pub fn empty() -> Self {
        Self {
            slot: Arc::default(),
            producer: None,
            failure: None,
        }
    }

    /// A stream over already produced values.
    pub fn from_responses(responses: impl IntoIterator<Item = Response>) -> Self {
        Self {
            slot: Arc::new(Mutex::new(responses.into_iter().collect())),
            producer: None,
            failure: None,
        }
    }

    fn pop(&self) -> Option<Response> {
        self.slot.lock().pop_front()
    }
}

impl Stream for ResponseStream {
    type Item = anyhow::Result<Response>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if let Some(response) = this.pop() {
            return Poll::Ready(Some(Ok(response)));
        }

        let Some(producer) = this.producer.as_mut() else {
            return Poll::Ready(this.failure.take().map(Err));
        };

        match producer.as_mut().poll(cx) {
            Poll::Ready(result) => {
                this.producer = None;
                if let Err(e) = result {
                    this.failure = Some(e);
                }
                match this.pop() {
                    Some(response) => Poll::Ready(Some(Ok(response))),
                    None => Poll::Ready(this.failure.take().map(Err)),
                }
            }
            Poll::Pending => match this.pop() {
                Some(response) => Poll::Ready(Some(Ok(response))),
                None => Poll::Pending,
            },
        }
    }
}

impl fmt::Debug for ResponseStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseStream")
            .field("queued", &self.slot.lock().len())
            .field("finished", &self.producer.is_none())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures::StreamExt;

    use super::*;

    #[tokio::test]
    async fn test_values_are_produced_lazily() {
        let produced = Arc::new(AtomicUsize::new(0));
        let p = Arc::clone(&produced);
        let mut stream = ResponseStream::new(move |y| async move {
            for i in 0..3 {
                p.fetch_add(1, Ordering::SeqCst);
                y.reply(format!("value {i}")).await;
            }
            Ok(())
        });

        assert_eq!(produced.load(Ordering::SeqCst), 0);
        assert_eq!(stream.next().await.unwrap().unwrap().text, "value 0");
        assert_eq!(produced.load(Ordering::SeqCst), 1);
        assert_eq!(stream.next().await.unwrap().unwrap().text, "value 1");
        assert_eq!(produced.load(Ordering::SeqCst), 2);
        assert_eq!(stream.next().await.unwrap().unwrap().text, "value 2");
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_failure_follows_emitted_values() {
        let mut stream = ResponseStream::new(|y| async move {
            y.reply("partial").await;
            anyhow::bail!("boom")
        });
        assert_eq!(stream.next().await.unwrap().unwrap().text, "partial");
        let err = stream.next().await.unwrap().unwrap_err();
        assert_eq!(err.to_string(), "boom");
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_unawaited_reply_is_still_delivered() {
        let mut stream = ResponseStream::new(|y| async move {
            let _ = y.reply("a");
            let _ = y.reply("b");
            Ok(())
        });
        let all: Vec<_> = (&mut stream).map(|r| r.unwrap().text).collect().await;
        assert_eq!(all, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_from_responses() {
        let stream = ResponseStream::from_responses(vec![Response::text("x"), Response::text("y")]);
        let all: Vec<_> = stream.map(|r| r.unwrap().text).collect().await;
        assert_eq!(all, vec!["x", "y"]);
    }
}
