//! Watch subscriptions.

use std::pin::Pin;
use std::task::{Context, Poll};

use tokio_stream::{Stream, StreamExt};
use tracing::debug;

use crate::error::Result;

/// A change of one key as seen by the store.
///
/// `prev` is the last value the watcher still had buffered, not necessarily
/// the immediately preceding version. `curr` is `None` when the key was
/// deleted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawWatchEvent {
    pub key: String,
    pub prev: Option<Vec<u8>>,
    pub curr: Option<Vec<u8>>,
}

/// Cancellable stream of watch notifications under one key prefix.
///
/// Successive changes of the same key arrive in order; changes of different
/// keys carry no ordering guarantee. Dropping the stream (or calling
/// [`WatchStream::cancel`]) releases the subscription.
pub struct WatchStream<T> {
    prefix: String,
    inner: Pin<Box<dyn Stream<Item = Result<T>> + Send>>,
}

impl<T> WatchStream<T> {
    pub fn new<S>(prefix: impl Into<String>, stream: S) -> Self
    where
        S: Stream<Item = Result<T>> + Send + 'static,
    {
        Self {
            prefix: prefix.into(),
            inner: Box::pin(stream),
        }
    }

    /// Prefix this subscription observes.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Wait for the next notification. Returns `None` once the subscription
    /// has ended.
    pub async fn recv(&mut self) -> Option<Result<T>> {
        self.next().await
    }

    /// Transform every notification.
    pub fn map<U, F>(self, f: F) -> WatchStream<U>
    where
        T: 'static,
        U: 'static,
        F: FnMut(Result<T>) -> Result<U> + Send + 'static,
    {
        WatchStream {
            prefix: self.prefix,
            inner: Box::pin(self.inner.map(f)),
        }
    }

    /// Stop delivery and release the subscription.
    pub fn cancel(self) {
        debug!(prefix = %self.prefix, "watch cancelled");
    }
}

impl<T> Stream for WatchStream<T> {
    type Item = Result<T>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

impl<T> std::fmt::Debug for WatchStream<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchStream")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}
