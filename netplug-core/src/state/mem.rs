//! In-memory state driver.
//!
//! Backs tests and single-process deployments. Every mutation publishes its
//! change event while still holding the write lock, so the order in which a
//! watcher sees changes of one key is the order in which they were stored.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::{RwLock, broadcast};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::{debug, info, warn};

use super::watch::{RawWatchEvent, WatchStream};
use super::StateDriver;
use crate::config::{DEFAULT_WATCH_BUFFER, StateConfig};
use crate::error::{Result, StateError};

/// State driver keeping all keys in process memory.
pub struct MemStateDriver {
    inner: RwLock<Inner>,
}

struct Inner {
    entries: BTreeMap<String, Vec<u8>>,
    /// `None` once the driver has been closed.
    events: Option<broadcast::Sender<RawWatchEvent>>,
    watch_buffer: usize,
}

impl Inner {
    fn sender(&self) -> Result<&broadcast::Sender<RawWatchEvent>> {
        self.events
            .as_ref()
            .ok_or_else(|| StateError::StoreUnavailable("in-memory state driver is closed".into()))
    }
}

impl MemStateDriver {
    /// Create an open driver with the default watch buffer.
    pub fn new() -> Self {
        Self::with_watch_buffer(DEFAULT_WATCH_BUFFER)
    }

    /// Create an open driver buffering up to `watch_buffer` change events
    /// per watcher.
    pub fn with_watch_buffer(watch_buffer: usize) -> Self {
        let watch_buffer = watch_buffer.max(1);
        let (events, _) = broadcast::channel(watch_buffer);
        Self {
            inner: RwLock::new(Inner {
                entries: BTreeMap::new(),
                events: Some(events),
                watch_buffer,
            }),
        }
    }

    /// Number of keys currently stored.
    pub async fn len(&self) -> usize {
        self.inner.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for MemStateDriver {
    fn default() -> Self {
        Self::new()
    }
}

fn check_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(StateError::InvalidKey(key.to_string()));
    }
    Ok(())
}

#[async_trait]
impl StateDriver for MemStateDriver {
    async fn init(&self, config: &StateConfig) -> Result<()> {
        let mut inner = self.inner.write().await;
        let watch_buffer = config.watch_buffer.max(1);

        let reuse = match &inner.events {
            Some(_) => inner.watch_buffer == watch_buffer,
            None => false,
        };
        if !reuse {
            if let Some(events) = &inner.events
                && events.receiver_count() > 0
            {
                warn!(
                    watchers = events.receiver_count(),
                    "Resizing watch buffer ends open watches"
                );
            }
            let (events, _) = broadcast::channel(watch_buffer);
            inner.events = Some(events);
            inner.watch_buffer = watch_buffer;
        }

        info!(
            keys = inner.entries.len(),
            watch_buffer, "In-memory state driver initialized"
        );
        Ok(())
    }

    async fn deinit(&self) {
        let mut inner = self.inner.write().await;
        if inner.events.take().is_some() {
            info!("In-memory state driver closed");
        }
    }

    async fn write(&self, key: &str, value: Vec<u8>) -> Result<()> {
        check_key(key)?;
        let mut inner = self.inner.write().await;
        let events = inner.sender()?.clone();

        let prev = inner.entries.insert(key.to_string(), value.clone());
        let _ = events.send(RawWatchEvent {
            key: key.to_string(),
            prev,
            curr: Some(value),
        });
        Ok(())
    }

    async fn read(&self, key: &str) -> Result<Vec<u8>> {
        let inner = self.inner.read().await;
        inner.sender()?;
        inner
            .entries
            .get(key)
            .cloned()
            .ok_or_else(|| StateError::NotFound(key.to_string()))
    }

    async fn read_all(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let inner = self.inner.read().await;
        inner.sender()?;
        Ok(inner
            .entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    async fn watch_all(&self, prefix: &str) -> Result<WatchStream<RawWatchEvent>> {
        let inner = self.inner.read().await;
        let rx = inner.sender()?.subscribe();
        debug!(prefix, "watch started");

        let filter = prefix.to_string();
        let stream = BroadcastStream::new(rx).filter_map(move |item| match item {
            Ok(event) if event.key.starts_with(&filter) => Some(Ok(event)),
            Ok(_) => None,
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                warn!(prefix = %filter, skipped, "watcher lagged, events dropped");
                Some(Err(StateError::WatchLagged {
                    prefix: filter.clone(),
                    skipped,
                }))
            }
        });

        Ok(WatchStream::new(prefix, stream))
    }

    async fn clear(&self, key: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        let events = inner.sender()?.clone();

        match inner.entries.remove(key) {
            Some(prev) => {
                let _ = events.send(RawWatchEvent {
                    key: key.to_string(),
                    prev: Some(prev),
                    curr: None,
                });
                Ok(())
            }
            None => Err(StateError::NotFound(key.to_string())),
        }
    }

    async fn compare_and_clear(&self, key: &str, expected: &[u8]) -> Result<()> {
        check_key(key)?;
        let mut inner = self.inner.write().await;
        let events = inner.sender()?.clone();

        match inner.entries.get(key) {
            None => return Err(StateError::NotFound(key.to_string())),
            Some(current) if current.as_slice() != expected => {
                return Err(StateError::Conflict(key.to_string()));
            }
            Some(_) => {}
        }

        let prev = inner.entries.remove(key);
        let _ = events.send(RawWatchEvent {
            key: key.to_string(),
            prev,
            curr: None,
        });
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        value: Vec<u8>,
    ) -> Result<()> {
        check_key(key)?;
        let mut inner = self.inner.write().await;
        let events = inner.sender()?.clone();

        if inner.entries.get(key).map(Vec::as_slice) != expected {
            return Err(StateError::Conflict(key.to_string()));
        }

        let prev = inner.entries.insert(key.to_string(), value.clone());
        let _ = events.send(RawWatchEvent {
            key: key.to_string(),
            prev,
            curr: Some(value),
        });
        Ok(())
    }
}
