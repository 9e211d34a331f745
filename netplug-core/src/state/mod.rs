//! Distributed state abstraction.
//!
//! # Architecture
//!
//! ```text
//! drivers → StateAccess<S>                 // typed entities, JSON codec, key layout
//!                 ↓
//!           Arc<dyn StateDriver>           // bytes under hierarchical string keys
//!                 ↓
//!           MemStateDriver | etcd | ...    // backend
//! ```
//!
//! Drivers only know about entities; the backend only knows about keys and
//! bytes. Entities are plain data: they reach the store through the
//! `StateAccess` handle their owner was constructed with, never through
//! ambient state.

mod access;
pub mod keys;
mod mem;
mod watch;

use async_trait::async_trait;

use crate::config::StateConfig;
use crate::error::Result;

pub use access::{State, StateAccess, WatchState};
pub use mem::MemStateDriver;
pub use watch::{RawWatchEvent, WatchStream};

/// Byte-level contract of the state store.
///
/// All operations are point-in-time calls except `watch_all`, which returns
/// a long-lived subscription. Implementations never retry internally; the
/// error kind tells the caller whether a retry makes sense.
#[async_trait]
pub trait StateDriver: Send + Sync {
    /// Connect to (or open) the backing store.
    async fn init(&self, config: &StateConfig) -> Result<()>;

    /// Close the store. Open watches end and later calls fail with
    /// `StoreUnavailable`.
    async fn deinit(&self);

    /// Store `value` under `key`, replacing any previous value.
    async fn write(&self, key: &str, value: Vec<u8>) -> Result<()>;

    /// Fetch the value under `key`.
    async fn read(&self, key: &str) -> Result<Vec<u8>>;

    /// Enumerate all `(key, value)` pairs under `prefix`, ordered by key.
    async fn read_all(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>>;

    /// Subscribe to changes of any key under `prefix`.
    async fn watch_all(&self, prefix: &str) -> Result<WatchStream<RawWatchEvent>>;

    /// Delete `key`. Fails with `NotFound` if absent.
    async fn clear(&self, key: &str) -> Result<()>;

    /// Replace the value under `key` only if it currently equals `expected`
    /// (`None` meaning absent). Fails with `Conflict` otherwise.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        value: Vec<u8>,
    ) -> Result<()>;

    /// Delete `key` only if it currently holds `expected`. Fails with
    /// `NotFound` if absent and `Conflict` if the value differs.
    async fn compare_and_clear(&self, key: &str, expected: &[u8]) -> Result<()>;
}
