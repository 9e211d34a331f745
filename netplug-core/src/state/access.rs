//! Typed access to state entities.

use std::marker::PhantomData;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;

use super::keys;
use super::watch::{RawWatchEvent, WatchStream};
use super::StateDriver;
use crate::error::{Result, StateError};

/// A record stored in the state store.
///
/// An entity kind is declared by its key prefix and its fields; all I/O goes
/// through [`StateAccess`].
pub trait State: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Prefix under which all entities of this kind live.
    const PREFIX: &'static str;

    /// Identifier, unique within the prefix.
    fn id(&self) -> &str;
}

/// One observed change of an entity.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchState<S> {
    /// Id of the changed entity.
    pub id: String,
    /// Last previous value the watcher had; `None` if the entity was created.
    pub prev: Option<S>,
    /// Latest value; `None` if the entity was deleted.
    pub curr: Option<S>,
}

impl<S> WatchState<S> {
    pub fn is_delete(&self) -> bool {
        self.curr.is_none()
    }
}

/// Typed handle reading and writing one entity kind under one prefix.
///
/// Values are encoded as JSON. The handle is cheap to clone; all clones share
/// the same state driver.
pub struct StateAccess<S> {
    driver: Arc<dyn StateDriver>,
    prefix: String,
    _entity: PhantomData<fn() -> S>,
}

impl<S> Clone for StateAccess<S> {
    fn clone(&self) -> Self {
        Self {
            driver: Arc::clone(&self.driver),
            prefix: self.prefix.clone(),
            _entity: PhantomData,
        }
    }
}

impl<S: State> StateAccess<S> {
    /// Access entities under their kind's default prefix.
    pub fn new(driver: Arc<dyn StateDriver>) -> Self {
        Self::with_prefix(driver, S::PREFIX)
    }

    /// Access entities under an explicit prefix.
    pub fn with_prefix(driver: Arc<dyn StateDriver>, prefix: impl Into<String>) -> Self {
        Self {
            driver,
            prefix: prefix.into(),
            _entity: PhantomData,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn driver(&self) -> &Arc<dyn StateDriver> {
        &self.driver
    }

    /// Full key of entity `id`.
    pub fn key(&self, id: &str) -> Result<String> {
        keys::entity_key(&self.prefix, id)
    }

    /// Store `entity` under its id, replacing any previous value.
    pub async fn write(&self, entity: &S) -> Result<()> {
        let key = self.key(entity.id())?;
        let bytes = encode(&key, entity)?;
        self.driver.write(&key, bytes).await
    }

    /// Store `entity` only if no entity with its id exists yet.
    ///
    /// Fails with `Conflict` if the id is taken.
    pub async fn create(&self, entity: &S) -> Result<()> {
        let key = self.key(entity.id())?;
        let bytes = encode(&key, entity)?;
        self.driver.compare_and_swap(&key, None, bytes).await
    }

    /// Fetch entity `id`.
    pub async fn read(&self, id: &str) -> Result<S> {
        let key = self.key(id)?;
        let bytes = self.driver.read(&key).await?;
        decode(&key, &bytes)
    }

    /// Fetch entity `id`, mapping absence to `None`.
    pub async fn try_read(&self, id: &str) -> Result<Option<S>> {
        match self.read(id).await {
            Ok(entity) => Ok(Some(entity)),
            Err(StateError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Fetch all entities under the prefix.
    ///
    /// The outer error reports store failures. Entries that fail to decode
    /// are returned as per-entry errors so one corrupt record does not hide
    /// the others.
    pub async fn read_all(&self) -> Result<Vec<Result<S>>> {
        let entries = self.driver.read_all(&self.prefix).await?;
        Ok(entries
            .into_iter()
            .map(|(key, bytes)| decode(&key, &bytes))
            .collect())
    }

    /// Subscribe to changes of any entity under the prefix.
    pub async fn watch_all(&self) -> Result<WatchStream<WatchState<S>>> {
        let prefix = self.prefix.clone();
        let raw = self.driver.watch_all(&self.prefix).await?;
        Ok(raw.map(move |event| event.and_then(|event| decode_event(&prefix, event))))
    }

    /// Delete entity `id`.
    pub async fn clear(&self, id: &str) -> Result<()> {
        let key = self.key(id)?;
        self.driver.clear(&key).await
    }

    /// Delete entity `id` if `check` accepts its current value.
    ///
    /// Returns the removed entity, or `None` if it was already absent. Only
    /// one of several concurrent callers gets the entity back; if it changed
    /// between read and delete the call fails with `Conflict`.
    pub async fn remove_if<E, F>(&self, id: &str, check: F) -> std::result::Result<Option<S>, E>
    where
        E: From<StateError>,
        F: FnOnce(&S) -> std::result::Result<(), E>,
    {
        let key = self.key(id)?;
        let current = match self.driver.read(&key).await {
            Ok(bytes) => bytes,
            Err(StateError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let entity: S = decode(&key, &current)?;
        check(&entity)?;

        match self.driver.compare_and_clear(&key, &current).await {
            Ok(()) => Ok(Some(entity)),
            Err(StateError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete entity `id`, returning it if this call removed it.
    pub async fn remove(&self, id: &str) -> Result<Option<S>> {
        self.remove_if(id, |_| Ok::<(), StateError>(())).await
    }

    /// Atomically read, modify and write back entity `id`.
    ///
    /// `f` mutates the entity in place and may fail with a domain error, in
    /// which case nothing is written. If the entity changed between read and
    /// write the update fails with `Conflict`; it is never retried here.
    pub async fn update<T, E, F>(&self, id: &str, f: F) -> std::result::Result<(S, T), E>
    where
        E: From<StateError>,
        F: FnOnce(&mut S) -> std::result::Result<T, E>,
    {
        let key = self.key(id)?;
        let current = self.driver.read(&key).await?;
        let mut entity: S = decode(&key, &current)?;

        let output = f(&mut entity)?;

        if entity.id() != id {
            return Err(StateError::InvalidKey(entity.id().to_string()).into());
        }
        let bytes = encode(&key, &entity)?;
        self.driver
            .compare_and_swap(&key, Some(current.as_slice()), bytes)
            .await?;
        Ok((entity, output))
    }
}

fn encode<S: Serialize>(key: &str, entity: &S) -> Result<Vec<u8>> {
    serde_json::to_vec(entity).map_err(|e| StateError::Encode {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

fn decode<S: DeserializeOwned>(key: &str, bytes: &[u8]) -> Result<S> {
    serde_json::from_slice(bytes).map_err(|e| StateError::Decode {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

fn decode_event<S: State>(prefix: &str, event: RawWatchEvent) -> Result<WatchState<S>> {
    let id = keys::id_from_key(prefix, &event.key)
        .ok_or_else(|| StateError::InvalidKey(event.key.clone()))?
        .to_string();
    let prev = event
        .prev
        .as_deref()
        .map(|bytes| decode(&event.key, bytes))
        .transpose()?;
    let curr = event
        .curr
        .as_deref()
        .map(|bytes| decode(&event.key, bytes))
        .transpose()?;
    Ok(WatchState { id, prev, curr })
}
