//! Optimistic remote-state synchronizer.
//!
//! A [`SyncedField`] is the session's local copy of one per-user value. The
//! [`Synchronizer`] mutates it optimistically and persists the result:
//!
//! 1. compute the new value from the current local value
//! 2. publish it locally before the store answers
//! 3. write it to the store
//! 4. on failure restore the previous value and show a toast
//!
//! At most one write per (user, field) is outstanding; a second attempt is
//! refused with [`SyncError::InFlight`] until the first settles.

use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::{StoreError, SyncError};
use crate::notify::Notifier;
use crate::store::RemoteStore;
use crate::types::{AuthUser, DocPath, FieldKey};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Session-local mirror of one synchronized value.
///
/// Observers bind to it through [`SyncedField::subscribe`]. The value always
/// equals the last one read from or accepted by the store, or the optimistic
/// value of the write currently in flight.
#[derive(Debug)]
pub struct SyncedField<T> {
    name: &'static str,
    value: watch::Sender<T>,
    // Bumped on reset and on every store read, so a late revert cannot
    // overwrite a newer value.
    generation: Mutex<u64>,
}

impl<T: Clone + Default> SyncedField<T> {
    pub fn new(name: &'static str) -> Self {
        let (value, _) = watch::channel(T::default());
        Self {
            name,
            value,
            generation: Mutex::new(0),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn get(&self) -> T {
        self.value.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.value.subscribe()
    }

    /// Drop back to the default value, e.g. on sign-out.
    pub fn reset(&self) {
        let mut generation = lock(&self.generation);
        *generation += 1;
        self.value.send_replace(T::default());
    }

    fn generation(&self) -> u64 {
        *lock(&self.generation)
    }

    fn publish(&self, value: T) {
        self.value.send_replace(value);
    }

    /// Replace the value unless the field was reset since `generation`.
    fn publish_if_current(&self, value: T, generation: u64) -> bool {
        let current = lock(&self.generation);
        if *current != generation {
            return false;
        }
        self.value.send_replace(value);
        true
    }

    /// Like [`SyncedField::publish_if_current`], but also starts a new
    /// generation so reverts of writes begun earlier are skipped.
    fn supersede_if_current(&self, value: T, generation: u64) -> bool {
        let mut current = lock(&self.generation);
        if *current != generation {
            return false;
        }
        *current += 1;
        self.value.send_replace(value);
        true
    }
}

/// How a new value reaches the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Persist {
    /// Overwrite the whole value at the path
    Set(DocPath),
    /// Merge the value's fields into the object at the path
    Update(DocPath),
}

impl Persist {
    fn path(&self) -> &DocPath {
        match self {
            Persist::Set(path) | Persist::Update(path) => path,
        }
    }
}

/// Releases the in-flight slot when dropped, whatever the outcome.
struct InFlightGuard<'a> {
    slots: &'a Mutex<HashSet<FieldKey>>,
    key: FieldKey,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        lock(self.slots).remove(&self.key);
    }
}

pub struct Synchronizer {
    store: Arc<dyn RemoteStore>,
    notifier: Arc<Notifier>,
    in_flight: Mutex<HashSet<FieldKey>>,
}

impl Synchronizer {
    pub fn new(store: Arc<dyn RemoteStore>, notifier: Arc<Notifier>) -> Self {
        Self {
            store,
            notifier,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn RemoteStore> {
        &self.store
    }

    pub fn notifier(&self) -> &Arc<Notifier> {
        &self.notifier
    }

    /// Whether a write for `uid`'s `field` is outstanding. Controls bound to
    /// the field stay disabled while this is true.
    pub fn is_in_flight(&self, uid: &str, field: &'static str) -> bool {
        lock(&self.in_flight).contains(&FieldKey::new(uid, field))
    }

    fn claim(&self, key: FieldKey) -> Result<InFlightGuard<'_>, SyncError> {
        let mut slots = lock(&self.in_flight);
        if !slots.insert(key.clone()) {
            return Err(SyncError::InFlight { field: key.field });
        }
        Ok(InFlightGuard {
            slots: &self.in_flight,
            key,
        })
    }

    /// Apply `mutation` to `field` optimistically and persist the result.
    ///
    /// Returns the value that was stored. On a store failure the field is
    /// restored to its previous value, `failure_message` is shown and the
    /// error is returned. No retry is attempted.
    pub async fn apply_and_persist<T, F>(
        &self,
        user: Option<&AuthUser>,
        field: &SyncedField<T>,
        persist: Persist,
        mutation: F,
        failure_message: &str,
    ) -> Result<T, SyncError>
    where
        T: Clone + Default + Serialize + Send + Sync,
        F: FnOnce(&T) -> T,
    {
        let user = user.ok_or(SyncError::Unauthenticated)?;
        let _guard = self.claim(FieldKey::new(&user.uid, field.name()))?;

        let generation = field.generation();
        let previous = field.get();
        let next = mutation(&previous);
        field.publish(next.clone());

        match self.write(&persist, &next).await {
            Ok(()) => {
                debug!(uid = %user.uid, field = field.name(), path = %persist.path(), "persisted");
                Ok(next)
            }
            Err(e) => {
                warn!(
                    uid = %user.uid,
                    field = field.name(),
                    path = %persist.path(),
                    error = %e,
                    "remote write failed, reverting"
                );
                if !field.publish_if_current(previous, generation) {
                    debug!(
                        field = field.name(),
                        "field was reset or reloaded during write; revert skipped"
                    );
                }
                self.notifier.error(failure_message);
                Err(SyncError::RemoteWriteFailed(e))
            }
        }
    }

    async fn write<T: Serialize>(&self, persist: &Persist, value: &T) -> Result<(), StoreError> {
        let value = serde_json::to_value(value)?;
        match persist {
            Persist::Set(path) => self.store.set(path, value).await,
            Persist::Update(path) => match value {
                Value::Object(fields) => self.store.update(path, fields).await,
                other => Err(StoreError::InvalidValue(format!(
                    "update at {} needs an object, got {}",
                    path, other
                ))),
            },
        }
    }

    /// Populate `field` from the store after sign-in.
    ///
    /// A failed read leaves the field at its default so the page stays
    /// usable; the error is returned for the caller to report.
    pub async fn hydrate<T, D>(
        &self,
        field: &SyncedField<T>,
        path: &DocPath,
        decode: D,
    ) -> Result<T, SyncError>
    where
        T: Clone + Default,
        D: FnOnce(Option<Value>) -> T,
    {
        let generation = field.generation();
        match self.store.once(path).await {
            Ok(raw) => {
                let value = decode(raw);
                field.supersede_if_current(value.clone(), generation);
                Ok(value)
            }
            Err(e) => {
                warn!(field = field.name(), path = %path, error = %e, "remote read failed");
                field.supersede_if_current(T::default(), generation);
                Err(SyncError::RemoteReadFailed(e))
            }
        }
    }

    /// Append `record` under a new child of `path`. Nothing local to revert;
    /// failures are logged and returned, never shown.
    pub async fn append<R: Serialize>(
        &self,
        user: Option<&AuthUser>,
        path: &DocPath,
        record: &R,
    ) -> Result<String, SyncError> {
        let user = user.ok_or(SyncError::Unauthenticated)?;
        let value = serde_json::to_value(record)
            .map_err(|e| SyncError::RemoteWriteFailed(StoreError::from(e)))?;

        match self.store.push(path, value).await {
            Ok(key) => {
                debug!(uid = %user.uid, path = %path, key = %key, "appended");
                Ok(key)
            }
            Err(e) => {
                warn!(uid = %user.uid, path = %path, error = %e, "append failed");
                Err(SyncError::RemoteWriteFailed(e))
            }
        }
    }

    /// Read `path`, giving up waiting after `timeout`.
    ///
    /// The read itself keeps running in the background and its result is
    /// discarded if it arrives late.
    pub async fn read_within(
        &self,
        path: &DocPath,
        timeout: Duration,
    ) -> Result<Option<Value>, SyncError> {
        let store = self.store.clone();
        let target = path.clone();
        let read = tokio::spawn(async move { store.once(&target).await });

        match tokio::time::timeout(timeout, read).await {
            Ok(Ok(result)) => result.map_err(SyncError::RemoteReadFailed),
            Ok(Err(join_error)) => Err(SyncError::RemoteReadFailed(StoreError::Task(
                join_error.to_string(),
            ))),
            Err(_) => {
                debug!(path = %path, timeout = ?timeout, "read wait abandoned");
                Err(SyncError::Timeout(timeout))
            }
        }
    }
}
