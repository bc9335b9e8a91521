//! Remote document store contract and an in-memory implementation.
//!
//! The store is a JSON tree addressed by [`DocPath`]. Four operations are
//! exposed, mirroring a hosted real-time database:
//! - `once`: read the value at a path (collections come back as objects keyed by child key)
//! - `set`: overwrite the value at a path (`null` deletes it)
//! - `update`: merge named fields into the object at a path
//! - `push`: append a child under a generated, time-ordered key
//!
//! Values may contain `{".sv": "timestamp"}` placeholders which the store
//! replaces with the current epoch milliseconds when the write lands.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{watch, Semaphore};
use tracing::debug;
use uuid::Uuid;

use crate::error::StoreError;
use crate::types::DocPath;

/// Path-addressed document store.
///
/// Implementations must be `Send + Sync`; a single store is shared by every
/// session of the process.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Read the value at `path`, `None` when nothing is stored there.
    async fn once(&self, path: &DocPath) -> Result<Option<Value>, StoreError>;

    /// Overwrite the value at `path`.
    async fn set(&self, path: &DocPath, value: Value) -> Result<(), StoreError>;

    /// Merge `fields` into the object at `path`, leaving other fields alone.
    async fn update(&self, path: &DocPath, fields: Map<String, Value>) -> Result<(), StoreError>;

    /// Store `value` under a new unique child of `path` and return its key.
    async fn push(&self, path: &DocPath, value: Value) -> Result<String, StoreError>;

    /// Live connectivity: `true` while the store is reachable.
    fn connectivity(&self) -> watch::Receiver<bool>;
}

#[async_trait]
impl<S: RemoteStore + ?Sized> RemoteStore for Arc<S> {
    async fn once(&self, path: &DocPath) -> Result<Option<Value>, StoreError> {
        (**self).once(path).await
    }

    async fn set(&self, path: &DocPath, value: Value) -> Result<(), StoreError> {
        (**self).set(path, value).await
    }

    async fn update(&self, path: &DocPath, fields: Map<String, Value>) -> Result<(), StoreError> {
        (**self).update(path, fields).await
    }

    async fn push(&self, path: &DocPath, value: Value) -> Result<String, StoreError> {
        (**self).push(path, value).await
    }

    fn connectivity(&self) -> watch::Receiver<bool> {
        (**self).connectivity()
    }
}

/// Generate a unique child key whose string order follows creation time.
pub fn push_key() -> String {
    Uuid::now_v7().to_string()
}

pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Replace every server timestamp placeholder in `value` with `now_ms`.
pub fn resolve_server_values(value: &mut Value, now_ms: i64) {
    let is_timestamp = matches!(
        value,
        Value::Object(map)
            if map.len() == 1 && map.get(".sv").and_then(Value::as_str) == Some("timestamp")
    );
    if is_timestamp {
        *value = Value::from(now_ms);
        return;
    }

    match value {
        Value::Object(map) => map
            .values_mut()
            .for_each(|v| resolve_server_values(v, now_ms)),
        Value::Array(items) => items
            .iter_mut()
            .for_each(|v| resolve_server_values(v, now_ms)),
        _ => {}
    }
}

/// Validate the keys of an `update` payload.
pub(crate) fn validate_fields(
    path: &DocPath,
    fields: &Map<String, Value>,
) -> Result<(), StoreError> {
    for key in fields.keys() {
        path.clone().child(key).validate()?;
    }
    Ok(())
}

/// Look up `segments` below `root`. Nulls and empty objects count as absent.
pub(crate) fn tree_get<'a>(root: &'a Value, segments: &[String]) -> Option<&'a Value> {
    let mut node = root;
    for segment in segments {
        node = node.as_object()?.get(segment)?;
    }
    match node {
        Value::Null => None,
        Value::Object(map) if map.is_empty() => None,
        other => Some(other),
    }
}

/// Write `value` at `segments` below `root`, creating parents as needed.
pub(crate) fn tree_set(root: &mut Value, segments: &[String], value: Value) {
    let Some((last, parents)) = segments.split_last() else {
        *root = value;
        return;
    };

    let mut node = root;
    for segment in parents {
        node = ensure_object(node)
            .entry(segment.clone())
            .or_insert(Value::Null);
    }

    let map = ensure_object(node);
    if value.is_null() {
        map.remove(last);
    } else {
        map.insert(last.clone(), value);
    }
}

/// Merge `fields` into the object at `segments` below `root`.
pub(crate) fn tree_update(root: &mut Value, segments: &[String], fields: Map<String, Value>) {
    let mut target = segments.to_vec();
    for (key, value) in fields {
        target.push(key);
        tree_set(root, &target, value);
        target.pop();
    }
}

fn ensure_object(node: &mut Value) -> &mut Map<String, Value> {
    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    match node {
        Value::Object(map) => map,
        _ => unreachable!("node was just replaced with an object"),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Holds operations until released. Used to keep a call outstanding in tests.
#[derive(Debug, Default)]
struct Gate {
    semaphore: Mutex<Option<Arc<Semaphore>>>,
}

impl Gate {
    fn hold(&self) {
        *lock(&self.semaphore) = Some(Arc::new(Semaphore::new(0)));
    }

    fn release(&self) {
        if let Some(semaphore) = lock(&self.semaphore).take() {
            semaphore.close();
        }
    }

    async fn pass(&self) {
        let semaphore = lock(&self.semaphore).clone();
        if let Some(semaphore) = semaphore {
            // A closed semaphore means the gate was released.
            let _ = semaphore.acquire().await;
        }
    }
}

/// In-memory document store.
///
/// Used for tests and local development. Besides the store contract it can
/// simulate an unreachable or rejecting backend and hold calls in flight.
#[derive(Debug)]
pub struct MemoryStore {
    root: Mutex<Value>,
    online: watch::Sender<bool>,
    reject_reads: AtomicBool,
    reject_writes: AtomicBool,
    read_gate: Gate,
    write_gate: Gate,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_data(Value::Object(Map::new()))
    }

    /// Create a store seeded with `data` as its root value.
    pub fn with_data(data: Value) -> Self {
        let (online, _) = watch::channel(true);
        Self {
            root: Mutex::new(data),
            online,
            reject_reads: AtomicBool::new(false),
            reject_writes: AtomicBool::new(false),
            read_gate: Gate::default(),
            write_gate: Gate::default(),
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
        }
    }

    /// Toggle connectivity. While offline every call fails with a network error.
    pub fn set_online(&self, online: bool) {
        self.online.send_replace(online);
    }

    /// Make writes fail with `PermissionDenied`.
    pub fn reject_writes(&self, reject: bool) {
        self.reject_writes.store(reject, Ordering::SeqCst);
    }

    /// Make reads fail with `PermissionDenied`.
    pub fn reject_reads(&self, reject: bool) {
        self.reject_reads.store(reject, Ordering::SeqCst);
    }

    /// Keep writes pending until [`MemoryStore::release_writes`].
    pub fn hold_writes(&self) {
        self.write_gate.hold();
    }

    pub fn release_writes(&self) {
        self.write_gate.release();
    }

    /// Keep reads pending until [`MemoryStore::release_reads`].
    pub fn hold_reads(&self) {
        self.read_gate.hold();
    }

    pub fn release_reads(&self) {
        self.read_gate.release();
    }

    /// Number of reads issued against the store, including failed ones.
    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// Number of writes issued against the store, including failed ones.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Synchronous peek at a stored value.
    pub fn value_at(&self, path: &DocPath) -> Option<Value> {
        tree_get(&lock(&self.root), path.segments()).cloned()
    }

    async fn begin_read(&self, path: &DocPath) -> Result<(), StoreError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        path.validate()?;
        self.read_gate.pass().await;
        self.check_online()?;
        if self.reject_reads.load(Ordering::SeqCst) {
            return Err(StoreError::PermissionDenied(path.to_string()));
        }
        Ok(())
    }

    async fn begin_write(&self, path: &DocPath) -> Result<(), StoreError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        path.validate()?;
        self.write_gate.pass().await;
        self.check_online()?;
        if self.reject_writes.load(Ordering::SeqCst) {
            return Err(StoreError::PermissionDenied(path.to_string()));
        }
        Ok(())
    }

    fn check_online(&self) -> Result<(), StoreError> {
        if *self.online.borrow() {
            Ok(())
        } else {
            Err(StoreError::Network("store is offline".to_string()))
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn once(&self, path: &DocPath) -> Result<Option<Value>, StoreError> {
        self.begin_read(path).await?;
        Ok(self.value_at(path))
    }

    async fn set(&self, path: &DocPath, mut value: Value) -> Result<(), StoreError> {
        self.begin_write(path).await?;
        resolve_server_values(&mut value, now_millis());
        tree_set(&mut lock(&self.root), path.segments(), value);
        debug!(path = %path, "memory set");
        Ok(())
    }

    async fn update(
        &self,
        path: &DocPath,
        mut fields: Map<String, Value>,
    ) -> Result<(), StoreError> {
        self.begin_write(path).await?;
        validate_fields(path, &fields)?;
        let now = now_millis();
        fields
            .values_mut()
            .for_each(|v| resolve_server_values(v, now));
        tree_update(&mut lock(&self.root), path.segments(), fields);
        debug!(path = %path, "memory update");
        Ok(())
    }

    async fn push(&self, path: &DocPath, mut value: Value) -> Result<String, StoreError> {
        self.begin_write(path).await?;
        let key = push_key();
        resolve_server_values(&mut value, now_millis());
        let child = path.clone().child(&key);
        tree_set(&mut lock(&self.root), child.segments(), value);
        debug!(path = %child, "memory push");
        Ok(key)
    }

    fn connectivity(&self) -> watch::Receiver<bool> {
        self.online.subscribe()
    }
}
