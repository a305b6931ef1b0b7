//! The result cache: one writer, many readers per invocation key.
//!
//! The cache decorator computes a deterministic key from the operation
//! identity and bound parameter values. The first caller for a key is
//! elected writer through a single atomic put-if-absent against a
//! shared lock map; it appends every emitted item to the key's shared
//! append-only list before forwarding it downstream, then appends a
//! terminal marker. Every other caller becomes a reader: it replays
//! the items already present, then follows further appends until it
//! observes a terminal marker.
//!
//! Two deliberate departures from the protocol this is modeled on:
//! a failed or cancelled writer appends an explicit `Failed` marker so
//! readers never wait indefinitely, and lock leases carry a TTL so a
//! crashed writer's claim expires instead of blocking the key forever.
//! Entries are never invalidated here when the schema changes;
//! eviction is an external actor's job.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::ReceiverStream;
use tracing::warn;
use uuid::Uuid;

use crate::cancel::CancellationFlag;
use crate::descriptor::{Operation, Service};
use crate::error::{CacheWriteError, InvocationError};
use crate::instance::{Provenance, TypedInstance};
use crate::invoke::lineage::{InvocationEvent, LineageSink};
use crate::invoke::{BoundParameter, InstanceStream, OperationInvoker};

/// Identifies one cache entry: hex blake3 of the operation identity
/// plus the bound parameter values.
pub type CacheKey = String;

/// Derives the deterministic cache key for an invocation.
#[must_use]
pub fn operation_cache_key(operation: &str, params: &[BoundParameter]) -> CacheKey {
    let mut hasher = blake3::Hasher::new();
    hasher.update(operation.as_bytes());
    for param in params {
        hasher.update(&[0u8]);
        hasher.update(param.name.as_bytes());
        hasher.update(&[0u8]);
        // The value payload only: provenance differs per query and
        // must not split the key space.
        if let Ok(bytes) = serde_json::to_vec(&param.value.value) {
            hasher.update(&bytes);
        }
    }
    hasher.finalize().to_hex().to_string()
}

/// One element of a cache entry's append-only list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CacheEvent {
    /// An emitted value.
    Item {
        /// The serialized instance.
        instance: TypedInstance,
    },
    /// The writer's stream completed successfully.
    Completed,
    /// The writer's stream failed or was cancelled mid-flight.
    Failed {
        /// The failure recorded by the writer.
        message: String,
    },
}

impl CacheEvent {
    /// True for `Completed` and `Failed`.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed { .. })
    }

    /// Serializes to the cache wire form.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserializes from the cache wire form.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Errors reported by a cache store backend.
#[derive(Debug, Error)]
pub enum CacheStoreError {
    /// The backend failed.
    #[error("Cache backend error: {0}")]
    Backend(String),
}

impl From<CacheStoreError> for InvocationError {
    fn from(err: CacheStoreError) -> Self {
        Self::CacheStore {
            message: err.to_string(),
        }
    }
}

/// One append observed on a cache entry's list.
#[derive(Debug, Clone)]
pub struct AppendEvent {
    /// The position of the appended element.
    pub offset: usize,
    /// The element bytes.
    pub bytes: Vec<u8>,
}

/// A live subscription to a cache entry's appends.
///
/// `current_len` is the list length at the moment of subscription;
/// the receiver yields every append from that point on. Taking both
/// atomically closes the gap between replay and follow.
pub struct AppendSubscription {
    /// List length when the subscription was taken.
    pub current_len: usize,
    /// Receiver of subsequent appends.
    pub receiver: broadcast::Receiver<AppendEvent>,
}

/// Capability interface over a distributed list/lock store.
///
/// Implementable over any KV/list store offering atomic put-if-absent
/// and per-key append-only lists; [`InMemoryCacheStore`] is the
/// single-process equivalent. The writer-election and replay algorithm
/// in [`CacheDecorator`] is identical regardless of backing store.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Appends an element to the key's list, returning its offset.
    async fn append(&self, key: &str, bytes: Vec<u8>) -> Result<usize, CacheStoreError>;

    /// Reads the list from the given offset to its current end.
    async fn read_from(&self, key: &str, offset: usize) -> Result<Vec<Vec<u8>>, CacheStoreError>;

    /// Subscribes to appends, atomically capturing the current length.
    async fn subscribe(&self, key: &str) -> Result<AppendSubscription, CacheStoreError>;

    /// Clears the key's list. Used to reset an orphaned partial entry
    /// after a lease expiry.
    async fn truncate(&self, key: &str) -> Result<(), CacheStoreError>;

    /// Atomically claims the lock if absent (or expired), recording
    /// the caller's lease token with the given TTL. Returns true when
    /// this caller won.
    async fn try_acquire(
        &self,
        lock_key: &str,
        token: Uuid,
        ttl: Duration,
    ) -> Result<bool, CacheStoreError>;

    /// Releases the lock if the token still holds it.
    async fn release(&self, lock_key: &str, token: Uuid) -> Result<(), CacheStoreError>;
}

struct Entry {
    items: Vec<Vec<u8>>,
    tx: broadcast::Sender<AppendEvent>,
}

impl Entry {
    fn new() -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self {
            items: Vec::new(),
            tx,
        }
    }
}

struct Lease {
    token: Uuid,
    deadline: Instant,
}

/// In-memory [`CacheStore`] for single-process deployments and tests.
#[derive(Default)]
pub struct InMemoryCacheStore {
    entries: Mutex<HashMap<String, Entry>>,
    locks: Mutex<HashMap<String, Lease>>,
}

impl InMemoryCacheStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn poisoned() -> CacheStoreError {
        CacheStoreError::Backend("store mutex poisoned".to_string())
    }
}

#[async_trait]
impl CacheStore for InMemoryCacheStore {
    async fn append(&self, key: &str, bytes: Vec<u8>) -> Result<usize, CacheStoreError> {
        let mut entries = self.entries.lock().map_err(|_| Self::poisoned())?;
        let entry = entries.entry(key.to_string()).or_insert_with(Entry::new);
        let offset = entry.items.len();
        entry.items.push(bytes.clone());
        // No receivers is fine; replay covers late subscribers.
        let _ = entry.tx.send(AppendEvent { offset, bytes });
        Ok(offset)
    }

    async fn read_from(&self, key: &str, offset: usize) -> Result<Vec<Vec<u8>>, CacheStoreError> {
        let entries = self.entries.lock().map_err(|_| Self::poisoned())?;
        Ok(entries
            .get(key)
            .map(|e| e.items.iter().skip(offset).cloned().collect())
            .unwrap_or_default())
    }

    async fn subscribe(&self, key: &str) -> Result<AppendSubscription, CacheStoreError> {
        let mut entries = self.entries.lock().map_err(|_| Self::poisoned())?;
        let entry = entries.entry(key.to_string()).or_insert_with(Entry::new);
        Ok(AppendSubscription {
            current_len: entry.items.len(),
            receiver: entry.tx.subscribe(),
        })
    }

    async fn truncate(&self, key: &str) -> Result<(), CacheStoreError> {
        let mut entries = self.entries.lock().map_err(|_| Self::poisoned())?;
        if let Some(entry) = entries.get_mut(key) {
            entry.items.clear();
        }
        Ok(())
    }

    async fn try_acquire(
        &self,
        lock_key: &str,
        token: Uuid,
        ttl: Duration,
    ) -> Result<bool, CacheStoreError> {
        let mut locks = self.locks.lock().map_err(|_| Self::poisoned())?;
        let now = Instant::now();
        match locks.get(lock_key) {
            Some(lease) if lease.deadline > now && lease.token != token => Ok(false),
            _ => {
                locks.insert(
                    lock_key.to_string(),
                    Lease {
                        token,
                        deadline: now + ttl,
                    },
                );
                Ok(true)
            }
        }
    }

    async fn release(&self, lock_key: &str, token: Uuid) -> Result<(), CacheStoreError> {
        let mut locks = self.locks.lock().map_err(|_| Self::poisoned())?;
        if locks.get(lock_key).is_some_and(|lease| lease.token == token) {
            locks.remove(lock_key);
        }
        Ok(())
    }
}

/// Default lock lease TTL.
const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(30);

enum WriterTerminal {
    Completed { items: usize },
    Failed { items: usize, message: String },
    Cancelled { items: usize },
}

/// The cache stage of the invocation pipeline.
pub struct CacheDecorator {
    store: Arc<dyn CacheStore>,
    lineage: Arc<dyn LineageSink>,
    lease_ttl: Duration,
}

impl CacheDecorator {
    /// Creates the decorator over a cache store.
    #[must_use]
    pub fn new(store: Arc<dyn CacheStore>, lineage: Arc<dyn LineageSink>) -> Self {
        Self {
            store,
            lineage,
            lease_ttl: DEFAULT_LEASE_TTL,
        }
    }

    /// Overrides the lock lease TTL.
    #[must_use]
    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    /// Routes an invocation through the cache: this caller becomes
    /// either the single writer for the key or one of its readers.
    pub async fn invoke(
        &self,
        service: &Service,
        operation: &Operation,
        params: &[BoundParameter],
        query_id: Uuid,
        cancel: CancellationFlag,
        invoker: Arc<dyn OperationInvoker>,
    ) -> Result<InstanceStream, InvocationError> {
        let op_name = service.qualified_operation_name(operation);
        let key = operation_cache_key(&op_name, params);
        let lock_key = format!("{key}.lock");

        let existing = self.store.read_from(&key, 0).await?;

        if !has_terminal(&existing) {
            let token = Uuid::new_v4();
            if self
                .store
                .try_acquire(&lock_key, token, self.lease_ttl)
                .await?
            {
                // The active writer may have appended its terminal and
                // released the lock between the read above and this
                // claim; truncating then would destroy a completed
                // entry. Re-check under the lease.
                let current = self.store.read_from(&key, 0).await?;
                if has_terminal(&current) {
                    self.store.release(&lock_key, token).await?;
                } else {
                    if !current.is_empty() {
                        // A previous writer's lease expired mid-stream;
                        // its partial list cannot be trusted.
                        warn!(key = %key, "resetting orphaned partial cache entry");
                        self.store.truncate(&key).await?;
                    }
                    return self
                        .writer_stream(
                            service, operation, params, op_name, key, lock_key, token,
                            query_id, cancel, invoker,
                        )
                        .await;
                }
            }
        }

        self.reader_stream(op_name, key, params.len(), query_id, cancel)
            .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn writer_stream(
        &self,
        service: &Service,
        operation: &Operation,
        params: &[BoundParameter],
        op_name: String,
        key: CacheKey,
        lock_key: String,
        token: Uuid,
        query_id: Uuid,
        cancel: CancellationFlag,
        invoker: Arc<dyn OperationInvoker>,
    ) -> Result<InstanceStream, InvocationError> {
        let started_at = Utc::now();
        let started = Instant::now();
        let param_count = params.len();

        let inner = match invoker.invoke(service, operation, params).await {
            Ok(stream) => stream,
            Err(err) => {
                // The claim is ours; terminate the entry so queued
                // readers are not left waiting.
                self.append_best_effort(
                    &key,
                    &CacheEvent::Failed {
                        message: err.to_string(),
                    },
                )
                .await;
                let _ = self.store.release(&lock_key, token).await;
                return Err(err);
            }
        };

        let store = Arc::clone(&self.store);
        let lineage = Arc::clone(&self.lineage);
        let (tx, rx) = mpsc::channel::<Result<TypedInstance, InvocationError>>(16);

        tokio::spawn(async move {
            let provenance = Provenance::RemoteCall {
                operation: op_name.clone(),
                query_id,
            };

            // Shared with the drive future so a cancellation still
            // reports how many items were already forwarded.
            let forwarded = AtomicUsize::new(0);
            let drive = drive_writer(inner, &key, &provenance, &store, &tx, &forwarded);
            tokio::pin!(drive);

            let terminal = tokio::select! {
                () = cancel.cancelled() => WriterTerminal::Cancelled {
                    items: forwarded.load(Ordering::SeqCst),
                },
                terminal = &mut drive => terminal,
            };

            let (items, marker) = match terminal {
                WriterTerminal::Completed { items } => (items, CacheEvent::Completed),
                WriterTerminal::Failed { items, message } => {
                    (items, CacheEvent::Failed { message })
                }
                WriterTerminal::Cancelled { items } => (
                    items,
                    CacheEvent::Failed {
                        message: "writer cancelled".to_string(),
                    },
                ),
            };

            match marker.to_bytes() {
                Ok(bytes) => {
                    if let Err(err) = store.append(&key, bytes).await {
                        warn!(key = %key, error = %err, "failed to append terminal cache marker");
                    }
                }
                Err(err) => {
                    warn!(key = %key, error = %err, "failed to serialize terminal cache marker");
                }
            }
            if let Err(err) = store.release(&format!("{key}.lock"), token).await {
                warn!(key = %key, error = %err, "failed to release cache lock lease");
            }

            // Exactly one lineage event per actual invocation,
            // regardless of how many readers later replay it.
            lineage.report(InvocationEvent {
                operation: op_name,
                query_id,
                started_at,
                duration_ms: duration_ms(started),
                parameter_count: param_count,
                item_count: items,
                cache_read: false,
            });
        });

        Ok(ReceiverStream::new(rx).boxed())
    }

    async fn reader_stream(
        &self,
        op_name: String,
        key: CacheKey,
        param_count: usize,
        query_id: Uuid,
        cancel: CancellationFlag,
    ) -> Result<InstanceStream, InvocationError> {
        let started_at = Utc::now();
        let started = Instant::now();

        // Subscribe before replaying so no append can fall between
        // the replayed prefix and the follow phase.
        let subscription = self.store.subscribe(&key).await?;
        let replay = self.store.read_from(&key, 0).await?;

        let store = Arc::clone(&self.store);
        let lineage = Arc::clone(&self.lineage);
        let (tx, rx) = mpsc::channel::<Result<TypedInstance, InvocationError>>(16);

        tokio::spawn(async move {
            let provenance = Provenance::CacheReplay {
                operation: op_name.clone(),
                query_id,
            };

            let mut items = 0usize;
            let mut next_offset = 0usize;
            let mut done = false;

            for bytes in replay {
                next_offset += 1;
                match forward_cached(&bytes, &provenance, &tx, &mut items).await {
                    ForwardOutcome::Forwarded | ForwardOutcome::Skipped => {}
                    ForwardOutcome::Terminal | ForwardOutcome::ReceiverGone => {
                        done = true;
                        break;
                    }
                }
            }

            let mut receiver = subscription.receiver;
            while !done {
                let event = tokio::select! {
                    () = cancel.cancelled() => break,
                    event = receiver.recv() => event,
                };
                match event {
                    Ok(append) => {
                        if append.offset < next_offset {
                            continue;
                        }
                        if append.offset > next_offset {
                            // Missed appends; catch up from the store.
                            done = catch_up(
                                &store,
                                &key,
                                &provenance,
                                &tx,
                                &mut next_offset,
                                &mut items,
                            )
                            .await;
                            continue;
                        }
                        next_offset += 1;
                        match forward_cached(&append.bytes, &provenance, &tx, &mut items).await {
                            ForwardOutcome::Forwarded | ForwardOutcome::Skipped => {}
                            ForwardOutcome::Terminal | ForwardOutcome::ReceiverGone => done = true,
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        done = catch_up(
                            &store,
                            &key,
                            &provenance,
                            &tx,
                            &mut next_offset,
                            &mut items,
                        )
                        .await;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }

            lineage.report(InvocationEvent {
                operation: op_name,
                query_id,
                started_at,
                duration_ms: duration_ms(started),
                parameter_count: param_count,
                item_count: items,
                cache_read: true,
            });
        });

        Ok(ReceiverStream::new(rx).boxed())
    }

    async fn append_best_effort(&self, key: &str, event: &CacheEvent) {
        match event.to_bytes() {
            Ok(bytes) => {
                if let Err(err) = self.store.append(key, bytes).await {
                    warn!(key = %key, error = %err, "failed to append cache event");
                }
            }
            Err(err) => {
                warn!(key = %key, error = %err, "failed to serialize cache event");
            }
        }
    }
}

fn duration_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

fn has_terminal(elements: &[Vec<u8>]) -> bool {
    elements
        .iter()
        .any(|bytes| CacheEvent::from_bytes(bytes).is_ok_and(|e| e.is_terminal()))
}

/// Drives the writer's inner stream: append each item to the shared
/// list, then forward it downstream. A serialization failure degrades
/// that single item to an uncached pass-through.
async fn drive_writer(
    mut inner: InstanceStream,
    key: &str,
    provenance: &Provenance,
    store: &Arc<dyn CacheStore>,
    tx: &mpsc::Sender<Result<TypedInstance, InvocationError>>,
    forwarded: &AtomicUsize,
) -> WriterTerminal {
    while let Some(item) = inner.next().await {
        match item {
            Ok(instance) => {
                let tagged = instance.with_provenance(provenance);
                match (CacheEvent::Item {
                    instance: tagged.clone(),
                })
                .to_bytes()
                {
                    Ok(bytes) => {
                        if let Err(err) = store.append(key, bytes).await {
                            warn!(key = %key, error = %err, "failed to append item to cache");
                        }
                    }
                    Err(err) => {
                        let degraded = CacheWriteError {
                            key: key.to_string(),
                            message: err.to_string(),
                        };
                        warn!(error = %degraded, "item degraded to uncached pass-through");
                    }
                }
                let items = forwarded.fetch_add(1, Ordering::SeqCst) + 1;
                if tx.send(Ok(tagged)).await.is_err() {
                    // Downstream dropped the stream.
                    return WriterTerminal::Cancelled { items };
                }
            }
            Err(err) => {
                let message = err.to_string();
                let _ = tx.send(Err(err)).await;
                return WriterTerminal::Failed {
                    items: forwarded.load(Ordering::SeqCst),
                    message,
                };
            }
        }
    }
    WriterTerminal::Completed {
        items: forwarded.load(Ordering::SeqCst),
    }
}

enum ForwardOutcome {
    Forwarded,
    Skipped,
    Terminal,
    ReceiverGone,
}

/// Decodes one cached element and forwards it to a reader, rewriting
/// provenance to reference the replaying query.
async fn forward_cached(
    bytes: &[u8],
    provenance: &Provenance,
    tx: &mpsc::Sender<Result<TypedInstance, InvocationError>>,
    items: &mut usize,
) -> ForwardOutcome {
    match CacheEvent::from_bytes(bytes) {
        Ok(CacheEvent::Item { instance }) => {
            *items += 1;
            if tx.send(Ok(instance.with_provenance(provenance))).await.is_err() {
                ForwardOutcome::ReceiverGone
            } else {
                ForwardOutcome::Forwarded
            }
        }
        Ok(CacheEvent::Completed) => ForwardOutcome::Terminal,
        Ok(CacheEvent::Failed { message }) => {
            let _ = tx.send(Err(InvocationError::UpstreamFailed { message })).await;
            ForwardOutcome::Terminal
        }
        Err(err) => {
            warn!(error = %err, "skipping undecodable cache element");
            ForwardOutcome::Skipped
        }
    }
}

/// Re-reads the list from the reader's current offset after missed
/// broadcast events. Returns true when a terminal was observed.
async fn catch_up(
    store: &Arc<dyn CacheStore>,
    key: &str,
    provenance: &Provenance,
    tx: &mpsc::Sender<Result<TypedInstance, InvocationError>>,
    next_offset: &mut usize,
    items: &mut usize,
) -> bool {
    let elements = match store.read_from(key, *next_offset).await {
        Ok(elements) => elements,
        Err(err) => {
            let _ = tx
                .send(Err(InvocationError::CacheStore {
                    message: err.to_string(),
                }))
                .await;
            return true;
        }
    };
    for bytes in elements {
        *next_offset += 1;
        match forward_cached(&bytes, provenance, tx, items).await {
            ForwardOutcome::Forwarded | ForwardOutcome::Skipped => {}
            ForwardOutcome::Terminal | ForwardOutcome::ReceiverGone => return true,
        }
    }
    false
}
