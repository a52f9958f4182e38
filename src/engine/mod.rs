mod error;
mod guard;
mod matching;
mod mutations;
mod queries;

pub use error::{ConflictKind, EngineError};
pub use guard::{ConflictPolicy, Decision, check};
pub use matching::find_overlaps;
pub use mutations::Toggle;

use std::collections::HashMap;
use std::io;
use std::ops::{Deref, DerefMut};
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use ulid::Ulid;

use crate::limits::MAX_RESOURCES;
use crate::model::*;
use crate::observability::{RESOURCES_ACTIVE, WAL_FLUSH_BATCH_SIZE, WAL_FLUSH_DURATION_SECONDS};
use crate::recurrence::SlotGrid;
use crate::wal::Wal;

pub type SharedResourceState = Arc<RwLock<ResourceState>>;
type ResourceMap = Arc<DashMap<ResourceId, SharedResourceState>>;

/// Startup-time engine settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineConfig {
    pub policy: ConflictPolicy,
    pub grid: SlotGrid,
}

// ── Group-commit WAL channel ─────────────────────────────

enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        response: oneshot::Sender<io::Result<usize>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL.
///
/// Appends that are already queued when one arrives join its batch, and the
/// whole batch shares a single fsync. Control commands flush the pending
/// batch first, so they observe every append sent before them.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    let mut batch: Vec<PendingAppend> = Vec::new();
    while let Some(first) = rx.recv().await {
        let mut next = Some(first);
        while let Some(cmd) = next {
            match cmd {
                WalCommand::Append { event, response } => batch.push((event, response)),
                WalCommand::Compact { response } => {
                    flush_batch(&mut wal, &mut batch);
                    let _ = response.send(compact(&mut wal));
                }
                WalCommand::AppendsSinceCompact { response } => {
                    flush_batch(&mut wal, &mut batch);
                    let _ = response.send(wal.appends_since_compact());
                }
            }
            next = rx.try_recv().ok();
        }
        flush_batch(&mut wal, &mut batch);
    }
    tracing::debug!("WAL writer stopped");
}

fn flush_batch(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    if batch.is_empty() {
        return;
    }
    metrics::histogram!(WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();

    let result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event))
        .and_then(|()| wal.flush_sync());

    metrics::histogram!(WAL_FLUSH_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!(error = %e, records = batch.len(), "WAL flush failed");
        // Callers are told the batch failed, so none of it may survive.
        if let Err(e) = wal.rollback() {
            tracing::error!(error = %e, "WAL rollback failed");
        }
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

/// Rebuild per-resource state from a sequence of events.
fn fold(events: &[Event]) -> HashMap<ResourceId, ResourceState> {
    let mut resources: HashMap<ResourceId, ResourceState> = HashMap::new();
    for event in events {
        let rid = event.resource_id();
        resources
            .entry(rid)
            .or_insert_with(|| ResourceState::new(rid))
            .apply(event);
    }
    resources
}

/// Rewrite the log as one `SlotsCreated` record per non-empty resource.
///
/// Works from the log itself rather than from in-memory state, so it needs
/// no resource locks and cannot miss an append that raced with it.
fn compact(wal: &mut Wal) -> io::Result<usize> {
    let history = Wal::replay(wal.path())?;
    let mut snapshot: Vec<Event> = fold(&history)
        .into_values()
        .filter(|rs| !rs.slots.is_empty())
        .map(|rs| Event::SlotsCreated {
            resource_id: rs.id,
            slots: rs.slots,
            replaced: Vec::new(),
        })
        .collect();
    snapshot.sort_by_key(Event::resource_id);
    Wal::write_compact_file(wal.path(), &snapshot)?;
    wal.swap_compact_file()?;
    tracing::info!(before = history.len(), after = snapshot.len(), "WAL compacted");
    Ok(snapshot.len())
}

async fn wal_append(wal_tx: &mpsc::Sender<WalCommand>, event: Event) -> Result<(), EngineError> {
    let (tx, rx) = oneshot::channel();
    wal_tx
        .send(WalCommand::Append {
            event,
            response: tx,
        })
        .await
        .map_err(|_| EngineError::Storage("WAL writer shut down".into()))?;
    rx.await
        .map_err(|_| EngineError::Storage("WAL writer dropped response".into()))?
        .map_err(|e| EngineError::Storage(e.to_string()))
}

/// Apply an event to a locked resource and keep the id index in step.
fn apply_to_resource(rs: &mut ResourceState, event: &Event, index: &DashMap<Ulid, ResourceId>) {
    rs.apply(event);
    match event {
        Event::SlotsCreated {
            resource_id,
            slots,
            replaced,
        } => {
            for id in replaced {
                index.remove(id);
            }
            for slot in slots {
                index.insert(slot.id, *resource_id);
            }
        }
        Event::SlotsDeleted { ids, .. } => {
            for id in ids {
                index.remove(id);
            }
        }
    }
}

/// Write access to one resource.
///
/// A resource left without slots is dropped from the engine's map when its
/// guard is released, so it stops counting against `MAX_RESOURCES`.
pub(super) struct ResourceWriteGuard {
    state: ResourceMap,
    lock: SharedResourceState,
    guard: OwnedRwLockWriteGuard<ResourceState>,
}

impl ResourceWriteGuard {
    /// Whether the map still points at this resource. A writer that waited
    /// on a resource emptied and released in the meantime holds a stale lock.
    fn is_current(&self) -> bool {
        self.state
            .get(&self.guard.id)
            .is_some_and(|e| Arc::ptr_eq(e.value(), &self.lock))
    }
}

impl Deref for ResourceWriteGuard {
    type Target = ResourceState;

    fn deref(&self) -> &ResourceState {
        &self.guard
    }
}

impl DerefMut for ResourceWriteGuard {
    fn deref_mut(&mut self) -> &mut ResourceState {
        &mut self.guard
    }
}

impl Drop for ResourceWriteGuard {
    fn drop(&mut self) {
        if !self.guard.slots.is_empty() {
            return;
        }
        let id = self.guard.id;
        if self
            .state
            .remove_if(&id, |_, v| Arc::ptr_eq(v, &self.lock))
            .is_some()
        {
            tracing::debug!(resource_id = id, "empty resource released");
            metrics::gauge!(RESOURCES_ACTIVE).set(self.state.len() as f64);
        }
    }
}

pub struct Engine {
    pub state: ResourceMap,
    wal_tx: mpsc::Sender<WalCommand>,
    /// Slot id → owning resource.
    slot_index: Arc<DashMap<Ulid, ResourceId>>,
    config: EngineConfig,
    cancel: CancellationToken,
}

impl Engine {
    /// Open the WAL at `wal_path`, replay it, and start the writer task.
    /// Must be called inside a tokio runtime.
    pub fn new(wal_path: PathBuf, config: EngineConfig) -> io::Result<Self> {
        let (wal, events) = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let state: ResourceMap = Arc::new(DashMap::new());
        let slot_index = Arc::new(DashMap::new());
        for (rid, rs) in fold(&events) {
            if rs.slots.is_empty() {
                continue;
            }
            for slot in &rs.slots {
                slot_index.insert(slot.id, rid);
            }
            state.insert(rid, Arc::new(RwLock::new(rs)));
        }
        tracing::info!(
            path = %wal_path.display(),
            records = events.len(),
            resources = state.len(),
            slots = slot_index.len(),
            policy = %config.policy,
            "engine ready"
        );
        metrics::gauge!(RESOURCES_ACTIVE).set(state.len() as f64);

        Ok(Self {
            state,
            wal_tx,
            slot_index,
            config,
            cancel: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn get_resource(&self, id: &ResourceId) -> Option<SharedResourceState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    /// The resource a live slot belongs to.
    pub fn resource_of(&self, slot_id: &Ulid) -> Option<ResourceId> {
        self.slot_index.get(slot_id).map(|e| *e.value())
    }

    /// Token cancelled by `shutdown`. Background tasks watch it too.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Refuse new mutations and release any waiting for a lock with
    /// `EngineError::Cancelled`. Commits already under way still finish.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Fetch the resource, creating empty state on first use.
    pub(super) fn resource_for_write(
        &self,
        id: ResourceId,
    ) -> Result<SharedResourceState, EngineError> {
        if let Some(rs) = self.get_resource(&id) {
            return Ok(rs);
        }
        if self.state.len() >= MAX_RESOURCES {
            return Err(EngineError::LimitExceeded("too many resources"));
        }
        let rs = self
            .state
            .entry(id)
            .or_insert_with(|| Arc::new(RwLock::new(ResourceState::new(id))))
            .value()
            .clone();
        metrics::gauge!(RESOURCES_ACTIVE).set(self.state.len() as f64);
        Ok(rs)
    }

    /// Take the resource's write lock unless the engine is shutting down.
    pub(super) async fn lock_for_write(
        &self,
        rs: SharedResourceState,
    ) -> Result<ResourceWriteGuard, EngineError> {
        let lock = Arc::clone(&rs);
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(EngineError::Cancelled),
            guard = rs.write_owned() => Ok(ResourceWriteGuard {
                state: Arc::clone(&self.state),
                lock,
                guard,
            }),
        }
    }

    /// Lock the resource for inserting, creating it on first use. Retries if
    /// the resource was emptied and released while we waited for the lock.
    pub(super) async fn lock_resource(
        &self,
        id: ResourceId,
    ) -> Result<ResourceWriteGuard, EngineError> {
        loop {
            let rs = self.resource_for_write(id)?;
            let guard = self.lock_for_write(rs).await?;
            if guard.is_current() {
                return Ok(guard);
            }
        }
    }

    /// WAL-append `event`, then apply it under `guard`.
    ///
    /// This is the commit point. It runs on its own task that owns the
    /// guard, so dropping the caller's future cannot leave an event durable
    /// but unapplied, or applied but not durable. If the append fails
    /// nothing is applied.
    pub(super) async fn commit(
        &self,
        mut guard: ResourceWriteGuard,
        event: Event,
    ) -> Result<(), EngineError> {
        let wal_tx = self.wal_tx.clone();
        let index = Arc::clone(&self.slot_index);
        tokio::spawn(async move {
            wal_append(&wal_tx, event.clone()).await?;
            apply_to_resource(&mut guard, &event, &index);
            Ok::<(), EngineError>(())
        })
        .await
        .map_err(|e| EngineError::Storage(format!("commit task failed: {e}")))?
    }

    async fn wal_control<T>(
        &self,
        cmd: impl FnOnce(oneshot::Sender<T>) -> WalCommand,
    ) -> Result<T, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(cmd(tx))
            .await
            .map_err(|_| EngineError::Storage("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Storage("WAL writer dropped response".into()))
    }
}
