//! WAL manager: the public face of the log.
//!
//! Producers append typed records and get back durable LSNs; a single
//! consumer drains records in LSN order, observes synthesized flush
//! barriers, and acknowledges applied progress, which is checkpointed
//! for crash recovery. Segment files wholly below the flush watermark
//! can be reclaimed.

use crate::buffer::{LogBuffer, StatsInner};
use crate::checkpoint::{Checkpoint, CheckpointStore, CollectionCheckpoint};
use crate::config::WalConfig;
use crate::error::WalError;
use crate::lsn::Lsn;
use crate::metadata::MetadataSource;
use crate::record::{RecordPayload, VectorSlice, WalRecord};
use crate::recovery::RecoveryScanner;
use crate::segment::SegmentScanner;
use crate::RECORD_HEADER_SIZE;
use parking_lot::{Condvar, Mutex};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Counter snapshot returned by [`WalManager::stats`].
#[derive(Debug, Clone, Copy, Default)]
pub struct WalStats {
    pub appended_records: u64,
    pub appended_bytes: u64,
    pub synthetic_flushes: u64,
    pub segments_created: u64,
    pub segments_removed: u64,
}

/// Per-collection progress.
#[derive(Debug, Clone, Default)]
struct CollectionProgress {
    /// Highest LSN the consumer has confirmed applied and persisted.
    flush_lsn: Lsn,
    /// Highest LSN written for this collection.
    wal_lsn: Lsn,
    /// Partition tag -> creation LSN floor.
    partitions: BTreeMap<String, Lsn>,
    /// Insert payload bytes appended since the last flush request.
    unflushed_bytes: u64,
}

/// The single outstanding flush request.
#[derive(Debug, Clone)]
struct FlushRequest {
    /// Empty means all collections.
    collection_id: String,
    lsn: Lsn,
    /// Set once the barrier has been handed to the consumer.
    dispatched: bool,
}

struct WalState {
    collections: BTreeMap<String, CollectionProgress>,
    flush: Option<FlushRequest>,
}

/// Write-ahead log manager.
pub struct WalManager {
    config: WalConfig,
    /// `None` when the WAL is disabled.
    buffer: Option<LogBuffer>,
    checkpoint: Option<CheckpointStore>,
    /// Progress table and flush slot behind one lock: the flush
    /// protocol needs them to move together.
    state: Mutex<WalState>,
    /// Serializes whole append batches so a multi-record batch is
    /// contiguous in the log and can be rolled back on failure.
    append_lock: Mutex<()>,
    data_ready: Condvar,
    /// Highest LSN handed out. Written under the state lock, read
    /// lock-free.
    last_applied: AtomicU64,
    /// Tail LSN at open: replay ends here, steady drain starts after.
    recovery_target: Lsn,
    closed: AtomicBool,
    stats: Arc<StatsInner>,
}

impl WalManager {
    /// Opens the WAL: loads the checkpoint, reconciles it against the
    /// metadata source, scans segments from the minimum flush
    /// watermark (truncating a torn tail), and positions the consumer
    /// cursor for replay.
    pub fn open(config: WalConfig, metadata: &dyn MetadataSource) -> Result<Self, WalError> {
        config.validate()?;

        if !config.enabled {
            tracing::info!("wal disabled; handing out synthetic lsns");
            return Ok(Self {
                config,
                buffer: None,
                checkpoint: None,
                state: Mutex::new(WalState {
                    collections: BTreeMap::new(),
                    flush: None,
                }),
                append_lock: Mutex::new(()),
                data_ready: Condvar::new(),
                last_applied: AtomicU64::new(0),
                recovery_target: Lsn::ZERO,
                closed: AtomicBool::new(false),
                stats: Arc::new(StatsInner::default()),
            });
        }

        std::fs::create_dir_all(&config.dir)?;
        let store = CheckpointStore::new(&config.dir);
        let mut checkpoint = store.load()?;

        // Reconcile: forget collections the cluster no longer has,
        // register live ones the checkpoint has never seen.
        let live = metadata.live_collections()?;
        let before = checkpoint.collections.len();
        checkpoint
            .collections
            .retain(|id, _| live.iter().any(|meta| meta.collection_id == *id));
        let dropped = before - checkpoint.collections.len();
        if dropped > 0 {
            tracing::info!(dropped, "dropped non-live collections from checkpoint");
        }
        for meta in &live {
            checkpoint
                .collections
                .entry(meta.collection_id.clone())
                .or_default();
        }

        // Everything below the minimum flush watermark is applied for
        // every collection; replay starts there.
        let min_flush = checkpoint
            .collections
            .values()
            .map(|c| c.flush_lsn)
            .min()
            .unwrap_or(Lsn::ZERO);

        let summary = RecoveryScanner::new(&config.dir, config.segment_size)
            .scan(min_flush.segment_id())?;

        if checkpoint.last_applied_lsn > summary.max_lsn {
            return Err(WalError::Corruption {
                offset: 0,
                reason: format!(
                    "checkpoint applied lsn {} is beyond the recovered tail {}",
                    checkpoint.last_applied_lsn, summary.max_lsn
                ),
            });
        }

        for (collection_id, entry) in checkpoint.collections.iter_mut() {
            // A re-created collection floors its own history: records
            // before the creation marker belong to the old incarnation.
            if let Some(created) = summary.collection_created.get(collection_id) {
                entry.flush_lsn = entry.flush_lsn.max(*created);
                entry.partitions.retain(|_, floor| *floor >= *created);
            }
            if let Some(max) = summary.collection_max.get(collection_id) {
                entry.wal_lsn = entry.wal_lsn.max(*max);
            }
            entry.wal_lsn = entry.wal_lsn.max(entry.flush_lsn);
            if let Some(floors) = summary.partition_floors.get(collection_id) {
                for (tag, lsn) in floors {
                    let floor = entry.partitions.entry(tag.clone()).or_insert(Lsn::ZERO);
                    *floor = (*floor).max(*lsn);
                }
            }
        }

        // Partitions the metadata service no longer lists lose their
        // floors; without a floor their records are skipped during
        // replay.
        for meta in &live {
            if let Some(entry) = checkpoint.collections.get_mut(&meta.collection_id) {
                let before = entry.partitions.len();
                entry
                    .partitions
                    .retain(|tag, _| meta.partitions.iter().any(|p| p == tag));
                if entry.partitions.len() < before {
                    tracing::info!(
                        collection = meta.collection_id.as_str(),
                        dropped = before - entry.partitions.len(),
                        "dropped non-live partition floors"
                    );
                }
            }
        }

        let last_applied = checkpoint.last_applied_lsn.max(summary.max_lsn);

        let oldest = SegmentScanner::list_segments(&config.dir)?
            .first()
            .copied()
            .unwrap_or(0);
        let read_start = if min_flush.segment_id() < oldest {
            Lsn::ZERO
        } else {
            min_flush
        };

        let stats = Arc::new(StatsInner::default());
        let buffer = LogBuffer::open(
            &config.dir,
            config.segment_size,
            config.buffer_size,
            read_start,
            summary.tail,
            Arc::clone(&stats),
        )?;

        let collections: BTreeMap<String, CollectionProgress> = checkpoint
            .collections
            .into_iter()
            .map(|(id, entry)| {
                (
                    id,
                    CollectionProgress {
                        flush_lsn: entry.flush_lsn,
                        wal_lsn: entry.wal_lsn,
                        partitions: entry.partitions,
                        unflushed_bytes: 0,
                    },
                )
            })
            .collect();

        tracing::info!(
            collections = collections.len(),
            last_applied = %last_applied,
            replay_from = %read_start,
            replay_to = %last_applied,
            "wal manager opened"
        );

        Ok(Self {
            config,
            buffer: Some(buffer),
            checkpoint: Some(store),
            state: Mutex::new(WalState {
                collections,
                flush: None,
            }),
            append_lock: Mutex::new(()),
            data_ready: Condvar::new(),
            last_applied: AtomicU64::new(last_applied.as_u64()),
            recovery_target: last_applied,
            closed: AtomicBool::new(false),
            stats,
        })
    }

    // ====== Producer API ======

    /// Registers a collection, writing a creation marker whose LSN
    /// floors the collection's history. Re-creating a collection
    /// resets its progress and partition floors.
    pub fn create_collection(&self, collection_id: &str) -> Result<Lsn, WalError> {
        self.ensure_open()?;
        if collection_id.is_empty() {
            return Err(WalError::InvalidArgument(
                "collection id must not be empty".into(),
            ));
        }

        let lsn = match &self.buffer {
            Some(buffer) => {
                let _append = self.append_lock.lock();
                buffer.append(&RecordPayload::create_collection(collection_id))?
            }
            None => self.bump_synthetic(),
        };

        let mut state = self.state.lock();
        let progress = state
            .collections
            .entry(collection_id.to_string())
            .or_default();
        progress.flush_lsn = lsn;
        progress.wal_lsn = lsn;
        progress.partitions.clear();
        progress.unflushed_bytes = 0;
        self.last_applied.fetch_max(lsn.as_u64(), Ordering::AcqRel);
        drop(state);
        self.data_ready.notify_one();

        tracing::info!(collection = collection_id, lsn = %lsn, "collection registered");
        Ok(lsn)
    }

    /// Registers a named partition, writing a creation marker whose
    /// LSN becomes the partition's replay floor.
    pub fn create_partition(
        &self,
        collection_id: &str,
        partition_tag: &str,
    ) -> Result<Lsn, WalError> {
        self.ensure_open()?;
        if partition_tag.is_empty() {
            return Err(WalError::InvalidArgument(
                "the default partition is implicit and cannot be created".into(),
            ));
        }
        {
            let state = self.state.lock();
            if !state.collections.contains_key(collection_id) {
                return Err(WalError::UnknownCollection(collection_id.to_string()));
            }
        }

        let lsn = match &self.buffer {
            Some(buffer) => {
                let _append = self.append_lock.lock();
                buffer.append(&RecordPayload::create_partition(collection_id, partition_tag))?
            }
            None => self.bump_synthetic(),
        };

        let mut state = self.state.lock();
        match state.collections.get_mut(collection_id) {
            Some(progress) => {
                progress.partitions.insert(partition_tag.to_string(), lsn);
                progress.wal_lsn = progress.wal_lsn.max(lsn);
            }
            None => {
                tracing::warn!(
                    collection = collection_id,
                    "collection dropped while creating partition"
                );
                return Err(WalError::UnknownCollection(collection_id.to_string()));
            }
        }
        self.last_applied.fetch_max(lsn.as_u64(), Ordering::AcqRel);
        drop(state);
        self.data_ready.notify_one();

        tracing::debug!(
            collection = collection_id,
            partition = partition_tag,
            lsn = %lsn,
            "partition registered"
        );
        Ok(lsn)
    }

    /// Forgets a collection. Its records still in the log are skipped
    /// during replay. Idempotent.
    pub fn drop_collection(&self, collection_id: &str) -> Result<(), WalError> {
        self.ensure_open()?;
        let mut state = self.state.lock();
        if state.collections.remove(collection_id).is_some() {
            tracing::info!(collection = collection_id, "collection dropped");
        }
        // A pending flush for the dropped collection can never be
        // acknowledged meaningfully.
        if let Some(req) = &state.flush {
            if !req.collection_id.is_empty() && req.collection_id == collection_id {
                tracing::warn!(
                    collection = collection_id,
                    "discarding pending flush for dropped collection"
                );
                state.flush = None;
            }
        }
        Ok(())
    }

    /// Forgets a partition's creation floor. Records of the partition
    /// still in the log are skipped during replay. Idempotent.
    pub fn drop_partition(
        &self,
        collection_id: &str,
        partition_tag: &str,
    ) -> Result<(), WalError> {
        self.ensure_open()?;
        let mut state = self.state.lock();
        if let Some(progress) = state.collections.get_mut(collection_id) {
            if progress.partitions.remove(partition_tag).is_some() {
                tracing::debug!(
                    collection = collection_id,
                    partition = partition_tag,
                    "partition dropped"
                );
            }
        }
        Ok(())
    }

    /// Appends an insert batch. Batches larger than the record size
    /// limit are split into multiple records; the returned LSN is the
    /// final record's, and the batch only becomes visible to the
    /// consumer as a whole. On failure the partially written records
    /// are truncated away and no LSN escapes.
    pub fn insert(
        &self,
        collection_id: &str,
        partition_tag: &str,
        ids: &[i64],
        vectors: VectorSlice<'_>,
    ) -> Result<Lsn, WalError> {
        self.ensure_open()?;
        if ids.is_empty() {
            return Err(WalError::InvalidArgument("insert batch is empty".into()));
        }
        if vectors.element_count() % ids.len() != 0 || vectors.element_count() / ids.len() == 0 {
            return Err(WalError::InvalidArgument(
                "vector data does not divide evenly across entities".into(),
            ));
        }
        {
            let state = self.state.lock();
            if !state.collections.contains_key(collection_id) {
                return Err(WalError::UnknownCollection(collection_id.to_string()));
            }
        }

        let Some(buffer) = &self.buffer else {
            let lsn = self.bump_synthetic();
            let mut state = self.state.lock();
            if let Some(progress) = state.collections.get_mut(collection_id) {
                progress.wal_lsn = progress.wal_lsn.max(lsn);
            }
            return Ok(lsn);
        };

        let per_entity = vectors.element_count() / ids.len();
        let per_entity_bytes = vectors.data_len() / ids.len();
        let overhead = RECORD_HEADER_SIZE + collection_id.len() + partition_tag.len();
        let per_entity_cost = 8 + per_entity_bytes;
        let limit = self.config.record_size_limit as usize;
        if overhead + per_entity_cost > limit {
            return Err(WalError::RecordTooLarge {
                size: overhead + per_entity_cost,
                max: limit,
            });
        }
        let max_entities = (limit - overhead) / per_entity_cost;

        let _append = self.append_lock.lock();
        let rollback_to = buffer.write_lsn();
        let mut final_lsn = Lsn::ZERO;
        let mut index = 0;
        while index < ids.len() {
            let end = (index + max_entities).min(ids.len());
            let payload = RecordPayload::insert(
                collection_id,
                partition_tag,
                &ids[index..end],
                vectors.slice_entities(index, end, per_entity),
            );
            match buffer.append(&payload) {
                Ok(lsn) => final_lsn = lsn,
                Err(e) => {
                    tracing::warn!(
                        collection = collection_id,
                        error = %e,
                        "insert batch failed; rolling back partial records"
                    );
                    buffer.reset_write(rollback_to)?;
                    return Err(e);
                }
            }
            index = end;
        }

        let mut state = self.state.lock();
        match state.collections.get_mut(collection_id) {
            Some(progress) => {
                progress.wal_lsn = progress.wal_lsn.max(final_lsn);
                progress.unflushed_bytes += vectors.data_len() as u64;
            }
            None => {
                tracing::warn!(collection = collection_id, "collection dropped during insert")
            }
        }
        self.last_applied
            .fetch_max(final_lsn.as_u64(), Ordering::AcqRel);
        self.maybe_auto_flush(&mut state, collection_id);
        drop(state);
        self.data_ready.notify_one();
        Ok(final_lsn)
    }

    /// Appends a delete-by-id batch, split like inserts when needed.
    pub fn delete_by_id(
        &self,
        collection_id: &str,
        partition_tag: &str,
        ids: &[i64],
    ) -> Result<Lsn, WalError> {
        self.ensure_open()?;
        if ids.is_empty() {
            return Err(WalError::InvalidArgument("delete batch is empty".into()));
        }
        {
            let state = self.state.lock();
            if !state.collections.contains_key(collection_id) {
                return Err(WalError::UnknownCollection(collection_id.to_string()));
            }
        }

        let Some(buffer) = &self.buffer else {
            let lsn = self.bump_synthetic();
            let mut state = self.state.lock();
            if let Some(progress) = state.collections.get_mut(collection_id) {
                progress.wal_lsn = progress.wal_lsn.max(lsn);
            }
            return Ok(lsn);
        };

        let overhead = RECORD_HEADER_SIZE + collection_id.len() + partition_tag.len();
        let limit = self.config.record_size_limit as usize;
        if overhead + 8 > limit {
            return Err(WalError::RecordTooLarge {
                size: overhead + 8,
                max: limit,
            });
        }
        let max_entities = (limit - overhead) / 8;

        let _append = self.append_lock.lock();
        let rollback_to = buffer.write_lsn();
        let mut final_lsn = Lsn::ZERO;
        let mut index = 0;
        while index < ids.len() {
            let end = (index + max_entities).min(ids.len());
            let payload = RecordPayload::delete(collection_id, partition_tag, &ids[index..end]);
            match buffer.append(&payload) {
                Ok(lsn) => final_lsn = lsn,
                Err(e) => {
                    tracing::warn!(
                        collection = collection_id,
                        error = %e,
                        "delete batch failed; rolling back partial records"
                    );
                    buffer.reset_write(rollback_to)?;
                    return Err(e);
                }
            }
            index = end;
        }

        let mut state = self.state.lock();
        if let Some(progress) = state.collections.get_mut(collection_id) {
            progress.wal_lsn = progress.wal_lsn.max(final_lsn);
        }
        self.last_applied
            .fetch_max(final_lsn.as_u64(), Ordering::AcqRel);
        drop(state);
        self.data_ready.notify_one();
        Ok(final_lsn)
    }

    /// Notice that a collection's content advanced to `lsn` without a
    /// record passing through this log (e.g. an index build). Raises
    /// the collection's write watermark so the next flush covers it.
    pub fn collection_updated(&self, collection_id: &str, lsn: Lsn) -> Result<(), WalError> {
        self.ensure_open()?;
        let mut state = self.state.lock();
        match state.collections.get_mut(collection_id) {
            Some(progress) => {
                progress.wal_lsn = progress.wal_lsn.max(lsn);
                Ok(())
            }
            None => Err(WalError::UnknownCollection(collection_id.to_string())),
        }
    }

    /// Requests a flush barrier for one collection, or for all when
    /// `collection_id` is empty. Returns the target LSN the barrier
    /// will carry, or `Lsn::ZERO` when there is nothing unflushed.
    ///
    /// Only one request can be outstanding; a newer request replaces
    /// an unserved older one (logged).
    pub fn flush(&self, collection_id: &str) -> Result<Lsn, WalError> {
        self.ensure_open()?;
        let mut state = self.state.lock();

        let target = if collection_id.is_empty() {
            state
                .collections
                .values()
                .filter(|p| p.wal_lsn > p.flush_lsn)
                .map(|p| p.wal_lsn)
                .max()
                .unwrap_or(Lsn::ZERO)
        } else {
            match state.collections.get(collection_id) {
                Some(p) if p.wal_lsn > p.flush_lsn => p.wal_lsn,
                Some(_) => Lsn::ZERO,
                None => return Err(WalError::UnknownCollection(collection_id.to_string())),
            }
        };
        if target.is_zero() {
            return Ok(Lsn::ZERO);
        }

        if self.buffer.is_none() {
            // Disabled mode: nothing to drain, the flush is instant.
            if collection_id.is_empty() {
                for progress in state.collections.values_mut() {
                    progress.flush_lsn = progress.wal_lsn;
                }
            } else if let Some(progress) = state.collections.get_mut(collection_id) {
                progress.flush_lsn = progress.wal_lsn;
            }
            return Ok(target);
        }

        if let Some(previous) = &state.flush {
            tracing::warn!(
                collection = previous.collection_id.as_str(),
                lsn = %previous.lsn,
                "replacing pending flush request"
            );
        }
        if collection_id.is_empty() {
            for progress in state.collections.values_mut() {
                progress.unflushed_bytes = 0;
            }
        } else if let Some(progress) = state.collections.get_mut(collection_id) {
            progress.unflushed_bytes = 0;
        }
        state.flush = Some(FlushRequest {
            collection_id: collection_id.to_string(),
            lsn: target,
            dispatched: false,
        });
        drop(state);
        self.data_ready.notify_one();

        tracing::debug!(collection = collection_id, target = %target, "flush requested");
        Ok(target)
    }

    // ====== Consumer API ======

    /// Hands the consumer the next record in LSN order, or a flush
    /// barrier once everything at or below the requested target has
    /// been surfaced. `Ok(None)` means caught up.
    pub fn next_record(&self) -> Result<Option<WalRecord>, WalError> {
        self.ensure_open()?;
        let Some(buffer) = &self.buffer else {
            return Ok(None);
        };

        // A barrier whose span is already consumed fires before any
        // newer record.
        if let Some(barrier) = self.take_ready_flush(buffer) {
            return Ok(Some(barrier));
        }

        let upper = self.last_applied_lsn();
        loop {
            match buffer.pop(upper)? {
                Some(raw) => {
                    if raw.is_marker() {
                        continue;
                    }
                    if let Some(record) = raw.into_record()? {
                        return Ok(Some(record));
                    }
                }
                None => {
                    if let Some(barrier) = self.take_ready_flush(buffer) {
                        return Ok(Some(barrier));
                    }
                    return Ok(None);
                }
            }
        }
    }

    /// Replays records that were written but not yet flushed before
    /// the last shutdown. Returns `Ok(None)` once the log tail as of
    /// open has been reached; steady-state draining takes over from
    /// there.
    pub fn next_recovery_record(&self) -> Result<Option<WalRecord>, WalError> {
        self.ensure_open()?;
        let Some(buffer) = &self.buffer else {
            return Ok(None);
        };
        let target = self.recovery_target;

        loop {
            if buffer.read_lsn() >= target {
                return Ok(None);
            }
            let Some(raw) = buffer.pop(target)? else {
                return Ok(None);
            };
            if raw.is_marker() {
                continue;
            }

            let skip = {
                let state = self.state.lock();
                match state.collections.get(&raw.collection_id) {
                    None => true,
                    Some(progress) => {
                        if raw.lsn <= progress.flush_lsn {
                            true
                        } else if !raw.partition_tag.is_empty() {
                            match progress.partitions.get(&raw.partition_tag) {
                                None => true,
                                Some(floor) => raw.lsn < *floor,
                            }
                        } else {
                            false
                        }
                    }
                }
            };
            if skip {
                tracing::debug!(
                    collection = raw.collection_id.as_str(),
                    lsn = %raw.lsn,
                    "replay skipped record"
                );
                continue;
            }

            if let Some(record) = raw.into_record()? {
                return Ok(Some(record));
            }
        }
    }

    /// Consumer acknowledgement that `collection_id` (all collections
    /// when empty) is applied and persisted up to `lsn`. Advances the
    /// flush watermark, clears a satisfied flush request, and writes
    /// the checkpoint.
    pub fn collection_flushed(&self, collection_id: &str, lsn: Lsn) -> Result<(), WalError> {
        self.ensure_open()?;
        let mut state = self.state.lock();

        if collection_id.is_empty() {
            for (id, progress) in state.collections.iter_mut() {
                Self::advance_flush(id, progress, lsn);
            }
        } else if let Some(progress) = state.collections.get_mut(collection_id) {
            Self::advance_flush(collection_id, progress, lsn);
        } else {
            tracing::warn!(
                collection = collection_id,
                "flush acknowledgement for unknown collection"
            );
        }

        if let Some(req) = &state.flush {
            if req.dispatched && req.collection_id == collection_id && lsn >= req.lsn {
                state.flush = None;
            }
        }

        let snapshot = self.checkpoint_snapshot(&state);
        drop(state);
        if let Some(store) = &self.checkpoint {
            store.save(&snapshot)?;
        }
        Ok(())
    }

    /// Deletes segment files wholly below `flushed`'s segment. The
    /// checkpoint is written first, so a crash in between never needs
    /// the removed files. Returns the number of files removed.
    pub fn remove_old_segments(&self, flushed: Lsn) -> Result<usize, WalError> {
        self.ensure_open()?;
        let Some(buffer) = &self.buffer else {
            return Ok(0);
        };

        let snapshot = {
            let state = self.state.lock();
            self.checkpoint_snapshot(&state)
        };
        if let Some(store) = &self.checkpoint {
            store.save(&snapshot)?;
        }
        buffer.remove_segments_below(flushed.segment_id())
    }

    /// Highest LSN handed out so far. Lock-free.
    pub fn last_applied_lsn(&self) -> Lsn {
        Lsn::from_u64(self.last_applied.load(Ordering::Acquire))
    }

    /// Parks the consumer until an append or flush request arrives or
    /// the timeout elapses. Returns true when there may be work.
    pub fn wait_for_data(&self, timeout: Duration) -> bool {
        let mut state = self.state.lock();
        if let Some(buffer) = &self.buffer {
            let flush_pending = state.flush.as_ref().map(|f| !f.dispatched).unwrap_or(false);
            if flush_pending || buffer.read_lsn() < self.last_applied_lsn() {
                return true;
            }
        }
        !self.data_ready.wait_for(&mut state, timeout).timed_out()
    }

    /// Writes a final checkpoint and marks the manager closed. Later
    /// calls fail with [`WalError::Closed`]. Idempotent.
    pub fn close(&self) -> Result<(), WalError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let snapshot = {
            let state = self.state.lock();
            self.checkpoint_snapshot(&state)
        };
        if let Some(store) = &self.checkpoint {
            store.save(&snapshot)?;
        }
        self.data_ready.notify_all();
        tracing::info!(last_applied = %self.last_applied_lsn(), "wal manager closed");
        Ok(())
    }

    /// Counter snapshot.
    pub fn stats(&self) -> WalStats {
        WalStats {
            appended_records: self.stats.appended_records.load(Ordering::Relaxed),
            appended_bytes: self.stats.appended_bytes.load(Ordering::Relaxed),
            synthetic_flushes: self.stats.synthetic_flushes.load(Ordering::Relaxed),
            segments_created: self.stats.segments_created.load(Ordering::Relaxed),
            segments_removed: self.stats.segments_removed.load(Ordering::Relaxed),
        }
    }

    // ====== Internals ======

    fn ensure_open(&self) -> Result<(), WalError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(WalError::Closed);
        }
        Ok(())
    }

    /// Disabled-mode LSN: unique and increasing, backed by nothing.
    fn bump_synthetic(&self) -> Lsn {
        Lsn::from_u64(self.last_applied.fetch_add(1, Ordering::AcqRel) + 1)
    }

    /// Emits the pending flush barrier once the read cursor has passed
    /// its target. At most once per request.
    fn take_ready_flush(&self, buffer: &LogBuffer) -> Option<WalRecord> {
        let mut state = self.state.lock();
        let req = state.flush.as_mut()?;
        if req.dispatched || buffer.read_lsn() < req.lsn {
            return None;
        }
        req.dispatched = true;
        let barrier = WalRecord::Flush {
            lsn: req.lsn,
            collection_id: req.collection_id.clone(),
        };
        self.stats.synthetic_flushes.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            collection = req.collection_id.as_str(),
            lsn = %req.lsn,
            "flush barrier dispatched"
        );
        Some(barrier)
    }

    fn advance_flush(collection_id: &str, progress: &mut CollectionProgress, lsn: Lsn) {
        let capped = lsn.min(progress.wal_lsn);
        if capped < lsn {
            tracing::warn!(
                collection = collection_id,
                ack = %lsn,
                wal = %progress.wal_lsn,
                "flush acknowledgement beyond write watermark; clamping"
            );
        }
        progress.flush_lsn = progress.flush_lsn.max(capped);
    }

    fn maybe_auto_flush(&self, state: &mut WalState, collection_id: &str) {
        if self.config.auto_flush_insert_bytes == 0 || state.flush.is_some() {
            return;
        }
        let Some(progress) = state.collections.get_mut(collection_id) else {
            return;
        };
        if progress.unflushed_bytes < self.config.auto_flush_insert_bytes
            || progress.wal_lsn <= progress.flush_lsn
        {
            return;
        }
        let lsn = progress.wal_lsn;
        progress.unflushed_bytes = 0;
        state.flush = Some(FlushRequest {
            collection_id: collection_id.to_string(),
            lsn,
            dispatched: false,
        });
        tracing::debug!(collection = collection_id, target = %lsn, "auto flush triggered");
    }

    fn checkpoint_snapshot(&self, state: &WalState) -> Checkpoint {
        Checkpoint {
            last_applied_lsn: self.last_applied_lsn(),
            collections: state
                .collections
                .iter()
                .map(|(id, progress)| {
                    (
                        id.clone(),
                        CollectionCheckpoint {
                            flush_lsn: progress.flush_lsn,
                            wal_lsn: progress.wal_lsn,
                            partitions: progress.partitions.clone(),
                        },
                    )
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::StaticMetadata;
    use crate::record::VectorData;
    use crate::segment::SegmentScanner;
    use std::path::Path;
    use tempfile::TempDir;

    fn config(dir: &Path) -> WalConfig {
        WalConfig::new(dir)
            .with_segment_size(64 * 1024)
            .with_buffer_size(32 * 1024)
            .with_record_size_limit(16 * 1024)
    }

    fn open(dir: &Path) -> WalManager {
        WalManager::open(config(dir), &StaticMetadata::new()).unwrap()
    }

    fn drain(manager: &WalManager) -> Vec<WalRecord> {
        let mut records = Vec::new();
        while let Some(record) = manager.next_record().unwrap() {
            records.push(record);
        }
        records
    }

    fn replay(manager: &WalManager) -> Vec<WalRecord> {
        let mut records = Vec::new();
        while let Some(record) = manager.next_recovery_record().unwrap() {
            records.push(record);
        }
        records
    }

    #[test]
    fn test_create_insert_flush_ack_cycle() {
        let dir = TempDir::new().unwrap();
        let manager = open(dir.path());

        let created = manager.create_collection("vectors").unwrap();
        let inserted = manager
            .insert(
                "vectors",
                "",
                &[1, 2],
                VectorSlice::Float32(&[0.1, 0.2, 0.3, 0.4]),
            )
            .unwrap();
        assert!(inserted > created);
        assert_eq!(manager.last_applied_lsn(), inserted);

        let target = manager.flush("vectors").unwrap();
        assert_eq!(target, inserted);

        let records = drain(&manager);
        assert_eq!(records.len(), 2);
        match &records[0] {
            WalRecord::Insert { lsn, ids, vectors, .. } => {
                assert_eq!(*lsn, inserted);
                assert_eq!(ids, &vec![1, 2]);
                assert_eq!(*vectors, VectorData::Float32(vec![0.1, 0.2, 0.3, 0.4]));
            }
            other => panic!("expected insert, got {:?}", other),
        }
        match &records[1] {
            WalRecord::Flush { lsn, collection_id } => {
                assert_eq!(*lsn, target);
                assert_eq!(collection_id, "vectors");
            }
            other => panic!("expected flush barrier, got {:?}", other),
        }

        manager.collection_flushed("vectors", target).unwrap();
        assert_eq!(manager.flush("vectors").unwrap(), Lsn::ZERO);
        assert_eq!(manager.last_applied_lsn(), inserted);
    }

    #[test]
    fn test_insert_unknown_collection() {
        let dir = TempDir::new().unwrap();
        let manager = open(dir.path());
        let result = manager.insert("ghost", "", &[1], VectorSlice::Float32(&[1.0]));
        assert!(matches!(result, Err(WalError::UnknownCollection(_))));
    }

    #[test]
    fn test_insert_argument_validation() {
        let dir = TempDir::new().unwrap();
        let manager = open(dir.path());
        manager.create_collection("c1").unwrap();

        let uneven = manager.insert("c1", "", &[1, 2], VectorSlice::Float32(&[1.0, 2.0, 3.0]));
        assert!(matches!(uneven, Err(WalError::InvalidArgument(_))));

        let empty = manager.insert("c1", "", &[], VectorSlice::Float32(&[]));
        assert!(matches!(empty, Err(WalError::InvalidArgument(_))));
    }

    #[test]
    fn test_drain_preserves_order_and_content() {
        let dir = TempDir::new().unwrap();
        let manager = open(dir.path());
        manager.create_collection("c1").unwrap();

        let mut expected = Vec::new();
        for i in 0..3i64 {
            let ids = vec![i * 10, i * 10 + 1];
            let vectors = vec![i as f32, i as f32 + 0.5];
            let lsn = manager
                .insert("c1", "p", &ids, VectorSlice::Float32(&vectors))
                .unwrap();
            expected.push((lsn, ids, vectors));
        }
        let deleted = manager.delete_by_id("c1", "p", &[99]).unwrap();

        let records = drain(&manager);
        assert_eq!(records.len(), 4);
        for (record, (lsn, ids, vectors)) in records.iter().zip(&expected) {
            match record {
                WalRecord::Insert {
                    lsn: got_lsn,
                    ids: got_ids,
                    vectors: got_vectors,
                    partition_tag,
                    ..
                } => {
                    assert_eq!(got_lsn, lsn);
                    assert_eq!(got_ids, ids);
                    assert_eq!(*got_vectors, VectorData::Float32(vectors.clone()));
                    assert_eq!(partition_tag, "p");
                }
                other => panic!("expected insert, got {:?}", other),
            }
        }
        match &records[3] {
            WalRecord::Delete { lsn, ids, .. } => {
                assert_eq!(*lsn, deleted);
                assert_eq!(ids, &vec![99]);
            }
            other => panic!("expected delete, got {:?}", other),
        }
    }

    #[test]
    fn test_flush_all_collections() {
        let dir = TempDir::new().unwrap();
        let manager = open(dir.path());
        manager.create_collection("a").unwrap();
        manager.create_collection("b").unwrap();
        manager.insert("a", "", &[1], VectorSlice::Float32(&[1.0])).unwrap();
        let last = manager.insert("b", "", &[2], VectorSlice::Float32(&[2.0])).unwrap();

        let target = manager.flush("").unwrap();
        assert_eq!(target, last);

        let records = drain(&manager);
        let barrier = records.last().unwrap();
        match barrier {
            WalRecord::Flush { lsn, collection_id } => {
                assert_eq!(*lsn, target);
                assert!(collection_id.is_empty());
            }
            other => panic!("expected flush barrier, got {:?}", other),
        }

        manager.collection_flushed("", target).unwrap();
        assert_eq!(manager.flush("").unwrap(), Lsn::ZERO);
    }

    #[test]
    fn test_flush_with_nothing_pending() {
        let dir = TempDir::new().unwrap();
        let manager = open(dir.path());
        manager.create_collection("c1").unwrap();
        assert_eq!(manager.flush("c1").unwrap(), Lsn::ZERO);
        assert_eq!(manager.flush("").unwrap(), Lsn::ZERO);
        assert!(drain(&manager).is_empty());
    }

    #[test]
    fn test_crash_recovery_replays_unacked_suffix() {
        let dir = TempDir::new().unwrap();
        let mut lsns = Vec::new();
        {
            let manager = open(dir.path());
            manager.create_collection("vectors").unwrap();
            for i in 0..5i64 {
                lsns.push(
                    manager
                        .insert("vectors", "", &[i], VectorSlice::Float32(&[i as f32]))
                        .unwrap(),
                );
            }
            let target = manager.flush("vectors").unwrap();
            assert_eq!(target, lsns[4]);
            let records = drain(&manager);
            assert_eq!(records.len(), 6);
            // The consumer only got records up to lsns[2] durably
            // applied before the crash.
            manager.collection_flushed("vectors", lsns[2]).unwrap();
            // Dropped without close: simulates the crash.
        }

        let metadata = StaticMetadata::new().with_collection("vectors", &[]);
        let manager = WalManager::open(config(dir.path()), &metadata).unwrap();
        assert_eq!(manager.last_applied_lsn(), lsns[4]);

        let replayed = replay(&manager);
        let replayed_lsns: Vec<Lsn> = replayed.iter().map(|r| r.lsn()).collect();
        assert_eq!(replayed_lsns, vec![lsns[3], lsns[4]]);
        assert!(manager.next_recovery_record().unwrap().is_none());
        assert!(manager.next_record().unwrap().is_none());
    }

    #[test]
    fn test_recovery_without_any_checkpoint() {
        let dir = TempDir::new().unwrap();
        let mut lsns = Vec::new();
        {
            let manager = open(dir.path());
            manager.create_collection("c1").unwrap();
            for i in 0..3i64 {
                lsns.push(
                    manager
                        .insert("c1", "", &[i], VectorSlice::Float32(&[i as f32]))
                        .unwrap(),
                );
            }
        }

        let metadata = StaticMetadata::new().with_collection("c1", &[]);
        let manager = WalManager::open(config(dir.path()), &metadata).unwrap();
        let replayed = replay(&manager);
        let replayed_lsns: Vec<Lsn> = replayed.iter().map(|r| r.lsn()).collect();
        assert_eq!(replayed_lsns, lsns);
    }

    #[test]
    fn test_recovery_skips_dropped_collection() {
        let dir = TempDir::new().unwrap();
        {
            let manager = open(dir.path());
            manager.create_collection("keep").unwrap();
            manager.create_collection("gone").unwrap();
            manager.insert("keep", "", &[1], VectorSlice::Float32(&[1.0])).unwrap();
            manager.insert("gone", "", &[2], VectorSlice::Float32(&[2.0])).unwrap();
        }

        let metadata = StaticMetadata::new().with_collection("keep", &[]);
        let manager = WalManager::open(config(dir.path()), &metadata).unwrap();
        let replayed = replay(&manager);
        assert_eq!(replayed.len(), 1);
        assert_eq!(replayed[0].collection_id(), "keep");
    }

    #[test]
    fn test_partition_floor_filters_prior_incarnation() {
        let dir = TempDir::new().unwrap();
        let old_insert;
        let new_insert;
        {
            let manager = open(dir.path());
            manager.create_collection("c1").unwrap();
            manager.create_partition("c1", "p").unwrap();
            old_insert = manager
                .insert("c1", "p", &[1], VectorSlice::Float32(&[1.0]))
                .unwrap();
            manager.drop_partition("c1", "p").unwrap();
            manager.create_partition("c1", "p").unwrap();
            new_insert = manager
                .insert("c1", "p", &[2], VectorSlice::Float32(&[2.0]))
                .unwrap();
        }
        assert!(new_insert > old_insert);

        let metadata = StaticMetadata::new().with_collection("c1", &["p"]);
        let manager = WalManager::open(config(dir.path()), &metadata).unwrap();
        let replayed = replay(&manager);
        let replayed_lsns: Vec<Lsn> = replayed.iter().map(|r| r.lsn()).collect();
        assert_eq!(replayed_lsns, vec![new_insert]);
    }

    #[test]
    fn test_recovery_skips_partition_dropped_before_checkpoint() {
        let dir = TempDir::new().unwrap();
        // Small segments so the partition marker falls below the scan
        // start and only the checkpoint (which no longer has the
        // floor) speaks for the partition.
        let cfg = WalConfig::new(dir.path())
            .with_segment_size(256)
            .with_buffer_size(4 * 1024)
            .with_record_size_limit(200);
        {
            let manager = WalManager::open(cfg.clone(), &StaticMetadata::new()).unwrap();
            manager.create_collection("c1").unwrap();
            manager.create_partition("c1", "q").unwrap();
            manager.insert("c1", "q", &[1], VectorSlice::Float32(&[1.0])).unwrap();
            let target = manager.flush("c1").unwrap();
            drain(&manager);
            manager.collection_flushed("c1", target).unwrap();

            manager.drop_partition("c1", "q").unwrap();
            // Push the flush watermark into a later segment.
            let mut last = Lsn::ZERO;
            while last.segment_id() < 3 {
                last = manager
                    .insert("c1", "", &[7], VectorSlice::Float32(&[7.0]))
                    .unwrap();
            }
            let target = manager.flush("c1").unwrap();
            drain(&manager);
            manager.collection_flushed("c1", target).unwrap();

            // Stray write into the dropped partition, then crash.
            manager.insert("c1", "q", &[8], VectorSlice::Float32(&[8.0])).unwrap();
            manager.insert("c1", "", &[9], VectorSlice::Float32(&[9.0])).unwrap();
        }

        let metadata = StaticMetadata::new().with_collection("c1", &[]);
        let manager = WalManager::open(cfg, &metadata).unwrap();
        let replayed = replay(&manager);
        assert!(!replayed.is_empty());
        for record in &replayed {
            match record {
                WalRecord::Insert { partition_tag, ids, .. } => {
                    assert_ne!(partition_tag, "q");
                    assert_eq!(ids, &vec![9]);
                }
                other => panic!("unexpected record: {:?}", other),
            }
        }
    }

    #[test]
    fn test_recovery_drops_floor_for_missing_partition() {
        let dir = TempDir::new().unwrap();
        let keep;
        {
            let manager = open(dir.path());
            manager.create_collection("c1").unwrap();
            manager.create_partition("c1", "p1").unwrap();
            manager.create_partition("c1", "p2").unwrap();
            keep = manager
                .insert("c1", "p1", &[1], VectorSlice::Float32(&[1.0]))
                .unwrap();
            manager
                .insert("c1", "p2", &[2], VectorSlice::Float32(&[2.0]))
                .unwrap();
        }

        // The metadata service lists only p1 now; p2's floor must not
        // survive the restart even though its marker sits in the scan
        // window.
        let metadata = StaticMetadata::new().with_collection("c1", &["p1"]);
        let manager = WalManager::open(config(dir.path()), &metadata).unwrap();
        let replayed = replay(&manager);
        let replayed_lsns: Vec<Lsn> = replayed.iter().map(|r| r.lsn()).collect();
        assert_eq!(replayed_lsns, vec![keep]);
    }

    #[test]
    fn test_concurrent_producers_get_unique_ordered_lsns() {
        let dir = TempDir::new().unwrap();
        let manager = Arc::new(open(dir.path()));
        manager.create_collection("c1").unwrap();

        let mut handles = Vec::new();
        for t in 0..4i64 {
            let manager = Arc::clone(&manager);
            handles.push(std::thread::spawn(move || {
                let mut lsns = Vec::new();
                for i in 0..25i64 {
                    let id = t * 1000 + i;
                    let lsn = manager
                        .insert("c1", "", &[id], VectorSlice::Float32(&[id as f32]))
                        .unwrap();
                    lsns.push(lsn);
                }
                lsns
            }));
        }

        let mut all: Vec<Lsn> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        assert_eq!(all.len(), 100);
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 100, "lsns must be unique");
        assert_eq!(manager.last_applied_lsn(), *all.last().unwrap());

        let records = drain(&manager);
        assert_eq!(records.len(), 100);
        for pair in records.windows(2) {
            assert!(pair[0].lsn() < pair[1].lsn());
        }
    }

    #[test]
    fn test_remove_old_segments() {
        let dir = TempDir::new().unwrap();
        let cfg = WalConfig::new(dir.path())
            .with_segment_size(256)
            .with_buffer_size(4 * 1024)
            .with_record_size_limit(200);
        let manager = WalManager::open(cfg.clone(), &StaticMetadata::new()).unwrap();
        manager.create_collection("c1").unwrap();

        let mut last = Lsn::ZERO;
        while last.segment_id() < 4 {
            last = manager
                .insert("c1", "", &[1], VectorSlice::Float32(&[1.0]))
                .unwrap();
        }
        let target = manager.flush("c1").unwrap();
        let records = drain(&manager);
        assert!(matches!(records.last(), Some(WalRecord::Flush { .. })));
        manager.collection_flushed("c1", target).unwrap();

        let removed = manager.remove_old_segments(target).unwrap();
        assert!(removed > 0);
        let remaining = SegmentScanner::list_segments(dir.path()).unwrap();
        assert_eq!(remaining.first().copied(), Some(target.segment_id()));
        drop(manager);

        // Reopen: nothing to replay, and the log keeps going.
        let metadata = StaticMetadata::new().with_collection("c1", &[]);
        let manager = WalManager::open(cfg, &metadata).unwrap();
        assert!(replay(&manager).is_empty());
        let next = manager
            .insert("c1", "", &[2], VectorSlice::Float32(&[2.0]))
            .unwrap();
        assert!(next > last);
    }

    #[test]
    fn test_disabled_mode() {
        let dir = TempDir::new().unwrap();
        let cfg = config(dir.path()).with_enabled(false);
        let manager = WalManager::open(cfg, &StaticMetadata::new()).unwrap();

        let created = manager.create_collection("c1").unwrap();
        let inserted = manager
            .insert("c1", "", &[1], VectorSlice::Float32(&[1.0]))
            .unwrap();
        assert!(inserted > created);
        assert_eq!(manager.last_applied_lsn(), inserted);

        assert!(manager.next_record().unwrap().is_none());
        assert_eq!(manager.flush("c1").unwrap(), inserted);
        assert_eq!(manager.flush("c1").unwrap(), Lsn::ZERO);

        // Nothing touched disk.
        assert!(SegmentScanner::list_segments(dir.path()).unwrap().is_empty());
        assert!(!dir.path().join(crate::checkpoint::CHECKPOINT_FILE).exists());
    }

    #[test]
    fn test_disabled_concurrent_inserts_keep_watermark() {
        let dir = TempDir::new().unwrap();
        let cfg = config(dir.path()).with_enabled(false);
        let manager = Arc::new(WalManager::open(cfg, &StaticMetadata::new()).unwrap());
        manager.create_collection("c1").unwrap();

        let mut handles = Vec::new();
        for _ in 0..4 {
            let manager = Arc::clone(&manager);
            handles.push(std::thread::spawn(move || {
                for i in 0..50i64 {
                    manager
                        .insert("c1", "", &[i], VectorSlice::Float32(&[i as f32]))
                        .unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        // The write watermark is the highest synthetic LSN handed out,
        // no matter which producer's bookkeeping ran last.
        assert_eq!(manager.flush("c1").unwrap(), manager.last_applied_lsn());
    }

    #[test]
    fn test_closed_manager_rejects_operations() {
        let dir = TempDir::new().unwrap();
        let manager = open(dir.path());
        manager.create_collection("c1").unwrap();
        manager.close().unwrap();
        manager.close().unwrap();

        let result = manager.insert("c1", "", &[1], VectorSlice::Float32(&[1.0]));
        assert!(matches!(result, Err(WalError::Closed)));
        assert!(matches!(manager.flush("c1"), Err(WalError::Closed)));
    }

    #[test]
    fn test_newer_flush_request_replaces_older() {
        let dir = TempDir::new().unwrap();
        let manager = open(dir.path());
        manager.create_collection("a").unwrap();
        manager.create_collection("b").unwrap();
        manager.insert("a", "", &[1], VectorSlice::Float32(&[1.0])).unwrap();
        let last = manager.insert("b", "", &[2], VectorSlice::Float32(&[2.0])).unwrap();

        manager.flush("a").unwrap();
        let target_b = manager.flush("b").unwrap();
        assert_eq!(target_b, last);

        let records = drain(&manager);
        let barriers: Vec<&WalRecord> = records
            .iter()
            .filter(|r| matches!(r, WalRecord::Flush { .. }))
            .collect();
        assert_eq!(barriers.len(), 1);
        assert_eq!(barriers[0].collection_id(), "b");
    }

    #[test]
    fn test_collection_updated_feeds_flush_target() {
        let dir = TempDir::new().unwrap();
        let manager = open(dir.path());
        manager.create_collection("c1").unwrap();
        manager.create_collection("c2").unwrap();
        let lsn = manager
            .insert("c1", "", &[1], VectorSlice::Float32(&[1.0]))
            .unwrap();

        // c2's content advanced externally up to `lsn`.
        manager.collection_updated("c2", lsn).unwrap();
        let target = manager.flush("c2").unwrap();
        assert_eq!(target, lsn);

        let records = drain(&manager);
        match records.last() {
            Some(WalRecord::Flush { lsn: got, collection_id }) => {
                assert_eq!(*got, target);
                assert_eq!(collection_id, "c2");
            }
            other => panic!("expected flush barrier, got {:?}", other),
        }

        let unknown = manager.collection_updated("ghost", lsn);
        assert!(matches!(unknown, Err(WalError::UnknownCollection(_))));
    }

    #[test]
    fn test_auto_flush_trigger() {
        let dir = TempDir::new().unwrap();
        let cfg = config(dir.path()).with_auto_flush_insert_bytes(64);
        let manager = WalManager::open(cfg, &StaticMetadata::new()).unwrap();
        manager.create_collection("c1").unwrap();

        // 32 floats = 128 payload bytes, over the 64-byte trigger.
        let vectors: Vec<f32> = (0..32).map(|i| i as f32).collect();
        let ids: Vec<i64> = (0..32).collect();
        let lsn = manager
            .insert("c1", "", &ids, VectorSlice::Float32(&vectors))
            .unwrap();

        let records = drain(&manager);
        match records.last() {
            Some(WalRecord::Flush { lsn: got, collection_id }) => {
                assert_eq!(*got, lsn);
                assert_eq!(collection_id, "c1");
            }
            other => panic!("expected auto flush barrier, got {:?}", other),
        }
    }

    #[test]
    fn test_insert_batch_chunking() {
        let dir = TempDir::new().unwrap();
        let cfg = WalConfig::new(dir.path())
            .with_segment_size(64 * 1024)
            .with_buffer_size(4 * 1024)
            .with_record_size_limit(256);
        let manager = WalManager::open(cfg, &StaticMetadata::new()).unwrap();
        manager.create_collection("c1").unwrap();

        let ids: Vec<i64> = (0..100).collect();
        let vectors: Vec<f32> = (0..100).map(|i| i as f32).collect();
        let final_lsn = manager
            .insert("c1", "", &ids, VectorSlice::Float32(&vectors))
            .unwrap();
        assert_eq!(manager.last_applied_lsn(), final_lsn);

        let records = drain(&manager);
        assert!(records.len() > 1, "batch should have been split");

        let mut got_ids = Vec::new();
        let mut got_vectors = Vec::new();
        for record in &records {
            match record {
                WalRecord::Insert { ids, vectors: VectorData::Float32(v), .. } => {
                    // Every chunk respects the record size limit.
                    assert!(RECORD_HEADER_SIZE + 2 + ids.len() * 8 + v.len() * 4 <= 256);
                    got_ids.extend_from_slice(ids);
                    got_vectors.extend_from_slice(v);
                }
                other => panic!("expected insert, got {:?}", other),
            }
        }
        assert_eq!(got_ids, ids);
        assert_eq!(got_vectors, vectors);
        assert_eq!(records.last().unwrap().lsn(), final_lsn);
    }

    #[test]
    fn test_single_entity_over_record_limit() {
        let dir = TempDir::new().unwrap();
        let cfg = WalConfig::new(dir.path())
            .with_segment_size(64 * 1024)
            .with_buffer_size(4 * 1024)
            .with_record_size_limit(128);
        let manager = WalManager::open(cfg, &StaticMetadata::new()).unwrap();
        manager.create_collection("c1").unwrap();

        // One 64-dimensional vector: 256 payload bytes alone.
        let vector: Vec<f32> = (0..64).map(|i| i as f32).collect();
        let result = manager.insert("c1", "", &[1], VectorSlice::Float32(&vector));
        assert!(matches!(result, Err(WalError::RecordTooLarge { .. })));
    }

    #[test]
    fn test_overlong_flush_ack_is_clamped() {
        let dir = TempDir::new().unwrap();
        let manager = open(dir.path());
        manager.create_collection("c1").unwrap();
        let lsn = manager
            .insert("c1", "", &[1], VectorSlice::Float32(&[1.0]))
            .unwrap();

        // Buggy consumer acks far beyond anything written.
        let bogus = Lsn::new(lsn.segment_id() + 10, 0);
        manager.collection_flushed("c1", bogus).unwrap();

        // flush_lsn was clamped to wal_lsn, so new writes still flush.
        let next = manager
            .insert("c1", "", &[2], VectorSlice::Float32(&[2.0]))
            .unwrap();
        assert_eq!(manager.flush("c1").unwrap(), next);
    }

    #[test]
    fn test_wait_for_data() {
        let dir = TempDir::new().unwrap();
        let manager = Arc::new(open(dir.path()));
        manager.create_collection("c1").unwrap();

        // Data already pending: returns immediately.
        manager.insert("c1", "", &[1], VectorSlice::Float32(&[1.0])).unwrap();
        assert!(manager.wait_for_data(Duration::from_millis(10)));
        drain(&manager);

        // Empty log: a concurrent insert wakes the waiter.
        let producer = {
            let manager = Arc::clone(&manager);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(50));
                manager.insert("c1", "", &[2], VectorSlice::Float32(&[2.0])).unwrap();
            })
        };
        assert!(manager.wait_for_data(Duration::from_secs(5)));
        producer.join().unwrap();
    }

    #[test]
    fn test_create_partition_requires_collection() {
        let dir = TempDir::new().unwrap();
        let manager = open(dir.path());
        let result = manager.create_partition("ghost", "p");
        assert!(matches!(result, Err(WalError::UnknownCollection(_))));

        manager.create_collection("c1").unwrap();
        let result = manager.create_partition("c1", "");
        assert!(matches!(result, Err(WalError::InvalidArgument(_))));
    }

    #[test]
    fn test_stats_track_activity() {
        let dir = TempDir::new().unwrap();
        let manager = open(dir.path());
        manager.create_collection("c1").unwrap();
        manager.insert("c1", "", &[1], VectorSlice::Float32(&[1.0])).unwrap();
        manager.flush("c1").unwrap();
        drain(&manager);

        let stats = manager.stats();
        assert_eq!(stats.appended_records, 2); // marker + insert
        assert!(stats.appended_bytes > 0);
        assert_eq!(stats.synthetic_flushes, 1);
        assert_eq!(stats.segments_created, 1);
    }
}
