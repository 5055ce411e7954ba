//! Log buffer: bridges producers and the single consumer.
//!
//! The write side owns the tail segment plus an in-memory mirror of
//! its most recent bytes; the read side owns the consumer's cursor and
//! a chunked cache for segments the consumer is behind on. Appends are
//! synced before their LSN is returned. The read side never caches
//! bytes above the caller's visibility bound, which are the only bytes
//! a batch rollback may truncate; a rollback also bumps an epoch that
//! drops the read-side caches.
//!
//! Lock order is read -> write; the write lock is never held while
//! taking the read lock.

use crate::error::WalError;
use crate::lsn::{Lsn, SegmentId};
use crate::record::{peek_disk_size, RawRecord, RecordPayload};
use crate::segment::{segment_filename, Segment, SegmentScanner};
use bytes::{Buf, BytesMut};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Shared counters behind [`WalStats`](crate::manager::WalStats).
#[derive(Debug, Default)]
pub struct StatsInner {
    pub appended_records: AtomicU64,
    pub appended_bytes: AtomicU64,
    pub synthetic_flushes: AtomicU64,
    pub segments_created: AtomicU64,
    pub segments_removed: AtomicU64,
}

struct WriteState {
    segment: Segment,
    /// In-memory copy of the tail of the current segment, ending at
    /// the write cursor. A sliding window, not the whole segment.
    mirror: BytesMut,
    /// File offset of `mirror[0]`.
    mirror_base: u64,
}

struct ReadState {
    segment_id: SegmentId,
    offset: u64,
    /// Chunked cache of immutable bytes for reads behind the mirror.
    cache: BytesMut,
    cache_segment: SegmentId,
    cache_base: u64,
    /// Cached file length of a fully-written (non-tail) segment.
    known_len: Option<(SegmentId, u64)>,
    /// Value of [`LogBuffer::reset_epoch`] the caches were filled
    /// under.
    epoch: u64,
}

/// Producer/consumer record buffer over the segment files.
pub struct LogBuffer {
    dir: PathBuf,
    segment_size: u64,
    buffer_size: usize,
    write: Mutex<WriteState>,
    read: Mutex<ReadState>,
    /// Bumped by [`reset_write`](Self::reset_write); read caches filled
    /// under an older value are dropped.
    reset_epoch: AtomicU64,
    stats: Arc<StatsInner>,
}

impl LogBuffer {
    /// Opens the buffer over an already-recovered directory.
    ///
    /// `tail` is the physical end of the log (`Lsn::ZERO` when no
    /// segments exist) and must match the tail segment's file size;
    /// recovery truncates torn bytes before this is called.
    /// `read_start` positions the consumer cursor; `Lsn::ZERO` means
    /// the start of the oldest segment.
    pub fn open(
        dir: &Path,
        segment_size: u64,
        buffer_size: u64,
        read_start: Lsn,
        tail: Lsn,
        stats: Arc<StatsInner>,
    ) -> Result<Self, WalError> {
        let buffer_size = buffer_size as usize;

        let (segment, mirror, mirror_base) = if tail.is_zero() {
            let segment = Segment::create(dir, 1, segment_size)?;
            stats.segments_created.fetch_add(1, Ordering::Relaxed);
            (segment, BytesMut::new(), 0)
        } else {
            let mut segment = Segment::open(dir, tail.segment_id(), segment_size)?;
            if segment.size() != tail.offset() {
                return Err(WalError::Corruption {
                    offset: segment.size(),
                    reason: format!(
                        "tail segment {} has size {} but recovery ended at {}",
                        tail.segment_id(),
                        segment.size(),
                        tail.offset()
                    ),
                });
            }
            let base = segment.size().saturating_sub(buffer_size as u64);
            let mirror = segment.read_bytes(base, (segment.size() - base) as usize)?;
            (segment, mirror, base)
        };

        let (read_segment, read_offset) = if read_start.is_zero() {
            let oldest = SegmentScanner::list_segments(dir)?
                .first()
                .copied()
                .unwrap_or(segment.id());
            (oldest, 0)
        } else {
            (read_start.segment_id(), read_start.offset())
        };

        Ok(Self {
            dir: dir.to_path_buf(),
            segment_size,
            buffer_size,
            write: Mutex::new(WriteState {
                segment,
                mirror,
                mirror_base,
            }),
            read: Mutex::new(ReadState {
                segment_id: read_segment,
                offset: read_offset,
                cache: BytesMut::new(),
                cache_segment: 0,
                cache_base: 0,
                known_len: None,
                epoch: 0,
            }),
            reset_epoch: AtomicU64::new(0),
            stats,
        })
    }

    /// Appends one record. The returned LSN is durable: the bytes are
    /// written and synced before this returns.
    pub fn append(&self, payload: &RecordPayload<'_>) -> Result<Lsn, WalError> {
        let size = payload.disk_size();
        if size as u64 > self.segment_size {
            return Err(WalError::RecordTooLarge {
                size,
                max: self.segment_size as usize,
            });
        }

        let mut write = self.write.lock();

        if !write.segment.can_fit(size) {
            let next_id = write.segment.id() + 1;
            write.segment.sync()?;
            write.segment = Segment::create(&self.dir, next_id, self.segment_size)?;
            write.mirror.clear();
            write.mirror_base = 0;
            self.stats.segments_created.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(segment = next_id, "rotated to new wal segment");
        }

        let lsn = Lsn::new(write.segment.id(), write.segment.size() + size as u64);
        let encoded = payload.encode(lsn)?;
        write.segment.append(&encoded)?;
        write.segment.sync()?;

        write.mirror.extend_from_slice(&encoded);
        if write.mirror.len() > self.buffer_size {
            let drop = write.mirror.len() - self.buffer_size;
            write.mirror.advance(drop);
            write.mirror_base += drop as u64;
        }

        self.stats.appended_records.fetch_add(1, Ordering::Relaxed);
        self.stats
            .appended_bytes
            .fetch_add(encoded.len() as u64, Ordering::Relaxed);
        Ok(lsn)
    }

    /// Pops the next record whose LSN is at or below `upper`. Returns
    /// `Ok(None)` when the cursor has caught up with the visible part
    /// of the log. Bytes above `upper` are never read into the cache.
    pub fn pop(&self, upper: Lsn) -> Result<Option<RawRecord>, WalError> {
        let mut read = self.read.lock();

        loop {
            let epoch = self.reset_epoch.load(Ordering::Acquire);
            if read.epoch != epoch {
                read.cache.clear();
                read.cache_segment = 0;
                read.cache_base = 0;
                read.known_len = None;
                read.epoch = epoch;
            }
            if Lsn::new(read.segment_id, read.offset) >= upper {
                return Ok(None);
            }

            let (write_seg, write_off) = {
                let write = self.write.lock();
                (write.segment.id(), write.segment.size())
            };

            let record = if read.segment_id == write_seg {
                if read.offset >= write_off {
                    return Ok(None);
                }
                match self.record_from_mirror(&read)? {
                    Some(record) => record,
                    None => {
                        let limit = if upper.segment_id() == read.segment_id {
                            write_off.min(upper.offset())
                        } else {
                            write_off
                        };
                        self.record_from_cache(&mut read, limit)?
                    }
                }
            } else if read.segment_id < write_seg {
                let len = self.segment_len(&mut read)?;
                if read.offset >= len {
                    read.segment_id += 1;
                    read.offset = 0;
                    read.known_len = None;
                    continue;
                }
                let limit = if upper.segment_id() == read.segment_id {
                    len.min(upper.offset())
                } else {
                    len
                };
                self.record_from_cache(&mut read, limit)?
            } else {
                tracing::warn!(
                    read_segment = read.segment_id,
                    write_segment = write_seg,
                    "read cursor ahead of write cursor"
                );
                return Ok(None);
            };

            if record.lsn > upper {
                return Ok(None);
            }
            read.offset += record.disk_size() as u64;
            return Ok(Some(record));
        }
    }

    /// Fast path: copy the record out of the tail mirror. `Ok(None)`
    /// means the mirror cannot answer for this cursor (the window slid
    /// past it, or the tail rotated to another segment between the
    /// caller's cursor snapshot and this lock) and the cache path must
    /// be used instead.
    fn record_from_mirror(&self, read: &ReadState) -> Result<Option<RawRecord>, WalError> {
        let mut buf = {
            let write = self.write.lock();
            if write.segment.id() != read.segment_id || read.offset < write.mirror_base {
                return Ok(None);
            }
            let start = (read.offset - write.mirror_base) as usize;
            let window = match write.mirror.get(start..) {
                Some(window) if !window.is_empty() => window,
                _ => return Ok(None),
            };
            let size = match peek_disk_size(window) {
                Some(size) if size <= window.len() => size,
                _ => return Ok(None),
            };
            BytesMut::from(&window[..size])
        };

        RawRecord::decode(&mut buf, read.segment_id, read.offset)
    }

    /// Slow path: decode from the chunked cache, reloading it from the
    /// segment file when the cursor is outside the cached window.
    /// `limit` is the exclusive end of readable bytes in the segment;
    /// callers cap it at the visibility bound, so cached bytes can
    /// never be truncated by a later rollback.
    fn record_from_cache(&self, read: &mut ReadState, limit: u64) -> Result<RawRecord, WalError> {
        let mut reloaded = false;
        loop {
            if read.cache_segment == read.segment_id && read.offset >= read.cache_base {
                let start = (read.offset - read.cache_base) as usize;
                if start < read.cache.len() {
                    let window = &read.cache[start..];
                    if let Some(size) = peek_disk_size(window) {
                        if size <= window.len() {
                            let mut buf = BytesMut::from(&window[..size]);
                            if let Some(record) =
                                RawRecord::decode(&mut buf, read.segment_id, read.offset)?
                            {
                                return Ok(record);
                            }
                        }
                    }
                }
            }

            if reloaded {
                return Err(WalError::Corruption {
                    offset: read.offset,
                    reason: "torn record inside the durable region".into(),
                });
            }

            let want = (limit.saturating_sub(read.offset)).min(self.buffer_size as u64) as usize;
            if want == 0 {
                return Err(WalError::Corruption {
                    offset: read.offset,
                    reason: "read cursor at segment end with records pending".into(),
                });
            }
            let mut segment = Segment::open(&self.dir, read.segment_id, self.segment_size)?;
            read.cache = segment.read_bytes(read.offset, want)?;
            read.cache_base = read.offset;
            read.cache_segment = read.segment_id;
            reloaded = true;
        }
    }

    /// File length of the read cursor's segment (only called for
    /// segments the writer has moved past, so the length is final).
    fn segment_len(&self, read: &mut ReadState) -> Result<u64, WalError> {
        if let Some((segment_id, len)) = read.known_len {
            if segment_id == read.segment_id {
                return Ok(len);
            }
        }
        let path = self.dir.join(segment_filename(read.segment_id));
        let len = match std::fs::metadata(&path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(WalError::SegmentMissing(read.segment_id))
            }
            Err(e) => return Err(e.into()),
        };
        read.known_len = Some((read.segment_id, len));
        Ok(len)
    }

    /// Current write cursor as an LSN.
    pub fn write_lsn(&self) -> Lsn {
        let write = self.write.lock();
        Lsn::new(write.segment.id(), write.segment.size())
    }

    /// Current read cursor as an LSN.
    pub fn read_lsn(&self) -> Lsn {
        let read = self.read.lock();
        Lsn::new(read.segment_id, read.offset)
    }

    /// Rolls the write cursor back to `lsn`, truncating everything
    /// after it. Used when a multi-record batch fails mid-way; the
    /// consumer has never seen the truncated bytes because visibility
    /// is gated on the batch completing.
    pub fn reset_write(&self, lsn: Lsn) -> Result<(), WalError> {
        let mut write = self.write.lock();
        let current = write.segment.id();
        let target = lsn.segment_id();

        if target > current || (target == current && lsn.offset() > write.segment.size()) {
            return Err(WalError::InvalidArgument(format!(
                "reset target {} is ahead of the write cursor",
                lsn
            )));
        }

        if target == current {
            write.segment.truncate_at(lsn.offset())?;
            if lsn.offset() >= write.mirror_base {
                let keep = (lsn.offset() - write.mirror_base) as usize;
                write.mirror.truncate(keep);
            } else {
                write.mirror.clear();
                write.mirror_base = lsn.offset();
            }
        } else {
            for id in (target + 1)..=current {
                std::fs::remove_file(self.dir.join(segment_filename(id)))?;
            }
            let mut segment = Segment::open(&self.dir, target, self.segment_size)?;
            segment.truncate_at(lsn.offset())?;
            write.segment = segment;
            write.mirror.clear();
            write.mirror_base = lsn.offset();
        }

        // Read-side caches may hold the truncated bytes or the old
        // file lengths; force them to refill.
        self.reset_epoch.fetch_add(1, Ordering::Release);
        tracing::warn!(lsn = %lsn, "write cursor reset after failed batch");
        Ok(())
    }

    /// Deletes segment files with ids strictly below `bound`, never
    /// touching the segments the cursors are on. Returns the number of
    /// files removed.
    pub fn remove_segments_below(&self, bound: SegmentId) -> Result<usize, WalError> {
        let read = self.read.lock();
        let write_segment = {
            let write = self.write.lock();
            write.segment.id()
        };
        let effective = bound.min(read.segment_id).min(write_segment);

        let mut removed = 0;
        for id in SegmentScanner::list_segments(&self.dir)? {
            if id >= effective {
                break;
            }
            std::fs::remove_file(self.dir.join(segment_filename(id)))?;
            removed += 1;
        }

        if removed > 0 {
            self.stats
                .segments_removed
                .fetch_add(removed as u64, Ordering::Relaxed);
            tracing::info!(removed, below = effective, "removed old wal segments");
        }
        Ok(removed)
    }
}
