//! WAL recovery scan.
//!
//! Runs once at open, before the buffer starts: walks the segment
//! files from the replay start point, rebuilds per-collection high
//! watermarks and partition create floors from what is actually on
//! disk, and truncates a torn tail left by a crash mid-write.
//!
//! Only the final segment may end mid-record: every earlier segment
//! was closed by a rotation, and appends sync before returning, so
//! damage anywhere else is real corruption and fails the open.

use crate::error::WalError;
use crate::lsn::{Lsn, SegmentId};
use crate::record::{RawRecord, RecordType};
use crate::segment::{Segment, SegmentScanner};
use bytes::BytesMut;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

const SCAN_CHUNK: usize = 256 * 1024;

/// What a recovery scan found.
#[derive(Debug, Default)]
pub struct RecoverySummary {
    /// Physical end of the log after truncation. `Lsn::ZERO` when no
    /// segments were scanned.
    pub tail: Lsn,
    /// Highest record LSN seen.
    pub max_lsn: Lsn,
    /// Per-collection highest record LSN.
    pub collection_max: BTreeMap<String, Lsn>,
    /// LSN of the last collection-creation marker per collection.
    pub collection_created: BTreeMap<String, Lsn>,
    /// Partition creation floors: collection -> tag -> marker LSN.
    /// A collection-creation marker resets the collection's floors;
    /// the last marker for a tag wins.
    pub partition_floors: BTreeMap<String, BTreeMap<String, Lsn>>,
    pub records_scanned: u64,
    pub segments_scanned: u64,
    pub bytes_truncated: u64,
}

/// Scans segment files to rebuild WAL state after a restart.
pub struct RecoveryScanner {
    dir: PathBuf,
    segment_size: u64,
}

impl RecoveryScanner {
    pub fn new(dir: impl AsRef<Path>, segment_size: u64) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            segment_size,
        }
    }

    /// Scans all segments with ids at or above `start_segment`.
    pub fn scan(&self, start_segment: SegmentId) -> Result<RecoverySummary, WalError> {
        let ids: Vec<SegmentId> = SegmentScanner::list_segments(&self.dir)?
            .into_iter()
            .filter(|id| *id >= start_segment)
            .collect();

        let mut summary = RecoverySummary::default();
        if ids.is_empty() {
            return Ok(summary);
        }

        for pair in ids.windows(2) {
            if pair[1] != pair[0] + 1 {
                return Err(WalError::SegmentMissing(pair[0] + 1));
            }
        }

        let last = *ids.last().unwrap_or(&0);
        for id in &ids {
            let end = self.scan_segment(*id, *id == last, &mut summary)?;
            summary.segments_scanned += 1;
            if *id == last {
                summary.tail = Lsn::new(*id, end);
            }
        }

        tracing::info!(
            segments = summary.segments_scanned,
            records = summary.records_scanned,
            tail = %summary.tail,
            bytes_truncated = summary.bytes_truncated,
            "wal recovery scan complete"
        );
        Ok(summary)
    }

    /// Scans one segment, returning the offset of the last complete
    /// record's end.
    fn scan_segment(
        &self,
        segment_id: SegmentId,
        is_last: bool,
        summary: &mut RecoverySummary,
    ) -> Result<u64, WalError> {
        let mut segment = Segment::open(&self.dir, segment_id, self.segment_size)?;
        let file_len = segment.size();

        let mut buf = BytesMut::new();
        let mut consumed = 0u64;
        let mut offset = 0u64;

        let torn = loop {
            match RawRecord::decode(&mut buf, segment_id, offset) {
                Ok(Some(record)) => {
                    offset += record.disk_size() as u64;
                    Self::absorb(summary, &record);
                }
                Ok(None) => {
                    if consumed < file_len {
                        let chunk = segment.read_bytes(consumed, SCAN_CHUNK)?;
                        consumed += chunk.len() as u64;
                        buf.extend_from_slice(&chunk);
                        continue;
                    }
                    // End of file with leftover bytes: zero padding or
                    // a partial header.
                    break offset < file_len;
                }
                Err(e) => {
                    if is_last {
                        tracing::debug!(segment = segment_id, offset, error = %e, "torn tail");
                        break true;
                    }
                    return Err(e);
                }
            }
        };

        if torn {
            if !is_last {
                return Err(WalError::Corruption {
                    offset,
                    reason: format!("trailing bytes in non-final segment {}", segment_id),
                });
            }
            let dropped = file_len - offset;
            segment.truncate_at(offset)?;
            summary.bytes_truncated += dropped;
            tracing::warn!(
                segment = segment_id,
                offset,
                dropped,
                "truncated torn wal tail"
            );
        }

        Ok(offset)
    }

    fn absorb(summary: &mut RecoverySummary, record: &RawRecord) {
        summary.records_scanned += 1;
        summary.max_lsn = summary.max_lsn.max(record.lsn);
        let max = summary
            .collection_max
            .entry(record.collection_id.clone())
            .or_insert(Lsn::ZERO);
        *max = (*max).max(record.lsn);

        match record.record_type {
            RecordType::CreateCollection => {
                summary
                    .collection_created
                    .insert(record.collection_id.clone(), record.lsn);
                summary
                    .partition_floors
                    .insert(record.collection_id.clone(), BTreeMap::new());
            }
            RecordType::CreatePartition => {
                summary
                    .partition_floors
                    .entry(record.collection_id.clone())
                    .or_default()
                    .insert(record.partition_tag.clone(), record.lsn);
            }
            _ => {}
        }
    }
}
