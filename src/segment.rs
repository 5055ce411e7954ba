//! WAL segment files.
//!
//! The log is split into fixed-size segments:
//! - Rotation: a new segment when the current one cannot fit a record
//! - Reclamation: segments below the flush watermark can be deleted
//! - Recovery: segments can be scanned independently

use crate::error::WalError;
use crate::lsn::SegmentId;
use crate::record::RawRecord;
use crate::RECORD_HEADER_SIZE;
use bytes::BytesMut;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Segment file name format: NNNNNNNNNNNNNNNN.wal (16 hex digits)
pub fn segment_filename(id: SegmentId) -> String {
    format!("{:016x}.wal", id)
}

/// Parse segment ID from filename.
pub fn parse_segment_filename(name: &str) -> Option<SegmentId> {
    let name = name.strip_suffix(".wal")?;
    if name.len() != 16 {
        return None;
    }
    u64::from_str_radix(name, 16).ok()
}

/// A single WAL segment file.
pub struct Segment {
    id: SegmentId,
    path: PathBuf,
    file: File,
    size: u64,
    max_size: u64,
    sync_pending: bool,
}

impl Segment {
    /// Creates a new segment file. Fails if the file already exists.
    pub fn create(dir: &Path, id: SegmentId, max_size: u64) -> Result<Self, WalError> {
        let path = dir.join(segment_filename(id));
        let file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(&path)?;

        Ok(Self {
            id,
            path,
            file,
            size: 0,
            max_size,
            sync_pending: false,
        })
    }

    /// Opens an existing segment file for reading and appending.
    pub fn open(dir: &Path, id: SegmentId, max_size: u64) -> Result<Self, WalError> {
        let path = dir.join(segment_filename(id));
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let size = file.metadata()?.len();

        Ok(Self {
            id,
            path,
            file,
            size,
            max_size,
            sync_pending: false,
        })
    }

    /// Returns the segment ID.
    pub fn id(&self) -> SegmentId {
        self.id
    }

    /// Returns the segment file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the current size of the segment.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Returns whether the segment can fit a record of the given size.
    pub fn can_fit(&self, record_size: usize) -> bool {
        self.size + record_size as u64 <= self.max_size
    }

    /// Appends pre-encoded record bytes, returning the offset they
    /// landed at.
    pub fn append(&mut self, encoded: &[u8]) -> Result<u64, WalError> {
        let offset = self.size;

        self.file.seek(SeekFrom::End(0))?;
        self.file.write_all(encoded)?;
        self.size += encoded.len() as u64;
        self.sync_pending = true;

        Ok(offset)
    }

    /// Syncs the segment to disk.
    pub fn sync(&mut self) -> Result<(), WalError> {
        if self.sync_pending {
            self.file.sync_data()?;
            self.sync_pending = false;
        }
        Ok(())
    }

    /// Reads up to `max_len` bytes starting at `offset`. Short reads
    /// at the tail return whatever is there.
    pub fn read_bytes(&mut self, offset: u64, max_len: usize) -> Result<BytesMut, WalError> {
        self.file.seek(SeekFrom::Start(offset))?;

        let mut buf = BytesMut::with_capacity(max_len.min(64 * 1024));
        let mut chunk = vec![0u8; 64 * 1024];
        while buf.len() < max_len {
            let want = chunk.len().min(max_len - buf.len());
            match self.file.read(&mut chunk[..want]) {
                Ok(0) => break, // EOF
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
                Err(e) => return Err(e.into()),
            }
        }
        Ok(buf)
    }

    /// Reads and decodes a single record at the given offset.
    pub fn read_record_at(&mut self, offset: u64) -> Result<Option<RawRecord>, WalError> {
        self.file.seek(SeekFrom::Start(offset))?;

        let mut buf = BytesMut::with_capacity(RECORD_HEADER_SIZE + 4096);
        let mut chunk = vec![0u8; RECORD_HEADER_SIZE + 4096];

        loop {
            match self.file.read(&mut chunk) {
                Ok(0) => return Ok(None), // EOF
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
                Err(e) => return Err(e.into()),
            }

            match RawRecord::decode(&mut buf, self.id, offset)? {
                Some(record) => return Ok(Some(record)),
                None => continue, // Need more data
            }
        }
    }

    /// Truncates the segment at the given offset (recovery from
    /// partial writes, batch rollback).
    pub fn truncate_at(&mut self, offset: u64) -> Result<(), WalError> {
        self.file.set_len(offset)?;
        self.size = offset;
        self.file.seek(SeekFrom::End(0))?;
        self.file.sync_data()?;
        self.sync_pending = false;
        Ok(())
    }
}

/// Segment directory scanner.
pub struct SegmentScanner;

impl SegmentScanner {
    /// Lists all segment IDs in a directory, sorted ascending.
    pub fn list_segments(dir: &Path) -> Result<Vec<SegmentId>, WalError> {
        let mut segments = Vec::new();

        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(id) = parse_segment_filename(&name) {
                segments.push(id);
            }
        }

        segments.sort();
        Ok(segments)
    }

    /// Returns the latest segment ID, or None if no segments exist.
    pub fn latest_segment(dir: &Path) -> Result<Option<SegmentId>, WalError> {
        let segments = Self::list_segments(dir)?;
        Ok(segments.last().copied())
    }
}
