//! Flush-progress checkpoint persistence.
//!
//! The checkpoint records, per collection, how far the consumer has
//! flushed (`flush_lsn`), how far the log has been written (`wal_lsn`),
//! and the create-LSN floor of each named partition. Replay after a
//! crash starts from the minimum flush watermark and filters with
//! these values.

use crate::error::WalError;
use crate::lsn::Lsn;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};

/// Checkpoint file name inside the WAL directory.
pub const CHECKPOINT_FILE: &str = "wal.ckpt";

/// Durable per-collection progress.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionCheckpoint {
    /// Highest LSN the consumer has confirmed applied and persisted.
    pub flush_lsn: Lsn,
    /// Highest LSN written for this collection.
    pub wal_lsn: Lsn,
    /// Partition tag -> LSN of the partition's creation marker.
    /// Records of a named partition below its floor belong to an
    /// earlier incarnation and are skipped during replay.
    #[serde(default)]
    pub partitions: BTreeMap<String, Lsn>,
}

/// The full checkpoint document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Highest LSN handed out by the log.
    pub last_applied_lsn: Lsn,
    #[serde(default)]
    pub collections: BTreeMap<String, CollectionCheckpoint>,
}

/// Reads and writes the checkpoint file.
pub struct CheckpointStore {
    path: PathBuf,
    tmp_path: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: &Path) -> Self {
        Self {
            path: dir.join(CHECKPOINT_FILE),
            tmp_path: dir.join(format!("{}.tmp", CHECKPOINT_FILE)),
        }
    }

    /// Loads the checkpoint. A missing file is a first boot and yields
    /// the default; an unreadable file is corruption and fails loudly.
    pub fn load(&self) -> Result<Checkpoint, WalError> {
        if !self.path.exists() {
            return Ok(Checkpoint::default());
        }

        let file = File::open(&self.path)?;
        let reader = BufReader::new(file);
        serde_json::from_reader(reader).map_err(|e| WalError::Corruption {
            offset: 0,
            reason: format!("checkpoint file unreadable: {}", e),
        })
    }

    /// Saves the checkpoint atomically: write to a temp file, sync,
    /// rename over the old one. A crash never leaves a torn file.
    pub fn save(&self, checkpoint: &Checkpoint) -> Result<(), WalError> {
        let file = File::create(&self.tmp_path)?;
        serde_json::to_writer_pretty(&file, checkpoint)?;
        file.sync_all()?;
        fs::rename(&self.tmp_path, &self.path)?;

        tracing::debug!(
            last_applied_lsn = checkpoint.last_applied_lsn.as_u64(),
            collections = checkpoint.collections.len(),
            "checkpoint written"
        );
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
