//! WAL configuration.

use crate::error::WalError;
use crate::lsn::Lsn;
use crate::{DEFAULT_BUFFER_SIZE, DEFAULT_RECORD_SIZE_LIMIT, DEFAULT_SEGMENT_SIZE};
use std::path::PathBuf;

/// WAL configuration.
#[derive(Debug, Clone)]
pub struct WalConfig {
    /// Directory to store WAL segments and the checkpoint file.
    pub dir: PathBuf,
    /// Whether the WAL is enabled. When disabled, appends hand out
    /// synthetic LSNs and nothing touches disk.
    pub enabled: bool,
    /// Maximum segment size before rotation.
    pub segment_size: u64,
    /// Capacity of the in-memory tail mirror the consumer reads from.
    pub buffer_size: u64,
    /// Maximum encoded size of a single record. Larger insert batches
    /// are split; a single entity over this limit is rejected.
    pub record_size_limit: u64,
    /// Unflushed insert bytes per collection that trigger an automatic
    /// flush request. 0 disables the trigger.
    pub auto_flush_insert_bytes: u64,
}

impl WalConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            enabled: true,
            segment_size: DEFAULT_SEGMENT_SIZE,
            buffer_size: DEFAULT_BUFFER_SIZE,
            record_size_limit: DEFAULT_RECORD_SIZE_LIMIT,
            auto_flush_insert_bytes: 0,
        }
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_segment_size(mut self, size: u64) -> Self {
        self.segment_size = size;
        self
    }

    pub fn with_buffer_size(mut self, size: u64) -> Self {
        self.buffer_size = size;
        self
    }

    pub fn with_record_size_limit(mut self, limit: u64) -> Self {
        self.record_size_limit = limit;
        self
    }

    pub fn with_auto_flush_insert_bytes(mut self, bytes: u64) -> Self {
        self.auto_flush_insert_bytes = bytes;
        self
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), WalError> {
        if self.dir.as_os_str().is_empty() {
            return Err(WalError::Config("wal dir must not be empty".into()));
        }
        if self.segment_size == 0 {
            return Err(WalError::Config("segment_size must be positive".into()));
        }
        if self.segment_size > Lsn::OFFSET_MASK {
            return Err(WalError::Config(format!(
                "segment_size {} exceeds the {}-bit offset space",
                self.segment_size,
                Lsn::OFFSET_BITS
            )));
        }
        if self.record_size_limit == 0 {
            return Err(WalError::Config(
                "record_size_limit must be positive".into(),
            ));
        }
        if self.record_size_limit > self.segment_size {
            return Err(WalError::Config(format!(
                "record_size_limit {} exceeds segment_size {}",
                self.record_size_limit, self.segment_size
            )));
        }
        if self.record_size_limit > crate::record::MAX_RECORD_SIZE as u64 {
            return Err(WalError::Config(format!(
                "record_size_limit {} exceeds the codec maximum {}",
                self.record_size_limit,
                crate::record::MAX_RECORD_SIZE
            )));
        }
        if self.buffer_size < self.record_size_limit {
            return Err(WalError::Config(format!(
                "buffer_size {} is smaller than record_size_limit {}",
                self.buffer_size, self.record_size_limit
            )));
        }
        Ok(())
    }
}
