//! # quiver-wal
//!
//! Write-ahead log for the Quiver vector engine.
//!
//! This crate provides a durable, append-only log with:
//! - Per-record checksums and position-stamped LSNs for corruption detection
//! - Segment-based file management with checkpointed reclamation
//! - Flush barriers coordinating the engine's memory-to-disk handoff
//! - Recovery and selective replay after a crash

mod buffer;

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod lsn;
pub mod manager;
pub mod metadata;
pub mod record;
pub mod recovery;
pub mod segment;

pub use checkpoint::{Checkpoint, CheckpointStore, CollectionCheckpoint};
pub use config::WalConfig;
pub use error::{MetadataError, WalError};
pub use lsn::{Lsn, SegmentId};
pub use manager::{WalManager, WalStats};
pub use metadata::{CollectionMeta, MetadataSource, StaticMetadata};
pub use record::{RecordType, VectorData, VectorSlice, WalRecord};
pub use recovery::{RecoveryScanner, RecoverySummary};
pub use segment::{Segment, SegmentScanner};

/// Default segment size (64 MiB).
pub const DEFAULT_SEGMENT_SIZE: u64 = 64 * 1024 * 1024;

/// Default size of the in-memory tail mirror (32 MiB).
pub const DEFAULT_BUFFER_SIZE: u64 = 32 * 1024 * 1024;

/// Default cap on a single record's size (16 MiB). Larger insert
/// batches are split across records.
pub const DEFAULT_RECORD_SIZE_LIMIT: u64 = 16 * 1024 * 1024;

/// WAL record header size in bytes.
pub const RECORD_HEADER_SIZE: usize = 32;
