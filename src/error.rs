//! Error types for the RAID I/O execution core

use thiserror::Error;

use crate::block::{BlockQualifier, BlockStatus};

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the RAID I/O execution core
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Lock Errors
    // =========================================================================
    /// Stripe lock range exceeds the configured per-disk capacity
    #[error("stripe lock range last {last} exceeds configured capacity {capacity}")]
    LockRangeBeyondCapacity { last: u64, capacity: u64 },

    /// Lock request was dropped due to contention or quiesce
    #[error("stripe lock dropped for range [{first}, {last}]")]
    LockDropped { first: u64, last: u64 },

    /// Lock request was aborted by shutdown
    #[error("stripe lock aborted for range [{first}, {last}]")]
    LockAborted { first: u64, last: u64 },

    /// Lock request was cancelled by the client
    #[error("stripe lock cancelled for range [{first}, {last}]")]
    LockCancelled { first: u64, last: u64 },

    // =========================================================================
    // Metadata Errors
    // =========================================================================
    /// Chunk metadata I/O failed but may be retried
    #[error("chunk metadata I/O failed (retryable): {0}")]
    MetadataRetryable(String),

    /// Chunk metadata I/O failed and cannot be retried
    #[error("chunk metadata I/O failed (not retryable): {0}")]
    MetadataFatal(String),

    /// Paged needs-rebuild bits contain a position absent from the
    /// authoritative non-paged view
    #[error(
        "chunk metadata corruption at chunk {chunk_index}: \
         paged bits {paged_bits:#06x} not a subset of non-paged {nonpaged_bits:#06x}"
    )]
    MetadataInconsistent {
        chunk_index: u64,
        paged_bits: u16,
        nonpaged_bits: u16,
    },

    /// A chunk range exceeded the per-call batch maximum
    #[error("chunk range of {count} chunks exceeds per-call maximum {max}")]
    ChunkBatchTooLarge { count: u64, max: u64 },

    /// A request spans more chunks than an IOTS can carry
    #[error("request spans {count} chunks, beyond the IOTS maximum {max}")]
    TooManyChunks { count: u64, max: u64 },

    // =========================================================================
    // Data Validation Errors
    // =========================================================================
    /// Checksum mismatch detected on a fast-path read completion
    #[error("checksum validation failed for read at lba {lba}")]
    ChecksumMismatch { lba: u64 },

    /// LBA stamp mismatch detected on a fast-path read completion
    #[error("lba stamp mismatch at lba {lba}: stamped {stamped}")]
    LbaStampMismatch { lba: u64, stamped: u64 },

    // =========================================================================
    // Algorithm / Transport Errors
    // =========================================================================
    /// The algorithm library reported a failure for a sub-request
    #[error("algorithm dispatch failed: status {status:?} qualifier {qualifier:?}")]
    AlgorithmFailed {
        status: BlockStatus,
        qualifier: BlockQualifier,
    },

    /// A per-disk edge reported a transport failure
    #[error("disk edge {position} transport failure: {reason}")]
    EdgeFailure { position: u32, reason: String },

    // =========================================================================
    // Request Errors
    // =========================================================================
    /// The request descriptor failed admission validation
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The request was cancelled by the client or shutdown
    #[error("request aborted by client")]
    RequestAborted,

    /// The request exceeded its deadline
    #[error("request expired before completion")]
    RequestExpired,

    // =========================================================================
    // Recovery Errors
    // =========================================================================
    /// A journal recovery pass aborted before reaching capacity
    #[error("journal recovery pass aborted at checkpoint {checkpoint}: {reason}")]
    JournalPassAborted { checkpoint: u64, reason: String },

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether this error permits the wait-and-retry path for host I/O.
    ///
    /// Monitor-originated and metadata-targeted requests are denied this
    /// path by the state machine regardless of what this returns.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::LockDropped { .. } | Error::MetadataRetryable(_))
    }
}
