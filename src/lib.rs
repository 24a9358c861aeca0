//! raidcore - I/O Execution and Recovery Core for a Software RAID Engine
//!
//! Sits between a block-transport front end and a set of per-disk edges:
//! turns each incoming block request into correctly-ordered,
//! degradation-aware disk operations while keeping chunk-granular
//! rebuild/verify metadata crash-consistent.
//!
//! # Architecture
//!
//! ```text
//! block transport ──► RaidGroup ──► Stripe Lock Coordinator
//!                        │                │
//!                        ▼                ▼
//!                   IOTS State  ──► Chunk Metadata Store
//!                     Machine          (non-paged / paged)
//!                        │
//!                        ▼
//!                 algorithm library ──► per-disk edges
//! ```
//!
//! The journal remap/init recovery operation runs outside normal request
//! admission, directly against journal-reserved LBAs.
//!
//! # Modules
//!
//! - [`block`] - opcodes, status/qualifier, request descriptors
//! - [`chunk`] - chunk-granular needs-rebuild/verify metadata store
//! - [`direct`] - fast-path direct I/O
//! - [`edge`] - downstream collaborator ports
//! - [`error`] - error types
//! - [`geometry`] - group geometry and lock-range computation
//! - [`group`] - request admission, degraded state, quiesce/restart
//! - [`iots`] - the per-request state machine
//! - [`journal`] - journal remap/init recovery operation
//! - [`lock`] - stripe lock coordinator
//! - [`testutil`] - in-memory collaborator doubles for tests

pub mod block;
pub mod chunk;
pub mod direct;
pub mod edge;
pub mod error;
pub mod geometry;
pub mod group;
pub mod iots;
pub mod journal;
pub mod lock;
pub mod testutil;

// Re-export commonly used types
pub use block::{
    BlockQualifier, BlockRequest, BlockStatus, IoCompletion, Opcode, PositionBitmask,
    VerifyFlags, VerifyReason, LBA_INVALID,
};
pub use chunk::{ChunkEntry, ChunkStore, MAX_CHUNKS_PER_CALL};
pub use edge::{AlgorithmLibrary, DiskEdge, MetadataPersistence};
pub use error::{Error, Result};
pub use geometry::{RaidGeometry, RaidType, StripeRange};
pub use group::{GroupConfig, RaidGroup};
pub use journal::{JournalPassReport, JournalRecovery};
pub use lock::{LockMode, LockOutcome, StripeLockService};

// =============================================================================
// Tracing
// =============================================================================

/// Install a global tracing subscriber honoring `RUST_LOG`.
///
/// For embedders and tests; safe to call more than once, later calls are
/// no-ops.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}
