//! Error types for rayo-db
//!
//! Taxonomy follows the execution pipeline: compile-time failures are
//! recoverable (the caller can supply a cardinality hint or change knobs),
//! allocation failures trigger eviction or a CPU retry, and per-row runtime
//! failures travel as `i32` codes in the error-code buffer rather than as
//! `Error` values. See [`crate::runtime`] for the code constants.

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// rayo-db error types
#[derive(Error, Debug)]
pub enum Error {
    /// Plan shape the code generator cannot lower
    #[error("unsupported plan: {0}")]
    PlanUnsupported(String),

    /// The memory descriptor cannot be satisfied on the chosen device
    #[error("query memory descriptor infeasible: {0}")]
    QmdInfeasible(String),

    /// Baseline hash needs a cardinality hint before an entry count can be fixed
    #[error("cardinality estimation required: group count may exceed {max_groups} entries")]
    CardinalityRequired {
        /// Configured baseline entry-count bound that was exceeded
        max_groups: usize,
    },

    /// Per-device byte budget exceeded; caller should retry on CPU
    #[error("query must run on CPU: {0}")]
    QueryMustRunOnCpu(String),

    /// Out of memory in a buffer-pool tier after eviction
    #[error("out of memory in {tier} tier: requested {requested} bytes")]
    OutOfMemory {
        /// Tier that could not satisfy the request
        tier: &'static str,
        /// Request size in bytes
        requested: usize,
    },

    /// Join hash table would exceed the 2B-entry limit
    #[error("too many hash entries: {0}")]
    TooManyHashEntries(u64),

    /// Caller requested a OneToOne layout but the inner side has duplicates
    #[error("one-to-one hash layout requested but inner keys contain duplicates")]
    NeedsOneToManyHash,

    /// Inner column could not be staged on the target device
    #[error("failed to fetch column for hash join: {0}")]
    FailedToFetchColumn(String),

    /// Division by zero recorded by a kernel
    #[error("division by zero")]
    DivisionByZero,

    /// Integer overflow or underflow recorded by a kernel
    #[error("overflow or underflow")]
    OverflowOrUnderflow,

    /// Group-by buffer ran out of slots
    #[error("out of group-by slots; retry with a larger entry count")]
    OutOfSlots,

    /// Watchdog interrupt tripped while a kernel was running
    #[error("query interrupted")]
    Interrupted,

    /// SINGLE_VALUE aggregate saw more than one distinct value
    #[error("single-value aggregate encountered multiple distinct values")]
    SingleValueMultipleRows,

    /// String id translation between dictionaries failed
    #[error("dictionary translation failed: {0}")]
    DictionaryTranslation(String),

    /// GPU initialization failed; dispatch falls back to CPU
    #[error("GPU initialization failed: {0}")]
    GpuInitFailed(String),

    /// GPU kernel execution failed
    #[error("GPU execution failed: {0}")]
    GpuExecution(String),

    /// Buffer pool misuse (duplicate key, missing chunk, bad unpin)
    #[error("buffer pool error: {0}")]
    BufferPool(String),

    /// Malformed input to a public API
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Arrow conversion error
    #[error("exchange error: {0}")]
    Exchange(String),

    /// IO error (disk tier)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether a higher-level retry policy may re-run the query on CPU.
    #[must_use]
    pub const fn is_cpu_retryable(&self) -> bool {
        matches!(
            self,
            Self::QueryMustRunOnCpu(_) | Self::GpuInitFailed(_) | Self::GpuExecution(_)
        )
    }
}
