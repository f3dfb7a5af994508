//! # rayo-db: heterogeneous analytical query execution core
//!
//! rayo-db takes relational-algebra execution units over columnar fragments
//! and produces result sets by generating per-query kernels (a vectorized
//! row function bound against a runtime library of null-aware intrinsics on
//! CPU, WGSL compute shaders on GPU) and dispatching fragments across
//! devices through a paged, three-tier buffer pool.
//!
//! Pipeline: plan → memory-descriptor decision → codegen → compiled kernel
//! → dispatcher fans fragments out per device → kernels write
//! pre-initialized output buffers → reduction merges → result set.
//!
//! ## Example
//!
//! ```rust,no_run
//! use rayo_db::exec::ExecutionDispatcher;
//! use rayo_db::ir::{AggKind, Expr};
//! use rayo_db::plan::{ExecutionUnit, Target};
//! use rayo_db::storage::{Catalog, ColumnBuffer, Fragment, TableData};
//! use rayo_db::types::{SqlType, TypeInfo};
//! use rayo_db::SystemConfig;
//! use std::sync::Arc;
//!
//! # async fn example() -> rayo_db::Result<()> {
//! let ty = TypeInfo::new(SqlType::Int);
//! let col = ColumnBuffer::from_i64s(ty, &[1, 2, 3, 4, 5]);
//! let mut catalog = Catalog::new();
//! catalog.add_table(TableData::new(1, vec![ty], vec![Fragment::new(0, vec![col])]));
//!
//! let dispatcher = ExecutionDispatcher::new(Arc::new(catalog), SystemConfig::default());
//! let unit = ExecutionUnit::scan(1)
//!     .with_target(Target::aggregate("total", AggKind::Sum, Expr::col(0, 0, ty)));
//! let result = dispatcher.execute(&unit).await?;
//! println!("{:?}", result.rows());
//! # Ok(())
//! # }
//! ```
//!
//! References:
//! - Neumann (2011): compiling query plans at runtime
//! - `HeavyDB` (2017): GPU-first analytical execution
//! - Leis et al. (2014): morsel-driven parallelism

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod buffer;
pub mod codegen;
pub mod descriptor;
pub mod error;
pub mod exec;
pub mod gpu;
pub mod ir;
pub mod join;
pub mod plan;
pub mod result;
pub mod runtime;
pub mod storage;
pub mod topk;
pub mod types;

pub use error::{Error, Result};
pub use exec::ExecutionDispatcher;

use serde::Deserialize;

/// Recognized configuration knobs.
///
/// Deserializes from any serde format with per-field defaults, so partial
/// configs stay valid.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    /// Fraction of device memory usable as query input per GPU (0.0–1.0)
    pub gpu_input_mem_limit_percent: f64,
    /// Batch a device's fragments into one kernel with broadcast inners
    pub allow_multifrag: bool,
    /// Prefer columnar output buffers when the layout permits
    pub enable_columnar_output: bool,
    /// Baseline-hash entry bound before cardinality estimation is required
    pub baseline_max_groups: usize,
    /// Perfect-hash key span above which baseline hashing is preferred
    pub big_group_threshold: usize,
    /// Poll the interrupt flag from row functions and probe loops
    pub watchdog_enable: bool,
    /// Deduplicate constants into a per-device literal buffer
    pub hoist_literals: bool,
    /// Allow the bounded-heap top-N path for small sorted limits
    pub enable_streaming_top_n: bool,
    /// Buffer-pool page granularity, bytes
    pub page_size: usize,
    /// Smallest slab the halving retry loop will attempt, bytes
    pub min_slab_size: usize,
    /// Preferred slab size, bytes
    pub max_slab_size: usize,
    /// CPU tier capacity, bytes
    pub cpu_buffer_mem_bytes: usize,
    /// GPU tier capacity, bytes
    pub gpu_buffer_mem_bytes: usize,
    /// Compiled-kernel cache entry cap
    pub kernel_cache_capacity: usize,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            gpu_input_mem_limit_percent: 0.9,
            allow_multifrag: true,
            enable_columnar_output: false,
            baseline_max_groups: 2_000_000,
            big_group_threshold: 10_000,
            watchdog_enable: false,
            hoist_literals: true,
            enable_streaming_top_n: true,
            page_size: 512,
            min_slab_size: 1 << 16,
            max_slab_size: 1 << 22,
            cpu_buffer_mem_bytes: 1 << 28,
            gpu_buffer_mem_bytes: 1 << 26,
            kernel_cache_capacity: 128,
        }
    }
}
