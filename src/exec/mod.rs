//! Execution dispatcher
//!
//! Consumes an execution unit, fragment metadata, per-device memory
//! snapshots and the execution policy; produces a reduced, sorted result
//! set. The pipeline: descriptor choice → kernel compile (cached) → join
//! table builds (cached) → fragment partitioning → per-kernel launches
//! (rayon across CPU kernels, wgpu for GPU kernels) → error-code check →
//! reduction → terminal sort. A GPU attempt that trips the byte budget or
//! an unsupported shape retries on CPU.

pub mod fragment;
pub mod kernel;

pub use fragment::{ExecutionPolicy, KernelDescriptor, QueryFragmentDescriptor};

use crate::buffer::{BufferPool, ChunkKey, MemoryLevel, PoolSizes};
use crate::codegen::{CodeGenerator, CompiledKernel, DeviceKind, KernelCache, KernelCacheKey};
use crate::descriptor::QueryMemoryDescriptor;
use crate::error::{Error, Result};
use crate::gpu::GpuEngine;
use crate::plan::ExecutionUnit;
use crate::result::{OutputBuffer, ResultSet};
use crate::runtime;
use crate::storage::{Catalog, ColumnBuffer, Fragment, TableData};
use crate::types::SqlType;
use crate::SystemConfig;
use kernel::KernelArgs;
use rayon::prelude::*;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Raise the process-wide interrupt flag; running kernels exit with the
/// watchdog error code at their next poll.
pub fn interrupt_queries() {
    runtime::set_interrupt(true);
}

/// Clear the interrupt flag.
pub fn reset_interrupt() {
    runtime::set_interrupt(false);
}

/// The dispatcher: owns the pool, caches, codegen and the optional GPU
/// engine. One instance serves many queries concurrently.
pub struct ExecutionDispatcher {
    catalog: Arc<Catalog>,
    pool: Arc<BufferPool>,
    config: SystemConfig,
    codegen: CodeGenerator,
    kernel_cache: KernelCache,
    join_cache: crate::join::JoinHashTableCache,
    gpu: Option<GpuEngine>,
}

impl ExecutionDispatcher {
    /// Dispatcher over a catalog, CPU-only until [`Self::init_gpu`] runs.
    #[must_use]
    pub fn new(catalog: Arc<Catalog>, config: SystemConfig) -> Self {
        let sizes = PoolSizes {
            page_size: config.page_size,
            min_slab_size: config.min_slab_size,
            max_slab_size: config.max_slab_size,
            cpu_pool_size: config.cpu_buffer_mem_bytes,
            gpu_pool_size: config.gpu_buffer_mem_bytes,
        };
        let pool = Arc::new(BufferPool::new(
            Arc::clone(&catalog) as Arc<dyn crate::buffer::ChunkSource>,
            sizes,
        ));
        Self {
            catalog,
            pool,
            kernel_cache: KernelCache::new(config.kernel_cache_capacity),
            join_cache: crate::join::JoinHashTableCache::default(),
            codegen: CodeGenerator::new(),
            config,
            gpu: None,
        }
    }

    /// Try to bring up the GPU engine; returns whether a device is live.
    pub async fn init_gpu(&mut self) -> bool {
        match GpuEngine::new().await {
            Ok(engine) => {
                info!(devices = engine.device_count(), "GPU engine initialized");
                self.gpu = Some(engine);
                true
            }
            Err(e) => {
                warn!("GPU unavailable, staying on CPU: {e}");
                false
            }
        }
    }

    /// Buffer pool handle (tests and admin surfaces).
    #[must_use]
    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    /// Compiled kernels currently cached.
    #[must_use]
    pub fn cached_kernel_count(&self) -> usize {
        self.kernel_cache.len()
    }

    /// Execute one unit to a reduced, sorted result set.
    ///
    /// # Errors
    /// Compile-time, allocation and structural failures per the error
    /// taxonomy; runtime per-row codes surface as their typed errors after
    /// the kernels complete.
    pub async fn execute(&self, unit: &ExecutionUnit) -> Result<ResultSet> {
        let tables = self.resolve_tables(unit)?;

        if self.gpu.is_some() {
            match self.execute_on(unit, &tables, DeviceKind::Gpu).await {
                Ok(rs) => return Ok(rs),
                Err(e) if e.is_cpu_retryable() || matches!(e, Error::QmdInfeasible(_)) => {
                    debug!("GPU attempt failed ({e}), retrying on CPU");
                }
                Err(e) => return Err(e),
            }
        }
        self.execute_on(unit, &tables, DeviceKind::Cpu).await
    }

    fn resolve_tables(&self, unit: &ExecutionUnit) -> Result<Vec<&TableData>> {
        unit.inputs
            .iter()
            .map(|id| {
                self.catalog
                    .table(*id)
                    .ok_or_else(|| Error::InvalidInput(format!("unknown table {id}")))
            })
            .collect()
    }

    async fn execute_on(
        &self,
        unit: &ExecutionUnit,
        tables: &[&TableData],
        device: DeviceKind,
    ) -> Result<ResultSet> {
        let max_output_bytes = match device {
            DeviceKind::Cpu => self.pool.memory_info(MemoryLevel::Cpu).total_bytes,
            #[allow(clippy::cast_precision_loss, clippy::cast_sign_loss, clippy::cast_possible_truncation)]
            DeviceKind::Gpu => {
                let total = self.pool.memory_info(MemoryLevel::Gpu).total_bytes;
                (total as f64 * self.config.gpu_input_mem_limit_percent) as usize
            }
        };
        let qmd = Arc::new(QueryMemoryDescriptor::choose(
            unit,
            tables,
            &self.config,
            max_output_bytes,
        )?);

        let kernel = self.compiled_kernel(unit, &qmd, tables, device)?;
        if device == DeviceKind::Gpu && kernel.wgsl.is_none() {
            return Err(Error::QueryMustRunOnCpu(
                "plan shape outside the GPU kernel surface".into(),
            ));
        }

        let (join_tables, join_key_nulls) = self.build_join_tables(unit, tables)?;

        let policy = match device {
            DeviceKind::Cpu => ExecutionPolicy::cpu_only(),
            DeviceKind::Gpu => ExecutionPolicy::gpu(
                self.gpu.as_ref().map_or(0, GpuEngine::device_count),
            ),
        };
        let gpu_mem = (device == DeviceKind::Gpu)
            .then(|| self.pool.memory_info(MemoryLevel::Gpu));
        let frag_desc =
            QueryFragmentDescriptor::build(unit, tables, policy, gpu_mem, &self.config)?;

        let mut buffers = match device {
            DeviceKind::Cpu => {
                self.run_cpu_kernels(&kernel, unit, tables, &frag_desc, &join_tables, &join_key_nulls)?
            }
            DeviceKind::Gpu => {
                self.run_gpu_kernels(&kernel, tables, &frag_desc).await?
            }
        };
        if buffers.is_empty() {
            // every fragment skipped: aggregates still produce their empty
            // row (COUNT 0, nulls elsewhere)
            buffers.push(OutputBuffer::new(&qmd));
        }

        check_kernel_errors(&buffers)?;

        let dicts = collect_dictionaries(&qmd, tables);
        let rs = ResultSet::new(Arc::clone(&qmd), buffers, dicts);
        let mut reduced = ResultSet::reduce(vec![rs])?;
        if let Some(sort) = &unit.sort {
            reduced.sort_and_limit(sort);
        }
        Ok(reduced)
    }

    fn compiled_kernel(
        &self,
        unit: &ExecutionUnit,
        qmd: &Arc<QueryMemoryDescriptor>,
        tables: &[&TableData],
        device: DeviceKind,
    ) -> Result<Arc<CompiledKernel>> {
        let key = KernelCacheKey {
            plan_hash: unit.shape_hash(),
            qmd_hash: qmd.structural_hash(),
            device,
            hoisted_literals: self.config.hoist_literals,
        };
        if let Some(k) = self.kernel_cache.get(&key) {
            debug!(?key, "kernel cache hit");
            return Ok(k);
        }
        let kernel = Arc::new(
            self.codegen
                .compile(unit, qmd, tables, &self.config, device)?,
        );
        self.kernel_cache.put(key, Arc::clone(&kernel));
        Ok(kernel)
    }

    /// Build (or fetch cached) join tables for every level. A OneToOne
    /// request that hits duplicate inner keys upgrades to OneToMany.
    fn build_join_tables(
        &self,
        unit: &ExecutionUnit,
        tables: &[&TableData],
    ) -> Result<(Vec<Arc<crate::join::JoinHashTable>>, Vec<Option<i64>>)> {
        let mut built = Vec::with_capacity(unit.joins.len());
        let mut nulls = Vec::with_capacity(unit.joins.len());
        for level in &unit.joins {
            let table = tables
                .get(level.inner_input_idx)
                .ok_or_else(|| Error::InvalidInput("join inner input out of range".into()))?;
            let ty = table
                .schema
                .get(level.inner_column)
                .ok_or_else(|| Error::InvalidInput("join inner column out of range".into()))?;
            let null_sentinel = ty.nullable.then(|| ty.null_sentinel());

            let values = self
                .fetch_column_values(table, level.inner_column)
                .map_err(|e| Error::FailedToFetchColumn(e.to_string()))?;

            let join_table =
                self.join_cache
                    .get_or_build(table.id, level.inner_column, || {
                        match crate::join::JoinHashTable::build(
                            &values,
                            null_sentinel,
                            level.layout,
                        ) {
                            Err(Error::NeedsOneToManyHash) => {
                                debug!("upgrading join layout to OneToMany");
                                crate::join::JoinHashTable::build(
                                    &values,
                                    null_sentinel,
                                    crate::plan::JoinLayoutHint::OneToMany,
                                )
                            }
                            other => other,
                        }
                    })?;
            built.push(join_table);
            nulls.push(null_sentinel);
        }
        Ok((built, nulls))
    }

    /// Decode one column across all fragments through the pool (pinned for
    /// the duration of the copy).
    fn fetch_column_values(&self, table: &TableData, column: usize) -> Result<Vec<i64>> {
        let mut values = Vec::with_capacity(table.row_count());
        for frag in &table.fragments {
            let view = self.fragment_column(table, frag, column)?;
            for row in 0..frag.row_count {
                values.push(view.decode_int(row));
            }
        }
        Ok(values)
    }

    /// A pinned view of one fragment column, zero-copy when the source
    /// supports it.
    fn fragment_column(
        &self,
        table: &TableData,
        frag: &Fragment,
        column: usize,
    ) -> Result<ColumnBuffer> {
        let original = frag
            .columns
            .get(column)
            .ok_or_else(|| Error::InvalidInput(format!("column {column} out of range")))?;
        #[allow(clippy::cast_possible_truncation)]
        let key = ChunkKey::chunk(table.id, column as u32, frag.id);
        let pinned = self
            .pool
            .get_buffer(MemoryLevel::Cpu, &key, original.data.len())?;
        Ok(ColumnBuffer {
            ty: original.ty,
            encoding: original.encoding,
            data: pinned.arc_bytes(),
        })
    }

    /// Column positions each input needs, from every expression in the unit.
    fn needed_columns(unit: &ExecutionUnit) -> Vec<HashSet<usize>> {
        let mut needed: Vec<HashSet<usize>> = vec![HashSet::new(); unit.inputs.len()];
        let mut refs = Vec::new();
        for e in unit
            .simple_quals
            .iter()
            .chain(&unit.quals)
            .chain(&unit.group_by)
            .chain(unit.targets.iter().map(|t| &t.expr))
            .chain(unit.joins.iter().map(|j| &j.outer_key))
        {
            e.collect_columns(&mut refs);
        }
        for (input, column) in refs {
            if let Some(set) = needed.get_mut(input) {
                set.insert(column);
            }
        }
        needed
    }

    /// Views for one input's columns: needed positions resolve, the rest
    /// stay empty placeholders so column indexes line up.
    fn input_views(
        &self,
        table: &TableData,
        frag: &Fragment,
        needed: &HashSet<usize>,
    ) -> Result<Vec<ColumnBuffer>> {
        table
            .schema
            .iter()
            .enumerate()
            .map(|(c, ty)| {
                if needed.contains(&c) {
                    self.fragment_column(table, frag, c)
                } else {
                    Ok(ColumnBuffer {
                        ty: *ty,
                        encoding: crate::storage::Encoding::FixedWidth {
                            byte_width: ty.ty.byte_width().unwrap_or(8),
                        },
                        data: Arc::new(Vec::new()),
                    })
                }
            })
            .collect()
    }

    /// Broadcast views of an inner input: fragments concatenated so join
    /// row ids address the whole table.
    fn broadcast_views(
        &self,
        table: &TableData,
        needed: &HashSet<usize>,
    ) -> Result<Vec<ColumnBuffer>> {
        if table.fragments.len() == 1 {
            return self.input_views(table, &table.fragments[0], needed);
        }
        table
            .schema
            .iter()
            .enumerate()
            .map(|(c, ty)| {
                if !needed.contains(&c) {
                    return Ok(ColumnBuffer {
                        ty: *ty,
                        encoding: crate::storage::Encoding::FixedWidth {
                            byte_width: ty.ty.byte_width().unwrap_or(8),
                        },
                        data: Arc::new(Vec::new()),
                    });
                }
                if ty.ty.is_fp() && ty.ty == SqlType::Float {
                    let mut vals = Vec::with_capacity(table.row_count());
                    for frag in &table.fragments {
                        let view = self.fragment_column(table, frag, c)?;
                        for row in 0..frag.row_count {
                            #[allow(clippy::cast_possible_truncation)]
                            vals.push(view.decode_fp(row) as f32);
                        }
                    }
                    Ok(ColumnBuffer::from_f32s(*ty, &vals))
                } else if ty.ty.is_fp() {
                    let mut vals = Vec::with_capacity(table.row_count());
                    for frag in &table.fragments {
                        let view = self.fragment_column(table, frag, c)?;
                        for row in 0..frag.row_count {
                            vals.push(view.decode_fp(row));
                        }
                    }
                    Ok(ColumnBuffer::from_f64s(*ty, &vals))
                } else {
                    let vals = self.fetch_column_values(table, c)?;
                    Ok(ColumnBuffer::from_i64s(*ty, &vals))
                }
            })
            .collect()
    }

    #[allow(clippy::too_many_lines)]
    fn run_cpu_kernels(
        &self,
        kernel: &Arc<CompiledKernel>,
        unit: &ExecutionUnit,
        tables: &[&TableData],
        frag_desc: &QueryFragmentDescriptor,
        join_tables: &[Arc<crate::join::JoinHashTable>],
        join_key_nulls: &[Option<i64>],
    ) -> Result<Vec<OutputBuffer>> {
        let needed = Self::needed_columns(unit);

        // broadcast (inner) input views, shared by every kernel
        let mut inner_views: Vec<Option<Vec<ColumnBuffer>>> = vec![None; tables.len()];
        for level in &unit.joins {
            let idx = level.inner_input_idx;
            if inner_views[idx].is_none() {
                inner_views[idx] = Some(self.broadcast_views(tables[idx], &needed[idx])?);
            }
        }

        let max_matched = unit.scan_limit.map_or(u64::MAX, |l| {
            let offset = unit.sort.as_ref().map_or(0, |s| s.offset);
            (l + offset) as u64
        });

        let run_one = |kdesc: &KernelDescriptor| -> Result<OutputBuffer> {
            let mut fragment_tables = Vec::with_capacity(kdesc.fragments.len());
            let mut frag_row_counts = Vec::with_capacity(kdesc.fragments.len());
            for fref in &kdesc.fragments {
                let table = tables[fref.input_idx];
                let frag = &table.fragments[fref.fragment_idx];
                let mut per_input: Vec<Vec<ColumnBuffer>> = Vec::with_capacity(tables.len());
                for input in 0..tables.len() {
                    if input == 0 {
                        // the driving fragment sits at position 0 (UNION ALL
                        // branches share the schema of input 0)
                        per_input.push(self.input_views(table, frag, &needed[0])?);
                    } else if let Some(views) = &inner_views[input] {
                        per_input.push(views.clone());
                    } else {
                        per_input.push(Vec::new());
                    }
                }
                fragment_tables.push(per_input);
                frag_row_counts.push(fref.row_count);
            }

            let mut out = OutputBuffer::new(&kernel.qmd);
            let mut args = KernelArgs {
                fragment_tables: &fragment_tables,
                frag_row_counts: &frag_row_counts,
                join_tables,
                join_key_nulls,
                max_matched,
                out: &mut out,
            };
            if kernel.hoisted_literals {
                kernel::multifrag_query_hoisted_literals(kernel, &mut args);
            } else {
                kernel::multifrag_query(kernel, &mut args);
            }
            Ok(out)
        };

        if unit.scan_limit.is_some() {
            // sample queries dispatch sequentially so the accumulated tuple
            // count can stop further kernels
            let mut buffers = Vec::new();
            let mut accumulated = 0u64;
            for kdesc in &frag_desc.kernels {
                if accumulated >= max_matched {
                    break;
                }
                let out = run_one(kdesc)?;
                accumulated += out.matched;
                buffers.push(out);
            }
            Ok(buffers)
        } else {
            frag_desc
                .kernels
                .par_iter()
                .map(run_one)
                .collect::<Result<Vec<_>>>()
        }
    }

    async fn run_gpu_kernels(
        &self,
        kernel: &Arc<CompiledKernel>,
        tables: &[&TableData],
        frag_desc: &QueryFragmentDescriptor,
    ) -> Result<Vec<OutputBuffer>> {
        let engine = self
            .gpu
            .as_ref()
            .ok_or_else(|| Error::GpuInitFailed("no GPU engine".into()))?;
        let wgsl = kernel
            .wgsl
            .as_ref()
            .ok_or_else(|| Error::QueryMustRunOnCpu("no GPU kernel generated".into()))?;

        let mut buffers = Vec::with_capacity(frag_desc.kernels.len());
        for kdesc in &frag_desc.kernels {
            let mut input = Vec::new();
            let mut filter = Vec::new();
            let mut total_rows = 0u64;
            for fref in &kdesc.fragments {
                let table = tables[fref.input_idx];
                let frag = &table.fragments[fref.fragment_idx];
                #[allow(clippy::cast_possible_truncation)]
                let key = ChunkKey::chunk(table.id, wgsl.column as u32, frag.id);
                let len = frag.columns[wgsl.column].data.len();
                // stage through the GPU tier for budget accounting
                let pinned = self.pool.get_buffer(MemoryLevel::Gpu, &key, len)?;
                input.extend_from_slice(&pinned.bytes());
                if let Some(fc) = wgsl.filter_column {
                    #[allow(clippy::cast_possible_truncation)]
                    let fkey = ChunkKey::chunk(table.id, fc as u32, frag.id);
                    let flen = frag.columns[fc].data.len();
                    let fpinned = self.pool.get_buffer(MemoryLevel::Gpu, &fkey, flen)?;
                    filter.extend_from_slice(&fpinned.bytes());
                }
                total_rows += fref.row_count as u64;
            }

            let result = engine
                .run_aggregate(wgsl, &input, wgsl.filter_column.map(|_| filter.as_slice()))
                .await?;

            let mut out = OutputBuffer::new(&kernel.qmd);
            let slot = out.slot_index(&kernel.qmd, 0, kernel.qmd.targets[0].first_slot);
            // the identity slot value means no row updated the aggregate;
            // map it back to the layout's init sentinel
            out.data[slot] = if result == i64::from(wgsl.agg.identity()) {
                kernel.qmd.init_vals[kernel.qmd.targets[0].first_slot]
            } else {
                result
            };
            out.matched = total_rows;
            buffers.push(out);
        }
        Ok(buffers)
    }
}

/// Map persistent kernel error codes to their typed errors; partial results
/// are discarded by the caller.
fn check_kernel_errors(buffers: &[OutputBuffer]) -> Result<()> {
    for buf in buffers {
        match buf.error_code {
            runtime::ERR_NONE => {}
            runtime::ERR_DIV_BY_ZERO => return Err(Error::DivisionByZero),
            runtime::ERR_OVERFLOW_OR_UNDERFLOW => return Err(Error::OverflowOrUnderflow),
            runtime::ERR_OUT_OF_SLOTS => return Err(Error::OutOfSlots),
            runtime::ERR_INTERRUPTED => return Err(Error::Interrupted),
            runtime::ERR_SINGLE_VALUE_FOUND_MULTIPLE_VALUES => {
                return Err(Error::SingleValueMultipleRows)
            }
            code => {
                return Err(Error::InvalidInput(format!(
                    "unknown kernel error code {code}"
                )))
            }
        }
    }
    Ok(())
}

/// Dictionary handles for string targets, keyed by dictionary id.
fn collect_dictionaries(
    qmd: &QueryMemoryDescriptor,
    tables: &[&TableData],
) -> HashMap<u32, Arc<crate::storage::dictionary::StringDictionary>> {
    let mut dicts = HashMap::new();
    let needed: HashSet<u32> = qmd
        .targets
        .iter()
        .filter_map(|t| match t.result_type.ty {
            SqlType::DictText { dict_id } => Some(dict_id),
            _ => None,
        })
        .collect();
    if needed.is_empty() {
        return dicts;
    }
    for table in tables {
        for (col, dict) in &table.dictionaries {
            if let Some(SqlType::DictText { dict_id }) =
                table.schema.get(*col).map(|t| t.ty)
            {
                if needed.contains(&dict_id) {
                    dicts.insert(dict_id, Arc::clone(dict));
                }
            }
        }
    }
    dicts
}
