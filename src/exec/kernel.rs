//! The outer kernel: `multifrag_query` entry points and the row-function
//! diamond
//!
//! The kernel iterates the fragments assigned to its device; for each row
//! it probes the join levels (recursing over OneToMany payload runs),
//! evaluates the quals, resolves the group entry through the layout's
//! lookup intrinsic, and applies each target's aggregator to its slots.
//! The interrupt flag is polled every `INTERRUPT_CHECK_MASK + 1` rows;
//! per-row failures latch into the kernel's error slot and the kernel keeps
//! running, except for the out-of-slots and interrupt codes which exit the
//! fragment loop early.

use crate::codegen::expr::RowCtx;
use crate::codegen::{CompiledKernel, CompiledTarget};
use crate::descriptor::QueryLayout;
use crate::join::{JoinHashTable, JoinMatches};
use crate::result::OutputBuffer;
use crate::runtime::{
    self,
    groupby::{self, EMPTY_KEY_64},
    INTERRUPT_CHECK_MASK,
};
use crate::storage::ColumnBuffer;
use std::sync::Arc;

/// Arguments of one kernel invocation: per-fragment column views for every
/// input, the join tables, and the output buffer.
pub struct KernelArgs<'a> {
    /// Per driving fragment: per input table, the column views. Inner
    /// (broadcast) inputs repeat the same concatenated views each entry.
    pub fragment_tables: &'a [Vec<Vec<ColumnBuffer>>],
    /// Row count per driving fragment
    pub frag_row_counts: &'a [usize],
    /// Join hash tables, one per join level
    pub join_tables: &'a [Arc<JoinHashTable>],
    /// Null sentinels of the join keys (for nullable-key translation)
    pub join_key_nulls: &'a [Option<i64>],
    /// Stop once this many tuples matched (scan limit; `u64::MAX` unbounded)
    pub max_matched: u64,
    /// The kernel's output buffer
    pub out: &'a mut OutputBuffer,
}

/// Entry point for kernels compiled with hoisted literals: the literal
/// buffer rides alongside the row function.
pub fn multifrag_query_hoisted_literals(kernel: &CompiledKernel, args: &mut KernelArgs<'_>) {
    debug_assert!(kernel.hoisted_literals);
    run_fragments(kernel, args, &kernel.literals);
}

/// Entry point for kernels with inline immediates.
pub fn multifrag_query(kernel: &CompiledKernel, args: &mut KernelArgs<'_>) {
    debug_assert!(!kernel.hoisted_literals);
    run_fragments(kernel, args, &[]);
}

fn run_fragments(kernel: &CompiledKernel, args: &mut KernelArgs<'_>, literals: &[i64]) {
    let row_func = &kernel.row_func;
    let n_inputs = args
        .fragment_tables
        .first()
        .map_or(1, Vec::len);

    for (frag_idx, &row_count) in args.frag_row_counts.iter().enumerate() {
        let tables = &args.fragment_tables[frag_idx];
        let mut rows = vec![0i64; n_inputs];

        for row in 0..row_count {
            if row_func.check_interrupt
                && (row as u64) & INTERRUPT_CHECK_MASK == 0
                && runtime::check_interrupt()
            {
                runtime::record_error_code(runtime::ERR_INTERRUPTED, &mut args.out.error_code);
                return;
            }
            if args.out.matched >= args.max_matched {
                return;
            }
            if args.out.error_code == runtime::ERR_OUT_OF_SLOTS {
                return;
            }
            rows[0] = row as i64;
            process_joins(kernel, tables, &mut rows, literals, 0, args);
        }
    }
}

/// Probe join levels depth-first; OneToMany runs fan the outer row out over
/// every matched inner row.
fn process_joins(
    kernel: &CompiledKernel,
    tables: &[Vec<ColumnBuffer>],
    rows: &mut Vec<i64>,
    literals: &[i64],
    level: usize,
    args_out: &mut KernelArgs<'_>,
) {
    let row_func = &kernel.row_func;
    if level == row_func.joins.len() {
        process_row(kernel, tables, rows, literals, args_out);
        return;
    }

    let join = &row_func.joins[level];
    // copy the slice refs out so probing does not hold a borrow of the args
    let join_tables = args_out.join_tables;
    let join_key_nulls = args_out.join_key_nulls;
    let table = &join_tables[join.table_idx];
    let key = {
        let ctx = RowCtx {
            tables,
            rows,
            literals,
        };
        let mut err = args_out.out.error_code;
        let k = join.outer_key.eval(&ctx, &mut err);
        args_out.out.error_code = err;
        k
    };

    let matches = match join_key_nulls[join.table_idx] {
        Some(null_val) => table.probe_nullable(key, null_val),
        None => table.probe(key),
    };

    match matches {
        JoinMatches::None => {
            if join.left_outer {
                rows[join.input_idx] = -1;
                process_joins(kernel, tables, rows, literals, level + 1, args_out);
            }
        }
        JoinMatches::One(inner_row) => {
            rows[join.input_idx] = inner_row;
            process_joins(kernel, tables, rows, literals, level + 1, args_out);
        }
        JoinMatches::Run(run) => {
            for &inner_row in run {
                rows[join.input_idx] = i64::from(inner_row);
                process_joins(kernel, tables, rows, literals, level + 1, args_out);
            }
        }
    }
}

/// Qual evaluation → group-value lookup → per-target aggregator calls.
fn process_row(
    kernel: &CompiledKernel,
    tables: &[Vec<ColumnBuffer>],
    rows: &[i64],
    literals: &[i64],
    args: &mut KernelArgs<'_>,
) {
    let row_func = &kernel.row_func;
    let qmd = &kernel.qmd;
    let out = &mut *args.out;
    let ctx = RowCtx {
        tables,
        rows,
        literals,
    };

    let mut error = out.error_code;
    let passes = row_func
        .simple_quals
        .iter()
        .chain(&row_func.quals)
        .all(|q| q.eval(&ctx, &mut error) == 1);
    out.error_code = error;
    if !passes {
        return;
    }
    if out.matched >= args.max_matched {
        return;
    }

    let entry = match resolve_entry(kernel, &ctx, out) {
        Some(e) => e,
        None => {
            runtime::record_error_code(runtime::ERR_OUT_OF_SLOTS, &mut out.error_code);
            return;
        }
    };
    out.matched += 1;

    let mut error = out.error_code;
    for t in &row_func.targets {
        let val = t.expr.eval(&ctx, &mut error);
        apply_target(t, qmd, out, entry, val, &mut error);
    }
    out.error_code = error;
}

fn apply_target(
    t: &CompiledTarget,
    qmd: &crate::descriptor::QueryMemoryDescriptor,
    out: &mut OutputBuffer,
    entry: usize,
    val: i64,
    error: &mut i32,
) {
    let slot = out.slot_index(qmd, entry, t.first_slot);
    let slot2 = if t.slots_used == 2 {
        out.slot_index(qmd, entry, t.first_slot + 1)
    } else {
        slot
    };
    t.op.apply(&mut out.data, slot, slot2, val, &mut out.arena, error);
}

/// Resolve the output entry for the current row through the layout's
/// group-value intrinsic. `None` means out of slots.
fn resolve_entry(
    kernel: &CompiledKernel,
    ctx: &RowCtx<'_>,
    out: &mut OutputBuffer,
) -> Option<usize> {
    let qmd = &kernel.qmd;
    let row_func = &kernel.row_func;
    match qmd.layout {
        QueryLayout::Projection => {
            let entry = out.matched as usize;
            (entry < out.entry_count as usize).then_some(entry)
        }
        QueryLayout::NonGroupedAggregate => Some(0),
        QueryLayout::PerfectHashOneCol => {
            let mut error = out.error_code;
            let key = row_func.key_exprs[0].eval(ctx, &mut error);
            out.error_code = error;
            let range = &qmd.key_ranges[0];
            if key < range.min || key > range.max {
                return None;
            }
            if qmd.keyless.keyless {
                Some(groupby::get_group_value_fast_keyless(
                    key, range.min, range.bucket,
                ))
            } else {
                let off = groupby::get_group_value_fast(
                    &mut out.data,
                    key,
                    range.min,
                    range.bucket,
                    qmd.row_size_quad,
                );
                Some(off / qmd.row_size_quad)
            }
        }
        QueryLayout::PerfectHashMulti => {
            let mut error = out.error_code;
            let keys: Vec<i64> = row_func
                .key_exprs
                .iter()
                .map(|k| k.eval(ctx, &mut error))
                .collect();
            out.error_code = error;

            // compose the entry from per-key strides, last key fastest
            let mut entry = 0usize;
            for (k, range) in keys.iter().zip(&qmd.key_ranges) {
                if *k < range.min || *k > range.max {
                    return None;
                }
                #[allow(clippy::cast_possible_truncation)]
                let span = range.entry_span() as usize;
                #[allow(clippy::cast_sign_loss)]
                let idx = ((k - range.min) / range.bucket.max(1)) as usize;
                entry = entry * span + idx;
            }
            // materialize the key tuple on first touch
            let first_key = out.key_index(qmd, entry, 0);
            if out.data[first_key] == EMPTY_KEY_64 {
                for (k_idx, &k) in keys.iter().enumerate() {
                    let idx = out.key_index(qmd, entry, k_idx);
                    out.data[idx] = k;
                }
            }
            Some(entry)
        }
        QueryLayout::BaselineHash => {
            let mut error = out.error_code;
            let keys: Vec<i64> = row_func
                .key_exprs
                .iter()
                .map(|k| k.eval(ctx, &mut error))
                .collect();
            out.error_code = error;

            if qmd.output_columnar {
                let key_region = qmd.key_count * out.entry_count as usize;
                let entry = groupby::get_group_value_columnar(
                    &mut out.data[..key_region],
                    out.entry_count,
                    &keys,
                )?;
                Some(entry as usize)
            } else {
                let off = if row_func.check_interrupt {
                    groupby::get_group_value_with_watchdog(
                        &mut out.data,
                        out.entry_count,
                        &keys,
                        qmd.key_width,
                        qmd.row_size_quad,
                    )
                } else {
                    groupby::get_group_value(
                        &mut out.data,
                        out.entry_count,
                        &keys,
                        qmd.key_width,
                        qmd.row_size_quad,
                    )
                }?;
                Some(off / qmd.row_size_quad)
            }
        }
    }
}
