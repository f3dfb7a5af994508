//! Reduction: merging per-kernel result sets into one
//!
//! Projection concatenates buffers in input order. Perfect-hash and
//! non-grouped layouts reduce pair-wise over aligned entries. Baseline
//! buffers rebuild into a fresh table sized for the union, re-probing each
//! occupied entry's key. Per-target operators: SUM→+, MIN→min, MAX→max,
//! COUNT→+, AVG→pair-wise sum and count, COUNT DISTINCT→bitmap OR / set
//! union, APPROX→per-index max of HLL ranks (inside the set merge),
//! SAMPLE→first non-null wins. Reduction is associative: any binary
//! grouping of the same buffers yields the same result set.

use super::{OutputBuffer, ResultSet};
use crate::descriptor::{QueryLayout, QueryMemoryDescriptor};
use crate::error::{Error, Result};
use crate::ir::AggKind;
use crate::runtime::{self, groupby};
use tracing::debug;

impl ResultSet {
    /// Reduce per-kernel result sets (same descriptor) into one.
    ///
    /// # Errors
    /// [`Error::SingleValueMultipleRows`] when SINGLE_VALUE targets
    /// disagree across kernels; [`Error::OutOfSlots`] if a rebuilt baseline
    /// table cannot admit a key (sizing bug, not expected).
    pub fn reduce(mut results: Vec<ResultSet>) -> Result<ResultSet> {
        let Some(mut acc) = results.pop() else {
            return Err(Error::InvalidInput("no result sets to reduce".into()));
        };
        // keep input order for projection concatenation
        results.reverse();

        match acc.qmd.layout {
            QueryLayout::Projection => {
                let mut buffers: Vec<OutputBuffer> = Vec::new();
                for mut r in results {
                    buffers.append(&mut r.buffers);
                    acc.dicts.extend(r.dicts);
                }
                buffers.append(&mut acc.buffers);
                acc.buffers = buffers;
                Ok(acc)
            }
            QueryLayout::BaselineHash => {
                for r in &results {
                    debug_assert_eq!(r.qmd.structural_hash(), acc.qmd.structural_hash());
                }
                let mut all = results;
                all.push(acc);
                rebuild_baseline(all)
            }
            _ => {
                for mut r in results {
                    acc.dicts.extend(std::mem::take(&mut r.dicts));
                    let src_buffers = std::mem::take(&mut r.buffers);
                    for src in src_buffers {
                        reduce_aligned(&acc.qmd, &mut acc.buffers[0], src)?;
                    }
                }
                // a result set may also carry several buffers of its own
                while acc.buffers.len() > 1 {
                    let src = acc.buffers.pop().expect("len checked");
                    reduce_aligned(&acc.qmd, &mut acc.buffers[0], src)?;
                }
                Ok(acc)
            }
        }
    }
}

/// Pair-wise reduction over aligned entry ranges.
fn reduce_aligned(
    qmd: &QueryMemoryDescriptor,
    dst: &mut OutputBuffer,
    mut src: OutputBuffer,
) -> Result<()> {
    debug_assert_eq!(dst.entry_count, src.entry_count);
    runtime::record_error_code(src.error_code, &mut dst.error_code);
    dst.matched += src.matched;

    for e in 0..src.entry_count as usize {
        if !src.occupied(qmd, e) {
            continue;
        }
        if !qmd.keyless.keyless && qmd.key_count > 0 && !dst.occupied(qmd, e) {
            // claim the entry: copy the key region
            for k in 0..qmd.key_qw_count() {
                let idx = dst.key_index(qmd, e, k);
                dst.data[idx] = src.data[src.key_index(qmd, e, k)];
            }
        }
        combine_entry(qmd, dst, e, &mut src, e)?;
    }
    Ok(())
}

/// Rebuild reduction for baseline hash: size a fresh table for the union of
/// groups and re-probe every occupied entry.
fn rebuild_baseline(sources: Vec<ResultSet>) -> Result<ResultSet> {
    let qmd = sources[0].qmd.clone();
    let total_occupied: usize = sources
        .iter()
        .flat_map(|r| &r.buffers)
        .map(|b| {
            (0..b.entry_count as usize)
                .filter(|&e| b.occupied(&qmd, e))
                .count()
        })
        .sum();
    #[allow(clippy::cast_possible_truncation)]
    let entry_count = ((total_occupied * 2).next_power_of_two().max(16)) as u32;
    debug!(total_occupied, entry_count, "rebuilding baseline buffer");

    let mut dst = OutputBuffer::with_entry_count(&qmd, entry_count);
    let mut dicts = std::collections::HashMap::new();

    for mut r in sources {
        dicts.extend(std::mem::take(&mut r.dicts));
        for mut src in std::mem::take(&mut r.buffers) {
            runtime::record_error_code(src.error_code, &mut dst.error_code);
            dst.matched += src.matched;
            for e in 0..src.entry_count as usize {
                if !src.occupied(&qmd, e) {
                    continue;
                }
                let key = src.key_tuple(&qmd, e);
                let dst_entry = if qmd.output_columnar {
                    groupby::get_group_value_columnar(&mut dst.data, entry_count, &key)
                        .map(|e| e as usize)
                } else {
                    groupby::get_group_value(
                        &mut dst.data,
                        entry_count,
                        &key,
                        qmd.key_width,
                        qmd.row_size_quad,
                    )
                    .map(|off| off / qmd.row_size_quad)
                };
                let dst_entry = dst_entry.ok_or(Error::OutOfSlots)?;
                combine_entry(&qmd, &mut dst, dst_entry, &mut src, e)?;
            }
        }
    }

    Ok(ResultSet::new(qmd, vec![dst], dicts))
}

/// Combine one source entry into a destination entry, target by target.
#[allow(clippy::too_many_lines)]
fn combine_entry(
    qmd: &QueryMemoryDescriptor,
    dst: &mut OutputBuffer,
    de: usize,
    src: &mut OutputBuffer,
    se: usize,
) -> Result<()> {
    for t in &qmd.targets {
        let di = dst.slot_index(qmd, de, t.first_slot);
        let si = src.slot_index(qmd, se, t.first_slot);
        let init = qmd.init_vals[t.first_slot];
        let sv = src.data[si];

        match t.agg {
            Some(AggKind::Count) => {
                dst.data[di] += sv;
            }
            Some(AggKind::Sum) => {
                if t.fp_slot {
                    combine_sum_fp(&mut dst.data[di], sv, init);
                } else if sv != init {
                    if dst.data[di] == init {
                        dst.data[di] = sv;
                    } else {
                        let code = runtime::agg_sum(&mut dst.data[di], sv);
                        runtime::record_error_code(code, &mut dst.error_code);
                    }
                }
            }
            Some(AggKind::Min) => {
                combine_minmax(&mut dst.data[di], sv, init, t.fp_slot, true);
            }
            Some(AggKind::Max) => {
                combine_minmax(&mut dst.data[di], sv, init, t.fp_slot, false);
            }
            Some(AggKind::Avg) => {
                combine_sum_fp(&mut dst.data[di], sv, init);
                let di2 = dst.slot_index(qmd, de, t.first_slot + 1);
                let si2 = src.slot_index(qmd, se, t.first_slot + 1);
                dst.data[di2] += src.data[si2];
            }
            Some(AggKind::CountDistinct | AggKind::ApproxCountDistinct { .. }) => {
                let dst_handle = dst.data[di];
                let src_handle = src.data[si];
                if let Some(src_set) = src.arena.get(src_handle) {
                    if let Some(dst_set) = dst.arena.get_mut(dst_handle) {
                        dst_set.merge(src_set);
                    }
                }
            }
            Some(AggKind::SingleValue) => {
                if sv != init {
                    if dst.data[di] == init {
                        dst.data[di] = sv;
                    } else if dst.data[di] != sv {
                        return Err(Error::SingleValueMultipleRows);
                    }
                }
            }
            // projection targets inside grouped layouts carry the group's
            // representative value; SAMPLE picks the first non-null
            Some(AggKind::Sample) | None => {
                if dst.data[di] == init && sv != init {
                    dst.data[di] = sv;
                }
            }
        }
    }
    Ok(())
}

fn combine_sum_fp(dst: &mut i64, src_bits: i64, init: i64) {
    if src_bits == init {
        return;
    }
    if *dst == init {
        *dst = src_bits;
    } else {
        let sum = f64::from_bits(*dst as u64) + f64::from_bits(src_bits as u64);
        *dst = sum.to_bits() as i64;
    }
}

fn combine_minmax(dst: &mut i64, src: i64, init: i64, fp: bool, is_min: bool) {
    if src == init {
        return;
    }
    if *dst == init {
        *dst = src;
        return;
    }
    if fp {
        let a = f64::from_bits(*dst as u64);
        let b = f64::from_bits(src as u64);
        let r = if is_min { a.min(b) } else { a.max(b) };
        *dst = r.to_bits() as i64;
    } else {
        *dst = if is_min {
            (*dst).min(src)
        } else {
            (*dst).max(src)
        };
    }
}
