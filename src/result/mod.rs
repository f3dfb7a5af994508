//! Result sets: typed, iterable views over kernel output buffers
//!
//! A result set owns one output buffer per kernel plus the memory
//! descriptor that fixed their layout. Iteration walks occupied entries and
//! extracts typed target values: fp slots decode from bits, AVG divides its
//! pair, count-distinct slots resolve through the arena, dictionary ids
//! translate through their dictionary handle.

pub mod reduce;
pub mod sort;

mod exchange;

pub use exchange::to_record_batch;

use crate::descriptor::{QueryLayout, QueryMemoryDescriptor};
use crate::ir::AggKind;
use crate::runtime::distinct::CountDistinctArena;
use crate::runtime::groupby::{self, KeyWidth, EMPTY_KEY_32, EMPTY_KEY_64};
use crate::storage::dictionary::StringDictionary;
use crate::types::{Datum, SqlType};
use std::collections::HashMap;
use std::sync::Arc;

/// One kernel's output buffer: the slot qwords plus its side state.
#[derive(Debug)]
pub struct OutputBuffer {
    /// Slot storage
    pub data: Vec<i64>,
    /// Entries in this buffer (kernels allocate the descriptor's count;
    /// reduction may rebuild with a different one)
    pub entry_count: u32,
    /// Matched-tuple counter (projection write cursor)
    pub matched: u64,
    /// Persistent per-kernel error code
    pub error_code: i32,
    /// Count-distinct accumulators addressed by slot handles
    pub arena: CountDistinctArena,
}

impl OutputBuffer {
    /// Allocate and initialize a buffer for the descriptor: key regions to
    /// the empty pattern, slots to their typed init values, count-distinct
    /// slots to freshly allocated arena handles.
    #[must_use]
    pub fn new(qmd: &QueryMemoryDescriptor) -> Self {
        Self::with_entry_count(qmd, qmd.entry_count)
    }

    /// Same, with an explicit entry count (reduction rebuilds).
    #[must_use]
    pub fn with_entry_count(qmd: &QueryMemoryDescriptor, entry_count: u32) -> Self {
        let n = entry_count as usize;
        let mut data = vec![0i64; n * qmd.row_size_quad];
        if qmd.output_columnar {
            groupby::init_group_by_buffer_columnar(
                &mut data,
                entry_count,
                qmd.key_qw_count(),
                &qmd.init_vals,
            );
        } else {
            groupby::init_group_by_buffer(
                &mut data,
                entry_count,
                qmd.key_qw_count(),
                qmd.key_width,
                &qmd.init_vals,
                qmd.keyless.keyless,
            );
        }

        let mut buffer = Self {
            data,
            entry_count,
            matched: 0,
            error_code: 0,
            arena: CountDistinctArena::new(),
        };

        // seed count-distinct slots with arena handles, one accumulator per
        // (entry, distinct target)
        for (t_idx, cd) in qmd.count_distinct.iter().enumerate() {
            let Some(desc) = cd else { continue };
            let first_slot = qmd.targets[t_idx].first_slot;
            for e in 0..n {
                let handle = buffer.arena.alloc(desc.materialize());
                let idx = buffer.slot_index(qmd, e, first_slot);
                buffer.data[idx] = handle;
            }
        }
        buffer
    }

    /// Buffer index of `slot` within `entry`, honoring columnarity against
    /// this buffer's own entry count.
    #[must_use]
    pub fn slot_index(&self, qmd: &QueryMemoryDescriptor, entry: usize, slot: usize) -> usize {
        if qmd.output_columnar {
            let keys = qmd.key_qw_count() * self.entry_count as usize;
            keys + slot * self.entry_count as usize + entry
        } else {
            entry * qmd.row_size_quad + qmd.key_qw_count() + slot
        }
    }

    /// Buffer index of key component `k` within `entry`.
    #[must_use]
    pub fn key_index(&self, qmd: &QueryMemoryDescriptor, entry: usize, k: usize) -> usize {
        if qmd.output_columnar {
            k * self.entry_count as usize + entry
        } else {
            entry * qmd.row_size_quad + k
        }
    }

    /// Whether an entry holds a group / row.
    #[must_use]
    pub fn occupied(&self, qmd: &QueryMemoryDescriptor, entry: usize) -> bool {
        match qmd.layout {
            QueryLayout::Projection => (entry as u64) < self.matched,
            QueryLayout::NonGroupedAggregate => entry == 0,
            _ if qmd.keyless.keyless => {
                // the COUNT presence target is non-zero for touched groups
                let t = &qmd.targets[qmd.keyless.target_index];
                self.data[self.slot_index(qmd, entry, t.first_slot)] != 0
            }
            _ => {
                let first_key = self.data[self.key_index(qmd, entry, 0)];
                match qmd.key_width {
                    KeyWidth::W8 => first_key != EMPTY_KEY_64,
                    #[allow(clippy::cast_possible_truncation)]
                    KeyWidth::W4 => (first_key as i32) != EMPTY_KEY_32,
                }
            }
        }
    }

    /// Extract the stored group key components of an occupied entry.
    #[must_use]
    pub fn key_tuple(&self, qmd: &QueryMemoryDescriptor, entry: usize) -> Vec<i64> {
        match qmd.key_width {
            KeyWidth::W8 => (0..qmd.key_count)
                .map(|k| self.data[self.key_index(qmd, entry, k)])
                .collect(),
            KeyWidth::W4 => {
                let mut out = Vec::with_capacity(qmd.key_count);
                for k in 0..qmd.key_count {
                    let qw = self.data[self.key_index(qmd, entry, k / 2)] as u64;
                    let half = if k % 2 == 0 { qw & 0xFFFF_FFFF } else { qw >> 32 };
                    #[allow(clippy::cast_possible_truncation)]
                    out.push(i64::from(half as u32 as i32));
                }
                out
            }
        }
    }
}

/// A typed result set over one or more output buffers.
#[derive(Debug)]
pub struct ResultSet {
    /// Layout record shared with the kernels that produced the buffers
    pub qmd: Arc<QueryMemoryDescriptor>,
    /// Per-kernel buffers
    pub buffers: Vec<OutputBuffer>,
    /// Dictionary handles by dict id, for string targets
    pub dicts: HashMap<u32, Arc<StringDictionary>>,
    /// Terminal ordering, set by the sort pass: (buffer, entry) coordinates
    row_order: Option<Vec<(usize, usize)>>,
}

impl ResultSet {
    /// Result set over kernel buffers.
    #[must_use]
    pub fn new(
        qmd: Arc<QueryMemoryDescriptor>,
        buffers: Vec<OutputBuffer>,
        dicts: HashMap<u32, Arc<StringDictionary>>,
    ) -> Self {
        Self {
            qmd,
            buffers,
            dicts,
            row_order: None,
        }
    }

    /// Occupied (buffer, entry) coordinates in storage order, or the sorted
    /// order when a sort pass ran.
    #[must_use]
    pub fn entry_coords(&self) -> Vec<(usize, usize)> {
        if let Some(order) = &self.row_order {
            return order.clone();
        }
        let mut coords = Vec::new();
        for (b, buf) in self.buffers.iter().enumerate() {
            for e in 0..buf.entry_count as usize {
                if buf.occupied(&self.qmd, e) {
                    coords.push((b, e));
                }
            }
        }
        coords
    }

    pub(crate) fn set_row_order(&mut self, order: Vec<(usize, usize)>) {
        self.row_order = Some(order);
    }

    /// Result rows.
    #[must_use]
    pub fn rows(&self) -> Vec<Vec<Datum>> {
        self.entry_coords()
            .into_iter()
            .map(|(b, e)| {
                (0..self.qmd.targets.len())
                    .map(|t| self.value_at(b, e, t))
                    .collect()
            })
            .collect()
    }

    /// Row count after occupancy (and any sort/limit pass).
    #[must_use]
    pub fn row_count(&self) -> usize {
        self.entry_coords().len()
    }

    /// Extract one target value.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn value_at(&self, buffer: usize, entry: usize, target: usize) -> Datum {
        let buf = &self.buffers[buffer];
        let qmd = &self.qmd;
        let t = &qmd.targets[target];
        let zero_matched =
            qmd.layout == QueryLayout::NonGroupedAggregate && buf.matched == 0;

        match t.agg {
            Some(AggKind::CountDistinct | AggKind::ApproxCountDistinct { .. }) => {
                if zero_matched {
                    return Datum::Int(0);
                }
                let handle = buf.data[buf.slot_index(qmd, entry, t.first_slot)];
                let size = buf.arena.get(handle).map_or(0, |s| s.size());
                Datum::Int(size as i64)
            }
            Some(AggKind::Avg) => {
                let sum = f64::from_bits(
                    buf.data[buf.slot_index(qmd, entry, t.first_slot)] as u64,
                );
                let count = buf.data[buf.slot_index(qmd, entry, t.first_slot + 1)];
                if count == 0 || sum == crate::types::NULL_DOUBLE {
                    Datum::Null
                } else {
                    Datum::Double(sum / count as f64)
                }
            }
            Some(AggKind::Count) => {
                let v = buf.data[buf.slot_index(qmd, entry, t.first_slot)];
                Datum::Int(v)
            }
            _ => {
                if zero_matched {
                    return Datum::Null;
                }
                let raw = buf.data[buf.slot_index(qmd, entry, t.first_slot)];
                // MIN/MAX slots still at their extreme init never saw a row
                if matches!(t.agg, Some(AggKind::Min | AggKind::Max))
                    && raw == qmd.init_vals[t.first_slot]
                {
                    return Datum::Null;
                }
                self.decode_slot(raw, target)
            }
        }
    }

    fn decode_slot(&self, raw: i64, target: usize) -> Datum {
        let t = &self.qmd.targets[target];
        if t.fp_slot {
            let v = f64::from_bits(raw as u64);
            if v == crate::types::NULL_DOUBLE {
                Datum::Null
            } else {
                Datum::Double(v)
            }
        } else if let SqlType::DictText { dict_id } = t.result_type.ty {
            if raw == t.result_type.null_sentinel() {
                return Datum::Null;
            }
            #[allow(clippy::cast_possible_truncation)]
            let id = raw as i32;
            match self.dicts.get(&dict_id).and_then(|d| d.string(id)) {
                Some(s) => Datum::Str(s),
                None => Datum::Null,
            }
        } else if t.operand_type.nullable && raw == t.operand_type.null_sentinel() {
            Datum::Null
        } else {
            Datum::Int(raw)
        }
    }
}
