//! Query memory descriptor: the single source of truth for output layout
//!
//! Given an execution unit, fragment metadata and config, exactly one
//! descriptor is chosen, deterministically, and is immutable thereafter.
//! Codegen and result-set iteration both read layout facts from here and
//! nowhere else: hash kind, entry count, key width, keyless flag, slot
//! offsets, columnar flag, count-distinct representations, streaming top-N.

use crate::error::{Error, Result};
use crate::ir::{AggKind, Expr};
use crate::plan::ExecutionUnit;
use crate::runtime::distinct::CountDistinctSet;
use crate::runtime::groupby::KeyWidth;
use crate::storage::TableData;
use crate::types::{SqlType, TypeInfo};
use crate::SystemConfig;
use std::hash::{Hash, Hasher};

/// Output-buffer hash kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryLayout {
    /// No grouping, no aggregation: one output entry per matched row
    Projection,
    /// Aggregation without grouping: a single entry
    NonGroupedAggregate,
    /// Single dense integer group key addressed directly
    PerfectHashOneCol,
    /// Multiple dense keys, offsets composed from per-key strides
    PerfectHashMulti,
    /// Open-addressed hash for arbitrary keys
    BaselineHash,
}

impl QueryLayout {
    /// Whether the layout materializes group keys in the buffer.
    #[must_use]
    pub const fn is_perfect(self) -> bool {
        matches!(self, Self::PerfectHashOneCol | Self::PerfectHashMulti)
    }
}

/// Dense-range facts about one group-by key, from fragment metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ColRangeInfo {
    /// Smallest key value
    pub min: i64,
    /// Largest key value
    pub max: i64,
    /// Bucket width (1 for unbucketized keys)
    pub bucket: i64,
    /// Whether the key column holds nulls
    pub has_nulls: bool,
}

impl ColRangeInfo {
    /// Entries a perfect hash over this range would need.
    #[must_use]
    pub fn entry_span(&self) -> u64 {
        if self.max < self.min {
            return 0;
        }
        let span = (self.max - self.min) as u64 / self.bucket.max(1) as u64;
        span + 1
    }
}

/// Count-distinct representation for one target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CountDistinctImpl {
    /// Bitmap addressed by `value − min_val`
    Bitmap,
    /// Exact set fallback
    StdSet,
    /// HLL sketch
    Sketch,
}

/// Count-distinct decision record for one target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CountDistinctDescriptor {
    /// Chosen representation
    pub impl_kind: CountDistinctImpl,
    /// Bitmap base value
    pub min_val: i64,
    /// Bitmap width in bits
    pub range_bits: u64,
    /// HLL precision for sketches
    pub hll_bits: u8,
}

impl CountDistinctDescriptor {
    /// Allocate one accumulator of the described representation.
    #[must_use]
    pub fn materialize(&self) -> CountDistinctSet {
        match self.impl_kind {
            CountDistinctImpl::Bitmap => CountDistinctSet::bitmap(self.min_val, self.range_bits),
            CountDistinctImpl::StdSet => CountDistinctSet::std_set(),
            CountDistinctImpl::Sketch => CountDistinctSet::sketch(self.hll_bits),
        }
    }
}

/// Keyless eligibility record: when keyless, `target_index` names the COUNT
/// target whose slot doubles as the presence indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeylessInfo {
    /// No key materialized; entry index alone identifies the group
    pub keyless: bool,
    /// Presence-indicator target for keyless buffers
    pub target_index: usize,
}

/// Slot layout and extraction facts for one target
#[derive(Debug, Clone, PartialEq)]
pub struct TargetSlotInfo {
    /// Output column name
    pub name: String,
    /// First aggregate slot (qword index within the entry's slot region)
    pub first_slot: usize,
    /// Occupied slots: 2 for AVG, 1 otherwise
    pub slots_used: usize,
    /// Slot holds f64 bits
    pub fp_slot: bool,
    /// Logical byte width of the slot's content
    pub logical_width: usize,
    /// Aggregate kind, `None` for projection targets
    pub agg: Option<AggKind>,
    /// Operand type (pre-aggregation)
    pub operand_type: TypeInfo,
    /// Result type exposed by iteration
    pub result_type: TypeInfo,
}

/// Bitmap ranges beyond this switch exact count-distinct to a set/sketch.
pub const MAX_BITMAP_RANGE_BITS: u64 = 1 << 23;
/// Default HLL precision when approximating.
pub const DEFAULT_HLL_BITS: u8 = 11;
/// limit + offset ceiling for streaming top-N heaps.
pub const STREAMING_TOP_N_MAX: usize = 10_000;

/// The descriptor. Constructed only through [`QueryMemoryDescriptor::choose`].
#[derive(Debug, Clone, PartialEq)]
pub struct QueryMemoryDescriptor {
    /// Hash kind
    pub layout: QueryLayout,
    /// Output entries
    pub entry_count: u32,
    /// Keyless record
    pub keyless: KeylessInfo,
    /// Group key count
    pub key_count: usize,
    /// Physical key width
    pub key_width: KeyWidth,
    /// Per-key dense ranges (perfect layouts; first entry drives one-col)
    pub key_ranges: Vec<ColRangeInfo>,
    /// Group key types, extraction order
    pub key_types: Vec<TypeInfo>,
    /// Per-target slot facts
    pub targets: Vec<TargetSlotInfo>,
    /// Aggregate slots per entry
    pub slot_count: usize,
    /// Row-major row size in qwords (key region + slots)
    pub row_size_quad: usize,
    /// Column-major slot storage
    pub output_columnar: bool,
    /// Bounded-heap top-N at reduction time
    pub use_streaming_top_n: bool,
    /// Per-target count-distinct decisions
    pub count_distinct: Vec<Option<CountDistinctDescriptor>>,
    /// Per-slot init values (the typed "empty" sentinels)
    pub init_vals: Vec<i64>,
    /// GPU threads per block
    pub gpu_block_size: u32,
    /// GPU kernels reduce through shared memory before the atomic
    /// write-back (single-slot outputs only)
    pub blocks_share_memory: bool,
}

impl QueryMemoryDescriptor {
    /// Run the deterministic choice procedure.
    ///
    /// `tables` maps the unit's input order; `max_output_bytes` is the
    /// chosen device's allocation cap for the output buffer.
    ///
    /// # Errors
    /// [`Error::QmdInfeasible`] when no layout fits the cap,
    /// [`Error::CardinalityRequired`] when baseline hashing has no usable
    /// entry-count estimate, [`Error::PlanUnsupported`] for shapes the
    /// generator cannot lower.
    pub fn choose(
        unit: &ExecutionUnit,
        tables: &[&TableData],
        config: &SystemConfig,
        max_output_bytes: usize,
    ) -> Result<Self> {
        if unit.targets.is_empty() {
            return Err(Error::PlanUnsupported("no targets".into()));
        }
        for t in &unit.targets {
            if matches!(t.expr, Expr::Window { .. }) {
                return Err(Error::PlanUnsupported(
                    "window functions are not lowered by the row-function generator".into(),
                ));
            }
        }

        // UNION ALL drives every input, so the projection bound covers all
        let outer_rows: usize = if unit.union_all {
            tables.iter().map(|t| t.row_count()).sum()
        } else {
            tables.first().map(|t| t.row_count()).unwrap_or_default()
        };

        // 1. projection
        if unit.group_by.is_empty() && !unit.has_aggregates() {
            let entry_count = unit
                .scan_limit
                .map_or(outer_rows, |lim| lim.min(outer_rows))
                .max(1);
            return Self::assemble(
                unit,
                QueryLayout::Projection,
                u32::try_from(entry_count)
                    .map_err(|_| Error::QmdInfeasible("projection entry count".into()))?,
                KeylessInfo {
                    keyless: true,
                    target_index: 0,
                },
                Vec::new(),
                Vec::new(),
                KeyWidth::W8,
                tables,
                config,
                max_output_bytes,
            );
        }

        // 2. aggregates without grouping
        if unit.group_by.is_empty() {
            return Self::assemble(
                unit,
                QueryLayout::NonGroupedAggregate,
                1,
                KeylessInfo {
                    keyless: true,
                    target_index: 0,
                },
                Vec::new(),
                Vec::new(),
                KeyWidth::W8,
                tables,
                config,
                max_output_bytes,
            );
        }

        let key_types: Vec<TypeInfo> = unit.group_by.iter().map(Expr::result_type).collect();
        let ranges: Vec<Option<ColRangeInfo>> = unit
            .group_by
            .iter()
            .map(|g| group_key_range(g, tables))
            .collect();

        // 3. single dense integer key
        if let [Some(range)] = ranges.as_slice() {
            if unit.group_by.len() == 1 && !range.has_nulls {
                let span = range.entry_span();
                let big_group_threshold = config.big_group_threshold as u64;
                if span > 0 && span <= big_group_threshold {
                    let keyless = keyless_info(unit);
                    return Self::assemble(
                        unit,
                        QueryLayout::PerfectHashOneCol,
                        u32::try_from(span)
                            .map_err(|_| Error::QmdInfeasible("perfect hash span".into()))?,
                        keyless,
                        vec![*range],
                        key_types,
                        KeyWidth::W8,
                        tables,
                        config,
                        max_output_bytes,
                    );
                }
            }
        }

        // 4. multiple dense keys whose span product stays small
        if unit.group_by.len() > 1 && ranges.iter().all(|r| r.is_some_and(|r| !r.has_nulls)) {
            let spans: Vec<u64> = ranges
                .iter()
                .map(|r| r.expect("checked above").entry_span())
                .collect();
            let product = spans.iter().try_fold(1u64, |acc, &s| acc.checked_mul(s));
            if let Some(product) = product {
                if product > 0 && product <= config.big_group_threshold as u64 {
                    let key_ranges: Vec<ColRangeInfo> =
                        ranges.iter().map(|r| r.expect("checked above")).collect();
                    return Self::assemble(
                        unit,
                        QueryLayout::PerfectHashMulti,
                        u32::try_from(product)
                            .map_err(|_| Error::QmdInfeasible("perfect hash product".into()))?,
                        KeylessInfo {
                            keyless: false,
                            target_index: 0,
                        },
                        key_ranges,
                        key_types,
                        KeyWidth::W8,
                        tables,
                        config,
                        max_output_bytes,
                    );
                }
            }
        }

        // 5. baseline hash; entry count from the cardinality hint
        let guessed = unit.cardinality_hint.unwrap_or(outer_rows).max(1);
        if guessed > config.baseline_max_groups {
            return Err(Error::CardinalityRequired {
                max_groups: config.baseline_max_groups,
            });
        }
        // load factor 0.5 keeps probe runs short
        let entry_count = u32::try_from((guessed * 2).next_power_of_two().max(16))
            .map_err(|_| Error::QmdInfeasible("baseline entry count".into()))?;
        let key_width = if ranges.iter().all(|r| {
            r.is_some_and(|r| {
                i32::try_from(r.min).is_ok() && i32::try_from(r.max).is_ok() && !r.has_nulls
            })
        }) {
            KeyWidth::W4
        } else {
            KeyWidth::W8
        };
        Self::assemble(
            unit,
            QueryLayout::BaselineHash,
            entry_count,
            KeylessInfo {
                keyless: false,
                target_index: 0,
            },
            Vec::new(),
            key_types,
            key_width,
            tables,
            config,
            max_output_bytes,
        )
    }

    #[allow(clippy::too_many_arguments, clippy::too_many_lines)]
    fn assemble(
        unit: &ExecutionUnit,
        layout: QueryLayout,
        entry_count: u32,
        keyless: KeylessInfo,
        key_ranges: Vec<ColRangeInfo>,
        key_types: Vec<TypeInfo>,
        key_width: KeyWidth,
        tables: &[&TableData],
        config: &SystemConfig,
        max_output_bytes: usize,
    ) -> Result<Self> {
        let mut targets = Vec::with_capacity(unit.targets.len());
        let mut count_distinct = Vec::with_capacity(unit.targets.len());
        let mut init_vals = Vec::new();
        let mut next_slot = 0usize;

        for t in &unit.targets {
            let operand_type = t.expr.result_type();
            let (slots_used, fp_slot, result_type) = target_shape(t.agg, operand_type);
            let logical_width = result_type.ty.byte_width().unwrap_or(8);
            // aggregate slots are never narrower than their operand
            let logical_width = logical_width.max(operand_type.ty.byte_width().unwrap_or(8));

            targets.push(TargetSlotInfo {
                name: t.name.clone(),
                first_slot: next_slot,
                slots_used,
                fp_slot,
                logical_width,
                agg: t.agg,
                operand_type,
                result_type,
            });

            count_distinct.push(count_distinct_descriptor(t.agg, &t.expr, tables));
            init_vals.extend(slot_init_vals(t.agg, operand_type, fp_slot));
            next_slot += slots_used;
        }

        let key_qw_count = if keyless.keyless {
            0
        } else {
            key_width.key_qw_count(key_types.len())
        };
        let slot_count = next_slot;
        let row_size_quad = key_qw_count + slot_count;

        let total_bytes = entry_count as usize * row_size_quad * 8;
        if total_bytes > max_output_bytes {
            return Err(Error::QmdInfeasible(format!(
                "{entry_count} entries × {row_size_quad} qwords exceeds the {max_output_bytes}-byte cap"
            )));
        }

        let all_fixed_width = targets
            .iter()
            .all(|t| !t.result_type.ty.is_varlen() || matches!(t.result_type.ty, SqlType::DictText { .. }));
        let output_columnar = config.enable_columnar_output
            && all_fixed_width
            && matches!(layout, QueryLayout::Projection | QueryLayout::BaselineHash)
            && key_width == KeyWidth::W8;

        let use_streaming_top_n = config.enable_streaming_top_n
            && layout.is_perfect()
            && unit.sort.as_ref().is_some_and(|s| {
                s.limit
                    .is_some_and(|l| l + s.offset <= STREAMING_TOP_N_MAX)
            });

        Ok(Self {
            layout,
            entry_count,
            keyless,
            key_count: key_types.len(),
            key_width,
            key_ranges,
            key_types,
            targets,
            slot_count,
            row_size_quad,
            output_columnar,
            use_streaming_top_n,
            count_distinct,
            init_vals,
            gpu_block_size: 256,
            blocks_share_memory: layout == QueryLayout::NonGroupedAggregate,
        })
    }

    /// Total output buffer length in qwords.
    #[must_use]
    pub fn buffer_qwords(&self) -> usize {
        self.entry_count as usize * self.row_size_quad
    }

    /// Key region qwords per entry (0 when keyless).
    #[must_use]
    pub fn key_qw_count(&self) -> usize {
        if self.keyless.keyless {
            0
        } else {
            self.key_width.key_qw_count(self.key_count)
        }
    }

    /// Buffer index of `slot` within `entry`, honoring columnarity.
    #[must_use]
    pub fn slot_index(&self, entry: usize, slot: usize) -> usize {
        if self.output_columnar {
            let keys = self.key_qw_count() * self.entry_count as usize;
            keys + slot * self.entry_count as usize + entry
        } else {
            entry * self.row_size_quad + self.key_qw_count() + slot
        }
    }

    /// Buffer index of key component `k` within `entry` (row-major and
    /// columnar; not meaningful for keyless buffers).
    #[must_use]
    pub fn key_index(&self, entry: usize, k: usize) -> usize {
        if self.output_columnar {
            k * self.entry_count as usize + entry
        } else {
            entry * self.row_size_quad + k
        }
    }

    /// Structural fingerprint, part of the kernel cache key.
    #[must_use]
    pub fn structural_hash(&self) -> u64 {
        let mut h = std::collections::hash_map::DefaultHasher::new();
        self.layout.hash(&mut h);
        self.entry_count.hash(&mut h);
        self.keyless.hash(&mut h);
        self.key_count.hash(&mut h);
        self.key_width.hash(&mut h);
        self.key_ranges.hash(&mut h);
        self.slot_count.hash(&mut h);
        self.row_size_quad.hash(&mut h);
        self.output_columnar.hash(&mut h);
        self.use_streaming_top_n.hash(&mut h);
        self.count_distinct.hash(&mut h);
        self.init_vals.hash(&mut h);
        self.gpu_block_size.hash(&mut h);
        self.blocks_share_memory.hash(&mut h);
        for t in &self.targets {
            t.first_slot.hash(&mut h);
            t.slots_used.hash(&mut h);
            t.fp_slot.hash(&mut h);
            t.agg.hash(&mut h);
        }
        h.finish()
    }
}

/// Slot shape per aggregate kind: (slots used, fp slot, result type).
fn target_shape(agg: Option<AggKind>, operand: TypeInfo) -> (usize, bool, TypeInfo) {
    let big = TypeInfo::new(SqlType::BigInt);
    let dbl = TypeInfo::nullable(SqlType::Double);
    match agg {
        None | Some(AggKind::Sample | AggKind::SingleValue | AggKind::Min | AggKind::Max) => {
            (1, operand.ty.is_fp(), operand)
        }
        Some(AggKind::Count | AggKind::CountDistinct | AggKind::ApproxCountDistinct { .. }) => {
            (1, false, big)
        }
        Some(AggKind::Sum) => {
            if operand.ty.is_fp() {
                (1, true, TypeInfo { ty: SqlType::Double, nullable: operand.nullable })
            } else {
                (1, false, TypeInfo { ty: SqlType::BigInt, nullable: operand.nullable })
            }
        }
        Some(AggKind::Avg) => (2, true, dbl),
    }
}

/// Per-slot init values (the typed "empty" sentinels the buffer is seeded
/// with before launch).
fn slot_init_vals(agg: Option<AggKind>, operand: TypeInfo, fp_slot: bool) -> Vec<i64> {
    let null_slot = if fp_slot {
        crate::types::NULL_DOUBLE.to_bits() as i64
    } else {
        operand.null_sentinel()
    };
    match agg {
        Some(AggKind::Count | AggKind::CountDistinct | AggKind::ApproxCountDistinct { .. }) => {
            vec![0]
        }
        Some(AggKind::Avg) => vec![crate::types::NULL_DOUBLE.to_bits() as i64, 0],
        Some(AggKind::Sum) => {
            if operand.nullable {
                vec![null_slot]
            } else if fp_slot {
                vec![0f64.to_bits() as i64]
            } else {
                vec![0]
            }
        }
        Some(AggKind::Min) => {
            if operand.nullable {
                vec![null_slot]
            } else if fp_slot {
                vec![f64::INFINITY.to_bits() as i64]
            } else {
                vec![i64::MAX]
            }
        }
        Some(AggKind::Max) => {
            if operand.nullable {
                vec![null_slot]
            } else if fp_slot {
                vec![f64::NEG_INFINITY.to_bits() as i64]
            } else {
                vec![i64::MIN + 1]
            }
        }
        Some(AggKind::Sample | AggKind::SingleValue) | None => vec![null_slot],
    }
}

/// Dense-range metadata for a group-by expression: available only for plain
/// integral column references with fragment stats.
fn group_key_range(expr: &Expr, tables: &[&TableData]) -> Option<ColRangeInfo> {
    let Expr::ColumnRef {
        input_idx,
        column_idx,
        ty,
    } = expr
    else {
        return None;
    };
    if !ty.ty.is_integral() {
        return None;
    }
    let table = tables.get(*input_idx)?;
    let mut min = i64::MAX;
    let mut max = i64::MIN;
    let mut has_nulls = false;
    for frag in &table.fragments {
        let stats = frag.stats.get(*column_idx)?.as_ref()?;
        min = min.min(stats.min);
        max = max.max(stats.max);
        has_nulls |= stats.has_nulls;
    }
    (min <= max).then_some(ColRangeInfo {
        min,
        max,
        bucket: 1,
        has_nulls,
    })
}

/// Keyless eligibility: single-key perfect hash with a COUNT target whose
/// slot is non-zero for every touched group (non-nullable operand, so it
/// can double as the presence indicator).
fn keyless_info(unit: &ExecutionUnit) -> KeylessInfo {
    let count_target = unit
        .targets
        .iter()
        .position(|t| {
            matches!(t.agg, Some(AggKind::Count)) && !t.expr.result_type().nullable
        });
    match count_target {
        Some(idx) => KeylessInfo {
            keyless: true,
            target_index: idx,
        },
        None => KeylessInfo {
            keyless: false,
            target_index: 0,
        },
    }
}

/// Count-distinct representation choice: bitmap for known small ranges,
/// sketch for approximate targets, exact set otherwise. The switchover is a
/// heuristic on the operand's min/max range, not estimated cardinality.
fn count_distinct_descriptor(
    agg: Option<AggKind>,
    expr: &Expr,
    tables: &[&TableData],
) -> Option<CountDistinctDescriptor> {
    match agg {
        Some(AggKind::ApproxCountDistinct { bits }) => Some(CountDistinctDescriptor {
            impl_kind: CountDistinctImpl::Sketch,
            min_val: 0,
            range_bits: 0,
            hll_bits: bits,
        }),
        Some(AggKind::CountDistinct) => {
            let range = group_key_range(expr, tables);
            match range {
                Some(r) if r.entry_span() <= MAX_BITMAP_RANGE_BITS => {
                    Some(CountDistinctDescriptor {
                        impl_kind: CountDistinctImpl::Bitmap,
                        min_val: r.min,
                        range_bits: r.entry_span(),
                        hll_bits: 0,
                    })
                }
                _ => Some(CountDistinctDescriptor {
                    impl_kind: CountDistinctImpl::StdSet,
                    min_val: 0,
                    range_bits: 0,
                    hll_bits: DEFAULT_HLL_BITS,
                }),
            }
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{SortInfo, Target};
    use crate::storage::{ColumnBuffer, Fragment};

    fn int_table(id: u32, values: &[i64]) -> TableData {
        let ty = TypeInfo::new(SqlType::Int);
        let col = ColumnBuffer::from_i64s(ty, values);
        TableData::new(id, vec![ty], vec![Fragment::new(0, vec![col])])
    }

    fn config() -> SystemConfig {
        SystemConfig::default()
    }

    const CAP: usize = 1 << 26;

    #[test]
    fn test_projection_layout_counts_rows() {
        let table = int_table(1, &[1, 2, 3, 4, 5]);
        let unit = ExecutionUnit::scan(1).with_target(Target::projected(
            "x",
            Expr::col(0, 0, TypeInfo::new(SqlType::Int)),
        ));
        let qmd = QueryMemoryDescriptor::choose(&unit, &[&table], &config(), CAP).unwrap();
        assert_eq!(qmd.layout, QueryLayout::Projection);
        assert_eq!(qmd.entry_count, 5);
        assert!(qmd.keyless.keyless);
        assert_eq!(qmd.row_size_quad, 1);
    }

    #[test]
    fn test_scan_limit_caps_projection_entries() {
        let table = int_table(1, &[1, 2, 3, 4, 5]);
        let mut unit = ExecutionUnit::scan(1).with_target(Target::projected(
            "x",
            Expr::col(0, 0, TypeInfo::new(SqlType::Int)),
        ));
        unit.scan_limit = Some(2);
        let qmd = QueryMemoryDescriptor::choose(&unit, &[&table], &config(), CAP).unwrap();
        assert_eq!(qmd.entry_count, 2);
    }

    #[test]
    fn test_non_grouped_aggregate_single_entry() {
        let table = int_table(1, &[1, 2, 3]);
        let unit = ExecutionUnit::scan(1).with_target(Target::aggregate(
            "s",
            AggKind::Sum,
            Expr::col(0, 0, TypeInfo::new(SqlType::Int)),
        ));
        let qmd = QueryMemoryDescriptor::choose(&unit, &[&table], &config(), CAP).unwrap();
        assert_eq!(qmd.layout, QueryLayout::NonGroupedAggregate);
        assert_eq!(qmd.entry_count, 1);
    }

    #[test]
    fn test_dense_single_key_picks_perfect_hash_keyless() {
        let table = int_table(1, &[1, 1, 2, 2, 2, 3]);
        let key = Expr::col(0, 0, TypeInfo::new(SqlType::Int));
        let unit = ExecutionUnit::scan(1)
            .with_group_by(key.clone())
            .with_target(Target::projected("k", key.clone()))
            .with_target(Target::aggregate("n", AggKind::Count, key));
        let qmd = QueryMemoryDescriptor::choose(&unit, &[&table], &config(), CAP).unwrap();
        assert_eq!(qmd.layout, QueryLayout::PerfectHashOneCol);
        assert_eq!(qmd.entry_count, 3, "range [1,3]");
        assert!(qmd.keyless.keyless, "COUNT target enables keyless");
        assert_eq!(qmd.keyless.target_index, 1);
    }

    #[test]
    fn test_nullable_key_falls_back_to_baseline() {
        let ty = TypeInfo::nullable(SqlType::Int);
        let col = ColumnBuffer::from_opt_i64s(ty, &[Some(1), None, Some(2)]);
        let table = TableData::new(1, vec![ty], vec![Fragment::new(0, vec![col])]);
        let key = Expr::col(0, 0, ty);
        let unit = ExecutionUnit::scan(1)
            .with_group_by(key.clone())
            .with_target(Target::aggregate("n", AggKind::Count, key));
        let qmd = QueryMemoryDescriptor::choose(&unit, &[&table], &config(), CAP).unwrap();
        assert_eq!(qmd.layout, QueryLayout::BaselineHash);
        assert!(!qmd.keyless.keyless);
    }

    #[test]
    fn test_wide_range_key_prefers_baseline() {
        let table = int_table(1, &[0, 1_000_000_000]);
        let key = Expr::col(0, 0, TypeInfo::new(SqlType::Int));
        let unit = ExecutionUnit::scan(1)
            .with_group_by(key.clone())
            .with_target(Target::aggregate("n", AggKind::Count, key));
        let qmd = QueryMemoryDescriptor::choose(&unit, &[&table], &config(), CAP).unwrap();
        assert_eq!(qmd.layout, QueryLayout::BaselineHash);
        assert_eq!(qmd.key_width, KeyWidth::W4, "i32-range keys compact");
    }

    #[test]
    fn test_multi_key_dense_product_picks_perfect_multi() {
        let ty = TypeInfo::new(SqlType::Int);
        let a = ColumnBuffer::from_i64s(ty, &[0, 1, 2]);
        let b = ColumnBuffer::from_i64s(ty, &[5, 6, 7]);
        let table = TableData::new(1, vec![ty, ty], vec![Fragment::new(0, vec![a, b])]);
        let unit = ExecutionUnit::scan(1)
            .with_group_by(Expr::col(0, 0, ty))
            .with_group_by(Expr::col(0, 1, ty))
            .with_target(Target::aggregate("n", AggKind::Count, Expr::col(0, 0, ty)));
        let qmd = QueryMemoryDescriptor::choose(&unit, &[&table], &config(), CAP).unwrap();
        assert_eq!(qmd.layout, QueryLayout::PerfectHashMulti);
        assert_eq!(qmd.entry_count, 9, "3 × 3 span product");
    }

    #[test]
    fn test_entry_cap_is_enforced() {
        let table = int_table(1, &[1, 2, 3]);
        let key = Expr::col(0, 0, TypeInfo::new(SqlType::Int));
        let unit = ExecutionUnit::scan(1)
            .with_group_by(key.clone())
            .with_target(Target::aggregate("n", AggKind::Count, key));
        let err = QueryMemoryDescriptor::choose(&unit, &[&table], &config(), 16).unwrap_err();
        assert!(matches!(err, Error::QmdInfeasible(_)));
    }

    #[test]
    fn test_avg_occupies_two_slots() {
        let table = int_table(1, &[1, 2, 3]);
        let col = Expr::col(0, 0, TypeInfo::new(SqlType::Int));
        let unit = ExecutionUnit::scan(1)
            .with_target(Target::aggregate("a", AggKind::Avg, col.clone()))
            .with_target(Target::aggregate("m", AggKind::Max, col));
        let qmd = QueryMemoryDescriptor::choose(&unit, &[&table], &config(), CAP).unwrap();
        assert_eq!(qmd.targets[0].slots_used, 2);
        assert_eq!(qmd.targets[1].first_slot, 2, "MAX slot follows the AVG pair");
        assert_eq!(qmd.slot_count, 3);
        assert_eq!(qmd.init_vals.len(), 3);
    }

    #[test]
    fn test_count_distinct_picks_bitmap_for_small_range() {
        let table = int_table(1, &[10, 20, 30]);
        let col = Expr::col(0, 0, TypeInfo::new(SqlType::Int));
        let unit = ExecutionUnit::scan(1).with_target(Target::aggregate(
            "d",
            AggKind::CountDistinct,
            col,
        ));
        let qmd = QueryMemoryDescriptor::choose(&unit, &[&table], &config(), CAP).unwrap();
        let cd = qmd.count_distinct[0].unwrap();
        assert_eq!(cd.impl_kind, CountDistinctImpl::Bitmap);
        assert_eq!(cd.min_val, 10);
        assert_eq!(cd.range_bits, 21);
    }

    #[test]
    fn test_approx_count_distinct_picks_sketch() {
        let table = int_table(1, &[1, 2, 3]);
        let col = Expr::col(0, 0, TypeInfo::new(SqlType::Int));
        let unit = ExecutionUnit::scan(1).with_target(Target::aggregate(
            "d",
            AggKind::ApproxCountDistinct { bits: 12 },
            col,
        ));
        let qmd = QueryMemoryDescriptor::choose(&unit, &[&table], &config(), CAP).unwrap();
        let cd = qmd.count_distinct[0].unwrap();
        assert_eq!(cd.impl_kind, CountDistinctImpl::Sketch);
        assert_eq!(cd.hll_bits, 12);
    }

    #[test]
    fn test_streaming_top_n_requires_perfect_hash_and_small_limit() {
        let table = int_table(1, &[1, 2, 3]);
        let key = Expr::col(0, 0, TypeInfo::new(SqlType::Int));
        let sorted = ExecutionUnit::scan(1)
            .with_group_by(key.clone())
            .with_target(Target::projected("k", key.clone()))
            .with_target(Target::aggregate("n", AggKind::Count, key.clone()))
            .with_sort(SortInfo {
                order: vec![crate::plan::OrderEntry {
                    target_idx: 1,
                    descending: true,
                    nulls_first: false,
                }],
                limit: Some(10),
                offset: 0,
            });
        let qmd = QueryMemoryDescriptor::choose(&sorted, &[&table], &config(), CAP).unwrap();
        assert!(qmd.use_streaming_top_n);

        let mut huge = sorted.clone();
        huge.sort.as_mut().unwrap().limit = Some(STREAMING_TOP_N_MAX + 1);
        let qmd = QueryMemoryDescriptor::choose(&huge, &[&table], &config(), CAP).unwrap();
        assert!(!qmd.use_streaming_top_n);
    }

    #[test]
    fn test_choice_is_deterministic() {
        let table = int_table(1, &[1, 1, 2, 3]);
        let key = Expr::col(0, 0, TypeInfo::new(SqlType::Int));
        let unit = ExecutionUnit::scan(1)
            .with_group_by(key.clone())
            .with_target(Target::aggregate("n", AggKind::Count, key));
        let a = QueryMemoryDescriptor::choose(&unit, &[&table], &config(), CAP).unwrap();
        let b = QueryMemoryDescriptor::choose(&unit, &[&table], &config(), CAP).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.structural_hash(), b.structural_hash());
    }

    #[test]
    fn test_slot_index_row_major_vs_columnar() {
        let table = int_table(1, &[1, 2, 3]);
        let unit = ExecutionUnit::scan(1).with_target(Target::projected(
            "x",
            Expr::col(0, 0, TypeInfo::new(SqlType::Int)),
        ));
        let mut qmd = QueryMemoryDescriptor::choose(&unit, &[&table], &config(), CAP).unwrap();
        qmd.output_columnar = false;
        assert_eq!(qmd.slot_index(2, 0), 2);
        qmd.output_columnar = true;
        assert_eq!(qmd.slot_index(2, 0), 2);
    }
}
