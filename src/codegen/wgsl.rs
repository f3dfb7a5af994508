//! WGSL generation: the GPU rendition of the row function
//!
//! The same lowering that produces the CPU row function emits WGSL source
//! here for the shapes the GPU path accepts: non-grouped aggregates over
//! 4-byte integer columns with an optional sargable filter. Aggregation goes
//! through the `agg_*_shared` renditions (workgroup shared memory plus a
//! barrier-separated parallel reduction, then one atomic write-back per
//! workgroup), mirroring the CPU intrinsic names at 32-bit width. Wider
//! shapes fall back to CPU dispatch.
//!
//! References:
//! - Harris (2007): optimizing parallel reduction
//! - `HeavyDB` (2017): shared-memory aggregate variants

use crate::descriptor::{QueryLayout, QueryMemoryDescriptor};
use crate::ir::{AggKind, BinOp, Expr, LiteralValue};
use crate::plan::ExecutionUnit;
use crate::types::SqlType;
use crate::SystemConfig;

/// GPU aggregate kinds the generated kernel can reduce
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpuAgg {
    /// COUNT / COUNT(x)
    Count,
    /// SUM over i32
    Sum,
    /// MIN over i32
    Min,
    /// MAX over i32
    Max,
}

impl GpuAgg {
    /// Identity value seeding the shared-memory slots.
    #[must_use]
    pub const fn identity(self) -> i32 {
        match self {
            Self::Count | Self::Sum => 0,
            Self::Min => i32::MAX,
            Self::Max => i32::MIN + 1,
        }
    }

    const fn combine_stmt(self) -> &'static str {
        match self {
            Self::Count | Self::Sum => {
                "shared_slots[tid] = shared_slots[tid] + shared_slots[tid + stride];"
            }
            Self::Min => {
                "shared_slots[tid] = min(shared_slots[tid], shared_slots[tid + stride]);"
            }
            Self::Max => {
                "shared_slots[tid] = max(shared_slots[tid], shared_slots[tid + stride]);"
            }
        }
    }

    const fn write_back_stmt(self) -> &'static str {
        match self {
            Self::Count | Self::Sum => "atomicAdd(&output[0], shared_slots[0]);",
            Self::Min => "atomicMin(&output[0], shared_slots[0]);",
            Self::Max => "atomicMax(&output[0], shared_slots[0]);",
        }
    }
}

/// A generated GPU kernel: source, entry point, and launch facts.
#[derive(Debug, Clone)]
pub struct WgslKernel {
    /// WGSL source
    pub source: String,
    /// Kernel entry point name
    pub entry_point: String,
    /// Aggregate the output slot holds
    pub agg: GpuAgg,
    /// Input column index the kernel scans
    pub column: usize,
    /// Filter column when it differs from the scanned column
    pub filter_column: Option<usize>,
    /// Whether the kernel reads the hoisted literal buffer
    pub needs_literals: bool,
    /// Hoisted filter literal (uploaded as the literal buffer)
    pub literals: Vec<i32>,
}

/// Filter shape the GPU path accepts: `col <op> int-literal`.
struct GpuFilter {
    column: usize,
    op: &'static str,
    value: i32,
}

/// Try to emit a GPU kernel for this unit. `None` means the shape is outside
/// the GPU surface and the dispatcher should keep the fragment on CPU.
#[must_use]
pub fn generate(
    unit: &ExecutionUnit,
    qmd: &QueryMemoryDescriptor,
    config: &SystemConfig,
) -> Option<WgslKernel> {
    if qmd.layout != QueryLayout::NonGroupedAggregate
        || !unit.joins.is_empty()
        || unit.targets.len() != 1
    {
        return None;
    }

    let target = &unit.targets[0];
    // every GPU shape scans one 4-byte integer column; COUNT(*) has no
    // column to size the scan by, so it stays on CPU
    let (agg, column) = match (target.agg, &target.expr) {
        (
            Some(AggKind::Count),
            Expr::ColumnRef {
                column_idx, ty, ..
            },
        ) if ty.ty == SqlType::Int => (GpuAgg::Count, *column_idx),
        (
            Some(AggKind::Sum),
            Expr::ColumnRef {
                column_idx, ty, ..
            },
        ) if ty.ty == SqlType::Int => (GpuAgg::Sum, *column_idx),
        (
            Some(AggKind::Min),
            Expr::ColumnRef {
                column_idx, ty, ..
            },
        ) if ty.ty == SqlType::Int => (GpuAgg::Min, *column_idx),
        (
            Some(AggKind::Max),
            Expr::ColumnRef {
                column_idx, ty, ..
            },
        ) if ty.ty == SqlType::Int => (GpuAgg::Max, *column_idx),
        _ => return None,
    };

    let all_quals: Vec<&Expr> = unit.simple_quals.iter().chain(&unit.quals).collect();
    let filter = match all_quals.as_slice() {
        [] => None,
        [q] => Some(gpu_filter(q)?),
        _ => return None,
    };

    let nullable = match &target.expr {
        Expr::ColumnRef { ty, .. } => ty.nullable,
        _ => false,
    };

    Some(emit(
        agg,
        column,
        filter.as_ref(),
        nullable,
        config,
        qmd.blocks_share_memory,
    ))
}

fn gpu_filter(q: &Expr) -> Option<GpuFilter> {
    let Expr::Binary { op, lhs, rhs } = q else {
        return None;
    };
    let Expr::ColumnRef {
        column_idx, ty, ..
    } = lhs.as_ref()
    else {
        return None;
    };
    if ty.ty != SqlType::Int {
        return None;
    }
    let Expr::Literal {
        value: LiteralValue::Int(v),
        ..
    } = rhs.as_ref()
    else {
        return None;
    };
    let op = match op {
        BinOp::Gt => ">",
        BinOp::Ge => ">=",
        BinOp::Lt => "<",
        BinOp::Le => "<=",
        BinOp::Eq => "==",
        BinOp::Ne => "!=",
        _ => return None,
    };
    Some(GpuFilter {
        column: *column_idx,
        op,
        value: i32::try_from(*v).ok()?,
    })
}

fn emit(
    agg: GpuAgg,
    column: usize,
    filter: Option<&GpuFilter>,
    nullable: bool,
    config: &SystemConfig,
    shared: bool,
) -> WgslKernel {
    let hoisted = config.hoist_literals && filter.is_some();
    let entry_point = if hoisted {
        "multifrag_query_hoisted_literals"
    } else {
        "multifrag_query"
    };

    let identity = agg.identity();
    let combine = agg.combine_stmt();
    let write_back = agg.write_back_stmt();

    let filter_binding = if hoisted {
        "@group(0) @binding(2) var<storage, read> literals: array<i32>;\n"
    } else {
        ""
    };
    let filter_col_binding = match filter {
        Some(f) if f.column != column => format!(
            "@group(0) @binding(3) var<storage, read> filter_col: array<i32>; // column {}\n",
            f.column
        ),
        _ => String::new(),
    };

    let load_filter_val = match filter {
        Some(f) if f.column != column => "let fval = filter_col[gid];",
        _ => "let fval = data;",
    };
    let filter_check = match filter {
        Some(f) if hoisted => format!("fval {} literals[0]", f.op),
        Some(f) => format!("fval {} {}", f.op, f.value),
        None => "true".to_string(),
    };
    let null_check = if nullable {
        "data != NULL_INT"
    } else {
        "true"
    };
    let accum = match agg {
        GpuAgg::Count => "value = 1;",
        _ => "value = data;",
    };
    let agg_name = match agg {
        GpuAgg::Count => "count",
        GpuAgg::Sum => "sum",
        GpuAgg::Min => "min",
        GpuAgg::Max => "max",
    };

    let source = if shared {
        format!(
            r"// generated aggregate kernel: {agg:?} over column {column}

const NULL_INT: i32 = -2147483648;

@group(0) @binding(0) var<storage, read> input: array<i32>;
@group(0) @binding(1) var<storage, read_write> output: array<atomic<i32>>;
{filter_binding}{filter_col_binding}
var<workgroup> shared_slots: array<i32, 256>;

// agg_{agg_name}_shared: shared-memory update + warp-style tree reduction
@compute @workgroup_size(256)
fn {entry_point}(@builtin(global_invocation_id) global_id: vec3<u32>,
                 @builtin(local_invocation_id) local_id: vec3<u32>) {{
    let tid = local_id.x;
    let gid = global_id.x;
    let input_size = arrayLength(&input);

    // init shared mem prelude
    var value: i32 = {identity};
    if (gid < input_size) {{
        let data = input[gid];
        {load_filter_val}
        if (({filter_check}) && ({null_check})) {{
            {accum}
        }}
    }}
    shared_slots[tid] = value;
    workgroupBarrier();

    // tree reduction; barrier between update and write-back
    var stride = 128u;
    while (stride > 0u) {{
        if (tid < stride) {{
            {combine}
        }}
        workgroupBarrier();
        stride = stride / 2u;
    }}

    if (tid == 0u) {{
        {write_back}
    }}
}}
"
        )
    } else {
        // blocks do not share memory: every thread writes the global slot
        // through its atomic directly
        let direct_write = match agg {
            GpuAgg::Count | GpuAgg::Sum => "atomicAdd(&output[0], value);",
            GpuAgg::Min => "atomicMin(&output[0], value);",
            GpuAgg::Max => "atomicMax(&output[0], value);",
        };
        format!(
            r"// generated aggregate kernel: {agg:?} over column {column}

const NULL_INT: i32 = -2147483648;

@group(0) @binding(0) var<storage, read> input: array<i32>;
@group(0) @binding(1) var<storage, read_write> output: array<atomic<i32>>;
{filter_binding}{filter_col_binding}
// agg_{agg_name}: direct atomic update, no shared-memory stage
@compute @workgroup_size(256)
fn {entry_point}(@builtin(global_invocation_id) global_id: vec3<u32>) {{
    let gid = global_id.x;
    let input_size = arrayLength(&input);
    if (gid >= input_size) {{
        return;
    }}
    let data = input[gid];
    {load_filter_val}
    var value: i32 = {identity};
    if (({filter_check}) && ({null_check})) {{
        {accum}
        {direct_write}
    }}
}}
"
        )
    };

    WgslKernel {
        source,
        entry_point: entry_point.to_string(),
        agg,
        column,
        filter_column: filter.and_then(|f| (f.column != column).then_some(f.column)),
        needs_literals: hoisted,
        literals: filter.map(|f| vec![f.value]).unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::Target;
    use crate::storage::{ColumnBuffer, Fragment, TableData};
    use crate::types::TypeInfo;

    fn sum_unit(with_filter: bool) -> (ExecutionUnit, TableData) {
        let ty = TypeInfo::new(SqlType::Int);
        let col = ColumnBuffer::from_i64s(ty, &[1, 2, 3]);
        let table = TableData::new(1, vec![ty], vec![Fragment::new(0, vec![col])]);
        let mut unit = ExecutionUnit::scan(1).with_target(Target::aggregate(
            "s",
            AggKind::Sum,
            Expr::col(0, 0, ty),
        ));
        if with_filter {
            unit = unit.with_simple_qual(Expr::Binary {
                op: BinOp::Gt,
                lhs: Box::new(Expr::col(0, 0, ty)),
                rhs: Box::new(Expr::int_lit(1000, SqlType::Int)),
            });
        }
        (unit, table)
    }

    fn qmd_for(unit: &ExecutionUnit, table: &TableData) -> QueryMemoryDescriptor {
        QueryMemoryDescriptor::choose(unit, &[table], &SystemConfig::default(), 1 << 26).unwrap()
    }

    #[test]
    fn test_generated_source_contains_shared_reduction() {
        let (unit, table) = sum_unit(false);
        let qmd = qmd_for(&unit, &table);
        let kernel = generate(&unit, &qmd, &SystemConfig::default()).unwrap();

        assert_eq!(kernel.entry_point, "multifrag_query");
        assert!(kernel.source.contains("@workgroup_size(256)"));
        assert!(kernel.source.contains("var<workgroup> shared_slots"));
        assert!(kernel.source.contains("workgroupBarrier"));
        assert!(kernel.source.contains("atomicAdd"));
        assert!(kernel.source.contains("agg_sum_shared"));
    }

    #[test]
    fn test_hoisted_filter_reads_literal_buffer() {
        let (unit, table) = sum_unit(true);
        let qmd = qmd_for(&unit, &table);
        let kernel = generate(&unit, &qmd, &SystemConfig::default()).unwrap();

        assert_eq!(kernel.entry_point, "multifrag_query_hoisted_literals");
        assert!(kernel.needs_literals);
        assert_eq!(kernel.literals, vec![1000]);
        assert!(kernel.source.contains("fval > literals[0]"));
        assert!(!kernel.source.contains("> 1000"), "literal not inlined");
    }

    #[test]
    fn test_unhoisted_filter_inlines_immediate() {
        let (unit, table) = sum_unit(true);
        let qmd = qmd_for(&unit, &table);
        let mut config = SystemConfig::default();
        config.hoist_literals = false;
        let kernel = generate(&unit, &qmd, &config).unwrap();
        assert_eq!(kernel.entry_point, "multifrag_query");
        assert!(kernel.source.contains("fval > 1000"));
    }

    #[test]
    fn test_min_uses_atomic_min_write_back() {
        let ty = TypeInfo::new(SqlType::Int);
        let col = ColumnBuffer::from_i64s(ty, &[5, 2, 8]);
        let table = TableData::new(1, vec![ty], vec![Fragment::new(0, vec![col])]);
        let unit = ExecutionUnit::scan(1).with_target(Target::aggregate(
            "m",
            AggKind::Min,
            Expr::col(0, 0, ty),
        ));
        let qmd = qmd_for(&unit, &table);
        let kernel = generate(&unit, &qmd, &SystemConfig::default()).unwrap();
        assert_eq!(kernel.agg, GpuAgg::Min);
        assert!(kernel.source.contains("atomicMin"));
        assert!(kernel.source.contains("min(shared_slots[tid]"));
    }

    #[test]
    fn test_non_shared_variant_writes_atomics_directly() {
        let (unit, table) = sum_unit(false);
        let mut qmd = qmd_for(&unit, &table);
        qmd.blocks_share_memory = false;
        let kernel = generate(&unit, &qmd, &SystemConfig::default()).unwrap();
        assert!(kernel.source.contains("agg_sum:"), "non-shared naming");
        assert!(!kernel.source.contains("shared_slots"));
        assert!(!kernel.source.contains("workgroupBarrier"));
        assert!(kernel.source.contains("atomicAdd(&output[0], value);"));
    }

    #[test]
    fn test_grouped_shape_falls_back_to_cpu() {
        let ty = TypeInfo::new(SqlType::Int);
        let col = ColumnBuffer::from_i64s(ty, &[1, 1, 2]);
        let table = TableData::new(1, vec![ty], vec![Fragment::new(0, vec![col])]);
        let key = Expr::col(0, 0, ty);
        let unit = ExecutionUnit::scan(1)
            .with_group_by(key.clone())
            .with_target(Target::aggregate("n", AggKind::Count, key));
        let qmd = qmd_for(&unit, &table);
        assert!(generate(&unit, &qmd, &SystemConfig::default()).is_none());
    }

    #[test]
    fn test_nullable_column_skips_sentinel() {
        let ty = TypeInfo::nullable(SqlType::Int);
        let col = ColumnBuffer::from_opt_i64s(ty, &[Some(1), None]);
        let table = TableData::new(1, vec![ty], vec![Fragment::new(0, vec![col])]);
        let unit = ExecutionUnit::scan(1).with_target(Target::aggregate(
            "s",
            AggKind::Sum,
            Expr::col(0, 0, ty),
        ));
        let qmd = qmd_for(&unit, &table);
        let kernel = generate(&unit, &qmd, &SystemConfig::default()).unwrap();
        assert!(kernel.source.contains("data != NULL_INT"));
    }
}
