//! Code generator: lowers (execution unit, memory descriptor) into a
//! compiled kernel
//!
//! The compiled form is a row function (the diamond composition of qual
//! checks, join probes, group-value lookup and per-target aggregator calls)
//! plus a per-device literal buffer and, for GPU dispatch, generated WGSL
//! source compiled through the shader cache. Expression nodes bind their
//! runtime intrinsics as function pointers at lowering time, which is where
//! the "link against the intrinsic module" step of the JIT model lives.
//!
//! References:
//! - Neumann (2011): JIT compilation for queries
//! - `HeavyDB` (2017): row-function diamond and literal hoisting

pub mod expr;
pub mod wgsl;

use crate::descriptor::QueryMemoryDescriptor;
use crate::error::{Error, Result};
use crate::ir::{AggKind, BinOp, Expr, LiteralValue, UnaryOp};
use crate::plan::{ExecutionUnit, JoinType};
use crate::runtime::{self, distinct::CountDistinctArena};
use crate::storage::TableData;
use crate::types::{inline_int_null_value, SqlType, TypeInfo};
use crate::SystemConfig;
use expr::{CompiledExpr, ExtFn};
use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::debug;

/// Target device of a compiled kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    /// Host threads
    Cpu,
    /// WebGPU device
    Gpu,
}

/// One aggregate update operation, resolved to its intrinsic at lowering
/// time. Values arrive as 64-bit slots; fp variants reinterpret bits.
#[derive(Debug, Clone, Copy)]
pub enum AggOp {
    /// Plain projection write
    Project,
    /// COUNT / COUNT(x); `skip_val` skips the operand's null (bit) pattern
    Count {
        /// Null bit pattern to skip, `None` for COUNT(*)
        skip_val: Option<i64>,
    },
    /// Integer SUM with overflow detection
    SumInt {
        /// Null sentinel to skip
        skip_val: Option<i64>,
    },
    /// Floating SUM
    SumFp {
        /// Null sentinel to skip
        skip_val: Option<f64>,
    },
    /// Integer MIN
    MinInt {
        /// Null sentinel to skip
        skip_val: Option<i64>,
    },
    /// Integer MAX
    MaxInt {
        /// Null sentinel to skip
        skip_val: Option<i64>,
    },
    /// Floating MIN
    MinFp {
        /// Null sentinel to skip
        skip_val: Option<f64>,
    },
    /// Floating MAX
    MaxFp {
        /// Null sentinel to skip
        skip_val: Option<f64>,
    },
    /// AVG: floating sum slot + count slot
    Avg {
        /// Null sentinel to skip
        skip_val: Option<f64>,
    },
    /// SAMPLE: first write wins (write-once diamond)
    Sample {
        /// Slot emptiness sentinel
        empty: i64,
    },
    /// SINGLE_VALUE: a second distinct value is an error
    SingleValue {
        /// Slot emptiness sentinel
        empty: i64,
    },
    /// Exact count distinct through the bitmap in the arena
    CountDistinctBitmap {
        /// Bitmap base
        min_val: i64,
        /// Null sentinel to skip
        skip_val: Option<i64>,
    },
    /// Exact count distinct through the fallback set
    CountDistinctSet {
        /// Null sentinel to skip
        skip_val: Option<i64>,
    },
    /// HLL approximate count distinct
    ApproxCountDistinct {
        /// Null sentinel to skip
        skip_val: Option<i64>,
    },
}

impl AggOp {
    /// Apply one update. `slot` and `slot2` are buffer indexes resolved by
    /// the kernel from the descriptor (`slot2` only meaningful for AVG).
    pub fn apply(
        self,
        out: &mut [i64],
        slot: usize,
        slot2: usize,
        val: i64,
        arena: &mut CountDistinctArena,
        error: &mut i32,
    ) {
        match self {
            Self::Project => runtime::agg_id(&mut out[slot], val),
            Self::Count { skip_val } => match skip_val {
                Some(skip) => runtime::agg_count_skip_val(&mut out[slot], val, skip),
                None => runtime::agg_count(&mut out[slot], val),
            },
            Self::SumInt { skip_val } => {
                let code = match skip_val {
                    Some(skip) => runtime::agg_sum_skip_val(&mut out[slot], val, skip),
                    None => runtime::agg_sum(&mut out[slot], val),
                };
                if code != runtime::ERR_NONE {
                    runtime::record_error_code(code, error);
                }
            }
            Self::SumFp { skip_val } => {
                let v = f64::from_bits(val as u64);
                match skip_val {
                    Some(skip) => runtime::agg_sum_double_skip_val(&mut out[slot], v, skip),
                    None => runtime::agg_sum_double(&mut out[slot], v),
                }
            }
            Self::MinInt { skip_val } => match skip_val {
                Some(skip) => runtime::agg_min_skip_val(&mut out[slot], val, skip),
                None => runtime::agg_min(&mut out[slot], val),
            },
            Self::MaxInt { skip_val } => match skip_val {
                Some(skip) => runtime::agg_max_skip_val(&mut out[slot], val, skip),
                None => runtime::agg_max(&mut out[slot], val),
            },
            Self::MinFp { skip_val } => {
                let v = f64::from_bits(val as u64);
                match skip_val {
                    Some(skip) => runtime::agg_min_double_skip_val(&mut out[slot], v, skip),
                    None => runtime::agg_min_double(&mut out[slot], v),
                }
            }
            Self::MaxFp { skip_val } => {
                let v = f64::from_bits(val as u64);
                match skip_val {
                    Some(skip) => runtime::agg_max_double_skip_val(&mut out[slot], v, skip),
                    None => runtime::agg_max_double(&mut out[slot], v),
                }
            }
            Self::Avg { skip_val } => {
                let v = f64::from_bits(val as u64);
                let skip = skip_val.unwrap_or(crate::types::NULL_DOUBLE);
                runtime::agg_sum_double_skip_val(&mut out[slot], v, skip);
                if skip_val.is_none() || v != skip {
                    runtime::agg_count(&mut out[slot2], val);
                }
            }
            Self::Sample { empty } => {
                if out[slot] == empty {
                    runtime::agg_id(&mut out[slot], val);
                }
            }
            Self::SingleValue { empty } => {
                let code = runtime::agg_single_value(&mut out[slot], val, empty);
                if code != runtime::ERR_NONE {
                    runtime::record_error_code(code, error);
                }
            }
            Self::CountDistinctBitmap { min_val, skip_val } => {
                if skip_val != Some(val) {
                    let handle = out[slot];
                    runtime::distinct::agg_count_distinct_bitmap(arena, handle, val, min_val);
                }
            }
            Self::CountDistinctSet { skip_val } => {
                if skip_val != Some(val) {
                    let handle = out[slot];
                    runtime::distinct::agg_count_distinct(arena, handle, val);
                }
            }
            Self::ApproxCountDistinct { skip_val } => {
                if skip_val != Some(val) {
                    let handle = out[slot];
                    runtime::distinct::agg_approximate_count_distinct(arena, handle, val);
                }
            }
        }
    }
}

/// One lowered target
#[derive(Debug)]
pub struct CompiledTarget {
    /// Input expression (COUNT(*) evaluates a constant)
    pub expr: CompiledExpr,
    /// Resolved update operation
    pub op: AggOp,
    /// First slot, from the descriptor
    pub first_slot: usize,
    /// Slots used (2 for AVG)
    pub slots_used: usize,
}

/// One lowered join level
#[derive(Debug)]
pub struct CompiledJoin {
    /// Outer key expression (integer class)
    pub outer_key: CompiledExpr,
    /// Position of the inner input in the unit (`ctx.rows` index)
    pub input_idx: usize,
    /// Join-table position in the kernel's table list
    pub table_idx: usize,
    /// Left outer: a miss still emits the outer row with null padding
    pub left_outer: bool,
}

/// The per-row compiled body
#[derive(Debug)]
pub struct RowFunction {
    /// Sargable quals (also evaluated per row after fragment skipping)
    pub simple_quals: Vec<CompiledExpr>,
    /// General quals
    pub quals: Vec<CompiledExpr>,
    /// Join levels, probed in order
    pub joins: Vec<CompiledJoin>,
    /// Group-key expressions (integer class)
    pub key_exprs: Vec<CompiledExpr>,
    /// Targets with resolved aggregators
    pub targets: Vec<CompiledTarget>,
    /// Poll the interrupt flag in the fragment loop
    pub check_interrupt: bool,
}

/// A compiled kernel: row function + literals + layout + device.
#[derive(Debug)]
pub struct CompiledKernel {
    /// Per-row body
    pub row_func: RowFunction,
    /// Hoisted literal buffer for this device (empty when not hoisting)
    pub literals: Vec<i64>,
    /// Whether literals were hoisted (selects the kernel entry point)
    pub hoisted_literals: bool,
    /// The layout the kernel writes
    pub qmd: Arc<QueryMemoryDescriptor>,
    /// Compilation target
    pub device: DeviceKind,
    /// Generated WGSL source for GPU dispatch, when the shape supports it
    pub wgsl: Option<wgsl::WgslKernel>,
}

/// A whitelisted extension function
#[derive(Clone, Copy)]
pub struct ExtensionFunction {
    /// Expected argument count
    pub arity: usize,
    /// Arguments and result travel as f64 bits
    pub fp: bool,
    /// Implementation
    pub f: ExtFn,
}

/// Registry of extension functions callable from expressions.
pub struct ExtensionRegistry {
    fns: HashMap<String, ExtensionFunction>,
}

fn ext_safe_divide(args: &[i64]) -> i64 {
    let l = f64::from_bits(args[0] as u64);
    let r = f64::from_bits(args[1] as u64);
    runtime::safe_inf_div_f64(l, r, crate::types::NULL_DOUBLE).to_bits() as i64
}

fn ext_decimal_ceil(args: &[i64]) -> i64 {
    runtime::decimal_ceil(args[0], args[1].max(1), i64::MIN)
}

fn ext_decimal_floor(args: &[i64]) -> i64 {
    runtime::decimal_floor(args[0], args[1].max(1), i64::MIN)
}

impl Default for ExtensionRegistry {
    fn default() -> Self {
        let mut fns = HashMap::new();
        fns.insert(
            "safe_divide".to_string(),
            ExtensionFunction {
                arity: 2,
                fp: true,
                f: ext_safe_divide,
            },
        );
        fns.insert(
            "decimal_ceil".to_string(),
            ExtensionFunction {
                arity: 2,
                fp: false,
                f: ext_decimal_ceil,
            },
        );
        fns.insert(
            "decimal_floor".to_string(),
            ExtensionFunction {
                arity: 2,
                fp: false,
                f: ext_decimal_floor,
            },
        );
        Self { fns }
    }
}

impl ExtensionRegistry {
    /// Register a function under a name.
    pub fn register(&mut self, name: impl Into<String>, f: ExtensionFunction) {
        self.fns.insert(name.into(), f);
    }

    /// Look up a registered function.
    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<&ExtensionFunction> {
        self.fns.get(name)
    }
}

/// Literal hoisting: constants dedup into a per-device buffer; expressions
/// load them by offset.
#[derive(Default)]
struct LiteralBuilder {
    values: Vec<i64>,
    dedup: HashMap<i64, usize>,
    hoist: bool,
}

impl LiteralBuilder {
    fn new(hoist: bool) -> Self {
        Self {
            hoist,
            ..Self::default()
        }
    }

    fn lower_int(&mut self, v: i64) -> CompiledExpr {
        if !self.hoist {
            return CompiledExpr::ImmInt(v);
        }
        let offset = *self.dedup.entry(v).or_insert_with(|| {
            self.values.push(v);
            self.values.len() - 1
        });
        CompiledExpr::LoadLiteral { offset }
    }

    fn lower_double(&mut self, v: f64) -> CompiledExpr {
        if !self.hoist {
            return CompiledExpr::ImmDouble(v);
        }
        let bits = v.to_bits() as i64;
        let offset = *self.dedup.entry(bits).or_insert_with(|| {
            self.values.push(bits);
            self.values.len() - 1
        });
        CompiledExpr::LoadLiteral { offset }
    }
}

/// The generator. Stateless apart from the extension whitelist; one
/// instance serves every query.
pub struct CodeGenerator {
    extensions: ExtensionRegistry,
}

impl Default for CodeGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl CodeGenerator {
    /// Generator with the default extension whitelist.
    #[must_use]
    pub fn new() -> Self {
        Self {
            extensions: ExtensionRegistry::default(),
        }
    }

    /// Mutable whitelist access for callers registering extensions.
    pub fn extensions_mut(&mut self) -> &mut ExtensionRegistry {
        &mut self.extensions
    }

    /// Lower a unit against its descriptor for one device.
    ///
    /// # Errors
    /// [`Error::PlanUnsupported`] for IR shapes outside the generator's
    /// surface (window functions, varlen projection of raw text, fp group
    /// keys).
    pub fn compile(
        &self,
        unit: &ExecutionUnit,
        qmd: &Arc<QueryMemoryDescriptor>,
        tables: &[&TableData],
        config: &SystemConfig,
        device: DeviceKind,
    ) -> Result<CompiledKernel> {
        let mut lits = LiteralBuilder::new(config.hoist_literals);

        let lower = |e: &Expr, lits: &mut LiteralBuilder| -> Result<CompiledExpr> {
            self.lower_expr(e, lits, tables)
        };

        let mut simple_quals = Vec::new();
        for q in &unit.simple_quals {
            simple_quals.push(lower(q, &mut lits)?);
        }
        let mut quals = Vec::new();
        for q in &unit.quals {
            quals.push(lower(q, &mut lits)?);
        }

        let mut joins = Vec::new();
        for (table_idx, j) in unit.joins.iter().enumerate() {
            let key_ty = j.outer_key.result_type();
            if key_ty.ty.is_fp() {
                return Err(Error::PlanUnsupported(
                    "floating-point join keys".into(),
                ));
            }
            joins.push(CompiledJoin {
                outer_key: lower(&j.outer_key, &mut lits)?,
                input_idx: j.inner_input_idx,
                table_idx,
                left_outer: j.join_type == JoinType::LeftOuter,
            });
        }

        let mut key_exprs = Vec::new();
        for g in &unit.group_by {
            if g.result_type().ty.is_fp() {
                return Err(Error::PlanUnsupported("floating-point group keys".into()));
            }
            key_exprs.push(lower(g, &mut lits)?);
        }

        let mut targets = Vec::new();
        for (i, t) in unit.targets.iter().enumerate() {
            let slot_info = &qmd.targets[i];
            let operand = t.expr.result_type();
            let mut compiled = lower(&t.expr, &mut lits)?;
            // AVG accumulates as double regardless of operand class
            if matches!(t.agg, Some(AggKind::Avg)) && !operand.ty.is_fp() {
                compiled = CompiledExpr::CastIntToFp {
                    arg: Box::new(compiled),
                    in_null: operand.null_sentinel(),
                    out_null: crate::types::NULL_DOUBLE,
                };
            }
            let empty = qmd.init_vals[slot_info.first_slot];
            let op = agg_op_for(t.agg, operand, qmd.count_distinct[i].as_ref(), empty);
            targets.push(CompiledTarget {
                expr: compiled,
                op,
                first_slot: slot_info.first_slot,
                slots_used: slot_info.slots_used,
            });
        }

        let row_func = RowFunction {
            simple_quals,
            quals,
            joins,
            key_exprs,
            targets,
            check_interrupt: config.watchdog_enable,
        };

        let generated_wgsl = if device == DeviceKind::Gpu {
            wgsl::generate(unit, qmd, config)
        } else {
            None
        };

        debug!(
            device = ?device,
            literals = lits.values.len(),
            hoisted = config.hoist_literals,
            "compiled kernel"
        );

        Ok(CompiledKernel {
            row_func,
            literals: lits.values,
            hoisted_literals: config.hoist_literals,
            qmd: Arc::clone(qmd),
            device,
            wgsl: generated_wgsl,
        })
    }

    #[allow(clippy::too_many_lines)]
    fn lower_expr(
        &self,
        e: &Expr,
        lits: &mut LiteralBuilder,
        tables: &[&TableData],
    ) -> Result<CompiledExpr> {
        let null_bool = inline_int_null_value(SqlType::Boolean);
        match e {
            Expr::Literal { value, ty } => Ok(match value {
                LiteralValue::Null => {
                    if ty.ty.is_fp() {
                        lits.lower_double(crate::types::NULL_DOUBLE)
                    } else {
                        lits.lower_int(ty.null_sentinel())
                    }
                }
                LiteralValue::Int(v) => lits.lower_int(*v),
                LiteralValue::Double(v) => lits.lower_double(*v),
                LiteralValue::Bool(b) => lits.lower_int(i64::from(*b)),
                LiteralValue::Str(s) => {
                    // interned into the transient tier of the column's
                    // dictionary at comparison sites; a bare string literal
                    // has no dictionary context
                    return Err(Error::PlanUnsupported(format!(
                        "free-standing string literal '{s}'"
                    )));
                }
            }),
            Expr::ColumnRef {
                input_idx,
                column_idx,
                ty,
            } => {
                if ty.ty.is_varlen() {
                    return Err(Error::PlanUnsupported(
                        "raw variable-length column access; encode as dictionary text".into(),
                    ));
                }
                Ok(if ty.ty.is_fp() {
                    CompiledExpr::LoadColumnFp {
                        input: *input_idx,
                        column: *column_idx,
                    }
                } else {
                    CompiledExpr::LoadColumnInt {
                        input: *input_idx,
                        column: *column_idx,
                        null_val: ty.null_sentinel(),
                    }
                })
            }
            Expr::Unary { op, arg } => self.lower_unary(op, arg, lits, tables),
            Expr::Binary { op, lhs, rhs } => {
                // dictionary-encoded string comparison lowers to id equality
                if matches!(op, BinOp::Eq | BinOp::Ne) {
                    if let Some(compiled) =
                        self.lower_dict_comparison(*op, lhs, rhs, lits, tables)?
                    {
                        return Ok(compiled);
                    }
                }
                self.lower_binary(*op, lhs, rhs, lits, tables)
            }
            Expr::Case {
                branches,
                else_expr,
            } => {
                let result_ty = e.result_type();
                let mut compiled_branches = Vec::with_capacity(branches.len());
                for (c, r) in branches {
                    compiled_branches.push((
                        self.lower_expr(c, lits, tables)?,
                        self.lower_expr(r, lits, tables)?,
                    ));
                }
                let compiled_else = match else_expr {
                    Some(el) => self.lower_expr(el, lits, tables)?,
                    None => {
                        if result_ty.ty.is_fp() {
                            lits.lower_double(crate::types::NULL_DOUBLE)
                        } else {
                            lits.lower_int(result_ty.null_sentinel())
                        }
                    }
                };
                Ok(CompiledExpr::Case {
                    branches: compiled_branches,
                    else_expr: Box::new(compiled_else),
                })
            }
            Expr::Like {
                arg,
                pattern,
                case_insensitive,
            } => {
                let ty = arg.result_type();
                let SqlType::DictText { .. } = ty.ty else {
                    return Err(Error::PlanUnsupported(
                        "LIKE over a non-dictionary column".into(),
                    ));
                };
                let dict = dictionary_for(arg, tables).ok_or_else(|| {
                    Error::PlanUnsupported("LIKE operand has no dictionary".into())
                })?;
                let mut ids: Vec<i64> = dict
                    .ids_matching(pattern, *case_insensitive)
                    .into_iter()
                    .map(i64::from)
                    .collect();
                ids.sort_unstable();
                Ok(CompiledExpr::InIdSet {
                    arg: Box::new(self.lower_expr(arg, lits, tables)?),
                    ids,
                    null_val: ty.null_sentinel(),
                    null_bool,
                })
            }
            Expr::Extension { name, args, ty: _ } => {
                let ext = self
                    .extensions
                    .lookup(name)
                    .ok_or_else(|| {
                        Error::PlanUnsupported(format!("extension '{name}' is not whitelisted"))
                    })?;
                if ext.arity != args.len() {
                    return Err(Error::PlanUnsupported(format!(
                        "extension '{name}' expects {} arguments, got {}",
                        ext.arity,
                        args.len()
                    )));
                }
                let mut compiled_args = Vec::with_capacity(args.len());
                for a in args {
                    let mut c = self.lower_expr(a, lits, tables)?;
                    if ext.fp && !a.result_type().ty.is_fp() {
                        c = CompiledExpr::CastIntToFp {
                            arg: Box::new(c),
                            in_null: a.result_type().null_sentinel(),
                            out_null: crate::types::NULL_DOUBLE,
                        };
                    }
                    compiled_args.push(c);
                }
                Ok(CompiledExpr::Ext {
                    f: ext.f,
                    args: compiled_args,
                })
            }
            Expr::Window { func } => Err(Error::PlanUnsupported(format!(
                "window function '{func}'"
            ))),
        }
    }

    fn lower_unary(
        &self,
        op: &UnaryOp,
        arg: &Expr,
        lits: &mut LiteralBuilder,
        tables: &[&TableData],
    ) -> Result<CompiledExpr> {
        let arg_ty = arg.result_type();
        let compiled = Box::new(self.lower_expr(arg, lits, tables)?);
        let null_bool = inline_int_null_value(SqlType::Boolean);
        Ok(match op {
            UnaryOp::Not => CompiledExpr::Not {
                arg: compiled,
                null_bool,
            },
            UnaryOp::Neg => {
                if arg_ty.ty.is_fp() {
                    CompiledExpr::NegFp {
                        arg: compiled,
                        null_val: crate::types::NULL_DOUBLE,
                    }
                } else {
                    CompiledExpr::NegInt {
                        arg: compiled,
                        null_val: arg_ty.null_sentinel(),
                    }
                }
            }
            UnaryOp::IsNull => {
                if arg_ty.ty.is_fp() {
                    CompiledExpr::IsNullFp {
                        arg: compiled,
                        null_val: crate::types::NULL_DOUBLE,
                    }
                } else {
                    CompiledExpr::IsNullInt {
                        arg: compiled,
                        null_val: arg_ty.null_sentinel(),
                    }
                }
            }
            UnaryOp::Cast(to) => lower_cast(*to, arg_ty, compiled),
        })
    }

    fn lower_binary(
        &self,
        op: BinOp,
        lhs: &Expr,
        rhs: &Expr,
        lits: &mut LiteralBuilder,
        tables: &[&TableData],
    ) -> Result<CompiledExpr> {
        let null_bool = inline_int_null_value(SqlType::Boolean);
        let lt = lhs.result_type();
        let rt = rhs.result_type();
        let cl = self.lower_expr(lhs, lits, tables)?;
        let cr = self.lower_expr(rhs, lits, tables)?;

        if op.is_logic() {
            let (l, r) = (Box::new(cl), Box::new(cr));
            return Ok(match op {
                BinOp::And => CompiledExpr::And {
                    lhs: l,
                    rhs: r,
                    null_bool,
                },
                _ => CompiledExpr::Or {
                    lhs: l,
                    rhs: r,
                    null_bool,
                },
            });
        }

        let fp_class = lt.ty.is_fp() || rt.ty.is_fp();
        if fp_class {
            // widen integer operands into the floating class
            let widen = |c: CompiledExpr, ty: TypeInfo| {
                if ty.ty.is_fp() {
                    c
                } else {
                    CompiledExpr::CastIntToFp {
                        arg: Box::new(c),
                        in_null: ty.null_sentinel(),
                        out_null: crate::types::NULL_DOUBLE,
                    }
                }
            };
            let l = Box::new(widen(cl, lt));
            let r = Box::new(widen(cr, rt));
            let null_val = crate::types::NULL_DOUBLE;
            return Ok(if op.is_comparison() {
                CompiledExpr::CmpFp {
                    f: fp_cmp_fn(op, lt.nullable, rt.nullable),
                    lhs: l,
                    rhs: r,
                    null_val,
                    null_bool,
                }
            } else if op == BinOp::Div {
                CompiledExpr::DivFp {
                    lhs: l,
                    rhs: r,
                    null_val,
                }
            } else {
                CompiledExpr::ArithFp {
                    f: fp_arith_fn(op),
                    lhs: l,
                    rhs: r,
                    null_val,
                }
            });
        }

        // integer class: translate both sides to a common sentinel
        let common_null = if lt.nullable || !rt.nullable {
            lt.null_sentinel()
        } else {
            rt.null_sentinel()
        };
        let translate = |c: CompiledExpr, ty: TypeInfo| {
            if ty.null_sentinel() == common_null {
                c
            } else {
                CompiledExpr::CastIntToInt {
                    arg: Box::new(c),
                    in_null: ty.null_sentinel(),
                    out_null: common_null,
                }
            }
        };
        let l = Box::new(translate(cl, lt));
        let r = Box::new(translate(cr, rt));

        Ok(if op.is_comparison() {
            CompiledExpr::CmpInt {
                f: int_cmp_fn(op, lt.nullable, rt.nullable),
                lhs: l,
                rhs: r,
                null_val: common_null,
                null_bool,
            }
        } else if matches!(op, BinOp::Div | BinOp::Mod) {
            CompiledExpr::DivModInt {
                is_mod: op == BinOp::Mod,
                lhs: l,
                rhs: r,
                null_val: common_null,
            }
        } else {
            CompiledExpr::ArithInt {
                f: int_arith_fn(op, lt.nullable, rt.nullable),
                lhs: l,
                rhs: r,
                null_val: common_null,
            }
        })
    }

    /// `dict_col = 'literal'` → id equality against the transient-interned
    /// literal id (flows through the literal buffer).
    fn lower_dict_comparison(
        &self,
        op: BinOp,
        lhs: &Expr,
        rhs: &Expr,
        lits: &mut LiteralBuilder,
        tables: &[&TableData],
    ) -> Result<Option<CompiledExpr>> {
        let (col, lit) = match (lhs, rhs) {
            (c @ Expr::ColumnRef { .. }, Expr::Literal { value: LiteralValue::Str(s), .. }) => {
                (c, s)
            }
            (Expr::Literal { value: LiteralValue::Str(s), .. }, c @ Expr::ColumnRef { .. }) => {
                (c, s)
            }
            _ => return Ok(None),
        };
        let ty = col.result_type();
        let SqlType::DictText { .. } = ty.ty else {
            return Ok(None);
        };
        let dict = dictionary_for(col, tables)
            .ok_or_else(|| Error::PlanUnsupported("string column has no dictionary".into()))?;
        let id = dict.get_or_add_transient(lit);
        let compiled_col = self.lower_expr(col, lits, tables)?;
        let compiled_id = lits.lower_int(i64::from(id));
        Ok(Some(CompiledExpr::CmpInt {
            f: int_cmp_fn(op, ty.nullable, false),
            lhs: Box::new(compiled_col),
            rhs: Box::new(compiled_id),
            null_val: ty.null_sentinel(),
            null_bool: inline_int_null_value(SqlType::Boolean),
        }))
    }
}

fn lower_cast(to: TypeInfo, from: TypeInfo, arg: Box<CompiledExpr>) -> CompiledExpr {
    match (from.ty.is_fp(), to.ty.is_fp()) {
        (false, true) => CompiledExpr::CastIntToFp {
            arg,
            in_null: from.null_sentinel(),
            out_null: crate::types::NULL_DOUBLE,
        },
        (true, false) => CompiledExpr::CastFpToInt {
            arg,
            in_null: crate::types::NULL_DOUBLE,
            out_null: to.null_sentinel(),
        },
        (true, true) => *arg,
        (false, false) => match (from.ty, to.ty) {
            // integer → decimal scales the mantissa up
            (f, SqlType::Decimal { scale, .. }) if !f.is_decimal() => {
                CompiledExpr::ScaleDecimal {
                    arg,
                    scale: 10i64.pow(u32::from(scale)),
                    up: true,
                    null_val: from.null_sentinel(),
                }
            }
            // decimal → integer scales down with rounding
            (SqlType::Decimal { scale, .. }, t) if !t.is_decimal() => {
                CompiledExpr::ScaleDecimal {
                    arg,
                    scale: 10i64.pow(u32::from(scale)),
                    up: false,
                    null_val: from.null_sentinel(),
                }
            }
            _ if from.null_sentinel() == to.null_sentinel() => *arg,
            _ => CompiledExpr::CastIntToInt {
                arg,
                in_null: from.null_sentinel(),
                out_null: to.null_sentinel(),
            },
        },
    }
}

fn dictionary_for<'a>(
    col: &Expr,
    tables: &'a [&TableData],
) -> Option<&'a Arc<crate::storage::dictionary::StringDictionary>> {
    let Expr::ColumnRef {
        input_idx,
        column_idx,
        ..
    } = col
    else {
        return None;
    };
    tables.get(*input_idx)?.dictionaries.get(column_idx)
}

fn int_arith_fn(op: BinOp, lhs_nullable: bool, rhs_nullable: bool) -> expr::ArithFn {
    use runtime::*;
    macro_rules! pick {
        ($both:ident, $l:ident, $r:ident) => {
            match (lhs_nullable, rhs_nullable) {
                (true, false) => $l,
                (false, true) => $r,
                _ => $both,
            }
        };
    }
    match op {
        BinOp::Sub => pick!(sub_i64_nullable, sub_i64_nullable_lhs, sub_i64_nullable_rhs),
        BinOp::Mul => pick!(mul_i64_nullable, mul_i64_nullable_lhs, mul_i64_nullable_rhs),
        _ => pick!(add_i64_nullable, add_i64_nullable_lhs, add_i64_nullable_rhs),
    }
}

fn int_cmp_fn(op: BinOp, lhs_nullable: bool, rhs_nullable: bool) -> expr::CmpFn {
    use runtime::*;
    macro_rules! pick {
        ($both:ident, $l:ident, $r:ident) => {
            match (lhs_nullable, rhs_nullable) {
                (true, false) => $l,
                (false, true) => $r,
                _ => $both,
            }
        };
    }
    match op {
        BinOp::Eq => pick!(eq_i64_nullable, eq_i64_nullable_lhs, eq_i64_nullable_rhs),
        BinOp::Ne => pick!(ne_i64_nullable, ne_i64_nullable_lhs, ne_i64_nullable_rhs),
        BinOp::Lt => pick!(lt_i64_nullable, lt_i64_nullable_lhs, lt_i64_nullable_rhs),
        BinOp::Le => pick!(le_i64_nullable, le_i64_nullable_lhs, le_i64_nullable_rhs),
        BinOp::Gt => pick!(gt_i64_nullable, gt_i64_nullable_lhs, gt_i64_nullable_rhs),
        _ => pick!(ge_i64_nullable, ge_i64_nullable_lhs, ge_i64_nullable_rhs),
    }
}

fn fp_arith_fn(op: BinOp) -> expr::FpArithFn {
    match op {
        BinOp::Sub => runtime::sub_f64_nullable,
        BinOp::Mul => runtime::mul_f64_nullable,
        _ => runtime::add_f64_nullable,
    }
}

fn fp_cmp_fn(op: BinOp, lhs_nullable: bool, rhs_nullable: bool) -> expr::FpCmpFn {
    use runtime::*;
    macro_rules! pick {
        ($both:ident, $l:ident, $r:ident) => {
            match (lhs_nullable, rhs_nullable) {
                (true, false) => $l,
                (false, true) => $r,
                _ => $both,
            }
        };
    }
    match op {
        BinOp::Eq => pick!(eq_f64_nullable, eq_f64_nullable_lhs, eq_f64_nullable_rhs),
        BinOp::Ne => pick!(ne_f64_nullable, ne_f64_nullable_lhs, ne_f64_nullable_rhs),
        BinOp::Lt => pick!(lt_f64_nullable, lt_f64_nullable_lhs, lt_f64_nullable_rhs),
        BinOp::Le => pick!(le_f64_nullable, le_f64_nullable_lhs, le_f64_nullable_rhs),
        BinOp::Gt => pick!(gt_f64_nullable, gt_f64_nullable_lhs, gt_f64_nullable_rhs),
        _ => pick!(ge_f64_nullable, ge_f64_nullable_lhs, ge_f64_nullable_rhs),
    }
}

fn agg_op_for(
    agg: Option<AggKind>,
    operand: TypeInfo,
    cd: Option<&crate::descriptor::CountDistinctDescriptor>,
    empty: i64,
) -> AggOp {
    let fp = operand.ty.is_fp();
    let int_skip = operand.nullable.then(|| operand.null_sentinel());
    let fp_skip = operand.nullable.then_some(crate::types::NULL_DOUBLE);
    // COUNT/SAMPLE compare raw slot bits, so fp sentinels pass as bit patterns
    let bit_skip = if fp {
        operand
            .nullable
            .then_some(crate::types::NULL_DOUBLE.to_bits() as i64)
    } else {
        int_skip
    };
    match agg {
        None => AggOp::Project,
        Some(AggKind::Count) => AggOp::Count { skip_val: bit_skip },
        Some(AggKind::Sum) => {
            if fp {
                AggOp::SumFp { skip_val: fp_skip }
            } else {
                AggOp::SumInt { skip_val: int_skip }
            }
        }
        Some(AggKind::Min) => {
            if fp {
                AggOp::MinFp { skip_val: fp_skip }
            } else {
                AggOp::MinInt { skip_val: int_skip }
            }
        }
        Some(AggKind::Max) => {
            if fp {
                AggOp::MaxFp { skip_val: fp_skip }
            } else {
                AggOp::MaxInt { skip_val: int_skip }
            }
        }
        Some(AggKind::Avg) => AggOp::Avg { skip_val: fp_skip },
        Some(AggKind::Sample) => AggOp::Sample { empty },
        Some(AggKind::SingleValue) => AggOp::SingleValue { empty },
        Some(AggKind::CountDistinct) => match cd.map(|d| d.impl_kind) {
            Some(crate::descriptor::CountDistinctImpl::Bitmap) => AggOp::CountDistinctBitmap {
                min_val: cd.expect("bitmap descriptor").min_val,
                skip_val: bit_skip,
            },
            _ => AggOp::CountDistinctSet { skip_val: bit_skip },
        },
        Some(AggKind::ApproxCountDistinct { .. }) => {
            AggOp::ApproxCountDistinct { skip_val: bit_skip }
        }
    }
}

// ---------------------------------------------------------------------------
// Kernel cache
// ---------------------------------------------------------------------------

/// Kernel cache key: normalized plan hash, QMD structural hash, device,
/// hoisting flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KernelCacheKey {
    /// Plan-shape fingerprint
    pub plan_hash: u64,
    /// Descriptor structural fingerprint
    pub qmd_hash: u64,
    /// Compilation target
    pub device: DeviceKind,
    /// Hoisted-literals flavor
    pub hoisted_literals: bool,
}

struct CacheInner {
    map: HashMap<KernelCacheKey, Arc<CompiledKernel>>,
    lru: VecDeque<KernelCacheKey>,
}

/// LRU cache of compiled kernels, reader-writer locked.
pub struct KernelCache {
    inner: RwLock<CacheInner>,
    cap: usize,
}

impl KernelCache {
    /// Cache bounded at `cap` kernels.
    #[must_use]
    pub fn new(cap: usize) -> Self {
        Self {
            inner: RwLock::new(CacheInner {
                map: HashMap::new(),
                lru: VecDeque::new(),
            }),
            cap: cap.max(1),
        }
    }

    /// Cached kernel, refreshing recency.
    #[must_use]
    pub fn get(&self, key: &KernelCacheKey) -> Option<Arc<CompiledKernel>> {
        {
            let inner = self.inner.read();
            inner.map.get(key)?;
        }
        let mut inner = self.inner.write();
        if let Some(pos) = inner.lru.iter().position(|k| k == key) {
            inner.lru.remove(pos);
            inner.lru.push_back(*key);
        }
        inner.map.get(key).cloned()
    }

    /// Insert a kernel, evicting the least recently used past capacity.
    pub fn put(&self, key: KernelCacheKey, kernel: Arc<CompiledKernel>) {
        let mut inner = self.inner.write();
        if inner.map.insert(key, kernel).is_none() {
            inner.lru.push_back(key);
        }
        while inner.lru.len() > self.cap {
            if let Some(old) = inner.lru.pop_front() {
                inner.map.remove(&old);
                debug!(?old, "evicted compiled kernel");
            }
        }
    }

    /// Cached kernel count.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().map.len()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
