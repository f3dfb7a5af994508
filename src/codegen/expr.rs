//! Compiled expressions: IR lowered to evaluator trees whose nodes hold
//! resolved runtime-intrinsic function pointers
//!
//! Lowering picks the exact null-variant of each intrinsic (both/lhs/rhs)
//! from operand nullability, folds literals into the hoisted literal buffer,
//! rewrites dictionary-string comparisons to id comparisons, and guards
//! divisions so the row function records an error code instead of faulting.
//! Values travel as 64-bit slots: integer class sign-extended, floating
//! class as f64 bits.

use crate::runtime;
use crate::storage::ColumnBuffer;

/// Integer arithmetic intrinsic: (lhs, rhs, null sentinel) → value
pub type ArithFn = fn(i64, i64, i64) -> i64;
/// Integer comparison intrinsic: (lhs, rhs, null, bool null) → 0/1/null
pub type CmpFn = fn(i64, i64, i64, i64) -> i64;
/// Floating arithmetic intrinsic
pub type FpArithFn = fn(f64, f64, f64) -> f64;
/// Floating comparison intrinsic
pub type FpCmpFn = fn(f64, f64, f64, i64) -> i64;
/// Whitelisted extension function over slot values
pub type ExtFn = fn(&[i64]) -> i64;

/// Per-row evaluation context handed to the row function by the outer
/// kernel: column views per input table, the current row per input, and the
/// device literal buffer.
pub struct RowCtx<'a> {
    /// Column views, one list per input table, for the current fragments
    pub tables: &'a [Vec<ColumnBuffer>],
    /// Current row id per input; `-1` means no match (outer-join padding)
    pub rows: &'a [i64],
    /// Hoisted literal buffer for this device
    pub literals: &'a [i64],
}

/// One node of a compiled expression
#[derive(Debug)]
pub enum CompiledExpr {
    /// Immediate integer-class constant (hoisting disabled)
    ImmInt(i64),
    /// Immediate floating-class constant (hoisting disabled)
    ImmDouble(f64),
    /// Load from the hoisted literal buffer
    LoadLiteral {
        /// Offset into the device literal buffer
        offset: usize,
    },
    /// Decode an integer-class column at the current row of an input
    LoadColumnInt {
        /// Input table position
        input: usize,
        /// Column position
        column: usize,
        /// Sentinel produced for outer-join padded rows
        null_val: i64,
    },
    /// Decode a floating column (f32 widens) at the current row
    LoadColumnFp {
        /// Input table position
        input: usize,
        /// Column position
        column: usize,
    },
    /// Integer binary op through a resolved intrinsic
    ArithInt {
        /// Intrinsic
        f: ArithFn,
        /// Operands
        lhs: Box<CompiledExpr>,
        /// Right operand
        rhs: Box<CompiledExpr>,
        /// Null sentinel
        null_val: i64,
    },
    /// Guarded integer division or modulus
    DivModInt {
        /// True for %, false for /
        is_mod: bool,
        /// Left operand
        lhs: Box<CompiledExpr>,
        /// Right operand
        rhs: Box<CompiledExpr>,
        /// Null sentinel
        null_val: i64,
    },
    /// Floating binary op through a resolved intrinsic
    ArithFp {
        /// Intrinsic
        f: FpArithFn,
        /// Left operand
        lhs: Box<CompiledExpr>,
        /// Right operand
        rhs: Box<CompiledExpr>,
        /// Null sentinel
        null_val: f64,
    },
    /// Guarded floating division
    DivFp {
        /// Left operand
        lhs: Box<CompiledExpr>,
        /// Right operand
        rhs: Box<CompiledExpr>,
        /// Null sentinel
        null_val: f64,
    },
    /// Integer comparison
    CmpInt {
        /// Intrinsic
        f: CmpFn,
        /// Left operand
        lhs: Box<CompiledExpr>,
        /// Right operand
        rhs: Box<CompiledExpr>,
        /// Operand null sentinel
        null_val: i64,
        /// Boolean null sentinel
        null_bool: i64,
    },
    /// Floating comparison
    CmpFp {
        /// Intrinsic
        f: FpCmpFn,
        /// Left operand
        lhs: Box<CompiledExpr>,
        /// Right operand
        rhs: Box<CompiledExpr>,
        /// Operand null sentinel
        null_val: f64,
        /// Boolean null sentinel
        null_bool: i64,
    },
    /// Three-valued AND
    And {
        /// Left operand
        lhs: Box<CompiledExpr>,
        /// Right operand
        rhs: Box<CompiledExpr>,
        /// Boolean null sentinel
        null_bool: i64,
    },
    /// Three-valued OR
    Or {
        /// Left operand
        lhs: Box<CompiledExpr>,
        /// Right operand
        rhs: Box<CompiledExpr>,
        /// Boolean null sentinel
        null_bool: i64,
    },
    /// Three-valued NOT
    Not {
        /// Operand
        arg: Box<CompiledExpr>,
        /// Boolean null sentinel
        null_bool: i64,
    },
    /// Integer negation
    NegInt {
        /// Operand
        arg: Box<CompiledExpr>,
        /// Null sentinel
        null_val: i64,
    },
    /// Floating negation
    NegFp {
        /// Operand
        arg: Box<CompiledExpr>,
        /// Null sentinel
        null_val: f64,
    },
    /// IS NULL over the integer class
    IsNullInt {
        /// Operand
        arg: Box<CompiledExpr>,
        /// Operand's null sentinel
        null_val: i64,
    },
    /// IS NULL over the floating class
    IsNullFp {
        /// Operand
        arg: Box<CompiledExpr>,
        /// Operand's null sentinel
        null_val: f64,
    },
    /// Sentinel-translating integer cast (width change)
    CastIntToInt {
        /// Operand
        arg: Box<CompiledExpr>,
        /// Source sentinel
        in_null: i64,
        /// Destination sentinel
        out_null: i64,
    },
    /// Integer → floating cast
    CastIntToFp {
        /// Operand
        arg: Box<CompiledExpr>,
        /// Source sentinel
        in_null: i64,
        /// Destination sentinel
        out_null: f64,
    },
    /// Floating → integer cast (truncating)
    CastFpToInt {
        /// Operand
        arg: Box<CompiledExpr>,
        /// Source sentinel
        in_null: f64,
        /// Destination sentinel
        out_null: i64,
    },
    /// Decimal rescale by a power of ten
    ScaleDecimal {
        /// Operand
        arg: Box<CompiledExpr>,
        /// Power-of-ten factor
        scale: i64,
        /// Scale up (×) or down (÷ with rounding)
        up: bool,
        /// Null sentinel
        null_val: i64,
    },
    /// Searched CASE
    Case {
        /// (condition, result) pairs
        branches: Vec<(CompiledExpr, CompiledExpr)>,
        /// ELSE result
        else_expr: Box<CompiledExpr>,
    },
    /// Membership in a compile-time id set (LIKE over dictionary columns)
    InIdSet {
        /// Dictionary-id operand
        arg: Box<CompiledExpr>,
        /// Sorted matching ids
        ids: Vec<i64>,
        /// Operand null sentinel
        null_val: i64,
        /// Boolean null sentinel
        null_bool: i64,
    },
    /// Whitelisted extension call
    Ext {
        /// Resolved function
        f: ExtFn,
        /// Argument expressions
        args: Vec<CompiledExpr>,
    },
}

impl CompiledExpr {
    /// Evaluate at the context's current rows. Per-row failures latch into
    /// `error` through [`runtime::record_error_code`]; the returned value is
    /// the class null sentinel in that case.
    #[allow(clippy::too_many_lines)]
    pub fn eval(&self, ctx: &RowCtx<'_>, error: &mut i32) -> i64 {
        match self {
            Self::ImmInt(v) => *v,
            Self::ImmDouble(v) => v.to_bits() as i64,
            Self::LoadLiteral { offset } => ctx.literals[*offset],
            Self::LoadColumnInt {
                input,
                column,
                null_val,
            } => {
                let row = ctx.rows[*input];
                if row < 0 {
                    *null_val
                } else {
                    #[allow(clippy::cast_sign_loss)]
                    let pos = row as usize;
                    ctx.tables[*input][*column].decode_int(pos)
                }
            }
            Self::LoadColumnFp { input, column } => {
                let row = ctx.rows[*input];
                if row < 0 {
                    crate::types::NULL_DOUBLE.to_bits() as i64
                } else {
                    #[allow(clippy::cast_sign_loss)]
                    let pos = row as usize;
                    ctx.tables[*input][*column].decode_fp(pos).to_bits() as i64
                }
            }
            Self::ArithInt {
                f,
                lhs,
                rhs,
                null_val,
            } => f(lhs.eval(ctx, error), rhs.eval(ctx, error), *null_val),
            Self::DivModInt {
                is_mod,
                lhs,
                rhs,
                null_val,
            } => {
                let l = lhs.eval(ctx, error);
                let r = rhs.eval(ctx, error);
                if r == 0 {
                    runtime::record_error_code(runtime::ERR_DIV_BY_ZERO, error);
                    return *null_val;
                }
                if *is_mod {
                    runtime::mod_i64_nullable(l, r, *null_val)
                } else {
                    runtime::div_i64_nullable(l, r, *null_val)
                }
            }
            Self::ArithFp {
                f,
                lhs,
                rhs,
                null_val,
            } => {
                let l = f64::from_bits(lhs.eval(ctx, error) as u64);
                let r = f64::from_bits(rhs.eval(ctx, error) as u64);
                f(l, r, *null_val).to_bits() as i64
            }
            Self::DivFp { lhs, rhs, null_val } => {
                let l = f64::from_bits(lhs.eval(ctx, error) as u64);
                let r = f64::from_bits(rhs.eval(ctx, error) as u64);
                if r == 0.0 && l != *null_val {
                    runtime::record_error_code(runtime::ERR_DIV_BY_ZERO, error);
                    return null_val.to_bits() as i64;
                }
                runtime::div_f64_nullable(l, r, *null_val).to_bits() as i64
            }
            Self::CmpInt {
                f,
                lhs,
                rhs,
                null_val,
                null_bool,
            } => f(
                lhs.eval(ctx, error),
                rhs.eval(ctx, error),
                *null_val,
                *null_bool,
            ),
            Self::CmpFp {
                f,
                lhs,
                rhs,
                null_val,
                null_bool,
            } => {
                let l = f64::from_bits(lhs.eval(ctx, error) as u64);
                let r = f64::from_bits(rhs.eval(ctx, error) as u64);
                f(l, r, *null_val, *null_bool)
            }
            Self::And {
                lhs,
                rhs,
                null_bool,
            } => {
                let l = lhs.eval(ctx, error);
                let r = rhs.eval(ctx, error);
                if l == 0 || r == 0 {
                    0
                } else if l == *null_bool || r == *null_bool {
                    *null_bool
                } else {
                    1
                }
            }
            Self::Or {
                lhs,
                rhs,
                null_bool,
            } => {
                let l = lhs.eval(ctx, error);
                let r = rhs.eval(ctx, error);
                if l == 1 || r == 1 {
                    1
                } else if l == *null_bool || r == *null_bool {
                    *null_bool
                } else {
                    0
                }
            }
            Self::Not { arg, null_bool } => {
                let v = arg.eval(ctx, error);
                if v == *null_bool {
                    *null_bool
                } else {
                    i64::from(v == 0)
                }
            }
            Self::NegInt { arg, null_val } => {
                let v = arg.eval(ctx, error);
                if v == *null_val {
                    *null_val
                } else {
                    v.wrapping_neg()
                }
            }
            Self::NegFp { arg, null_val } => {
                let v = f64::from_bits(arg.eval(ctx, error) as u64);
                if v == *null_val {
                    null_val.to_bits() as i64
                } else {
                    (-v).to_bits() as i64
                }
            }
            Self::IsNullInt { arg, null_val } => {
                i64::from(arg.eval(ctx, error) == *null_val)
            }
            Self::IsNullFp { arg, null_val } => {
                i64::from(f64::from_bits(arg.eval(ctx, error) as u64) == *null_val)
            }
            Self::CastIntToInt {
                arg,
                in_null,
                out_null,
            } => {
                let v = arg.eval(ctx, error);
                if v == *in_null {
                    *out_null
                } else {
                    v
                }
            }
            Self::CastIntToFp {
                arg,
                in_null,
                out_null,
            } => {
                let v = arg.eval(ctx, error);
                if v == *in_null {
                    out_null.to_bits() as i64
                } else {
                    #[allow(clippy::cast_precision_loss)]
                    let converted = v as f64;
                    converted.to_bits() as i64
                }
            }
            Self::CastFpToInt {
                arg,
                in_null,
                out_null,
            } => {
                let v = f64::from_bits(arg.eval(ctx, error) as u64);
                if v == *in_null {
                    *out_null
                } else {
                    #[allow(clippy::cast_possible_truncation)]
                    let truncated = v as i64;
                    truncated
                }
            }
            Self::ScaleDecimal {
                arg,
                scale,
                up,
                null_val,
            } => {
                let v = arg.eval(ctx, error);
                if *up {
                    runtime::scale_decimal_up(v, *scale, *null_val)
                } else {
                    runtime::scale_decimal_down(v, *scale, *null_val)
                }
            }
            Self::Case {
                branches,
                else_expr,
            } => {
                for (cond, result) in branches {
                    if cond.eval(ctx, error) == 1 {
                        return result.eval(ctx, error);
                    }
                }
                else_expr.eval(ctx, error)
            }
            Self::InIdSet {
                arg,
                ids,
                null_val,
                null_bool,
            } => {
                let v = arg.eval(ctx, error);
                if v == *null_val {
                    *null_bool
                } else {
                    i64::from(ids.binary_search(&v).is_ok())
                }
            }
            Self::Ext { f, args } => {
                let vals: Vec<i64> = args.iter().map(|a| a.eval(ctx, error)).collect();
                f(&vals)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{SqlType, TypeInfo};

    fn empty_ctx<'a>(literals: &'a [i64], tables: &'a [Vec<ColumnBuffer>]) -> RowCtx<'a> {
        RowCtx {
            tables,
            rows: &[0],
            literals,
        }
    }

    #[test]
    fn test_div_by_zero_records_error_and_returns_null() {
        let null = i64::MIN;
        let e = CompiledExpr::DivModInt {
            is_mod: false,
            lhs: Box::new(CompiledExpr::ImmInt(10)),
            rhs: Box::new(CompiledExpr::ImmInt(0)),
            null_val: null,
        };
        let tables = vec![];
        let ctx = empty_ctx(&[], &tables);
        let mut error = 0;
        assert_eq!(e.eval(&ctx, &mut error), null);
        assert_eq!(error, runtime::ERR_DIV_BY_ZERO);
    }

    #[test]
    fn test_three_valued_and() {
        let nb = crate::types::inline_int_null_value(SqlType::Boolean);
        let and = |l: i64, r: i64| CompiledExpr::And {
            lhs: Box::new(CompiledExpr::ImmInt(l)),
            rhs: Box::new(CompiledExpr::ImmInt(r)),
            null_bool: nb,
        };
        let tables = vec![];
        let ctx = empty_ctx(&[], &tables);
        let mut err = 0;
        assert_eq!(and(1, 1).eval(&ctx, &mut err), 1);
        assert_eq!(and(1, 0).eval(&ctx, &mut err), 0);
        assert_eq!(and(nb, 0).eval(&ctx, &mut err), 0, "false dominates null");
        assert_eq!(and(nb, 1).eval(&ctx, &mut err), nb);
    }

    #[test]
    fn test_outer_join_padding_loads_null() {
        let ty = TypeInfo::nullable(SqlType::Int);
        let col = ColumnBuffer::from_i64s(ty, &[10, 20]);
        let tables = vec![vec![col]];
        let rows = [-1i64];
        let ctx = RowCtx {
            tables: &tables,
            rows: &rows,
            literals: &[],
        };
        let e = CompiledExpr::LoadColumnInt {
            input: 0,
            column: 0,
            null_val: ty.null_sentinel(),
        };
        let mut err = 0;
        assert_eq!(e.eval(&ctx, &mut err), ty.null_sentinel());
    }

    #[test]
    fn test_case_falls_through_to_else() {
        let e = CompiledExpr::Case {
            branches: vec![(CompiledExpr::ImmInt(0), CompiledExpr::ImmInt(100))],
            else_expr: Box::new(CompiledExpr::ImmInt(42)),
        };
        let tables = vec![];
        let ctx = empty_ctx(&[], &tables);
        let mut err = 0;
        assert_eq!(e.eval(&ctx, &mut err), 42);
    }

    #[test]
    fn test_id_set_membership() {
        let nb = crate::types::inline_int_null_value(SqlType::Boolean);
        let null = i64::from(i32::MIN);
        let e = |v: i64| CompiledExpr::InIdSet {
            arg: Box::new(CompiledExpr::ImmInt(v)),
            ids: vec![0, 2, 5],
            null_val: null,
            null_bool: nb,
        };
        let tables = vec![];
        let ctx = empty_ctx(&[], &tables);
        let mut err = 0;
        assert_eq!(e(2).eval(&ctx, &mut err), 1);
        assert_eq!(e(3).eval(&ctx, &mut err), 0);
        assert_eq!(e(null).eval(&ctx, &mut err), nb);
    }
}
