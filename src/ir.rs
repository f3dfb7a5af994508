//! Typed expression IR
//!
//! The IR is the contract between plan providers and the code generator. It
//! is deliberately storage-independent: column references are (input table
//! index, column index) pairs resolved against fragment column lists at
//! kernel-launch time.

use crate::types::{SqlType, TypeInfo};

/// Binary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinOp {
    /// Addition
    Add,
    /// Subtraction
    Sub,
    /// Multiplication
    Mul,
    /// Division (guards divisor = 0 at runtime)
    Div,
    /// Modulus
    Mod,
    /// Equality
    Eq,
    /// Inequality
    Ne,
    /// Less-than
    Lt,
    /// Less-or-equal
    Le,
    /// Greater-than
    Gt,
    /// Greater-or-equal
    Ge,
    /// Logical AND
    And,
    /// Logical OR
    Or,
}

impl BinOp {
    /// Comparison operators produce booleans
    #[must_use]
    pub const fn is_comparison(self) -> bool {
        matches!(
            self,
            Self::Eq | Self::Ne | Self::Lt | Self::Le | Self::Gt | Self::Ge
        )
    }

    /// Logical connectives
    #[must_use]
    pub const fn is_logic(self) -> bool {
        matches!(self, Self::And | Self::Or)
    }
}

/// Unary operators
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UnaryOp {
    /// Logical NOT
    Not,
    /// Arithmetic negation
    Neg,
    /// Cast to a target type
    Cast(TypeInfo),
    /// NULL test, produces non-null boolean
    IsNull,
}

/// Aggregate kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AggKind {
    /// COUNT / COUNT(*)
    Count,
    /// COUNT(DISTINCT x), exact
    CountDistinct,
    /// APPROX_COUNT_DISTINCT(x) with 2^bits HLL registers
    ApproxCountDistinct {
        /// HLL precision parameter b
        bits: u8,
    },
    /// SUM
    Sum,
    /// MIN
    Min,
    /// MAX
    Max,
    /// AVG (pair-wise sum + count slots)
    Avg,
    /// SAMPLE: any one input value, first encountered wins per kernel
    Sample,
    /// SINGLE_VALUE: like SAMPLE but errors on a second distinct value
    SingleValue,
}

impl AggKind {
    /// Whether this aggregate occupies two 8-byte slots (sum + count).
    #[must_use]
    pub const fn is_two_slot(self) -> bool {
        matches!(self, Self::Avg)
    }
}

/// Literal constant values
#[derive(Debug, Clone, PartialEq)]
pub enum LiteralValue {
    /// SQL NULL of the carried type
    Null,
    /// Integer-like constant
    Int(i64),
    /// Floating constant
    Double(f64),
    /// String constant (interned into the transient dictionary tier when
    /// compared against a dictionary-encoded column)
    Str(String),
    /// Boolean constant
    Bool(bool),
}

/// Typed expression tree
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Constant; hoisted into the literal buffer during codegen
    Literal {
        /// Constant value
        value: LiteralValue,
        /// Declared type
        ty: TypeInfo,
    },
    /// Column reference into an input table
    ColumnRef {
        /// Index into the execution unit's input list
        input_idx: usize,
        /// Column index within that input's schema
        column_idx: usize,
        /// Column type
        ty: TypeInfo,
    },
    /// Unary operation
    Unary {
        /// Operator
        op: UnaryOp,
        /// Operand
        arg: Box<Expr>,
    },
    /// Binary operation
    Binary {
        /// Operator
        op: BinOp,
        /// Left operand
        lhs: Box<Expr>,
        /// Right operand
        rhs: Box<Expr>,
    },
    /// Searched CASE
    Case {
        /// (condition, result) branches, evaluated in order
        branches: Vec<(Expr, Expr)>,
        /// ELSE result; NULL when absent
        else_expr: Option<Box<Expr>>,
    },
    /// LIKE over a dictionary-encoded string column
    Like {
        /// Dictionary-encoded operand
        arg: Box<Expr>,
        /// SQL LIKE pattern (`%`/`_` wildcards)
        pattern: String,
        /// ILIKE when set
        case_insensitive: bool,
    },
    /// Whitelisted extension function call
    Extension {
        /// Registered function name
        name: String,
        /// Argument expressions
        args: Vec<Expr>,
        /// Declared return type
        ty: TypeInfo,
    },
    /// Window function marker; present in the IR for plan providers but not
    /// lowered by the row-function generator
    Window {
        /// Function name, for diagnostics
        func: String,
    },
}

impl Expr {
    /// Convenience constructor for a typed integer literal.
    #[must_use]
    pub fn int_lit(v: i64, ty: SqlType) -> Self {
        Self::Literal {
            value: LiteralValue::Int(v),
            ty: TypeInfo::new(ty),
        }
    }

    /// Convenience constructor for a non-nullable column reference.
    #[must_use]
    pub fn col(input_idx: usize, column_idx: usize, ty: TypeInfo) -> Self {
        Self::ColumnRef {
            input_idx,
            column_idx,
            ty,
        }
    }

    /// Derived result type.
    ///
    /// Arithmetic promotes to the wider operand class (any float operand
    /// makes the result Double, otherwise BigInt); comparisons and logic
    /// produce Boolean. Nullability is the OR of operand nullability.
    #[must_use]
    pub fn result_type(&self) -> TypeInfo {
        match self {
            Self::Literal { ty, .. } | Self::ColumnRef { ty, .. } | Self::Extension { ty, .. } => {
                *ty
            }
            Self::Unary { op, arg } => match op {
                UnaryOp::Cast(ty) => *ty,
                UnaryOp::Not => TypeInfo {
                    ty: SqlType::Boolean,
                    nullable: arg.result_type().nullable,
                },
                UnaryOp::Neg => arg.result_type(),
                UnaryOp::IsNull => TypeInfo::new(SqlType::Boolean),
            },
            Self::Binary { op, lhs, rhs } => {
                let l = lhs.result_type();
                let r = rhs.result_type();
                let nullable = l.nullable || r.nullable;
                if op.is_comparison() || op.is_logic() {
                    TypeInfo {
                        ty: SqlType::Boolean,
                        nullable,
                    }
                } else if l.ty.is_fp() || r.ty.is_fp() {
                    TypeInfo {
                        ty: SqlType::Double,
                        nullable,
                    }
                } else if l.ty.is_decimal() {
                    TypeInfo { ty: l.ty, nullable }
                } else if r.ty.is_decimal() {
                    TypeInfo { ty: r.ty, nullable }
                } else {
                    TypeInfo {
                        ty: SqlType::BigInt,
                        nullable,
                    }
                }
            }
            Self::Case {
                branches,
                else_expr,
            } => {
                let mut ty = branches
                    .first()
                    .map_or(TypeInfo::nullable(SqlType::BigInt), |(_, r)| r.result_type());
                ty.nullable = ty.nullable || else_expr.is_none();
                ty
            }
            Self::Like { arg, .. } => TypeInfo {
                ty: SqlType::Boolean,
                nullable: arg.result_type().nullable,
            },
            Self::Window { .. } => TypeInfo::nullable(SqlType::Double),
        }
    }

    /// Collect referenced (input, column) pairs, depth-first, with duplicates.
    pub fn collect_columns(&self, out: &mut Vec<(usize, usize)>) {
        match self {
            Self::ColumnRef {
                input_idx,
                column_idx,
                ..
            } => out.push((*input_idx, *column_idx)),
            Self::Unary { arg, .. } => arg.collect_columns(out),
            Self::Binary { lhs, rhs, .. } => {
                lhs.collect_columns(out);
                rhs.collect_columns(out);
            }
            Self::Case {
                branches,
                else_expr,
            } => {
                for (c, r) in branches {
                    c.collect_columns(out);
                    r.collect_columns(out);
                }
                if let Some(e) = else_expr {
                    e.collect_columns(out);
                }
            }
            Self::Like { arg, .. } => arg.collect_columns(out),
            Self::Extension { args, .. } => {
                for a in args {
                    a.collect_columns(out);
                }
            }
            Self::Literal { .. } | Self::Window { .. } => {}
        }
    }

    /// Collect literal constants, depth-first, in evaluation order. Used by
    /// literal hoisting; the hoister dedups afterwards.
    pub fn collect_literals<'a>(&'a self, out: &mut Vec<(&'a LiteralValue, TypeInfo)>) {
        match self {
            Self::Literal { value, ty } => out.push((value, *ty)),
            Self::Unary { arg, .. } => arg.collect_literals(out),
            Self::Binary { lhs, rhs, .. } => {
                lhs.collect_literals(out);
                rhs.collect_literals(out);
            }
            Self::Case {
                branches,
                else_expr,
            } => {
                for (c, r) in branches {
                    c.collect_literals(out);
                    r.collect_literals(out);
                }
                if let Some(e) = else_expr {
                    e.collect_literals(out);
                }
            }
            Self::Like { arg, .. } => arg.collect_literals(out),
            Self::Extension { args, .. } => {
                for a in args {
                    a.collect_literals(out);
                }
            }
            Self::ColumnRef { .. } | Self::Window { .. } => {}
        }
    }
}
