//! Execution units: the normalized plan fragments fed to the code generator
//! and dispatcher
//!
//! A unit is produced by an external plan provider (SQL translation is out of
//! scope) and is immutable once handed to the engine. `shape_hash` fingerprints
//! the unit for compiled-kernel caching.

use crate::ir::{AggKind, Expr, LiteralValue};
use std::hash::{Hash, Hasher};

/// External table identity
pub type TableId = u32;

/// Join semantics for one join level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JoinType {
    /// Inner join: probe miss skips the row
    Inner,
    /// Left outer join: probe miss still emits the outer row once
    LeftOuter,
}

/// Requested hash-table layout for a join level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JoinLayoutHint {
    /// Unique inner keys expected
    OneToOne,
    /// Duplicate inner keys expected
    OneToMany,
}

/// One join level: an equi-join of an outer key expression against an inner
/// column
#[derive(Debug, Clone, PartialEq)]
pub struct JoinLevel {
    /// Index into [`ExecutionUnit::inputs`] naming the inner table
    pub inner_input_idx: usize,
    /// Inner join-key column index
    pub inner_column: usize,
    /// Outer key expression, evaluated per outer row
    pub outer_key: Expr,
    /// Inner or left-outer
    pub join_type: JoinType,
    /// Requested layout; the builder upgrades to OneToMany on duplicates
    pub layout: JoinLayoutHint,
}

/// One ORDER BY entry, referencing a target by position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OrderEntry {
    /// 0-based target index
    pub target_idx: usize,
    /// Descending when set
    pub descending: bool,
    /// Nulls-first when set
    pub nulls_first: bool,
}

/// Sort specification
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SortInfo {
    /// Order entries, major key first
    pub order: Vec<OrderEntry>,
    /// LIMIT, if any
    pub limit: Option<usize>,
    /// OFFSET
    pub offset: usize,
}

/// One output target: a projected expression or an aggregate over one
#[derive(Debug, Clone, PartialEq)]
pub struct Target {
    /// Output column name
    pub name: String,
    /// Input expression (ignored for COUNT(*))
    pub expr: Expr,
    /// Aggregate kind, `None` for plain projection targets
    pub agg: Option<AggKind>,
}

impl Target {
    /// Projection target
    #[must_use]
    pub fn projected(name: impl Into<String>, expr: Expr) -> Self {
        Self {
            name: name.into(),
            expr,
            agg: None,
        }
    }

    /// Aggregate target
    #[must_use]
    pub fn aggregate(name: impl Into<String>, agg: AggKind, expr: Expr) -> Self {
        Self {
            name: name.into(),
            expr,
            agg: Some(agg),
        }
    }
}

/// A normalized plan fragment
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionUnit {
    /// Input tables; index 0 drives the outer scan, the rest are join inners
    /// (or UNION ALL branches when `union_all` is set)
    pub inputs: Vec<TableId>,
    /// Sargable quals, usable for fragment skipping against min/max metadata
    pub simple_quals: Vec<Expr>,
    /// General quals, evaluated per row after join probes
    pub quals: Vec<Expr>,
    /// Join levels, probed in order
    pub joins: Vec<JoinLevel>,
    /// Group-by expressions
    pub group_by: Vec<Expr>,
    /// Output targets
    pub targets: Vec<Target>,
    /// Terminal ordering, if any
    pub sort: Option<SortInfo>,
    /// UNION ALL of the inputs instead of a join tree
    pub union_all: bool,
    /// Stop scanning after this many matched tuples (sample queries)
    pub scan_limit: Option<usize>,
    /// Caller-supplied group cardinality hint for baseline hashing
    pub cardinality_hint: Option<usize>,
}

impl ExecutionUnit {
    /// A bare scan of one table; build up with the `with_*` methods.
    #[must_use]
    pub fn scan(table: TableId) -> Self {
        Self {
            inputs: vec![table],
            simple_quals: Vec::new(),
            quals: Vec::new(),
            joins: Vec::new(),
            group_by: Vec::new(),
            targets: Vec::new(),
            sort: None,
            union_all: false,
            scan_limit: None,
            cardinality_hint: None,
        }
    }

    /// Append a target.
    #[must_use]
    pub fn with_target(mut self, target: Target) -> Self {
        self.targets.push(target);
        self
    }

    /// Append a group-by expression.
    #[must_use]
    pub fn with_group_by(mut self, expr: Expr) -> Self {
        self.group_by.push(expr);
        self
    }

    /// Append a sargable qual.
    #[must_use]
    pub fn with_simple_qual(mut self, expr: Expr) -> Self {
        self.simple_quals.push(expr);
        self
    }

    /// Append a general qual.
    #[must_use]
    pub fn with_qual(mut self, expr: Expr) -> Self {
        self.quals.push(expr);
        self
    }

    /// Append a join level against an additional input table.
    #[must_use]
    pub fn with_join(mut self, inner_table: TableId, level: JoinLevel) -> Self {
        self.inputs.push(inner_table);
        self.joins.push(level);
        self
    }

    /// Set the sort specification.
    #[must_use]
    pub fn with_sort(mut self, sort: SortInfo) -> Self {
        self.sort = Some(sort);
        self
    }

    /// Whether any target aggregates.
    #[must_use]
    pub fn has_aggregates(&self) -> bool {
        self.targets.iter().any(|t| t.agg.is_some())
    }

    /// Normalized fingerprint of the plan shape, used (together with the QMD
    /// structural hash and device kind) as the compiled-kernel cache key.
    #[must_use]
    pub fn shape_hash(&self) -> u64 {
        let mut h = std::collections::hash_map::DefaultHasher::new();
        self.inputs.hash(&mut h);
        self.union_all.hash(&mut h);
        self.scan_limit.hash(&mut h);
        for q in self.simple_quals.iter().chain(&self.quals) {
            hash_expr(q, &mut h);
        }
        for j in &self.joins {
            j.inner_input_idx.hash(&mut h);
            j.inner_column.hash(&mut h);
            j.join_type.hash(&mut h);
            j.layout.hash(&mut h);
            hash_expr(&j.outer_key, &mut h);
        }
        for g in &self.group_by {
            hash_expr(g, &mut h);
        }
        for t in &self.targets {
            t.agg.hash(&mut h);
            hash_expr(&t.expr, &mut h);
        }
        self.sort.hash(&mut h);
        h.finish()
    }
}

/// Structural expression hash. Literal doubles hash by bit pattern so the
/// fingerprint stays total.
fn hash_expr<H: Hasher>(e: &Expr, h: &mut H) {
    std::mem::discriminant(e).hash(h);
    match e {
        Expr::Literal { value, ty } => {
            ty.hash(h);
            match value {
                LiteralValue::Null => 0u8.hash(h),
                LiteralValue::Int(v) => {
                    1u8.hash(h);
                    v.hash(h);
                }
                LiteralValue::Double(v) => {
                    2u8.hash(h);
                    v.to_bits().hash(h);
                }
                LiteralValue::Str(s) => {
                    3u8.hash(h);
                    s.hash(h);
                }
                LiteralValue::Bool(b) => {
                    4u8.hash(h);
                    b.hash(h);
                }
            }
        }
        Expr::ColumnRef {
            input_idx,
            column_idx,
            ty,
        } => {
            input_idx.hash(h);
            column_idx.hash(h);
            ty.hash(h);
        }
        Expr::Unary { op, arg } => {
            std::mem::discriminant(op).hash(h);
            if let crate::ir::UnaryOp::Cast(ty) = op {
                ty.hash(h);
            }
            hash_expr(arg, h);
        }
        Expr::Binary { op, lhs, rhs } => {
            op.hash(h);
            hash_expr(lhs, h);
            hash_expr(rhs, h);
        }
        Expr::Case {
            branches,
            else_expr,
        } => {
            branches.len().hash(h);
            for (c, r) in branches {
                hash_expr(c, h);
                hash_expr(r, h);
            }
            if let Some(e) = else_expr {
                hash_expr(e, h);
            }
        }
        Expr::Like {
            arg,
            pattern,
            case_insensitive,
        } => {
            pattern.hash(h);
            case_insensitive.hash(h);
            hash_expr(arg, h);
        }
        Expr::Extension { name, args, ty } => {
            name.hash(h);
            ty.hash(h);
            for a in args {
                hash_expr(a, h);
            }
        }
        Expr::Window { func } => func.hash(h),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::BinOp;
    use crate::types::{SqlType, TypeInfo};

    fn count_star_unit(table: TableId) -> ExecutionUnit {
        ExecutionUnit::scan(table).with_target(Target::aggregate(
            "n",
            AggKind::Count,
            Expr::int_lit(0, SqlType::BigInt),
        ))
    }

    #[test]
    fn test_shape_hash_is_deterministic() {
        let a = count_star_unit(1);
        let b = count_star_unit(1);
        assert_eq!(a.shape_hash(), b.shape_hash());
    }

    #[test]
    fn test_shape_hash_distinguishes_tables_and_quals() {
        let a = count_star_unit(1);
        let b = count_star_unit(2);
        assert_ne!(a.shape_hash(), b.shape_hash());

        let c = count_star_unit(1).with_qual(Expr::Binary {
            op: BinOp::Gt,
            lhs: Box::new(Expr::col(0, 0, TypeInfo::new(SqlType::Int))),
            rhs: Box::new(Expr::int_lit(5, SqlType::Int)),
        });
        assert_ne!(a.shape_hash(), c.shape_hash());
    }

    #[test]
    fn test_has_aggregates() {
        assert!(count_star_unit(1).has_aggregates());
        let proj = ExecutionUnit::scan(1).with_target(Target::projected(
            "x",
            Expr::col(0, 0, TypeInfo::new(SqlType::Int)),
        ));
        assert!(!proj.has_aggregates());
    }
}
