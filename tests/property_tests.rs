//! Property-based invariants for the runtime library, group-value lookup,
//! reduction and sorting.
//!
//! Run with `ProptestConfig::with_cases(100)`; every property must hold for
//! arbitrary inputs, not just the fixtures in the scenario suite.

use proptest::prelude::*;
use rayo_db::descriptor::QueryMemoryDescriptor;
use rayo_db::ir::{AggKind, Expr};
use rayo_db::plan::{ExecutionUnit, OrderEntry, SortInfo, Target};
use rayo_db::result::{OutputBuffer, ResultSet};
use rayo_db::runtime;
use rayo_db::runtime::groupby::{self, KeyWidth};
use rayo_db::storage::{ColumnBuffer, Fragment, TableData};
use rayo_db::types::{Datum, SqlType, TypeInfo};
use rayo_db::SystemConfig;
use std::collections::HashMap;
use std::sync::Arc;

const NULL: i64 = i64::MIN;

fn arb_val() -> impl Strategy<Value = i64> {
    prop_oneof![
        3 => -1_000_000i64..1_000_000,
        1 => Just(NULL),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    // ------------------------------------------------------------------
    // Null-aware arithmetic
    // ------------------------------------------------------------------

    /// op_nullable(a, b) is null iff a is null or b is null
    #[test]
    fn prop_null_propagation_both_sides(a in arb_val(), b in arb_val()) {
        let result = runtime::add_i64_nullable(a, b, NULL);
        let expect_null = a == NULL || b == NULL;
        prop_assert_eq!(result == NULL, expect_null);
        if !expect_null {
            prop_assert_eq!(result, a + b);
        }
    }

    /// the lhs-restricted variant propagates only the named side
    #[test]
    fn prop_null_propagation_lhs_restricted(a in arb_val(), b in -1_000_000i64..1_000_000) {
        let result = runtime::mul_i64_nullable_lhs(a, b, NULL);
        prop_assert_eq!(result == NULL, a == NULL);
        if a != NULL {
            prop_assert_eq!(result, a * b);
        }
    }

    /// comparisons return the boolean sentinel exactly on null inputs
    #[test]
    fn prop_cmp_nullable(a in arb_val(), b in arb_val()) {
        let null_bool = i64::from(i8::MIN);
        let result = runtime::lt_i64_nullable(a, b, NULL, null_bool);
        if a == NULL || b == NULL {
            prop_assert_eq!(result, null_bool);
        } else {
            prop_assert_eq!(result, i64::from(a < b));
        }
    }

    // ------------------------------------------------------------------
    // Decimal scaling
    // ------------------------------------------------------------------

    /// ceil(x, s) − floor(x, s) is 0 or s
    #[test]
    fn prop_decimal_ceil_floor_gap(x in -1_000_000i64..1_000_000, s in 1i64..10_000) {
        let diff = runtime::decimal_ceil(x, s, NULL) - runtime::decimal_floor(x, s, NULL);
        prop_assert!(diff == 0 || diff == s, "x={} s={} diff={}", x, s, diff);
    }

    /// floor ≤ x ≤ ceil
    #[test]
    fn prop_decimal_bounds(x in -1_000_000i64..1_000_000, s in 1i64..10_000) {
        prop_assert!(runtime::decimal_floor(x, s, NULL) <= x);
        prop_assert!(runtime::decimal_ceil(x, s, NULL) >= x);
    }

    // ------------------------------------------------------------------
    // Aggregate updates
    // ------------------------------------------------------------------

    /// agg_count with a skip value counts exactly the non-skip inputs
    #[test]
    fn prop_count_skip_val_counts_non_null(values in proptest::collection::vec(arb_val(), 0..200)) {
        let mut slot = 0i64;
        let mut prev = 0i64;
        for &v in &values {
            runtime::agg_count_skip_val(&mut slot, v, NULL);
            prop_assert!(slot >= prev, "count is monotone non-decreasing");
            prev = slot;
        }
        let expected = values.iter().filter(|&&v| v != NULL).count() as i64;
        prop_assert_eq!(slot, expected);
    }

    /// sum with skip equals the sum of non-null inputs (or stays null)
    #[test]
    fn prop_sum_skip_val(values in proptest::collection::vec(arb_val(), 0..200)) {
        let mut slot = NULL;
        for &v in &values {
            let _ = runtime::agg_sum_skip_val(&mut slot, v, NULL);
        }
        let non_null: Vec<i64> = values.iter().copied().filter(|&v| v != NULL).collect();
        if non_null.is_empty() {
            prop_assert_eq!(slot, NULL);
        } else {
            prop_assert_eq!(slot, non_null.iter().sum::<i64>());
        }
    }

    // ------------------------------------------------------------------
    // Group-value lookup
    // ------------------------------------------------------------------

    /// after lookup the key bytes sit at the returned entry, and a second
    /// lookup returns the same offset
    #[test]
    fn prop_group_value_stability(keys in proptest::collection::vec(-500i64..500, 1..64)) {
        let entry_count = 256u32;
        let row = 2usize; // one key qword + one slot
        let mut groups = vec![0i64; entry_count as usize * row];
        groupby::init_group_by_buffer(&mut groups, entry_count, 1, KeyWidth::W8, &[0], false);

        let mut seen: HashMap<i64, usize> = HashMap::new();
        for &k in &keys {
            let off = groupby::get_group_value(&mut groups, entry_count, &[k], KeyWidth::W8, row)
                .expect("table sized for the key set");
            prop_assert_eq!(groups[off - 1], k, "key materialized at the entry");
            if let Some(&prev) = seen.get(&k) {
                prop_assert_eq!(prev, off, "stable offset for repeated key");
            }
            seen.insert(k, off);
        }
    }

    /// distinct keys never share an aggregate region
    #[test]
    fn prop_group_value_no_aliasing(keys in proptest::collection::hash_set(-500i64..500, 1..64)) {
        let entry_count = 256u32;
        let row = 2usize;
        let mut groups = vec![0i64; entry_count as usize * row];
        groupby::init_group_by_buffer(&mut groups, entry_count, 1, KeyWidth::W8, &[0], false);

        let mut offsets = std::collections::HashSet::new();
        for &k in &keys {
            let off = groupby::get_group_value(&mut groups, entry_count, &[k], KeyWidth::W8, row)
                .expect("table sized for the key set");
            prop_assert!(offsets.insert(off), "offset reused across keys");
        }
    }
}

// ----------------------------------------------------------------------
// Reduction associativity and sort round-trip, over real result sets
// ----------------------------------------------------------------------

fn count_qmd() -> Arc<QueryMemoryDescriptor> {
    let ty = TypeInfo::new(SqlType::Int);
    let col = ColumnBuffer::from_i64s(ty, &[0, 1, 2, 3, 4, 5, 6, 7]);
    let table = TableData::new(1, vec![ty], vec![Fragment::new(0, vec![col])]);
    let key = Expr::col(0, 0, ty);
    let unit = ExecutionUnit::scan(1)
        .with_group_by(key.clone())
        .with_target(Target::projected("k", key.clone()))
        .with_target(Target::aggregate("n", AggKind::Count, key));
    Arc::new(
        QueryMemoryDescriptor::choose(&unit, &[&table], &SystemConfig::default(), 1 << 26)
            .unwrap(),
    )
}

fn groups_result(qmd: &Arc<QueryMemoryDescriptor>, groups: &[(usize, i64)]) -> ResultSet {
    let mut buf = OutputBuffer::new(qmd);
    for &(entry, count) in groups {
        let k_idx = buf.slot_index(qmd, entry, qmd.targets[0].first_slot);
        let n_idx = buf.slot_index(qmd, entry, qmd.targets[1].first_slot);
        buf.data[k_idx] = entry as i64;
        buf.data[n_idx] = count;
    }
    ResultSet::new(Arc::clone(qmd), vec![buf], HashMap::new())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// reducing {A, B, C} in any binary grouping yields an identical result
    #[test]
    fn prop_reduction_associative(
        a in proptest::collection::vec((0usize..8, 1i64..100), 0..8),
        b in proptest::collection::vec((0usize..8, 1i64..100), 0..8),
        c in proptest::collection::vec((0usize..8, 1i64..100), 0..8),
    ) {
        let qmd = count_qmd();
        let dedup = |v: &[(usize, i64)]| {
            let mut m: HashMap<usize, i64> = HashMap::new();
            for &(e, n) in v {
                *m.entry(e).or_insert(0) += n;
            }
            m.into_iter().collect::<Vec<_>>()
        };
        let (a, b, c) = (dedup(&a), dedup(&b), dedup(&c));

        let left = ResultSet::reduce(vec![
            ResultSet::reduce(vec![groups_result(&qmd, &a), groups_result(&qmd, &b)]).unwrap(),
            groups_result(&qmd, &c),
        ])
        .unwrap();
        let right = ResultSet::reduce(vec![
            groups_result(&qmd, &a),
            ResultSet::reduce(vec![groups_result(&qmd, &b), groups_result(&qmd, &c)]).unwrap(),
        ])
        .unwrap();

        let norm = |r: &ResultSet| {
            let mut rows = r.rows();
            rows.sort_by(|x, y| x[0].cmp_non_null(&y[0]));
            rows
        };
        prop_assert_eq!(norm(&left), norm(&right));
    }

    /// ORDER BY then the inverse order yields the original multiset
    #[test]
    fn prop_sort_round_trip(values in proptest::collection::vec(-1000i64..1000, 1..100)) {
        let ty = TypeInfo::new(SqlType::Int);
        let col = ColumnBuffer::from_i64s(ty, &values);
        let table = TableData::new(1, vec![ty], vec![Fragment::new(0, vec![col])]);
        let unit = ExecutionUnit::scan(1)
            .with_target(Target::projected("x", Expr::col(0, 0, ty)));
        let qmd = Arc::new(
            QueryMemoryDescriptor::choose(&unit, &[&table], &SystemConfig::default(), 1 << 26)
                .unwrap(),
        );

        let mut buf = OutputBuffer::new(&qmd);
        for (i, &v) in values.iter().enumerate() {
            let idx = buf.slot_index(&qmd, i, 0);
            buf.data[idx] = v;
        }
        buf.matched = values.len() as u64;

        let sort = |descending: bool| SortInfo {
            order: vec![OrderEntry { target_idx: 0, descending, nulls_first: false }],
            limit: None,
            offset: 0,
        };

        let mut rs = ResultSet::new(Arc::clone(&qmd), vec![buf], HashMap::new());
        rs.sort_and_limit(&sort(false));
        let ascending: Vec<Datum> = rs.rows().into_iter().map(|mut r| r.remove(0)).collect();
        rs.sort_and_limit(&sort(true));
        let descending: Vec<Datum> = rs.rows().into_iter().map(|mut r| r.remove(0)).collect();

        // each pass is a permutation of the input
        let mut original: Vec<i64> = values.clone();
        original.sort_unstable();
        let mut asc_vals: Vec<i64> = ascending.iter().map(|d| match d {
            Datum::Int(v) => *v,
            _ => panic!("expected int"),
        }).collect();
        prop_assert!(asc_vals.windows(2).all(|w| w[0] <= w[1]), "ascending order");
        asc_vals.sort_unstable();
        prop_assert_eq!(&asc_vals, &original);

        let mut desc_vals: Vec<i64> = descending.iter().map(|d| match d {
            Datum::Int(v) => *v,
            _ => panic!("expected int"),
        }).collect();
        prop_assert!(desc_vals.windows(2).all(|w| w[0] >= w[1]), "descending order");
        desc_vals.sort_unstable();
        prop_assert_eq!(&desc_vals, &original);
    }
}
