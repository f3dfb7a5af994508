//! Engine behavior past the happy path: join shapes, per-row error codes,
//! watchdog interruption, kernel caching, multi-fragment reduction,
//! UNION ALL, sample scan limits, count-distinct representations.

use rayo_db::error::Error;
use rayo_db::exec::ExecutionDispatcher;
use rayo_db::ir::{AggKind, BinOp, Expr, LiteralValue};
use rayo_db::plan::{
    ExecutionUnit, JoinLayoutHint, JoinLevel, JoinType, OrderEntry, SortInfo, Target,
};
use rayo_db::storage::{dictionary::StringDictionary, Catalog, ColumnBuffer, Fragment, TableData};
use rayo_db::types::{Datum, SqlType, TypeInfo};
use rayo_db::SystemConfig;
use std::sync::Arc;

const INT: TypeInfo = TypeInfo::new(SqlType::Int);
const BIG: TypeInfo = TypeInfo::new(SqlType::BigInt);

fn dispatcher_with(tables: Vec<TableData>, config: SystemConfig) -> ExecutionDispatcher {
    let mut catalog = Catalog::new();
    for t in tables {
        catalog.add_table(t);
    }
    ExecutionDispatcher::new(Arc::new(catalog), config)
}

fn dispatcher_for(tables: Vec<TableData>) -> ExecutionDispatcher {
    dispatcher_with(tables, SystemConfig::default())
}

fn int_table(id: u32, values: &[i64]) -> TableData {
    let col = ColumnBuffer::from_i64s(INT, values);
    TableData::new(id, vec![INT], vec![Fragment::new(0, vec![col])])
}

fn gt(col: Expr, v: i64) -> Expr {
    Expr::Binary {
        op: BinOp::Gt,
        lhs: Box::new(col),
        rhs: Box::new(Expr::int_lit(v, SqlType::Int)),
    }
}

#[tokio::test]
async fn test_left_outer_join_pads_misses_with_null() {
    let outer = int_table(1, &[1, 2]);
    let inner = int_table(2, &[2]);
    let dispatcher = dispatcher_for(vec![outer, inner]);

    let b = Expr::col(0, 0, INT);
    let inner_val = Expr::col(1, 0, TypeInfo::nullable(SqlType::Int));
    let unit = ExecutionUnit::scan(1)
        .with_join(
            2,
            JoinLevel {
                inner_input_idx: 1,
                inner_column: 0,
                outer_key: b.clone(),
                join_type: JoinType::LeftOuter,
                layout: JoinLayoutHint::OneToOne,
            },
        )
        .with_target(Target::projected("b", b))
        .with_target(Target::projected("inner_val", inner_val))
        .with_sort(SortInfo {
            order: vec![OrderEntry {
                target_idx: 0,
                descending: false,
                nulls_first: false,
            }],
            limit: None,
            offset: 0,
        });

    let result = dispatcher.execute(&unit).await.unwrap();
    assert_eq!(
        result.rows(),
        vec![
            vec![Datum::Int(1), Datum::Null],
            vec![Datum::Int(2), Datum::Int(2)],
        ]
    );
}

#[tokio::test]
async fn test_one_to_many_join_fans_out() {
    let outer = int_table(1, &[5, 6]);
    let inner = int_table(2, &[5, 5, 7]);
    let dispatcher = dispatcher_for(vec![outer, inner]);

    let key = Expr::col(0, 0, INT);
    let unit = ExecutionUnit::scan(1)
        .with_join(
            2,
            JoinLevel {
                inner_input_idx: 1,
                inner_column: 0,
                outer_key: key.clone(),
                join_type: JoinType::Inner,
                layout: JoinLayoutHint::OneToMany,
            },
        )
        .with_target(Target::aggregate("n", AggKind::Count, key));

    let result = dispatcher.execute(&unit).await.unwrap();
    assert_eq!(result.rows(), vec![vec![Datum::Int(2)]], "5 matches twice");
}

#[tokio::test]
async fn test_duplicate_inner_keys_upgrade_requested_layout() {
    let outer = int_table(1, &[5]);
    let inner = int_table(2, &[5, 5]);
    let dispatcher = dispatcher_for(vec![outer, inner]);

    let key = Expr::col(0, 0, INT);
    let unit = ExecutionUnit::scan(1)
        .with_join(
            2,
            JoinLevel {
                inner_input_idx: 1,
                inner_column: 0,
                outer_key: key.clone(),
                join_type: JoinType::Inner,
                // requested OneToOne; the builder upgrades on duplicates
                layout: JoinLayoutHint::OneToOne,
            },
        )
        .with_target(Target::aggregate("n", AggKind::Count, key));

    let result = dispatcher.execute(&unit).await.unwrap();
    assert_eq!(result.rows(), vec![vec![Datum::Int(2)]]);
}

#[tokio::test]
async fn test_division_by_zero_surfaces_after_kernel() {
    let dispatcher = dispatcher_for(vec![int_table(1, &[1, 2, 3])]);
    let x = Expr::col(0, 0, INT);
    let unit = ExecutionUnit::scan(1).with_target(Target::projected(
        "q",
        Expr::Binary {
            op: BinOp::Div,
            lhs: Box::new(x),
            rhs: Box::new(Expr::int_lit(0, SqlType::Int)),
        },
    ));
    let err = dispatcher.execute(&unit).await.unwrap_err();
    assert!(matches!(err, Error::DivisionByZero));
}

#[tokio::test]
async fn test_sum_overflow_surfaces_after_kernel() {
    let ty = BIG;
    let col = ColumnBuffer::from_i64s(ty, &[i64::MAX, 1]);
    let table = TableData::new(1, vec![ty], vec![Fragment::new(0, vec![col])]);
    let dispatcher = dispatcher_for(vec![table]);
    let unit = ExecutionUnit::scan(1).with_target(Target::aggregate(
        "s",
        AggKind::Sum,
        Expr::col(0, 0, ty),
    ));
    let err = dispatcher.execute(&unit).await.unwrap_err();
    assert!(matches!(err, Error::OverflowOrUnderflow));
}

#[tokio::test]
async fn test_single_value_with_conflicting_rows_fails() {
    let dispatcher = dispatcher_for(vec![int_table(1, &[7, 8])]);
    let unit = ExecutionUnit::scan(1).with_target(Target::aggregate(
        "v",
        AggKind::SingleValue,
        Expr::col(0, 0, INT),
    ));
    let err = dispatcher.execute(&unit).await.unwrap_err();
    assert!(matches!(err, Error::SingleValueMultipleRows));
}

#[tokio::test]
async fn test_sample_picks_one_input_value() {
    let dispatcher = dispatcher_for(vec![int_table(1, &[7, 7, 7])]);
    let unit = ExecutionUnit::scan(1).with_target(Target::aggregate(
        "v",
        AggKind::Sample,
        Expr::col(0, 0, INT),
    ));
    let result = dispatcher.execute(&unit).await.unwrap();
    assert_eq!(result.rows(), vec![vec![Datum::Int(7)]]);
}

#[tokio::test]
async fn test_watchdog_interrupts_running_query() {
    let values: Vec<i64> = (0..200_000).collect();
    let mut config = SystemConfig::default();
    config.watchdog_enable = true;
    let dispatcher = dispatcher_with(vec![int_table(1, &values)], config);

    rayo_db::exec::interrupt_queries();
    let unit = ExecutionUnit::scan(1).with_target(Target::aggregate(
        "s",
        AggKind::Sum,
        Expr::col(0, 0, INT),
    ));
    let err = dispatcher.execute(&unit).await.unwrap_err();
    rayo_db::exec::reset_interrupt();
    assert!(matches!(err, Error::Interrupted));
}

#[tokio::test]
async fn test_compiled_kernels_are_cached_by_shape() {
    let dispatcher = dispatcher_for(vec![int_table(1, &[1, 2, 3])]);
    let unit = ExecutionUnit::scan(1).with_target(Target::aggregate(
        "s",
        AggKind::Sum,
        Expr::col(0, 0, INT),
    ));
    dispatcher.execute(&unit).await.unwrap();
    assert_eq!(dispatcher.cached_kernel_count(), 1);
    dispatcher.execute(&unit).await.unwrap();
    assert_eq!(dispatcher.cached_kernel_count(), 1, "same shape reuses");

    let other = ExecutionUnit::scan(1).with_target(Target::aggregate(
        "m",
        AggKind::Max,
        Expr::col(0, 0, INT),
    ));
    dispatcher.execute(&other).await.unwrap();
    assert_eq!(dispatcher.cached_kernel_count(), 2);
}

#[tokio::test]
async fn test_multi_fragment_group_by_reduces_across_kernels() {
    let f0 = Fragment::new(0, vec![ColumnBuffer::from_i64s(INT, &[1, 2, 1])]);
    let f1 = Fragment::new(1, vec![ColumnBuffer::from_i64s(INT, &[2, 2, 3])]);
    let table = TableData::new(1, vec![INT], vec![f0, f1]);

    // one kernel per fragment forces a real reduction
    let mut config = SystemConfig::default();
    config.allow_multifrag = false;
    let dispatcher = dispatcher_with(vec![table], config);

    let k = Expr::col(0, 0, INT);
    let unit = ExecutionUnit::scan(1)
        .with_group_by(k.clone())
        .with_target(Target::projected("k", k.clone()))
        .with_target(Target::aggregate("n", AggKind::Count, k))
        .with_sort(SortInfo {
            order: vec![OrderEntry {
                target_idx: 0,
                descending: false,
                nulls_first: false,
            }],
            limit: None,
            offset: 0,
        });

    let result = dispatcher.execute(&unit).await.unwrap();
    assert_eq!(
        result.rows(),
        vec![
            vec![Datum::Int(1), Datum::Int(2)],
            vec![Datum::Int(2), Datum::Int(3)],
            vec![Datum::Int(3), Datum::Int(1)],
        ]
    );
}

#[tokio::test]
async fn test_baseline_hash_group_by_wide_keys() {
    let values = [0i64, 1_000_000_000, 0, 500_000_000, 1_000_000_000];
    let dispatcher = dispatcher_for(vec![int_table(1, &values)]);
    let k = Expr::col(0, 0, INT);
    let unit = ExecutionUnit::scan(1)
        .with_group_by(k.clone())
        .with_target(Target::projected("k", k.clone()))
        .with_target(Target::aggregate("n", AggKind::Count, k))
        .with_sort(SortInfo {
            order: vec![OrderEntry {
                target_idx: 0,
                descending: false,
                nulls_first: false,
            }],
            limit: None,
            offset: 0,
        });

    let result = dispatcher.execute(&unit).await.unwrap();
    assert_eq!(
        result.rows(),
        vec![
            vec![Datum::Int(0), Datum::Int(2)],
            vec![Datum::Int(500_000_000), Datum::Int(1)],
            vec![Datum::Int(1_000_000_000), Datum::Int(2)],
        ]
    );
}

#[tokio::test]
async fn test_union_all_drives_both_tables() {
    let t1 = int_table(1, &[1, 2]);
    let t2 = int_table(2, &[3, 4, 5]);
    let dispatcher = dispatcher_for(vec![t1, t2]);

    let mut unit = ExecutionUnit::scan(1).with_target(Target::projected(
        "x",
        Expr::col(0, 0, INT),
    ));
    unit.inputs.push(2);
    unit.union_all = true;

    let result = dispatcher.execute(&unit).await.unwrap();
    let mut values: Vec<i64> = result
        .rows()
        .into_iter()
        .map(|r| match r[0] {
            Datum::Int(v) => v,
            _ => panic!("expected int"),
        })
        .collect();
    values.sort_unstable();
    assert_eq!(values, vec![1, 2, 3, 4, 5]);
}

#[tokio::test]
async fn test_scan_limit_stops_sample_queries_early() {
    let values: Vec<i64> = (0..1000).collect();
    let dispatcher = dispatcher_for(vec![int_table(1, &values)]);
    let mut unit = ExecutionUnit::scan(1).with_target(Target::projected(
        "x",
        Expr::col(0, 0, INT),
    ));
    unit.scan_limit = Some(10);

    let result = dispatcher.execute(&unit).await.unwrap();
    assert_eq!(result.row_count(), 10);
}

#[tokio::test]
async fn test_count_distinct_bitmap_and_exact() {
    let dispatcher = dispatcher_for(vec![int_table(1, &[5, 5, 9, 5, 9, 11])]);
    let x = Expr::col(0, 0, INT);
    let unit = ExecutionUnit::scan(1).with_target(Target::aggregate(
        "d",
        AggKind::CountDistinct,
        x,
    ));
    let result = dispatcher.execute(&unit).await.unwrap();
    assert_eq!(result.rows(), vec![vec![Datum::Int(3)]]);
}

#[tokio::test]
async fn test_count_distinct_per_group() {
    // k: 1 → v in {10, 20}; k: 2 → v in {10}
    let k_col = ColumnBuffer::from_i64s(INT, &[1, 1, 1, 2]);
    let v_col = ColumnBuffer::from_i64s(INT, &[10, 20, 10, 10]);
    let table = TableData::new(1, vec![INT, INT], vec![Fragment::new(0, vec![k_col, v_col])]);
    let dispatcher = dispatcher_for(vec![table]);

    let k = Expr::col(0, 0, INT);
    let v = Expr::col(0, 1, INT);
    let unit = ExecutionUnit::scan(1)
        .with_group_by(k.clone())
        .with_target(Target::projected("k", k))
        .with_target(Target::aggregate("d", AggKind::CountDistinct, v))
        .with_sort(SortInfo {
            order: vec![OrderEntry {
                target_idx: 0,
                descending: false,
                nulls_first: false,
            }],
            limit: None,
            offset: 0,
        });

    let result = dispatcher.execute(&unit).await.unwrap();
    assert_eq!(
        result.rows(),
        vec![
            vec![Datum::Int(1), Datum::Int(2)],
            vec![Datum::Int(2), Datum::Int(1)],
        ]
    );
}

#[tokio::test]
async fn test_approx_count_distinct_close_to_exact() {
    let values: Vec<i64> = (0..2000).collect();
    let dispatcher = dispatcher_for(vec![int_table(1, &values)]);
    let unit = ExecutionUnit::scan(1).with_target(Target::aggregate(
        "d",
        AggKind::ApproxCountDistinct { bits: 11 },
        Expr::col(0, 0, INT),
    ));
    let result = dispatcher.execute(&unit).await.unwrap();
    let Datum::Int(approx) = result.rows()[0][0] else {
        panic!("expected int");
    };
    let err = (approx - 2000).abs();
    assert!(err < 200, "approx {approx} too far from 2000");
}

#[tokio::test]
async fn test_like_over_dictionary_column() {
    let dict = Arc::new(StringDictionary::new());
    let ids: Vec<i64> = ["hat", "hop", "cat"]
        .iter()
        .map(|s| i64::from(dict.get_or_add(s)))
        .collect();
    let ty = TypeInfo::new(SqlType::DictText { dict_id: 3 });
    let col = ColumnBuffer::from_i64s(ty, &ids);
    let table =
        TableData::new(1, vec![ty], vec![Fragment::new(0, vec![col])]).with_dictionary(0, dict);
    let dispatcher = dispatcher_for(vec![table]);

    let s = Expr::col(0, 0, ty);
    let unit = ExecutionUnit::scan(1)
        .with_qual(Expr::Like {
            arg: Box::new(s.clone()),
            pattern: "h%".into(),
            case_insensitive: false,
        })
        .with_target(Target::aggregate("n", AggKind::Count, s));

    let result = dispatcher.execute(&unit).await.unwrap();
    assert_eq!(result.rows(), vec![vec![Datum::Int(2)]]);
}

#[tokio::test]
async fn test_dict_equality_through_transient_literal() {
    let dict = Arc::new(StringDictionary::new());
    let ids: Vec<i64> = ["red", "blue", "red"]
        .iter()
        .map(|s| i64::from(dict.get_or_add(s)))
        .collect();
    let ty = TypeInfo::new(SqlType::DictText { dict_id: 4 });
    let col = ColumnBuffer::from_i64s(ty, &ids);
    let table =
        TableData::new(1, vec![ty], vec![Fragment::new(0, vec![col])]).with_dictionary(0, dict);
    let dispatcher = dispatcher_for(vec![table]);

    let s = Expr::col(0, 0, ty);
    let unit = ExecutionUnit::scan(1)
        .with_qual(Expr::Binary {
            op: BinOp::Eq,
            lhs: Box::new(s.clone()),
            rhs: Box::new(Expr::Literal {
                value: LiteralValue::Str("red".into()),
                ty: TypeInfo::new(SqlType::Text),
            }),
        })
        .with_target(Target::aggregate("n", AggKind::Count, s));

    let result = dispatcher.execute(&unit).await.unwrap();
    assert_eq!(result.rows(), vec![vec![Datum::Int(2)]]);
}

#[tokio::test]
async fn test_streaming_top_n_grouped_order_by_count() {
    let mut values = Vec::new();
    for k in 1..=50i64 {
        for _ in 0..k {
            values.push(k);
        }
    }
    let dispatcher = dispatcher_for(vec![int_table(1, &values)]);
    let k = Expr::col(0, 0, INT);
    let unit = ExecutionUnit::scan(1)
        .with_group_by(k.clone())
        .with_target(Target::projected("k", k.clone()))
        .with_target(Target::aggregate("n", AggKind::Count, k))
        .with_sort(SortInfo {
            order: vec![OrderEntry {
                target_idx: 1,
                descending: true,
                nulls_first: false,
            }],
            limit: Some(2),
            offset: 0,
        });

    let result = dispatcher.execute(&unit).await.unwrap();
    assert_eq!(
        result.rows(),
        vec![
            vec![Datum::Int(50), Datum::Int(50)],
            vec![Datum::Int(49), Datum::Int(49)],
        ]
    );
}

#[tokio::test]
async fn test_fragment_skipping_still_produces_correct_counts() {
    let f0 = Fragment::new(0, vec![ColumnBuffer::from_i64s(INT, &[1, 2, 3])]);
    let f1 = Fragment::new(1, vec![ColumnBuffer::from_i64s(INT, &[100, 200])]);
    let table = TableData::new(1, vec![INT], vec![f0, f1]);
    let dispatcher = dispatcher_for(vec![table]);

    let x = Expr::col(0, 0, INT);
    let unit = ExecutionUnit::scan(1)
        .with_simple_qual(gt(x.clone(), 50))
        .with_target(Target::aggregate("n", AggKind::Count, x));

    let result = dispatcher.execute(&unit).await.unwrap();
    assert_eq!(result.rows(), vec![vec![Datum::Int(2)]]);
}

#[tokio::test]
async fn test_missing_table_is_rejected() {
    let dispatcher = dispatcher_for(vec![]);
    let unit = ExecutionUnit::scan(42).with_target(Target::projected(
        "x",
        Expr::col(0, 0, INT),
    ));
    let err = dispatcher.execute(&unit).await.unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));
}
