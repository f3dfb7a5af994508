//! End-to-end query scenarios over the full pipeline: descriptor choice,
//! codegen, dispatch, reduction, terminal sort.

use rayo_db::exec::ExecutionDispatcher;
use rayo_db::ir::{AggKind, Expr};
use rayo_db::plan::{
    ExecutionUnit, JoinLayoutHint, JoinLevel, JoinType, OrderEntry, SortInfo, Target,
};
use rayo_db::storage::{dictionary::StringDictionary, Catalog, ColumnBuffer, Fragment, TableData};
use rayo_db::types::{Datum, SqlType, TypeInfo};
use rayo_db::SystemConfig;
use std::sync::Arc;

const INT: TypeInfo = TypeInfo::new(SqlType::Int);

fn dispatcher_for(tables: Vec<TableData>) -> ExecutionDispatcher {
    let mut catalog = Catalog::new();
    for t in tables {
        catalog.add_table(t);
    }
    ExecutionDispatcher::new(Arc::new(catalog), SystemConfig::default())
}

fn int_table(id: u32, values: &[i64]) -> TableData {
    let col = ColumnBuffer::from_i64s(INT, values);
    TableData::new(id, vec![INT], vec![Fragment::new(0, vec![col])])
}

fn sort_by(target_idx: usize, descending: bool, limit: Option<usize>, offset: usize) -> SortInfo {
    SortInfo {
        order: vec![OrderEntry {
            target_idx,
            descending,
            nulls_first: false,
        }],
        limit,
        offset,
    }
}

#[tokio::test]
async fn test_count_sum_min_max_avg_over_five_rows() {
    let dispatcher = dispatcher_for(vec![int_table(1, &[1, 2, 3, 4, 5])]);
    let x = Expr::col(0, 0, INT);
    let unit = ExecutionUnit::scan(1)
        .with_target(Target::aggregate("n", AggKind::Count, Expr::int_lit(0, SqlType::BigInt)))
        .with_target(Target::aggregate("s", AggKind::Sum, x.clone()))
        .with_target(Target::aggregate("mn", AggKind::Min, x.clone()))
        .with_target(Target::aggregate("mx", AggKind::Max, x.clone()))
        .with_target(Target::aggregate("avg", AggKind::Avg, x));

    let result = dispatcher.execute(&unit).await.unwrap();
    let rows = result.rows();
    assert_eq!(rows.len(), 1);
    assert_eq!(
        rows[0],
        vec![
            Datum::Int(5),
            Datum::Int(15),
            Datum::Int(1),
            Datum::Int(5),
            Datum::Double(3.0),
        ]
    );
}

#[tokio::test]
async fn test_group_by_count_ordered() {
    let dispatcher = dispatcher_for(vec![int_table(1, &[1, 1, 2, 2, 2, 3])]);
    let k = Expr::col(0, 0, INT);
    let unit = ExecutionUnit::scan(1)
        .with_group_by(k.clone())
        .with_target(Target::projected("k", k.clone()))
        .with_target(Target::aggregate("n", AggKind::Count, k))
        .with_sort(sort_by(0, false, None, 0));

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
async fn test_null_aware_avg_and_counts() {
    let ty = TypeInfo::nullable(SqlType::Int);
    let col = ColumnBuffer::from_opt_i64s(ty, &[Some(10), None, Some(20), None, Some(30)]);
    let table = TableData::new(1, vec![ty], vec![Fragment::new(0, vec![col])]);
    let dispatcher = dispatcher_for(vec![table]);

    let x = Expr::col(0, 0, ty);
    let unit = ExecutionUnit::scan(1)
        .with_target(Target::aggregate("avg", AggKind::Avg, x.clone()))
        .with_target(Target::aggregate("count_x", AggKind::Count, x))
        .with_target(Target::aggregate(
            "count_star",
            AggKind::Count,
            Expr::int_lit(0, SqlType::BigInt),
        ));

    let result = dispatcher.execute(&unit).await.unwrap();
    assert_eq!(
        result.rows(),
        vec![vec![Datum::Double(20.0), Datum::Int(3), Datum::Int(5)]]
    );
}

#[tokio::test]
async fn test_inner_join_projects_matching_outer_keys() {
    // inner a = [1,2,3]; outer b = [3,3,1,4]; join on a = b, project b
    let outer = int_table(1, &[3, 3, 1, 4]);
    let inner = int_table(2, &[1, 2, 3]);
    let dispatcher = dispatcher_for(vec![outer, inner]);

    let b = Expr::col(0, 0, INT);
    let unit = ExecutionUnit::scan(1)
        .with_join(
            2,
            JoinLevel {
                inner_input_idx: 1,
                inner_column: 0,
                outer_key: b.clone(),
                join_type: JoinType::Inner,
                layout: JoinLayoutHint::OneToOne,
            },
        )
        .with_target(Target::projected("b", b))
        .with_sort(sort_by(0, false, None, 0));

    let result = dispatcher.execute(&unit).await.unwrap();
    assert_eq!(
        result.rows(),
        vec![
            vec![Datum::Int(1)],
            vec![Datum::Int(3)],
            vec![Datum::Int(3)],
        ]
    );
}

#[tokio::test]
async fn test_order_by_desc_limit_offset() {
    let values: Vec<i64> = (1..=100).collect();
    let dispatcher = dispatcher_for(vec![int_table(1, &values)]);
    let x = Expr::col(0, 0, INT);
    let unit = ExecutionUnit::scan(1)
        .with_target(Target::projected("x", x))
        .with_sort(sort_by(0, true, Some(3), 2));

    let result = dispatcher.execute(&unit).await.unwrap();
    assert_eq!(
        result.rows(),
        vec![
            vec![Datum::Int(98)],
            vec![Datum::Int(97)],
            vec![Datum::Int(96)],
        ]
    );
}

#[tokio::test]
async fn test_group_by_dictionary_strings() {
    // s = ['hi', 'bye', 'hi']
    let dict = Arc::new(StringDictionary::new());
    let ids: Vec<i64> = ["hi", "bye", "hi"]
        .iter()
        .map(|s| i64::from(dict.get_or_add(s)))
        .collect();
    let ty = TypeInfo::new(SqlType::DictText { dict_id: 9 });
    let col = ColumnBuffer::from_i64s(ty, &ids);
    let table = TableData::new(1, vec![ty], vec![Fragment::new(0, vec![col])])
        .with_dictionary(0, dict);
    let dispatcher = dispatcher_for(vec![table]);

    let s = Expr::col(0, 0, ty);
    let unit = ExecutionUnit::scan(1)
        .with_group_by(s.clone())
        .with_target(Target::projected("s", s.clone()))
        .with_target(Target::aggregate("n", AggKind::Count, s));

    let result = dispatcher.execute(&unit).await.unwrap();
    let mut rows = result.rows();
    rows.sort_by(|a, b| a[0].cmp_non_null(&b[0]));
    assert_eq!(
        rows,
        vec![
            vec![Datum::Str("bye".into()), Datum::Int(1)],
            vec![Datum::Str("hi".into()), Datum::Int(2)],
        ]
    );
}

#[tokio::test]
async fn test_projection_round_trips_through_exchange() {
    let values = [7i64, -3, 0, 42];
    let dispatcher = dispatcher_for(vec![int_table(1, &values)]);
    let unit = ExecutionUnit::scan(1)
        .with_target(Target::projected("x", Expr::col(0, 0, INT)));

    let result = dispatcher.execute(&unit).await.unwrap();
    let batch = rayo_db::result::to_record_batch(&result).unwrap();
    assert_eq!(batch.num_rows(), 4);
    let col = batch
        .column(0)
        .as_any()
        .downcast_ref::<arrow::array::Int64Array>()
        .unwrap();
    assert_eq!(col.values(), &values[..]);
}
