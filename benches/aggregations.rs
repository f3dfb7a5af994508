//! Aggregation benchmarks: non-grouped reductions, perfect-hash group-by,
//! and raw group-value probing.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rayo_db::exec::ExecutionDispatcher;
use rayo_db::ir::{AggKind, Expr};
use rayo_db::plan::{ExecutionUnit, Target};
use rayo_db::runtime::groupby::{self, KeyWidth};
use rayo_db::storage::{Catalog, ColumnBuffer, Fragment, TableData};
use rayo_db::types::{SqlType, TypeInfo};
use rayo_db::SystemConfig;
use std::sync::Arc;

const INT: TypeInfo = TypeInfo::new(SqlType::Int);

fn dispatcher_over(values: &[i64]) -> ExecutionDispatcher {
    let col = ColumnBuffer::from_i64s(INT, values);
    let table = TableData::new(1, vec![INT], vec![Fragment::new(0, vec![col])]);
    let mut catalog = Catalog::new();
    catalog.add_table(table);
    ExecutionDispatcher::new(Arc::new(catalog), SystemConfig::default())
}

fn bench_sum_1m(c: &mut Criterion) {
    let values: Vec<i64> = (0..1_000_000).collect();
    let dispatcher = dispatcher_over(&values);
    let unit = ExecutionUnit::scan(1).with_target(Target::aggregate(
        "s",
        AggKind::Sum,
        Expr::col(0, 0, INT),
    ));
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("sum_1m_rows", |b| {
        b.iter(|| {
            let result = rt.block_on(dispatcher.execute(black_box(&unit))).unwrap();
            black_box(result.row_count());
        });
    });
}

fn bench_group_by_perfect_hash(c: &mut Criterion) {
    let values: Vec<i64> = (0..1_000_000).map(|i| i % 1000).collect();
    let dispatcher = dispatcher_over(&values);
    let k = Expr::col(0, 0, INT);
    let unit = ExecutionUnit::scan(1)
        .with_group_by(k.clone())
        .with_target(Target::projected("k", k.clone()))
        .with_target(Target::aggregate("n", AggKind::Count, k));
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("group_by_1000_groups_1m_rows", |b| {
        b.iter(|| {
            let result = rt.block_on(dispatcher.execute(black_box(&unit))).unwrap();
            black_box(result.row_count());
        });
    });
}

fn bench_group_value_probing(c: &mut Criterion) {
    let entry_count = 1 << 16;
    let row = 2usize;

    c.bench_function("baseline_probe_64k_entries", |b| {
        b.iter(|| {
            let mut groups = vec![0i64; entry_count as usize * row];
            groupby::init_group_by_buffer(
                &mut groups,
                entry_count,
                1,
                KeyWidth::W8,
                &[0],
                false,
            );
            for k in 0..10_000i64 {
                let off = groupby::get_group_value(
                    &mut groups,
                    entry_count,
                    &[black_box(k)],
                    KeyWidth::W8,
                    row,
                )
                .unwrap();
                groups[off] += 1;
            }
            black_box(groups[0]);
        });
    });
}

criterion_group!(
    benches,
    bench_sum_1m,
    bench_group_by_perfect_hash,
    bench_group_value_probing
);
criterion_main!(benches);
