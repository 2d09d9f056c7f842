//! Benchmarks for the transaction ledger and unit conversion
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use fundboard::*;

fn bench_units(c: &mut Criterion) {
    let mut group = c.benchmark_group("units");

    for input in ["1", "1234.5678", "0.000000000000000001", "340282366920.938463463374607431"] {
        group.bench_with_input(BenchmarkId::new("parse", input), input, |b, input| {
            b.iter(|| BaseUnits::parse(black_box(input)).unwrap())
        });
    }

    let amount = BaseUnits::parse("98765.4321").unwrap();
    group.bench_function("format", |b| b.iter(|| black_box(amount).to_string()));

    group.finish();
}

fn bench_ledger(c: &mut Criterion) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap();
    let mut group = c.benchmark_group("ledger");

    for size in [10usize, 100, 1000] {
        let ledger = TransactionLedger::new();
        runtime.block_on(async {
            for i in 0..size {
                let id = ledger
                    .add(TransactionKind::Deposit, BaseUnits::from_whole(i as u64 + 1), None)
                    .await;
                if i % 3 == 0 {
                    ledger
                        .update_status(&id, StatusUpdate::failed("rejected"))
                        .await;
                }
            }
        });

        group.throughput(Throughput::Elements(size as u64));

        group.bench_function(format!("add_{}", size), |b| {
            b.iter(|| {
                runtime.block_on(ledger.add(
                    TransactionKind::Withdraw,
                    black_box(BaseUnits::from_whole(5)),
                    None,
                ))
            })
        });

        group.bench_function(format!("list_pending_{}", size), |b| {
            b.iter(|| runtime.block_on(ledger.list_by_status(TransactionStatus::Pending)))
        });

        group.bench_function(format!("has_pending_{}", size), |b| {
            b.iter(|| {
                runtime.block_on(ledger.has_pending(
                    TransactionKind::Withdraw,
                    black_box(BaseUnits::from_whole(7)),
                ))
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_units, bench_ledger);
criterion_main!(benches);
