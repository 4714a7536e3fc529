use criterion::{black_box, criterion_group, criterion_main, Criterion};
use stagger_dispatch::messaging::QueueMessage;
use stagger_dispatch::orchestration::{Batch, ConcurrencyController, StaggerScheduler};
use stagger_dispatch::Priority;

fn benchmark_concurrency_compute(c: &mut Criterion) {
    let controller = ConcurrencyController::new(1, 10, 10);
    c.bench_function("concurrency_effective", |b| {
        b.iter(|| controller.effective(black_box(4_321)))
    });
}

fn benchmark_stagger_offsets(c: &mut Criterion) {
    let scheduler = StaggerScheduler::default();
    c.bench_function("stagger_offsets_batch_of_10", |b| {
        b.iter(|| {
            (0..10)
                .map(|index| scheduler.offset(index, black_box(450), Priority::Standard))
                .max()
        })
    });
}

fn benchmark_batch_assembly(c: &mut Criterion) {
    let messages: Vec<QueueMessage> = (0..10)
        .map(|i| {
            QueueMessage::new(
                format!("msg-{i}"),
                format!("receipt-{i}"),
                format!(
                    r#"{{"id":"evt-{i}","detail":{{"bucket":{{"name":"incoming-data"}},"object":{{"key":"exports/file-{i}.csv"}}}}}}"#
                ),
            )
        })
        .collect();

    c.bench_function("batch_from_messages", |b| {
        b.iter(|| Batch::from_messages(black_box(messages.clone())))
    });
}

criterion_group!(
    benches,
    benchmark_concurrency_compute,
    benchmark_stagger_offsets,
    benchmark_batch_assembly
);
criterion_main!(benches);
