//! Job queue and admission scheduler benchmarks.

use campipe::queue::JobQueue;
use campipe::sched::{AdmissionScheduler, SharedUnit};
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use std::sync::Arc;

fn bench_push_pop(c: &mut Criterion) {
    let mut group = c.benchmark_group("job_queue_push_pop");

    for capacity in [4, 64, 1024] {
        let queue = JobQueue::new(capacity).unwrap();

        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::from_parameter(capacity), &queue, |b, queue| {
            b.iter(|| {
                queue.push(std::hint::black_box(7u32)).expect("queue not full");
                queue.pop().expect("queue not empty")
            });
        });
    }

    group.finish();
}

fn bench_fill_drain(c: &mut Criterion) {
    let mut group = c.benchmark_group("job_queue_fill_drain");

    for capacity in [16, 256] {
        let queue = JobQueue::new(capacity).unwrap();

        group.throughput(Throughput::Elements(capacity as u64));
        group.bench_with_input(BenchmarkId::from_parameter(capacity), &queue, |b, queue| {
            b.iter(|| {
                for i in 0..capacity {
                    let _ = queue.push(i);
                }
                while queue.pop().is_ok() {}
            });
        });
    }

    group.finish();
}

fn bench_contended(c: &mut Criterion) {
    let mut group = c.benchmark_group("job_queue_contended");
    let queue = Arc::new(JobQueue::new(64).unwrap());

    group.throughput(Throughput::Elements(400));
    group.bench_function("4_producers_100_jobs_each", |b| {
        b.iter(|| {
            let producers: Vec<_> = (0..4u32)
                .map(|t| {
                    let queue = Arc::clone(&queue);
                    std::thread::spawn(move || {
                        for i in 0..100 {
                            // Full is back-pressure; drop the job like an interrupt would.
                            let _ = queue.push(t * 100 + i);
                        }
                    })
                })
                .collect();
            for p in producers {
                p.join().unwrap();
            }
            while queue.pop().is_ok() {}
        });
    });

    group.finish();
}

fn bench_admission(c: &mut Criterion) {
    let mut group = c.benchmark_group("admission");

    let sched = AdmissionScheduler::new(8, 16).unwrap();
    group.throughput(Throughput::Elements(8));
    group.bench_function("enqueue_dequeue_8_streams", |b| {
        b.iter(|| {
            for i in 0..8 {
                sched.enqueue(i).unwrap();
            }
            while let Some(pass) = sched.dequeue() {
                std::hint::black_box(pass);
            }
        });
    });

    let unit = SharedUnit::new("bench", 4, 8).unwrap();
    group.throughput(Throughput::Elements(4));
    group.bench_function("shared_unit_tiled_4_streams", |b| {
        b.iter(|| {
            for i in 0..4 {
                unit.submit(i, 4).unwrap();
            }
            while let Ok(Some(pass)) = unit.complete() {
                std::hint::black_box(pass);
            }
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_push_pop,
    bench_fill_drain,
    bench_contended,
    bench_admission
);
criterion_main!(benches);
