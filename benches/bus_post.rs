//! Bus post and delivery benchmarks.

use campipe::bus::{BusRegistry, Command, Direction, Endpoint, Message, ReplyWriter};
use campipe::config::{BindRecord, BusConfig};
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};

fn noop(_: &Message<'_>, _: &mut ReplyWriter<'_>) -> i32 {
    0
}

fn bound_pair(registry: &BusRegistry, id: u32, slots: u16) -> (Endpoint, Endpoint) {
    let (up, _) = registry
        .register(
            BindRecord::new(id, Direction::UpToDown)
                .with_ring(256, slots)
                .with_extra(4096, 4),
            noop,
        )
        .unwrap();
    let (down, _) = registry
        .register(BindRecord::new(id, Direction::DownToUp), noop)
        .unwrap();
    up.deliver().unwrap();
    (up, down)
}

fn bench_post_deliver(c: &mut Criterion) {
    let mut group = c.benchmark_group("bus_post_deliver");
    let registry = BusRegistry::new(BusConfig::default()).unwrap();

    for batch in [1u16, 8, 32] {
        let (up, down) = bound_pair(&registry, 0x100 + u32::from(batch), batch);
        group.throughput(Throughput::Elements(u64::from(batch)));
        group.bench_with_input(BenchmarkId::new("command", batch), &batch, |b, &batch| {
            b.iter(|| {
                for input in 0..u32::from(batch) {
                    up.post(Command::ChangeInput { input }).unwrap();
                }
                down.deliver().unwrap()
            });
        });
    }

    let (up, down) = bound_pair(&registry, 0x200, 8);
    let payload = [0xa5u8; 200];
    group.throughput(Throughput::Bytes(payload.len() as u64));
    group.bench_function("user_200_bytes", |b| {
        b.iter(|| {
            up.post(&payload[..]).unwrap();
            down.deliver().unwrap()
        });
    });

    let long = vec![0x5au8; 4000];
    group.throughput(Throughput::Bytes(long.len() as u64));
    group.bench_function("long_4000_bytes", |b| {
        b.iter(|| {
            let mut buf = up.alloc_extra(long.len()).unwrap();
            up.write_extra(&mut buf, &long).unwrap();
            up.post_long(buf).unwrap();
            down.deliver().unwrap()
        });
    });

    group.finish();
}

fn bench_post_sync(c: &mut Criterion) {
    let mut group = c.benchmark_group("bus_post_sync");
    let registry = BusRegistry::new(BusConfig::default()).unwrap();
    let (up, down) = bound_pair(&registry, 0x300, 8);
    let _dispatcher = down.spawn_dispatcher().unwrap();

    group.throughput(Throughput::Elements(1));
    group.bench_function("round_trip", |b| {
        b.iter(|| up.post_sync(Command::ResetControl, &mut []).unwrap());
    });

    group.finish();
}

criterion_group!(benches, bench_post_deliver, bench_post_sync);
criterion_main!(benches);
