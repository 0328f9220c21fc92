//! Hot-path benchmarks for the shared primitives.

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use fusion::{ObjectPool, Serial, SerialStamp, Skirmish, World, WorldConfig};
use std::sync::Arc;

fn bench_skirmish(c: &mut Criterion) {
    let mut group = c.benchmark_group("skirmish");
    let world = World::enter(WorldConfig::local()).unwrap();
    let lock = Skirmish::new(&world, "bench").unwrap();

    group.throughput(Throughput::Elements(1));
    group.bench_function("prevail_dismiss", |b| {
        b.iter(|| {
            lock.prevail().unwrap();
            lock.dismiss().unwrap();
        });
    });

    for depth in [1u32, 4, 16] {
        group.bench_with_input(BenchmarkId::new("recursive", depth), &depth, |b, &depth| {
            b.iter(|| {
                for _ in 0..depth {
                    lock.prevail().unwrap();
                }
                for _ in 0..depth {
                    lock.dismiss().unwrap();
                }
            });
        });
    }

    group.bench_function("4_threads_100_ops_each", |b| {
        b.iter(|| {
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    let lock = lock.clone();
                    std::thread::spawn(move || {
                        for _ in 0..100 {
                            let _guard = lock.guard().unwrap();
                        }
                    })
                })
                .collect();
            for h in handles {
                h.join().unwrap();
            }
        });
    });

    group.finish();
}

fn bench_serial(c: &mut Criterion) {
    let mut group = c.benchmark_group("serial");
    let serial = Arc::new(Serial::new());

    group.throughput(Throughput::Elements(1));
    group.bench_function("increase", |b| {
        b.iter(|| std::hint::black_box(serial.increase()));
    });
    group.bench_function("notify_no_waiters", |b| {
        let mut value = 0u32;
        b.iter(|| {
            value = value.wrapping_add(1);
            serial.notify(SerialStamp::new(1, value));
        });
    });

    group.finish();
}

fn bench_objects(c: &mut Criterion) {
    let mut group = c.benchmark_group("objects");
    let world = World::enter(WorldConfig::local().with_main_pool_size(32 << 20)).unwrap();
    let pool = ObjectPool::create(&world, "bench", 64, 16, |_, _| {}).unwrap();

    group.throughput(Throughput::Elements(1));
    group.bench_function("new_activate_unref", |b| {
        b.iter(|| {
            let object = pool.new_object().unwrap();
            object.activate().unwrap();
            object.unref().unwrap();
        });
    });

    let object = pool.new_object().unwrap();
    object.activate().unwrap();
    group.bench_function("get_unref", |b| {
        b.iter(|| pool.get(object.id()).unwrap().unref().unwrap());
    });

    group.finish();
}

criterion_group!(benches, bench_skirmish, bench_serial, bench_objects);
criterion_main!(benches);
