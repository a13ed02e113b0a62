use criterion::{criterion_group, criterion_main, Criterion};
use muscle_reactor::{Message, ObjectPool};
use std::hint::black_box;

fn sample_message(string_len: usize, field_count: usize) -> Message {
    let mut m = Message::new(0x1234);
    for i in 0..field_count {
        m.add_int32(&format!("i{i}"), i as i32).unwrap();
    }
    m.add_string("payload", "x".repeat(string_len)).unwrap();
    m
}

fn bench_flatten(c: &mut Criterion) {
    let mut g = c.benchmark_group("flatten");

    let small = sample_message(16, 4);
    g.bench_function("small_message", |b| {
        b.iter(|| black_box(black_box(&small).flatten()))
    });

    let large = sample_message(64 * 1024, 32);
    g.bench_function("large_message_64kb_string", |b| {
        b.iter(|| black_box(black_box(&large).flatten()))
    });

    g.finish();
}

fn bench_unflatten(c: &mut Criterion) {
    let mut g = c.benchmark_group("unflatten");

    let small_bytes = sample_message(16, 4).flatten();
    g.bench_function("small_message", |b| {
        b.iter(|| black_box(Message::unflatten(black_box(&small_bytes)).unwrap()))
    });

    let large_bytes = sample_message(64 * 1024, 32).flatten();
    g.bench_function("large_message_64kb_string", |b| {
        b.iter(|| black_box(Message::unflatten(black_box(&large_bytes)).unwrap()))
    });

    g.finish();
}

fn bench_round_trip(c: &mut Criterion) {
    let mut g = c.benchmark_group("round_trip");
    let msg = sample_message(256, 16);
    g.bench_function("flatten_then_unflatten", |b| {
        b.iter(|| {
            let bytes = black_box(&msg).flatten();
            black_box(Message::unflatten(&bytes).unwrap())
        })
    });
    g.finish();
}

fn bench_object_pool(c: &mut Criterion) {
    let mut g = c.benchmark_group("object_pool");

    let pool = ObjectPool::<u64>::new("bench-pool", 4);
    g.bench_function("obtain_then_release", |b| {
        b.iter(|| {
            let r = black_box(pool.obtain_with(|| 42u64)).unwrap();
            drop(black_box(r));
        })
    });

    g.bench_function("churn_100_held_then_released", |b| {
        b.iter(|| {
            let mut held = Vec::with_capacity(100);
            for i in 0..100u64 {
                held.push(pool.obtain_with(move || i).unwrap());
            }
            black_box(&held);
            held.clear();
        })
    });

    g.finish();
}

criterion_group!(
    benches,
    bench_flatten,
    bench_unflatten,
    bench_round_trip,
    bench_object_pool
);
criterion_main!(benches);
