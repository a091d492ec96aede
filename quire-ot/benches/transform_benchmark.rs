use criterion::{black_box, criterion_group, criterion_main, Criterion};
use quire_ot::{apply_to_rope, compose, decode_json, encode_json, transform, Tie, TextOperation};
use ropey::Rope;

/// A scattered edit over `len` characters touching every 16th position.
fn scattered(len: usize, text: &str) -> TextOperation {
    let mut op = TextOperation::new();
    let mut pos = 0;
    while pos + 16 <= len {
        op.retain(12).delete(2).insert(text).retain(2);
        pos += 16;
    }
    op.retain(len - pos);
    op
}

fn bench_transform_single_insert(c: &mut Criterion) {
    let a = TextOperation::insert_at(4096, 100, "hello").unwrap();
    let b = TextOperation::insert_at(4096, 2000, "world").unwrap();

    c.bench_function("transform_single_insert_4k", |bench| {
        bench.iter(|| black_box(transform(black_box(&a), black_box(&b), Tie::LocalFirst).unwrap()))
    });
}

fn bench_transform_scattered(c: &mut Criterion) {
    let a = scattered(4096, "ab");
    let b = scattered(4096, "xyz");

    c.bench_function("transform_scattered_4k", |bench| {
        bench.iter(|| black_box(transform(black_box(&a), black_box(&b), Tie::RemoteFirst).unwrap()))
    });
}

fn bench_compose_chain(c: &mut Criterion) {
    let ops: Vec<TextOperation> = (0..64)
        .map(|i| TextOperation::insert_at(1024 + i, i, "x").unwrap())
        .collect();

    c.bench_function("compose_chain_64", |bench| {
        bench.iter(|| {
            let mut acc = TextOperation::identity(1024);
            for op in &ops {
                acc = compose(&acc, op).unwrap();
            }
            black_box(acc)
        })
    });
}

fn bench_apply_rope(c: &mut Criterion) {
    let base = "lorem ipsum ".repeat(4096);
    let len = base.chars().count();
    let op = scattered(len, "ab");

    c.bench_function("apply_rope_48k", |bench| {
        bench.iter(|| {
            let mut rope = Rope::from_str(&base);
            apply_to_rope(&mut rope, black_box(&op)).unwrap();
            black_box(rope.len_chars())
        })
    });
}

fn bench_codec_json(c: &mut Criterion) {
    let op = scattered(4096, "ab");
    let encoded = encode_json(&op).unwrap();

    c.bench_function("codec_json_decode_4k", |bench| {
        bench.iter(|| black_box(decode_json(black_box(&encoded)).unwrap()))
    });
}

criterion_group!(
    benches,
    bench_transform_single_insert,
    bench_transform_scattered,
    bench_compose_chain,
    bench_apply_rope,
    bench_codec_json,
);
criterion_main!(benches);
