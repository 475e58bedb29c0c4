use std::hint::black_box;

use criterion::{criterion_group, criterion_main, Criterion};
use kaal_keyspace::testing::{MockPlatform, SpaceBuilder};
use kaal_keyspace::*;

const VA: u64 = (2 << 20) | (5 << 16) | (9 << 12) | 0x80;

/// Three GPT levels over one page, already prepared
fn prepared_tree() -> Kernel<MockPlatform> {
    let mut b = SpaceBuilder::new();
    let page = b.page();
    let leaf = b.gpt(12);
    let mid = b.gpt(16);
    let root = b.gpt(20);
    b.set(leaf, 9, Key::page(page, 0));
    b.set(mid, 5, Key::gpt(leaf, 0));
    b.set(root, 2, Key::gpt(mid, 0));
    let mut k = b.kernel();
    k.write_key(SlotId::Invocation(0), Key::gpt(root, 0));
    let _ = k.probe(SlotId::Invocation(0), VA, false);
    k
}

pub fn criterion_benchmark(c: &mut Criterion) {
    let mut k = prepared_tree();
    c.bench_function("walk_seg/3-level", |b| {
        b.iter(|| {
            let mut wi = SegWalk::new(VA, false);
            let _ = k.segwalk_init(&mut wi, SlotId::Invocation(0), black_box(VA), false, None);
            black_box(k.walk_seg(&mut wi, 12, None))
        })
    });

    let mut k = prepared_tree();
    c.bench_function("probe/3-level", |b| {
        b.iter(|| black_box(k.probe(SlotId::Invocation(0), black_box(VA), false)))
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
