use criterion::{Criterion, Throughput, black_box, criterion_group, criterion_main};

use mapseg::test_utils::{HeapBacking, unique_ident};
use mapseg::{Alloc, Segment};

fn must_alloc(seg: &mut Segment<HeapBacking>, size: usize) -> std::ptr::NonNull<u8> {
    match seg.allocate(size).unwrap() {
        Alloc::Ptr(p) => p,
        Alloc::Grown { .. } => panic!("benchmark segment should never grow"),
    }
}

fn bench_alloc_free(c: &mut Criterion) {
    let mut group = c.benchmark_group("segment");
    group.throughput(Throughput::Bytes(256));
    group.bench_function("alloc_free_256", |b| {
        let mut seg =
            Segment::<HeapBacking>::create_or_open(unique_ident("bench-alloc"), 1 << 20).unwrap();
        b.iter(|| {
            let p = must_alloc(&mut seg, black_box(256));
            unsafe { seg.deallocate(p).unwrap() };
        });
    });
    group.finish();
}

fn bench_fragmented_alloc(c: &mut Criterion) {
    c.bench_function("alloc_free_fragmented", |b| {
        let mut seg =
            Segment::<HeapBacking>::create_or_open(unique_ident("bench-frag"), 1 << 20).unwrap();
        // Leave holes of varying sizes so allocation has to walk the list.
        let ptrs: Vec<_> = (0..128).map(|i| must_alloc(&mut seg, 32 + (i % 7) * 48)).collect();
        for p in ptrs.iter().step_by(2) {
            unsafe { seg.deallocate(*p).unwrap() };
        }
        b.iter(|| {
            let p = must_alloc(&mut seg, black_box(64));
            unsafe { seg.deallocate(p).unwrap() };
        });
    });
}

fn bench_anchor_get(c: &mut Criterion) {
    c.bench_function("anchor_get", |b| {
        let mut seg =
            Segment::<HeapBacking>::create_or_open(unique_ident("bench-anchor"), 1 << 20).unwrap();
        let p = must_alloc(&mut seg, 64);
        for i in 0..32 {
            seg.set_named_address(&format!("anchor-{i}"), Some(p)).unwrap();
        }
        b.iter(|| black_box(seg.get_named_address("anchor-0")));
    });
}

criterion_group!(benches, bench_alloc_free, bench_fragmented_alloc, bench_anchor_get);
criterion_main!(benches);
