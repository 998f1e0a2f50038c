#![forbid(unsafe_code)]

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use kmem_palloc::{FixedCoreHint, PageAllocator};
use kmem_types::{CoreId, MemoryLayout, PageAddr};

fn make_pool(pages: usize, lists: usize) -> PageAllocator {
    let layout = MemoryLayout::new(PageAddr(0x8000_0000), 4096, pages, lists).expect("layout");
    PageAllocator::with_core_hint(layout, Box::new(FixedCoreHint(CoreId(0))))
}

fn bench_round_trip(c: &mut Criterion) {
    let pool = make_pool(1024, 4);

    c.bench_function("palloc_round_trip", |b| {
        b.iter(|| {
            let addr = pool.alloc().expect("alloc");
            pool.free(black_box(addr));
        });
    });
}

fn bench_steal_path(c: &mut Criterion) {
    let pool = make_pool(64, 2);
    // Park list 0's entire quota so every allocation from core 0 has to
    // steal; frees go back to list 1 to keep the shape stable.
    let parked: Vec<_> = (0..32).map(|_| pool.alloc_on(CoreId(0)).expect("drain")).collect();

    c.bench_function("palloc_steal", |b| {
        b.iter(|| {
            let addr = pool.alloc_on(CoreId(0)).expect("steal");
            pool.free_on(CoreId(1), black_box(addr));
        });
    });

    for addr in parked {
        pool.free(addr);
    }
}

criterion_group!(benches, bench_round_trip, bench_steal_path);
criterion_main!(benches);
