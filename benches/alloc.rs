//! Run with:
//!   cargo bench --bench alloc

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use tagheap::{FixedSegment, Heap, OS_PAGE_SIZE};

fn bench_heap(pages: usize) -> Heap<FixedSegment> {
    let segment = FixedSegment::reserve(pages * OS_PAGE_SIZE).expect("reserve bench segment");
    Heap::new(segment)
}

fn allocate_release(c: &mut Criterion) {
    c.bench_function("allocate_release_64", |b| {
        let heap = bench_heap(64);
        b.iter(|| {
            let payload = heap.allocate(black_box(64)).expect("allocate");
            // SAFETY: payload was just handed out by this heap
            unsafe { heap.release(payload) };
        });
    });
}

fn churn_mixed_sizes(c: &mut Criterion) {
    // A ladder of live allocations so first fit has to walk past holes.
    c.bench_function("churn_mixed_sizes", |b| {
        let heap = bench_heap(1024);
        let sizes = [24usize, 96, 512, 40, 1024, 200, 64, 4096];
        b.iter(|| {
            let mut live = Vec::with_capacity(sizes.len() * 4);
            for round in 0..4 {
                for &size in &sizes {
                    live.push(heap.allocate(black_box(size)).expect("allocate"));
                }
                // Free every other chunk to punch holes for the next round.
                let mut index = 0;
                live.retain(|&payload| {
                    index += 1;
                    if index % 2 == round % 2 {
                        // SAFETY: payload is live and dropped from the set
                        unsafe { heap.release(payload) };
                        false
                    } else {
                        true
                    }
                });
            }
            for payload in live {
                // SAFETY: payload is live
                unsafe { heap.release(payload) };
            }
        });
    });
}

fn resize_growth(c: &mut Criterion) {
    c.bench_function("resize_doubling", |b| {
        let heap = bench_heap(1024);
        b.iter(|| {
            let mut payload = heap.allocate(black_box(32)).expect("allocate");
            for size in [64usize, 128, 256, 512, 1024] {
                // SAFETY: payload is the live handle from the previous step
                payload = unsafe { heap.resize(payload, size) }.expect("resize");
            }
            // SAFETY: payload is live
            unsafe { heap.release(payload) };
        });
    });
}

criterion_group!(benches, allocate_release, churn_mixed_sizes, resize_growth);
criterion_main!(benches);
