use kernel_heap::{
    Block, BlockError, FOOTER_SIZE, HEADER_SIZE, Heap, HeapConfig, HeapError, MIN_BLOCK_SIZE,
    PAGE_SIZE,
};
use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::ptr::{self, NonNull};

const KIB: usize = 1024;
const MIB: usize = 1024 * KIB;

/// Page-aligned backing memory for one heap.
///
/// Declare the arena before the heap so the heap is dropped first.
struct Arena {
    base: *mut u8,
    layout: Layout,
}

impl Arena {
    fn new(len: usize) -> Self {
        let layout = Layout::from_size_align(len, PAGE_SIZE).unwrap();
        let base = unsafe { alloc_zeroed(layout) };
        assert!(!base.is_null());
        Self { base, layout }
    }

    fn start(&self) -> usize {
        self.base.expose_provenance()
    }

    fn heap(&self, initial: usize, max: usize) -> Heap {
        self.heap_with(initial, max, HeapConfig::default())
    }

    fn heap_with(&self, initial: usize, max: usize, config: HeapConfig) -> Heap {
        assert!(max <= self.layout.size());
        let start = self.start();
        unsafe { Heap::with_config(start, start + initial, start + max, config) }
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        unsafe { dealloc(self.base, self.layout) };
    }
}

fn block_size(heap: &Heap, ptr: NonNull<u8>) -> usize {
    heap.usable_size(ptr.as_ptr()).unwrap() + MIN_BLOCK_SIZE
}

fn holes(heap: &Heap) -> Vec<Block> {
    heap.holes().collect()
}

#[test]
fn scenario_free_then_page_aligned_allocation() {
    let arena = Arena::new(MIB);
    let mut heap = arena.heap(64 * KIB, MIB);

    let p1 = heap.allocate(100, false).unwrap();
    let p2 = heap.allocate(200, false).unwrap();
    assert!(p2 > p1);

    unsafe {
        p1.as_ptr().write_bytes(0xAA, 100);
        p2.as_ptr().write_bytes(0xBB, 200);
    }
    heap.check().unwrap();

    heap.free(p1.as_ptr()).unwrap();
    let p3 = heap.allocate(100, true).unwrap();
    assert_eq!(p3.as_ptr().addr() % PAGE_SIZE, 0);
    assert!(p3 != p1 || p1.as_ptr().addr() % PAGE_SIZE == 0);

    unsafe { p3.as_ptr().write_bytes(0xCC, 100) };
    assert_eq!(unsafe { p2.as_ptr().read() }, 0xBB);
    heap.check().unwrap();
}

#[test]
fn page_aligned_allocations_of_various_sizes() {
    let arena = Arena::new(MIB);
    let mut heap = arena.heap(64 * KIB, MIB);

    let mut live = Vec::new();
    for size in [1, 16, 100, PAGE_SIZE, PAGE_SIZE + 1, 3 * PAGE_SIZE] {
        let p = heap.allocate(size, true).unwrap();
        assert_eq!(p.as_ptr().addr() % PAGE_SIZE, 0, "size {size}");
        assert!(heap.usable_size(p.as_ptr()).unwrap() >= size);
        live.push(p);
        heap.check().unwrap();
    }
    for p in live {
        heap.free(p.as_ptr()).unwrap();
        heap.check().unwrap();
    }
}

#[test]
fn round_trip_restores_free_bytes_without_growth() {
    let arena = Arena::new(MIB);
    let mut heap = arena.heap(64 * KIB, MIB);

    let _a = heap.allocate(256, false).unwrap();
    let b = heap.allocate(512, false).unwrap();
    let _c = heap.allocate(256, false).unwrap();
    heap.free(b.as_ptr()).unwrap();

    let free_before = heap.free_bytes();
    let holes_before = heap.hole_count();
    let end_before = heap.end_address();

    let x = heap.allocate(400, false).unwrap();
    assert_eq!(x, b, "best fit reuses the middle hole");
    heap.free(x.as_ptr()).unwrap();

    assert_eq!(heap.free_bytes(), free_before);
    assert_eq!(heap.hole_count(), holes_before);

    let y = heap.allocate(400, false).unwrap();
    assert_eq!(heap.end_address(), end_before);
    assert_eq!(y, b);
    heap.check().unwrap();
}

#[test]
fn round_trip_at_the_end_keeps_the_initial_size() {
    let arena = Arena::new(MIB);
    let mut heap = arena.heap(64 * KIB, MIB);
    let free_before = heap.free_bytes();
    let end_before = heap.end_address();

    let p = heap.allocate(1000, false).unwrap();
    heap.free(p.as_ptr()).unwrap();

    assert_eq!(heap.free_bytes(), free_before);
    assert_eq!(heap.end_address(), end_before);
    assert_eq!(heap.hole_count(), 1);
}

#[test]
fn freeing_adjacent_blocks_coalesces_in_either_order() {
    for a_first in [true, false] {
        let arena = Arena::new(MIB);
        let mut heap = arena.heap(64 * KIB, MIB);

        let a = heap.allocate(300, false).unwrap();
        let b = heap.allocate(500, false).unwrap();
        let _guard = heap.allocate(64, false).unwrap();
        let merged_size = block_size(&heap, a) + block_size(&heap, b);

        let (first, second) = if a_first { (a, b) } else { (b, a) };
        heap.free(first.as_ptr()).unwrap();
        heap.free(second.as_ptr()).unwrap();

        let holes = holes(&heap);
        assert_eq!(holes.len(), 2, "middle hole and trailing hole");
        assert!(
            holes
                .iter()
                .any(|hole| hole.at.data() == a.as_ptr().addr() && hole.size == merged_size)
        );
        heap.check().unwrap();
    }
}

#[test]
fn freeing_between_two_holes_merges_all_three() {
    let arena = Arena::new(MIB);
    let mut heap = arena.heap(64 * KIB, MIB);

    let a = heap.allocate(128, false).unwrap();
    let b = heap.allocate(128, false).unwrap();
    let c = heap.allocate(128, false).unwrap();
    let _guard = heap.allocate(128, false).unwrap();
    let total = block_size(&heap, a) + block_size(&heap, b) + block_size(&heap, c);

    heap.free(a.as_ptr()).unwrap();
    heap.free(c.as_ptr()).unwrap();
    assert_eq!(heap.hole_count(), 3);

    heap.free(b.as_ptr()).unwrap();
    assert_eq!(heap.hole_count(), 2);
    assert!(heap.holes().any(|hole| hole.at.data() == a.as_ptr().addr() && hole.size == total));
    heap.check().unwrap();
}

/// Small deterministic generator so the mixed workload is reproducible.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> usize {
        self.0 = self
            .0
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        usize::try_from(self.0 >> 33).unwrap()
    }
}

#[test]
fn live_blocks_never_overlap_and_keep_their_contents() {
    let arena = Arena::new(MIB);
    let mut heap = arena.heap(64 * KIB, MIB);
    let mut rng = Lcg(0x5EED);
    let mut live: Vec<(NonNull<u8>, usize, u8)> = Vec::new();

    for step in 0..400_usize {
        let allocate = live.len() < 8 || (live.len() < 40 && rng.next() % 3 != 0);
        if allocate {
            let size = 1 + rng.next() % 3000;
            let page_align = rng.next() % 5 == 0;
            let p = heap.allocate(size, page_align).unwrap();
            if page_align {
                assert_eq!(p.as_ptr().addr() % PAGE_SIZE, 0);
            }
            let fill = u8::try_from(step % 251).unwrap();
            unsafe { p.as_ptr().write_bytes(fill, size) };
            live.push((p, size, fill));
        } else {
            let (p, size, fill) = live.swap_remove(rng.next() % live.len());
            let contents = unsafe { std::slice::from_raw_parts(p.as_ptr(), size) };
            assert!(contents.iter().all(|&byte| byte == fill), "step {step}");
            heap.free(p.as_ptr()).unwrap();
        }

        let mut spans: Vec<(usize, usize)> = live
            .iter()
            .map(|&(p, _, _)| {
                let header = p.as_ptr().addr() - HEADER_SIZE;
                let end = p.as_ptr().addr() + heap.usable_size(p.as_ptr()).unwrap() + FOOTER_SIZE;
                (header, end)
            })
            .collect();
        spans.sort_unstable();
        assert!(spans.windows(2).all(|pair| pair[0].1 <= pair[1].0), "step {step}");
        assert!(heap.end_address() <= heap.max_address());
        heap.check().unwrap();
    }

    for (p, size, fill) in live {
        let contents = unsafe { std::slice::from_raw_parts(p.as_ptr(), size) };
        assert!(contents.iter().all(|&byte| byte == fill));
        heap.free(p.as_ptr()).unwrap();
    }
    let stats = heap.check().unwrap();
    assert_eq!(stats.used_blocks, 0);
    assert_eq!(stats.free_blocks, 1);
}

#[test]
fn growth_extends_the_trailing_hole() {
    let arena = Arena::new(MIB);
    let mut heap = arena.heap(64 * KIB, MIB);
    let initial_end = heap.end_address();

    let small = heap.allocate(64, false).unwrap();
    let big = heap.allocate(200 * KIB, false).unwrap();
    assert!(heap.end_address() > initial_end);
    assert!(heap.end_address() <= heap.max_address());
    assert_eq!(heap.end_address() % PAGE_SIZE, 0);
    assert!(big > small);
    heap.check().unwrap();

    heap.free(big.as_ptr()).unwrap();
    assert_eq!(heap.end_address(), initial_end);
    heap.check().unwrap();
}

#[test]
fn growth_appends_a_hole_after_a_trailing_allocation() {
    let arena = Arena::new(MIB);
    let mut heap = arena.heap(8 * KIB, MIB);

    // one page of data: fill it completely
    let whole = heap.allocate(heap.size() - MIN_BLOCK_SIZE, false).unwrap();
    assert_eq!(heap.hole_count(), 0);

    let end = heap.end_address();
    let next = heap.allocate(100, true).unwrap();
    assert!(next.as_ptr().addr() > end);
    assert_eq!(next.as_ptr().addr() % PAGE_SIZE, 0);
    heap.check().unwrap();

    heap.free(whole.as_ptr()).unwrap();
    heap.free(next.as_ptr()).unwrap();
    let stats = heap.check().unwrap();
    assert_eq!(stats.free_blocks, 1);
}

#[test]
fn growth_past_max_fails_without_side_effects() {
    let arena = Arena::new(MIB);
    let mut heap = arena.heap(64 * KIB, 128 * KIB);

    let a = heap.allocate(50_000, false).unwrap();
    let holes_before = holes(&heap);
    let end_before = heap.end_address();

    assert!(matches!(
        heap.allocate(100_000, false),
        Err(HeapError::OutOfRange { .. })
    ));

    assert_eq!(holes(&heap), holes_before);
    assert_eq!(heap.end_address(), end_before);
    assert!(heap.usable_size(a.as_ptr()).unwrap() >= 50_000);
    heap.check().unwrap();
}

#[test]
fn oversized_request_fails_on_first_call() {
    let arena = Arena::new(MIB);
    let mut heap = arena.heap(64 * KIB, MIB);
    let holes_before = holes(&heap);
    let end_before = heap.end_address();

    let limit = heap.max_address() - heap.start_address();
    assert!(matches!(
        heap.allocate(limit, false),
        Err(HeapError::OutOfRange { .. })
    ));
    assert!(matches!(
        heap.allocate(usize::MAX, false),
        Err(HeapError::OutOfRange { .. })
    ));

    assert_eq!(holes(&heap), holes_before);
    assert_eq!(heap.end_address(), end_before);
}

#[test]
fn repeated_page_cycles_do_not_grow() {
    for config in [HeapConfig::default(), HeapConfig::default().with_min_size(0)] {
        let arena = Arena::new(MIB);
        let mut heap = arena.heap_with(64 * KIB, MIB, config);

        let p = heap.allocate(4096, false).unwrap();
        heap.free(p.as_ptr()).unwrap();
        let end_after_first = heap.end_address();

        for _ in 0..64 {
            let p = heap.allocate(4096, false).unwrap();
            assert!(heap.end_address() <= 64 * KIB + arena.start());
            heap.free(p.as_ptr()).unwrap();
            assert!(heap.end_address() <= end_after_first);
        }
        heap.check().unwrap();
    }
}

#[test]
fn shrinking_to_nothing_and_growing_again() {
    let arena = Arena::new(MIB);
    let mut heap = arena.heap_with(64 * KIB, MIB, HeapConfig::new().with_min_size(0));

    let p = heap.allocate(10, false).unwrap();
    heap.free(p.as_ptr()).unwrap();
    assert_eq!(heap.size(), 0);
    assert_eq!(heap.hole_count(), 0);
    heap.check().unwrap();

    let q = heap.allocate(10, false).unwrap();
    assert_eq!(q, p);
    assert_eq!(heap.size(), PAGE_SIZE);
    heap.check().unwrap();

    // stale pointer into released memory that was handed out again
    heap.free(q.as_ptr()).unwrap();
    assert!(matches!(
        heap.free(q.as_ptr()),
        Err(HeapError::InvalidFree { .. })
    ));
}

#[test]
fn free_null_is_a_noop() {
    let arena = Arena::new(MIB);
    let mut heap = arena.heap(64 * KIB, MIB);
    let holes_before = holes(&heap);

    heap.free(ptr::null_mut()).unwrap();
    assert_eq!(holes(&heap), holes_before);
}

#[test]
fn double_free_is_rejected() {
    let arena = Arena::new(MIB);
    let mut heap = arena.heap(64 * KIB, MIB);

    let p = heap.allocate(32, false).unwrap();
    let q = heap.allocate(32, false).unwrap();
    let _guard = heap.allocate(32, false).unwrap();

    heap.free(p.as_ptr()).unwrap();
    assert_eq!(
        heap.free(p.as_ptr()),
        Err(HeapError::InvalidFree {
            address: p.as_ptr().addr(),
            reason: BlockError::NotAllocated,
        })
    );

    // `q` merges into the hole left by `p`; its own header stays marked free
    heap.free(q.as_ptr()).unwrap();
    assert_eq!(
        heap.free(q.as_ptr()),
        Err(HeapError::InvalidFree {
            address: q.as_ptr().addr(),
            reason: BlockError::NotAllocated,
        })
    );
    heap.check().unwrap();
}

#[test]
fn foreign_pointers_are_rejected() {
    let arena = Arena::new(MIB);
    let mut heap = arena.heap(64 * KIB, MIB);
    let p = heap.allocate(128, false).unwrap();

    let mut local = 0u64;
    assert!(matches!(
        heap.free(ptr::from_mut(&mut local).cast()),
        Err(HeapError::InvalidFree { .. })
    ));
    assert!(matches!(
        heap.free(unsafe { p.as_ptr().add(8) }),
        Err(HeapError::InvalidFree { .. })
    ));
    assert!(matches!(
        heap.free(unsafe { p.as_ptr().add(3) }),
        Err(HeapError::InvalidFree {
            reason: BlockError::Misaligned,
            ..
        })
    ));

    let stats = heap.check().unwrap();
    assert_eq!(stats.used_blocks, 1);
    heap.free(p.as_ptr()).unwrap();
}

#[test]
fn clobbered_footer_is_reported_as_corruption() {
    let arena = Arena::new(MIB);
    let mut heap = arena.heap(64 * KIB, MIB);
    let p = heap.allocate(64, false).unwrap();

    let usable = heap.usable_size(p.as_ptr()).unwrap();
    unsafe { p.as_ptr().add(usable).write_bytes(0, 4) };

    assert!(matches!(
        heap.free(p.as_ptr()),
        Err(HeapError::Corrupted {
            reason: BlockError::BadMagic,
            ..
        })
    ));
}

#[test]
fn full_index_is_reported_before_any_change() {
    let arena = Arena::new(MIB);
    let mut heap = arena.heap_with(64 * KIB, MIB, HeapConfig::new().with_index_capacity(2));

    let a = heap.allocate(64, false).unwrap();
    let _b = heap.allocate(64, false).unwrap();
    let c = heap.allocate(64, false).unwrap();
    let _d = heap.allocate(64, false).unwrap();

    heap.free(a.as_ptr()).unwrap();
    assert_eq!(heap.hole_count(), 2);

    assert!(matches!(
        heap.free(c.as_ptr()),
        Err(HeapError::IndexFull { capacity: 2 })
    ));
    assert!(heap.usable_size(c.as_ptr()).is_ok());

    // a page-aligned carve would add a leading and a trailing hole
    assert!(matches!(
        heap.allocate(10, true),
        Err(HeapError::IndexFull { capacity: 2 })
    ));
    heap.check().unwrap();

    // reusing a's hole exactly needs no new entry
    let again = heap.allocate(64, false).unwrap();
    assert_eq!(again, a);
    heap.free(c.as_ptr()).unwrap();
    heap.check().unwrap();
}

#[test]
fn usable_size_covers_the_request() {
    let arena = Arena::new(MIB);
    let mut heap = arena.heap(64 * KIB, MIB);

    for size in [0, 1, 7, 8, 100, 4095] {
        let p = heap.allocate(size, false).unwrap();
        let usable = heap.usable_size(p.as_ptr()).unwrap();
        assert!(usable >= size.max(1));
        assert_eq!(usable % 8, 0);
    }
    heap.check().unwrap();
}

#[test]
fn explicit_resize_respects_max() {
    let arena = Arena::new(MIB);
    let mut heap = arena.heap(64 * KIB, 256 * KIB);
    let start = heap.start_address();

    heap.resize(128 * KIB).unwrap();
    assert_eq!(heap.end_address(), start + 128 * KIB);

    assert!(matches!(
        heap.resize(MIB),
        Err(HeapError::OutOfRange { .. })
    ));
    assert_eq!(heap.end_address(), start + 128 * KIB);

    heap.resize(100_000).unwrap();
    assert_eq!(heap.end_address(), start + 25 * PAGE_SIZE);
    assert!(heap.end_address() <= heap.max_address());
    heap.check().unwrap();
}

#[test]
fn explicit_shrink_trims_the_trailing_hole() {
    let arena = Arena::new(MIB);
    let mut heap = arena.heap(64 * KIB, MIB);
    let start = heap.start_address();

    heap.resize(32 * KIB).unwrap();
    assert_eq!(heap.end_address(), start + 32 * KIB);
    let stats = heap.check().unwrap();
    assert_eq!(stats.free_bytes, heap.size());
    assert_eq!(holes(&heap)[0].end(), heap.end_address());

    let p = heap.allocate(100, false).unwrap();
    unsafe { p.as_ptr().write_bytes(0x5A, 100) };
    heap.check().unwrap();

    // the hole behind the allocation starts past the new end
    assert!(matches!(heap.resize(0), Err(HeapError::InUse { .. })));
    heap.free(p.as_ptr()).unwrap();
    heap.resize(0).unwrap();
    assert_eq!(heap.size(), 0);
    assert!(matches!(heap.resize(0), Ok(())));
}

#[test]
fn explicit_shrink_releases_a_hole_that_starts_at_the_new_end() {
    let arena = Arena::new(MIB);
    let mut heap = arena.heap(64 * KIB, MIB);

    heap.resize(0).unwrap();
    assert_eq!(heap.hole_count(), 0);
    heap.check().unwrap();

    let p = heap.allocate(100, false).unwrap();
    heap.free(p.as_ptr()).unwrap();
    heap.check().unwrap();
}

#[test]
fn explicit_grow_tiles_the_new_space() {
    let arena = Arena::new(MIB);
    let mut heap = arena.heap(64 * KIB, MIB);

    heap.resize(128 * KIB).unwrap();
    let stats = heap.check().unwrap();
    assert_eq!(stats.blocks, 1);
    assert_eq!(stats.free_bytes, heap.size());

    let big = heap.allocate(100 * KIB, false).unwrap();
    unsafe { big.as_ptr().write_bytes(0x11, 100 * KIB) };
    heap.check().unwrap();
}

#[test]
fn explicit_resize_around_a_trailing_allocation() {
    let arena = Arena::new(MIB);
    let mut heap = arena.heap(64 * KIB, MIB);
    let size = heap.size();
    let start = heap.start_address();

    let all = heap.allocate(size - MIN_BLOCK_SIZE, false).unwrap();
    assert_eq!(heap.hole_count(), 0);

    assert_eq!(
        heap.resize(PAGE_SIZE),
        Err(HeapError::InUse {
            address: start + PAGE_SIZE
        })
    );
    assert_eq!(heap.size(), size);
    heap.check().unwrap();

    // the new space becomes a hole of its own behind the allocation
    heap.resize(size + 2 * PAGE_SIZE).unwrap();
    let stats = heap.check().unwrap();
    assert_eq!(stats.free_blocks, 1);
    assert_eq!(stats.free_bytes, 2 * PAGE_SIZE);

    let p = heap.allocate(100, false).unwrap();
    assert_eq!(p.as_ptr().addr(), start + size + HEADER_SIZE);
    heap.check().unwrap();

    // the remaining hole starts past the original end
    assert!(matches!(
        heap.resize(size),
        Err(HeapError::InUse { .. })
    ));
    heap.check().unwrap();

    heap.free(p.as_ptr()).unwrap();
    heap.free(all.as_ptr()).unwrap();
    heap.check().unwrap();
}

#[test]
fn growth_that_would_overflow_the_index_changes_nothing() {
    let arena = Arena::new(MIB);
    let mut heap = arena.heap_with(
        2 * PAGE_SIZE,
        MIB,
        HeapConfig::new().with_index_capacity(2),
    );

    let a = heap.allocate(64, false).unwrap();
    let _b = heap.allocate(64, false).unwrap();
    heap.free(a.as_ptr()).unwrap();
    assert_eq!(heap.hole_count(), 2);

    let end = heap.end_address();
    let before = holes(&heap);

    // growing would leave both a leading and a trailing hole
    assert_eq!(
        heap.allocate(5000, true),
        Err(HeapError::IndexFull { capacity: 2 })
    );
    assert_eq!(heap.end_address(), end);
    assert_eq!(holes(&heap), before);
    heap.check().unwrap();

    // without alignment, the grown hole splits into one block and one hole
    let c = heap.allocate(5000, false).unwrap();
    assert!(heap.end_address() > end);
    unsafe { c.as_ptr().write_bytes(0x33, 5000) };
    heap.check().unwrap();
}

#[test]
fn unaligned_bounds_are_rounded_inward() {
    let arena = Arena::new(2 * MIB);
    let base = arena.start();
    let heap = unsafe { Heap::create(base + 8, base + 64 * KIB + 100, base + MIB + 5) };

    assert_eq!(heap.start_address() % PAGE_SIZE, 0);
    assert!(heap.start_address() > base + 8);
    assert_eq!(heap.end_address(), base + 64 * KIB);
    assert_eq!(heap.max_address(), base + MIB);
    heap.dump();
    let stats = heap.check().unwrap();
    assert_eq!(stats.free_bytes, heap.size());
}
