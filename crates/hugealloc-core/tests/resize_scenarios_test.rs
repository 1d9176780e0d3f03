mod common;

use common::{CHUNK, XorShift64, bytes, paint, pool_allocator};
use hugealloc_core::config::{ALLOC_JUNK, FREE_JUNK};
use hugealloc_core::size_class::s2u;
use hugealloc_core::{ArenaId, ChunkBackend, InPlace};

const ARENA: ArenaId = ArenaId::new(0);

#[test]
fn allocate_rounds_and_aligns_across_classes() {
    let huge = pool_allocator("", 64);
    for (size, alignment) in [
        (1, CHUNK),
        (CHUNK, CHUNK),
        (CHUNK + 1, CHUNK),
        (3 * CHUNK - 7, CHUNK),
        (CHUNK, 4 * CHUNK),
        (5 * CHUNK, 8 * CHUNK),
        (100, 4096),
    ] {
        let p = huge.allocate_aligned(size, alignment, false, None).unwrap();
        let expected = if size <= CHUNK { CHUNK } else { s2u(size).unwrap() };
        assert_eq!(huge.usable_size(p), Some(expected), "size {size}");
        assert_eq!(p.as_ptr() as usize % alignment.max(CHUNK), 0);
        huge.deallocate(p);
    }
    assert!(huge.registry().is_empty());
    assert_eq!(huge.backend().used_chunks(), 0);
}

#[test]
fn expand_into_free_successor() {
    let huge = pool_allocator("", 16);
    let p = huge.allocate(2 * CHUNK, false, None).unwrap();
    let target = 2 * CHUNK + CHUNK / 2;
    assert_eq!(
        huge.resize_in_place(p, 2 * CHUNK, 2 * CHUNK, target, false),
        InPlace::Resized
    );
    assert_eq!(huge.usable_size(p), Some(target));
    assert_eq!(huge.backend().used_chunks(), 3);
    assert_eq!(huge.registry().current_chunks(), 3);
    huge.deallocate(p);
}

#[test]
fn blocked_expand_must_move() {
    let huge = pool_allocator("", 16);
    let p = huge.allocate(2 * CHUNK, false, None).unwrap();
    let blocker = huge.allocate(CHUNK, false, None).unwrap();
    let target = 2 * CHUNK + CHUNK / 2;

    assert_eq!(
        huge.resize_in_place(p, 2 * CHUNK, target, target, false),
        InPlace::MustMove
    );
    assert_eq!(huge.usable_size(p), Some(2 * CHUNK));

    // A range whose lower bound fits the current run is satisfied as is.
    assert_eq!(
        huge.resize_in_place(p, 2 * CHUNK, 2 * CHUNK, target, false),
        InPlace::Resized
    );
    assert_eq!(huge.usable_size(p), Some(2 * CHUNK));

    huge.deallocate(blocker);
    huge.deallocate(p);
}

#[test]
fn expand_falls_back_to_min() {
    let huge = pool_allocator("", 16);
    let p = huge.allocate(CHUNK, false, None).unwrap();
    let gap = huge.allocate(CHUNK, false, None).unwrap();
    let _blocker = huge.allocate(CHUNK, false, None).unwrap();
    huge.deallocate(gap);

    // Room for one more chunk but not two.
    assert_eq!(
        huge.resize_in_place(p, CHUNK, 2 * CHUNK, 3 * CHUNK, false),
        InPlace::Resized
    );
    assert_eq!(huge.usable_size(p), Some(2 * CHUNK));
}

#[test]
fn resize_or_move_to_half_shrinks_in_place() {
    let huge = pool_allocator("", 16);
    let n = 5 * CHUNK;
    let p = huge.allocate(n, false, None).unwrap();
    unsafe { paint(p, n, 0x3c) };

    let q = huge
        .resize_or_move(p, n, n / 2, CHUNK, false, None, None)
        .unwrap();
    assert_eq!(q, p);
    assert_eq!(huge.usable_size(q), s2u(n / 2));
    assert_eq!(huge.backend().used_chunks(), 3);
    assert!(unsafe { bytes(q, n / 2) }.iter().all(|&b| b == 0x3c));
    assert_eq!(huge.stats(ARENA).unwrap().nmoves, 0);
    huge.deallocate(q);
}

#[test]
fn resize_or_move_copies_when_blocked() {
    let huge = pool_allocator("", 16);
    let p = huge.allocate(CHUNK, false, None).unwrap();
    let blocker = huge.allocate(CHUNK, false, None).unwrap();
    unsafe { paint(p, CHUNK, 0x77) };

    let q = huge
        .resize_or_move(p, CHUNK, 3 * CHUNK, CHUNK, false, None, None)
        .unwrap();
    assert_ne!(q, p);
    assert!(huge.usable_size(p).is_none());
    assert_eq!(huge.usable_size(q), Some(3 * CHUNK));
    assert!(unsafe { bytes(q, CHUNK) }.iter().all(|&b| b == 0x77));
    assert_eq!(huge.stats(ARENA).unwrap().nmoves, 1);

    // The old run is free again.
    let again = huge.allocate(CHUNK, false, None).unwrap();
    assert_eq!(again, p);
    for ptr in [again, blocker, q] {
        huge.deallocate(ptr);
    }
}

#[test]
fn similar_resize_stays_in_run() {
    let huge = pool_allocator("", 16);
    let p = huge.allocate(CHUNK + CHUNK / 4, false, None).unwrap();
    let grown = CHUNK + CHUNK / 2;
    assert_eq!(
        huge.resize_in_place(p, CHUNK + CHUNK / 4, grown, grown, false),
        InPlace::Resized
    );
    assert_eq!(huge.usable_size(p), Some(grown));
    assert_eq!(huge.backend().used_chunks(), 2);

    // Picks the largest class not above the current size.
    assert_eq!(
        huge.resize_in_place(p, grown, CHUNK, 2 * CHUNK, false),
        InPlace::Resized
    );
    assert_eq!(huge.usable_size(p), Some(grown));
    huge.deallocate(p);
}

#[test]
fn successful_resizes_keep_address_and_track_size() {
    let huge = pool_allocator("", 32);
    let mut rng = XorShift64::new(0x5eed_1234);
    let p = huge.allocate(2 * CHUNK, false, None).unwrap();
    let mut size = 2 * CHUNK;
    for _ in 0..300 {
        let min = rng.gen_range(CHUNK, 8 * CHUNK);
        let max = min + rng.gen_range(0, 2 * CHUNK);
        match huge.resize_in_place(p, size, min, max, rng.gen_bool()) {
            InPlace::Resized => {
                let now = huge.usable_size(p).unwrap();
                assert!(now >= s2u(min).unwrap() && now <= s2u(max).unwrap(), "{now} not in [{min}, {max}]");
                size = now;
            }
            InPlace::MustMove => assert_eq!(huge.usable_size(p), Some(size)),
        }
        assert_eq!(huge.owning_arena(p), Some(ARENA));
    }
    assert_eq!(
        huge.registry().current_chunks(),
        huge.classes().chunk_ceiling(size) / CHUNK
    );
    huge.deallocate(p);
    assert_eq!(huge.backend().used_chunks(), 0);
}

#[test]
fn zeroed_allocation_after_dirty_reuse() {
    let huge = pool_allocator("", 8);
    let p = huge.allocate(3 * CHUNK, false, None).unwrap();
    unsafe { paint(p, 3 * CHUNK, 0xff) };
    huge.deallocate(p);

    let q = huge.allocate(3 * CHUNK, true, None).unwrap();
    assert_eq!(q, p);
    assert!(unsafe { bytes(q, 3 * CHUNK) }.iter().all(|&b| b == 0));
    huge.deallocate(q);
}

#[test]
fn zero_option_applies_without_request() {
    let huge = pool_allocator("zero:true", 8);
    let p = huge.allocate(2 * CHUNK, false, None).unwrap();
    unsafe { paint(p, 2 * CHUNK, 0xff) };
    huge.deallocate(p);
    let q = huge.allocate(2 * CHUNK, false, None).unwrap();
    assert!(unsafe { bytes(q, 2 * CHUNK) }.iter().all(|&b| b == 0));
    huge.deallocate(q);
}

#[test]
fn expand_zeroes_dirty_tail_and_new_chunks() {
    let huge = pool_allocator("", 8);
    let p = huge.allocate(3 * CHUNK, false, None).unwrap();
    unsafe { paint(p, 3 * CHUNK, 0xff) };
    huge.deallocate(p);

    let small = CHUNK + CHUNK / 4;
    let q = huge.allocate(small, false, None).unwrap();
    assert_eq!(q, p);
    let target = 2 * CHUNK + CHUNK / 2;
    assert_eq!(
        huge.resize_in_place(q, small, target, target, true),
        InPlace::Resized
    );
    let view = unsafe { bytes(q, target) };
    assert!(view[..small].iter().all(|&b| b == 0xff));
    assert!(view[small..].iter().all(|&b| b == 0));
    huge.deallocate(q);
}

#[test]
fn expand_into_dirty_chunks_then_zeroed_grow_in_run() {
    let huge = pool_allocator("", 8);
    let p = huge.allocate(CHUNK, false, None).unwrap();
    assert!(huge.huge_extents(ARENA).unwrap()[0].zeroed);
    let dirty = huge.allocate(2 * CHUNK, false, None).unwrap();
    unsafe { paint(dirty, 2 * CHUNK, 0xff) };
    huge.deallocate(dirty);

    let small = CHUNK + CHUNK / 4;
    assert_eq!(huge.resize_in_place(p, CHUNK, small, small, false), InPlace::Resized);
    assert_eq!(huge.usable_size(p), Some(small));
    // The slack now sits in the reused chunk.
    assert!(!huge.huge_extents(ARENA).unwrap()[0].zeroed);

    let full = 2 * CHUNK;
    assert_eq!(huge.resize_in_place(p, small, full, full, true), InPlace::Resized);
    assert_eq!(huge.usable_size(p), Some(full));
    let view = unsafe { bytes(p, full) };
    assert_eq!(view[small..].iter().filter(|&&b| b != 0).count(), 0);
    huge.deallocate(p);
}

#[test]
fn expand_into_clean_chunks_keeps_slack_zeroed() {
    let huge = pool_allocator("", 8);
    let p = huge.allocate(CHUNK, false, None).unwrap();
    unsafe { paint(p, CHUNK, 0x33) };

    let small = CHUNK + CHUNK / 4;
    assert_eq!(huge.resize_in_place(p, CHUNK, small, small, false), InPlace::Resized);
    assert!(huge.huge_extents(ARENA).unwrap()[0].zeroed);

    assert_eq!(huge.resize_in_place(p, small, 2 * CHUNK, 2 * CHUNK, true), InPlace::Resized);
    let view = unsafe { bytes(p, 2 * CHUNK) };
    assert!(view[..CHUNK].iter().all(|&b| b == 0x33));
    assert!(view[small..].iter().all(|&b| b == 0));
    huge.deallocate(p);
}

#[test]
fn junk_on_alloc_marks_every_byte() {
    let huge = pool_allocator("junk:alloc", 8);
    let p = huge.allocate(2 * CHUNK, false, None).unwrap();
    assert!(unsafe { bytes(p, 2 * CHUNK) }.iter().all(|&b| b == ALLOC_JUNK));

    let target = 3 * CHUNK;
    assert_eq!(
        huge.resize_in_place(p, 2 * CHUNK, target, target, false),
        InPlace::Resized
    );
    assert!(unsafe { bytes(p, target) }.iter().all(|&b| b == ALLOC_JUNK));

    let zeroed = huge.allocate(CHUNK, true, None).unwrap();
    assert!(unsafe { bytes(zeroed, CHUNK) }.iter().all(|&b| b == 0));
    huge.deallocate(zeroed);
    huge.deallocate(p);
}

#[test]
fn junk_on_free_marks_trimmed_and_released_bytes() {
    let huge = pool_allocator("junk:free", 8);
    let p = huge.allocate(3 * CHUNK, false, None).unwrap();
    let small = CHUNK + CHUNK / 4;
    assert_eq!(
        huge.resize_in_place(p, 3 * CHUNK, small, small, false),
        InPlace::Resized
    );
    // The pool keeps released chunks mapped, so the trimmed tail stays readable.
    assert!(unsafe { bytes(p, 2 * CHUNK) }[small..].iter().all(|&b| b == FREE_JUNK));

    huge.deallocate(p);
    assert!(unsafe { bytes(p, small) }.iter().all(|&b| b == FREE_JUNK));
}

#[test]
fn similar_shrink_then_zeroed_grow() {
    let huge = pool_allocator("", 8);
    let big = CHUNK + CHUNK / 2;
    let small = CHUNK + CHUNK / 4;
    let p = huge.allocate(big, false, None).unwrap();
    unsafe { paint(p, big, 0xee) };

    assert_eq!(huge.resize_in_place(p, big, small, small, false), InPlace::Resized);
    assert_eq!(huge.usable_size(p), Some(small));
    assert_eq!(huge.resize_in_place(p, small, big, big, true), InPlace::Resized);
    let view = unsafe { bytes(p, big) };
    assert!(view[..small].iter().all(|&b| b == 0xee));
    assert!(view[small..].iter().all(|&b| b == 0));
    huge.deallocate(p);
}

#[test]
fn junked_similar_shrink_is_rezeroed_on_grow() {
    let huge = pool_allocator("junk:free", 8);
    let big = CHUNK + CHUNK / 2;
    let small = CHUNK + CHUNK / 4;
    let p = huge.allocate(big, false, None).unwrap();

    assert_eq!(huge.resize_in_place(p, big, small, small, false), InPlace::Resized);
    assert!(unsafe { bytes(p, big) }[small..].iter().all(|&b| b == FREE_JUNK));
    assert_eq!(huge.resize_in_place(p, small, big, big, true), InPlace::Resized);
    assert!(unsafe { bytes(p, big) }[small..].iter().all(|&b| b == 0));
    huge.deallocate(p);
}

#[test]
fn registry_gauges_follow_resizes() {
    let huge = pool_allocator("", 16);
    let p = huge.allocate(2 * CHUNK, false, None).unwrap();
    assert_eq!(huge.registry().current_chunks(), 2);
    assert!(huge.resize_in_place(p, 2 * CHUNK, 4 * CHUNK, 4 * CHUNK, false).is_resized());
    assert_eq!(huge.registry().current_chunks(), 4);
    assert!(huge.resize_in_place(p, 4 * CHUNK, CHUNK, CHUNK, false).is_resized());
    assert_eq!(huge.registry().current_chunks(), 1);
    assert_eq!(huge.registry().high_chunks(), 4);
    huge.deallocate(p);
    assert_eq!(huge.registry().current_chunks(), 0);
}

#[test]
fn every_completed_operation_ticks_decay() {
    let huge = pool_allocator("", 8);
    let p = huge.allocate(CHUNK, false, None).unwrap();
    assert!(huge.resize_in_place(p, CHUNK, 2 * CHUNK, 2 * CHUNK, false).is_resized());
    assert_eq!(huge.resize_in_place(p, 2 * CHUNK, 16, 16, false), InPlace::MustMove);
    huge.deallocate(p);
    assert_eq!(huge.backend().decay_ticks(ARENA), 3);
    assert!(!huge.backend().unmaps_on_release());
}

#[test]
fn stats_and_logs_record_lifecycle() {
    let huge = pool_allocator("", 8);
    let p = huge.allocate(CHUNK, false, None).unwrap();
    assert!(huge.resize_in_place(p, CHUNK, 2 * CHUNK, 2 * CHUNK, false).is_resized());
    huge.deallocate(p);

    let stats = huge.stats(ARENA).unwrap();
    assert_eq!(stats.nmalloc, 1);
    assert_eq!(stats.ndalloc, 1);
    assert_eq!(stats.nresize_in_place, 1);
    assert_eq!(stats.allocated, 0);
    assert_eq!(stats.live, 0);

    let events: Vec<&str> = huge
        .drain_lifecycle_logs()
        .iter()
        .map(|record| record.event)
        .collect();
    assert_eq!(events, vec!["alloc", "expand", "dalloc"]);
}
