#![no_main]
use hugealloc_core::{ChunkPool, HugeAllocator, HugeConfig, InPlace, JunkMode, ProfTctx};
use libfuzzer_sys::fuzz_target;
use std::ptr::NonNull;

const LG_CHUNK: u8 = 16;
const CHUNK: usize = 1 << LG_CHUNK;
const POOL_CHUNKS: usize = 64;

fuzz_target!(|data: &[u8]| {
    // Each op is 4 bytes: opcode, target index, size in quarter chunks.
    if data.len() < 4 {
        return;
    }

    let config = HugeConfig {
        lg_chunk: LG_CHUNK,
        narenas: 2,
        junk: if data[0] & 1 == 1 { JunkMode::Full } else { JunkMode::Off },
        log_capacity: 32,
        ..HugeConfig::default()
    };
    let Ok(pool) = ChunkPool::new(LG_CHUNK, POOL_CHUNKS) else {
        return;
    };
    let Ok(huge) = HugeAllocator::new(config, pool) else {
        return;
    };
    let mut live: Vec<(NonNull<u8>, usize)> = Vec::new();

    for op in data[1..].chunks_exact(4) {
        let quarters = u16::from_le_bytes([op[2], op[3]]) as usize % (4 * 8) + 1;
        let size = quarters * CHUNK / 4;
        let pick = (op[1] as usize).checked_rem(live.len());

        match (op[0] % 6, pick) {
            (0, _) | (_, None) => {
                if let Ok(ptr) = huge.allocate(size, op[1] & 1 == 1, None) {
                    let usable = huge.usable_size(ptr).unwrap();
                    assert!(usable >= size);
                    assert_eq!(ptr.as_ptr() as usize % CHUNK, 0);
                    live.push((ptr, usable));
                }
            }
            (1, Some(i)) => {
                let (ptr, old) = live[i];
                let max = size + (op[1] as usize % 4) * CHUNK / 4;
                match huge.resize_in_place(ptr, old, size, max, false) {
                    InPlace::Resized => {
                        live[i].1 = huge.usable_size(ptr).unwrap();
                    }
                    InPlace::MustMove => assert_eq!(huge.usable_size(ptr), Some(old)),
                }
            }
            (2, Some(i)) => {
                let (ptr, old) = live[i];
                if let Ok(moved) = huge.resize_or_move(ptr, old, size, CHUNK, false, None, None) {
                    let now = huge.usable_size(moved).unwrap();
                    assert!(now >= size);
                    live[i] = (moved, now);
                } else {
                    assert_eq!(huge.usable_size(ptr), Some(old));
                }
            }
            (3, Some(i)) => {
                let (ptr, _) = live[i];
                assert!(huge.set_prof_tctx(ptr, ProfTctx::from_raw(size)));
                assert_eq!(huge.prof_tctx(ptr), Some(ProfTctx::from_raw(size)));
                assert!(huge.reset_prof_tctx(ptr));
                assert!(huge.owning_arena(ptr).is_some());
            }
            (_, Some(i)) => {
                let (ptr, _) = live.swap_remove(i);
                huge.deallocate(ptr);
                assert_eq!(huge.usable_size(ptr), None);
            }
        }

        assert_eq!(huge.registry().len(), live.len());
        let chunks: usize = live.iter().map(|&(_, s)| huge.classes().chunk_ceiling(s)).sum();
        assert_eq!(huge.registry().current_chunks() * CHUNK, chunks);
        assert_eq!(huge.backend().used_chunks() * CHUNK, chunks);
    }

    for (ptr, _) in live {
        huge.deallocate(ptr);
    }
    assert!(huge.registry().is_empty());
    assert_eq!(huge.backend().used_chunks(), 0);
});
