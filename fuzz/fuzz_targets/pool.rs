#![no_main]

mod common;

use std::{alloc::Layout, sync::Mutex};

use basis_sync::{MemoryPool, base::Global};
use libfuzzer_sys::{arbitrary::Arbitrary, fuzz_target};

use self::common::{THREADS, run_threads};

const CHUNK: usize = 4096;

#[derive(Debug, Arbitrary)]
enum Action {
    Allocate { size: u16, align_shift: u8 },
    Check { index: u8 },
}

fuzz_target!(|action_sets: [Vec<Action>; THREADS]| {
    let pool = MemoryPool::with_chunk_size(Global, CHUNK);
    let ranges = Mutex::new(Vec::new());

    run_threads(action_sets, |tid, actions| {
        let mut allocations = Vec::new();
        for action in actions {
            match action {
                Action::Allocate { size, align_shift } => {
                    let size = size as usize % (CHUNK * 3) + 1;
                    let align = 1 << (align_shift % 8);
                    let layout = Layout::from_size_align(size, align).unwrap();

                    let ptr = pool.allocate(layout).unwrap().cast::<u8>();
                    assert_eq!(ptr.addr().get() % align, 0);
                    // SAFETY: the piece is ours for `size` bytes.
                    unsafe { ptr.write_bytes(tid as u8, size) };
                    allocations.push((ptr, size));
                }
                Action::Check { index } => {
                    if !allocations.is_empty() {
                        let (ptr, size) = allocations[index as usize % allocations.len()];
                        // SAFETY: the piece is ours and initialized above.
                        let bytes = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), size) };
                        assert!(bytes.iter().all(|&b| b == tid as u8));
                    }
                }
            }
        }
        let mine = allocations.iter().map(|&(ptr, size)| (ptr.addr().get(), size));
        ranges.lock().unwrap().extend(mine);
    });

    let mut ranges = ranges.into_inner().unwrap();
    ranges.sort_unstable();
    for pair in ranges.windows(2) {
        assert!(pair[0].0 + pair[0].1 <= pair[1].0, "{pair:?} overlap");
    }

    let requested: usize = ranges.iter().map(|&(_, size)| size).sum();
    // SAFETY: every thread is joined, and the pieces are no longer used.
    let stat = unsafe { pool.clear() };
    assert_eq!(stat.basic_bytes % CHUNK, 0);
    assert!(stat.total_bytes() >= requested);
    pool.stat().assert_clean();
});
