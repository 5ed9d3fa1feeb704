#![no_main]

mod common;

use std::sync::Mutex;

use basis_sync::BoundedQueue;
use libfuzzer_sys::{arbitrary::Arbitrary, fuzz_target};

use self::common::{THREADS, run_threads, tag, untag};

#[derive(Debug, Arbitrary)]
enum Action {
    Push,
    Pop,
    Len,
}

fuzz_target!(|action_sets: [Vec<Action>; THREADS]| {
    let queue = BoundedQueue::<u64, 16>::new();
    let pushed = Mutex::new([0usize; THREADS]);
    let popped = Mutex::new(Vec::new());

    run_threads(action_sets, |tid, actions| {
        let mut seq = 0;
        let mut last_seen = [None; THREADS];
        let mut mine = Vec::new();
        for action in actions {
            match action {
                Action::Push => {
                    if queue.push(tag(tid, seq)).is_ok() {
                        seq += 1;
                    }
                }
                Action::Pop => {
                    if let Some(value) = queue.pop() {
                        let (producer, n) = untag(value);
                        assert!(producer < THREADS);
                        // One consumer sees each producer's values in order.
                        if let Some(last) = last_seen[producer] {
                            assert!(n > last, "{producer}: {n} after {last}");
                        }
                        last_seen[producer] = Some(n);
                        mine.push(value);
                    }
                }
                Action::Len => assert!(queue.len() <= queue.capacity()),
            }
        }
        pushed.lock().unwrap()[tid] = seq;
        popped.lock().unwrap().extend(mine);
    });

    let mut values = popped.into_inner().unwrap();
    while let Some(value) = queue.pop() {
        values.push(value);
    }
    values.sort_unstable();

    let pushed = pushed.into_inner().unwrap();
    let expected: Vec<_> = (0..THREADS)
        .flat_map(|tid| (0..pushed[tid]).map(move |seq| tag(tid, seq)))
        .collect();
    assert_eq!(values, expected);
});
