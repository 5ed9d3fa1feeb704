//! Hammers a read-mostly table with readers and a few writers, through
//! `basis_sync::RwLock` and then `std::sync::RwLock`.

use std::{
    sync::RwLock as StdRwLock,
    thread,
    time::{Duration, Instant},
};

use basis_sync::RwLock;

const THREADS: usize = 8;
const LEN: usize = 64;
#[cfg(not(debug_assertions))]
const ROUNDS: usize = 200_000;
#[cfg(debug_assertions)]
const ROUNDS: usize = 5_000;
/// One round out of `WRITE_RATIO` writes.
const WRITE_RATIO: usize = 16;

trait Table: Sync {
    fn read_sum(&self) -> u64;
    fn bump(&self, index: usize);
}

impl Table for RwLock<Vec<u64>> {
    fn read_sum(&self) -> u64 {
        self.read().iter().sum()
    }

    fn bump(&self, index: usize) {
        self.write()[index] += 1;
    }
}

impl Table for StdRwLock<Vec<u64>> {
    fn read_sum(&self) -> u64 {
        self.read().unwrap().iter().sum()
    }

    fn bump(&self, index: usize) {
        self.write().unwrap()[index] += 1;
    }
}

fn main() {
    let lock = RwLock::new(vec![0u64; LEN]).expect("failed to create the lock");
    println!("basis: {:?}", do_bench(&lock));
    let writes = lock.into_inner().iter().sum::<u64>();

    let std_lock = StdRwLock::new(vec![0u64; LEN]);
    println!("std:   {:?}", do_bench(&std_lock));
    assert_eq!(writes, std_lock.into_inner().unwrap().iter().sum::<u64>());
}

fn do_bench(table: &impl Table) -> Duration {
    let start = Instant::now();
    thread::scope(|s| {
        for tid in 0..THREADS {
            s.spawn(move || {
                let mut last = 0;
                for round in 0..ROUNDS {
                    if (round + tid) % WRITE_RATIO == 0 {
                        table.bump(round % LEN);
                    } else {
                        let sum = table.read_sum();
                        assert!(sum >= last, "writes went backwards");
                        last = sum;
                    }
                }
            });
        }
    });
    start.elapsed()
}
