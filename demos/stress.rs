//! Allocates random-sized arrays from many threads, through a shared
//! `MemoryPool` and then through the global allocator, checking every array
//! for corruption.

use std::{
    mem::MaybeUninit,
    sync::Mutex,
    thread,
    time::{Duration, Instant},
};

use basis_sync::{
    MemoryPool,
    base::{BaseAlloc, Global},
};

const COOKIE: usize = 0xbf58476d1ce4e5b9;
const THREADS: usize = 6;
#[cfg(not(debug_assertions))]
const SCALE: usize = 2000;
#[cfg(debug_assertions)]
const SCALE: usize = 50;
#[cfg(not(debug_assertions))]
const ITER: usize = 10;
#[cfg(debug_assertions)]
const ITER: usize = 2;

fn main() {
    let pool = MemoryPool::new(Global);
    println!("pool:   {:?}", do_bench(|n| Items::in_pool(&pool, n)));
    println!("        {:?}", pool.stat());
    println!("system: {:?}", do_bench(Items::boxed));

    #[cfg(feature = "base-mmap")]
    {
        let pool = MemoryPool::new(basis_sync::base::Mmap);
        println!("mmap:   {:?}", do_bench(|n| Items::in_pool(&pool, n)));
    }
}

fn do_bench<'a, F>(alloc: F) -> Duration
where
    F: Fn(usize) -> Items<'a> + Sync,
{
    let transfer: Vec<_> = (0..THREADS).map(|_| Mutex::new(Vec::new())).collect();
    let start = Instant::now();
    for _ in 0..ITER {
        thread::scope(|s| {
            for tid in 0..THREADS {
                let (alloc, transfer) = (&alloc, &transfer);
                s.spawn(move || bench_one(tid, transfer, alloc));
            }
        });
        for slot in &transfer {
            slot.lock().unwrap().drain(..).for_each(|items: Items| items.check());
        }
    }
    start.elapsed()
}

fn bench_one<'a>(
    tid: usize,
    transfer: &[Mutex<Vec<Items<'a>>>],
    alloc: &impl Fn(usize) -> Items<'a>,
) {
    let mut data = Vec::new();
    for _ in 0..SCALE * (tid % 4 + 1) {
        data.push(alloc(1 << fastrand::u32(0..6)));

        if probably(50) {
            let index = fastrand::usize(0..data.len());
            data.swap_remove(index).check();
        }
        if probably(10) && !data.is_empty() {
            let index = fastrand::usize(0..data.len());
            let peer = fastrand::usize(0..transfer.len());
            transfer[peer].lock().unwrap().push(data.swap_remove(index));
        }
    }
    data.into_iter().for_each(Items::check);
}

#[inline]
fn probably(p: u8) -> bool {
    fastrand::u8(0..=100) <= p
}

fn scaled(count: usize) -> usize {
    if probably(1) {
        if probably(10) { count * 1000 } else { count * 100 }
    } else {
        count
    }
}

enum Storage<'a> {
    Pool(&'a mut [usize]),
    Boxed(Box<[usize]>),
}

struct Items<'a>(Storage<'a>);

impl<'a> Items<'a> {
    fn in_pool<B: BaseAlloc>(pool: &'a MemoryPool<B>, count: usize) -> Self {
        let count = scaled(count);
        let slice = pool.get::<usize>(count).unwrap();
        for (i, slot) in slice.iter_mut().enumerate() {
            slot.write((count - i) ^ COOKIE);
        }
        // SAFETY: every element is initialized above.
        let slice = unsafe { &mut *(slice as *mut [MaybeUninit<usize>] as *mut [usize]) };
        Items(Storage::Pool(slice))
    }

    fn boxed(count: usize) -> Self {
        let count = scaled(count);
        Items(Storage::Boxed((0..count).map(|i| (count - i) ^ COOKIE).collect()))
    }

    fn check(self) {
        let values: &[usize] = match &self.0 {
            Storage::Pool(slice) => slice,
            Storage::Boxed(boxed) => boxed,
        };
        for (index, &value) in values.iter().enumerate() {
            assert_eq!(
                value ^ COOKIE,
                values.len() - index,
                "memory corruption at {:p}[{index}]",
                values
            );
        }
    }
}
