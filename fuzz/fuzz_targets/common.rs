use std::thread;

pub const THREADS: usize = 4;

/// Runs one action list per thread, all at once.
pub fn run_threads<A: Send>(action_sets: [Vec<A>; THREADS], f: impl Fn(usize, Vec<A>) + Sync) {
    thread::scope(|s| {
        for (tid, actions) in action_sets.into_iter().enumerate() {
            let f = &f;
            s.spawn(move || f(tid, actions));
        }
    });
}

/// A value tagging its producer and sequence number, so that losses,
/// duplicates and reorderings can be told apart.
pub const fn tag(tid: usize, seq: usize) -> u64 {
    ((tid as u64) << 32) | seq as u64
}

pub const fn untag(value: u64) -> (usize, usize) {
    ((value >> 32) as usize, value as u32 as usize)
}
