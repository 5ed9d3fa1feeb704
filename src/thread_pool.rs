//! The module of thread pools.
//!
//! See [`ThreadPool`] for more information.

use core::{
    mem,
    sync::atomic::{AtomicUsize, Ordering::*},
    time::Duration,
};
use std::{
    any::Any,
    collections::{BTreeMap, VecDeque},
    io,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    thread::{self, JoinHandle},
    time::Instant,
};

use parking_lot::{Condvar, Mutex};

type Task = Box<dyn FnOnce() + Send + 'static>;

static POOL_ID: AtomicUsize = AtomicUsize::new(0);

#[derive(Default)]
struct State {
    tasks: VecDeque<Task>,
    /// Keyed by the due time and a sequence number, which keeps the tasks
    /// due at the same instant in submission order.
    delayed: BTreeMap<(Instant, u64), Task>,
    seq: u64,
    shutdown: bool,
}

#[derive(Default)]
struct Shared {
    state: Mutex<State>,
    /// Signaled when a task is queued or on shutdown.
    available: Condvar,
    /// Signaled when a delayed task is queued or on shutdown.
    timer: Condvar,
    panicked: AtomicUsize,
}

impl Shared {
    fn run(&self, task: Task) {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(task)) {
            self.panicked.fetch_add(1, Relaxed);
            report!(error, "thread pool: task panicked: {}", panic_message(&*payload));
        }
    }

    fn work(&self) {
        loop {
            let task = {
                let mut state = self.state.lock();
                loop {
                    if state.shutdown {
                        return;
                    }
                    if let Some(task) = state.tasks.pop_front() {
                        break task;
                    }
                    self.available.wait(&mut state);
                }
            };
            self.run(task);
        }
    }

    /// Moves the delayed tasks into the queue as they become due.
    fn tick(&self) {
        let mut state = self.state.lock();
        loop {
            if state.shutdown {
                return;
            }

            let now = Instant::now();
            let mut due = 0;
            while let Some(entry) = state.delayed.first_entry()
                && entry.key().0 <= now
            {
                let task = entry.remove();
                state.tasks.push_back(task);
                due += 1;
            }
            match due {
                0 => {}
                1 => {
                    self.available.notify_one();
                }
                _ => {
                    self.available.notify_all();
                }
            }

            let next = state.delayed.first_key_value().map(|(&(due, _), _)| due);
            match next {
                Some(deadline) => {
                    self.timer.wait_until(&mut state, deadline);
                }
                None => self.timer.wait(&mut state),
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        *s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "<non-string payload>"
    }
}

/// A fixed set of worker threads draining a shared task queue.
///
/// Tasks are run in submission order by whichever worker is free. Delayed
/// tasks wait in a timer queue, drained by a dedicated thread into the task
/// queue when due.
///
/// A pool of zero threads runs every task inline in the submitting thread.
///
/// A panicking task is caught and counted, and never brings down its
/// worker. Dropping the pool discards the tasks not yet started and joins
/// all the threads.
///
/// # Examples
///
/// ```rust
/// use std::sync::mpsc;
///
/// use basis_sync::ThreadPool;
///
/// let pool = ThreadPool::new(2).unwrap();
/// let (tx, rx) = mpsc::channel();
/// pool.queue(move || tx.send(42).unwrap());
/// assert_eq!(rx.recv().unwrap(), 42);
/// ```
pub struct ThreadPool {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
    timer: Option<JoinHandle<()>>,
}

impl ThreadPool {
    /// Starts a pool of `threads` workers, plus a timer thread if `threads`
    /// is non-zero.
    ///
    /// # Errors
    ///
    /// Returns an error if a thread cannot be spawned. The threads already
    /// spawned are shut down.
    pub fn new(threads: usize) -> io::Result<Self> {
        let id = POOL_ID.fetch_add(1, Relaxed);
        let mut pool = ThreadPool {
            shared: Arc::new(Shared::default()),
            workers: Vec::with_capacity(threads),
            timer: None,
        };

        for index in 0..threads {
            let shared = pool.shared.clone();
            let worker = thread::Builder::new()
                .name(format!("basis-pool-{id}-{index}"))
                .spawn(move || shared.work())?;
            pool.workers.push(worker);
        }
        if threads > 0 {
            let shared = pool.shared.clone();
            let timer = thread::Builder::new()
                .name(format!("basis-pool-{id}-timer"))
                .spawn(move || shared.tick())?;
            pool.timer = Some(timer);
        }

        report!(debug, "thread pool #{id}: started {threads} worker(s)");
        Ok(pool)
    }

    /// The number of worker threads.
    pub fn threads(&self) -> usize {
        self.workers.len()
    }

    /// The number of tasks queued or delayed but not started yet.
    pub fn pending(&self) -> usize {
        let state = self.shared.state.lock();
        state.tasks.len() + state.delayed.len()
    }

    /// The number of tasks that panicked so far.
    pub fn panicked(&self) -> usize {
        self.shared.panicked.load(Relaxed)
    }

    /// Queues a task, or runs it right away if the pool has no workers.
    pub fn queue<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.workers.is_empty() {
            return self.shared.run(Box::new(f));
        }
        self.shared.state.lock().tasks.push_back(Box::new(f));
        self.shared.available.notify_one();
    }

    /// Queues a task to be run after `delay`.
    ///
    /// If the pool has no workers, this function sleeps for `delay` and runs
    /// the task inline.
    pub fn queue_delayed<F>(&self, f: F, delay: Duration)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.workers.is_empty() {
            thread::sleep(delay);
            return self.shared.run(Box::new(f));
        }

        let Some(deadline) = Instant::now().checked_add(delay) else {
            report!(warn, "thread pool: dropping a task delayed by {delay:?}");
            return;
        };
        let mut state = self.shared.state.lock();
        let seq = state.seq;
        state.seq += 1;
        state.delayed.insert((deadline, seq), Box::new(f));
        drop(state);
        self.shared.timer.notify_one();
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        let (tasks, delayed) = {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
            (mem::take(&mut state.tasks), mem::take(&mut state.delayed))
        };
        self.shared.available.notify_all();
        self.shared.timer.notify_all();

        let discarded = tasks.len() + delayed.len();
        drop((tasks, delayed));

        for handle in self.workers.drain(..).chain(self.timer.take()) {
            if handle.join().is_err() {
                report!(error, "thread pool: a thread exited abnormally");
            }
        }
        report!(debug, "thread pool: shut down, {discarded} task(s) discarded");
    }
}

impl core::fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ThreadPool")
            .field("threads", &self.threads())
            .field("pending", &self.pending())
            .field("panicked", &self.panicked())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use std::{
        sync::{
            Arc, Mutex,
            atomic::{AtomicBool, AtomicUsize, Ordering::*},
            mpsc,
        },
        thread,
        time::{Duration, Instant},
    };

    use super::ThreadPool;

    #[test]
    fn inline() {
        let pool = ThreadPool::new(0).unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let caller = thread::current().id();
        for i in 0..10 {
            let log = log.clone();
            pool.queue(move || {
                assert_eq!(thread::current().id(), caller);
                log.lock().unwrap().push(i);
            });
        }
        assert_eq!(*log.lock().unwrap(), (0..10).collect::<Vec<_>>());
        assert_eq!(pool.pending(), 0);

        let start = Instant::now();
        let log2 = log.clone();
        pool.queue_delayed(move || log2.lock().unwrap().push(10), Duration::from_millis(20));
        assert!(start.elapsed() >= Duration::from_millis(20));
        assert_eq!(log.lock().unwrap().last(), Some(&10));
    }

    #[test]
    fn exactly_once() {
        const TASKS: usize = 1000;
        let pool = ThreadPool::new(4).unwrap();
        assert_eq!(pool.threads(), 4);

        let runs: Arc<Vec<AtomicUsize>> = Arc::new((0..TASKS).map(|_| AtomicUsize::new(0)).collect());
        let done = Arc::new(AtomicUsize::new(0));
        for i in 0..TASKS {
            let (runs, done) = (runs.clone(), done.clone());
            pool.queue(move || {
                runs[i].fetch_add(1, Relaxed);
                done.fetch_add(1, Release);
            });
        }
        while done.load(Acquire) < TASKS {
            thread::yield_now();
        }
        drop(pool);
        assert!(runs.iter().all(|r| r.load(Relaxed) == 1));
    }

    #[test]
    fn delayed_order() {
        let pool = ThreadPool::new(2).unwrap();
        let (tx, rx) = mpsc::channel();
        let start = Instant::now();
        for (tag, ms) in [("late", 60), ("early", 10), ("middle", 30)] {
            let tx = tx.clone();
            pool.queue_delayed(move || tx.send((tag, start.elapsed())).unwrap(), Duration::from_millis(ms));
        }
        assert!(pool.pending() > 0);

        let received: Vec<_> = (0..3).map(|_| rx.recv().unwrap()).collect();
        let tags: Vec<_> = received.iter().map(|(tag, _)| *tag).collect();
        assert_eq!(tags, ["early", "middle", "late"]);
        assert!(received[0].1 >= Duration::from_millis(10));
        assert!(received[2].1 >= Duration::from_millis(60));
    }

    #[test]
    fn panics_are_contained() {
        let pool = ThreadPool::new(1).unwrap();
        let (tx, rx) = mpsc::channel();
        pool.queue(|| panic!("task failure"));
        pool.queue(move || tx.send(()).unwrap());
        rx.recv().unwrap();
        assert_eq!(pool.panicked(), 1);
    }

    #[test]
    fn drop_discards_pending() {
        let pool = ThreadPool::new(1).unwrap();
        let started = Arc::new(AtomicBool::new(false));
        let ran = Arc::new(AtomicUsize::new(0));

        let (s, r) = (started.clone(), ran.clone());
        pool.queue(move || {
            s.store(true, Release);
            thread::sleep(Duration::from_millis(50));
            r.fetch_add(1, Relaxed);
        });
        while !started.load(Acquire) {
            thread::yield_now();
        }
        for _ in 0..10 {
            let ran = ran.clone();
            pool.queue(move || _ = ran.fetch_add(1, Relaxed));
        }
        let ran2 = ran.clone();
        pool.queue_delayed(move || _ = ran2.fetch_add(1, Relaxed), Duration::from_secs(3600));
        assert_eq!(pool.pending(), 11);

        drop(pool);
        assert_eq!(ran.load(Relaxed), 1);
        assert_eq!(Arc::strong_count(&ran), 1);
    }
}
