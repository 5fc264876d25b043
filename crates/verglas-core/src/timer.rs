use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Handle for cancelling a scheduled task.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TimerToken(u64);

type TimerFn = Box<dyn FnMut() + Send>;

struct Entry {
    deadline: Instant,
    token: u64,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.token == other.token
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reversed: BinaryHeap is a max-heap, we want the earliest deadline.
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.token.cmp(&self.token))
    }
}

struct Task {
    callback: TimerFn,
    /// Re-arm period for heartbeat-style tasks.
    repeat: Option<Duration>,
}

struct TimerState {
    heap: BinaryHeap<Entry>,
    tasks: std::collections::HashMap<u64, Task>,
    destroyed: bool,
}

/// One background thread running deadline callbacks.
///
/// Callbacks run on the timer thread and must not block; connection
/// timeouts and heartbeats hand real work off to the thread pool.
pub struct Timer {
    state: Mutex<TimerState>,
    cond: Condvar,
    next_token: AtomicU64,
    thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl Timer {
    pub fn new() -> Arc<Self> {
        let timer = Arc::new(Timer {
            state: Mutex::new(TimerState {
                heap: BinaryHeap::new(),
                tasks: std::collections::HashMap::new(),
                destroyed: false,
            }),
            cond: Condvar::new(),
            next_token: AtomicU64::new(1),
            thread: Mutex::new(None),
        });
        let runner = timer.clone();
        let handle = std::thread::Builder::new()
            .name("verglas-timer".into())
            .spawn(move || runner.run())
            .expect("failed to spawn timer thread");
        *timer.thread.lock() = Some(handle);
        timer
    }

    /// Run `callback` once after `delay`.
    pub fn schedule(&self, delay: Duration, callback: impl FnOnce() + Send + 'static) -> TimerToken {
        let mut cb = Some(callback);
        self.schedule_entry(
            delay,
            Box::new(move || {
                if let Some(cb) = cb.take() {
                    cb();
                }
            }),
            None,
        )
    }

    /// Run `callback` every `period`, first firing one period from now.
    pub fn schedule_repeated(
        &self,
        period: Duration,
        callback: impl FnMut() + Send + 'static,
    ) -> TimerToken {
        self.schedule_entry(period, Box::new(callback), Some(period))
    }

    fn schedule_entry(&self, delay: Duration, callback: TimerFn, repeat: Option<Duration>) -> TimerToken {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock();
        if state.destroyed {
            return TimerToken(token);
        }
        state.tasks.insert(token, Task { callback, repeat });
        state.heap.push(Entry { deadline: Instant::now() + delay, token });
        self.cond.notify_one();
        TimerToken(token)
    }

    /// Cancel a pending task. Returns false when it already ran (or never
    /// existed); a task cannot be cancelled mid-callback.
    pub fn cancel(&self, token: TimerToken) -> bool {
        let mut state = self.state.lock();
        state.tasks.remove(&token.0).is_some()
    }

    /// Stop the thread; pending tasks are dropped without running.
    pub fn destroy(&self) {
        {
            let mut state = self.state.lock();
            if state.destroyed {
                return;
            }
            state.destroyed = true;
            state.tasks.clear();
            state.heap.clear();
        }
        self.cond.notify_all();
        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() != std::thread::current().id() {
                let _ = handle.join();
            }
        }
    }

    fn run(self: Arc<Self>) {
        let mut state = self.state.lock();
        loop {
            if state.destroyed {
                return;
            }
            let now = Instant::now();
            match state.heap.peek() {
                None => self.cond.wait(&mut state),
                Some(entry) if entry.deadline > now => {
                    let deadline = entry.deadline;
                    let _ = self.cond.wait_until(&mut state, deadline);
                }
                Some(_) => {
                    let entry = state.heap.pop().expect("peeked entry");
                    let Some(mut task) = state.tasks.remove(&entry.token) else {
                        continue; // Cancelled.
                    };
                    drop(state);
                    (task.callback)();
                    state = self.state.lock();
                    if let Some(period) = task.repeat {
                        if !state.destroyed {
                            state.tasks.insert(entry.token, task);
                            state.heap.push(Entry {
                                deadline: Instant::now() + period,
                                token: entry.token,
                            });
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn one_shot_fires_once() {
        let timer = Timer::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        timer.schedule(Duration::from_millis(10), move || {
            f.fetch_add(1, Ordering::SeqCst);
        });
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        timer.destroy();
    }

    #[test]
    fn cancel_prevents_firing() {
        let timer = Timer::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let token = timer.schedule(Duration::from_millis(50), move || {
            f.fetch_add(1, Ordering::SeqCst);
        });
        assert!(timer.cancel(token));
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        timer.destroy();
    }

    #[test]
    fn repeated_task_fires_repeatedly() {
        let timer = Timer::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let token = timer.schedule_repeated(Duration::from_millis(10), move || {
            f.fetch_add(1, Ordering::SeqCst);
        });
        std::thread::sleep(Duration::from_millis(100));
        timer.cancel(token);
        assert!(fired.load(Ordering::SeqCst) >= 2);
        timer.destroy();
    }

    #[test]
    fn ordering_is_by_deadline() {
        let timer = Timer::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let o1 = order.clone();
        let o2 = order.clone();
        timer.schedule(Duration::from_millis(60), move || o1.lock().push(2));
        timer.schedule(Duration::from_millis(20), move || o2.lock().push(1));
        std::thread::sleep(Duration::from_millis(150));
        assert_eq!(&*order.lock(), &[1, 2]);
        timer.destroy();
    }
}
