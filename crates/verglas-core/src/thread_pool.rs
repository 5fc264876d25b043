use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::Arc;
use std::time::Duration;

use mio::Token;
use parking_lot::{Condvar, Mutex};

use crate::selector::{EventHandler, Ready, Selector};
use crate::Properties;

/// Work handed to the pool outside of socket readiness.
pub(crate) type WorkItem = Box<dyn FnOnce(&Arc<ThreadPool>) + Send>;

/// Per-dispatch context handed to event handlers.
///
/// A handler that is about to run user code (a dispatch or an invocation
/// completion) calls [`ThreadPool::io_completed`] first, which promotes a
/// new leader so I/O keeps flowing while the user code runs.
pub(crate) struct ThreadPoolCurrent {
    pub(crate) io_completed: bool,
    leader: bool,
    token: Option<Token>,
}

struct HandlerEntry {
    handler: Arc<dyn EventHandler>,
    /// Operations the handler is registered for.
    registered: Ready,
    /// Set while serialized dispatch is in flight.
    disabled: bool,
    /// Readiness observed while disabled; replayed on enable, since the
    /// selector is edge-triggered and will not repeat it.
    pending: Ready,
}

enum Task {
    Io(Arc<dyn EventHandler>, Ready, Token),
    Work(WorkItem),
}

struct PoolState {
    destroyed: bool,
    handlers: HashMap<Token, HandlerEntry>,
    ready: VecDeque<(Token, Ready)>,
    work: VecDeque<WorkItem>,
    in_use: i64,
    in_use_io: i64,
    promote: bool,
    thread_count: usize,
    next_thread_id: u32,
    handles: Vec<std::thread::JoinHandle<()>>,
}

/// Reactor thread pool: a fixed minimum of threads sharing one selector
/// under the leader/follower discipline.
///
/// Exactly one thread (the leader) blocks in the selector; the others wait
/// on a condition variable. A thread that picks up ready work hands the
/// leader role on before running anything that might block, so the
/// selector is never left unattended while runnable threads exist. The
/// pool grows up to `SizeMax` when every thread is busy in user code and
/// shrinks back when surplus threads sit idle past `ThreadIdleTime`.
pub(crate) struct ThreadPool {
    state: Mutex<PoolState>,
    cond: Condvar,
    selector: Selector,
    prefix: String,
    size: usize,
    size_max: usize,
    size_warn: i64,
    size_io: i64,
    serialize: bool,
    thread_idle_time: Duration,
    stack_size: usize,
}

impl ThreadPool {
    /// Build a pool from `prefix.*` properties, mirroring the documented
    /// defaults, and spawn the minimum threads.
    pub fn new(properties: &Properties, prefix: &str) -> io::Result<Arc<Self>> {
        let cpus = std::thread::available_parallelism().map_or(1, |n| n.get());

        let mut size = properties.get_int_with_default(&format!("{prefix}.Size"), 1);
        if size < 1 {
            tracing::warn!(pool = prefix, "Size < 1; adjusted to 1");
            size = 1;
        }
        let mut size_max =
            properties.get_int_with_default(&format!("{prefix}.SizeMax"), size);
        if size_max == -1 {
            size_max = cpus as i64;
        }
        if size_max < size {
            tracing::warn!(pool = prefix, "SizeMax < Size; adjusted to Size");
            size_max = size;
        }
        let mut size_warn = properties.get_int_with_default(&format!("{prefix}.SizeWarn"), 0);
        if size_warn != 0 && size_warn < size {
            tracing::warn!(pool = prefix, "SizeWarn < Size; adjusted to Size");
            size_warn = size;
        } else if size_warn > size_max {
            tracing::warn!(pool = prefix, "SizeWarn > SizeMax; adjusted to SizeMax");
            size_warn = size_max;
        }
        let mut idle = properties.get_int_with_default(&format!("{prefix}.ThreadIdleTime"), 60);
        if idle < 0 {
            tracing::warn!(pool = prefix, "ThreadIdleTime < 0; adjusted to 0");
            idle = 0;
        }
        let mut stack_size =
            properties.get_int_with_default(&format!("{prefix}.StackSize"), default_stack_size());
        if stack_size < 0 {
            tracing::warn!(pool = prefix, "StackSize < 0; using the OS default");
            stack_size = 0;
        }
        let serialize = properties.get_bool(&format!("{prefix}.Serialize"));

        let pool = Arc::new(ThreadPool {
            state: Mutex::new(PoolState {
                destroyed: false,
                handlers: HashMap::new(),
                ready: VecDeque::new(),
                work: VecDeque::new(),
                in_use: 0,
                in_use_io: 0,
                promote: true,
                thread_count: 0,
                next_thread_id: 0,
                handles: Vec::new(),
            }),
            cond: Condvar::new(),
            selector: Selector::new()?,
            prefix: prefix.to_string(),
            size: size as usize,
            size_max: size_max as usize,
            size_warn,
            size_io: size_max.min(cpus as i64),
            serialize,
            thread_idle_time: Duration::from_secs(idle as u64),
            stack_size: stack_size as usize,
        });

        tracing::debug!(
            pool = prefix,
            size,
            size_max,
            size_warn,
            "creating thread pool"
        );

        {
            let mut st = pool.state.lock();
            for _ in 0..pool.size {
                Self::spawn_thread(&pool, &mut st)?;
            }
        }
        Ok(pool)
    }

    fn spawn_thread(pool: &Arc<ThreadPool>, st: &mut PoolState) -> io::Result<()> {
        let id = st.next_thread_id;
        st.next_thread_id += 1;
        let me = pool.clone();
        let mut builder =
            std::thread::Builder::new().name(format!("{}-{id}", pool.prefix));
        if pool.stack_size > 0 {
            builder = builder.stack_size(pool.stack_size);
        }
        let handle = builder.spawn(move || me.run())?;
        st.handles.push(handle);
        st.thread_count += 1;
        Ok(())
    }

    // --- handler registry ---------------------------------------------

    /// Register a handler for `interest`; returns its token.
    pub fn initialize(
        self: &Arc<Self>,
        handler: Arc<dyn EventHandler>,
        interest: Ready,
    ) -> io::Result<Token> {
        let token = self.selector.allocate_token();
        let mio_interest = interest
            .to_interest()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty interest"))?;
        handler.register_source(self.selector.registry(), token, mio_interest)?;
        let mut st = self.state.lock();
        st.handlers.insert(
            token,
            HandlerEntry {
                handler,
                registered: interest,
                disabled: false,
                pending: Ready::empty(),
            },
        );
        Ok(token)
    }

    /// Adjust a handler's registered operations.
    ///
    /// Callable while the handler's own lock is held: the selector
    /// re-registration runs later on a pool thread, because it has to
    /// take that same lock to reach the socket.
    pub fn update(&self, token: Token, remove: Ready, add: Ready) {
        let mut st = self.state.lock();
        let Some(entry) = st.handlers.get_mut(&token) else {
            return;
        };
        let updated = (entry.registered - remove) | add;
        if updated == entry.registered {
            return;
        }
        entry.registered = updated;
        st.work.push_back(Box::new(move |pool| {
            let (handler, interest) = {
                let st = pool.state.lock();
                let Some(entry) = st.handlers.get(&token) else {
                    return; // Finished before the update could land.
                };
                (entry.handler.clone(), entry.registered)
            };
            if let Some(interest) = interest.to_interest() {
                if let Err(e) =
                    handler.reregister_source(pool.selector.registry(), token, interest)
                {
                    tracing::warn!(pool = %pool.prefix, error = %e, "reregister failed");
                }
            }
        }));
        drop(st);
        self.selector.wake();
        self.cond.notify_one();
    }

    /// Remove a handler; deregistration and its `finished` callback run
    /// on a pool thread (same locking reason as [`ThreadPool::update`]).
    pub fn finish(self: &Arc<Self>, token: Token) {
        let mut st = self.state.lock();
        let Some(entry) = st.handlers.remove(&token) else {
            return;
        };
        let handler = entry.handler;
        st.work.push_back(Box::new(move |pool| {
            if let Err(e) = handler.deregister_source(pool.selector.registry()) {
                tracing::debug!(pool = %pool.prefix, error = %e, "deregister failed");
            }
            handler.clone().finished(pool);
        }));
        drop(st);
        self.selector.wake();
        self.cond.notify_one();
    }

    /// Queue a work item for execution on a pool thread.
    pub fn dispatch(self: &Arc<Self>, work: WorkItem) {
        {
            let mut st = self.state.lock();
            if st.destroyed {
                tracing::debug!(pool = %self.prefix, "dispatch on destroyed pool dropped");
                return;
            }
            st.work.push_back(work);
        }
        self.selector.wake();
        self.cond.notify_one();
    }

    /// Replay readiness for a handler, as if the selector had reported it.
    pub fn ready(&self, token: Token, ready: Ready) {
        let mut st = self.state.lock();
        if st.handlers.contains_key(&token) {
            st.ready.push_back((token, ready));
        }
        drop(st);
        self.cond.notify_one();
        self.selector.wake();
    }

    // --- dispatch bookkeeping -----------------------------------------

    /// Called by a handler before it runs user code: gives up the leader
    /// role, applies serialization, and grows the pool when saturated.
    pub fn io_completed(self: &Arc<Self>, current: &mut ThreadPoolCurrent) {
        let mut st = self.state.lock();
        current.io_completed = true;

        if self.size_max > 1 {
            st.in_use_io -= 1;

            if !st.destroyed && self.serialize {
                if let Some(token) = current.token {
                    if let Some(entry) = st.handlers.get_mut(&token) {
                        entry.disabled = true;
                    }
                }
            }

            if current.leader {
                self.promote_follower(&mut st, current);
            } else if st.promote && (!st.ready.is_empty() || !st.work.is_empty() || st.in_use_io == 0)
            {
                self.cond.notify_one();
            }

            st.in_use += 1;
            if st.in_use == self.size_warn {
                tracing::warn!(
                    pool = %self.prefix,
                    size = self.size,
                    size_max = self.size_max,
                    size_warn = self.size_warn,
                    "thread pool is running low on threads"
                );
            }

            if !st.destroyed
                && st.in_use < self.size_max as i64
                && st.in_use == st.thread_count as i64
            {
                tracing::debug!(pool = %self.prefix, size = st.thread_count + 1, "growing");
                if let Err(e) = Self::spawn_thread(self, &mut st) {
                    tracing::warn!(pool = %self.prefix, error = %e, "cannot spawn thread");
                }
            }
        }
    }

    pub fn serialize(&self) -> bool {
        self.serialize
    }

    /// Stop accepting work and wake every thread; threads drain the work
    /// queue and exit.
    pub fn destroy(&self) {
        {
            let mut st = self.state.lock();
            if st.destroyed {
                return;
            }
            st.destroyed = true;
        }
        self.selector.wake();
        self.cond.notify_all();
    }

    /// Join every thread the pool ever spawned. Must run after `destroy`,
    /// from outside the pool.
    pub fn join_with_all_threads(&self) {
        loop {
            let handle = {
                let mut st = self.state.lock();
                st.handles.pop()
            };
            match handle {
                Some(handle) => {
                    let _ = handle.join();
                }
                None => return,
            }
        }
    }

    // --- the leader/follower loop -------------------------------------

    fn run(self: Arc<Self>) {
        let mut current = ThreadPoolCurrent { io_completed: false, leader: false, token: None };
        let mut task: Option<Task> = None;
        let mut select = false;
        let mut gathered: Vec<(Token, Ready)> = Vec::new();

        loop {
            let ran_task = task.is_some();
            if let Some(t) = task.take() {
                match t {
                    Task::Io(handler, ready, token) => {
                        current.io_completed = false;
                        current.token = Some(token);
                        handler.message(&self, ready, &mut current);
                    }
                    Task::Work(item) => {
                        // Work items always count as user code.
                        current.io_completed = false;
                        current.token = None;
                        self.io_completed(&mut current);
                        item(&self);
                    }
                }
            } else if select {
                gathered.clear();
                if let Err(e) = self.selector.select(None, &mut gathered) {
                    tracing::warn!(pool = %self.prefix, error = %e, "selector failure");
                }
            }

            let mut st = self.state.lock();

            if ran_task {
                if self.size_max > 1 {
                    if !current.io_completed {
                        // The handler never reached user code; it still
                        // counts against the I/O thread budget until now.
                        st.in_use_io -= 1;
                    } else {
                        if self.serialize {
                            if let Some(token) = current.token {
                                self.enable_handler(&mut st, token);
                            }
                        }
                        st.in_use -= 1;
                    }
                }
                if !current.leader && self.follower_wait(&mut st, &mut current) {
                    return;
                }
            } else if select {
                for (token, ready) in gathered.drain(..) {
                    st.ready.push_back((token, ready));
                }
                select = false;
            } else if !current.leader && self.follower_wait(&mut st, &mut current) {
                return;
            }

            if st.destroyed && st.work.is_empty() {
                // Drain is complete for this thread; pass the torch so the
                // remaining threads notice too.
                st.promote = true;
                st.thread_count -= 1;
                self.cond.notify_one();
                self.selector.wake();
                return;
            }

            task = self.next_task(&mut st);
            match &task {
                None => {
                    if st.in_use_io > 0 {
                        // Threads are still mid-I/O; let one of them (or a
                        // follower) take over the selector later.
                        self.promote_follower(&mut st, &mut current);
                    } else {
                        st.ready.clear();
                        select = true;
                        current.leader = true;
                    }
                }
                Some(_) => {
                    if self.size_max > 1 {
                        st.in_use_io += 1;
                        if (!st.ready.is_empty() || !st.work.is_empty())
                            && st.in_use_io < self.size_io
                        {
                            self.promote_follower(&mut st, &mut current);
                        }
                    }
                }
            }
        }
    }

    fn next_task(&self, st: &mut PoolState) -> Option<Task> {
        if let Some(item) = st.work.pop_front() {
            return Some(Task::Work(item));
        }
        while let Some((token, ready)) = st.ready.pop_front() {
            let Some(entry) = st.handlers.get_mut(&token) else {
                continue; // Unregistered since the event was gathered.
            };
            if entry.disabled {
                entry.pending |= ready;
                continue;
            }
            let effective = ready & entry.registered;
            if effective.is_empty() {
                continue;
            }
            return Some(Task::Io(entry.handler.clone(), effective, token));
        }
        None
    }

    fn enable_handler(&self, st: &mut PoolState, token: Token) {
        if let Some(entry) = st.handlers.get_mut(&token) {
            entry.disabled = false;
            if !entry.pending.is_empty() {
                // The edge fired while we were serialized; replay it.
                let pending = std::mem::take(&mut entry.pending);
                st.ready.push_back((token, pending));
            }
        }
    }

    fn promote_follower(&self, st: &mut PoolState, current: &mut ThreadPoolCurrent) {
        if !current.leader {
            return;
        }
        st.promote = true;
        if st.in_use_io < self.size_io
            && (!st.ready.is_empty() || !st.work.is_empty() || st.in_use_io == 0)
        {
            self.cond.notify_one();
        }
        current.leader = false;
    }

    /// Wait to be promoted to leader. Returns true when the thread should
    /// exit instead (idle shrink).
    fn follower_wait(
        &self,
        st: &mut parking_lot::MutexGuard<'_, PoolState>,
        current: &mut ThreadPoolCurrent,
    ) -> bool {
        current.token = None;
        loop {
            if st.destroyed {
                // Let the destroyed check in the main loop handle exit.
                current.leader = true;
                st.promote = false;
                return false;
            }
            let promotable = st.promote
                && st.in_use_io < self.size_io
                && (!st.ready.is_empty() || !st.work.is_empty() || st.in_use_io == 0);
            if promotable {
                break;
            }
            if self.thread_idle_time > Duration::ZERO {
                let timed_out = self
                    .cond
                    .wait_for(st, self.thread_idle_time)
                    .timed_out();
                if timed_out && !st.destroyed && st.thread_count > self.size {
                    tracing::debug!(
                        pool = %self.prefix,
                        size = st.thread_count - 1,
                        "shrinking"
                    );
                    st.thread_count -= 1;
                    return true;
                }
            } else {
                self.cond.wait(st);
            }
        }
        current.leader = true;
        st.promote = false;
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn pool(pairs: &[(&str, &str)]) -> Arc<ThreadPool> {
        let props = Properties::from_pairs(pairs.iter().copied());
        ThreadPool::new(&props, "ThreadPool").unwrap()
    }

    #[test]
    fn work_items_run() {
        let pool = pool(&[("ThreadPool.Size", "1")]);
        let ran = Arc::new(AtomicUsize::new(0));
        for _ in 0..4 {
            let ran = ran.clone();
            pool.dispatch(Box::new(move |_| {
                ran.fetch_add(1, Ordering::SeqCst);
            }));
        }
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while ran.load(Ordering::SeqCst) < 4 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(ran.load(Ordering::SeqCst), 4);
        pool.destroy();
        pool.join_with_all_threads();
    }

    #[test]
    fn work_items_run_concurrently_when_pool_allows() {
        let pool = pool(&[("ThreadPool.Size", "3")]);
        let barrier = Arc::new(std::sync::Barrier::new(3));
        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let barrier = barrier.clone();
            let done = done.clone();
            pool.dispatch(Box::new(move |_| {
                // Deadlocks unless three pool threads run simultaneously.
                barrier.wait();
                done.fetch_add(1, Ordering::SeqCst);
            }));
        }
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while done.load(Ordering::SeqCst) < 3 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(done.load(Ordering::SeqCst), 3);
        pool.destroy();
        pool.join_with_all_threads();
    }

    #[test]
    fn destroy_then_join_terminates() {
        let pool = pool(&[("ThreadPool.Size", "2"), ("ThreadPool.SizeMax", "4")]);
        pool.destroy();
        pool.join_with_all_threads();
    }

    #[test]
    fn dispatch_after_destroy_is_dropped() {
        let pool = pool(&[("ThreadPool.Size", "1")]);
        pool.destroy();
        pool.join_with_all_threads();
        let ran = Arc::new(AtomicUsize::new(0));
        let r = ran.clone();
        pool.dispatch(Box::new(move |_| {
            r.fetch_add(1, Ordering::SeqCst);
        }));
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }
}

fn default_stack_size() -> i64 {
    if cfg!(target_os = "macos") {
        // Deep class graphs need more than the platform default.
        1024 * 1024
    } else {
        0
    }
}
