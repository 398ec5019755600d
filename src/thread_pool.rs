//! Process-wide worker pool
//!
//! Both parties parallelize across bundle indices (and the sender across OPRF
//! batches) on a single shared rayon pool. The pool is built lazily, its size
//! is settable at runtime, and it is reference-counted by its users: a
//! [`ThreadPoolMgr`] handle pins the pool, and dropping the last handle
//! releases the threads. Code that merely *uses* the pool goes through
//! [`pool`], which revives it on demand.

use std::sync::Arc;

use parking_lot::Mutex;
use rayon::ThreadPool;

struct PoolState {
    pool: Option<Arc<ThreadPool>>,
    /// Requested size; 0 means "hardware concurrency" (rayon's default).
    thread_count: usize,
    users: usize,
}

static POOL_STATE: Mutex<PoolState> =
    Mutex::new(PoolState { pool: None, thread_count: 0, users: 0 });

fn build_pool(thread_count: usize) -> Arc<ThreadPool> {
    Arc::new(
        rayon::ThreadPoolBuilder::new()
            .num_threads(thread_count)
            .thread_name(|i| format!("tinypsi-worker-{i}"))
            .build()
            .expect("worker pool construction cannot fail with these settings"),
    )
}

/// The shared pool, building it first if necessary.
pub fn pool() -> Arc<ThreadPool> {
    let mut state = POOL_STATE.lock();
    if state.pool.is_none() {
        state.pool = Some(build_pool(state.thread_count));
    }
    state.pool.as_ref().expect("just built").clone()
}

/// Set the pool size for subsequent work; 0 restores the hardware default.
/// An existing pool is rebuilt immediately.
pub fn set_thread_count(thread_count: usize) {
    let mut state = POOL_STATE.lock();
    state.thread_count = thread_count;
    if state.pool.is_some() {
        state.pool = Some(build_pool(thread_count));
    }
}

/// The currently effective pool size.
pub fn thread_count() -> usize {
    let state = POOL_STATE.lock();
    match (&state.pool, state.thread_count) {
        (Some(pool), _) => pool.current_num_threads(),
        (None, 0) => std::thread::available_parallelism().map(usize::from).unwrap_or(1),
        (None, n) => n,
    }
}

/// RAII handle that keeps the shared pool alive. Sender and receiver objects
/// hold one; dropping the last handle tears the pool down so the process can
/// exit cleanly without idle workers.
pub struct ThreadPoolMgr(());

impl ThreadPoolMgr {
    /// Register a user of the shared pool.
    pub fn new() -> Self {
        let mut state = POOL_STATE.lock();
        state.users += 1;
        if state.pool.is_none() {
            state.pool = Some(build_pool(state.thread_count));
        }
        Self(())
    }
}

impl Default for ThreadPoolMgr {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ThreadPoolMgr {
    fn drop(&mut self) {
        let mut state = POOL_STATE.lock();
        state.users = state.users.saturating_sub(1);
        if state.users == 0 {
            state.pool = None;
        }
    }
}
