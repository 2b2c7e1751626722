//! Worker pool for work that must not run on the network thread.
use std::io;

use futures::executor::ThreadPool;
use relaykit_core::config::TaskPoolConfig;

/// Runs closures off the calling thread.
///
/// `Inline` runs them in place; it is meant for tests and single-threaded tools.
pub enum TaskPool {
    Threads(ThreadPool),
    Inline,
}

impl TaskPool {
    pub fn new(config: &TaskPoolConfig) -> io::Result<Self> {
        ThreadPool::builder()
            .pool_size(config.worker_threads.max(1))
            .name_prefix("relaykit-task-")
            .create()
            .map(TaskPool::Threads)
    }

    pub const fn inline() -> Self {
        TaskPool::Inline
    }

    pub fn run<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        match self {
            TaskPool::Threads(pool) => pool.spawn_ok(async move { task() }),
            TaskPool::Inline => task(),
        }
    }
}
