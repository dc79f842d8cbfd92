//! A fixed-size worker pool for I/O sub-tasks.
//!
//! Callers submit a batch of tasks with [`TaskPool::execute`] and block until every task in the batch has run.
//! Results come back in submission order and are aggregated with [`wait_all`].
//! Tasks are not preemptible, so cancellation is cooperative: a [`CancellationToken`] is checked between batches, never within one.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use rayon::prelude::*;
use thiserror::Error;

/// A task pool error.
#[derive(Debug, Error)]
pub enum TaskPoolError {
    /// The worker threads could not be created.
    #[error("failed to build task pool: {0}")]
    Build(#[from] rayon::ThreadPoolBuildError),
}

/// A shared fixed-size pool of worker threads.
///
/// Cloning a [`TaskPool`] shares its worker threads.
#[derive(Debug, Clone)]
pub struct TaskPool {
    pool: Arc<rayon::ThreadPool>,
}

impl TaskPool {
    /// Create a pool with `num_threads` worker threads.
    ///
    /// # Errors
    /// Returns [`TaskPoolError::Build`] if the worker threads cannot be spawned.
    pub fn new(num_threads: usize) -> Result<Self, TaskPoolError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads.max(1))
            .thread_name(|index| format!("tilestore-io-{index}"))
            .build()?;
        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    /// Return the number of worker threads.
    #[must_use]
    pub fn num_threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Run every task in `tasks` on the pool and return their results in submission order.
    ///
    /// Blocks until all tasks have completed.
    /// Tasks may borrow from the caller.
    /// A call from inside a pool worker runs the batch on the same pool without deadlocking.
    pub fn execute<T, F>(&self, tasks: Vec<F>) -> Vec<T>
    where
        T: Send,
        F: FnOnce() -> T + Send,
    {
        match tasks.len() {
            0 => Vec::new(),
            1 => tasks.into_iter().map(|task| task()).collect(),
            _ => self
                .pool
                .install(|| tasks.into_par_iter().map(|task| task()).collect()),
        }
    }
}

/// Aggregate the results of a batch of tasks.
///
/// Returns the successful values in submission order, or the first error in submission order.
///
/// # Errors
/// Returns the first error in `results`.
pub fn wait_all<T, E>(results: impl IntoIterator<Item = Result<T, E>>) -> Result<Vec<T>, E> {
    results.into_iter().collect()
}

/// A cooperative cancellation flag.
///
/// Clones share the same flag.
/// Long running operations check [`CancellationToken::is_cancelled`] between logical steps; started I/O always runs to completion or failure.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    /// Create a new token that is not cancelled.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Returns true if cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{atomic::AtomicUsize, Barrier};

    use super::*;

    #[test]
    fn task_pool_execute_order() {
        let pool = TaskPool::new(4).unwrap();
        assert_eq!(pool.num_threads(), 4);
        let tasks: Vec<_> = (0..32).map(|i| move || i * 2).collect();
        let results = pool.execute(tasks);
        assert_eq!(results, (0..32).map(|i| i * 2).collect::<Vec<_>>());
        assert!(pool.execute(Vec::<fn() -> u8>::new()).is_empty());
    }

    #[test]
    fn task_pool_runs_concurrently() {
        let pool = TaskPool::new(3).unwrap();
        let barrier = Barrier::new(3);
        let ran = AtomicUsize::new(0);
        // Deadlocks unless all three tasks run at once
        let tasks: Vec<_> = (0..3)
            .map(|_| {
                || {
                    barrier.wait();
                    ran.fetch_add(1, Ordering::SeqCst);
                }
            })
            .collect();
        pool.execute(tasks);
        assert_eq!(ran.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn task_pool_nested() {
        let pool = TaskPool::new(1).unwrap();
        let inner = pool.clone();
        let tasks: Vec<_> = [1, 3]
            .into_iter()
            .map(|first| {
                let inner = &inner;
                move || inner.execute((first..first + 2).map(|i| move || i).collect())
            })
            .collect();
        let results = pool.execute(tasks);
        assert_eq!(results, vec![vec![1, 2], vec![3, 4]]);
    }

    #[test]
    fn wait_all_first_error() {
        let results: Vec<Result<u8, &str>> = vec![Ok(1), Err("first"), Ok(3), Err("second")];
        assert_eq!(wait_all(results), Err("first"));
        let results: Vec<Result<u8, &str>> = vec![Ok(1), Ok(2)];
        assert_eq!(wait_all(results), Ok(vec![1, 2]));
    }

    #[test]
    fn cancellation_token() {
        let token = CancellationToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }
}
