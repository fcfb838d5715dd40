use crossbeam::sync::WaitGroup;
use std::sync::Mutex;
use thiserror::Error;
use tracing::{error, info};

#[derive(Debug, Error)]
pub enum WorkerPoolError {
    #[error("Failed to build worker pool: {0}")]
    Build(#[from] rayon::ThreadPoolBuildError),

    #[error("Worker pool '{0}' has been shut down")]
    ShutDown(String),
}

struct Running {
    pool: rayon::ThreadPool,
    in_flight: WaitGroup,
}

/// Dedicated rayon pool of named threads executing submitted jobs in FIFO order.
///
/// Owned explicitly by whoever registers work on it; there is no shared
/// global pool. A panicking job is logged and does not kill its worker.
pub struct WorkerPool {
    name: String,
    running: Mutex<Option<Running>>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.name)
            .field("running", &self.is_running())
            .finish()
    }
}

impl WorkerPool {
    pub fn new(name: &str, threads: usize) -> Result<Self, WorkerPoolError> {
        let thread_prefix = name.to_string();
        let panic_pool = name.to_string();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads.max(1))
            .thread_name(move |index| format!("{}-{}", thread_prefix, index))
            .panic_handler(move |_| error!(pool = %panic_pool, "Worker job panicked"))
            .build()?;

        info!(pool = %name, threads = pool.current_num_threads(), "Worker pool started");
        Ok(Self {
            name: name.to_string(),
            running: Mutex::new(Some(Running {
                pool,
                in_flight: WaitGroup::new(),
            })),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_some()
    }

    /// Queue a job. Returns immediately; the job runs on a pool thread.
    pub fn execute<F>(&self, job: F) -> Result<(), WorkerPoolError>
    where
        F: FnOnce() + Send + 'static,
    {
        let guard = self.running.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        match guard.as_ref() {
            Some(running) => {
                let ticket = running.in_flight.clone();
                running.pool.spawn_fifo(move || {
                    let _ticket = ticket;
                    job();
                });
                Ok(())
            }
            None => Err(WorkerPoolError::ShutDown(self.name.clone())),
        }
    }

    /// Stop accepting jobs and wait for queued jobs to finish.
    /// Safe to call more than once.
    pub fn shutdown(&self) {
        let running = self
            .running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let Some(Running { pool, in_flight }) = running else {
            return;
        };

        // the last owner may be dropped from inside one of our own jobs
        if pool.current_thread_index().is_none() {
            in_flight.wait();
        }
        drop(pool);
        info!(pool = %self.name, "Worker pool stopped");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_jobs_run_on_named_pool_threads() {
        let pool = WorkerPool::new("cfg-test", 1).unwrap();
        let (tx, rx) = std::sync::mpsc::channel();

        pool.execute(move || {
            let name = std::thread::current().name().map(str::to_string);
            tx.send(name).unwrap();
        })
        .unwrap();

        let name = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(name.as_deref(), Some("cfg-test-0"));
    }

    #[test]
    fn test_shutdown_drains_queue_and_rejects_new_jobs() {
        let pool = WorkerPool::new("drain", 2).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..10 {
            let counter = Arc::clone(&counter);
            pool.execute(move || {
                std::thread::sleep(Duration::from_millis(5));
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        pool.shutdown();

        assert_eq!(counter.load(Ordering::SeqCst), 10);
        assert!(!pool.is_running());
        assert!(matches!(
            pool.execute(|| {}),
            Err(WorkerPoolError::ShutDown(_))
        ));
    }

    #[test]
    fn test_panicking_job_does_not_kill_worker() {
        let pool = WorkerPool::new("panics", 1).unwrap();
        let (tx, rx) = std::sync::mpsc::channel();

        pool.execute(|| panic!("job failure")).unwrap();
        pool.execute(move || tx.send(42).unwrap()).unwrap();

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 42);
        pool.shutdown();
    }
}
