use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use tokio::runtime::Runtime;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::error::Result;

/// Trait for background tasks that run periodically.
#[async_trait::async_trait]
pub trait BackgroundTask: Send + Sync {
    /// Task name for logging.
    fn name(&self) -> &'static str;

    /// How often to run this task.
    fn interval(&self) -> Duration;

    /// Execute the task.
    async fn execute(&self) -> Result<()>;
}

/// Runs registered tasks on their intervals with graceful shutdown.
///
/// The scheduler owns a small runtime so the database can be opened and
/// closed from synchronous code; tasks observe the shutdown broadcast and
/// exit before `shutdown` returns.
pub struct Scheduler {
    runtime: Runtime,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Scheduler {
    pub fn new() -> Result<Self> {
        // Sync and commit work block their worker thread; keep enough
        // threads that the tickers never starve each other.
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(4)
            .enable_time()
            .thread_name("emberdb-bg")
            .build()?;
        let (shutdown_tx, _) = broadcast::channel(1);
        Ok(Self {
            runtime,
            tasks: Mutex::new(Vec::new()),
            shutdown_tx,
        })
    }

    pub fn handle(&self) -> tokio::runtime::Handle {
        self.runtime.handle().clone()
    }

    /// Subscribes to the shutdown broadcast, for tasks spawned outside the
    /// timer loop.
    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Registers a periodic background task.
    pub fn register<T: BackgroundTask + 'static>(&self, task: Arc<T>) -> &Self {
        let handle = self.spawn_timer_loop(task);
        self.tasks.lock().unwrap().push(handle);
        self
    }

    /// Spawns a one-off task tracked until shutdown.
    pub fn spawn<F>(&self, f: F)
    where
        F: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        let handle = self.runtime.spawn(async move {
            if let Err(e) = f.await {
                tracing::error!(error = %e, "One-off task failed");
            }
        });
        self.tasks.lock().unwrap().push(handle);
    }

    fn spawn_timer_loop<T: BackgroundTask + 'static>(&self, task: Arc<T>) -> JoinHandle<()> {
        let interval = task.interval();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        self.runtime.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick of a tokio interval fires immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = task.execute().await {
                            tracing::error!(
                                task = task.name(),
                                error = %e,
                                "Task execution failed"
                            );
                        }
                    }

                    _ = shutdown_rx.recv() => {
                        tracing::debug!(task = task.name(), "Task shutting down");
                        break;
                    }
                }
            }
        })
    }

    /// Graceful shutdown: signals every task and waits for them to exit.
    pub fn shutdown(self) {
        self.shutdown_tx.send(()).ok();
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().unwrap().drain(..).collect();
        for task in tasks {
            let _ = self.runtime.block_on(task);
        }
        self.runtime.shutdown_timeout(Duration::from_secs(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct TestTask {
        interval: Duration,
        counter: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl BackgroundTask for TestTask {
        fn name(&self) -> &'static str {
            "test-task"
        }

        fn interval(&self) -> Duration {
            self.interval
        }

        async fn execute(&self) -> Result<()> {
            self.counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_scheduler_runs_task() {
        let scheduler = Scheduler::new().expect("Failed to build scheduler");
        let counter = Arc::new(AtomicUsize::new(0));

        scheduler.register(Arc::new(TestTask {
            interval: Duration::from_millis(10),
            counter: Arc::clone(&counter),
        }));

        std::thread::sleep(Duration::from_millis(80));
        assert!(counter.load(Ordering::SeqCst) > 0);

        scheduler.shutdown();
    }

    #[test]
    fn test_scheduler_shutdown_stops_ticks() {
        let scheduler = Scheduler::new().expect("Failed to build scheduler");
        let counter = Arc::new(AtomicUsize::new(0));

        scheduler.register(Arc::new(TestTask {
            interval: Duration::from_millis(10),
            counter: Arc::clone(&counter),
        }));

        std::thread::sleep(Duration::from_millis(40));
        scheduler.shutdown();
        let after_shutdown = counter.load(Ordering::SeqCst);

        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(counter.load(Ordering::SeqCst), after_shutdown);
    }
}
