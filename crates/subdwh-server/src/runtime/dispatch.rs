//! Run dispatch
//!
//! Executes [`RunRequest`]s on tokio tasks. A request whose run key is already
//! in flight is dropped, and a semaphore bounds how many runs execute at once.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, Instrument};

use crate::error::PipelineResult;
use crate::pipeline::RunRequest;

/// Executes the job a request describes
#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn run(&self, request: &RunRequest) -> PipelineResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Started,
    /// A run with the same key has not finished yet.
    AlreadyRunning,
}

type InFlight = Arc<Mutex<HashSet<String>>>;

fn lock(in_flight: &InFlight) -> MutexGuard<'_, HashSet<String>> {
    in_flight.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Releases a run key when the run ends, including by panic.
struct RunKeyGuard {
    in_flight: InFlight,
    run_key: String,
}

impl Drop for RunKeyGuard {
    fn drop(&mut self) {
        lock(&self.in_flight).remove(&self.run_key);
    }
}

pub struct Dispatcher {
    runner: Arc<dyn JobRunner>,
    in_flight: InFlight,
    permits: Arc<Semaphore>,
    tasks: tokio::sync::Mutex<JoinSet<()>>,
}

impl Dispatcher {
    pub fn new(runner: Arc<dyn JobRunner>, max_concurrent_runs: usize) -> Self {
        Self {
            runner,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            permits: Arc::new(Semaphore::new(max_concurrent_runs.max(1))),
            tasks: tokio::sync::Mutex::new(JoinSet::new()),
        }
    }

    pub fn in_flight(&self) -> usize {
        lock(&self.in_flight).len()
    }

    pub fn is_running(&self, run_key: &str) -> bool {
        lock(&self.in_flight).contains(run_key)
    }

    pub async fn dispatch(&self, request: RunRequest) -> Dispatch {
        if !lock(&self.in_flight).insert(request.run_key.clone()) {
            debug!(run_key = %request.run_key, "Run already in flight; skipping");
            return Dispatch::AlreadyRunning;
        }

        let guard = RunKeyGuard {
            in_flight: self.in_flight.clone(),
            run_key: request.run_key.clone(),
        };
        let runner = self.runner.clone();
        let permits = self.permits.clone();
        let span = tracing::info_span!("run", run_key = %request.run_key);

        let mut tasks = self.tasks.lock().await;
        // Reap finished runs so the set does not grow without bound.
        while tasks.try_join_next().is_some() {}

        tasks.spawn(
            async move {
                let _guard = guard;
                let Ok(_permit) = permits.acquire_owned().await else {
                    return;
                };

                info!("Run started");
                match runner.run(&request).await {
                    Ok(()) => info!("Run succeeded"),
                    Err(e) => error!(error = %e, retryable = e.is_retryable(), "Run failed"),
                }
            }
            .instrument(span),
        );

        Dispatch::Started
    }

    /// Wait for every dispatched run to finish.
    pub async fn drain(&self) {
        let mut tasks = std::mem::take(&mut *self.tasks.lock().await);
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Run task panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    struct GatedRunner {
        gate: Notify,
        running: AtomicUsize,
        max_running: AtomicUsize,
        completed: AtomicUsize,
    }

    impl GatedRunner {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                gate: Notify::new(),
                running: AtomicUsize::new(0),
                max_running: AtomicUsize::new(0),
                completed: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl JobRunner for GatedRunner {
        async fn run(&self, request: &RunRequest) -> PipelineResult<()> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_running.fetch_max(now, Ordering::SeqCst);
            self.gate.notified().await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            self.completed.fetch_add(1, Ordering::SeqCst);

            if request.run_key == "fails" {
                return Err(PipelineError::Warehouse("boom".into()));
            }
            Ok(())
        }
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_same_run_key_is_not_dispatched_twice() {
        let runner = GatedRunner::new();
        let dispatcher = Dispatcher::new(runner.clone(), 4);

        assert_eq!(
            dispatcher.dispatch(RunRequest::process("spkgs/a.spkg")).await,
            Dispatch::Started
        );
        assert_eq!(
            dispatcher.dispatch(RunRequest::process("spkgs/a.spkg")).await,
            Dispatch::AlreadyRunning
        );
        assert_eq!(
            dispatcher.dispatch(RunRequest::process("spkgs/b.spkg")).await,
            Dispatch::Started
        );
        assert_eq!(dispatcher.in_flight(), 2);

        settle().await;
        runner.gate.notify_waiters();
        dispatcher.drain().await;

        assert_eq!(runner.completed.load(Ordering::SeqCst), 2);
        assert_eq!(dispatcher.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_run_key_is_released_after_failure() {
        let runner = GatedRunner::new();
        let dispatcher = Dispatcher::new(runner.clone(), 1);

        dispatcher.dispatch(RunRequest::process("fails")).await;
        settle().await;
        runner.gate.notify_waiters();
        dispatcher.drain().await;

        assert!(!dispatcher.is_running("fails"));
        assert_eq!(
            dispatcher.dispatch(RunRequest::process("fails")).await,
            Dispatch::Started
        );
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let runner = GatedRunner::new();
        let dispatcher = Dispatcher::new(runner.clone(), 2);

        for key in ["a", "b", "c", "d"] {
            dispatcher.dispatch(RunRequest::process(key)).await;
        }

        for _ in 0..4 {
            settle().await;
            runner.gate.notify_waiters();
        }
        dispatcher.drain().await;

        assert_eq!(runner.completed.load(Ordering::SeqCst), 4);
        assert!(runner.max_running.load(Ordering::SeqCst) <= 2);
    }
}
