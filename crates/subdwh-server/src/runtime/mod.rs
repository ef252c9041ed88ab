//! In-process scheduling runtime
//!
//! Drives the two schedulers from cron triggers and hands their requests to a
//! [`Dispatcher`]. Shutdown stops the triggers first, then waits for runs that
//! are already executing.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::PipelineResult;
use crate::pipeline::{
    JobSpec, LoadJob, PackageDiscoveryScheduler, ProcessingJob, RunRequest, TickOutcome,
    UploadScheduler,
};

pub mod dispatch;
pub mod trigger;

pub use dispatch::{Dispatch, Dispatcher, JobRunner};
pub use trigger::{CronTrigger, DEFAULT_SCHEDULE};

/// Anything that can be ticked by a trigger
#[async_trait]
pub trait Scheduler: Send + Sync {
    async fn tick(&self) -> PipelineResult<TickOutcome>;
}

#[async_trait]
impl Scheduler for PackageDiscoveryScheduler {
    async fn tick(&self) -> PipelineResult<TickOutcome> {
        PackageDiscoveryScheduler::tick(self).await
    }
}

#[async_trait]
impl Scheduler for UploadScheduler {
    async fn tick(&self) -> PipelineResult<TickOutcome> {
        UploadScheduler::tick(self).await
    }
}

/// Routes requests to the processing and load jobs
pub struct Jobs {
    processing: Arc<ProcessingJob>,
    load: Arc<LoadJob>,
}

impl Jobs {
    pub fn new(processing: Arc<ProcessingJob>, load: Arc<LoadJob>) -> Self {
        Self { processing, load }
    }
}

#[async_trait]
impl JobRunner for Jobs {
    async fn run(&self, request: &RunRequest) -> PipelineResult<()> {
        match &request.job {
            JobSpec::Process { package_key } => {
                self.processing.run(package_key).await.map(|_| ())
            },
            JobSpec::Load { file_keys } => self.load.run(file_keys).await.map(|_| ()),
        }
    }
}

pub struct Runtime {
    dispatcher: Arc<Dispatcher>,
    schedules: Vec<(CronTrigger, Arc<dyn Scheduler>)>,
}

impl Runtime {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            dispatcher,
            schedules: Vec::new(),
        }
    }

    pub fn schedule(mut self, trigger: CronTrigger, scheduler: Arc<dyn Scheduler>) -> Self {
        self.schedules.push((trigger, scheduler));
        self
    }

    /// Run every schedule until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut loops = JoinSet::new();

        for (trigger, scheduler) in self.schedules {
            info!(
                schedule = %trigger.name(),
                cron = %trigger.expression(),
                "Schedule registered"
            );
            loops.spawn(trigger_loop(
                trigger,
                scheduler,
                self.dispatcher.clone(),
                shutdown.clone(),
            ));
        }

        while let Some(joined) = loops.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Schedule loop panicked");
            }
        }

        info!(in_flight = self.dispatcher.in_flight(), "Waiting for running jobs");
        self.dispatcher.drain().await;
        info!("Runtime stopped");
    }
}

/// Tick `scheduler` and dispatch whatever it requests.
pub async fn tick_and_dispatch(name: &str, scheduler: &dyn Scheduler, dispatcher: &Dispatcher) {
    match scheduler.tick().await {
        Ok(TickOutcome::Skipped { reason }) => info!(schedule = %name, %reason, "Tick skipped"),
        Ok(TickOutcome::Dispatched { requests }) => {
            for request in requests {
                let run_key = request.run_key.clone();
                if dispatcher.dispatch(request).await == Dispatch::AlreadyRunning {
                    info!(schedule = %name, %run_key, "Run still in flight; not dispatched");
                }
            }
        },
        Err(e) => warn!(schedule = %name, error = %e, "Tick failed"),
    }
}

async fn trigger_loop(
    trigger: CronTrigger,
    scheduler: Arc<dyn Scheduler>,
    dispatcher: Arc<Dispatcher>,
    shutdown: CancellationToken,
) {
    loop {
        let Some(delay) = trigger.delay_from(Utc::now()) else {
            warn!(schedule = %trigger.name(), "Schedule has no upcoming fire time");
            return;
        };

        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(delay) => {},
        }

        tick_and_dispatch(trigger.name(), scheduler.as_ref(), &dispatcher).await;
    }
}
