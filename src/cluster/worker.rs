//! Workers: one job-execution loop per pool slot
//!
//! A worker couples one [`JobRunner`] to the cluster's queue: pull a job,
//! execute it under the job timeout, hand the result back, report completion.
//! The [`JobRunner`] seam keeps the loop testable without real browsers.

use crate::browser::Browser;
use crate::cluster::Cluster;
use crate::job::{Job, JobKind, JobResult};
use crate::skipstate::SkipStateSet;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Executes one job against whatever drives the actual browsing
#[async_trait]
pub trait JobRunner: Send + Sync {
    /// Runs a job, sharing the cluster's skip-state partition for its id
    async fn run(&self, job: &Job, skip_states: Arc<Mutex<SkipStateSet>>) -> JobResult;

    /// Releases the runner's resources; called once when the worker stops
    async fn shutdown(&self) {}
}

/// The production runner: one owned [`Browser`] per worker
pub struct BrowserRunner {
    browser: tokio::sync::Mutex<Browser>,
    default_event_budget: u32,
}

impl BrowserRunner {
    pub fn new(browser: Browser, default_event_budget: u32) -> Self {
        Self {
            browser: tokio::sync::Mutex::new(browser),
            default_event_budget,
        }
    }
}

#[async_trait]
impl JobRunner for BrowserRunner {
    async fn run(&self, job: &Job, skip_states: Arc<Mutex<SkipStateSet>>) -> JobResult {
        let mut browser = self.browser.lock().await;

        browser.set_skip_states(skip_states);
        browser.begin_job(job.options.max_events.unwrap_or(self.default_event_budget));

        if !job.options.cookies.is_empty() {
            browser
                .install_cookies(&job.options.cookies, job.resource.url())
                .await;
        }

        match job.kind {
            // The registered callback gets the browser time; nothing to load
            JobKind::RunCallback => JobResult::new(job.clone()),

            JobKind::Explore => {
                if let Err(error) = browser.load(&job.resource).await {
                    return JobResult::failed(job.clone(), error.to_string());
                }
                match browser.explore_and_flush(job.options.max_depth).await {
                    Ok(pages) => JobResult::new(job.clone()).with_pages(pages),
                    Err(error) => JobResult::failed(job.clone(), error.to_string()),
                }
            }

            JobKind::TraceTaint => {
                if let Err(error) = browser.load(&job.resource).await {
                    return JobResult::failed(job.clone(), error.to_string());
                }
                let pages = browser.flush_snapshots();
                JobResult::new(job.clone()).with_pages(pages)
            }
        }
    }

    async fn shutdown(&self) {
        self.browser.lock().await.shutdown().await;
    }
}

/// The per-slot execution loop. Exits when `pop` reports shutdown.
pub(crate) async fn worker_loop(cluster: Arc<Cluster>, runner: Arc<dyn JobRunner>, slot: usize) {
    tracing::debug!("Worker {} started", slot);

    while let Some(job) = cluster.pop().await {
        tracing::debug!("Worker {} picked up job {}", slot, job.id);
        let skip_states = cluster.skip_states_for(&job.id);
        let started = Instant::now();

        // Never-ending jobs are exempt from the job timeout as well.
        let result = if job.never_ending {
            runner.run(&job, skip_states).await
        } else {
            match tokio::time::timeout(cluster.job_timeout(), runner.run(&job, skip_states)).await
            {
                Ok(result) => result,
                Err(_) => {
                    tracing::warn!("Job {} timed out on worker {}", job.id, slot);
                    cluster.note_timeout();
                    JobResult::failed(job.clone(), "job timed out")
                }
            }
        };

        cluster.handle_job_result(result);
        if let Err(error) = cluster.job_done(&job, started.elapsed()) {
            tracing::debug!("Completion for job {} not recorded: {}", job.id, error);
        }
    }

    runner.shutdown().await;
    tracing::debug!("Worker {} stopped", slot);
}
