//! Background executor for queued generation jobs.
//!
//! Safe to run as many processes at once: claims go through the store's
//! row locks (`FOR UPDATE SKIP LOCKED`) and every state transition is a
//! conditional update, so workers never coordinate in memory. Worker
//! identity is threaded through as a parameter rather than held in
//! process-wide state.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Duration as ChronoDuration;
use rand::Rng;
use serde_json::json;
use tokio::task;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::cache::{self, CacheError};
use crate::extract::ExtractError;
use crate::llm::{build_prompt, classify_error, FailureKind};
use crate::models::GenerationJob;
use crate::selection::GenerationMode;
use crate::state::AppState;

const ZOMBIE_BATCH_SIZE: i64 = 50;

/// Per-attempt retry delays; attempts past the table reuse the last entry.
const BACKOFF_TABLE_SECONDS: [i64; 3] = [60, 300, 900];
/// Upper bound on the random jitter added to every retry delay.
pub const MAX_JITTER_SECONDS: i64 = 30;

pub fn backoff_delay(attempts: i32) -> ChronoDuration {
    let index = (attempts.max(1) as usize - 1).min(BACKOFF_TABLE_SECONDS.len() - 1);
    ChronoDuration::seconds(BACKOFF_TABLE_SECONDS[index])
}

/// Backoff plus bounded jitter so simultaneous failures do not retry in
/// lockstep.
pub fn backoff_with_jitter(attempts: i32) -> ChronoDuration {
    let jitter = rand::thread_rng().gen_range(0..=MAX_JITTER_SECONDS);
    backoff_delay(attempts) + ChronoDuration::seconds(jitter)
}

pub struct Worker {
    state: Arc<AppState>,
    worker_id: String,
    poll_interval: Duration,
    runtime_budget: Duration,
}

impl Worker {
    pub fn new(state: Arc<AppState>, worker_id: impl Into<String>) -> Self {
        let poll_interval = Duration::from_secs(state.config.worker_poll_interval_seconds);
        let runtime_budget = Duration::from_secs(state.config.worker_runtime_budget_seconds);
        Self {
            state,
            worker_id: worker_id.into(),
            poll_interval,
            runtime_budget,
        }
    }

    pub async fn run(&self) {
        info!(worker_id = %self.worker_id, "worker started");
        loop {
            match self.run_once().await {
                Ok(0) => self.state.clock.sleep(self.poll_interval).await,
                Ok(_) => {}
                Err(err) => {
                    error!(error = %err, "worker pass failed");
                    self.state.clock.sleep(self.poll_interval).await;
                }
            }
        }
    }

    /// One bounded pass: sweep zombies, then claim and execute batches until
    /// the queue is drained or the runtime budget is spent. Returns the
    /// number of jobs executed.
    pub async fn run_once(&self) -> Result<usize, CacheError> {
        let started = Instant::now();
        self.sweep_zombies().await?;

        let mut executed = 0;
        while started.elapsed() < self.runtime_budget {
            let jobs = self.claim_batch().await?;
            if jobs.is_empty() {
                break;
            }
            for job in jobs {
                self.execute_job(job).await?;
                executed += 1;
            }
        }
        Ok(executed)
    }

    /// Expired `generating` rows are failed with a refund; this sweep is the
    /// only timeout authority for jobs nobody is waiting on.
    pub async fn sweep_zombies(&self) -> Result<usize, CacheError> {
        let state = self.state.clone();
        task::spawn_blocking(move || {
            let mut conn = state.blocking_db()?;
            let expired = cache::expired_jobs(&mut conn, ZOMBIE_BATCH_SIZE)?;
            let count = expired.len();
            for job in expired {
                warn!(job_id = %job.id, unit = job.unit_index, "failing expired generation job");
                cache::fail_generation(&mut conn, job.id, "generation timed out", true)?;
            }
            Ok(count)
        })
        .await
        .expect("zombie sweep task panicked")
    }

    async fn claim_batch(&self) -> Result<Vec<GenerationJob>, CacheError> {
        let state = self.state.clone();
        let worker_id = self.worker_id.clone();
        task::spawn_blocking(move || {
            let mut conn = state.blocking_db()?;
            cache::claim_batch(
                &mut conn,
                &worker_id,
                state.config.worker_batch_size,
                ChronoDuration::seconds(state.config.generation_lock_timeout_seconds),
            )
        })
        .await
        .expect("claim task panicked")
    }

    async fn execute_job(&self, job: GenerationJob) -> Result<(), CacheError> {
        let Some(mode) = GenerationMode::parse(&job.mode) else {
            warn!(job_id = %job.id, mode = %job.mode, "job has unknown mode");
            return self
                .finish_failed(job.id, &format!("unknown generation mode '{}'", job.mode))
                .await;
        };

        let text = match self
            .state
            .extractor
            .extract_text(&job.content_hash, job.unit_index)
            .await
        {
            Ok(text) => text,
            Err(err) => return self.handle_extract_error(&job, err).await,
        };

        let prompt = build_prompt(mode, &job.locale, job.unit_index, &text);
        match self.state.generator.generate(&prompt).await {
            Ok(content) => {
                info!(job_id = %job.id, unit = job.unit_index, "generation job completed");
                self.finish_ready(job.id, json!({ "content": content })).await
            }
            Err(err) => {
                let kind = classify_error(&err);
                self.handle_generation_failure(&job, kind, &err.to_string())
                    .await
            }
        }
    }

    async fn handle_extract_error(
        &self,
        job: &GenerationJob,
        err: ExtractError,
    ) -> Result<(), CacheError> {
        match err {
            ExtractError::UnitNotFound(_) => {
                warn!(job_id = %job.id, error = %err, "job input is unusable");
                self.finish_failed(job.id, &err.to_string()).await
            }
            ExtractError::Failed(_) => {
                self.handle_generation_failure(job, FailureKind::Transient, &err.to_string())
                    .await
            }
        }
    }

    async fn handle_generation_failure(
        &self,
        job: &GenerationJob,
        kind: FailureKind,
        message: &str,
    ) -> Result<(), CacheError> {
        let exhausted = job.attempts >= self.state.config.generation_max_attempts;
        if kind == FailureKind::Permanent || exhausted {
            error!(
                job_id = %job.id,
                attempts = job.attempts,
                error = %message,
                "generation job failed terminally"
            );
            return self.finish_failed(job.id, message).await;
        }

        let delay = backoff_with_jitter(job.attempts);
        warn!(
            job_id = %job.id,
            attempts = job.attempts,
            delay_seconds = delay.num_seconds(),
            error = %message,
            "generation job will retry"
        );
        let state = self.state.clone();
        let job_id = job.id;
        let message = message.to_string();
        task::spawn_blocking(move || {
            let mut conn = state.blocking_db()?;
            cache::retry_generation_after(&mut conn, job_id, delay, &message)
        })
        .await
        .expect("retry task panicked")
    }

    async fn finish_ready(
        &self,
        job_id: Uuid,
        payload: serde_json::Value,
    ) -> Result<(), CacheError> {
        let state = self.state.clone();
        task::spawn_blocking(move || {
            let mut conn = state.blocking_db()?;
            cache::complete_generation(&mut conn, job_id, payload)
        })
        .await
        .expect("completion task panicked")
    }

    async fn finish_failed(&self, job_id: Uuid, reason: &str) -> Result<(), CacheError> {
        let state = self.state.clone();
        let reason = reason.to_string();
        task::spawn_blocking(move || {
            let mut conn = state.blocking_db()?;
            cache::fail_generation(&mut conn, job_id, &reason, true)
        })
        .await
        .expect("failure task panicked")
    }
}
