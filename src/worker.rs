//! The poll loop: claim a job, run its handler, route the outcome.

use std::any::Any;
use std::future::Future;
use std::time::{Duration, Instant};

use serde_json::json;
use tokio::sync::watch;
use tokio::time::sleep;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::models::job::Job;
use crate::services::handlers::{self, Dispatch, HandlerError, HandlerOutput};
use crate::services::retry::{FailureDecision, RetryController};

/// Tries per outcome write before the tick gives up on a job.
const OUTCOME_WRITE_ATTEMPTS: u32 = 3;
const OUTCOME_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Result of one pass through the loop.
#[derive(Debug)]
pub enum Tick {
    /// Nothing eligible to claim.
    Idle,
    /// A job was claimed and its outcome recorded.
    Busy { job_id: Uuid, outcome: JobOutcome },
}

#[derive(Debug)]
pub enum JobOutcome {
    Completed(HandlerOutput),
    /// Unknown job type, completed as a no-op.
    Skipped,
    Failed(FailureDecision),
}

pub struct PollLoop {
    state: AppState,
    retry: RetryController,
}

impl PollLoop {
    pub fn new(state: AppState) -> Self {
        let retry = RetryController::new(state.jobs.clone(), state.settings.backoff);
        Self { state, retry }
    }

    pub fn worker_id(&self) -> &str {
        &self.state.settings.worker_id
    }

    /// Run until `shutdown` flips to true (or its sender is dropped). Shutdown
    /// is only observed between jobs; a claimed job always runs to an outcome.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(worker_id = %self.worker_id(), "Poll loop started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.tick().await {
                Ok(Tick::Busy { .. }) => {
                    self.record_queue_depth().await;
                    continue;
                }
                Ok(Tick::Idle) => {
                    tracing::trace!("No jobs available, sleeping");
                }
                Err(e) => {
                    tracing::error!(worker_id = %self.worker_id(), error = %e, "Poll loop error, will retry");
                }
            }

            tokio::select! {
                _ = sleep(self.state.settings.poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        tracing::info!(worker_id = %self.worker_id(), "Poll loop stopped");
    }

    /// Claim at most one job and carry it to an outcome.
    pub async fn tick(&self) -> Result<Tick, sqlx::Error> {
        let Some(job) = self.state.jobs.claim_next(self.worker_id()).await? else {
            return Ok(Tick::Idle);
        };

        metrics::counter!("jobs_claimed_total").increment(1);
        tracing::info!(
            job_id = %job.id,
            job_type = %job.job_type,
            attempts = job.attempts,
            worker_id = %self.worker_id(),
            "Job claimed"
        );

        let start = Instant::now();
        let retry = &self.retry;
        let claimed = &job;
        let outcome = match self.execute(&job).await {
            Ok(Dispatch::Handled(output)) => {
                let result = &output.to_result();
                with_write_retries(job.id, move || retry.on_success(claimed, result)).await?;
                tracing::info!(
                    job_id = %job.id,
                    job_type = %job.job_type,
                    assets = output.assets.len(),
                    warnings = output.warnings.len(),
                    entity_status = %output.entity_status,
                    "Job completed"
                );
                JobOutcome::Completed(output)
            }
            Ok(Dispatch::UnknownType) => {
                metrics::counter!("jobs_skipped_total").increment(1);
                tracing::warn!(
                    job_id = %job.id,
                    job_type = %job.job_type,
                    "Unknown job type, completing as no-op"
                );
                let result = &json!({
                    "skipped": true,
                    "reason": format!("unknown job type '{}'", job.job_type),
                });
                with_write_retries(job.id, move || retry.on_success(claimed, result)).await?;
                JobOutcome::Skipped
            }
            Err(error) => {
                let transient_network =
                    matches!(&error, HandlerError::Provider(e) if e.is_transient_network());
                tracing::warn!(
                    job_id = %job.id,
                    job_type = %job.job_type,
                    attempts = job.attempts,
                    retryable = error.is_retryable(),
                    transient_network = transient_network,
                    error = %error,
                    "Job handler failed"
                );
                let failure = &error;
                let decision =
                    with_write_retries(job.id, move || retry.on_failure(claimed, failure)).await?;
                if matches!(decision, FailureDecision::Failed { .. }) {
                    if let Err(e) = handlers::on_terminal_failure(&self.state, &job, &error).await {
                        tracing::error!(job_id = %job.id, error = %e, "Failed to mark owning entity failed");
                    }
                }
                JobOutcome::Failed(decision)
            }
        };

        metrics::histogram!("job_processing_seconds", "job_type" => job.job_type.clone())
            .record(start.elapsed().as_secs_f64());

        Ok(Tick::Busy {
            job_id: job.id,
            outcome,
        })
    }

    /// Run the handler on its own task so a panic surfaces as an ordinary
    /// handler failure instead of taking down the loop.
    async fn execute(&self, job: &Job) -> Result<Dispatch, HandlerError> {
        let state = self.state.clone();
        let owned = job.clone();
        let task = tokio::spawn(async move { handlers::dispatch(&state, &owned).await });

        match task.await {
            Ok(result) => result,
            Err(join_error) if join_error.is_panic() => Err(HandlerError::Unexpected(
                panic_message(join_error.into_panic()),
            )),
            Err(join_error) => Err(HandlerError::Unexpected(join_error.to_string())),
        }
    }

    async fn record_queue_depth(&self) {
        match self.state.jobs.queue_depth().await {
            Ok(depth) => metrics::gauge!("jobs_queue_depth").set(depth as f64),
            Err(e) => tracing::debug!(error = %e, "Failed to read queue depth"),
        }
    }
}

/// Retry a job outcome write a few times so a brief database hiccup does not
/// leave the job stuck in `running`.
async fn with_write_retries<T, F, Fut>(job_id: Uuid, mut write: F) -> Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, sqlx::Error>>,
{
    let mut attempt = 1;
    loop {
        match write().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < OUTCOME_WRITE_ATTEMPTS => {
                tracing::warn!(
                    job_id = %job_id,
                    attempt = attempt,
                    error = %e,
                    "Recording job outcome failed, retrying"
                );
                sleep(OUTCOME_RETRY_DELAY * attempt).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_string()
    }
}
