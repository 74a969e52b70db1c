use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

use crate::db::store::JobStore;
use crate::models::job::Job;
use crate::services::handlers::HandlerError;

/// Exponential backoff with a ceiling, and the attempt budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub max_attempts: i32,
    pub base: Duration,
    pub cap: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base: Duration::from_secs(30),
            cap: Duration::from_secs(3600),
        }
    }
}

impl BackoffPolicy {
    /// Delay after the `attempts`-th failure: `base` after the first,
    /// doubling each time, never above `cap`.
    pub fn delay_for(&self, attempts: i32) -> Duration {
        let exponent = attempts.saturating_sub(1).clamp(0, 31) as u32;
        self.base
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.cap)
    }

    pub fn is_exhausted(&self, attempts: i32) -> bool {
        attempts >= self.max_attempts
    }
}

/// What the controller did with a failed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureDecision {
    Requeued {
        attempts: i32,
        delay: Duration,
        available_at: DateTime<Utc>,
    },
    Failed {
        attempts: i32,
    },
    /// The job was already done or failed; nothing changed.
    AlreadyTerminal,
}

/// How often `on_failure` re-reads a job that changed under it.
const CONFLICT_RETRIES: usize = 3;

/// Routes handler outcomes into job row transitions. Handlers never decide
/// retry policy; this is the only place that does.
pub struct RetryController {
    jobs: Arc<dyn JobStore>,
    policy: BackoffPolicy,
}

impl RetryController {
    pub fn new(jobs: Arc<dyn JobStore>, policy: BackoffPolicy) -> Self {
        Self { jobs, policy }
    }

    /// Record a failed attempt: requeue with backoff, or fail terminally when
    /// the error is not retryable or the attempt budget is spent. A call on a
    /// job that is already terminal changes nothing.
    ///
    /// The attempt count and the resulting transition are written together,
    /// so a database error here never leaves a counted attempt behind.
    pub async fn on_failure(
        &self,
        job: &Job,
        error: &HandlerError,
    ) -> Result<FailureDecision, sqlx::Error> {
        for _ in 0..CONFLICT_RETRIES {
            let current = match self.jobs.get_job(job.id).await? {
                Some(current) if !current.status.is_terminal() => current,
                _ => {
                    tracing::debug!(job_id = %job.id, "Failure reported for terminal job, ignoring");
                    return Ok(FailureDecision::AlreadyTerminal);
                }
            };

            let attempts = current.attempts + 1;
            let (decision, message) = self.decide(attempts, error);
            let requeue_at = match decision {
                FailureDecision::Requeued { available_at, .. } => Some(available_at),
                _ => None,
            };

            if self
                .jobs
                .record_failure(job.id, current.attempts, requeue_at, &message)
                .await?
            {
                self.report(job, &decision, &message);
                return Ok(decision);
            }
            tracing::debug!(job_id = %job.id, "Job changed while recording failure, re-reading");
        }

        tracing::warn!(job_id = %job.id, "Job kept changing while recording failure, giving up");
        Ok(FailureDecision::AlreadyTerminal)
    }

    fn decide(&self, attempts: i32, error: &HandlerError) -> (FailureDecision, String) {
        if !error.is_retryable() {
            return (FailureDecision::Failed { attempts }, error.to_string());
        }
        if self.policy.is_exhausted(attempts) {
            return (
                FailureDecision::Failed { attempts },
                format!("Failed after {attempts} attempts: {error}"),
            );
        }

        let delay = self.policy.delay_for(attempts);
        let available_at = Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::hours(1));
        (
            FailureDecision::Requeued {
                attempts,
                delay,
                available_at,
            },
            error.to_string(),
        )
    }

    fn report(&self, job: &Job, decision: &FailureDecision, message: &str) {
        match decision {
            FailureDecision::Requeued { attempts, delay, .. } => {
                metrics::counter!("jobs_requeued_total").increment(1);
                tracing::info!(
                    job_id = %job.id,
                    job_type = %job.job_type,
                    attempts = attempts,
                    delay_secs = delay.as_secs(),
                    "Job re-queued for retry"
                );
            }
            FailureDecision::Failed { attempts } => {
                metrics::counter!("jobs_failed_total").increment(1);
                tracing::warn!(
                    job_id = %job.id,
                    attempts = attempts,
                    error = message,
                    "Job failed terminally"
                );
            }
            FailureDecision::AlreadyTerminal => {}
        }
    }

    /// Mark a job done with its result. Attempts are untouched.
    pub async fn on_success(
        &self,
        job: &Job,
        result: &serde_json::Value,
    ) -> Result<bool, sqlx::Error> {
        let updated = self.jobs.mark_done(job.id, result).await?;
        if updated {
            metrics::counter!("jobs_completed_total").increment(1);
        } else {
            tracing::warn!(job_id = %job.id, "Job was no longer running when marked done");
        }
        Ok(updated)
    }
}
