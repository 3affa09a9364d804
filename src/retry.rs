// Retry and scheduling policy: pure functions, no queue or clock access
use crate::ledger::SubmissionStatus;
use chrono::{DateTime, FixedOffset, NaiveTime, TimeDelta, TimeZone, Utc};
use rand::Rng;
use std::time::Duration;

// Retry configuration
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(600),
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    // network error, timeout or non-200 status
    Transport,
    // registry rejected the batch
    Domain,
    // guest data cannot be rendered
    Data,
    // compression or encoding defect
    Packaging,
}

impl FailureKind {
    pub fn is_retryable(self) -> bool {
        matches!(self, FailureKind::Transport | FailureKind::Domain)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptResult {
    Acknowledged,
    Failed(FailureKind),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub status: SubmissionStatus,
    pub retry_after: Option<Duration>,
}

impl RetryPolicy {
    /// Decide what follows attempt number `attempt` (1-based within the current
    /// retry budget) given its result.
    pub fn next(&self, attempt: u32, result: AttemptResult) -> Transition {
        self.next_with_rng(attempt, result, &mut rand::thread_rng())
    }

    pub fn next_with_rng<R: Rng>(
        &self,
        attempt: u32,
        result: AttemptResult,
        rng: &mut R,
    ) -> Transition {
        match result {
            AttemptResult::Acknowledged => Transition {
                status: SubmissionStatus::Acknowledged,
                retry_after: None,
            },
            AttemptResult::Failed(kind) if kind.is_retryable() && attempt < self.max_attempts => {
                Transition {
                    status: SubmissionStatus::AwaitingRetry,
                    retry_after: Some(self.backoff(attempt, rng)),
                }
            }
            AttemptResult::Failed(_) => Transition {
                status: SubmissionStatus::Failed,
                retry_after: None,
            },
        }
    }

    // Exponential backoff with jitter, never above max_delay
    pub fn backoff<R: Rng>(&self, attempt: u32, rng: &mut R) -> Duration {
        let max_ms = self.max_delay.as_millis() as f64;
        let base_backoff_ms = (self.base_delay.as_millis() as f64
            * self.backoff_multiplier.powf(attempt as f64))
        .min(max_ms);

        let jitter = rng.gen::<f64>() * self.jitter_factor * base_backoff_ms;
        let backoff_ms = base_backoff_ms * (1.0 - self.jitter_factor / 2.0) + jitter;

        Duration::from_millis(backoff_ms.min(max_ms) as u64)
    }
}

#[derive(Debug, Clone)]
pub struct SchedulePolicy {
    pub submit_at: NaiveTime,
    pub grace: TimeDelta,
}

impl Default for SchedulePolicy {
    fn default() -> Self {
        Self {
            submit_at: NaiveTime::from_hms_opt(21, 0, 0).unwrap_or_default(),
            grace: TimeDelta::minutes(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmissionWindow {
    pub eta: DateTime<Utc>,
    // the evening-before slot had already passed
    pub deferred: bool,
}

impl SchedulePolicy {
    /// First submission slot: the evening before arrival, in the property's local
    /// time. Falls back to `now + grace` when that slot is not in the future.
    pub fn first_submission(
        &self,
        arrival: &DateTime<FixedOffset>,
        now: DateTime<Utc>,
    ) -> SubmissionWindow {
        let target = arrival
            .date_naive()
            .pred_opt()
            .map(|day| day.and_time(self.submit_at))
            .and_then(|naive| arrival.offset().from_local_datetime(&naive).single())
            .map(|local| local.with_timezone(&Utc));

        match target {
            Some(eta) if eta > now => SubmissionWindow {
                eta,
                deferred: false,
            },
            _ => SubmissionWindow {
                eta: now + self.grace,
                deferred: true,
            },
        }
    }
}

pub fn eta_after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    now + TimeDelta::milliseconds(delay.as_millis().min(i64::MAX as u128) as i64)
}
