// Submission ledger: append-only record of every call made for a check-in
use crate::checkin::CheckInId;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionStatus {
    Pending,
    Scheduled,
    InFlight,
    Acknowledged,
    AwaitingRetry,
    Failed,
}

impl SubmissionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, SubmissionStatus::Acknowledged | SubmissionStatus::Failed)
    }
}

impl fmt::Display for SubmissionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SubmissionStatus::Pending => "pending",
            SubmissionStatus::Scheduled => "scheduled",
            SubmissionStatus::InFlight => "in_flight",
            SubmissionStatus::Acknowledged => "acknowledged",
            SubmissionStatus::AwaitingRetry => "awaiting_retry",
            SubmissionStatus::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// What started an attempt. Stored on every ledger row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    Scheduled,
    Manual,
    Reconciliation,
}

impl Trigger {
    // queued and reconciliation runs count as automatic submissions
    pub fn is_automatic(self) -> bool {
        !matches!(self, Trigger::Manual)
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trigger::Scheduled => f.write_str("scheduled"),
            Trigger::Manual => f.write_str("manual"),
            Trigger::Reconciliation => f.write_str("reconciliation"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionAttempt {
    pub check_in_id: CheckInId,
    pub attempt: u32,
    pub status: SubmissionStatus,
    pub trigger: Trigger,
    pub raw_request: Option<String>,
    pub raw_response: Option<String>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub recorded_at: DateTime<Utc>,
    pub retry_at: Option<DateTime<Utc>>,
}

// Everything needed to append one attempt; the ledger stamps nothing itself
#[derive(Debug, Clone, PartialEq)]
pub struct NewAttempt {
    pub check_in_id: CheckInId,
    pub attempt: u32,
    pub status: SubmissionStatus,
    pub trigger: Trigger,
    pub raw_request: Option<String>,
    pub raw_response: Option<String>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub recorded_at: DateTime<Utc>,
    pub retry_at: Option<DateTime<Utc>>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("Attempt {attempt} for check-in {check_in_id} does not follow attempt {latest}")]
    NonMonotonicAttempt {
        check_in_id: CheckInId,
        attempt: u32,
        latest: u32,
    },

    #[error("Storage error: {0}")]
    Storage(String),
}

#[async_trait]
pub trait SubmissionLedger: Send + Sync + 'static {
    async fn record(&self, attempt: NewAttempt) -> Result<SubmissionAttempt, LedgerError>;

    async fn latest(&self, check_in_id: &CheckInId) -> Result<Option<SubmissionAttempt>, LedgerError>;

    async fn history(&self, check_in_id: &CheckInId) -> Result<Vec<SubmissionAttempt>, LedgerError>;
}

#[derive(Debug, Default)]
pub struct InMemoryLedger {
    attempts: DashMap<CheckInId, Vec<SubmissionAttempt>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn total_attempts(&self) -> usize {
        self.attempts.iter().map(|entry| entry.value().len()).sum()
    }
}

#[async_trait]
impl SubmissionLedger for InMemoryLedger {
    async fn record(&self, new: NewAttempt) -> Result<SubmissionAttempt, LedgerError> {
        let mut entry = self.attempts.entry(new.check_in_id.clone()).or_default();

        if let Some(latest) = entry.last() {
            if new.attempt <= latest.attempt {
                return Err(LedgerError::NonMonotonicAttempt {
                    check_in_id: new.check_in_id,
                    attempt: new.attempt,
                    latest: latest.attempt,
                });
            }
        }

        let attempt = SubmissionAttempt {
            check_in_id: new.check_in_id,
            attempt: new.attempt,
            status: new.status,
            trigger: new.trigger,
            raw_request: new.raw_request,
            raw_response: new.raw_response,
            error_code: new.error_code,
            error_message: new.error_message,
            recorded_at: new.recorded_at,
            retry_at: new.retry_at,
        };
        entry.push(attempt.clone());
        Ok(attempt)
    }

    async fn latest(&self, check_in_id: &CheckInId) -> Result<Option<SubmissionAttempt>, LedgerError> {
        Ok(self
            .attempts
            .get(check_in_id)
            .and_then(|entry| entry.value().last().cloned()))
    }

    async fn history(&self, check_in_id: &CheckInId) -> Result<Vec<SubmissionAttempt>, LedgerError> {
        Ok(self
            .attempts
            .get(check_in_id)
            .map(|entry| entry.value().clone())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attempt(id: &str, number: u32, status: SubmissionStatus) -> NewAttempt {
        NewAttempt {
            check_in_id: CheckInId::new(id),
            attempt: number,
            status,
            trigger: Trigger::Scheduled,
            raw_request: Some("<soap/>".to_string()),
            raw_response: None,
            error_code: None,
            error_message: None,
            recorded_at: Utc::now(),
            retry_at: None,
        }
    }

    #[tokio::test]
    async fn test_latest_returns_most_recent_attempt() {
        let ledger = InMemoryLedger::new();
        let id = CheckInId::new("c1");
        assert!(ledger.latest(&id).await.unwrap().is_none());

        ledger
            .record(attempt("c1", 1, SubmissionStatus::AwaitingRetry))
            .await
            .unwrap();
        ledger
            .record(attempt("c1", 2, SubmissionStatus::Acknowledged))
            .await
            .unwrap();
        ledger
            .record(attempt("c2", 1, SubmissionStatus::Failed))
            .await
            .unwrap();

        let latest = ledger.latest(&id).await.unwrap().unwrap();
        assert_eq!(latest.attempt, 2);
        assert_eq!(latest.status, SubmissionStatus::Acknowledged);
        assert_eq!(ledger.history(&id).await.unwrap().len(), 2);
        assert_eq!(ledger.total_attempts(), 3);
    }

    #[tokio::test]
    async fn test_attempt_numbers_must_increase() {
        let ledger = InMemoryLedger::new();
        ledger
            .record(attempt("c1", 2, SubmissionStatus::AwaitingRetry))
            .await
            .unwrap();

        let err = ledger
            .record(attempt("c1", 2, SubmissionStatus::Failed))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            LedgerError::NonMonotonicAttempt {
                check_in_id: CheckInId::new("c1"),
                attempt: 2,
                latest: 2,
            }
        );
        assert_eq!(ledger.history(&CheckInId::new("c1")).await.unwrap().len(), 1);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(SubmissionStatus::Acknowledged.is_terminal());
        assert!(SubmissionStatus::Failed.is_terminal());
        assert!(!SubmissionStatus::AwaitingRetry.is_terminal());
        assert_eq!(SubmissionStatus::AwaitingRetry.to_string(), "awaiting_retry");
    }

    #[tokio::test]
    async fn test_trigger_is_stored_per_attempt() {
        let ledger = InMemoryLedger::new();
        let mut manual = attempt("c1", 2, SubmissionStatus::Acknowledged);
        manual.trigger = Trigger::Manual;
        ledger
            .record(attempt("c1", 1, SubmissionStatus::AwaitingRetry))
            .await
            .unwrap();
        ledger.record(manual).await.unwrap();

        let triggers: Vec<Trigger> = ledger
            .history(&CheckInId::new("c1"))
            .await
            .unwrap()
            .iter()
            .map(|a| a.trigger)
            .collect();
        assert_eq!(triggers, vec![Trigger::Scheduled, Trigger::Manual]);
        assert!(Trigger::Reconciliation.is_automatic());
        assert!(!Trigger::Manual.is_automatic());

        let row = serde_json::to_value(ledger.latest(&CheckInId::new("c1")).await.unwrap()).unwrap();
        assert_eq!(row["trigger"], "manual");
    }
}
