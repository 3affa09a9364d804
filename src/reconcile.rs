// Daily catch-up sweep over check-ins arriving on a given day
use crate::checkin::{domestic_offset, CheckInId, CheckInRecord, CheckInState};
use crate::driver::{RunOutcome, SkipReason, SubmissionDriver};
use crate::error::PipelineError;
use crate::ledger::{SubmissionLedger, SubmissionStatus, Trigger};
use crate::store::CheckInStore;
use chrono::{DateTime, FixedOffset, NaiveDate, TimeDelta, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ReconciliationResult {
    Submitted { duplicate: bool },
    AlreadyAcknowledged,
    Retrying { error: String },
    Failed { error: String },
    Skipped { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconciliationEntry {
    pub check_in_id: CheckInId,
    pub reference: String,
    #[serde(flatten)]
    pub result: ReconciliationResult,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconciliationReport {
    pub target_date: Option<NaiveDate>,
    pub entries: Vec<ReconciliationEntry>,
}

impl ReconciliationReport {
    pub fn submitted(&self) -> usize {
        self.count(|r| matches!(r, ReconciliationResult::Submitted { .. }))
    }

    pub fn already_acknowledged(&self) -> usize {
        self.count(|r| matches!(r, ReconciliationResult::AlreadyAcknowledged))
    }

    pub fn failed(&self) -> usize {
        self.count(|r| {
            matches!(
                r,
                ReconciliationResult::Failed { .. } | ReconciliationResult::Retrying { .. }
            )
        })
    }

    pub fn skipped(&self) -> usize {
        self.count(|r| matches!(r, ReconciliationResult::Skipped { .. }))
    }

    fn count(&self, pred: impl Fn(&ReconciliationResult) -> bool) -> usize {
        self.entries.iter().filter(|e| pred(&e.result)).count()
    }
}

pub fn default_target(today: NaiveDate) -> NaiveDate {
    today + TimeDelta::days(1)
}

// Calendar day at the properties, which is what arrival dates are expressed in
pub fn local_today(now: DateTime<Utc>, offset: FixedOffset) -> NaiveDate {
    now.with_timezone(&offset).date_naive()
}

pub struct ReconciliationJob {
    store: Arc<dyn CheckInStore>,
    ledger: Arc<dyn SubmissionLedger>,
    driver: Arc<SubmissionDriver>,
    concurrency: usize,
    local_offset: FixedOffset,
}

impl ReconciliationJob {
    pub fn new(
        store: Arc<dyn CheckInStore>,
        ledger: Arc<dyn SubmissionLedger>,
        driver: Arc<SubmissionDriver>,
    ) -> Self {
        Self {
            store,
            ledger,
            driver,
            concurrency: 4,
            local_offset: domestic_offset(),
        }
    }

    pub fn with_local_offset(mut self, offset: FixedOffset) -> Self {
        self.local_offset = offset;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Submit every eligible check-in arriving on `target` (tomorrow when
    /// `None`) that the registry has not acknowledged yet.
    pub async fn run(
        &self,
        target: Option<NaiveDate>,
        now: DateTime<Utc>,
    ) -> Result<ReconciliationReport, PipelineError> {
        let target =
            target.unwrap_or_else(|| default_target(local_today(now, self.local_offset)));
        let candidates: Vec<CheckInRecord> = self
            .store
            .arriving_on(target)
            .await?
            .into_iter()
            .filter(|record| record.auto_submit)
            .collect();

        tracing::info!(%target, candidates = candidates.len(), "reconciliation started");

        let mut entries: Vec<ReconciliationEntry> = stream::iter(candidates)
            .map(|record| async move {
                let result = self.reconcile_one(&record, now).await;
                ReconciliationEntry {
                    check_in_id: record.id,
                    reference: record.reference,
                    result,
                }
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;
        entries.sort_by(|a, b| a.reference.cmp(&b.reference));

        let report = ReconciliationReport {
            target_date: Some(target),
            entries,
        };
        tracing::info!(
            %target,
            submitted = report.submitted(),
            already_acknowledged = report.already_acknowledged(),
            failed = report.failed(),
            skipped = report.skipped(),
            "reconciliation finished"
        );
        Ok(report)
    }

    async fn reconcile_one(&self, record: &CheckInRecord, now: DateTime<Utc>) -> ReconciliationResult {
        match record.state {
            CheckInState::Active => {}
            CheckInState::Cancelled => {
                return ReconciliationResult::Skipped {
                    reason: SkipReason::Cancelled.to_string(),
                }
            }
            CheckInState::SubmittedManually => {
                return ReconciliationResult::Skipped {
                    reason: SkipReason::SubmittedManually.to_string(),
                }
            }
        }

        match self.ledger.latest(&record.id).await {
            Ok(Some(latest)) if latest.status == SubmissionStatus::Acknowledged => {
                return ReconciliationResult::AlreadyAcknowledged;
            }
            Ok(_) => {}
            Err(e) => {
                return ReconciliationResult::Failed {
                    error: e.to_string(),
                }
            }
        }

        match self
            .driver
            .submit_now(&record.id, now, Trigger::Reconciliation)
            .await
        {
            Ok(RunOutcome::Acknowledged { duplicate, .. }) => {
                ReconciliationResult::Submitted { duplicate }
            }
            Ok(RunOutcome::RetryScheduled { error, .. }) => ReconciliationResult::Retrying { error },
            Ok(RunOutcome::Failed { error, .. }) => ReconciliationResult::Failed { error },
            Ok(RunOutcome::Skipped(SkipReason::AlreadyAcknowledged)) => {
                ReconciliationResult::AlreadyAcknowledged
            }
            Ok(RunOutcome::Skipped(reason)) => ReconciliationResult::Skipped {
                reason: reason.to_string(),
            },
            Err(e) => {
                tracing::error!(check_in_id = %record.id, error = %e, "reconciliation attempt failed");
                ReconciliationResult::Failed {
                    error: e.to_string(),
                }
            }
        }
    }
}
