// Retry/scheduler driver: owns the per-check-in submission state machine
use crate::checkin::{CheckInId, CheckInRecord, CheckInState};
use crate::client::{SubmissionOutcome, SubmissionTransport};
use crate::document::DocumentBuilder;
use crate::envelope::EnvelopePackager;
use crate::error::PipelineError;
use crate::ledger::{NewAttempt, SubmissionLedger, SubmissionStatus, Trigger};
use crate::notify::{self, Notification, Notifier};
use crate::queue::{SubmissionTask, TaskQueue};
use crate::store::CheckInStore;
use crate::retry::{eta_after, AttemptResult, FailureKind, RetryPolicy, SchedulePolicy};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    // task sequence no longer matches the tracker
    Stale,
    AlreadyAcknowledged,
    Cancelled,
    SubmittedManually,
    Missing,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            SkipReason::Stale => "superseded task",
            SkipReason::AlreadyAcknowledged => "already acknowledged",
            SkipReason::Cancelled => "check-in cancelled",
            SkipReason::SubmittedManually => "submitted manually",
            SkipReason::Missing => "check-in no longer exists",
        };
        f.write_str(reason)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Acknowledged {
        attempt: u32,
        duplicate: bool,
    },
    RetryScheduled {
        attempt: u32,
        eta: DateTime<Utc>,
        error: String,
    },
    Failed {
        attempt: u32,
        error: String,
    },
    Skipped(SkipReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleReceipt {
    pub eta: DateTime<Utc>,
    pub deferred: bool,
    pub sequence: u32,
}

// In-process view of one check-in; rebuilt from the ledger on first use
#[derive(Debug, Clone)]
struct Tracking {
    hydrated: bool,
    status: SubmissionStatus,
    // ledger attempt number the next execution will record
    next_sequence: u32,
    // attempts spent in the current retry budget
    budget_used: u32,
    next_eta: Option<DateTime<Utc>>,
}

impl Tracking {
    // terminal, or untouched: hydrate() gives back exactly this state
    fn is_rebuildable(&self) -> bool {
        self.status.is_terminal()
            || (self.status == SubmissionStatus::Pending && self.next_eta.is_none())
    }
}

// A failure found before anything was sent
struct FastFailure {
    kind: FailureKind,
    raw_request: Option<String>,
    error: String,
}

impl Default for Tracking {
    fn default() -> Self {
        Self {
            hydrated: false,
            status: SubmissionStatus::Pending,
            next_sequence: 1,
            budget_used: 0,
            next_eta: None,
        }
    }
}

/// Collaborators the driver needs, constructed once per process.
pub struct DriverDeps {
    pub store: Arc<dyn CheckInStore>,
    pub ledger: Arc<dyn SubmissionLedger>,
    pub transport: Arc<dyn SubmissionTransport>,
    pub queue: Arc<dyn TaskQueue>,
    pub notifier: Arc<dyn Notifier>,
}

pub struct SubmissionDriver {
    deps: DriverDeps,
    builder: DocumentBuilder,
    packager: EnvelopePackager,
    retry: RetryPolicy,
    schedule: SchedulePolicy,
    tracking: DashMap<CheckInId, Arc<Mutex<Tracking>>>,
}

impl SubmissionDriver {
    pub fn new(
        deps: DriverDeps,
        builder: DocumentBuilder,
        packager: EnvelopePackager,
        retry: RetryPolicy,
        schedule: SchedulePolicy,
    ) -> Self {
        Self {
            deps,
            builder,
            packager,
            retry,
            schedule,
            tracking: DashMap::new(),
        }
    }

    fn slot(&self, id: &CheckInId) -> Arc<Mutex<Tracking>> {
        // clone the Arc out so no map guard is held across an await
        self.tracking.entry(id.clone()).or_default().value().clone()
    }

    // Drop the in-process view once the ledger alone can rebuild it. Only when
    // nobody else holds the slot, so two callers never lock different mutexes.
    fn release(&self, id: &CheckInId) {
        self.tracking.remove_if(id, |_, slot| {
            Arc::strong_count(slot) == 1
                && slot
                    .try_lock()
                    .map(|tracking| tracking.is_rebuildable())
                    .unwrap_or(false)
        });
    }

    /// Check-ins currently held in memory.
    pub fn tracked(&self) -> usize {
        self.tracking.len()
    }

    async fn hydrate(&self, id: &CheckInId, tracking: &mut Tracking) -> Result<(), PipelineError> {
        if tracking.hydrated {
            return Ok(());
        }

        let history = self.deps.ledger.history(id).await?;
        if let Some(latest) = history.last() {
            tracking.status = latest.status;
            tracking.next_sequence = latest.attempt + 1;
            tracking.budget_used = match latest.status {
                SubmissionStatus::AwaitingRetry => history
                    .iter()
                    .rev()
                    .take_while(|a| a.status == SubmissionStatus::AwaitingRetry)
                    .count() as u32,
                SubmissionStatus::Failed => self.retry.max_attempts,
                _ => 0,
            };
            tracking.next_eta = latest.retry_at;
        }
        tracking.hydrated = true;
        Ok(())
    }

    async fn load(&self, id: &CheckInId) -> Result<CheckInRecord, PipelineError> {
        self.deps
            .store
            .get(id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(id.clone()))
    }

    /// Pending → Scheduled. Guest data is validated here so that data errors
    /// reach the caller before anything is queued.
    pub async fn schedule(
        &self,
        id: &CheckInId,
        now: DateTime<Utc>,
    ) -> Result<ScheduleReceipt, PipelineError> {
        let record = self.load(id).await?;
        if !record.is_eligible_for_submission() {
            let reason = if record.state != CheckInState::Active {
                format!("state is {:?}", record.state)
            } else {
                "auto-submit is disabled".to_string()
            };
            return Err(PipelineError::NotEligible {
                id: id.clone(),
                reason,
            });
        }
        self.builder.build(&record)?;

        let slot = self.slot(id);
        let result = self.schedule_locked(&record, &mut *slot.lock().await, now).await;
        drop(slot);
        self.release(id);
        result
    }

    async fn schedule_locked(
        &self,
        record: &CheckInRecord,
        tracking: &mut Tracking,
        now: DateTime<Utc>,
    ) -> Result<ScheduleReceipt, PipelineError> {
        let id = &record.id;
        self.hydrate(id, tracking).await?;

        match tracking.status {
            SubmissionStatus::Acknowledged => {
                return Err(PipelineError::AlreadyAcknowledged(id.clone()));
            }
            SubmissionStatus::Scheduled | SubmissionStatus::AwaitingRetry => {
                if let Some(eta) = tracking.next_eta {
                    tracing::debug!(check_in_id = %id, %eta, "submission already queued");
                    return Ok(ScheduleReceipt {
                        eta,
                        deferred: false,
                        sequence: tracking.next_sequence,
                    });
                }
            }
            SubmissionStatus::Failed => tracking.budget_used = 0,
            _ => {}
        }

        let window = self.schedule.first_submission(&record.arrival, now);
        if window.deferred {
            tracing::warn!(
                check_in_id = %id,
                eta = %window.eta,
                "evening-before slot already passed, submitting shortly"
            );
        }

        let task = SubmissionTask {
            check_in_id: id.clone(),
            sequence: tracking.next_sequence,
            eta: window.eta,
        };
        self.deps.queue.enqueue(task).await?;

        tracking.status = SubmissionStatus::Scheduled;
        tracking.next_eta = Some(window.eta);
        tracing::info!(check_in_id = %id, eta = %window.eta, sequence = tracking.next_sequence, "submission scheduled");

        Ok(ScheduleReceipt {
            eta: window.eta,
            deferred: window.deferred,
            sequence: tracking.next_sequence,
        })
    }

    /// Execute a queued task. Superseded, cancelled or already acknowledged
    /// work is skipped.
    pub async fn run_task(
        &self,
        task: &SubmissionTask,
        now: DateTime<Utc>,
    ) -> Result<RunOutcome, PipelineError> {
        let slot = self.slot(&task.check_in_id);
        let result = self.run_task_locked(task, &mut *slot.lock().await, now).await;
        drop(slot);
        self.release(&task.check_in_id);
        result
    }

    async fn run_task_locked(
        &self,
        task: &SubmissionTask,
        tracking: &mut Tracking,
        now: DateTime<Utc>,
    ) -> Result<RunOutcome, PipelineError> {
        self.hydrate(&task.check_in_id, tracking).await?;

        if tracking.status == SubmissionStatus::Acknowledged {
            return Ok(RunOutcome::Skipped(SkipReason::AlreadyAcknowledged));
        }
        if task.sequence != tracking.next_sequence {
            tracing::debug!(
                check_in_id = %task.check_in_id,
                task_sequence = task.sequence,
                expected = tracking.next_sequence,
                "dropping stale task"
            );
            return Ok(RunOutcome::Skipped(SkipReason::Stale));
        }

        self.attempt(&task.check_in_id, tracking, now, Trigger::Scheduled)
            .await
    }

    /// Operator "retry now". Refused once acknowledged; a failed check-in
    /// gets a fresh retry budget.
    pub async fn retry_now(
        &self,
        id: &CheckInId,
        now: DateTime<Utc>,
    ) -> Result<RunOutcome, PipelineError> {
        match self.submit_now(id, now, Trigger::Manual).await? {
            RunOutcome::Skipped(SkipReason::AlreadyAcknowledged) => {
                Err(PipelineError::AlreadyAcknowledged(id.clone()))
            }
            outcome => Ok(outcome),
        }
    }

    /// Synchronous attempt outside the queue, under the same lock and policy.
    pub async fn submit_now(
        &self,
        id: &CheckInId,
        now: DateTime<Utc>,
        trigger: Trigger,
    ) -> Result<RunOutcome, PipelineError> {
        let slot = self.slot(id);
        let result = self.submit_locked(id, &mut *slot.lock().await, now, trigger).await;
        drop(slot);
        self.release(id);
        result
    }

    async fn submit_locked(
        &self,
        id: &CheckInId,
        tracking: &mut Tracking,
        now: DateTime<Utc>,
        trigger: Trigger,
    ) -> Result<RunOutcome, PipelineError> {
        self.hydrate(id, tracking).await?;

        if tracking.status == SubmissionStatus::Acknowledged {
            return Ok(RunOutcome::Skipped(SkipReason::AlreadyAcknowledged));
        }
        if tracking.status == SubmissionStatus::Failed {
            tracking.budget_used = 0;
        }

        self.attempt(id, tracking, now, trigger).await
    }

    pub async fn status(&self, id: &CheckInId) -> Result<SubmissionStatus, PipelineError> {
        let slot = self.slot(id);
        // a held lock means an attempt is in progress
        let result = match slot.try_lock() {
            Ok(mut tracking) => self.hydrate(id, &mut tracking).await.map(|_| tracking.status),
            Err(_) => Ok(SubmissionStatus::InFlight),
        };
        drop(slot);
        self.release(id);
        result
    }

    // One build → package → send → record cycle. Caller holds the check-in lock.
    async fn attempt(
        &self,
        id: &CheckInId,
        tracking: &mut Tracking,
        now: DateTime<Utc>,
        trigger: Trigger,
    ) -> Result<RunOutcome, PipelineError> {
        let Some(record) = self.deps.store.get(id).await? else {
            tracing::warn!(check_in_id = %id, "check-in disappeared before submission");
            tracking.next_eta = None;
            return Ok(RunOutcome::Skipped(SkipReason::Missing));
        };
        match record.state {
            CheckInState::Active => {}
            CheckInState::Cancelled => {
                tracing::info!(check_in_id = %id, "check-in cancelled, skipping submission");
                tracking.next_eta = None;
                return Ok(RunOutcome::Skipped(SkipReason::Cancelled));
            }
            CheckInState::SubmittedManually => {
                tracing::info!(check_in_id = %id, "check-in submitted manually, skipping submission");
                tracking.next_eta = None;
                return Ok(RunOutcome::Skipped(SkipReason::SubmittedManually));
            }
        }

        let sequence = tracking.next_sequence;
        let budget_attempt = tracking.budget_used + 1;

        let xml = match self.builder.build(&record) {
            Ok(xml) => xml,
            Err(e) => {
                tracing::error!(check_in_id = %id, error = %e, "document build failed");
                let failure = FastFailure {
                    kind: FailureKind::Data,
                    raw_request: None,
                    error: e.to_string(),
                };
                return self.fail_fast(&record, tracking, now, trigger, failure).await;
            }
        };

        let envelope = match self.packager.package(&xml) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::error!(check_in_id = %id, error = %e, "envelope packaging failed");
                let failure = FastFailure {
                    kind: FailureKind::Packaging,
                    raw_request: Some(xml),
                    error: e.to_string(),
                };
                return self.fail_fast(&record, tracking, now, trigger, failure).await;
            }
        };

        let previous = tracking.status;
        tracking.status = SubmissionStatus::InFlight;
        tracing::info!(check_in_id = %id, attempt = sequence, %trigger, "submitting to registry");

        let outcome = self.deps.transport.submit(&envelope.soap).await;
        let result = match &outcome {
            SubmissionOutcome::Acknowledged { .. } => AttemptResult::Acknowledged,
            SubmissionOutcome::DomainFailure { .. } => AttemptResult::Failed(FailureKind::Domain),
            SubmissionOutcome::TransportFailure { .. } => {
                AttemptResult::Failed(FailureKind::Transport)
            }
        };

        let transition = self.retry.next(budget_attempt, result);
        let retry_at = transition.retry_after.map(|delay| eta_after(now, delay));

        let recorded = self
            .deps
            .ledger
            .record(NewAttempt {
                check_in_id: id.clone(),
                attempt: sequence,
                status: transition.status,
                trigger,
                raw_request: Some(xml),
                raw_response: outcome.raw_response().map(str::to_string),
                error_code: outcome.error_code().map(str::to_string),
                error_message: outcome.error_message().map(str::to_string),
                recorded_at: now,
                retry_at,
            })
            .await;
        if let Err(e) = recorded {
            // the task that brought us here is spent; let schedule() queue a new one
            tracking.status = previous;
            tracking.next_eta = None;
            tracing::error!(check_in_id = %id, attempt = sequence, error = %e, "failed to record attempt");
            return Err(e.into());
        }

        tracking.status = transition.status;
        tracking.next_sequence = sequence + 1;
        tracking.budget_used = budget_attempt;
        tracking.next_eta = retry_at;

        let error = outcome.error_message().unwrap_or_default().to_string();
        match (transition.status, retry_at) {
            (SubmissionStatus::Acknowledged, _) => {
                let duplicate =
                    matches!(outcome, SubmissionOutcome::Acknowledged { duplicate: true, .. });
                tracing::info!(check_in_id = %id, attempt = sequence, duplicate, "submission acknowledged");
                self.send(&record, notify::submission_acknowledged(&record, sequence, duplicate))
                    .await;
                Ok(RunOutcome::Acknowledged {
                    attempt: sequence,
                    duplicate,
                })
            }
            (SubmissionStatus::AwaitingRetry, Some(eta)) => {
                tracing::warn!(
                    check_in_id = %id,
                    attempt = sequence,
                    code = outcome.error_code().unwrap_or("-"),
                    %eta,
                    error = %error,
                    "submission failed, retry scheduled"
                );
                let queued = self
                    .deps
                    .queue
                    .enqueue(SubmissionTask {
                        check_in_id: id.clone(),
                        sequence: tracking.next_sequence,
                        eta,
                    })
                    .await;
                if let Err(e) = queued {
                    // nothing is queued, so schedule() must not report the retry as pending
                    tracking.next_eta = None;
                    tracing::error!(check_in_id = %id, error = %e, "failed to queue retry");
                    return Err(e.into());
                }
                Ok(RunOutcome::RetryScheduled {
                    attempt: sequence,
                    eta,
                    error,
                })
            }
            _ => {
                tracing::error!(
                    check_in_id = %id,
                    attempt = sequence,
                    code = outcome.error_code().unwrap_or("-"),
                    error = %error,
                    "submission failed permanently"
                );
                self.send(&record, notify::submission_failed(&record, budget_attempt, &error))
                    .await;
                Ok(RunOutcome::Failed {
                    attempt: sequence,
                    error,
                })
            }
        }
    }

    // Data and packaging errors: record the attempt as Failed without calling the registry
    async fn fail_fast(
        &self,
        record: &CheckInRecord,
        tracking: &mut Tracking,
        now: DateTime<Utc>,
        trigger: Trigger,
        failure: FastFailure,
    ) -> Result<RunOutcome, PipelineError> {
        let sequence = tracking.next_sequence;
        let budget_attempt = tracking.budget_used + 1;
        let transition = self
            .retry
            .next(budget_attempt, AttemptResult::Failed(failure.kind));

        self.deps
            .ledger
            .record(NewAttempt {
                check_in_id: record.id.clone(),
                attempt: sequence,
                status: transition.status,
                trigger,
                raw_request: failure.raw_request,
                raw_response: None,
                error_code: None,
                error_message: Some(failure.error.clone()),
                recorded_at: now,
                retry_at: None,
            })
            .await?;

        tracking.status = transition.status;
        tracking.next_sequence = sequence + 1;
        tracking.budget_used = self.retry.max_attempts;
        tracking.next_eta = None;

        self.send(
            record,
            notify::submission_failed(record, budget_attempt, &failure.error),
        )
        .await;
        Ok(RunOutcome::Failed {
            attempt: sequence,
            error: failure.error,
        })
    }

    // Owner emails never change the outcome of an attempt
    async fn send(&self, record: &CheckInRecord, notification: Notification) {
        if let Err(e) = self.deps.notifier.notify(notification).await {
            tracing::error!(check_in_id = %record.id, error = %e, "failed to send owner notification");
        }
    }

    /// Drain every due task from `queue` and run them, at most `concurrency`
    /// at a time. Tasks for the same check-in serialise on its lock.
    pub async fn run_due(
        &self,
        queue: &dyn TaskQueue,
        now: DateTime<Utc>,
        concurrency: usize,
    ) -> Result<Vec<(SubmissionTask, Result<RunOutcome, PipelineError>)>, PipelineError> {
        let due = queue.take_due(now).await?;
        let results: Vec<_> = stream::iter(due)
            .map(|task| async move {
                let result = self.run_task(&task, now).await;
                if let Err(e) = &result {
                    tracing::error!(check_in_id = %task.check_in_id, error = %e, "task execution failed");
                }
                (task, result)
            })
            .buffer_unordered(concurrency.max(1))
            .collect()
            .await;
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkin::fixtures::check_in;
    use crate::ledger::{InMemoryLedger, LedgerError, SubmissionAttempt};
    use crate::municipality::{Municipality, MunicipalityTable};
    use crate::notify::RecordingNotifier;
    use crate::queue::{InMemoryTaskQueue, QueueError};
    use crate::store::InMemoryCheckInStore;
    use async_trait::async_trait;
    use parking_lot::Mutex as SyncMutex;
    use std::collections::VecDeque;

    // Replays canned outcomes, then acknowledges
    struct ScriptedTransport {
        script: SyncMutex<VecDeque<SubmissionOutcome>>,
        calls: SyncMutex<u32>,
    }

    impl ScriptedTransport {
        fn new(script: Vec<SubmissionOutcome>) -> Self {
            Self {
                script: SyncMutex::new(script.into()),
                calls: SyncMutex::new(0),
            }
        }

        fn calls(&self) -> u32 {
            *self.calls.lock()
        }
    }

    #[async_trait]
    impl SubmissionTransport for ScriptedTransport {
        async fn submit(&self, _soap_envelope: &str) -> SubmissionOutcome {
            *self.calls.lock() += 1;
            self.script.lock().pop_front().unwrap_or_else(|| SubmissionOutcome::Acknowledged {
                code: "0".to_string(),
                duplicate: false,
                raw_response: "<codigo>0</codigo>".to_string(),
            })
        }
    }

    fn timeout() -> SubmissionOutcome {
        SubmissionOutcome::TransportFailure {
            status: None,
            message: "Request timed out after 30s".to_string(),
            raw_response: None,
        }
    }

    // Fails the first `failures` writes, then delegates
    struct FlakyLedger {
        inner: Arc<InMemoryLedger>,
        failures: SyncMutex<u32>,
    }

    #[async_trait]
    impl SubmissionLedger for FlakyLedger {
        async fn record(&self, attempt: NewAttempt) -> Result<SubmissionAttempt, LedgerError> {
            {
                let mut failures = self.failures.lock();
                if *failures > 0 {
                    *failures -= 1;
                    return Err(LedgerError::Storage("db down".to_string()));
                }
            }
            self.inner.record(attempt).await
        }

        async fn latest(&self, id: &CheckInId) -> Result<Option<SubmissionAttempt>, LedgerError> {
            self.inner.latest(id).await
        }

        async fn history(&self, id: &CheckInId) -> Result<Vec<SubmissionAttempt>, LedgerError> {
            self.inner.history(id).await
        }
    }

    struct Harness {
        driver: SubmissionDriver,
        store: Arc<InMemoryCheckInStore>,
        ledger: Arc<InMemoryLedger>,
        queue: Arc<InMemoryTaskQueue>,
        notifier: Arc<RecordingNotifier>,
        transport: Arc<ScriptedTransport>,
    }

    fn harness(script: Vec<SubmissionOutcome>) -> Harness {
        harness_with(script, 0, InMemoryTaskQueue::new())
    }

    fn harness_with(
        script: Vec<SubmissionOutcome>,
        ledger_failures: u32,
        queue: InMemoryTaskQueue,
    ) -> Harness {
        let store = Arc::new(InMemoryCheckInStore::new());
        store.insert(check_in("c1"));
        let ledger = Arc::new(InMemoryLedger::new());
        let queue = Arc::new(queue);
        let notifier = Arc::new(RecordingNotifier::new());
        let transport = Arc::new(ScriptedTransport::new(script));
        let table = MunicipalityTable::new(vec![Municipality {
            code: "28079".to_string(),
            name: "Madrid".to_string(),
            province: "Madrid".to_string(),
            postal_code: "28013".to_string(),
        }]);

        let driver = SubmissionDriver::new(
            DriverDeps {
                store: store.clone(),
                ledger: Arc::new(FlakyLedger {
                    inner: ledger.clone(),
                    failures: SyncMutex::new(ledger_failures),
                }),
                transport: transport.clone(),
                queue: queue.clone(),
                notifier: notifier.clone(),
            },
            DocumentBuilder::new("0000000123", Arc::new(table)),
            EnvelopePackager::new("0000000042"),
            RetryPolicy::default(),
            SchedulePolicy::default(),
        );

        Harness {
            driver,
            store,
            ledger,
            queue,
            notifier,
            transport,
        }
    }

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[tokio::test]
    async fn test_schedule_is_idempotent() {
        let h = harness(vec![]);
        let id = CheckInId::new("c1");
        let now = utc("2025-06-01T09:00:00Z");

        let first = h.driver.schedule(&id, now).await.unwrap();
        let second = h.driver.schedule(&id, now).await.unwrap();

        assert_eq!(first.eta, utc("2025-06-09T19:00:00Z"));
        assert_eq!(first.eta, second.eta);
        assert_eq!(h.queue.len(), 1);
        assert_eq!(h.driver.status(&id).await.unwrap(), SubmissionStatus::Scheduled);
    }

    #[tokio::test]
    async fn test_schedule_rejects_invalid_data_before_queueing() {
        let h = harness(vec![]);
        let mut record = check_in("c2");
        record.guests[0].support_number = None;
        h.store.insert(record);

        let err = h
            .driver
            .schedule(&CheckInId::new("c2"), Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Data(_)));
        assert!(h.queue.is_empty());
    }

    #[tokio::test]
    async fn test_stale_task_is_dropped() {
        let h = harness(vec![]);
        let id = CheckInId::new("c1");
        let now = utc("2025-06-09T19:00:00Z");
        let task = SubmissionTask {
            check_in_id: id.clone(),
            sequence: 1,
            eta: now,
        };

        let first = h.driver.run_task(&task, now).await.unwrap();
        assert!(matches!(first, RunOutcome::Acknowledged { attempt: 1, .. }));

        // redelivery of the same task
        let again = h.driver.run_task(&task, now).await.unwrap();
        assert_eq!(again, RunOutcome::Skipped(SkipReason::AlreadyAcknowledged));
        assert_eq!(h.transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_manual_retry_supersedes_queued_retry() {
        let h = harness(vec![timeout()]);
        let id = CheckInId::new("c1");
        let now = utc("2025-06-09T19:00:00Z");
        h.driver.schedule(&id, utc("2025-06-01T09:00:00Z")).await.unwrap();

        let results = h.driver.run_due(h.queue.as_ref(), now, 4).await.unwrap();
        assert!(matches!(results[0].1, Ok(RunOutcome::RetryScheduled { attempt: 1, .. })));
        let queued = h.queue.pending();
        assert_eq!(queued.len(), 1);

        let manual = h.driver.retry_now(&id, now).await.unwrap();
        assert!(matches!(manual, RunOutcome::Acknowledged { attempt: 2, .. }));

        let late = h.driver.run_task(&queued[0], queued[0].eta).await.unwrap();
        assert_eq!(late, RunOutcome::Skipped(SkipReason::AlreadyAcknowledged));

        let err = h.driver.retry_now(&id, now).await.unwrap_err();
        assert!(matches!(err, PipelineError::AlreadyAcknowledged(_)));
        assert_eq!(h.transport.calls(), 2);
    }

    #[tokio::test]
    async fn test_cancelled_check_in_is_noop() {
        let h = harness(vec![]);
        let id = CheckInId::new("c1");
        let receipt = h.driver.schedule(&id, utc("2025-06-01T09:00:00Z")).await.unwrap();
        h.store.set_state(&id, CheckInState::Cancelled);

        let task = SubmissionTask {
            check_in_id: id.clone(),
            sequence: receipt.sequence,
            eta: receipt.eta,
        };
        let outcome = h.driver.run_task(&task, receipt.eta).await.unwrap();

        assert_eq!(outcome, RunOutcome::Skipped(SkipReason::Cancelled));
        assert_eq!(h.transport.calls(), 0);
        assert_eq!(h.ledger.total_attempts(), 0);
    }

    #[tokio::test]
    async fn test_data_error_at_run_time_fails_without_sending() {
        let h = harness(vec![]);
        let id = CheckInId::new("c1");
        let receipt = h.driver.schedule(&id, utc("2025-06-01T09:00:00Z")).await.unwrap();

        // record edited after scheduling
        let mut record = check_in("c1");
        record.guest_count = 5;
        h.store.insert(record);

        let task = SubmissionTask {
            check_in_id: id.clone(),
            sequence: receipt.sequence,
            eta: receipt.eta,
        };
        let outcome = h.driver.run_task(&task, receipt.eta).await.unwrap();

        assert!(matches!(outcome, RunOutcome::Failed { attempt: 1, .. }));
        assert_eq!(h.transport.calls(), 0);
        assert_eq!(h.notifier.sent().len(), 1);
        let latest = h.ledger.latest(&id).await.unwrap().unwrap();
        assert_eq!(latest.status, SubmissionStatus::Failed);
        assert!(latest.error_message.unwrap().contains("Declared 5 guests"));
    }

    #[tokio::test]
    async fn test_retry_now_reopens_budget_after_failure() {
        let h = harness(vec![timeout(), timeout(), timeout()]);
        let id = CheckInId::new("c1");
        let mut now = utc("2025-06-09T19:00:00Z");

        for _ in 0..3 {
            h.driver.submit_now(&id, now, Trigger::Reconciliation).await.unwrap();
            now += chrono::TimeDelta::minutes(15);
        }
        assert_eq!(h.driver.status(&id).await.unwrap(), SubmissionStatus::Failed);

        let outcome = h.driver.retry_now(&id, now).await.unwrap();
        assert!(matches!(outcome, RunOutcome::Acknowledged { attempt: 4, .. }));
    }

    #[tokio::test]
    async fn test_state_rebuilt_from_ledger() {
        let h = harness(vec![]);
        let id = CheckInId::new("c1");
        h.ledger
            .record(NewAttempt {
                check_in_id: id.clone(),
                attempt: 1,
                status: SubmissionStatus::Acknowledged,
                trigger: Trigger::Manual,
                raw_request: None,
                raw_response: None,
                error_code: None,
                error_message: None,
                recorded_at: Utc::now(),
                retry_at: None,
            })
            .await
            .unwrap();

        assert_eq!(h.driver.status(&id).await.unwrap(), SubmissionStatus::Acknowledged);
        assert!(matches!(
            h.driver.schedule(&id, Utc::now()).await,
            Err(PipelineError::AlreadyAcknowledged(_))
        ));
    }

    #[tokio::test]
    async fn test_retry_survives_full_queue() {
        let h = harness_with(vec![timeout()], 0, InMemoryTaskQueue::with_capacity(1));
        h.store.insert(check_in("c2"));
        let c1 = CheckInId::new("c1");
        let now = utc("2025-06-01T09:00:00Z");

        let receipt = h.driver.schedule(&c1, now).await.unwrap();
        let due = h.queue.take_due(receipt.eta).await.unwrap();
        assert_eq!(due.len(), 1);
        // another check-in takes the only free slot
        h.driver.schedule(&CheckInId::new("c2"), now).await.unwrap();

        let err = h.driver.run_task(&due[0], receipt.eta).await.unwrap_err();
        assert!(matches!(err, PipelineError::Queue(QueueError::Full)));
        assert!(err.is_retryable());
        assert_eq!(h.driver.status(&c1).await.unwrap(), SubmissionStatus::AwaitingRetry);

        h.queue.take_due(utc("2025-06-30T00:00:00Z")).await.unwrap();
        let again = h.driver.schedule(&c1, receipt.eta).await.unwrap();
        assert_eq!(again.sequence, 2);
        assert_eq!(h.queue.len(), 1);

        let results = h.driver.run_due(h.queue.as_ref(), again.eta, 1).await.unwrap();
        assert!(matches!(results[0].1, Ok(RunOutcome::Acknowledged { attempt: 2, .. })));
    }

    #[tokio::test]
    async fn test_ledger_failure_does_not_leave_check_in_in_flight() {
        let h = harness_with(vec![], 1, InMemoryTaskQueue::new());
        let id = CheckInId::new("c1");
        let now = utc("2025-06-09T19:00:00Z");

        let err = h.driver.submit_now(&id, now, Trigger::Manual).await.unwrap_err();
        assert!(matches!(err, PipelineError::Ledger(LedgerError::Storage(_))));
        assert_eq!(h.driver.status(&id).await.unwrap(), SubmissionStatus::Pending);

        let outcome = h.driver.submit_now(&id, now, Trigger::Manual).await.unwrap();
        assert!(matches!(outcome, RunOutcome::Acknowledged { attempt: 1, .. }));
        assert_eq!(h.transport.calls(), 2);
    }

    #[tokio::test]
    async fn test_ledger_failure_on_queued_task_allows_rescheduling() {
        let h = harness_with(vec![], 1, InMemoryTaskQueue::new());
        let id = CheckInId::new("c1");

        let receipt = h.driver.schedule(&id, utc("2025-06-01T09:00:00Z")).await.unwrap();
        let results = h.driver.run_due(h.queue.as_ref(), receipt.eta, 1).await.unwrap();
        assert!(matches!(results[0].1, Err(PipelineError::Ledger(_))));
        assert_eq!(h.driver.status(&id).await.unwrap(), SubmissionStatus::Scheduled);
        assert!(h.queue.is_empty());

        let again = h.driver.schedule(&id, receipt.eta).await.unwrap();
        assert_eq!(again.sequence, 1);
        assert_eq!(h.queue.len(), 1);
    }

    #[tokio::test]
    async fn test_terminal_check_ins_are_released() {
        let h = harness(vec![]);
        let id = CheckInId::new("c1");
        h.driver.schedule(&id, utc("2025-06-01T09:00:00Z")).await.unwrap();
        assert_eq!(h.driver.tracked(), 1);

        h.driver
            .submit_now(&id, utc("2025-06-09T18:00:00Z"), Trigger::Manual)
            .await
            .unwrap();
        assert_eq!(h.driver.tracked(), 0);

        let sent = h.notifier.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].subject, "Police Submission successful for Casa del Sol");

        // rebuilt from the ledger on demand
        assert_eq!(h.driver.status(&id).await.unwrap(), SubmissionStatus::Acknowledged);
        let queued = h.queue.pending();
        let outcome = h.driver.run_task(&queued[0], queued[0].eta).await.unwrap();
        assert_eq!(outcome, RunOutcome::Skipped(SkipReason::AlreadyAcknowledged));
        assert_eq!(h.driver.tracked(), 0);
        assert_eq!(h.transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_failure_email_counts_attempts_in_current_budget() {
        let h = harness(vec![timeout(), timeout(), timeout()]);
        let id = CheckInId::new("c1");
        let mut now = utc("2025-06-09T19:00:00Z");

        for _ in 0..3 {
            h.driver.submit_now(&id, now, Trigger::Reconciliation).await.unwrap();
            now += chrono::TimeDelta::minutes(15);
        }

        let mut record = check_in("c1");
        record.guest_count = 5;
        h.store.insert(record);
        let outcome = h.driver.retry_now(&id, now).await.unwrap();
        assert!(matches!(outcome, RunOutcome::Failed { attempt: 4, .. }));

        let sent = h.notifier.sent();
        assert_eq!(sent.len(), 2);
        assert!(sent[0].text_body.contains("after 3 attempt(s)"));
        assert!(sent[1].text_body.contains("after 1 attempt(s)"));

        let triggers: Vec<Trigger> = h
            .ledger
            .history(&id)
            .await
            .unwrap()
            .iter()
            .map(|a| a.trigger)
            .collect();
        assert_eq!(
            triggers,
            vec![
                Trigger::Reconciliation,
                Trigger::Reconciliation,
                Trigger::Reconciliation,
                Trigger::Manual
            ]
        );
    }
}
