// Guest registration submission pipeline for the SES.Hospedajes lodging registry

// Input records and reference data
pub mod checkin;
pub mod municipality;
pub mod store;

// Build → package → send
pub mod client;
pub mod document;
pub mod envelope;

// Bookkeeping, scheduling and retries
pub mod driver;
pub mod ledger;
pub mod queue;
pub mod reconcile;
pub mod retry;
pub mod validation;

pub mod config;
pub mod error;
pub mod notify;
pub mod telemetry;

// Re-export key types for convenience
pub use checkin::{CheckInId, CheckInRecord, CheckInState, DocumentType, Gender, GuestRecord, GuestRole};
pub use client::{ClientConfig, SesClient, SubmissionOutcome, SubmissionTransport};
pub use config::AppConfig;
pub use document::{DataError, DocumentBuilder};
pub use driver::{DriverDeps, RunOutcome, SkipReason, SubmissionDriver};
pub use envelope::{EnvelopePackager, PackagedEnvelope, PackagingError};
pub use error::PipelineError;
pub use ledger::{InMemoryLedger, SubmissionAttempt, SubmissionLedger, SubmissionStatus, Trigger};
pub use municipality::{Municipality, MunicipalityLookup, MunicipalityTable};
pub use notify::{LogNotifier, Notification, Notifier};
pub use queue::{InMemoryTaskQueue, SubmissionTask, TaskQueue};
pub use reconcile::{ReconciliationJob, ReconciliationReport, ReconciliationResult};
pub use retry::{RetryPolicy, SchedulePolicy};
pub use store::{CheckInStore, InMemoryCheckInStore};
pub use validation::{ConnectionCheck, CredentialCheck};
