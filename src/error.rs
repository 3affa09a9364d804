use crate::checkin::CheckInId;
use crate::document::DataError;
use crate::envelope::PackagingError;
use crate::ledger::LedgerError;
use crate::queue::QueueError;
use crate::store::StoreError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Check-in {0} not found")]
    NotFound(CheckInId),

    #[error("Check-in {id} is not eligible for submission: {reason}")]
    NotEligible { id: CheckInId, reason: String },

    #[error("Check-in {0} has already been acknowledged by the registry")]
    AlreadyAcknowledged(CheckInId),

    #[error("Invalid guest data: {0}")]
    Data(#[from] DataError),

    #[error("Packaging error: {0}")]
    Packaging(#[from] PackagingError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Check-in store error: {0}")]
    Store(#[from] StoreError),
}

impl PipelineError {
    // Infrastructure hiccups may succeed on a later run; everything else needs a person
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PipelineError::Ledger(_) | PipelineError::Queue(_) | PipelineError::Store(_)
        )
    }
}
