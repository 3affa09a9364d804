// Owner notifications. Delivery is fire-and-forget from the pipeline's point of view.
use crate::checkin::CheckInRecord;
use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub recipient: String,
    pub subject: String,
    pub html_body: String,
    pub text_body: String,
}

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("Missing recipient")]
    MissingRecipient,

    #[error("Delivery failed: {0}")]
    Delivery(String),
}

#[async_trait]
pub trait Notifier: Send + Sync + 'static {
    async fn notify(&self, notification: Notification) -> Result<(), NotifyError>;
}

/// Confirmation sent to the property owner once the registry accepts a batch.
pub fn submission_acknowledged(record: &CheckInRecord, attempt: u32, duplicate: bool) -> Notification {
    let subject = format!("Police Submission successful for {}", record.property_name);
    let note = if duplicate {
        " The registry already held this batch and reported it as a duplicate."
    } else {
        ""
    };
    let text_body = format!(
        "The guest registration for reservation {} (arrival {}) was accepted by SES.Hospedajes \
         on attempt {}.{}\n",
        record.reference,
        record.arrival.format("%Y-%m-%d %H:%M"),
        attempt,
        note
    );
    let html_body = format!(
        "<p>The guest registration for reservation <strong>{}</strong> (arrival {}) was accepted \
         by SES.Hospedajes on attempt {}.{}</p>",
        escape_html(&record.reference),
        record.arrival.format("%Y-%m-%d %H:%M"),
        attempt,
        note
    );

    Notification {
        recipient: record.owner_email.clone(),
        subject,
        html_body,
        text_body,
    }
}

// Terminal failure report sent to the property owner
pub fn submission_failed(record: &CheckInRecord, attempts: u32, last_error: &str) -> Notification {
    let subject = format!("Police Submission failed for {}", record.property_name);
    let text_body = format!(
        "The guest registration for reservation {} (arrival {}) could not be submitted \
         after {} attempt(s).\n\nLast error: {}\n",
        record.reference,
        record.arrival.format("%Y-%m-%d %H:%M"),
        attempts,
        last_error
    );
    let html_body = format!(
        "<p>The guest registration for reservation <strong>{}</strong> (arrival {}) could not be \
         submitted after {} attempt(s).</p><p>Last error: <code>{}</code></p>",
        escape_html(&record.reference),
        record.arrival.format("%Y-%m-%d %H:%M"),
        attempts,
        escape_html(last_error)
    );

    Notification {
        recipient: record.owner_email.clone(),
        subject,
        html_body,
        text_body,
    }
}

fn escape_html(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

// Stand-in for the mail service: writes the notification to the log
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notification: Notification) -> Result<(), NotifyError> {
        if notification.recipient.trim().is_empty() {
            return Err(NotifyError::MissingRecipient);
        }
        tracing::info!(
            recipient = %notification.recipient,
            subject = %notification.subject,
            "owner notification"
        );
        Ok(())
    }
}

// Keeps every notification in memory; used by tests and dry runs
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
    fail: bool,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notification: Notification) -> Result<(), NotifyError> {
        self.sent.lock().push(notification);
        if self.fail {
            return Err(NotifyError::Delivery("smtp unavailable".to_string()));
        }
        Ok(())
    }
}
