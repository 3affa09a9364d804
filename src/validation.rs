// Credential check: sends a throwaway registration to confirm the account and
// establishment codes are accepted before any real guest data goes out
use crate::checkin::{CheckInId, CheckInRecord, CheckInState, DocumentType, GuestRecord, GuestRole};
use crate::client::{SubmissionOutcome, SubmissionTransport};
use crate::document::{DataError, DocumentBuilder};
use crate::envelope::EnvelopePackager;
use crate::error::PipelineError;
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveTime, TimeDelta, TimeZone};

// Fixed so that repeated checks hit the registry's duplicate detection
pub const CHECK_REFERENCE: &str = "PRUEBA-CONEXION-001";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialCheck {
    pub valid: bool,
    pub message: String,
    pub outcome: SubmissionOutcome,
}

pub struct ConnectionCheck {
    builder: DocumentBuilder,
    packager: EnvelopePackager,
}

impl ConnectionCheck {
    pub fn new(builder: DocumentBuilder, packager: EnvelopePackager) -> Self {
        Self { builder, packager }
    }

    /// One-guest stay arriving tomorrow at 14:00 and leaving three days later.
    /// The guest lives abroad, so no municipality lookup is involved.
    pub fn check_record(today: NaiveDate, offset: FixedOffset) -> Result<CheckInRecord, DataError> {
        let arrival_day = today + TimeDelta::days(1);
        let arrival = local(arrival_day, 14, offset)?;
        let departure = local(arrival_day + TimeDelta::days(3), 11, offset)?;

        Ok(CheckInRecord {
            id: CheckInId::new("connection-check"),
            reference: CHECK_REFERENCE.to_string(),
            property_name: "Connection check".to_string(),
            owner_email: String::new(),
            lead_guest_email: String::new(),
            arrival,
            departure,
            guest_count: 1,
            auto_submit: false,
            state: CheckInState::Active,
            guests: vec![GuestRecord {
                first_name: "Prueba".to_string(),
                first_surname: "Conexion".to_string(),
                second_surname: None,
                document_type: DocumentType::Passport,
                document_number: "X0000000".to_string(),
                support_number: None,
                date_of_birth: NaiveDate::from_ymd_opt(1990, 1, 1).ok_or(DataError::InvalidStay)?,
                nationality: "PRT".to_string(),
                country_of_residence: "PRT".to_string(),
                gender: None,
                address: "Rua Augusta 1, Lisboa".to_string(),
                postal_code: "1100-053".to_string(),
                municipality_name: None,
                phone: None,
                role: GuestRole::Lead,
            }],
        })
    }

    pub async fn run(
        &self,
        transport: &dyn SubmissionTransport,
        today: NaiveDate,
        offset: FixedOffset,
    ) -> Result<CredentialCheck, PipelineError> {
        let record = Self::check_record(today, offset)?;
        let xml = self.builder.build(&record)?;
        let envelope = self.packager.package(&xml)?;

        let outcome = transport.submit(&envelope.soap).await;
        let check = match outcome.error_message() {
            None => CredentialCheck {
                valid: true,
                message: "Valid SES credentials".to_string(),
                outcome,
            },
            Some(error) => CredentialCheck {
                valid: false,
                message: error.to_string(),
                outcome,
            },
        };

        if check.valid {
            tracing::info!("registry accepted the connection check");
        } else {
            tracing::warn!(error = %check.message, "registry rejected the connection check");
        }
        Ok(check)
    }
}

fn local(day: NaiveDate, hour: u32, offset: FixedOffset) -> Result<DateTime<FixedOffset>, DataError> {
    let time = NaiveTime::from_hms_opt(hour, 0, 0).ok_or(DataError::InvalidStay)?;
    offset
        .from_local_datetime(&day.and_time(time))
        .single()
        .ok_or(DataError::InvalidStay)
}
