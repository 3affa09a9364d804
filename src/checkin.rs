// Check-in records: the read-only input of the submission pipeline
use chrono::{DateTime, FixedOffset, NaiveDate, Offset, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// ISO 3166-1 alpha-3 code of the registry's own country
pub const DOMESTIC_COUNTRY: &str = "ESP";

// Peninsular standard time (CET)
pub const DOMESTIC_UTC_OFFSET_SECS: i32 = 3600;

pub fn domestic_offset() -> FixedOffset {
    FixedOffset::east_opt(DOMESTIC_UTC_OFFSET_SECS).unwrap_or_else(|| Utc.fix())
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CheckInId(pub String);

impl CheckInId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CheckInId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CheckInId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentType {
    Passport,
    NationalId,
    ForeignId,
    Other,
}

impl DocumentType {
    // Fixed codes expected by the registry
    pub fn registry_code(self) -> &'static str {
        match self {
            DocumentType::Passport => "PAS",
            DocumentType::NationalId => "NIF",
            DocumentType::ForeignId => "NIE",
            DocumentType::Other => "OTR",
        }
    }

    // DNI and NIE cards carry a support number that the registry validates
    pub fn requires_support_number(self) -> bool {
        matches!(self, DocumentType::NationalId | DocumentType::ForeignId)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuestRole {
    Lead,
    #[default]
    Accompanying,
}

impl GuestRole {
    pub fn registry_code(self) -> &'static str {
        match self {
            GuestRole::Lead => "VI",
            GuestRole::Accompanying => "VG",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Gender {
    #[serde(rename = "M", alias = "male")]
    Male,
    #[serde(rename = "F", alias = "female")]
    Female,
    #[serde(rename = "O", alias = "other")]
    Other,
}

impl Gender {
    pub fn registry_code(self) -> &'static str {
        match self {
            Gender::Male => "M",
            Gender::Female => "F",
            Gender::Other => "O",
        }
    }
}

/// Lifecycle of the check-in itself, as seen by the pipeline.
///
/// Anything other than `Active` turns a pending scheduled task into a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckInState {
    #[default]
    Active,
    Cancelled,
    SubmittedManually,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuestRecord {
    pub first_name: String,
    pub first_surname: String,
    #[serde(default)]
    pub second_surname: Option<String>,
    pub document_type: DocumentType,
    pub document_number: String,
    #[serde(default)]
    pub support_number: Option<String>,
    pub date_of_birth: NaiveDate,
    pub nationality: String,
    pub country_of_residence: String,
    #[serde(default)]
    pub gender: Option<Gender>,
    pub address: String,
    pub postal_code: String,
    #[serde(default)]
    pub municipality_name: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub role: GuestRole,
}

impl GuestRecord {
    pub fn is_lead(&self) -> bool {
        self.role == GuestRole::Lead
    }

    pub fn is_domestic_national(&self) -> bool {
        self.nationality.eq_ignore_ascii_case(DOMESTIC_COUNTRY)
    }

    pub fn resides_in_country(&self) -> bool {
        self.country_of_residence
            .eq_ignore_ascii_case(DOMESTIC_COUNTRY)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckInRecord {
    pub id: CheckInId,
    pub reference: String,
    pub property_name: String,
    pub owner_email: String,
    pub lead_guest_email: String,
    // Arrival and departure carry the property's local offset
    pub arrival: DateTime<FixedOffset>,
    pub departure: DateTime<FixedOffset>,
    pub guest_count: u32,
    #[serde(default)]
    pub auto_submit: bool,
    #[serde(default)]
    pub state: CheckInState,
    pub guests: Vec<GuestRecord>,
}

impl CheckInRecord {
    pub fn lead_guest(&self) -> Option<&GuestRecord> {
        self.guests.iter().find(|g| g.is_lead())
    }

    pub fn lead_count(&self) -> usize {
        self.guests.iter().filter(|g| g.is_lead()).count()
    }

    pub fn arrival_date(&self) -> NaiveDate {
        self.arrival.date_naive()
    }

    pub fn is_eligible_for_submission(&self) -> bool {
        self.auto_submit && self.state == CheckInState::Active
    }
}
