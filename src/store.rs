// Source of check-in records
use crate::checkin::{CheckInId, CheckInRecord, CheckInState};
use async_trait::async_trait;
use chrono::NaiveDate;
use dashmap::DashMap;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Storage error: {0}")]
    Storage(String),
}

#[async_trait]
pub trait CheckInStore: Send + Sync + 'static {
    async fn get(&self, id: &CheckInId) -> Result<Option<CheckInRecord>, StoreError>;

    // Check-ins whose arrival falls on `date` in the property's local time
    async fn arriving_on(&self, date: NaiveDate) -> Result<Vec<CheckInRecord>, StoreError>;
}

#[derive(Debug, Default)]
pub struct InMemoryCheckInStore {
    records: DashMap<CheckInId, CheckInRecord>,
}

impl InMemoryCheckInStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record: CheckInRecord) {
        self.records.insert(record.id.clone(), record);
    }

    // Out-of-band update (cancellation, manual submission); returns false if unknown
    pub fn set_state(&self, id: &CheckInId, state: CheckInState) -> bool {
        match self.records.get_mut(id) {
            Some(mut record) => {
                record.state = state;
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl CheckInStore for InMemoryCheckInStore {
    async fn get(&self, id: &CheckInId) -> Result<Option<CheckInRecord>, StoreError> {
        Ok(self.records.get(id).map(|r| r.value().clone()))
    }

    async fn arriving_on(&self, date: NaiveDate) -> Result<Vec<CheckInRecord>, StoreError> {
        let mut found: Vec<CheckInRecord> = self
            .records
            .iter()
            .filter(|r| r.value().arrival_date() == date)
            .map(|r| r.value().clone())
            .collect();
        found.sort_by(|a, b| a.arrival.cmp(&b.arrival).then_with(|| a.id.cmp(&b.id)));
        Ok(found)
    }
}
