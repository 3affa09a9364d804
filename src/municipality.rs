// Municipality reference table used to fill address codes for in-country guests
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Municipality {
    pub code: String,
    pub name: String,
    pub province: String,
    pub postal_code: String,
}

#[derive(Error, Debug)]
pub enum MunicipalityError {
    #[error("Municipality table parse error: {0}")]
    Parse(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// Read-only lookup; a miss is a data problem of the guest, never a pipeline fault
pub trait MunicipalityLookup: Send + Sync {
    fn lookup(&self, postal_code: &str, name: Option<&str>) -> Option<Municipality>;
}

#[derive(Debug, Default, Clone)]
pub struct MunicipalityTable {
    by_postal_code: BTreeMap<String, Vec<Municipality>>,
}

impl MunicipalityTable {
    pub fn new(entries: Vec<Municipality>) -> Self {
        let mut by_postal_code: BTreeMap<String, Vec<Municipality>> = BTreeMap::new();
        for entry in entries {
            by_postal_code
                .entry(entry.postal_code.trim().to_string())
                .or_default()
                .push(entry);
        }
        Self { by_postal_code }
    }

    pub fn from_json(json: &str) -> Result<Self, MunicipalityError> {
        let entries: Vec<Municipality> =
            serde_json::from_str(json).map_err(|e| MunicipalityError::Parse(e.to_string()))?;
        Ok(Self::new(entries))
    }

    pub fn load(path: &std::path::Path) -> Result<Self, MunicipalityError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    pub fn len(&self) -> usize {
        self.by_postal_code.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_postal_code.is_empty()
    }
}

impl MunicipalityLookup for MunicipalityTable {
    fn lookup(&self, postal_code: &str, name: Option<&str>) -> Option<Municipality> {
        let candidates = self.by_postal_code.get(postal_code.trim())?;

        if let Some(name) = name {
            let name = name.trim().to_lowercase();
            if let Some(found) = candidates
                .iter()
                .find(|m| m.name.trim().to_lowercase() == name)
            {
                return Some(found.clone());
            }
        }

        // A postal code shared by several municipalities needs the name to disambiguate
        match candidates.as_slice() {
            [only] => Some(only.clone()),
            _ => None,
        }
    }
}
