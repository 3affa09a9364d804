// Document builder: renders a check-in into the registry's guest registration XML
use crate::checkin::{CheckInRecord, DocumentType, GuestRecord};
use crate::municipality::MunicipalityLookup;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

pub const REGISTRATION_NAMESPACE: &str = "http://www.neg.hospedajes.mir.es/altaParteHospedaje";
pub const XML_DECLARATION: &str = r#"<?xml version="1.0" encoding="UTF-8"?>"#;

const DATE_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";
const DATE_FORMAT: &str = "%Y-%m-%d";

// Malformed or incomplete guest data. Never retried: the operator has to fix the record.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DataError {
    #[error("Declared {declared} guests but {actual} guest records were provided")]
    GuestCountMismatch { declared: u32, actual: usize },

    #[error("Expected exactly one lead guest, found {0}")]
    LeadGuestCount(usize),

    #[error("Departure must be after arrival")]
    InvalidStay,

    #[error("Guest #{guest}: missing required field {field}")]
    MissingField { guest: usize, field: &'static str },

    #[error("Guest #{guest}: {document} documents require a support number")]
    MissingSupportNumber { guest: usize, document: &'static str },

    #[error("Guest #{guest}: foreign nationals ({nationality}) must register with a passport")]
    PassportRequired { guest: usize, nationality: String },

    #[error("Guest #{guest}: domestic nationals must register with a DNI or NIE")]
    NationalDocumentRequired { guest: usize },

    #[error("Guest #{guest}: no municipality found for postal code {postal_code}")]
    MunicipalityNotFound { guest: usize, postal_code: String },

    #[error("XML serialization error: {0}")]
    Serialization(String),
}

// Structures for XML serialization
#[derive(Debug, PartialEq, Serialize)]
#[serde(rename = "alt:peticion")]
pub struct XmlPeticion {
    #[serde(rename = "@xmlns:alt")]
    pub namespace: String,
    pub solicitud: XmlSolicitud,
}

#[derive(Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct XmlSolicitud {
    pub codigo_establecimiento: String,
    pub comunicacion: XmlComunicacion,
}

#[derive(Debug, PartialEq, Serialize)]
pub struct XmlComunicacion {
    pub contrato: XmlContrato,
    #[serde(rename = "persona")]
    pub personas: Vec<XmlPersona>,
}

#[derive(Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct XmlContrato {
    pub referencia: String,
    pub fecha_entrada: String,
    pub fecha_salida: String,
    pub num_personas: u32,
}

#[derive(Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct XmlPersona {
    pub rol: &'static str,
    pub nombre: String,
    pub apellido1: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub apellido2: Option<String>,
    pub tipo_documento: &'static str,
    pub numero_documento: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub soporte_documento: Option<String>,
    pub fecha_nacimiento: String,
    pub nacionalidad: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sexo: Option<&'static str>,
    pub direccion: XmlDireccion,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub telefono: Option<String>,
    pub correo: String,
}

#[derive(Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct XmlDireccion {
    pub direccion: String,
    pub codigo_postal: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub codigo_municipio: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nombre_municipio: Option<String>,
    pub pais: String,
}

#[derive(Clone)]
pub struct DocumentBuilder {
    establishment_code: String,
    municipalities: Arc<dyn MunicipalityLookup>,
}

impl DocumentBuilder {
    pub fn new(
        establishment_code: impl Into<String>,
        municipalities: Arc<dyn MunicipalityLookup>,
    ) -> Self {
        Self {
            establishment_code: establishment_code.into(),
            municipalities,
        }
    }

    /// Render the registration document for a check-in.
    ///
    /// Pure: the same record always yields the same bytes, which the registry's
    /// duplicate detection depends on.
    pub fn build(&self, record: &CheckInRecord) -> Result<String, DataError> {
        let peticion = self.to_xml_model(record)?;
        let body = quick_xml::se::to_string(&peticion)
            .map_err(|e| DataError::Serialization(e.to_string()))?;

        let mut xml = String::with_capacity(XML_DECLARATION.len() + body.len());
        xml.push_str(XML_DECLARATION);
        xml.push_str(&body);
        Ok(xml)
    }

    pub fn to_xml_model(&self, record: &CheckInRecord) -> Result<XmlPeticion, DataError> {
        validate_stay(record)?;

        let personas = record
            .guests
            .iter()
            .enumerate()
            .map(|(index, guest)| self.persona(index + 1, guest, &record.lead_guest_email))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(XmlPeticion {
            namespace: REGISTRATION_NAMESPACE.to_string(),
            solicitud: XmlSolicitud {
                codigo_establecimiento: self.establishment_code.clone(),
                comunicacion: XmlComunicacion {
                    contrato: XmlContrato {
                        referencia: record.reference.clone(),
                        fecha_entrada: record
                            .arrival
                            .naive_local()
                            .format(DATE_TIME_FORMAT)
                            .to_string(),
                        fecha_salida: record
                            .departure
                            .naive_local()
                            .format(DATE_TIME_FORMAT)
                            .to_string(),
                        num_personas: record.guest_count,
                    },
                    personas,
                },
            },
        })
    }

    fn persona(
        &self,
        position: usize,
        guest: &GuestRecord,
        contact_email: &str,
    ) -> Result<XmlPersona, DataError> {
        validate_guest(position, guest)?;

        let (codigo_municipio, nombre_municipio) = if guest.resides_in_country() {
            let municipality = self
                .municipalities
                .lookup(&guest.postal_code, guest.municipality_name.as_deref())
                .ok_or_else(|| DataError::MunicipalityNotFound {
                    guest: position,
                    postal_code: guest.postal_code.clone(),
                })?;
            (Some(municipality.code), Some(municipality.name))
        } else {
            (None, None)
        };

        Ok(XmlPersona {
            rol: guest.role.registry_code(),
            nombre: guest.first_name.trim().to_string(),
            apellido1: guest.first_surname.trim().to_string(),
            apellido2: non_blank(guest.second_surname.as_deref()),
            tipo_documento: guest.document_type.registry_code(),
            numero_documento: guest.document_number.trim().to_uppercase(),
            soporte_documento: non_blank(guest.support_number.as_deref()),
            fecha_nacimiento: guest.date_of_birth.format(DATE_FORMAT).to_string(),
            nacionalidad: guest.nationality.trim().to_uppercase(),
            sexo: guest.gender.map(|g| g.registry_code()),
            direccion: XmlDireccion {
                direccion: guest.address.trim().to_string(),
                codigo_postal: guest.postal_code.trim().to_string(),
                codigo_municipio,
                nombre_municipio,
                pais: guest.country_of_residence.trim().to_uppercase(),
            },
            telefono: non_blank(guest.phone.as_deref()),
            correo: contact_email.trim().to_string(),
        })
    }
}

fn validate_stay(record: &CheckInRecord) -> Result<(), DataError> {
    if record.guests.len() != record.guest_count as usize {
        return Err(DataError::GuestCountMismatch {
            declared: record.guest_count,
            actual: record.guests.len(),
        });
    }

    let leads = record.lead_count();
    if leads != 1 {
        return Err(DataError::LeadGuestCount(leads));
    }

    if record.departure <= record.arrival {
        return Err(DataError::InvalidStay);
    }

    Ok(())
}

fn validate_guest(position: usize, guest: &GuestRecord) -> Result<(), DataError> {
    let required = [
        ("first_name", guest.first_name.as_str()),
        ("first_surname", guest.first_surname.as_str()),
        ("document_number", guest.document_number.as_str()),
        ("nationality", guest.nationality.as_str()),
        ("country_of_residence", guest.country_of_residence.as_str()),
        ("address", guest.address.as_str()),
        ("postal_code", guest.postal_code.as_str()),
    ];
    if let Some((field, _)) = required.iter().find(|(_, value)| value.trim().is_empty()) {
        return Err(DataError::MissingField {
            guest: position,
            field: *field,
        });
    }

    if guest.is_domestic_national() {
        if !guest.document_type.requires_support_number() {
            return Err(DataError::NationalDocumentRequired { guest: position });
        }
    } else if guest.document_type != DocumentType::Passport {
        return Err(DataError::PassportRequired {
            guest: position,
            nationality: guest.nationality.clone(),
        });
    }

    if guest.document_type.requires_support_number()
        && non_blank(guest.support_number.as_deref()).is_none()
    {
        return Err(DataError::MissingSupportNumber {
            guest: position,
            document: guest.document_type.registry_code(),
        });
    }

    Ok(())
}

fn non_blank(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}
