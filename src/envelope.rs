// Envelope packager: zip the registration document, Base64 it and wrap it in the SOAP request
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use std::io::{Cursor, Read, Write};
use thiserror::Error;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

pub const COMMUNICATION_NAMESPACE: &str = "http://www.soap.servicios.hospedajes.mir.es/comunicacion";
pub const ARCHIVE_ENTRY_NAME: &str = "parte.xml";
pub const APPLICATION_NAME: &str = "TuriCheck";
// "A" registers new guest data ("alta")
pub const OPERATION_REGISTER: &str = "A";
// "PV" is the guest registration ("parte de viajeros") communication type
pub const COMMUNICATION_GUEST_REPORT: &str = "PV";

// Packaging failures point at a defect in our own code, so they are fatal
#[derive(Error, Debug)]
pub enum PackagingError {
    #[error("Archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Base64 decode error: {0}")]
    Decode(#[from] base64::DecodeError),

    #[error("Envelope does not contain a request payload")]
    MissingPayload,

    #[error("Archive does not contain {0}")]
    MissingEntry(&'static str),
}

#[derive(Debug, Clone)]
pub struct PackagedEnvelope {
    pub archive: Bytes,
    pub encoded: String,
    pub soap: String,
}

#[derive(Debug, Clone)]
pub struct EnvelopePackager {
    landlord_code: String,
    operation: &'static str,
}

impl EnvelopePackager {
    pub fn new(landlord_code: impl Into<String>) -> Self {
        Self {
            landlord_code: landlord_code.into(),
            operation: OPERATION_REGISTER,
        }
    }

    pub fn package(&self, xml: &str) -> Result<PackagedEnvelope, PackagingError> {
        let archive = compress(xml.as_bytes())?;
        let encoded = STANDARD.encode(&archive);
        let soap = self.soap_envelope(&encoded);

        Ok(PackagedEnvelope {
            archive: Bytes::from(archive),
            encoded,
            soap,
        })
    }

    fn soap_envelope(&self, encoded: &str) -> String {
        format!(
            r#"<soapenv:Envelope xmlns:soapenv="http://schemas.xmlsoap.org/soap/envelope/" xmlns:com="{namespace}">
  <soapenv:Header/>
  <soapenv:Body>
    <com:comunicacionRequest>
      <peticion>
        <cabecera>
          <codigoArrendador>{landlord}</codigoArrendador>
          <aplicacion>{application}</aplicacion>
          <tipoOperacion>{operation}</tipoOperacion>
          <tipoComunicacion>{communication}</tipoComunicacion>
        </cabecera>
        <solicitud><![CDATA[{encoded}]]></solicitud>
      </peticion>
    </com:comunicacionRequest>
  </soapenv:Body>
</soapenv:Envelope>"#,
            namespace = COMMUNICATION_NAMESPACE,
            landlord = self.landlord_code,
            application = APPLICATION_NAME,
            operation = self.operation,
            communication = COMMUNICATION_GUEST_REPORT,
            encoded = encoded,
        )
    }
}

// Single deflated entry with a fixed timestamp so equal input gives equal bytes
fn compress(content: &[u8]) -> Result<Vec<u8>, PackagingError> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .last_modified_time(zip::DateTime::default());

    writer.start_file(ARCHIVE_ENTRY_NAME, options)?;
    writer.write_all(content)?;
    let cursor = writer.finish()?;
    Ok(cursor.into_inner())
}

// Inverse of `package`, used when auditing a stored request
pub fn unpack(soap: &str) -> Result<String, PackagingError> {
    let start = soap
        .find("<![CDATA[")
        .map(|i| i + "<![CDATA[".len())
        .ok_or(PackagingError::MissingPayload)?;
    let end = soap[start..]
        .find("]]>")
        .map(|i| start + i)
        .ok_or(PackagingError::MissingPayload)?;

    decode_payload(soap[start..end].trim())
}

pub fn decode_payload(encoded: &str) -> Result<String, PackagingError> {
    let archive = STANDARD.decode(encoded)?;
    let mut zip = ZipArchive::new(Cursor::new(archive))?;
    let mut entry = zip
        .by_name(ARCHIVE_ENTRY_NAME)
        .map_err(|_| PackagingError::MissingEntry(ARCHIVE_ENTRY_NAME))?;

    let mut xml = String::new();
    entry.read_to_string(&mut xml)?;
    Ok(xml)
}
