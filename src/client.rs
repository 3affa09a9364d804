// Submission client: authenticated SOAP call to the registry and response classification
use async_trait::async_trait;
use quick_xml::events::Event;
use quick_xml::reader::Reader;
use reqwest::header::CONTENT_TYPE;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub const SOAP_ACTION: &str =
    "http://www.soap.servicios.hospedajes.mir.es/comunicacion/comunicacionRequest";
pub const SOAP_CONTENT_TYPE: &str = "text/xml; charset=UTF-8";

// Domain codes the registry uses for an accepted batch
pub const SUCCESS_CODE: &str = "0";
pub const DUPLICATE_BATCH_CODE: &str = "10121";

// Sandbox and production disagree on element names, so several are accepted
const CODE_TAGS: &[&str] = &["codigo", "codigoRetorno", "codigoError"];
const MESSAGE_TAGS: &[&str] = &["descripcion", "mensaje", "descripcionError", "faultstring"];

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Client certificate error: {0}")]
    Identity(String),

    #[error("I/O error reading {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsIdentity {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

#[derive(Clone)]
pub struct ClientConfig {
    pub endpoint: String,
    pub username: String,
    pub password: String,
    pub identity: Option<TlsIdentity>,
    pub timeout: Duration,
}

impl ClientConfig {
    pub fn new(
        endpoint: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            username: username.into(),
            password: password.into(),
            identity: None,
            timeout: Duration::from_secs(30),
        }
    }
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("endpoint", &self.endpoint)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .field("identity", &self.identity)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Result of one call to the registry.
///
/// Failures are values here, not errors: the driver decides what to retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmissionOutcome {
    Acknowledged {
        code: String,
        duplicate: bool,
        raw_response: String,
    },
    DomainFailure {
        code: Option<String>,
        message: String,
        raw_response: String,
    },
    TransportFailure {
        status: Option<u16>,
        message: String,
        raw_response: Option<String>,
    },
}

impl SubmissionOutcome {
    pub fn is_acknowledged(&self) -> bool {
        matches!(self, SubmissionOutcome::Acknowledged { .. })
    }

    pub fn error_code(&self) -> Option<&str> {
        match self {
            SubmissionOutcome::DomainFailure { code, .. } => code.as_deref(),
            _ => None,
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            SubmissionOutcome::Acknowledged { .. } => None,
            SubmissionOutcome::DomainFailure { message, .. }
            | SubmissionOutcome::TransportFailure { message, .. } => Some(message),
        }
    }

    pub fn raw_response(&self) -> Option<&str> {
        match self {
            SubmissionOutcome::Acknowledged { raw_response, .. }
            | SubmissionOutcome::DomainFailure { raw_response, .. } => Some(raw_response),
            SubmissionOutcome::TransportFailure { raw_response, .. } => raw_response.as_deref(),
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ScannedResponse {
    pub code: Option<String>,
    pub message: Option<String>,
}

// Lenient extraction of the domain code and description from a registry response.
// Matches local element names only and never fails: whatever cannot be read stays None.
pub struct ResponseScanner;

impl ResponseScanner {
    pub fn scan(body: &str) -> ScannedResponse {
        let mut scanned = ScannedResponse::default();
        let mut reader = Reader::from_str(body);
        reader.config_mut().trim_text(true);

        loop {
            match reader.read_event() {
                Ok(Event::Start(e)) => {
                    let local = e.local_name();
                    let local = String::from_utf8_lossy(local.as_ref()).to_string();
                    let wants_code = scanned.code.is_none() && CODE_TAGS.contains(&local.as_str());
                    let wants_message =
                        scanned.message.is_none() && MESSAGE_TAGS.contains(&local.as_str());
                    if !wants_code && !wants_message {
                        continue;
                    }

                    let text = match reader.read_text(e.name()) {
                        Ok(text) => text.trim().to_string(),
                        Err(_) => break,
                    };
                    if wants_code {
                        scanned.code = Some(text);
                    } else {
                        scanned.message = Some(text);
                    }
                }
                Ok(Event::Eof) => break,
                // Malformed documents fall through to the substring scan below
                Err(_) => break,
                _ => (),
            }

            if scanned.code.is_some() && scanned.message.is_some() {
                break;
            }
        }

        if scanned.code.is_none() {
            scanned.code = CODE_TAGS.iter().find_map(|tag| substring_tag(body, tag));
        }
        if scanned.message.is_none() {
            scanned.message = MESSAGE_TAGS.iter().find_map(|tag| substring_tag(body, tag));
        }
        scanned
    }
}

// Text of the first `<tag>` or `<prefix:tag>` element, found by plain substring search
fn substring_tag(body: &str, tag: &str) -> Option<String> {
    let needle = format!("{}>", tag);
    let mut offset = 0;

    while let Some(found) = body[offset..].find(&needle) {
        let start = offset + found;
        let content_start = start + needle.len();
        offset = content_start;

        let opening = body[..start]
            .rfind('<')
            .map(|lt| &body[lt + 1..start])
            .filter(|prefix| !prefix.starts_with('/'))
            .map(|prefix| prefix.is_empty() || (prefix.ends_with(':') && !prefix.contains(char::is_whitespace)));
        if opening != Some(true) {
            continue;
        }

        let content_end = body[content_start..]
            .find('<')
            .map(|i| content_start + i)
            .unwrap_or(body.len());
        return Some(body[content_start..content_end].trim().to_string());
    }
    None
}

// Longest body excerpt carried into an error message
const DETAIL_LIMIT: usize = 200;

// What the response says went wrong: the scanned description, else the start of the body
fn failure_detail(scanned: &ScannedResponse, body: &str) -> Option<String> {
    if let Some(message) = scanned.message.as_deref().filter(|m| !m.is_empty()) {
        return Some(message.to_string());
    }
    let body = body.trim();
    if body.is_empty() {
        return None;
    }
    match body.char_indices().nth(DETAIL_LIMIT) {
        Some((cut, _)) => Some(format!("{}...", &body[..cut])),
        None => Some(body.to_string()),
    }
}

pub fn classify_response(status: u16, body: &str) -> SubmissionOutcome {
    let scanned = ResponseScanner::scan(body);

    if status != 200 {
        let message = match failure_detail(&scanned, body) {
            Some(detail) => format!("HTTP Error {}: {}", status, detail),
            None => format!("HTTP Error {}", status),
        };
        return SubmissionOutcome::TransportFailure {
            status: Some(status),
            message,
            raw_response: Some(body.to_string()),
        };
    }

    match scanned.code.as_deref() {
        Some(SUCCESS_CODE) => SubmissionOutcome::Acknowledged {
            code: SUCCESS_CODE.to_string(),
            duplicate: false,
            raw_response: body.to_string(),
        },
        Some(DUPLICATE_BATCH_CODE) => SubmissionOutcome::Acknowledged {
            code: DUPLICATE_BATCH_CODE.to_string(),
            duplicate: true,
            raw_response: body.to_string(),
        },
        Some(code) => SubmissionOutcome::DomainFailure {
            code: Some(code.to_string()),
            message: format!(
                "SES Error {}: {}",
                code,
                scanned.message.as_deref().unwrap_or("no description")
            ),
            raw_response: body.to_string(),
        },
        // SOAP faults carry a faultstring but no domain code
        None => SubmissionOutcome::DomainFailure {
            code: None,
            message: match scanned.message.as_deref().filter(|m| !m.is_empty()) {
                Some(message) => format!("SES Fault: {}", message),
                None => "Unparseable registry response".to_string(),
            },
            raw_response: body.to_string(),
        },
    }
}

// Transport seam between the driver and the registry
#[async_trait]
pub trait SubmissionTransport: Send + Sync + 'static {
    async fn submit(&self, soap_envelope: &str) -> SubmissionOutcome;
}

#[derive(Debug, Clone)]
pub struct SesClient {
    http: reqwest::Client,
    endpoint: String,
    username: String,
    password: String,
    timeout: Duration,
}

impl SesClient {
    pub fn new(config: ClientConfig) -> Result<Self, TransportError> {
        let mut builder = reqwest::Client::builder().timeout(config.timeout);

        if let Some(identity) = &config.identity {
            builder = builder.identity(load_identity(identity)?);
        }

        let http = builder.build()?;
        Ok(Self {
            http,
            endpoint: config.endpoint,
            username: config.username,
            password: config.password,
            timeout: config.timeout,
        })
    }
}

// reqwest expects certificate and private key in one PEM buffer
fn load_identity(identity: &TlsIdentity) -> Result<reqwest::Identity, TransportError> {
    let read = |path: &PathBuf| {
        std::fs::read(path).map_err(|source| TransportError::Io {
            path: path.clone(),
            source,
        })
    };

    let mut pem = read(&identity.cert_path)?;
    pem.push(b'\n');
    pem.extend(read(&identity.key_path)?);

    reqwest::Identity::from_pem(&pem).map_err(|e| TransportError::Identity(e.to_string()))
}

#[async_trait]
impl SubmissionTransport for SesClient {
    async fn submit(&self, soap_envelope: &str) -> SubmissionOutcome {
        let response = self
            .http
            .post(&self.endpoint)
            .header(CONTENT_TYPE, SOAP_CONTENT_TYPE)
            .header("SOAPAction", SOAP_ACTION)
            .basic_auth(&self.username, Some(&self.password))
            .body(soap_envelope.to_string())
            .send()
            .await;

        let response = match response {
            Ok(response) => response,
            Err(e) if e.is_timeout() => {
                tracing::warn!(endpoint = %self.endpoint, "registry request timed out");
                return SubmissionOutcome::TransportFailure {
                    status: None,
                    message: format!("Request timed out after {}s", self.timeout.as_secs()),
                    raw_response: None,
                };
            }
            Err(e) => {
                tracing::warn!(endpoint = %self.endpoint, error = %e, "registry request failed");
                return SubmissionOutcome::TransportFailure {
                    status: None,
                    message: format!("Network error: {}", e),
                    raw_response: None,
                };
            }
        };

        let status = response.status().as_u16();
        match response.text().await {
            Ok(body) => classify_response(status, &body),
            Err(e) => SubmissionOutcome::TransportFailure {
                status: Some(status),
                message: format!("Failed to read response body: {}", e),
                raw_response: None,
            },
        }
    }
}
