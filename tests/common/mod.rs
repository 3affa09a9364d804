#![allow(dead_code)]

use async_trait::async_trait;
use hospedajes_submission::{
    CheckInRecord, DocumentBuilder, DriverDeps, EnvelopePackager, InMemoryCheckInStore,
    InMemoryLedger, InMemoryTaskQueue, Municipality, MunicipalityTable, RetryPolicy,
    SchedulePolicy, SubmissionDriver, SubmissionOutcome, SubmissionTransport,
};
use hospedajes_submission::notify::RecordingNotifier;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

pub const ESTABLISHMENT: &str = "0000000123";
pub const LANDLORD: &str = "0000000042";

pub fn check_in(id: &str, arrival: &str) -> CheckInRecord {
    serde_json::from_value(serde_json::json!({
        "id": id,
        "reference": format!("RES-{id}"),
        "property_name": "Casa del Sol",
        "owner_email": "owner@example.com",
        "lead_guest_email": "lucia@example.com",
        "arrival": arrival,
        "departure": "2025-06-15T11:00:00+02:00",
        "guest_count": 2,
        "auto_submit": true,
        "guests": [
            {
                "first_name": "Lucía",
                "first_surname": "García",
                "second_surname": "Martín",
                "document_type": "national_id",
                "document_number": "12345678Z",
                "support_number": "CAA000000",
                "date_of_birth": "1985-03-14",
                "nationality": "ESP",
                "country_of_residence": "ESP",
                "gender": "F",
                "address": "Calle Mayor 1",
                "postal_code": "28013",
                "municipality_name": "Madrid",
                "role": "lead"
            },
            {
                "first_name": "John",
                "first_surname": "Smith",
                "document_type": "passport",
                "document_number": "X1234567",
                "date_of_birth": "1990-07-01",
                "nationality": "GBR",
                "country_of_residence": "GBR",
                "address": "1 High Street, London",
                "postal_code": "SW1A 1AA"
            }
        ]
    }))
    .unwrap()
}

pub fn municipalities() -> Arc<MunicipalityTable> {
    Arc::new(MunicipalityTable::new(vec![Municipality {
        code: "28079".to_string(),
        name: "Madrid".to_string(),
        province: "Madrid".to_string(),
        postal_code: "28013".to_string(),
    }]))
}

pub fn soap_response(code: &str, description: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<soapenv:Envelope xmlns:soapenv="http://schemas.xmlsoap.org/soap/envelope/">
  <soapenv:Body>
    <ns2:comunicacionResponse xmlns:ns2="http://www.soap.servicios.hospedajes.mir.es/comunicacion">
      <respuesta>
        <codigo>{code}</codigo>
        <descripcion>{description}</descripcion>
      </respuesta>
    </ns2:comunicacionResponse>
  </soapenv:Body>
</soapenv:Envelope>"#
    )
}

// Replays canned outcomes in order, then acknowledges every further call
pub struct ScriptedTransport {
    script: Mutex<VecDeque<SubmissionOutcome>>,
    envelopes: Mutex<Vec<String>>,
}

impl ScriptedTransport {
    pub fn new(script: Vec<SubmissionOutcome>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            envelopes: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.envelopes.lock().len()
    }

    pub fn envelopes(&self) -> Vec<String> {
        self.envelopes.lock().clone()
    }
}

#[async_trait]
impl SubmissionTransport for ScriptedTransport {
    async fn submit(&self, soap_envelope: &str) -> SubmissionOutcome {
        self.envelopes.lock().push(soap_envelope.to_string());
        self.script
            .lock()
            .pop_front()
            .unwrap_or_else(|| SubmissionOutcome::Acknowledged {
                code: "0".to_string(),
                duplicate: false,
                raw_response: soap_response("0", "Correcto"),
            })
    }
}

pub fn timeout() -> SubmissionOutcome {
    SubmissionOutcome::TransportFailure {
        status: None,
        message: "Request timed out after 30s".to_string(),
        raw_response: None,
    }
}

pub struct Harness {
    pub driver: Arc<SubmissionDriver>,
    pub store: Arc<InMemoryCheckInStore>,
    pub ledger: Arc<InMemoryLedger>,
    pub queue: Arc<InMemoryTaskQueue>,
    pub notifier: Arc<RecordingNotifier>,
    pub transport: Arc<ScriptedTransport>,
}

pub fn harness(script: Vec<SubmissionOutcome>) -> Harness {
    let store = Arc::new(InMemoryCheckInStore::new());
    let ledger = Arc::new(InMemoryLedger::new());
    let queue = Arc::new(InMemoryTaskQueue::new());
    let notifier = Arc::new(RecordingNotifier::new());
    let transport = Arc::new(ScriptedTransport::new(script));

    let driver = SubmissionDriver::new(
        DriverDeps {
            store: store.clone(),
            ledger: ledger.clone(),
            transport: transport.clone(),
            queue: queue.clone(),
            notifier: notifier.clone(),
        },
        DocumentBuilder::new(ESTABLISHMENT, municipalities()),
        EnvelopePackager::new(LANDLORD),
        RetryPolicy::default(),
        SchedulePolicy::default(),
    );

    Harness {
        driver: Arc::new(driver),
        store,
        ledger,
        queue,
        notifier,
        transport,
    }
}
