//! Full exchange against a scripted server: session setup, card adoption,
//! StartPAOS, server-driven DIDAuthenticate and Transmit, ok termination.

use ecard::definitions::{
    result::minor, ByteHandle, FunctionType, ResultType, SalRequest, SalResponse,
};
use ecard::dispatch::{CardIo, SalService};
use ecard::protocol::{
    InternalData, ProtocolFactory, ProtocolRegistry, ProtocolStep, SalProtocol, StepFailure,
    StepRegistration,
};
use ecard::state::{CardInfo, CardStateRegistry, SessionManager};
use ecard::transport::envelope;
use ecard::transport::{DefaultValidator, HttpReply, Paos, PaosTransport, TransportError};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

const TEST_PROTOCOL: &str = "urn:oid:1.3.162.15480.3.0.14.2";

const OK_TERMINATION: &str = "<StartPAOSResponse>\
    <Result><ResultMajor>http://www.bsi.bund.de/ecard/api/1.1/resultmajor#ok</ResultMajor></Result>\
    </StartPAOSResponse>";

#[test]
fn full_exchange_with_authentication_and_transmit() {
    let registry = Arc::new(CardStateRegistry::new());
    let sessions = SessionManager::new(Arc::clone(&registry));

    // a floating session adopts the card recognized on this context
    let session = sessions.create_session();
    let ctx = ByteHandle::from(vec![0x01]);
    let entry_id = sessions
        .add_card(
            ctx.clone(),
            "Test Reader",
            0,
            CardInfo {
                card_type: "http://bsi.bund.de/cif/npa.xml".into(),
                implicit_application: Some(ByteHandle::from(vec![0x3F, 0x00])),
            },
        )
        .unwrap();
    let true_slot = ByteHandle::from(vec![0xAA, 0xBB]);
    assert!(registry.set_slot_handle(entry_id, true_slot.clone()));
    let handle = registry.entry_handle(entry_id).unwrap();

    let server = Arc::new(ScriptedServer::default());
    server.push(
        "<DIDAuthenticate>\
         <ConnectionHandle><SlotHandle>__SLOT__</SlotHandle></ConnectionHandle>\
         <DIDName>PIN</DIDName>\
         <AuthenticationProtocolData Protocol=\"urn:oid:1.3.162.15480.3.0.14.2\">\
         <Certificate>CAFE</Certificate>\
         </AuthenticationProtocolData>\
         </DIDAuthenticate>",
    );
    server.push(
        "<Transmit><SlotHandle>__SLOT__</SlotHandle>\
         <InputAPDUInfo><InputAPDU>00A40400</InputAPDU>\
         <AcceptableStatusCode>9000</AcceptableStatusCode></InputAPDUInfo>\
         </Transmit>",
    );
    server.push(OK_TERMINATION);

    let card = Arc::new(EchoCard::default());
    let mut protocols = ProtocolRegistry::new();
    protocols.register(Box::new(TestFactory));
    let service = SalService::new(Arc::clone(&registry), protocols, Box::new(EchoCardRef(
        Arc::clone(&card),
    )));

    let start = ecard::definitions::StartPaos {
        session_identifier: session.session_id.clone(),
        connection_handles: vec![handle],
        user_agent: None,
    };

    let mut paos = Paos::new(service, ServerRef(Arc::clone(&server)), DefaultValidator);
    let response = paos.send_start_paos(start).unwrap();
    assert!(response.result.is_ok());

    // the protocol ran to completion and marked the DID
    let authenticated = registry
        .with_entry_mut(entry_id, |e| e.is_authenticated("PIN"))
        .unwrap();
    assert!(authenticated);

    // the card saw the real command under its real slot handle
    let transmitted = card.commands.lock().clone();
    assert_eq!(transmitted, vec![vec![0x00, 0xA4, 0x04, 0x00]]);

    // outbound responses in order: DIDAuthenticateResponse, TransmitResponse
    let sent = server.sent.lock();
    assert_eq!(sent.len(), 3);
    let (_, second) = envelope::parse_envelope(sent[1].as_bytes()).unwrap();
    assert_eq!(second.name, "DIDAuthenticateResponse");
    let (_, third) = envelope::parse_envelope(sent[2].as_bytes()).unwrap();
    assert_eq!(third.name, "TransmitResponse");
    assert_eq!(third.find_text("OutputAPDU"), Some("00A404009000"));

    // the real slot handle never appeared on the wire
    let (_, start_body) = envelope::parse_envelope(sent[0].as_bytes()).unwrap();
    let wire_slot = start_body
        .find("ConnectionHandle")
        .and_then(|h| h.find_text("SlotHandle"))
        .unwrap();
    assert_ne!(wire_slot, true_slot.to_hex());
}

#[test]
fn out_of_sequence_operation_taints_the_exchange() {
    let registry = Arc::new(CardStateRegistry::new());
    let sessions = SessionManager::new(Arc::clone(&registry));
    let session = sessions.create_session();
    let ctx = ByteHandle::from(vec![0x02]);
    let entry_id = sessions
        .add_card(ctx, "Test Reader", 0, CardInfo::default())
        .unwrap();
    registry.set_slot_handle(entry_id, ByteHandle::from(vec![0xCC]));
    let handle = registry.entry_handle(entry_id).unwrap();

    let server = Arc::new(ScriptedServer::default());
    // Sign before any DIDAuthenticate: no active protocol on the entry
    server.push(
        "<Sign>\
         <ConnectionHandle><SlotHandle>__SLOT__</SlotHandle></ConnectionHandle>\
         <DIDName>PIN</DIDName><Message>0102</Message>\
         </Sign>",
    );
    server.push(OK_TERMINATION);

    let mut protocols = ProtocolRegistry::new();
    protocols.register(Box::new(TestFactory));
    let service = SalService::new(
        Arc::clone(&registry),
        protocols,
        Box::new(EchoCardRef(Arc::new(EchoCard::default()))),
    );

    let start = ecard::definitions::StartPaos {
        session_identifier: session.session_id,
        connection_handles: vec![handle],
        user_agent: None,
    };
    let mut paos = Paos::new(service, ServerRef(Arc::clone(&server)), DefaultValidator);
    let err = paos.send_start_paos(start).unwrap_err();

    // the error response we sent taints the ok termination
    assert_eq!(
        err.first_result_minor.as_deref(),
        Some(minor::INAPPROPRIATE_PROTOCOL_FOR_ACTION)
    );
}

struct OkStep(FunctionType);

impl ProtocolStep for OkStep {
    fn function_type(&self) -> FunctionType {
        self.0
    }

    fn perform(
        &self,
        request: &SalRequest,
        internal_data: &mut InternalData,
    ) -> Result<SalResponse, StepFailure> {
        if let SalRequest::DidAuthenticate(msg) = request {
            internal_data.insert(
                "certificate".into(),
                serde_json::json!(msg.authentication_protocol_data.entries.get("Certificate")),
            );
        }
        Ok(request.error_response(ResultType::ok()))
    }
}

struct TestFactory;

impl ProtocolFactory for TestFactory {
    fn protocol_uri(&self) -> &str {
        TEST_PROTOCOL
    }

    fn create(&self) -> SalProtocol {
        SalProtocol::new([StepRegistration::Ordered(Box::new(OkStep(
            FunctionType::DIDAuthenticate,
        )))])
    }
}

#[derive(Default)]
struct EchoCard {
    commands: Mutex<Vec<Vec<u8>>>,
}

struct EchoCardRef(Arc<EchoCard>);

impl CardIo for EchoCardRef {
    fn transmit(&self, _slot: &ByteHandle, command: &[u8]) -> anyhow::Result<Vec<u8>> {
        self.0.commands.lock().push(command.to_vec());
        let mut response = command.to_vec();
        response.extend_from_slice(&[0x90, 0x00]);
        Ok(response)
    }
}

/// Plays back scripted reply bodies, echoing the request's message id as
/// `RelatesTo` and substituting `__SLOT__` with the slot handle announced in
/// `StartPAOS`.
#[derive(Default)]
struct ScriptedServer {
    replies: Mutex<VecDeque<String>>,
    sent: Mutex<Vec<String>>,
    seen_slot: Mutex<Option<String>>,
    counter: AtomicU64,
}

impl ScriptedServer {
    fn push(&self, body: &str) {
        self.replies.lock().push_back(body.to_string());
    }
}

/// Local handle for the shared server, so the transport seam can be
/// implemented for it.
struct ServerRef(Arc<ScriptedServer>);

impl PaosTransport for ServerRef {
    fn exchange(&self, _paos_header: &str, body: &str) -> Result<HttpReply, TransportError> {
        self.0.sent.lock().push(body.to_string());
        let (header, parsed) = envelope::parse_envelope(body.as_bytes()).unwrap();
        if parsed.name == "StartPAOS" {
            *self.0.seen_slot.lock() = parsed
                .find("ConnectionHandle")
                .and_then(|h| h.find_text("SlotHandle"))
                .map(|s| s.to_string());
        }
        let reply_body = match self.0.replies.lock().pop_front() {
            Some(body) => body,
            None => return Err(TransportError::ConnectionLost),
        };
        let slot = self.0.seen_slot.lock().clone().unwrap_or_default();
        let n = self.0.counter.fetch_add(1, Ordering::Relaxed);
        let envelope = format!(
            "<soap:Envelope xmlns:soap=\"http://schemas.xmlsoap.org/soap/envelope/\">\
             <soap:Header>\
             <wsa:MessageID xmlns:wsa=\"x\">urn:uuid:server-{n}</wsa:MessageID>\
             <wsa:RelatesTo xmlns:wsa=\"x\">{relates}</wsa:RelatesTo>\
             </soap:Header>\
             <soap:Body>{body}</soap:Body>\
             </soap:Envelope>",
            relates = header.message_id.unwrap(),
            body = reply_body.replace("__SLOT__", &slot),
        );
        Ok(HttpReply {
            status: 202,
            body: envelope.into_bytes(),
        })
    }
}
