//! The PAOS exchange loop.
//!
//! PAOS inverts the usual SOAP roles: this client opens the connection and
//! POSTs, but the server issues the requests. [`Paos::send_start_paos`] sends
//! the opening message and then answers every server request through the
//! dispatcher until the server terminates the exchange with a
//! `StartPAOSResponse`.

use super::correlator::MessageIdGenerator;
use super::envelope::{
    self, EnvelopeError, EnvelopeHeader, Inbound, Outbound, XmlElement,
};
use super::http::{paos_header_value, HttpReply, PaosTransport, TransportError};
use super::validator::{SchemaValidator, ValidationError};
use crate::definitions::{
    check_result, result::minor, AuthenticationProtocolData, ByteHandle, DidAuthenticate,
    DidAuthenticateResponse, Hash, ResultError, ResultType, SalRequest, SalResponse, Sign,
    StartPaos, StartPaosResponse, Transmit,
};
use crate::dispatch::{DispatchError, Dispatcher};
use std::collections::BTreeMap;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum PaosErrorKind {
    #[error("message id correlation failed: {0}")]
    MessageIdMismatch(String),
    #[error(transparent)]
    SchemaValidation(#[from] ValidationError),
    #[error("message delivery failed after retry")]
    DeliveryFailed(#[source] TransportError),
    #[error("server rejected the exchange with HTTP status {0}")]
    HttpStatusRejected(u16),
    #[error(transparent)]
    Dispatcher(#[from] DispatchError),
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
    #[error(transparent)]
    Result(#[from] ResultError),
}

/// A failed PAOS exchange.
#[derive(Debug, thiserror::Error)]
#[error("{kind}")]
pub struct PaosError {
    pub kind: PaosErrorKind,
    /// Minor code of the first non-ok result this client reported during the
    /// exchange, kept as diagnostic context for the failure.
    pub first_result_minor: Option<String>,
}

fn fail(kind: PaosErrorKind, first_result_minor: Option<String>) -> PaosError {
    PaosError {
        kind,
        first_result_minor,
    }
}

/// Drives one PAOS exchange against a remote server.
pub struct Paos<D, T, V> {
    dispatcher: D,
    transport: T,
    validator: V,
    ids: MessageIdGenerator,
}

impl<D: Dispatcher, T: PaosTransport, V: SchemaValidator> Paos<D, T, V> {
    pub fn new(dispatcher: D, transport: T, validator: V) -> Self {
        Paos {
            dispatcher,
            transport,
            validator,
            ids: MessageIdGenerator::new(),
        }
    }

    /// Runs the exchange to completion: sends `StartPAOS`, answers every
    /// server request, and returns the terminal `StartPAOSResponse`.
    ///
    /// Real slot handles never leave the client; an exchange-scoped
    /// substitute takes their place and inbound handles are mapped back
    /// before dispatch.
    pub fn send_start_paos(&mut self, mut start: StartPaos) -> Result<StartPaosResponse, PaosError> {
        let services = self.dispatcher.service_names();
        let paos_header = paos_header_value(&services);
        let mut exchange = ExchangeContext::new();
        exchange.conceal(&mut start);

        let mut first_minor: Option<String> = None;
        let mut pending_validation: Option<ValidationError> = None;
        let mut last_sent_result: Option<ResultType> = None;
        let mut outbound = Outbound::Start(start);

        loop {
            let relates_to = self.ids.remote_id().map(str::to_string);
            let reply = match self.deliver(&outbound, relates_to.as_deref(), &services, &paos_header)
            {
                Ok(reply) => reply,
                Err(e) => {
                    return Err(fail(PaosErrorKind::DeliveryFailed(e), first_minor));
                }
            };

            match reply.status {
                202 => {}
                200 => warn!("server answered 200 where 202 was expected"),
                status => {
                    // a status rejection after we reported an error usually
                    // is the server reacting to that error; report ours
                    if let Some(result) = &last_sent_result {
                        if let Err(e) = check_result(result) {
                            return Err(fail(PaosErrorKind::Result(e), first_minor));
                        }
                    }
                    return Err(fail(PaosErrorKind::HttpStatusRejected(status), first_minor));
                }
            }

            let (header, body) = match envelope::parse_envelope(&reply.body) {
                Ok(parsed) => parsed,
                Err(e) => return Err(fail(PaosErrorKind::Envelope(e), first_minor)),
            };
            if let Err(kind) = self.correlate(&header) {
                return Err(fail(kind, first_minor));
            }

            if let Err(validation_error) = self.validator.validate(&body) {
                warn!(error = %validation_error, message = %body.name, "inbound message failed validation");
                if pending_validation.is_none() {
                    pending_validation = Some(validation_error.clone());
                }
                if body.name == "DIDAuthenticate" {
                    // answer with an error response so the server can
                    // terminate the exchange; the failure is surfaced once
                    // it does
                    let response = synthesized_did_response(&body, &validation_error);
                    note_result(&mut first_minor, response.result());
                    last_sent_result = Some(response.result().clone());
                    outbound = Outbound::Response(response);
                    continue;
                }
                return Err(fail(
                    PaosErrorKind::SchemaValidation(validation_error),
                    first_minor,
                ));
            }

            match envelope::decode_message(&body) {
                Ok(Inbound::StartPaosResponse(response)) => {
                    debug!("received terminal StartPAOSResponse");
                    if let Some(validation_error) = pending_validation {
                        return Err(fail(
                            PaosErrorKind::SchemaValidation(validation_error),
                            first_minor,
                        ));
                    }
                    if let Some(result) = &last_sent_result {
                        if let Err(e) = check_result(result) {
                            return Err(fail(PaosErrorKind::Result(e), first_minor));
                        }
                    }
                    if let Err(e) = check_result(&response.result) {
                        return Err(fail(PaosErrorKind::Result(e), first_minor));
                    }
                    return Ok(response);
                }
                Ok(Inbound::Request(mut request)) => {
                    exchange.restore(&mut request);
                    debug!(function = %request.function_type(), "dispatching server request");
                    let response = match self.dispatcher.deliver(&request) {
                        Ok(response) => response,
                        Err(e) => {
                            return Err(fail(PaosErrorKind::Dispatcher(e), first_minor));
                        }
                    };
                    note_result(&mut first_minor, response.result());
                    last_sent_result = Some(response.result().clone());
                    outbound = Outbound::Response(response);
                }
                Err(e) => return Err(fail(PaosErrorKind::Envelope(e), first_minor)),
            }
        }
    }

    /// Marshals and posts one message, retrying once on a fresh connection.
    /// The retry is re-marshalled under a new message id.
    fn deliver(
        &mut self,
        message: &Outbound,
        relates_to: Option<&str>,
        services: &[String],
        paos_header: &str,
    ) -> Result<HttpReply, TransportError> {
        let body = envelope::marshal(message, &self.ids.new_local_id(), relates_to, services);
        self.check_outbound(&body);
        match self.transport.exchange(paos_header, &body) {
            Ok(reply) => Ok(reply),
            Err(first) => {
                warn!(error = %first, "delivery failed, retrying once");
                let body =
                    envelope::marshal(message, &self.ids.new_local_id(), relates_to, services);
                match self.transport.exchange(paos_header, &body) {
                    Ok(reply) => Ok(reply),
                    Err(_) => Err(first),
                }
            }
        }
    }

    /// Validates a message we are about to send. A failure here is a bug on
    /// our side and is only logged; the exchange proceeds.
    fn check_outbound(&self, body: &str) {
        match envelope::parse_envelope(body.as_bytes()) {
            Ok((_, payload)) => {
                if let Err(e) = self.validator.validate(&payload) {
                    warn!(error = %e, message = %payload.name, "outbound message failed validation");
                }
            }
            Err(e) => warn!(error = %e, "outbound envelope does not parse"),
        }
    }

    fn correlate(&mut self, header: &EnvelopeHeader) -> Result<(), PaosErrorKind> {
        let Some(message_id) = header.message_id.clone() else {
            return Err(PaosErrorKind::MessageIdMismatch(
                "inbound message carries no MessageID".to_string(),
            ));
        };
        self.ids
            .set_remote_id(message_id)
            .map_err(|e| PaosErrorKind::MessageIdMismatch(e.to_string()))
    }
}

fn note_result(first_minor: &mut Option<String>, result: &ResultType) {
    if !result.is_ok() && first_minor.is_none() {
        *first_minor = result.result_minor.clone();
    }
}

/// A `DIDAuthenticateResponse` built without dispatching, answering a
/// structurally invalid `DIDAuthenticate`.
fn synthesized_did_response(body: &XmlElement, error: &ValidationError) -> SalResponse {
    let protocol = body
        .find("AuthenticationProtocolData")
        .and_then(|data| data.attribute("Protocol"))
        .unwrap_or_default()
        .to_string();
    SalResponse::DidAuthenticate(DidAuthenticateResponse {
        result: ResultType::error(minor::INCORRECT_PARAMETER, error.reason.clone()),
        authentication_protocol_data: AuthenticationProtocolData {
            protocol,
            entries: Default::default(),
        },
    })
}

/// Handle privacy state of one exchange.
///
/// Substitute slot handles are minted per handle; nothing here outlives the
/// `send_start_paos` call that created it.
#[derive(Default)]
struct ExchangeContext {
    /// Channel session identifier stripped from the outbound handles,
    /// reinjected into inbound ones.
    session_identifier: Option<String>,
    /// Substitute to real slot handle.
    slot_handles: BTreeMap<ByteHandle, ByteHandle>,
}

impl ExchangeContext {
    fn new() -> Self {
        Self::default()
    }

    /// Replaces each real slot handle with an exchange-scoped substitute and
    /// strips the channel session identifier before the opening message
    /// leaves the client.
    fn conceal(&mut self, start: &mut StartPaos) {
        for handle in &mut start.connection_handles {
            let substitute = ByteHandle::random(32);
            if let Some(slot) = handle.slot_handle.take() {
                self.slot_handles.insert(substitute.clone(), slot);
            }
            handle.slot_handle = Some(substitute);
            if let Some(session) = handle.session_identifier() {
                self.session_identifier.get_or_insert(session.to_string());
            }
            handle.set_session_identifier(None);
        }
    }

    /// Maps substituted slot handles back and reinjects the stripped session
    /// identifier.
    fn restore(&self, request: &mut SalRequest) {
        match request {
            SalRequest::Transmit(Transmit { slot_handle, .. }) => {
                if let Some(real) = self.slot_handles.get(slot_handle) {
                    *slot_handle = real.clone();
                }
            }
            SalRequest::DidAuthenticate(DidAuthenticate {
                connection_handle, ..
            })
            | SalRequest::Sign(Sign {
                connection_handle, ..
            })
            | SalRequest::Hash(Hash {
                connection_handle, ..
            }) => {
                if let Some(slot) = &connection_handle.slot_handle {
                    if let Some(real) = self.slot_handles.get(slot) {
                        connection_handle.slot_handle = Some(real.clone());
                    }
                }
                connection_handle.set_session_identifier(self.session_identifier.clone());
            }
        }
    }
}
