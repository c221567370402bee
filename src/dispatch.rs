//! Message delivery from the transport loop to the service layer.
//!
//! The PAOS loop hands every decoded request to a [`Dispatcher`] and sends
//! whatever comes back. [`SalService`] is the one dispatcher this crate
//! ships: it resolves the addressed card state entry and forwards the
//! operation to the protocol instance running on it.

use crate::definitions::{
    result::minor, ConnectionHandle, FunctionType, ResultType, SalRequest, SalResponse,
    TransmitResponse,
};
use crate::protocol::ProtocolRegistry;
use crate::state::CardStateRegistry;
use std::sync::Arc;
use tracing::{debug, warn};

/// ISO 24727-3 service namespace, advertised in the PAOS header.
pub const ISO_SAL_SERVICE: &str = "urn:iso:std:iso-iec:24727:tech:schema";

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("no service handles {0} messages")]
    NoService(FunctionType),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Delivers one decoded request to the component implementing it.
pub trait Dispatcher: Send {
    fn deliver(&self, request: &SalRequest) -> Result<SalResponse, DispatchError>;

    /// Service namespaces this dispatcher answers for.
    fn service_names(&self) -> Vec<String>;
}

/// Raw command/response exchange with a connected card.
pub trait CardIo: Send {
    fn transmit(
        &self,
        slot_handle: &crate::definitions::ByteHandle,
        command_apdu: &[u8],
    ) -> anyhow::Result<Vec<u8>>;
}

/// The service access layer: resolves card state entries and runs protocol
/// steps on them.
pub struct SalService {
    registry: Arc<CardStateRegistry>,
    protocols: ProtocolRegistry,
    card_io: Box<dyn CardIo>,
}

impl SalService {
    pub fn new(
        registry: Arc<CardStateRegistry>,
        protocols: ProtocolRegistry,
        card_io: Box<dyn CardIo>,
    ) -> Self {
        SalService {
            registry,
            protocols,
            card_io,
        }
    }

    pub fn registry(&self) -> &Arc<CardStateRegistry> {
        &self.registry
    }

    fn did_authenticate(&self, request: &SalRequest, handle: &ConnectionHandle) -> SalResponse {
        let SalRequest::DidAuthenticate(msg) = request else {
            return request.error_response(ResultType::error(
                minor::INTERNAL_ERROR,
                "Wrong message type for DIDAuthenticate delivery.",
            ));
        };
        let Some(id) = self.registry.get_entry(handle, false) else {
            return unknown_handle_response(request);
        };
        let protocol_uri = msg.authentication_protocol_data.protocol.clone();

        // make sure an instance for this protocol exists on the entry before
        // stepping it; a fresh instance becomes the active one
        let missing = self
            .registry
            .with_entry_mut(id, |entry| entry.protocol(&protocol_uri).is_none())
            .unwrap_or(true);
        if missing {
            let Some(instance) = self.protocols.create(&protocol_uri) else {
                warn!(protocol = %protocol_uri, "no factory for requested protocol");
                return request.error_response(ResultType::error(
                    minor::UNKNOWN_PROTOCOL,
                    format!("No protocol implementation registered for '{protocol_uri}'."),
                ));
            };
            debug!(protocol = %protocol_uri, "created protocol instance");
            self.registry
                .with_entry_mut(id, |entry| entry.insert_protocol(&protocol_uri, instance));
        }

        let did_name = msg.did_name.clone();
        self.registry
            .with_entry_mut(id, |entry| {
                let Some(instance) = entry.protocol_mut(&protocol_uri) else {
                    return request.error_response(ResultType::error(
                        minor::UNKNOWN_PROTOCOL,
                        format!("No protocol instance for '{protocol_uri}'."),
                    ));
                };
                let response = instance.dispatch(request);
                if instance.is_finished() && response.result().is_ok() {
                    debug!(did = %did_name, "protocol finished, marking DID authenticated");
                    entry.add_authenticated_did(did_name.clone());
                }
                response
            })
            .unwrap_or_else(|| unknown_handle_response(request))
    }

    /// Sign and Hash do not name a protocol; they go to the instance most
    /// recently started on the entry.
    fn active_protocol_operation(
        &self,
        request: &SalRequest,
        handle: &ConnectionHandle,
    ) -> SalResponse {
        let Some(id) = self.registry.get_entry(handle, false) else {
            return unknown_handle_response(request);
        };
        self.registry
            .with_entry_mut(id, |entry| match entry.active_protocol_mut() {
                Some(instance) => instance.dispatch(request),
                None => request.inappropriate_step_response(),
            })
            .unwrap_or_else(|| unknown_handle_response(request))
    }

    fn transmit(&self, request: &SalRequest) -> SalResponse {
        let SalRequest::Transmit(msg) = request else {
            return request.error_response(ResultType::error(
                minor::INTERNAL_ERROR,
                "Wrong message type for Transmit delivery.",
            ));
        };
        let query = ConnectionHandle {
            slot_handle: Some(msg.slot_handle.clone()),
            ..Default::default()
        };
        let Some(id) = self.registry.get_entry(&query, false) else {
            return unknown_handle_response(request);
        };

        self.registry
            .with_entry_mut(id, |entry| {
                let mut output_apdus = Vec::with_capacity(msg.input_apdus.len());
                for info in &msg.input_apdus {
                    let command = match entry.active_protocol() {
                        Some(p) if p.needs_sm() => p.apply_sm(&info.input_apdu),
                        _ => info.input_apdu.clone(),
                    };
                    let raw = match self.card_io.transmit(&msg.slot_handle, &command) {
                        Ok(raw) => raw,
                        Err(e) => {
                            warn!(error = %e, "card transmit failed");
                            return SalResponse::Transmit(TransmitResponse {
                                result: ResultType::error(
                                    minor::COMMUNICATION_ERROR,
                                    e.to_string(),
                                ),
                                output_apdus,
                            });
                        }
                    };
                    let response = match entry.active_protocol() {
                        Some(p) if p.needs_sm() => p.remove_sm(&raw),
                        _ => raw,
                    };
                    let acceptable = acceptable_status(&response, &info.acceptable_status_codes);
                    output_apdus.push(response);
                    if !acceptable {
                        return SalResponse::Transmit(TransmitResponse {
                            result: ResultType::error(
                                minor::COMMUNICATION_ERROR,
                                "The card returned an unacceptable status code.",
                            ),
                            output_apdus,
                        });
                    }
                }
                SalResponse::Transmit(TransmitResponse {
                    result: ResultType::ok(),
                    output_apdus,
                })
            })
            .unwrap_or_else(|| unknown_handle_response(request))
    }
}

impl Dispatcher for SalService {
    fn deliver(&self, request: &SalRequest) -> Result<SalResponse, DispatchError> {
        debug!(function = %request.function_type(), "delivering request to SAL");
        let response = match request {
            SalRequest::DidAuthenticate(msg) => {
                self.did_authenticate(request, &msg.connection_handle)
            }
            SalRequest::Sign(msg) => self.active_protocol_operation(request, &msg.connection_handle),
            SalRequest::Hash(msg) => self.active_protocol_operation(request, &msg.connection_handle),
            SalRequest::Transmit(_) => self.transmit(request),
        };
        Ok(response)
    }

    fn service_names(&self) -> Vec<String> {
        vec![ISO_SAL_SERVICE.to_string()]
    }
}

fn unknown_handle_response(request: &SalRequest) -> SalResponse {
    request.error_response(ResultType::error(
        minor::UNKNOWN_CONNECTION_HANDLE,
        "No card state entry matches the given connection handle.",
    ))
}

/// A response APDU is acceptable when no status codes were given, or its
/// trailer starts with one of the given prefixes.
fn acceptable_status(response_apdu: &[u8], acceptable: &[Vec<u8>]) -> bool {
    if acceptable.is_empty() {
        return true;
    }
    if response_apdu.len() < 2 {
        return false;
    }
    let trailer = &response_apdu[response_apdu.len() - 2..];
    acceptable.iter().any(|code| trailer.starts_with(code))
}
