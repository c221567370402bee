use super::handle::ConnectionHandle;
use super::helpers::ByteHandle;
use super::result::{minor, ResultType};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use strum_macros::Display;

/// SAL operation vocabulary (ISO 24727-3). Steps of a protocol instance are
/// keyed by this type; not every member has a concrete payload in this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display)]
pub enum FunctionType {
    CardApplicationStartSession,
    CardApplicationEndSession,
    Encipher,
    Decipher,
    GetRandom,
    Hash,
    Sign,
    VerifySignature,
    VerifyCertificate,
    DIDCreate,
    DIDUpdate,
    DIDDelete,
    DIDAuthenticate,
    Transmit,
}

/// First outbound message of a PAOS exchange.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartPaos {
    pub session_identifier: String,
    pub connection_handles: Vec<ConnectionHandle>,
    pub user_agent: Option<UserAgent>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserAgent {
    pub name: String,
    pub version_major: u32,
    pub version_minor: u32,
}

/// Terminal message of a PAOS exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartPaosResponse {
    pub result: ResultType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DidAuthenticate {
    pub connection_handle: ConnectionHandle,
    pub did_name: String,
    pub authentication_protocol_data: AuthenticationProtocolData,
}

/// Protocol-tagged opaque authentication data.
///
/// The engine never interprets the entries; it hands them to the protocol
/// instance's steps as a flat element-name → text mapping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticationProtocolData {
    pub protocol: String,
    pub entries: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DidAuthenticateResponse {
    pub result: ResultType,
    pub authentication_protocol_data: AuthenticationProtocolData,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transmit {
    pub slot_handle: ByteHandle,
    pub input_apdus: Vec<InputApduInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputApduInfo {
    pub input_apdu: Vec<u8>,
    pub acceptable_status_codes: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransmitResponse {
    pub result: ResultType,
    pub output_apdus: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sign {
    pub connection_handle: ConnectionHandle,
    pub did_name: String,
    pub message: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignResponse {
    pub result: ResultType,
    pub signature: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hash {
    pub connection_handle: ConnectionHandle,
    pub did_name: String,
    pub message: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashResponse {
    pub result: ResultType,
    pub hash: Option<Vec<u8>>,
}

/// A SAL operation decoded from the wire or issued locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SalRequest {
    DidAuthenticate(DidAuthenticate),
    Transmit(Transmit),
    Sign(Sign),
    Hash(Hash),
}

/// The typed response mirroring a [`SalRequest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SalResponse {
    DidAuthenticate(DidAuthenticateResponse),
    Transmit(TransmitResponse),
    Sign(SignResponse),
    Hash(HashResponse),
}

impl SalRequest {
    pub fn function_type(&self) -> FunctionType {
        match self {
            SalRequest::DidAuthenticate(_) => FunctionType::DIDAuthenticate,
            SalRequest::Transmit(_) => FunctionType::Transmit,
            SalRequest::Sign(_) => FunctionType::Sign,
            SalRequest::Hash(_) => FunctionType::Hash,
        }
    }

    /// The connection handle the operation addresses, if it carries one.
    /// `Transmit` addresses a card by bare slot handle instead.
    pub fn connection_handle(&self) -> Option<&ConnectionHandle> {
        match self {
            SalRequest::DidAuthenticate(m) => Some(&m.connection_handle),
            SalRequest::Sign(m) => Some(&m.connection_handle),
            SalRequest::Hash(m) => Some(&m.connection_handle),
            SalRequest::Transmit(_) => None,
        }
    }

    /// Mirror response carrying an error result and an empty payload.
    ///
    /// Step-local failures are converted into these rather than unwound past
    /// the dispatcher.
    pub fn error_response(&self, result: ResultType) -> SalResponse {
        match self {
            SalRequest::DidAuthenticate(m) => {
                SalResponse::DidAuthenticate(DidAuthenticateResponse {
                    result,
                    authentication_protocol_data: AuthenticationProtocolData {
                        protocol: m.authentication_protocol_data.protocol.clone(),
                        entries: BTreeMap::new(),
                    },
                })
            }
            SalRequest::Transmit(_) => SalResponse::Transmit(TransmitResponse {
                result,
                output_apdus: Vec::new(),
            }),
            SalRequest::Sign(_) => SalResponse::Sign(SignResponse {
                result,
                signature: None,
            }),
            SalRequest::Hash(_) => SalResponse::Hash(HashResponse { result, hash: None }),
        }
    }

    /// Mirror response for an operation arriving out of protocol sequence.
    pub fn inappropriate_step_response(&self) -> SalResponse {
        self.error_response(ResultType::error(
            minor::INAPPROPRIATE_PROTOCOL_FOR_ACTION,
            "There is no applicable protocol step at this point in the protocol flow.",
        ))
    }
}

impl SalResponse {
    pub fn function_type(&self) -> FunctionType {
        match self {
            SalResponse::DidAuthenticate(_) => FunctionType::DIDAuthenticate,
            SalResponse::Transmit(_) => FunctionType::Transmit,
            SalResponse::Sign(_) => FunctionType::Sign,
            SalResponse::Hash(_) => FunctionType::Hash,
        }
    }

    pub fn result(&self) -> &ResultType {
        match self {
            SalResponse::DidAuthenticate(m) => &m.result,
            SalResponse::Transmit(m) => &m.result,
            SalResponse::Sign(m) => &m.result,
            SalResponse::Hash(m) => &m.result,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn error_response_mirrors_request_type() {
        let req = SalRequest::Sign(Sign::default());
        let resp = req.inappropriate_step_response();
        assert_eq!(resp.function_type(), FunctionType::Sign);
        assert!(!resp.result().is_ok());
        assert_eq!(
            resp.result().result_minor.as_deref(),
            Some(minor::INAPPROPRIATE_PROTOCOL_FOR_ACTION)
        );
    }

    #[test]
    fn did_authenticate_error_response_keeps_protocol_uri() {
        let req = SalRequest::DidAuthenticate(DidAuthenticate {
            connection_handle: ConnectionHandle::default(),
            did_name: "PIN".into(),
            authentication_protocol_data: AuthenticationProtocolData {
                protocol: "urn:oid:1.3.162.15480.3.0.14.2".into(),
                entries: BTreeMap::new(),
            },
        });
        match req.error_response(ResultType::error(minor::INCORRECT_PARAMETER, "bad")) {
            SalResponse::DidAuthenticate(resp) => {
                assert_eq!(
                    resp.authentication_protocol_data.protocol,
                    "urn:oid:1.3.162.15480.3.0.14.2"
                );
            }
            other => panic!("unexpected response type: {:?}", other),
        }
    }
}
