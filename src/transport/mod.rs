//! PAOS transport: the role-inverting SOAP binding carrying SAL messages
//! between this client and the remote authentication server.
//!
//! [`paos::Paos`] drives the exchange loop; [`envelope`] marshals and parses
//! the SOAP envelopes; [`correlator`] tracks WS-Addressing message ids;
//! [`validator`] checks inbound messages structurally before dispatch;
//! [`http`] is the blocking HTTP channel underneath.

pub mod correlator;
pub mod envelope;
pub mod http;
pub mod paos;
pub mod validator;

pub use correlator::MessageIdGenerator;
pub use envelope::{EnvelopeError, Inbound, Outbound};
pub use http::{HttpReply, PaosTransport, ReqwestTransport, TransportError};
pub use paos::{Paos, PaosError, PaosErrorKind};
pub use validator::{DefaultValidator, SchemaValidator, ValidationError};
