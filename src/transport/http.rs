//! Blocking HTTP channel underneath the PAOS exchange.

use super::envelope::PAOS_VERSION;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use tracing::debug;

/// Content type of PAOS-bound SOAP messages.
pub const PAOS_CONTENT_TYPE: &str = "application/vnd.paos+xml";

const PAOS_ACCEPT: &str = "text/html;q=0.2, application/vnd.paos+xml";

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("could not deliver the message")]
    Delivery(#[from] reqwest::Error),
    #[error("connection to the server was lost")]
    ConnectionLost,
}

/// One raw HTTP reply, before any PAOS-level interpretation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpReply {
    pub status: u16,
    pub body: Vec<u8>,
}

/// Sends one marshalled envelope and returns the raw reply.
///
/// A failed exchange leaves no state behind; the caller may retry on a fresh
/// connection.
pub trait PaosTransport: Send {
    fn exchange(&self, paos_header: &str, body: &str) -> Result<HttpReply, TransportError>;
}

/// [`PaosTransport`] over a blocking [`reqwest`] client.
pub struct ReqwestTransport {
    client: reqwest::blocking::Client,
    endpoint: String,
}

impl ReqwestTransport {
    pub fn new(client: reqwest::blocking::Client, endpoint: impl Into<String>) -> Self {
        ReqwestTransport {
            client,
            endpoint: endpoint.into(),
        }
    }
}

impl PaosTransport for ReqwestTransport {
    fn exchange(&self, paos_header: &str, body: &str) -> Result<HttpReply, TransportError> {
        debug!(endpoint = %self.endpoint, bytes = body.len(), "posting PAOS envelope");
        let response = self
            .client
            .post(&self.endpoint)
            .header(CONTENT_TYPE, PAOS_CONTENT_TYPE)
            .header(ACCEPT, PAOS_ACCEPT)
            .header("PAOS", paos_header)
            .body(body.to_string())
            .send()?;
        let status = response.status().as_u16();
        let body = response.bytes()?.to_vec();
        debug!(status, bytes = body.len(), "received PAOS reply");
        Ok(HttpReply { status, body })
    }
}

/// The value of the `PAOS` request header: binding version plus the service
/// namespaces the client answers for.
pub fn paos_header_value(services: &[String]) -> String {
    let mut value = format!("ver=\"{PAOS_VERSION}\"");
    for service in services {
        value.push_str(";\"");
        value.push_str(service);
        value.push('"');
    }
    value
}
