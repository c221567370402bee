//! Structural validation of inbound message bodies before dispatch.
//!
//! A validation failure does not abort the exchange outright; the transport
//! loop answers with an error response where the message type permits one,
//! and surfaces the failure once the exchange terminates.

use super::envelope::XmlElement;
use tracing::debug;

#[derive(Debug, Clone, thiserror::Error)]
#[error("message failed validation: {reason}")]
pub struct ValidationError {
    pub reason: String,
}

impl ValidationError {
    fn new(reason: impl Into<String>) -> Self {
        ValidationError {
            reason: reason.into(),
        }
    }
}

/// Checks an inbound body payload against the message vocabulary.
pub trait SchemaValidator: Send {
    fn validate(&self, body: &XmlElement) -> Result<(), ValidationError>;
}

/// The built-in validator: per-message-type checks of the required elements
/// and attributes.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultValidator;

impl SchemaValidator for DefaultValidator {
    fn validate(&self, body: &XmlElement) -> Result<(), ValidationError> {
        debug!(message = %body.name, "validating inbound message");
        match body.name.as_str() {
            "StartPAOSResponse" => {
                let result = require(body, "Result")?;
                require(result, "ResultMajor")?;
                Ok(())
            }
            "DIDAuthenticate" => {
                require(body, "ConnectionHandle")?;
                require(body, "DIDName")?;
                let data = require(body, "AuthenticationProtocolData")?;
                if data.attribute("Protocol").map_or(true, str::is_empty) {
                    return Err(ValidationError::new(
                        "AuthenticationProtocolData carries no Protocol attribute",
                    ));
                }
                Ok(())
            }
            "Transmit" => {
                require(body, "SlotHandle")?;
                let infos: Vec<_> = body
                    .children
                    .iter()
                    .filter(|c| c.name == "InputAPDUInfo")
                    .collect();
                if infos.is_empty() {
                    return Err(ValidationError::new("Transmit carries no InputAPDUInfo"));
                }
                for info in infos {
                    require(info, "InputAPDU")?;
                }
                Ok(())
            }
            "Sign" | "Hash" => {
                require(body, "ConnectionHandle")?;
                require(body, "DIDName")?;
                require(body, "Message")?;
                Ok(())
            }
            "StartPAOS" => {
                require(body, "SessionIdentifier")?;
                Ok(())
            }
            "DIDAuthenticateResponse" | "TransmitResponse" | "SignResponse" | "HashResponse" => {
                let result = require(body, "Result")?;
                require(result, "ResultMajor")?;
                Ok(())
            }
            // unsupported types are rejected by the decoder, not here
            _ => Ok(()),
        }
    }
}

fn require<'a>(parent: &'a XmlElement, name: &str) -> Result<&'a XmlElement, ValidationError> {
    parent.find(name).ok_or_else(|| {
        ValidationError::new(format!("{} carries no {}", parent.name, name))
    })
}

#[cfg(test)]
mod test {
    use super::*;

    fn element(name: &str, children: Vec<XmlElement>) -> XmlElement {
        XmlElement {
            name: name.to_string(),
            children,
            ..Default::default()
        }
    }

    fn leaf(name: &str) -> XmlElement {
        element(name, vec![])
    }

    #[test]
    fn did_authenticate_without_protocol_attribute_fails() {
        let body = element(
            "DIDAuthenticate",
            vec![
                leaf("ConnectionHandle"),
                leaf("DIDName"),
                leaf("AuthenticationProtocolData"),
            ],
        );
        assert!(DefaultValidator.validate(&body).is_err());
    }

    #[test]
    fn complete_did_authenticate_passes() {
        let mut data = leaf("AuthenticationProtocolData");
        data.attrs
            .push(("Protocol".into(), "urn:oid:1.3.162.15480.3.0.14.2".into()));
        let body = element(
            "DIDAuthenticate",
            vec![leaf("ConnectionHandle"), leaf("DIDName"), data],
        );
        assert!(DefaultValidator.validate(&body).is_ok());
    }

    #[test]
    fn transmit_without_apdus_fails() {
        let body = element("Transmit", vec![leaf("SlotHandle")]);
        assert!(DefaultValidator.validate(&body).is_err());

        let body = element(
            "Transmit",
            vec![
                leaf("SlotHandle"),
                element("InputAPDUInfo", vec![leaf("InputAPDU")]),
            ],
        );
        assert!(DefaultValidator.validate(&body).is_ok());
    }

    #[test]
    fn outbound_shapes_are_checked_too() {
        let body = element("StartPAOS", vec![]);
        assert!(DefaultValidator.validate(&body).is_err());
        let body = element("StartPAOS", vec![leaf("SessionIdentifier")]);
        assert!(DefaultValidator.validate(&body).is_ok());

        let body = element("TransmitResponse", vec![]);
        assert!(DefaultValidator.validate(&body).is_err());
    }

    #[test]
    fn start_paos_response_needs_a_result_major() {
        let body = element("StartPAOSResponse", vec![leaf("Result")]);
        assert!(DefaultValidator.validate(&body).is_err());

        let body = element(
            "StartPAOSResponse",
            vec![element("Result", vec![leaf("ResultMajor")])],
        );
        assert!(DefaultValidator.validate(&body).is_ok());
    }
}
