//! SOAP envelope marshalling and parsing for the PAOS binding.
//!
//! Messages are carried as SOAP 1.1 envelopes with WS-Addressing headers.
//! Parsing is lenient about namespace prefixes and matches elements by local
//! name; marshalling emits the canonical prefixes.

use crate::definitions::{
    AuthenticationProtocolData, ByteHandle, ChannelHandle, ConnectionHandle, DidAuthenticate,
    Hash, InputApduInfo, RecognitionInfo, ResultType, SalRequest, SalResponse, Sign, StartPaos,
    StartPaosResponse, Transmit, UserAgent,
};
use quick_xml::escape::escape;
use quick_xml::events::Event;
use quick_xml::Reader;
use std::collections::BTreeMap;

/// PAOS binding version advertised in the `PAOS` HTTP header and the SOAP
/// header block.
pub const PAOS_VERSION: &str = "urn:liberty:paos:2006-08";

const NS_SOAP: &str = "http://schemas.xmlsoap.org/soap/envelope/";
const NS_ADDRESSING: &str = "http://www.w3.org/2005/03/addressing";
const NS_PAOS: &str = "urn:liberty:paos:2006-08";
const NS_ISO: &str = "urn:iso:std:iso-iec:24727:tech:schema";
const NS_DSS: &str = "urn:oasis:names:tc:dss:1.0:core:schema";

const PAOS_ACTOR: &str = "http://schemas.xmlsoap.org/soap/actor/next";
const PAOS_ROLE: &str = "http://www.projectliberty.org/2006/01/role/paos";

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("could not parse envelope")]
    Xml(#[from] quick_xml::Error),
    #[error("envelope is not valid UTF-8")]
    Encoding(#[from] std::str::Utf8Error),
    #[error("document ended before the envelope was closed")]
    Truncated,
    #[error("expected a SOAP envelope, found '{0}'")]
    NotAnEnvelope(String),
    #[error("envelope has no body payload")]
    EmptyBody,
    #[error("unsupported message type '{0}'")]
    UnsupportedMessage(String),
    #[error("missing required element '{0}'")]
    MissingField(&'static str),
    #[error("malformed value in element '{0}'")]
    MalformedField(&'static str),
}

type Result<T, E = EnvelopeError> = std::result::Result<T, E>;

/// WS-Addressing fields of a parsed envelope header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvelopeHeader {
    pub message_id: Option<String>,
    pub relates_to: Option<String>,
}

/// A message decoded from an inbound envelope body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    StartPaosResponse(StartPaosResponse),
    Request(SalRequest),
}

/// A message to be marshalled into an outbound envelope body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Start(StartPaos),
    Response(SalResponse),
}

/// Minimal element tree, sufficient for the small message vocabulary of this
/// binding. Element names are local names; prefixes are stripped on parse.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct XmlElement {
    pub name: String,
    pub attrs: Vec<(String, String)>,
    pub children: Vec<XmlElement>,
    pub text: String,
}

impl XmlElement {
    fn new(name: impl Into<String>) -> Self {
        XmlElement {
            name: name.into(),
            ..Default::default()
        }
    }

    fn attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attrs.push((key.into(), value.into()));
        self
    }

    fn text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    fn child(mut self, child: XmlElement) -> Self {
        self.children.push(child);
        self
    }

    fn maybe_child(mut self, child: Option<XmlElement>) -> Self {
        if let Some(child) = child {
            self.children.push(child);
        }
        self
    }

    /// First child with this local name.
    pub fn find(&self, name: &str) -> Option<&XmlElement> {
        self.children.iter().find(|c| c.name == name)
    }

    pub fn find_text(&self, name: &str) -> Option<&str> {
        self.find(name).map(|c| c.text.as_str())
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    fn write_into(&self, out: &mut String) {
        out.push('<');
        out.push_str(&self.name);
        for (key, value) in &self.attrs {
            out.push(' ');
            out.push_str(key);
            out.push_str("=\"");
            out.push_str(&escape(value.as_str()));
            out.push('"');
        }
        if self.children.is_empty() && self.text.is_empty() {
            out.push_str("/>");
            return;
        }
        out.push('>');
        out.push_str(&escape(self.text.as_str()));
        for child in &self.children {
            child.write_into(out);
        }
        out.push_str("</");
        out.push_str(&self.name);
        out.push('>');
    }
}

fn local_name(qualified: &[u8]) -> String {
    let bytes = match qualified.iter().rposition(|b| *b == b':') {
        Some(pos) => &qualified[pos + 1..],
        None => qualified,
    };
    String::from_utf8_lossy(bytes).into_owned()
}

/// Parses one XML document into an element tree.
fn parse_element(xml: &str) -> Result<XmlElement> {
    let mut reader = Reader::from_str(xml);
    let mut stack: Vec<XmlElement> = Vec::new();
    loop {
        match reader.read_event()? {
            Event::Start(start) => {
                let mut element = XmlElement::new(local_name(start.name().as_ref()));
                for attr in start.attributes() {
                    let attr = attr.map_err(quick_xml::Error::from)?;
                    let key = local_name(attr.key.as_ref());
                    let value = attr.unescape_value()?.into_owned();
                    element.attrs.push((key, value));
                }
                stack.push(element);
            }
            Event::Empty(start) => {
                let mut element = XmlElement::new(local_name(start.name().as_ref()));
                for attr in start.attributes() {
                    let attr = attr.map_err(quick_xml::Error::from)?;
                    let key = local_name(attr.key.as_ref());
                    let value = attr.unescape_value()?.into_owned();
                    element.attrs.push((key, value));
                }
                match stack.last_mut() {
                    Some(parent) => parent.children.push(element),
                    None => return Ok(element),
                }
            }
            Event::Text(text) => {
                let text = text.unescape()?;
                let trimmed = text.trim();
                if !trimmed.is_empty() {
                    if let Some(top) = stack.last_mut() {
                        top.text.push_str(trimmed);
                    }
                }
            }
            Event::End(_) => {
                let element = stack.pop().ok_or(EnvelopeError::Truncated)?;
                match stack.last_mut() {
                    Some(parent) => parent.children.push(element),
                    None => return Ok(element),
                }
            }
            Event::Eof => return Err(EnvelopeError::Truncated),
            _ => {}
        }
    }
}

/// Parses an inbound envelope into its addressing header and body payload.
pub fn parse_envelope(bytes: &[u8]) -> Result<(EnvelopeHeader, XmlElement)> {
    let xml = std::str::from_utf8(bytes)?;
    let root = parse_element(xml)?;
    if root.name != "Envelope" {
        return Err(EnvelopeError::NotAnEnvelope(root.name));
    }
    let mut header = EnvelopeHeader::default();
    if let Some(header_element) = root.find("Header") {
        header.message_id = header_element
            .find_text("MessageID")
            .map(|s| s.to_string());
        header.relates_to = header_element
            .find_text("RelatesTo")
            .map(|s| s.to_string());
    }
    let body = root
        .find("Body")
        .and_then(|b| b.children.first())
        .cloned()
        .ok_or(EnvelopeError::EmptyBody)?;
    Ok((header, body))
}

/// Decodes the body payload into a typed message.
pub fn decode_message(body: &XmlElement) -> Result<Inbound> {
    match body.name.as_str() {
        "StartPAOSResponse" => Ok(Inbound::StartPaosResponse(StartPaosResponse {
            result: parse_result(body)?,
        })),
        "DIDAuthenticate" => Ok(Inbound::Request(SalRequest::DidAuthenticate(
            parse_did_authenticate(body)?,
        ))),
        "Transmit" => Ok(Inbound::Request(SalRequest::Transmit(parse_transmit(
            body,
        )?))),
        "Sign" => {
            let (connection_handle, did_name, message) = parse_crypto_operation(body)?;
            Ok(Inbound::Request(SalRequest::Sign(Sign {
                connection_handle,
                did_name,
                message,
            })))
        }
        "Hash" => {
            let (connection_handle, did_name, message) = parse_crypto_operation(body)?;
            Ok(Inbound::Request(SalRequest::Hash(Hash {
                connection_handle,
                did_name,
                message,
            })))
        }
        other => Err(EnvelopeError::UnsupportedMessage(other.to_string())),
    }
}

fn parse_result(parent: &XmlElement) -> Result<ResultType> {
    let result = parent
        .find("Result")
        .ok_or(EnvelopeError::MissingField("Result"))?;
    Ok(ResultType {
        result_major: result
            .find_text("ResultMajor")
            .ok_or(EnvelopeError::MissingField("ResultMajor"))?
            .to_string(),
        result_minor: result.find_text("ResultMinor").map(|s| s.to_string()),
        result_message: result.find_text("ResultMessage").map(|s| s.to_string()),
    })
}

fn parse_byte_handle(parent: &XmlElement, name: &'static str) -> Result<Option<ByteHandle>> {
    match parent.find_text(name) {
        Some(text) => ByteHandle::from_hex(text)
            .map(Some)
            .map_err(|_| EnvelopeError::MalformedField(name)),
        None => Ok(None),
    }
}

fn parse_bytes(parent: &XmlElement, name: &'static str) -> Result<Option<Vec<u8>>> {
    match parent.find_text(name) {
        Some(text) => hex::decode(text.trim())
            .map(Some)
            .map_err(|_| EnvelopeError::MalformedField(name)),
        None => Ok(None),
    }
}

fn parse_connection_handle(parent: &XmlElement) -> Result<ConnectionHandle> {
    let element = parent
        .find("ConnectionHandle")
        .ok_or(EnvelopeError::MissingField("ConnectionHandle"))?;
    let channel_handle = element.find("ChannelHandle").map(|channel| ChannelHandle {
        session_identifier: channel
            .find_text("SessionIdentifier")
            .map(|s| s.to_string()),
        protocol_termination_point: channel
            .find_text("ProtocolTerminationPoint")
            .map(|s| s.to_string()),
    });
    let slot_index = match element.find_text("SlotIndex") {
        Some(text) => Some(
            text.trim()
                .parse::<u64>()
                .map_err(|_| EnvelopeError::MalformedField("SlotIndex"))?,
        ),
        None => None,
    };
    Ok(ConnectionHandle {
        channel_handle,
        context_handle: parse_byte_handle(element, "ContextHandle")?,
        ifd_name: element.find_text("IFDName").map(|s| s.to_string()),
        slot_index,
        slot_handle: parse_byte_handle(element, "SlotHandle")?,
        card_application: parse_byte_handle(element, "CardApplication")?,
        recognition_info: element.find("RecognitionInfo").map(|info| RecognitionInfo {
            card_type: info.find_text("CardType").map(|s| s.to_string()),
        }),
    })
}

fn parse_did_authenticate(body: &XmlElement) -> Result<DidAuthenticate> {
    let data = body
        .find("AuthenticationProtocolData")
        .ok_or(EnvelopeError::MissingField("AuthenticationProtocolData"))?;
    let mut entries = BTreeMap::new();
    for child in &data.children {
        entries.insert(child.name.clone(), child.text.clone());
    }
    Ok(DidAuthenticate {
        connection_handle: parse_connection_handle(body)?,
        did_name: body
            .find_text("DIDName")
            .ok_or(EnvelopeError::MissingField("DIDName"))?
            .to_string(),
        authentication_protocol_data: AuthenticationProtocolData {
            protocol: data
                .attribute("Protocol")
                .ok_or(EnvelopeError::MissingField("Protocol"))?
                .to_string(),
            entries,
        },
    })
}

fn parse_transmit(body: &XmlElement) -> Result<Transmit> {
    let slot_handle = parse_byte_handle(body, "SlotHandle")?
        .ok_or(EnvelopeError::MissingField("SlotHandle"))?;
    let mut input_apdus = Vec::new();
    for info in body.children.iter().filter(|c| c.name == "InputAPDUInfo") {
        let input_apdu =
            parse_bytes(info, "InputAPDU")?.ok_or(EnvelopeError::MissingField("InputAPDU"))?;
        let mut acceptable_status_codes = Vec::new();
        for code in info
            .children
            .iter()
            .filter(|c| c.name == "AcceptableStatusCode")
        {
            acceptable_status_codes.push(
                hex::decode(code.text.trim())
                    .map_err(|_| EnvelopeError::MalformedField("AcceptableStatusCode"))?,
            );
        }
        input_apdus.push(InputApduInfo {
            input_apdu,
            acceptable_status_codes,
        });
    }
    Ok(Transmit {
        slot_handle,
        input_apdus,
    })
}

fn parse_crypto_operation(body: &XmlElement) -> Result<(ConnectionHandle, String, Vec<u8>)> {
    Ok((
        parse_connection_handle(body)?,
        body.find_text("DIDName")
            .ok_or(EnvelopeError::MissingField("DIDName"))?
            .to_string(),
        parse_bytes(body, "Message")?.ok_or(EnvelopeError::MissingField("Message"))?,
    ))
}

/// Marshals an outbound message into a complete envelope document.
pub fn marshal(
    message: &Outbound,
    message_id: &str,
    relates_to: Option<&str>,
    services: &[String],
) -> String {
    let mut paos_header = XmlElement::new("paos:PAOS")
        .attr("soap:actor", PAOS_ACTOR)
        .attr("soap:mustUnderstand", "1")
        .child(XmlElement::new("paos:Version").text(NS_PAOS));
    for service in services {
        paos_header = paos_header.child(
            XmlElement::new("paos:EndpointReference")
                .child(XmlElement::new("paos:Address").text(PAOS_ROLE))
                .child(
                    XmlElement::new("paos:MetaData")
                        .child(XmlElement::new("paos:ServiceType").text(service.as_str())),
                ),
        );
    }

    let header = XmlElement::new("soap:Header")
        .child(paos_header)
        .child(
            XmlElement::new("wsa:ReplyTo")
                .child(XmlElement::new("wsa:Address").text(PAOS_ROLE)),
        )
        .child(XmlElement::new("wsa:MessageID").text(message_id))
        .maybe_child(relates_to.map(|id| XmlElement::new("wsa:RelatesTo").text(id)));

    let body = XmlElement::new("soap:Body").child(match message {
        Outbound::Start(start) => marshal_start_paos(start),
        Outbound::Response(response) => marshal_response(response),
    });

    let envelope = XmlElement::new("soap:Envelope")
        .attr("xmlns:soap", NS_SOAP)
        .attr("xmlns:wsa", NS_ADDRESSING)
        .attr("xmlns:paos", NS_PAOS)
        .attr("xmlns:iso", NS_ISO)
        .attr("xmlns:dss", NS_DSS)
        .child(header)
        .child(body);

    let mut out = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>");
    envelope.write_into(&mut out);
    out
}

fn marshal_start_paos(start: &StartPaos) -> XmlElement {
    let mut element = XmlElement::new("iso:StartPAOS").child(
        XmlElement::new("iso:SessionIdentifier").text(start.session_identifier.as_str()),
    );
    for handle in &start.connection_handles {
        element = element.child(marshal_connection_handle(handle));
    }
    element.maybe_child(start.user_agent.as_ref().map(marshal_user_agent))
}

fn marshal_user_agent(agent: &UserAgent) -> XmlElement {
    XmlElement::new("iso:UserAgent")
        .child(XmlElement::new("iso:Name").text(agent.name.as_str()))
        .child(XmlElement::new("iso:VersionMajor").text(agent.version_major.to_string()))
        .child(XmlElement::new("iso:VersionMinor").text(agent.version_minor.to_string()))
}

fn marshal_connection_handle(handle: &ConnectionHandle) -> XmlElement {
    let mut element = XmlElement::new("iso:ConnectionHandle");
    if let Some(channel) = &handle.channel_handle {
        element = element.child(
            XmlElement::new("iso:ChannelHandle")
                .maybe_child(channel.session_identifier.as_deref().map(|session| {
                    XmlElement::new("iso:SessionIdentifier").text(session)
                }))
                .maybe_child(channel.protocol_termination_point.as_deref().map(|point| {
                    XmlElement::new("iso:ProtocolTerminationPoint").text(point)
                })),
        );
    }
    if let Some(ctx) = &handle.context_handle {
        element = element.child(XmlElement::new("iso:ContextHandle").text(ctx.to_hex()));
    }
    if let Some(ifd_name) = &handle.ifd_name {
        element = element.child(XmlElement::new("iso:IFDName").text(ifd_name.as_str()));
    }
    if let Some(slot_index) = handle.slot_index {
        element = element.child(XmlElement::new("iso:SlotIndex").text(slot_index.to_string()));
    }
    if let Some(slot) = &handle.slot_handle {
        element = element.child(XmlElement::new("iso:SlotHandle").text(slot.to_hex()));
    }
    if let Some(application) = &handle.card_application {
        element =
            element.child(XmlElement::new("iso:CardApplication").text(application.to_hex()));
    }
    if let Some(info) = &handle.recognition_info {
        element = element.child(XmlElement::new("iso:RecognitionInfo").maybe_child(
            info.card_type
                .as_deref()
                .map(|card_type| XmlElement::new("iso:CardType").text(card_type)),
        ));
    }
    element
}

fn marshal_result(result: &ResultType) -> XmlElement {
    XmlElement::new("dss:Result")
        .child(XmlElement::new("dss:ResultMajor").text(result.result_major.as_str()))
        .maybe_child(
            result
                .result_minor
                .as_deref()
                .map(|minor| XmlElement::new("dss:ResultMinor").text(minor)),
        )
        .maybe_child(result.result_message.as_deref().map(|message| {
            XmlElement::new("dss:ResultMessage")
                .attr("xml:lang", "en")
                .text(message)
        }))
}

fn marshal_response(response: &SalResponse) -> XmlElement {
    match response {
        SalResponse::DidAuthenticate(resp) => {
            let mut data = XmlElement::new("iso:AuthenticationProtocolData").attr(
                "Protocol",
                resp.authentication_protocol_data.protocol.as_str(),
            );
            for (name, value) in &resp.authentication_protocol_data.entries {
                data = data.child(XmlElement::new(format!("iso:{name}")).text(value.as_str()));
            }
            XmlElement::new("iso:DIDAuthenticateResponse")
                .child(marshal_result(&resp.result))
                .child(data)
        }
        SalResponse::Transmit(resp) => {
            let mut element =
                XmlElement::new("iso:TransmitResponse").child(marshal_result(&resp.result));
            for apdu in &resp.output_apdus {
                element = element
                    .child(XmlElement::new("iso:OutputAPDU").text(hex::encode_upper(apdu)));
            }
            element
        }
        SalResponse::Sign(resp) => XmlElement::new("iso:SignResponse")
            .child(marshal_result(&resp.result))
            .maybe_child(resp.signature.as_deref().map(|signature| {
                XmlElement::new("iso:Signature").text(hex::encode_upper(signature))
            })),
        SalResponse::Hash(resp) => XmlElement::new("iso:HashResponse")
            .child(marshal_result(&resp.result))
            .maybe_child(
                resp.hash.as_deref().map(|hash| {
                    XmlElement::new("iso:Hash").text(hex::encode_upper(hash))
                }),
            ),
    }
}
