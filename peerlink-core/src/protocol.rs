//! peerlink message model: tagged field lists, discovery advertisements, text payloads.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::identity::{EndpointDescriptor, PeerId, PeerIdentity};

/// Current protocol version. Carried in discovery datagrams.
pub const PROTOCOL_VERSION: u8 = 1;

/// Field names used on the wire.
pub mod field {
    pub const TYPE: &str = "Type";
    pub const FROM: &str = "From";
    pub const FROM_NAME: &str = "FromName";
    pub const CONTENT: &str = "Content";
    pub const FILENAME: &str = "Filename";
    pub const TOTAL_PACKETS: &str = "TotalPackets";
    pub const PACKET_PAYLOAD_SIZE: &str = "PacketPayloadSize";
    pub const PACKET_SEQUENCE_NUMBER: &str = "PacketSequenceNumber";
}

/// Discriminator carried in the `Type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Text,
    File,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Text => "TEXT",
            MessageType::File => "FILE",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = MessageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TEXT" => Ok(MessageType::Text),
            "FILE" => Ok(MessageType::File),
            other => Err(MessageError::UnknownType(other.to_string())),
        }
    }
}

/// Element value: text or raw bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Value {
    Text(String),
    Bytes(Vec<u8>),
}

/// One named field of a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Element {
    pub name: String,
    pub value: Value,
}

/// Ordered set of named fields. Every message sent by peerlink starts with `Type`, `From` and
/// `FromName`; the rest depends on the type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    elements: Vec<Element>,
}

impl Message {
    /// Empty message with no fields at all (not even `Type`).
    pub fn empty() -> Self {
        Self::default()
    }

    /// Message with the three common header fields filled in.
    pub fn new(kind: MessageType, from: &PeerIdentity) -> Self {
        let mut msg = Self::empty();
        msg.push_text(field::TYPE, kind.as_str());
        msg.push_text(field::FROM, from.id.as_str());
        msg.push_text(field::FROM_NAME, from.name.as_str());
        msg
    }

    pub fn push_text(&mut self, name: &str, value: impl Into<String>) {
        self.elements.push(Element {
            name: name.to_string(),
            value: Value::Text(value.into()),
        });
    }

    pub fn push_bytes(&mut self, name: &str, value: Vec<u8>) {
        self.elements.push(Element {
            name: name.to_string(),
            value: Value::Bytes(value),
        });
    }

    pub fn elements(&self) -> &[Element] {
        &self.elements
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.elements
            .iter()
            .find(|e| e.name == name)
            .map(|e| &e.value)
    }

    /// Text value of a field. A bytes value is accepted if it is valid UTF-8.
    pub fn text(&self, name: &str) -> Option<&str> {
        match self.get(name)? {
            Value::Text(s) => Some(s.as_str()),
            Value::Bytes(b) => std::str::from_utf8(b).ok(),
        }
    }

    /// Byte value of a field. A text value is returned as its UTF-8 bytes.
    pub fn bytes(&self, name: &str) -> Option<&[u8]> {
        match self.get(name)? {
            Value::Text(s) => Some(s.as_bytes()),
            Value::Bytes(b) => Some(b.as_slice()),
        }
    }

    pub fn require_text(&self, name: &'static str) -> Result<&str, MessageError> {
        self.text(name).ok_or(MessageError::MissingField(name))
    }

    pub fn require_bytes(&self, name: &'static str) -> Result<&[u8], MessageError> {
        self.bytes(name).ok_or(MessageError::MissingField(name))
    }

    /// Parse a required numeric text field.
    pub fn require_number<T: FromStr>(&self, name: &'static str) -> Result<T, MessageError> {
        let raw = self.require_text(name)?;
        raw.trim().parse().map_err(|_| MessageError::InvalidField {
            field: name,
            value: raw.to_string(),
        })
    }

    /// The discriminator. Must be checked before anything else is read.
    pub fn kind(&self) -> Result<MessageType, MessageError> {
        self.require_text(field::TYPE)?.parse()
    }

    /// Sender ID and display name from the common header.
    pub fn sender(&self) -> Result<PeerIdentity, MessageError> {
        let id = self.require_text(field::FROM)?;
        let name = self.require_text(field::FROM_NAME)?;
        Ok(PeerIdentity::new(PeerId::from(id), name))
    }
}

/// Malformed inbound message. Logged and dropped by the router; never reported to the sender.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MessageError {
    #[error("missing field {0}")]
    MissingField(&'static str),
    #[error("unknown message type {0:?}")]
    UnknownType(String),
    #[error("invalid value {value:?} for field {field}")]
    InvalidField { field: &'static str, value: String },
}

/// Text message: the whole payload travels in `Content`, no fragmentation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextMessage {
    pub from: PeerIdentity,
    pub text: String,
}

impl TextMessage {
    pub fn new(from: PeerIdentity, text: impl Into<String>) -> Self {
        Self {
            from,
            text: text.into(),
        }
    }

    pub fn to_message(&self) -> Message {
        let mut msg = Message::new(MessageType::Text, &self.from);
        msg.push_text(field::CONTENT, self.text.as_str());
        msg
    }

    pub fn from_message(msg: &Message) -> Result<Self, MessageError> {
        let from = msg.sender()?;
        let text = msg.require_text(field::CONTENT)?.to_string();
        Ok(Self { from, text })
    }
}

/// Advertisement of a peer's reachable endpoint: the only kind the registry ingests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointAdvertisement {
    pub peer_id: PeerId,
    /// Display name; some peers publish without one.
    pub name: Option<String>,
    pub description: Option<String>,
    pub endpoint: EndpointDescriptor,
}

/// Published descriptor. Transports may surface kinds the core does not understand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Advertisement {
    Endpoint(EndpointAdvertisement),
    Other { kind: String },
}

/// Discovery query. All filters empty means "any advertisement from anyone".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryQuery {
    pub target: Option<PeerId>,
    pub attribute: Option<String>,
    pub value: Option<String>,
    pub max_results: u32,
}

impl DiscoveryQuery {
    /// Unfiltered query bounded to `max_results` answers.
    pub fn any(max_results: u32) -> Self {
        Self {
            target: None,
            attribute: None,
            value: None,
            max_results,
        }
    }
}

/// One asynchronous answer to a query, or a remote publish observed by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryResponse {
    /// Whoever sent the response, for logging.
    pub source: String,
    pub advertisements: Vec<Advertisement>,
}
