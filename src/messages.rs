//! # Wire Protocol Messages
//!
//! Every datagram carries one [`Message`]: a [`Header`] followed by a
//! [`MessageBody`]. The body is a closed enum, so the message kind is decided
//! once at decode time and handlers match on it directly.
//!
//! | Request | Response |
//! |---------|----------|
//! | `Ping` | `Pong` |
//! | `FindNode` | `FindNodeResponse` |
//! | `FindValue` | `FindValueResponse` |
//! | `Store` | `StoreResponse` |
//! | `Stats` | `StatsResponse` |
//!
//! Messages are serialized with bincode; decoding is always size-bounded.

use std::net::SocketAddr;

use bincode::Options;
use serde::{Deserialize, Serialize};

use crate::error::{DhtError, Result};
use crate::identity::{Contact, Key, MessageId, NodeId};
use crate::storage::Record;

/// Vendor code written into every header.
pub const VENDOR: [u8; 4] = *b"MJTO";

/// Wire protocol version.
pub const PROTOCOL_VERSION: u16 = 1;

/// Largest datagram the codec will produce or accept.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Largest value a record may carry.
pub const MAX_VALUE_SIZE: usize = 16 * 1024;

/// Upper bound on contacts accepted in a single response.
pub const MAX_CONTACTS_PER_RESPONSE: usize = 100;

/// Upper bound on records carried by one FIND_VALUE response; keeps a reply
/// of full-size values under [`MAX_MESSAGE_SIZE`].
pub const MAX_RECORDS_PER_RESPONSE: usize = 3;

fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_MESSAGE_SIZE as u64)
        .with_fixint_encoding()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub vendor: [u8; 4],
    pub version: u16,
    pub sender: NodeId,
    pub message_id: MessageId,
}

impl Header {
    pub fn new(sender: NodeId, message_id: MessageId) -> Self {
        Self {
            vendor: VENDOR,
            version: PROTOCOL_VERSION,
            sender,
            message_id,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatsKind {
    RouteTable,
    Database,
    Statistics,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreStatus {
    Stored,
    Rejected,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FindValueReply {
    /// Records held under the key, one per publisher, newest first.
    Found(Vec<Record>),
    NotFound(Vec<Contact>),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageBody {
    /// Liveness check. A `shutdown` ping announces that the sender is leaving
    /// and expects no reply.
    Ping { shutdown: bool },
    Pong {
        /// The address the responder saw the ping arrive from.
        external_addr: SocketAddr,
        /// Responder's estimate of the network size.
        estimated_size: u64,
    },
    FindNode { target: NodeId },
    FindNodeResponse { contacts: Vec<Contact> },
    FindValue { key: Key },
    FindValueResponse { reply: FindValueReply },
    Store { record: Record },
    StoreResponse { status: StoreStatus },
    Stats { kind: StatsKind },
    StatsResponse { text: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Ping,
    Pong,
    FindNode,
    FindNodeResponse,
    FindValue,
    FindValueResponse,
    Store,
    StoreResponse,
    Stats,
    StatsResponse,
}

impl MessageBody {
    pub fn kind(&self) -> MessageKind {
        match self {
            MessageBody::Ping { .. } => MessageKind::Ping,
            MessageBody::Pong { .. } => MessageKind::Pong,
            MessageBody::FindNode { .. } => MessageKind::FindNode,
            MessageBody::FindNodeResponse { .. } => MessageKind::FindNodeResponse,
            MessageBody::FindValue { .. } => MessageKind::FindValue,
            MessageBody::FindValueResponse { .. } => MessageKind::FindValueResponse,
            MessageBody::Store { .. } => MessageKind::Store,
            MessageBody::StoreResponse { .. } => MessageKind::StoreResponse,
            MessageBody::Stats { .. } => MessageKind::Stats,
            MessageBody::StatsResponse { .. } => MessageKind::StatsResponse,
        }
    }
}

impl MessageKind {
    pub fn is_response(self) -> bool {
        matches!(
            self,
            MessageKind::Pong
                | MessageKind::FindNodeResponse
                | MessageKind::FindValueResponse
                | MessageKind::StoreResponse
                | MessageKind::StatsResponse
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub header: Header,
    pub body: MessageBody,
}

impl Message {
    pub fn new(header: Header, body: MessageBody) -> Self {
        Self { header, body }
    }

    /// Checks that go beyond what the decoder enforces.
    fn validate(&self) -> Result<()> {
        match &self.body {
            MessageBody::FindNodeResponse { contacts }
            | MessageBody::FindValueResponse {
                reply: FindValueReply::NotFound(contacts),
            } if contacts.len() > MAX_CONTACTS_PER_RESPONSE => Err(DhtError::MessageFormat(
                format!("{} contacts exceeds limit", contacts.len()),
            )),
            MessageBody::FindValueResponse {
                reply: FindValueReply::Found(records),
            } if records.is_empty() || records.len() > MAX_RECORDS_PER_RESPONSE => {
                Err(DhtError::MessageFormat(format!(
                    "{} records in a value response",
                    records.len()
                )))
            }
            MessageBody::FindValueResponse {
                reply: FindValueReply::Found(records),
            } => records.iter().try_for_each(check_value_size),
            MessageBody::Store { record } => check_value_size(record),
            _ => Ok(()),
        }
    }
}

fn check_value_size(record: &Record) -> Result<()> {
    if record.value.len() > MAX_VALUE_SIZE {
        return Err(DhtError::MessageFormat(format!(
            "value of {} bytes exceeds limit",
            record.value.len()
        )));
    }
    Ok(())
}

pub fn encode(message: &Message) -> Result<Vec<u8>> {
    message.validate()?;
    let bytes = bincode_options().serialize(message)?;
    if bytes.len() > MAX_MESSAGE_SIZE {
        return Err(DhtError::MessageFormat(format!(
            "encoded message of {} bytes exceeds limit",
            bytes.len()
        )));
    }
    Ok(bytes)
}

/// Decode one datagram. Trailing bytes, truncation and oversize input are all
/// reported as [`DhtError::MessageFormat`].
pub fn decode(bytes: &[u8]) -> Result<Message> {
    if bytes.len() > MAX_MESSAGE_SIZE {
        return Err(DhtError::MessageFormat(format!(
            "datagram of {} bytes exceeds limit",
            bytes.len()
        )));
    }
    let message: Message = bincode_options().reject_trailing_bytes().deserialize(bytes)?;
    message.validate()?;
    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;

    fn header() -> Header {
        Header::new(NodeId::random(), MessageId::random())
    }

    fn contact(port: u16) -> Contact {
        Contact::new(NodeId::random(), SocketAddr::from(([127, 0, 0, 1], port)))
    }

    #[test]
    fn store_message_keeps_header_and_record() {
        let keypair = Keypair::generate();
        let record = Record::sign(&keypair, NodeId::random(), vec![7u8; 100]);
        let message = Message::new(header(), MessageBody::Store { record: record.clone() });

        let decoded = decode(&encode(&message).unwrap()).unwrap();
        assert_eq!(decoded.header, message.header);
        match decoded.body {
            MessageBody::Store { record: got } => {
                assert_eq!(got, record);
                assert!(got.verify().is_ok());
            }
            other => panic!("unexpected body {other:?}"),
        }
    }

    #[test]
    fn malformed_data_rejected() {
        let garbage = vec![0xFF, 0xFE, 0xFD, 0xFC, 0xFB];
        assert!(matches!(decode(&garbage), Err(DhtError::MessageFormat(_))));

        let message = Message::new(header(), MessageBody::FindNode { target: NodeId::random() });
        let bytes = encode(&message).unwrap();
        let truncated = &bytes[..bytes.len() / 2];
        assert!(matches!(decode(truncated), Err(DhtError::MessageFormat(_))));

        let mut trailing = bytes.clone();
        trailing.push(0);
        assert!(decode(&trailing).is_err());
    }

    #[test]
    fn oversized_inputs_rejected() {
        assert!(decode(&vec![0u8; MAX_MESSAGE_SIZE + 1]).is_err());

        let keypair = Keypair::generate();
        let record = Record::sign(&keypair, NodeId::random(), vec![0u8; MAX_VALUE_SIZE + 1]);
        let message = Message::new(header(), MessageBody::Store { record });
        assert!(encode(&message).is_err());

        let contacts = (0..=MAX_CONTACTS_PER_RESPONSE as u16).map(contact).collect();
        let message = Message::new(header(), MessageBody::FindNodeResponse { contacts });
        assert!(encode(&message).is_err());

        let records = (0..=MAX_RECORDS_PER_RESPONSE)
            .map(|_| Record::sign(&keypair, NodeId::random(), vec![1u8; 8]))
            .collect();
        let message = Message::new(
            header(),
            MessageBody::FindValueResponse { reply: FindValueReply::Found(records) },
        );
        assert!(encode(&message).is_err());

        let message = Message::new(
            header(),
            MessageBody::FindValueResponse { reply: FindValueReply::Found(Vec::new()) },
        );
        assert!(encode(&message).is_err());
    }

    #[test]
    fn full_value_response_fits_datagram() {
        let key = NodeId::random();
        let records = (0..MAX_RECORDS_PER_RESPONSE)
            .map(|_| Record::sign(&Keypair::generate(), key, vec![9u8; MAX_VALUE_SIZE]))
            .collect::<Vec<_>>();
        let message = Message::new(
            header(),
            MessageBody::FindValueResponse { reply: FindValueReply::Found(records.clone()) },
        );
        let decoded = decode(&encode(&message).unwrap()).unwrap();
        assert_eq!(
            decoded.body,
            MessageBody::FindValueResponse { reply: FindValueReply::Found(records) }
        );
    }

    #[test]
    fn kinds_classify_responses() {
        assert!(!MessageBody::Ping { shutdown: false }.kind().is_response());
        assert!(MessageBody::StoreResponse { status: StoreStatus::Stored }.kind().is_response());
        assert!(MessageBody::FindValueResponse {
            reply: FindValueReply::NotFound(vec![contact(1)])
        }
        .kind()
        .is_response());
        assert!(!MessageBody::Stats { kind: StatsKind::RouteTable }.kind().is_response());
    }
}
