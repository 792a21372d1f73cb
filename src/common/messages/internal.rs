use serde::{Deserialize, Serialize};

use crate::common::RingId;

use super::Message;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
/// Flat dictionary form of a [Message] as it is bencoded on the wire.
pub struct WireMessage {
    #[serde(rename = "k")]
    pub kind: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RingId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<RingId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<RingId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<RingId>,

    // Bencode has no booleans.
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "ok")]
    pub success: Option<i32>,
}

impl From<Message> for WireMessage {
    fn from(message: Message) -> Self {
        let kind = message.kind().to_string();

        match message {
            Message::ConnectionRequest { id } | Message::ConnectionAccepted { id } => WireMessage {
                kind,
                id: Some(id),
                ..Default::default()
            },
            Message::GetPredecessor | Message::GetSuccessor => WireMessage {
                kind,
                ..Default::default()
            },
            Message::GetPredecessorResponse { result } => WireMessage {
                kind,
                result,
                ..Default::default()
            },
            Message::GetSuccessorResponse { result } => WireMessage {
                kind,
                result: Some(result),
                ..Default::default()
            },
            Message::FindPredecessor { target, origin } => WireMessage {
                kind,
                target: Some(target),
                origin,
                ..Default::default()
            },
            Message::FindPredecessorResponse {
                target,
                success,
                result,
            }
            | Message::FindSuccessorResponse {
                target,
                success,
                result,
            } => WireMessage {
                kind,
                target: Some(target),
                result,
                success: Some(success as i32),
                ..Default::default()
            },
            Message::FindSuccessor { target } | Message::Notify { target } => WireMessage {
                kind,
                target: Some(target),
                ..Default::default()
            },
        }
    }
}

impl TryFrom<WireMessage> for Message {
    type Error = String;

    fn try_from(wire: WireMessage) -> Result<Self, Self::Error> {
        let kind = wire.kind.as_str();
        let required = |field: Option<RingId>, name: &str| {
            field.ok_or_else(|| format!("{kind} is missing `{name}`"))
        };
        let success = || {
            wire.success
                .map(|flag| flag != 0)
                .ok_or_else(|| format!("{kind} is missing `ok`"))
        };

        let message = match kind {
            "connection_request" => Message::ConnectionRequest {
                id: required(wire.id, "id")?,
            },
            "connection_accepted" => Message::ConnectionAccepted {
                id: required(wire.id, "id")?,
            },
            "get_predecessor" => Message::GetPredecessor,
            "get_predecessor_response" => Message::GetPredecessorResponse {
                result: wire.result,
            },
            "get_successor" => Message::GetSuccessor,
            "get_successor_response" => Message::GetSuccessorResponse {
                result: required(wire.result, "result")?,
            },
            "find_predecessor" => Message::FindPredecessor {
                target: required(wire.target, "target")?,
                origin: wire.origin,
            },
            "find_predecessor_response" => Message::FindPredecessorResponse {
                target: required(wire.target, "target")?,
                success: success()?,
                result: wire.result,
            },
            "find_successor" => Message::FindSuccessor {
                target: required(wire.target, "target")?,
            },
            "find_successor_response" => Message::FindSuccessorResponse {
                target: required(wire.target, "target")?,
                success: success()?,
                result: wire.result,
            },
            "notify" => Message::Notify {
                target: required(wire.target, "target")?,
            },
            other => return Err(format!("unknown message kind `{other}`")),
        };

        Ok(message)
    }
}
