//! Ring protocol messages.
//!
//! [Message] is what the rest of the crate works with; the flat bencoded
//! representation that actually goes over the wire lives in `internal`.

mod internal;

use serde::{Deserialize, Serialize};

use crate::common::RingId;

use internal::WireMessage;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "WireMessage", try_from = "WireMessage")]
/// One unit of the ring protocol, one variant per message kind.
pub enum Message {
    /// First message on a freshly dialed connection, carrying the dialer's id.
    ConnectionRequest { id: RingId },
    /// Carries the acceptor's id so the dialer can link it.
    ConnectionAccepted { id: RingId },

    GetPredecessor,
    /// `result` is `None` while the responder does not know its predecessor.
    GetPredecessorResponse { result: Option<RingId> },

    GetSuccessor,
    GetSuccessorResponse { result: RingId },

    /// `origin` is stamped by the first hop and forwarded unchanged.
    FindPredecessor {
        target: RingId,
        origin: Option<RingId>,
    },
    FindPredecessorResponse {
        target: RingId,
        success: bool,
        result: Option<RingId>,
    },

    FindSuccessor { target: RingId },
    FindSuccessorResponse {
        target: RingId,
        success: bool,
        result: Option<RingId>,
    },

    /// "I think I might be your predecessor"
    Notify { target: RingId },
}

impl Message {
    /// The wire discriminant of this message.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::ConnectionRequest { .. } => "connection_request",
            Message::ConnectionAccepted { .. } => "connection_accepted",
            Message::GetPredecessor => "get_predecessor",
            Message::GetPredecessorResponse { .. } => "get_predecessor_response",
            Message::GetSuccessor => "get_successor",
            Message::GetSuccessorResponse { .. } => "get_successor_response",
            Message::FindPredecessor { .. } => "find_predecessor",
            Message::FindPredecessorResponse { .. } => "find_predecessor_response",
            Message::FindSuccessor { .. } => "find_successor",
            Message::FindSuccessorResponse { .. } => "find_successor_response",
            Message::Notify { .. } => "notify",
        }
    }

    /// Returns true if `self` is the reply to `request`.
    ///
    /// Lookups are matched on their target as well, so concurrent lookups
    /// sharing one connection each get their own answer.
    pub fn is_response_to(&self, request: &Message) -> bool {
        match (request, self) {
            (Message::ConnectionRequest { .. }, Message::ConnectionAccepted { .. }) => true,
            (Message::GetPredecessor, Message::GetPredecessorResponse { .. }) => true,
            (Message::GetSuccessor, Message::GetSuccessorResponse { .. }) => true,
            (
                Message::FindPredecessor { target, .. },
                Message::FindPredecessorResponse { target: answered, .. },
            ) => target == answered,
            (
                Message::FindSuccessor { target },
                Message::FindSuccessorResponse { target: answered, .. },
            ) => target == answered,
            _ => false,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn round_trip(message: Message) {
        let bytes = serde_bencode::to_bytes(&message).unwrap();
        let decoded: Message = serde_bencode::from_bytes(&bytes).unwrap();

        assert_eq!(decoded, message);
    }

    #[test]
    fn optional_fields() {
        round_trip(Message::FindPredecessor {
            target: RingId(42),
            origin: None,
        });
        round_trip(Message::FindPredecessor {
            target: RingId(42),
            origin: Some(RingId(u32::MAX)),
        });
        round_trip(Message::GetPredecessorResponse { result: None });
        round_trip(Message::FindSuccessorResponse {
            target: RingId(1),
            success: false,
            result: None,
        });
        round_trip(Message::ConnectionAccepted { id: RingId(0) });
    }

    #[test]
    fn missing_required_field_is_rejected() {
        let bytes = b"d1:k6:notifye";

        assert!(serde_bencode::from_bytes::<Message>(bytes).is_err());
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let bytes = b"d1:k4:pinge";

        assert!(serde_bencode::from_bytes::<Message>(bytes).is_err());
    }

    #[test]
    fn lookups_correlate_on_target() {
        let request = Message::FindSuccessor { target: RingId(7) };

        assert!(Message::FindSuccessorResponse {
            target: RingId(7),
            success: true,
            result: Some(RingId(9)),
        }
        .is_response_to(&request));
        assert!(!Message::FindSuccessorResponse {
            target: RingId(8),
            success: true,
            result: Some(RingId(9)),
        }
        .is_response_to(&request));
        assert!(!Message::GetSuccessorResponse { result: RingId(7) }.is_response_to(&request));
    }
}
