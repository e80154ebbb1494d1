//! JSON wire codec for [`Message`].
//!
//! Decoding fails closed: an unknown `type`, a missing or mistyped field, or a
//! malformed content hash is an error. Nothing is defaulted.

use crate::error::{Error, Result};
use crate::message::Message;

/// Serialize a message to its wire bytes.
pub fn encode(message: &Message) -> Result<Vec<u8>> {
    serde_json::to_vec(message).map_err(Error::Encode)
}

/// Parse wire bytes into a message.
pub fn decode(bytes: &[u8]) -> Result<Message> {
    serde_json::from_slice(bytes).map_err(Error::Decode)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Device, PeerId, Roster};
    use crate::message::{Direction, DocumentDescriptor};
    use serde_json::{json, Value};
    use tutti_store::hash_bytes;

    fn roundtrip(message: Message) {
        let bytes = encode(&message).unwrap();
        let back = decode(&bytes).unwrap();
        assert_eq!(back, message);
        assert_eq!(encode(&back).unwrap(), bytes);
    }

    fn as_json(message: &Message) -> Value {
        serde_json::from_slice(&encode(message).unwrap()).unwrap()
    }

    fn descriptor() -> DocumentDescriptor {
        DocumentDescriptor::new("score.pdf", 12345, hash_bytes(b"score"))
    }

    #[test]
    fn every_variant_roundtrips() {
        let roster = Roster::for_leader("Leader", &[Device::follower(PeerId::new("ep-1"), "Viola")])
            .viewed_by(&PeerId::new("ep-1"));

        roundtrip(Message::FileInfo(descriptor()));
        roundtrip(Message::FileInfo(DocumentDescriptor::new("", 0, hash_bytes(b""))));
        roundtrip(Message::FileRequest);
        roundtrip(Message::PageChanged { book_page: 0 });
        roundtrip(Message::PageChanged { book_page: u32::MAX });
        roundtrip(Message::ArrangementUpdate { devices: roster });
        roundtrip(Message::ArrangementUpdate { devices: Roster::new() });
        roundtrip(Message::TurnRequest { direction: Direction::Next });
        roundtrip(Message::TurnRequest { direction: Direction::Previous });
    }

    #[test]
    fn wire_shape_uses_type_tag_and_camel_case() {
        let d = descriptor();
        assert_eq!(
            as_json(&Message::FileInfo(d.clone())),
            json!({
                "type": "FileInfo",
                "name": "score.pdf",
                "sizeBytes": 12345,
                "contentHash": d.content_hash.to_hex(),
            })
        );
        assert_eq!(as_json(&Message::FileRequest), json!({ "type": "FileRequest" }));
        assert_eq!(
            as_json(&Message::PageChanged { book_page: 6 }),
            json!({ "type": "PageChanged", "bookPage": 6 })
        );
        assert_eq!(
            as_json(&Message::TurnRequest { direction: Direction::Previous }),
            json!({ "type": "TurnRequest", "direction": "Previous" })
        );

        let roster = Roster::for_leader("Leader", &[]);
        assert_eq!(
            as_json(&Message::ArrangementUpdate { devices: roster }),
            json!({
                "type": "ArrangementUpdate",
                "devices": [{
                    "peerId": "self",
                    "displayName": "Leader",
                    "isLeader": true,
                    "isSelf": true,
                }],
            })
        );
    }

    #[test]
    fn unknown_type_is_rejected() {
        let result = decode(br#"{"type":"Shuffle","bookPage":3}"#);
        assert!(matches!(result, Err(Error::Decode(_))));
    }

    #[test]
    fn missing_tag_is_rejected() {
        assert!(decode(br#"{"bookPage":3}"#).is_err());
    }

    #[test]
    fn missing_fields_are_not_defaulted() {
        assert!(decode(br#"{"type":"TurnRequest"}"#).is_err());
        assert!(decode(br#"{"type":"PageChanged"}"#).is_err());
        assert!(decode(br#"{"type":"FileInfo","name":"a.pdf","sizeBytes":1}"#).is_err());
    }

    #[test]
    fn bad_values_are_rejected() {
        assert!(decode(br#"{"type":"TurnRequest","direction":"Sideways"}"#).is_err());
        assert!(decode(br#"{"type":"PageChanged","bookPage":-1}"#).is_err());
        assert!(decode(
            br#"{"type":"FileInfo","name":"a.pdf","sizeBytes":1,"contentHash":"abc"}"#
        )
        .is_err());
        assert!(decode(b"not json at all").is_err());
        assert!(decode(b"").is_err());
    }

    #[test]
    fn kind_matches_wire_tag() {
        let messages = [
            Message::FileInfo(descriptor()),
            Message::FileRequest,
            Message::PageChanged { book_page: 1 },
            Message::ArrangementUpdate { devices: Roster::new() },
            Message::TurnRequest { direction: Direction::Next },
        ];
        for message in messages {
            assert_eq!(as_json(&message)["type"], message.kind());
        }
    }
}
