//! Session messages exchanged between a leader and its followers.

use std::fmt;

use serde::{Deserialize, Serialize};
use tutti_store::ContentHash;

use crate::device::Roster;

/// Shared logical page offset chosen by the leader.
pub type BookPage = u32;

/// Page turn direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Next,
    Previous,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Next => write!(f, "Next"),
            Self::Previous => write!(f, "Previous"),
        }
    }
}

/// Identity of a document, independent of how its bytes travel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentDescriptor {
    pub name: String,
    pub size_bytes: u64,
    pub content_hash: ContentHash,
}

impl DocumentDescriptor {
    pub fn new(name: impl Into<String>, size_bytes: u64, content_hash: ContentHash) -> Self {
        Self {
            name: name.into(),
            size_bytes,
            content_hash,
        }
    }
}

/// Wire messages. Encoded as a JSON object whose `type` field names the variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Message {
    /// Leader announces the active document.
    FileInfo(DocumentDescriptor),

    /// Follower asks the leader to send the announced document.
    FileRequest,

    /// Leader moved the shared book page.
    #[serde(rename_all = "camelCase")]
    PageChanged { book_page: BookPage },

    /// Leader's authoritative roster, in slot order.
    ArrangementUpdate { devices: Roster },

    /// Follower asks the leader to turn the page.
    TurnRequest { direction: Direction },
}

impl Message {
    /// Variant name, as carried in the `type` field.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::FileInfo(_) => "FileInfo",
            Self::FileRequest => "FileRequest",
            Self::PageChanged { .. } => "PageChanged",
            Self::ArrangementUpdate { .. } => "ArrangementUpdate",
            Self::TurnRequest { .. } => "TurnRequest",
        }
    }
}
