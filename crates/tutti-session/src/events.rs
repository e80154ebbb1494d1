//! What the coordinator reports to the UI layer.

use std::fmt;
use std::path::PathBuf;

use tutti_protocol::{BookPage, Device, DocumentDescriptor, PeerId, Roster};

/// Coordinator lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Idle,
    Advertising,
    Discovering,
    Leading,
    Following,
}

impl SessionState {
    pub fn role(&self) -> Role {
        match self {
            Self::Advertising | Self::Leading => Role::Leader,
            Self::Following => Role::Follower,
            Self::Idle | Self::Discovering => Role::None,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Advertising => "advertising",
            Self::Discovering => "discovering",
            Self::Leading => "leading",
            Self::Following => "following",
        };
        f.write_str(s)
    }
}

/// Role derived from [`SessionState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    None,
    Leader,
    Follower,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged(SessionState),
    /// Human-readable progress line.
    Status(String),
    /// The active document is available locally at `path`.
    DocumentReady {
        document: DocumentDescriptor,
        path: PathBuf,
        last_viewed_page: Option<u32>,
    },
    /// This device should now show `local_page`.
    PageChanged {
        book_page: BookPage,
        slot: usize,
        local_page: u32,
    },
    RosterChanged(Roster),
    FollowerJoined(Device),
    LeaderFound(PeerId),
    NoLeaderFound,
    DisconnectedFromLeader,
    AdvertisingStarted,
    AdvertisingFailed,
    LeadingStopped,
}

/// Point-in-time copy of the coordinator's state.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub roster: Roster,
    pub document: Option<DocumentDescriptor>,
    pub document_ready: bool,
    pub book_page: BookPage,
    pub slot: Option<usize>,
    pub page_count: Option<u32>,
    pub leader: Option<PeerId>,
    pub pending_transfers: usize,
}

impl SessionSnapshot {
    pub fn role(&self) -> Role {
        self.state.role()
    }
}
