//! Devices and the ordered session roster.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Transport-assigned peer identifier. Only unique within one session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    /// Reserved id of the leader's own, locally synthesized roster entry.
    pub const LOCAL: &'static str = "self";

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The id used for this device's own entry in a leader roster.
    pub fn local() -> Self {
        Self(Self::LOCAL.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// One participant in a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub peer_id: PeerId,
    pub display_name: String,
    pub is_leader: bool,
    /// Set on the entry describing the device holding this copy of the roster.
    pub is_self: bool,
}

impl Device {
    /// A follower as seen by the leader.
    pub fn follower(peer_id: PeerId, display_name: impl Into<String>) -> Self {
        Self {
            peer_id,
            display_name: display_name.into(),
            is_leader: false,
            is_self: false,
        }
    }

    /// The leader's own entry.
    pub fn local_leader(display_name: impl Into<String>) -> Self {
        Self {
            peer_id: PeerId::local(),
            display_name: display_name.into(),
            is_leader: true,
            is_self: true,
        }
    }
}

/// Ordered list of session devices. A device's index is its arrangement slot.
///
/// Invariants (checked by [`Roster::validate`]): at most one leader, at most one
/// entry marked as self, no duplicate peer ids.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Roster(Vec<Device>);

impl Roster {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Build a roster, rejecting one that breaks an invariant.
    pub fn from_devices(devices: Vec<Device>) -> Result<Self> {
        let roster = Self(devices);
        roster.validate()?;
        Ok(roster)
    }

    /// The leader's view: its own entry at slot 0, then followers in join order.
    pub fn for_leader(leader_name: &str, followers: &[Device]) -> Self {
        let mut devices = Vec::with_capacity(followers.len() + 1);
        devices.push(Device::local_leader(leader_name));
        devices.extend(followers.iter().map(|f| Device {
            is_leader: false,
            is_self: false,
            ..f.clone()
        }));
        Self(devices)
    }

    /// Copy of this roster as `peer` should see it: only `peer`'s entry is self.
    pub fn viewed_by(&self, peer: &PeerId) -> Self {
        Self(
            self.0
                .iter()
                .map(|d| Device {
                    is_self: d.peer_id == *peer,
                    ..d.clone()
                })
                .collect(),
        )
    }

    pub fn validate(&self) -> Result<()> {
        let leaders = self.0.iter().filter(|d| d.is_leader).count();
        if leaders > 1 {
            return Err(Error::InvalidRoster(format!("{} leaders", leaders)));
        }
        if let Some(slot) = self.0.iter().position(|d| d.is_leader).filter(|&slot| slot != 0) {
            return Err(Error::InvalidRoster(format!("leader at slot {}", slot)));
        }
        let selves = self.0.iter().filter(|d| d.is_self).count();
        if selves > 1 {
            return Err(Error::InvalidRoster(format!("{} self entries", selves)));
        }
        let mut seen = HashSet::new();
        for device in &self.0 {
            if !seen.insert(&device.peer_id) {
                return Err(Error::InvalidRoster(format!(
                    "duplicate peer {}",
                    device.peer_id
                )));
            }
        }
        Ok(())
    }

    pub fn devices(&self) -> &[Device] {
        &self.0
    }

    pub fn into_devices(self) -> Vec<Device> {
        self.0
    }

    pub fn iter(&self) -> impl Iterator<Item = &Device> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn slot_of(&self, peer: &PeerId) -> Option<usize> {
        self.0.iter().position(|d| d.peer_id == *peer)
    }

    /// Slot of the entry marked as self.
    pub fn self_slot(&self) -> Option<usize> {
        self.0.iter().position(|d| d.is_self)
    }

    pub fn leader(&self) -> Option<&Device> {
        self.0.iter().find(|d| d.is_leader)
    }
}

impl From<Roster> for Vec<Device> {
    fn from(roster: Roster) -> Self {
        roster.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn followers() -> Vec<Device> {
        vec![
            Device::follower(PeerId::new("ep-1"), "Viola"),
            Device::follower(PeerId::new("ep-2"), "Cello"),
        ]
    }

    #[test]
    fn leader_roster_puts_leader_first() {
        let roster = Roster::for_leader("Violin I", &followers());

        assert_eq!(roster.len(), 3);
        assert_eq!(roster.devices()[0].peer_id, PeerId::local());
        assert!(roster.devices()[0].is_leader);
        assert_eq!(roster.self_slot(), Some(0));
        assert_eq!(roster.slot_of(&PeerId::new("ep-2")), Some(2));
        assert_eq!(roster.leader().map(|d| d.display_name.as_str()), Some("Violin I"));
        roster.validate().unwrap();
    }

    #[test]
    fn leader_roster_strips_follower_flags() {
        let mut sneaky = followers();
        sneaky[0].is_leader = true;
        sneaky[1].is_self = true;

        let roster = Roster::for_leader("Violin I", &sneaky);

        assert_eq!(roster.iter().filter(|d| d.is_leader).count(), 1);
        assert_eq!(roster.self_slot(), Some(0));
    }

    #[test]
    fn viewed_by_marks_only_recipient() {
        let roster = Roster::for_leader("Violin I", &followers());

        let view = roster.viewed_by(&PeerId::new("ep-2"));

        assert_eq!(view.self_slot(), Some(2));
        assert!(!view.devices()[0].is_self);
        assert!(view.devices()[0].is_leader);
        view.validate().unwrap();
    }

    #[test]
    fn validate_rejects_two_leaders() {
        let mut devices = Roster::for_leader("A", &followers()).into_devices();
        devices[1].is_leader = true;
        assert!(matches!(
            Roster::from_devices(devices),
            Err(Error::InvalidRoster(_))
        ));
    }

    #[test]
    fn validate_rejects_leader_outside_slot_zero() {
        let mut devices = followers();
        devices[0].is_self = true;
        devices.push(Device::local_leader("Violin I"));
        assert!(matches!(
            Roster::from_devices(devices),
            Err(Error::InvalidRoster(_))
        ));
    }

    #[test]
    fn validate_rejects_duplicates_and_two_selves() {
        let dup = vec![
            Device::follower(PeerId::new("x"), "a"),
            Device::follower(PeerId::new("x"), "b"),
        ];
        assert!(Roster::from_devices(dup).is_err());

        let mut selves = followers();
        selves[0].is_self = true;
        selves[1].is_self = true;
        assert!(Roster::from_devices(selves).is_err());
    }

    #[test]
    fn empty_roster_is_valid() {
        let roster = Roster::from_devices(Vec::new()).unwrap();
        assert!(roster.is_empty());
        assert_eq!(roster.self_slot(), None);
        assert!(roster.leader().is_none());
    }
}
