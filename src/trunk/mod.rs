//! Outbound SIP trunks and their time-limited tenant reservations.

use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

pub mod inventory;
pub mod store;

pub use store::TrunkStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrunkKind {
    CustomOrTelnyx,
    Other,
}

impl TrunkKind {
    pub fn from_trunk_id(trunk_id: &str) -> Self {
        if trunk_id.starts_with("telnyx_") || trunk_id.starts_with("custom_") {
            TrunkKind::CustomOrTelnyx
        } else {
            TrunkKind::Other
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trunk {
    pub trunk_id: String,
    pub phone_numbers: Vec<String>,
    pub is_verified: bool,
    pub kind: TrunkKind,
}

impl Trunk {
    pub fn new(trunk_id: impl Into<String>, phone_numbers: &str, is_verified: bool) -> Self {
        let trunk_id = trunk_id.into();
        let kind = TrunkKind::from_trunk_id(&trunk_id);
        let phone_numbers = phone_numbers
            .split(',')
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty())
            .collect();
        Self {
            trunk_id,
            phone_numbers,
            is_verified,
            kind,
        }
    }

    /// Concurrent-assignment cap. `None` means unlimited.
    pub fn usage_cap(&self) -> Option<u32> {
        match self.kind {
            TrunkKind::Other => None,
            TrunkKind::CustomOrTelnyx if self.is_verified => Some(9),
            TrunkKind::CustomOrTelnyx => Some(4),
        }
    }

    /// One caller id is chosen uniformly at random per origination.
    pub fn random_number(&self) -> Option<String> {
        self.phone_numbers
            .choose(&mut rand::thread_rng())
            .cloned()
    }
}

/// Wire shape of one inventory entry, `sip_phone` possibly comma-separated.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TrunkInventoryEntry {
    pub sip_id: String,
    pub sip_phone: String,
    #[serde(default)]
    pub sip_verified: bool,
}

impl From<&TrunkInventoryEntry> for Trunk {
    fn from(entry: &TrunkInventoryEntry) -> Self {
        Trunk::new(entry.sip_id.clone(), &entry.sip_phone, entry.sip_verified)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TrunkAssignment {
    pub assignment_id: String,
    pub trunk_id: String,
    pub trunk: Trunk,
    pub assigned_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_from_prefix() {
        assert_eq!(
            TrunkKind::from_trunk_id("telnyx_0017"),
            TrunkKind::CustomOrTelnyx
        );
        assert_eq!(
            TrunkKind::from_trunk_id("custom_A"),
            TrunkKind::CustomOrTelnyx
        );
        assert_eq!(TrunkKind::from_trunk_id("vendorx_9"), TrunkKind::Other);
    }

    #[test]
    fn test_usage_caps() {
        let unverified = Trunk::new("custom_A", "15550001111", false);
        assert_eq!(unverified.usage_cap(), Some(4));

        let verified = Trunk::new("telnyx_B", "15550001111", true);
        assert_eq!(verified.usage_cap(), Some(9));

        let other = Trunk::new("vendorx_C", "15550001111", false);
        assert_eq!(other.usage_cap(), None);
    }

    #[test]
    fn test_phone_numbers_split() {
        let trunk = Trunk::new("custom_A", "15550001111, 15550002222 ,", false);
        assert_eq!(trunk.phone_numbers.len(), 2);
        let number = trunk.random_number().unwrap();
        assert!(trunk.phone_numbers.contains(&number));
    }
}
