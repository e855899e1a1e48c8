//! Trunk inventory, per-trunk usage counters and sliding-TTL assignments.

use super::{Trunk, TrunkAssignment};
use crate::{Error, Result};
use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const ASSIGNMENT_TTL: Duration = Duration::from_secs(120);

struct AssignmentEntry {
    assignment: TrunkAssignment,
    expiry: CancellationToken,
}

#[derive(Default)]
struct StoreInner {
    trunks_by_user: HashMap<String, Vec<Trunk>>,
    usage: HashMap<String, u32>,
    assignments: HashMap<String, AssignmentEntry>,
}

pub struct TrunkStore {
    inner: Mutex<StoreInner>,
    ttl: Duration,
}

#[derive(Debug, Serialize)]
pub struct TrunkUsage {
    pub trunk_id: String,
    pub in_use: u32,
    pub cap: Option<u32>,
    pub is_verified: bool,
}

#[derive(Debug, Serialize)]
pub struct TrunkStats {
    pub trunks: Vec<TrunkUsage>,
    pub live_assignments: usize,
}

fn normalize_token(token: &str) -> String {
    token.replace('-', "")
}

impl TrunkStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(StoreInner::default()),
            ttl: ASSIGNMENT_TTL,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Replace the inventory wholesale. Live assignments whose trunk
    /// survives get a refreshed snapshot; assignments whose trunk vanished
    /// are logged and left in place so their next origination fails at the
    /// PBX. Usage counters for vanished trunks are dropped.
    pub fn update_inventory(&self, users_to_trunks: HashMap<String, Vec<Trunk>>) {
        let mut inner = self.inner.lock().unwrap();
        inner.trunks_by_user = users_to_trunks
            .into_iter()
            .map(|(token, trunks)| (normalize_token(&token), trunks))
            .collect();

        let live: HashMap<String, Trunk> = inner
            .trunks_by_user
            .values()
            .flatten()
            .map(|t| (t.trunk_id.clone(), t.clone()))
            .collect();

        for entry in inner.assignments.values_mut() {
            match live.get(&entry.assignment.trunk_id) {
                Some(trunk) => entry.assignment.trunk = trunk.clone(),
                None => warn!(
                    assignment_id = entry.assignment.assignment_id,
                    trunk_id = entry.assignment.trunk_id,
                    "assignment invalidated: trunk gone from inventory"
                ),
            }
        }
        inner.usage.retain(|trunk_id, _| live.contains_key(trunk_id));
    }

    /// First trunk of the user with headroom, in inventory order.
    pub fn find_available(&self, user_token: &str) -> Option<Trunk> {
        let inner = self.inner.lock().unwrap();
        inner
            .trunks_by_user
            .get(&normalize_token(user_token))?
            .iter()
            .find(|trunk| {
                let in_use = inner.usage.get(&trunk.trunk_id).copied().unwrap_or(0);
                trunk.usage_cap().map(|cap| in_use < cap).unwrap_or(true)
            })
            .cloned()
    }

    pub fn assign(self: &Arc<Self>, user_token: &str) -> Result<TrunkAssignment> {
        let assignment = {
            let mut inner = self.inner.lock().unwrap();
            let trunks = inner
                .trunks_by_user
                .get(&normalize_token(user_token))
                .cloned()
                .ok_or_else(|| Error::NotFound(format!("no trunks for user {}", user_token)))?;

            let trunk = trunks
                .iter()
                .find(|trunk| {
                    let in_use = inner.usage.get(&trunk.trunk_id).copied().unwrap_or(0);
                    trunk.usage_cap().map(|cap| in_use < cap).unwrap_or(true)
                })
                .cloned()
                .ok_or_else(|| {
                    Error::NotFound(format!("all trunks at capacity for user {}", user_token))
                })?;

            *inner.usage.entry(trunk.trunk_id.clone()).or_insert(0) += 1;

            let now = Utc::now();
            let assignment = TrunkAssignment {
                assignment_id: uuid::Uuid::new_v4().to_string(),
                trunk_id: trunk.trunk_id.clone(),
                trunk,
                assigned_at: now,
                expires_at: now
                    + chrono::Duration::from_std(self.ttl)
                        .unwrap_or_else(|_| chrono::Duration::zero()),
            };
            let expiry = self.arm_expiry(&assignment.assignment_id);
            inner.assignments.insert(
                assignment.assignment_id.clone(),
                AssignmentEntry {
                    assignment: assignment.clone(),
                    expiry,
                },
            );
            assignment
        };
        info!(
            assignment_id = assignment.assignment_id,
            trunk_id = assignment.trunk_id,
            "trunk assigned"
        );
        Ok(assignment)
    }

    /// Slide the TTL window forward from now.
    pub fn keep_alive(self: &Arc<Self>, assignment_id: &str) -> Result<TrunkAssignment> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner
            .assignments
            .get_mut(assignment_id)
            .ok_or_else(|| Error::NotFound(format!("assignment {}", assignment_id)))?;
        entry.expiry.cancel();
        let now = Utc::now();
        entry.assignment.assigned_at = now;
        entry.assignment.expires_at =
            now + chrono::Duration::from_std(self.ttl).unwrap_or_else(|_| chrono::Duration::zero());
        entry.expiry = self.arm_expiry(assignment_id);
        Ok(entry.assignment.clone())
    }

    pub fn release(&self, assignment_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner
            .assignments
            .remove(assignment_id)
            .ok_or_else(|| Error::NotFound(format!("assignment {}", assignment_id)))?;
        entry.expiry.cancel();
        if let Some(count) = inner.usage.get_mut(&entry.assignment.trunk_id) {
            *count = count.saturating_sub(1);
        }
        debug!(
            assignment_id,
            trunk_id = entry.assignment.trunk_id,
            "assignment released"
        );
        Ok(())
    }

    pub fn lookup(&self, assignment_id: &str) -> Option<TrunkAssignment> {
        let inner = self.inner.lock().unwrap();
        inner
            .assignments
            .get(assignment_id)
            .map(|e| e.assignment.clone())
    }

    pub fn stats(&self) -> TrunkStats {
        let inner = self.inner.lock().unwrap();
        let trunks = inner
            .trunks_by_user
            .values()
            .flatten()
            .map(|trunk| TrunkUsage {
                trunk_id: trunk.trunk_id.clone(),
                in_use: inner.usage.get(&trunk.trunk_id).copied().unwrap_or(0),
                cap: trunk.usage_cap(),
                is_verified: trunk.is_verified,
            })
            .collect();
        TrunkStats {
            trunks,
            live_assignments: inner.assignments.len(),
        }
    }

    fn arm_expiry(self: &Arc<Self>, assignment_id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        let task_token = token.clone();
        let store = self.clone();
        let assignment_id = assignment_id.to_string();
        let ttl = self.ttl;
        tokio::spawn(async move {
            tokio::select! {
                _ = task_token.cancelled() => {}
                _ = sleep(ttl) => {
                    if store.release(&assignment_id).is_ok() {
                        info!(assignment_id, "assignment expired");
                    }
                }
            }
        });
        token
    }

    #[cfg(test)]
    fn usage_of(&self, trunk_id: &str) -> u32 {
        self.inner
            .lock()
            .unwrap()
            .usage
            .get(trunk_id)
            .copied()
            .unwrap_or(0)
    }

    #[cfg(test)]
    fn live_assignments(&self) -> usize {
        self.inner.lock().unwrap().assignments.len()
    }
}
