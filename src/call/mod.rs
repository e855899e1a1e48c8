//! Per-call metadata store with background expiry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub mod queue;

pub use queue::OriginationQueue;

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const MAX_CALL_AGE: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GatherStage {
    First,
    Second,
}

#[derive(Debug, Clone, Serialize)]
pub struct CallData {
    pub call_id: String,
    pub state: String,
    pub campaign: String,
    pub created_at: DateTime<Utc>,
    pub answered_at: Option<DateTime<Utc>>,
    pub selected_option: Option<String>,
    pub gather_stage: Option<GatherStage>,
}

/// Partial update merged into an existing record.
#[derive(Debug, Default)]
pub struct CallUpdate {
    pub state: Option<String>,
    pub answered_at: Option<DateTime<Utc>>,
    pub selected_option: Option<String>,
    pub gather_stage: Option<GatherStage>,
}

pub struct CallStore {
    calls: Mutex<HashMap<String, CallData>>,
    max_age: Duration,
    sweep_interval: Duration,
}

impl CallStore {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(HashMap::new()),
            max_age: MAX_CALL_AGE,
            sweep_interval: SWEEP_INTERVAL,
        }
    }

    pub fn with_expiry(mut self, max_age: Duration, sweep_interval: Duration) -> Self {
        self.max_age = max_age;
        self.sweep_interval = sweep_interval;
        self
    }

    pub fn save(&self, call_id: &str, state: &str, campaign: &str) {
        let mut calls = self.calls.lock().unwrap();
        calls.insert(
            call_id.to_string(),
            CallData {
                call_id: call_id.to_string(),
                state: state.to_string(),
                campaign: campaign.to_string(),
                created_at: Utc::now(),
                answered_at: None,
                selected_option: None,
                gather_stage: None,
            },
        );
    }

    /// Merge the update; a missing record is a no-op.
    pub fn update(&self, call_id: &str, update: CallUpdate) {
        let mut calls = self.calls.lock().unwrap();
        if let Some(call) = calls.get_mut(call_id) {
            if let Some(state) = update.state {
                call.state = state;
            }
            if let Some(at) = update.answered_at {
                call.answered_at = Some(at);
            }
            if let Some(option) = update.selected_option {
                call.selected_option = Some(option);
            }
            if let Some(stage) = update.gather_stage {
                call.gather_stage = Some(stage);
            }
        }
    }

    pub fn get(&self, call_id: &str) -> Option<CallData> {
        self.calls.lock().unwrap().get(call_id).cloned()
    }

    pub fn remove(&self, call_id: &str) -> Option<CallData> {
        self.calls.lock().unwrap().remove(call_id)
    }

    pub fn len(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn sweep(&self) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.max_age).unwrap_or(chrono::Duration::zero());
        let mut calls = self.calls.lock().unwrap();
        let before = calls.len();
        calls.retain(|_, call| call.created_at > cutoff);
        before - calls.len()
    }

    pub async fn run_sweeper(&self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = sleep(self.sweep_interval) => {
                    let removed = self.sweep();
                    if removed > 0 {
                        debug!(removed, "swept stale calls");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_save_overwrites() {
        let store = CallStore::new();
        store.save("ch-1", "created", "acme");
        store.update(
            "ch-1",
            CallUpdate {
                selected_option: Some("1".to_string()),
                ..Default::default()
            },
        );
        store.save("ch-1", "created", "acme");
        assert!(store.get("ch-1").unwrap().selected_option.is_none());
    }

    #[test]
    fn test_update_merges_and_ignores_missing() {
        let store = CallStore::new();
        store.save("ch-1", "created", "acme");
        store.update(
            "ch-1",
            CallUpdate {
                state: Some("gather1".to_string()),
                gather_stage: Some(GatherStage::Second),
                ..Default::default()
            },
        );
        let call = store.get("ch-1").unwrap();
        assert_eq!(call.state, "gather1");
        assert_eq!(call.gather_stage, Some(GatherStage::Second));
        assert_eq!(call.campaign, "acme");

        // unknown id is a no-op, not a panic
        store.update(
            "ch-missing",
            CallUpdate {
                state: Some("x".to_string()),
                ..Default::default()
            },
        );
        assert!(store.get("ch-missing").is_none());
    }

    #[tokio::test]
    async fn test_sweeper_removes_old_entries() {
        let store = Arc::new(
            CallStore::new().with_expiry(Duration::from_millis(40), Duration::from_millis(20)),
        );
        store.save("ch-1", "created", "acme");

        let cancel = CancellationToken::new();
        let sweeper = store.clone();
        let task_cancel = cancel.clone();
        tokio::spawn(async move { sweeper.run_sweeper(task_cancel).await });

        sleep(Duration::from_millis(120)).await;
        assert!(store.get("ch-1").is_none());
        cancel.cancel();
    }
}
