//! Channel sessions, their registry and the event lifecycle glue.

use crate::call::{CallStore, CallUpdate};
use crate::catalog::CampaignCatalog;
use crate::pbx::{hangup_cause_label, ChannelEvent, ChannelEventSink, PbxClient};
use crate::push::PushRegistry;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{error, warn};

pub mod actions;
pub mod session;

pub use actions::{Action, GatherSpec};
pub use session::{ChannelSession, PendingAction};

/// Weak back-reference table: lookup only, ownership stays with the
/// lifecycle that created the session.
#[derive(Default)]
pub struct ChannelRegistry {
    sessions: RwLock<HashMap<String, Arc<ChannelSession>>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, session: Arc<ChannelSession>) {
        self.sessions
            .write()
            .unwrap()
            .insert(session.channel_id.clone(), session);
    }

    pub fn deregister(&self, channel_id: &str) {
        self.sessions.write().unwrap().remove(channel_id);
    }

    pub fn get(&self, channel_id: &str) -> Option<Arc<ChannelSession>> {
        self.sessions.read().unwrap().get(channel_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Routes demuxed PBX events into sessions, call metadata and push.
pub struct CallLifecycle {
    pub registry: Arc<ChannelRegistry>,
    pub calls: Arc<CallStore>,
    pub push: Arc<PushRegistry>,
    pub pbx: Arc<dyn PbxClient>,
    pub catalog: Arc<CampaignCatalog>,
    pub action_base_url: String,
}

impl CallLifecycle {
    /// Campaigns without an `answer` step open on their menu.
    fn entry_status(&self, campaign: &str) -> &'static str {
        if self.catalog.lookup(campaign, "answer").is_some() {
            "answer"
        } else if self.catalog.lookup(campaign, "options").is_some() {
            "options"
        } else {
            "answer"
        }
    }

    async fn on_stasis(&self, channel_id: &str) {
        if let Err(e) = self.pbx.answer(channel_id).await {
            warn!(channel_id, "answer failed: {}", e);
        }
        self.calls.update(
            channel_id,
            CallUpdate {
                state: Some("answered".to_string()),
                answered_at: Some(Utc::now()),
                ..Default::default()
            },
        );
        self.push.send(channel_id, json!({"status": "answered"}));

        let Some(session) = self.registry.get(channel_id) else {
            warn!(channel_id, "stasis for unknown channel");
            return;
        };
        let Some(call) = self.calls.get(channel_id) else {
            warn!(channel_id, "stasis for channel without call data");
            return;
        };
        let entry = self.entry_status(&call.campaign);
        let url = format!("{}/action/{}", self.action_base_url, entry);
        session.start(&url).await;
    }

    async fn on_hangup(&self, channel_id: &str, cause: Option<u32>) {
        let duration = self
            .calls
            .get(channel_id)
            .and_then(|call| call.answered_at)
            .map(|at| (Utc::now() - at).num_seconds().max(0) as u64)
            .unwrap_or(0);
        self.push.mark_terminal(
            channel_id,
            json!({
                "status": "completed",
                "callDuration": duration,
                "hangupCause": hangup_cause_label(cause),
            }),
        );
        if let Some(session) = self.registry.get(channel_id) {
            session.destroy().await;
        }
        self.calls.remove(channel_id);
    }
}

#[async_trait]
impl ChannelEventSink for CallLifecycle {
    async fn on_event(&self, event: ChannelEvent) {
        match event {
            ChannelEvent::StasisEntered { channel_id } => self.on_stasis(&channel_id).await,
            ChannelEvent::Dtmf { channel_id, digit } => {
                if let Some(session) = self.registry.get(&channel_id) {
                    session.on_dtmf(digit).await;
                }
            }
            ChannelEvent::PlaybackFinished {
                channel_id,
                playback_id,
            } => {
                if let Some(session) = self.registry.get(&channel_id) {
                    session.on_playback_finished(&playback_id).await;
                }
            }
            ChannelEvent::Ringing { channel_id } => {
                self.push.send(&channel_id, json!({"status": "ringing"}));
            }
            ChannelEvent::Hangup { channel_id, cause } => {
                self.on_hangup(&channel_id, cause).await;
            }
            ChannelEvent::ServerFailed => {
                error!("pbx event stream failed permanently");
            }
        }
    }
}
