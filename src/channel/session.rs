//! Per-channel IVR state machine.
//!
//! One instance per active channel walks the action list for the current
//! step. All mutations happen under the session mutex, so DTMF, playback
//! completion, timer fires and external steering are applied one at a
//! time in arrival order.

use super::actions::{self, Action};
use super::ChannelRegistry;
use crate::pbx::PbxClient;
use crate::{Error, Result};
use chrono::Utc;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Created,
    Answered,
    Running,
    Destroyed,
}

struct Timer {
    id: u64,
    token: CancellationToken,
}

impl Timer {
    fn cancel(&self) {
        self.token.cancel();
    }
}

struct GatherState {
    running: bool,
    collected: String,
    num_digits: u32,
    finish_on_key: Option<char>,
    next_action_url: Option<String>,
    timeout_s: u64,
    timer: Option<Timer>,
}

/// A queued follow-up consumed once the current playback completes.
#[derive(Debug, Clone)]
pub struct PendingAction {
    pub url: String,
    pub params: Vec<(String, String)>,
}

struct SessionState {
    phase: Phase,
    remaining: VecDeque<Action>,
    gather: Option<GatherState>,
    playing: Option<String>,
    current_timeout: u64,
    post_playback_timer: Option<Timer>,
    pending_next: Option<PendingAction>,
    current_status: String,
    timer_seq: u64,
}

pub struct ChannelSession {
    pub channel_id: String,
    pbx: Arc<dyn PbxClient>,
    registry: Arc<ChannelRegistry>,
    http: reqwest::Client,
    cancel: CancellationToken,
    state: Mutex<SessionState>,
}

fn status_segment(url: &str) -> &str {
    let path = url.split('?').next().unwrap_or("");
    path.rsplit('/').next().unwrap_or("")
}

impl ChannelSession {
    pub fn create(
        channel_id: &str,
        pbx: Arc<dyn PbxClient>,
        registry: Arc<ChannelRegistry>,
        http: reqwest::Client,
    ) -> Arc<Self> {
        let session = Arc::new(Self {
            channel_id: channel_id.to_string(),
            pbx,
            registry: registry.clone(),
            http,
            cancel: CancellationToken::new(),
            state: Mutex::new(SessionState {
                phase: Phase::Created,
                remaining: VecDeque::new(),
                gather: None,
                playing: None,
                current_timeout: 0,
                post_playback_timer: None,
                pending_next: None,
                current_status: String::new(),
                timer_seq: 0,
            }),
        });
        registry.register(session.clone());
        session
    }

    /// Begin the dialogue once the channel is under our control.
    pub async fn start(self: &Arc<Self>, entry_url: &str) {
        let mut state = self.state.lock().await;
        if state.phase != Phase::Created {
            return;
        }
        state.phase = Phase::Answered;
        if self.load_actions(&mut state, entry_url, &[]).await.is_err() {
            self.destroy_locked(&mut state).await;
            return;
        }
        state.phase = Phase::Running;
        self.run_next(&mut state).await;
    }

    /// Hot-swap the action script under the running session, overriding
    /// whatever it is currently waiting on.
    pub async fn set_action(self: &Arc<Self>, url: &str, params: &[(String, String)]) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.phase == Phase::Destroyed {
            return Err(Error::NotFound(format!(
                "channel {} is destroyed",
                self.channel_id
            )));
        }
        if let Some(timer) = state.post_playback_timer.take() {
            timer.cancel();
        }
        if let Some(mut gather) = state.gather.take() {
            if let Some(timer) = gather.timer.take() {
                timer.cancel();
            }
        }
        if self.load_actions(&mut state, url, params).await.is_err() {
            self.destroy_locked(&mut state).await;
            return Err(Error::Internal(format!(
                "channel {} failed to load steered actions",
                self.channel_id
            )));
        }
        self.run_next(&mut state).await;
        Ok(())
    }

    pub async fn on_dtmf(self: &Arc<Self>, digit: char) {
        let mut state = self.state.lock().await;
        if state.phase == Phase::Destroyed {
            return;
        }
        // barge-in: any keypress interrupts the current prompt
        if let Some(playback_id) = state.playing.take() {
            if let Err(e) = self.pbx.stop_playback(&playback_id).await {
                debug!(channel_id = self.channel_id, "stop playback: {}", e);
            }
            if let Some(timer) = state.post_playback_timer.take() {
                timer.cancel();
            }
        }

        let Some(gather) = state.gather.as_mut() else {
            debug!(channel_id = self.channel_id, digit = %digit, "digit outside gather dropped");
            return;
        };
        if !gather.running {
            return;
        }

        let finished = if gather.finish_on_key == Some(digit) {
            // the terminator itself is not part of the digits
            true
        } else {
            gather.collected.push(digit);
            gather.finish_on_key.is_none() && gather.collected.len() as u32 >= gather.num_digits
        };
        if !finished {
            return;
        }

        gather.running = false;
        if let Some(timer) = gather.timer.take() {
            timer.cancel();
        }
        let digits = gather.collected.clone();
        let url = gather.next_action_url.clone();
        state.gather = None;

        let Some(url) = url else {
            warn!(channel_id = self.channel_id, "gather completed without action url");
            self.destroy_locked(&mut state).await;
            return;
        };
        let params = vec![("Digits".to_string(), digits)];
        if self.load_actions(&mut state, &url, &params).await.is_err() {
            self.destroy_locked(&mut state).await;
            return;
        }
        self.run_next(&mut state).await;
    }

    pub async fn on_playback_finished(self: &Arc<Self>, playback_id: &str) {
        let mut state = self.state.lock().await;
        if state.phase == Phase::Destroyed {
            return;
        }
        if !playback_id.is_empty() && state.playing.as_deref() != Some(playback_id) {
            debug!(
                channel_id = self.channel_id,
                playback_id, "late playback_finished ignored"
            );
            return;
        }
        state.playing = None;
        if let Some(timer) = state.post_playback_timer.take() {
            timer.cancel();
        }

        if let Some(pending) = state.pending_next.take() {
            if self
                .load_actions(&mut state, &pending.url, &pending.params)
                .await
                .is_err()
            {
                self.destroy_locked(&mut state).await;
                return;
            }
            self.run_next(&mut state).await;
            return;
        }

        if state.gather.as_ref().map(|g| g.running).unwrap_or(false) {
            // the gather timeout window only opens once audio completes
            let secs = state.gather.as_ref().map(|g| g.timeout_s).unwrap_or(5);
            let timer = self.arm_gather_timer(&mut state, secs);
            if let Some(gather) = state.gather.as_mut() {
                gather.timer = Some(timer);
            }
            return;
        }

        if state.remaining.is_empty() {
            let secs = state.current_timeout;
            let timer = self.arm_post_timer(&mut state, secs);
            state.post_playback_timer = Some(timer);
            return;
        }

        self.run_next(&mut state).await;
    }

    pub async fn destroy(self: &Arc<Self>) {
        let mut state = self.state.lock().await;
        self.destroy_locked(&mut state).await;
    }

    async fn destroy_locked(&self, state: &mut SessionState) {
        if state.phase == Phase::Destroyed {
            return;
        }
        state.phase = Phase::Destroyed;
        if let Some(timer) = state.post_playback_timer.take() {
            timer.cancel();
        }
        if let Some(mut gather) = state.gather.take() {
            if let Some(timer) = gather.timer.take() {
                timer.cancel();
            }
        }
        state.playing = None;
        state.pending_next = None;
        state.remaining.clear();
        self.cancel.cancel();
        // best-effort: an already-gone channel is fine
        if let Err(e) = self.pbx.hangup(&self.channel_id).await {
            debug!(channel_id = self.channel_id, "hangup on destroy: {}", e);
        }
        self.registry.deregister(&self.channel_id);
        info!(channel_id = self.channel_id, "channel session destroyed");
    }

    async fn run_next(self: &Arc<Self>, state: &mut SessionState) {
        loop {
            if state.phase == Phase::Destroyed {
                return;
            }
            let Some(action) = state.remaining.pop_front() else {
                return;
            };
            match action {
                Action::Play { media, timeout } => {
                    let playback_id = self.new_playback_id();
                    match self.pbx.play(&self.channel_id, &playback_id, &media).await {
                        Ok(()) => {
                            state.playing = Some(playback_id);
                            state.current_timeout = timeout;
                            if let Some(timer) = state.post_playback_timer.take() {
                                timer.cancel();
                            }
                            if timeout > 0 {
                                let timer = self.arm_post_timer(state, timeout);
                                state.post_playback_timer = Some(timer);
                            }
                        }
                        Err(e) => {
                            // a failed prompt moves on to the next action
                            warn!(channel_id = self.channel_id, media, "play failed: {}", e);
                        }
                    }
                }
                Action::Gather(spec) => {
                    if let Some(mut previous) = state.gather.take() {
                        if let Some(timer) = previous.timer.take() {
                            timer.cancel();
                        }
                    }
                    let mut gather = GatherState {
                        running: true,
                        collected: String::new(),
                        num_digits: spec.num_digits,
                        finish_on_key: spec.finish_key(),
                        next_action_url: spec.action.clone(),
                        timeout_s: spec.timeout,
                        timer: None,
                    };
                    if state.playing.is_none() {
                        gather.timer = Some(self.arm_gather_timer(state, spec.timeout));
                    }
                    state.gather = Some(gather);
                    // gather blocks; remaining actions stay queued
                    return;
                }
                Action::Redirect { url } => {
                    if let Some(timer) = state.post_playback_timer.take() {
                        timer.cancel();
                    }
                    if self.load_actions(state, &url, &[]).await.is_err() {
                        self.destroy_locked(state).await;
                        return;
                    }
                }
                Action::Hangup => {
                    self.destroy_locked(state).await;
                    return;
                }
            }
        }
    }

    async fn load_actions(
        &self,
        state: &mut SessionState,
        url: &str,
        params: &[(String, String)],
    ) -> anyhow::Result<()> {
        let full_url = self.build_url(url, params);
        state.current_status = status_segment(url).to_string();
        debug!(
            channel_id = self.channel_id,
            status = state.current_status,
            "loading actions"
        );
        let body = self
            .http
            .get(&full_url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        let parsed = actions::parse_actions(&body)
            .map_err(|e| anyhow::anyhow!("bad action script from {}: {}", full_url, e))?;
        state.remaining = parsed.into();
        Ok(())
    }

    fn build_url(&self, url: &str, params: &[(String, String)]) -> String {
        let mut full = url.to_string();
        if !full.contains("uuid=") {
            full.push(if full.contains('?') { '&' } else { '?' });
            full.push_str("uuid=");
            full.push_str(&urlencoding::encode(&self.channel_id));
        }
        for (key, value) in params {
            full.push('&');
            full.push_str(key);
            full.push('=');
            full.push_str(&urlencoding::encode(value));
        }
        full
    }

    fn new_playback_id(&self) -> String {
        format!(
            "{}_{}_{}",
            self.channel_id,
            Utc::now().timestamp_millis(),
            rand::random::<u16>()
        )
    }

    fn arm_post_timer(self: &Arc<Self>, state: &mut SessionState, secs: u64) -> Timer {
        state.timer_seq += 1;
        let id = state.timer_seq;
        let token = self.cancel.child_token();
        let task_token = token.clone();
        let session = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = task_token.cancelled() => {}
                _ = sleep(Duration::from_secs(secs)) => session.post_timer_fired(id).await,
            }
        });
        Timer { id, token }
    }

    async fn post_timer_fired(self: Arc<Self>, id: u64) {
        let mut state = self.state.lock().await;
        if state.phase == Phase::Destroyed {
            return;
        }
        if state.post_playback_timer.as_ref().map(|t| t.id) != Some(id) {
            return;
        }
        state.post_playback_timer = None;
        debug!(channel_id = self.channel_id, "post-playback timeout");
        self.destroy_locked(&mut state).await;
    }

    fn arm_gather_timer(self: &Arc<Self>, state: &mut SessionState, secs: u64) -> Timer {
        state.timer_seq += 1;
        let id = state.timer_seq;
        let token = self.cancel.child_token();
        let task_token = token.clone();
        let session = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = task_token.cancelled() => {}
                _ = sleep(Duration::from_secs(secs)) => session.gather_timer_fired(id).await,
            }
        });
        Timer { id, token }
    }

    async fn gather_timer_fired(self: Arc<Self>, id: u64) {
        let mut state = self.state.lock().await;
        if state.phase == Phase::Destroyed {
            return;
        }
        let armed = state
            .gather
            .as_ref()
            .and_then(|g| g.timer.as_ref())
            .map(|t| t.id)
            == Some(id);
        if !armed {
            return;
        }
        if let Some(gather) = state.gather.as_mut() {
            gather.running = false;
        }
        debug!(channel_id = self.channel_id, "gather timeout");
        self.destroy_locked(&mut state).await;
    }

    /// Queue a follow-up script to load when the current playback ends.
    pub async fn set_pending_next(&self, pending: PendingAction) {
        let mut state = self.state.lock().await;
        if state.phase != Phase::Destroyed {
            state.pending_next = Some(pending);
        }
    }

    pub async fn is_destroyed(&self) -> bool {
        self.state.lock().await.phase == Phase::Destroyed
    }

    pub async fn is_gathering(&self) -> bool {
        let state = self.state.lock().await;
        state.gather.as_ref().map(|g| g.running).unwrap_or(false)
    }

    pub async fn current_status(&self) -> String {
        self.state.lock().await.current_status.clone()
    }
}
