//! PBX control surface: REST client for channel operations and the
//! WebSocket event stream feeding the demultiplexer.

use crate::{Error, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

pub mod demux;
pub mod event;

pub use demux::{ChannelEvent, ChannelEventSink, PbxEventDemux};

const ARI_PORT: u16 = 8088;
const APP_NAME: &str = "dialflow";

#[derive(Debug, Clone)]
pub struct OriginateRequest {
    pub trunk_id: String,
    pub phone_number: String,
    pub from_number: String,
}

#[async_trait]
pub trait PbxClient: Send + Sync {
    /// Start an outbound call, returning the PBX channel id.
    async fn originate(&self, request: OriginateRequest) -> Result<String>;
    async fn answer(&self, channel_id: &str) -> Result<()>;
    /// Start media playback under a caller-chosen playback id.
    async fn play(&self, channel_id: &str, playback_id: &str, media: &str) -> Result<()>;
    async fn stop_playback(&self, playback_id: &str) -> Result<()>;
    /// Hang the channel up; an unknown channel is treated as already gone.
    async fn hangup(&self, channel_id: &str) -> Result<()>;
}

#[derive(Debug, Deserialize)]
struct ChannelCreated {
    id: String,
}

/// REST client against the Asterisk ARI surface of the PBX.
pub struct AriClient {
    base_url: String,
    ws_url: String,
    client: reqwest::Client,
}

impl AriClient {
    pub fn new(host: &str) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_default();
        Self {
            base_url: format!("http://{}:{}/ari", host, ARI_PORT),
            ws_url: format!("ws://{}:{}/ari/events?app={}", host, ARI_PORT, APP_NAME),
            client,
        }
    }

    pub fn ws_url(&self) -> &str {
        &self.ws_url
    }
}

#[async_trait]
impl PbxClient for AriClient {
    async fn originate(&self, request: OriginateRequest) -> Result<String> {
        let endpoint = format!("SIP/{}/{}", request.trunk_id, request.phone_number);
        let response = self
            .client
            .post(format!("{}/channels", self.base_url))
            .query(&[
                ("endpoint", endpoint.as_str()),
                ("app", APP_NAME),
                ("callerId", request.from_number.as_str()),
            ])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Error::PbxUnavailable(format!(
                "originate failed with status {}",
                response.status()
            )));
        }
        let created: ChannelCreated = response.json().await?;
        debug!(channel_id = created.id, endpoint, "originated");
        Ok(created.id)
    }

    async fn answer(&self, channel_id: &str) -> Result<()> {
        let response = self
            .client
            .post(format!("{}/channels/{}/answer", self.base_url, channel_id))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Error::PbxUnavailable(format!(
                "answer failed with status {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn play(&self, channel_id: &str, playback_id: &str, media: &str) -> Result<()> {
        let media = format!("sound:{}", media);
        let response = self
            .client
            .post(format!("{}/channels/{}/play", self.base_url, channel_id))
            .query(&[("playbackId", playback_id), ("media", media.as_str())])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Error::PbxUnavailable(format!(
                "play failed with status {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn stop_playback(&self, playback_id: &str) -> Result<()> {
        let response = self
            .client
            .delete(format!("{}/playbacks/{}", self.base_url, playback_id))
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(Error::PbxGone(format!("playback {}", playback_id)));
        }
        if !response.status().is_success() {
            return Err(Error::PbxUnavailable(format!(
                "stop playback failed with status {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn hangup(&self, channel_id: &str) -> Result<()> {
        let response = self
            .client
            .delete(format!("{}/channels/{}", self.base_url, channel_id))
            .send()
            .await?;
        // already hung up on the PBX side
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        if !response.status().is_success() {
            return Err(Error::PbxUnavailable(format!(
                "hangup failed with status {}",
                response.status()
            )));
        }
        Ok(())
    }
}

/// PBX hangup cause → wire string shown to subscribers.
pub fn hangup_cause_label(cause: Option<u32>) -> &'static str {
    match cause {
        Some(16) => "normal",
        Some(17) => "busy",
        Some(18) | Some(19) => "no-answer",
        Some(21) => "rejected",
        Some(34) => "congestion",
        _ => "unknown",
    }
}
