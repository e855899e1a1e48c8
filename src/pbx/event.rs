//! Wire shape of the PBX event stream.

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct ChannelRef {
    pub id: String,
    #[serde(default)]
    pub state: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlaybackRef {
    pub id: String,
    #[serde(default)]
    pub target_uri: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum PbxEvent {
    StasisStart {
        channel: ChannelRef,
    },
    ChannelDtmfReceived {
        channel: ChannelRef,
        digit: String,
    },
    PlaybackFinished {
        playback: PlaybackRef,
    },
    ChannelStateChange {
        channel: ChannelRef,
    },
    ChannelHangupRequest {
        channel: ChannelRef,
        #[serde(default)]
        cause: Option<u32>,
    },
    ChannelDestroyed {
        channel: ChannelRef,
        #[serde(default)]
        cause: Option<u32>,
    },
    #[serde(other)]
    Other,
}

impl PlaybackRef {
    /// The event addresses its channel through a URI like
    /// `channel:1622065xx.23`.
    pub fn channel_id(&self) -> &str {
        self.target_uri
            .strip_prefix("channel:")
            .unwrap_or(&self.target_uri)
    }
}
