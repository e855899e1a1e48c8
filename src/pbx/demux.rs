//! Demultiplexes the PBX event stream into typed per-channel events,
//! dropping duplicates and reconnecting on stream loss.

use super::event::PbxEvent;
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const DEDUP_WINDOW: Duration = Duration::from_secs(30);
const MAX_RECONNECTS: u32 = 5;
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    StasisEntered { channel_id: String },
    Dtmf { channel_id: String, digit: char },
    PlaybackFinished { channel_id: String, playback_id: String },
    Ringing { channel_id: String },
    Hangup { channel_id: String, cause: Option<u32> },
    ServerFailed,
}

#[async_trait]
pub trait ChannelEventSink: Send + Sync {
    async fn on_event(&self, event: ChannelEvent);
}

#[derive(Default)]
struct DedupState {
    entered: HashSet<String>,
    playbacks: HashMap<String, Instant>,
    hangups: HashMap<String, Instant>,
}

pub struct PbxEventDemux {
    ws_url: String,
    sink: Arc<dyn ChannelEventSink>,
    dedup: Mutex<DedupState>,
    window: Duration,
    max_reconnects: u32,
    reconnect_delay: Duration,
}

impl PbxEventDemux {
    pub fn new(ws_url: String, sink: Arc<dyn ChannelEventSink>) -> Self {
        Self {
            ws_url,
            sink,
            dedup: Mutex::new(DedupState::default()),
            window: DEDUP_WINDOW,
            max_reconnects: MAX_RECONNECTS,
            reconnect_delay: RECONNECT_DELAY,
        }
    }

    pub fn with_dedup_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    pub fn with_reconnect(mut self, attempts: u32, delay: Duration) -> Self {
        self.max_reconnects = attempts;
        self.reconnect_delay = delay;
        self
    }

    pub async fn run(&self, cancel: CancellationToken) {
        let mut attempts = 0u32;
        loop {
            let connection = tokio::select! {
                _ = cancel.cancelled() => return,
                c = connect_async(&self.ws_url) => c,
            };
            match connection {
                Ok((stream, _)) => {
                    info!(url = self.ws_url, "pbx event stream connected");
                    attempts = 0;
                    let (_, mut read) = stream.split();
                    loop {
                        let message = tokio::select! {
                            _ = cancel.cancelled() => return,
                            m = read.next() => m,
                        };
                        match message {
                            Some(Ok(Message::Text(text))) => self.on_message(&text).await,
                            Some(Ok(Message::Close(_))) | None => break,
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                warn!("pbx event stream error: {}", e);
                                break;
                            }
                        }
                    }
                    warn!("pbx event stream disconnected");
                }
                Err(e) => {
                    attempts += 1;
                    warn!(attempts, "pbx event stream connect failed: {}", e);
                    if attempts >= self.max_reconnects {
                        error!("pbx event stream unavailable, giving up");
                        self.sink.on_event(ChannelEvent::ServerFailed).await;
                        return;
                    }
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = sleep(self.reconnect_delay) => {}
            }
        }
    }

    pub async fn on_message(&self, text: &str) {
        let event: PbxEvent = match serde_json::from_str(text) {
            Ok(event) => event,
            Err(e) => {
                debug!("dropping unparseable pbx event: {}", e);
                return;
            }
        };
        if let Some(event) = self.demux(event) {
            self.sink.on_event(event).await;
        }
    }

    /// Apply dedup windows, returning the typed event to forward.
    pub fn demux(&self, event: PbxEvent) -> Option<ChannelEvent> {
        let mut dedup = self.dedup.lock().unwrap();
        let now = Instant::now();
        dedup.playbacks.retain(|_, at| now - *at < self.window);
        dedup.hangups.retain(|_, at| now - *at < self.window);

        match event {
            PbxEvent::StasisStart { channel } => {
                if !dedup.entered.insert(channel.id.clone()) {
                    return None;
                }
                Some(ChannelEvent::StasisEntered {
                    channel_id: channel.id,
                })
            }
            PbxEvent::ChannelDtmfReceived { channel, digit } => {
                let digit = digit.chars().next()?;
                Some(ChannelEvent::Dtmf {
                    channel_id: channel.id,
                    digit,
                })
            }
            PbxEvent::PlaybackFinished { playback } => {
                if dedup.playbacks.contains_key(&playback.id) {
                    debug!(playback_id = playback.id, "duplicate playback_finished dropped");
                    return None;
                }
                dedup.playbacks.insert(playback.id.clone(), now);
                Some(ChannelEvent::PlaybackFinished {
                    channel_id: playback.channel_id().to_string(),
                    playback_id: playback.id,
                })
            }
            PbxEvent::ChannelStateChange { channel } => {
                if channel.state.as_deref() != Some("Ringing") {
                    return None;
                }
                Some(ChannelEvent::Ringing {
                    channel_id: channel.id,
                })
            }
            PbxEvent::ChannelHangupRequest { channel, cause }
            | PbxEvent::ChannelDestroyed { channel, cause } => {
                if dedup.hangups.contains_key(&channel.id) {
                    debug!(channel_id = channel.id, "duplicate hangup dropped");
                    return None;
                }
                dedup.hangups.insert(channel.id.clone(), now);
                dedup.entered.remove(&channel.id);
                Some(ChannelEvent::Hangup {
                    channel_id: channel.id,
                    cause,
                })
            }
            PbxEvent::Other => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Mutex as AsyncMutex;

    #[derive(Default)]
    struct RecordingSink {
        events: AsyncMutex<Vec<ChannelEvent>>,
    }

    #[async_trait]
    impl ChannelEventSink for RecordingSink {
        async fn on_event(&self, event: ChannelEvent) {
            self.events.lock().await.push(event);
        }
    }

    fn demux_with(window: Duration) -> (PbxEventDemux, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        let demux = PbxEventDemux::new("ws://unused".to_string(), sink.clone())
            .with_dedup_window(window);
        (demux, sink)
    }

    #[tokio::test]
    async fn test_duplicate_playback_finished_dropped() {
        let (demux, sink) = demux_with(Duration::from_secs(30));
        let raw = r#"{"type":"PlaybackFinished","playback":{"id":"pb-1","target_uri":"channel:ch-1"}}"#;
        demux.on_message(raw).await;
        demux.on_message(raw).await;

        let events = sink.events.lock().await;
        assert_eq!(events.len(), 1);
        assert_eq!(
            events[0],
            ChannelEvent::PlaybackFinished {
                channel_id: "ch-1".to_string(),
                playback_id: "pb-1".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_playback_dedup_expires_after_window() {
        let (demux, sink) = demux_with(Duration::from_millis(30));
        let raw = r#"{"type":"PlaybackFinished","playback":{"id":"pb-1","target_uri":"channel:ch-1"}}"#;
        demux.on_message(raw).await;
        sleep(Duration::from_millis(50)).await;
        demux.on_message(raw).await;
        assert_eq!(sink.events.lock().await.len(), 2);
    }

    #[tokio::test]
    async fn test_hangup_deduped_per_channel() {
        let (demux, sink) = demux_with(Duration::from_secs(30));
        demux
            .on_message(r#"{"type":"ChannelHangupRequest","channel":{"id":"ch-1"},"cause":16}"#)
            .await;
        demux
            .on_message(r#"{"type":"ChannelDestroyed","channel":{"id":"ch-1"},"cause":16}"#)
            .await;

        let events = sink.events.lock().await;
        assert_eq!(events.len(), 1);
        assert_eq!(
            events[0],
            ChannelEvent::Hangup {
                channel_id: "ch-1".to_string(),
                cause: Some(16),
            }
        );
    }

    #[tokio::test]
    async fn test_stasis_emitted_once_per_channel() {
        let (demux, sink) = demux_with(Duration::from_secs(30));
        let raw = r#"{"type":"StasisStart","channel":{"id":"ch-1","state":"Up"}}"#;
        demux.on_message(raw).await;
        demux.on_message(raw).await;
        assert_eq!(sink.events.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn test_ringing_only_for_ringing_state() {
        let (demux, sink) = demux_with(Duration::from_secs(30));
        demux
            .on_message(r#"{"type":"ChannelStateChange","channel":{"id":"ch-1","state":"Ringing"}}"#)
            .await;
        demux
            .on_message(r#"{"type":"ChannelStateChange","channel":{"id":"ch-1","state":"Up"}}"#)
            .await;

        let events = sink.events.lock().await;
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], ChannelEvent::Ringing { .. }));
    }

    #[tokio::test]
    async fn test_parse_errors_are_dropped() {
        let (demux, sink) = demux_with(Duration::from_secs(30));
        demux.on_message("{not json").await;
        demux.on_message(r#"{"type":"ChannelVarset"}"#).await;
        assert!(sink.events.lock().await.is_empty());
    }
}
