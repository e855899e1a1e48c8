//! Per-call push sessions: one socket per call, a latest-only buffer for
//! subscribers that have not connected yet.

use crate::{Error, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, warn};

const CLOSE_DELAY: Duration = Duration::from_secs(5);

#[derive(Default)]
struct PushSession {
    sender: Option<mpsc::UnboundedSender<String>>,
    pending: Option<Value>,
}

impl PushSession {
    fn is_open(&self) -> bool {
        self.sender
            .as_ref()
            .map(|s| !s.is_closed())
            .unwrap_or(false)
    }
}

pub struct PushRegistry {
    sessions: Mutex<HashMap<String, PushSession>>,
    close_delay: Duration,
}

impl PushRegistry {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            close_delay: CLOSE_DELAY,
        }
    }

    pub fn with_close_delay(mut self, delay: Duration) -> Self {
        self.close_delay = delay;
        self
    }

    /// Install the socket for a call. A second open socket for the same
    /// call is rejected; any buffered message is flushed to the new one.
    pub fn attach(&self, call_id: &str) -> Result<mpsc::UnboundedReceiver<String>> {
        let mut sessions = self.sessions.lock().unwrap();
        let session = sessions.entry(call_id.to_string()).or_default();
        if session.is_open() {
            return Err(Error::BadRequest(format!(
                "call {} already has a push session",
                call_id
            )));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(pending) = session.pending.take() {
            if let Ok(text) = serde_json::to_string(&pending) {
                tx.send(text).ok();
            }
        }
        session.sender = Some(tx);
        Ok(rx)
    }

    /// Deliver a message in submission order while the socket is open;
    /// otherwise keep only the most recent message for the next connect.
    pub fn send(&self, call_id: &str, mut payload: Value) {
        if let Some(object) = payload.as_object_mut() {
            object.insert("callId".to_string(), Value::String(call_id.to_string()));
        }
        let mut sessions = self.sessions.lock().unwrap();
        let session = sessions.entry(call_id.to_string()).or_default();
        if session.is_open() {
            let text = match serde_json::to_string(&payload) {
                Ok(text) => text,
                Err(e) => {
                    warn!(call_id, "failed to serialize push message: {}", e);
                    return;
                }
            };
            if let Some(sender) = &session.sender {
                if sender.send(text).is_ok() {
                    return;
                }
            }
        }
        debug!(call_id, "push session not connected, buffering");
        session.pending = Some(payload);
    }

    pub fn close(&self, call_id: &str) {
        self.sessions.lock().unwrap().remove(call_id);
    }

    /// Send one final status message, then drop the session shortly after
    /// so the client has a chance to read it.
    pub fn mark_terminal(self: &Arc<Self>, call_id: &str, payload: Value) {
        self.send(call_id, payload);
        let registry = self.clone();
        let call_id = call_id.to_string();
        let delay = self.close_delay;
        tokio::spawn(async move {
            sleep(delay).await;
            registry.close(&call_id);
        });
    }

    pub fn shutdown(&self) {
        self.sessions.lock().unwrap().clear();
    }

    /// Read-through debug view of calls with a connected subscriber.
    pub fn active_call_ids(&self) -> Vec<String> {
        let sessions = self.sessions.lock().unwrap();
        sessions
            .iter()
            .filter(|(_, s)| s.is_open())
            .map(|(id, _)| id.clone())
            .collect()
    }
}
