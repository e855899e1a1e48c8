//! Maps incoming action requests to XML responses and call-state updates.
//!
//! The PBX only understands XML, so every reply here is a `<Response>`
//! document served with HTTP 200, including the error cases.

use crate::call::{CallStore, CallUpdate, GatherStage};
use crate::catalog::{ActionSpec, CampaignCatalog, CampaignSteps};
use crate::push::PushRegistry;
use crate::{Error, Result};
use quick_xml::events::{BytesStart, BytesText, Event};
use quick_xml::Writer;
use rand::Rng;
use serde_json::json;
use std::io::Cursor;
use std::sync::Arc;
use tracing::{debug, warn};

const ERROR_RESPONSE: &str = "<Response><Hangup/></Response>";

pub struct ActionEngine {
    catalog: Arc<CampaignCatalog>,
    calls: Arc<CallStore>,
    push: Arc<PushRegistry>,
    base_url: String,
}

fn fallback_step(status: &str) -> &'static str {
    match status {
        "answer" => "gather",
        "gather" => "confirm",
        "invalid" => "gather",
        _ => "completed",
    }
}

impl ActionEngine {
    pub fn new(
        catalog: Arc<CampaignCatalog>,
        calls: Arc<CallStore>,
        push: Arc<PushRegistry>,
        base_url: String,
    ) -> Self {
        Self {
            catalog,
            calls,
            push,
            base_url,
        }
    }

    /// Handle `GET /action/{status}?uuid=&Digits=`. Always returns XML.
    pub fn handle(&self, status: &str, uuid: Option<&str>, digits: Option<&str>) -> String {
        let Some(uuid) = uuid.filter(|u| !u.is_empty()) else {
            warn!(status, "action request without uuid");
            return ERROR_RESPONSE.to_string();
        };
        let Some(call) = self.calls.get(uuid) else {
            warn!(uuid, status, "action request for unknown call");
            return ERROR_RESPONSE.to_string();
        };
        let Some(steps) = self.catalog.campaign(&call.campaign) else {
            warn!(uuid, campaign = call.campaign, "unknown campaign");
            return ERROR_RESPONSE.to_string();
        };

        let mut status = status.to_string();
        let digits = digits.filter(|d| !d.is_empty());

        // menu hoisting: a choice at the menu becomes its own status
        if status == "options" {
            if let Some(digits) = digits {
                let selected = if digits == "1" { "1" } else { "2" };
                self.calls.update(
                    uuid,
                    CallUpdate {
                        selected_option: Some(selected.to_string()),
                        ..Default::default()
                    },
                );
                status = if selected == "1" { "option1" } else { "option2" }.to_string();
            }
        }

        let two_gather = steps.contains_key("gather1");
        self.apply_side_effects(uuid, &call.selected_option, call.gather_stage, &status, digits, two_gather);

        if status == "gather1" && digits.is_some() {
            let next = steps
                .get("gather1")
                .and_then(|spec| spec.next.clone())
                .unwrap_or_else(|| fallback_step("gather1").to_string());
            return self
                .redirect_response(&self.step_url(&next))
                .unwrap_or_else(|_| ERROR_RESPONSE.to_string());
        }

        self.build_response(&call.campaign, &status, &steps)
            .unwrap_or_else(|e| {
                warn!(uuid, status, "action response failed: {}", e);
                ERROR_RESPONSE.to_string()
            })
    }

    fn apply_side_effects(
        &self,
        uuid: &str,
        selected_option: &Option<String>,
        gather_stage: Option<GatherStage>,
        status: &str,
        digits: Option<&str>,
        two_gather: bool,
    ) {
        match status {
            "gather" => {
                if let Some(digits) = digits {
                    if two_gather {
                        self.calls.update(
                            uuid,
                            CallUpdate {
                                gather_stage: Some(GatherStage::First),
                                ..Default::default()
                            },
                        );
                    }
                    self.push.send(uuid, json!({"SendOtp": digits}));
                }
            }
            "gather1" => {
                if let Some(digits) = digits {
                    if two_gather {
                        self.calls.update(
                            uuid,
                            CallUpdate {
                                state: Some("gather1".to_string()),
                                gather_stage: Some(GatherStage::Second),
                                ..Default::default()
                            },
                        );
                    }
                    self.push.send(uuid, json!({"OtpCode": digits}));
                }
            }
            "option1" | "option2" => {
                if let Some(digits) = digits {
                    self.push.send(uuid, json!({"SendOtp": digits}));
                }
            }
            "confirm" => {
                if two_gather && gather_stage == Some(GatherStage::Second) {
                    self.calls.update(
                        uuid,
                        CallUpdate {
                            state: Some("completed".to_string()),
                            ..Default::default()
                        },
                    );
                } else if let Some(digits) = digits {
                    self.push.send(
                        uuid,
                        json!({"OtpCode": digits, "selectedOption": selected_option}),
                    );
                }
            }
            _ => {}
        }
    }

    fn build_response(
        &self,
        campaign: &str,
        status: &str,
        steps: &CampaignSteps,
    ) -> Result<String> {
        let Some(spec) = steps.get(status) else {
            debug!(campaign, status, "no step in catalog");
            return Err(Error::CatalogMiss(format!("{}/{}", campaign, status)));
        };
        let media = format!("custom/{}/{}", campaign, status);

        if status == "confirm" {
            // confirm plays and waits for the validation decision
            return self.play_response(&media, Some(spec.timeout));
        }
        if status.starts_with("completed") {
            return self.play_response(&media, None);
        }

        // only the initial answer prompt gets a jittered window
        let timeout = if status == "answer" {
            rand::thread_rng().gen_range(10..=15)
        } else {
            spec.timeout
        };
        let next_url = self.resolve_next_url(status, spec);
        self.play_gather_response(&media, &next_url, timeout, spec)
    }

    fn resolve_next_url(&self, status: &str, spec: &ActionSpec) -> String {
        if status == "gather1" {
            // gather1 submits back to itself
            return format!("{}/action/gather1", self.base_url);
        }
        match &spec.next {
            Some(next) => self.step_url(next),
            None => format!("{}/action/{}", self.base_url, fallback_step(status)),
        }
    }

    fn step_url(&self, next: &str) -> String {
        if next.starts_with("http://") || next.starts_with("https://") {
            next.to_string()
        } else {
            format!("{}/action/{}", self.base_url, next)
        }
    }

    fn play_response(&self, media: &str, timeout: Option<u64>) -> Result<String> {
        let mut writer = Writer::new(Cursor::new(Vec::new()));
        writer
            .write_event(Event::Start(BytesStart::new("Response")))
            .map_err(|e| Error::Parse(e.to_string()))?;
        write_play(&mut writer, media, timeout)?;
        writer
            .write_event(Event::End(BytesStart::new("Response").to_end()))
            .map_err(|e| Error::Parse(e.to_string()))?;
        into_string(writer)
    }

    fn play_gather_response(
        &self,
        media: &str,
        next_url: &str,
        timeout: u64,
        spec: &ActionSpec,
    ) -> Result<String> {
        let mut writer = Writer::new(Cursor::new(Vec::new()));
        writer
            .write_event(Event::Start(BytesStart::new("Response")))
            .map_err(|e| Error::Parse(e.to_string()))?;
        write_play(&mut writer, media, None)?;

        let mut gather = BytesStart::new("Gather");
        gather.push_attribute(("input", "speech dtmf"));
        gather.push_attribute(("action", next_url));
        gather.push_attribute(("timeout", timeout.to_string().as_str()));
        let finish_key = spec
            .finish_on_key
            .as_deref()
            .filter(|k| k.chars().count() == 1);
        match finish_key {
            Some(key) => {
                gather.push_attribute(("numDigits", "0"));
                gather.push_attribute(("finishOnKey", key));
            }
            None => {
                let num_digits = spec.dgts.unwrap_or(0);
                gather.push_attribute(("numDigits", num_digits.to_string().as_str()));
            }
        }
        writer
            .write_event(Event::Empty(gather))
            .map_err(|e| Error::Parse(e.to_string()))?;
        writer
            .write_event(Event::End(BytesStart::new("Response").to_end()))
            .map_err(|e| Error::Parse(e.to_string()))?;
        into_string(writer)
    }

    fn redirect_response(&self, url: &str) -> Result<String> {
        let mut writer = Writer::new(Cursor::new(Vec::new()));
        writer
            .write_event(Event::Start(BytesStart::new("Response")))
            .map_err(|e| Error::Parse(e.to_string()))?;
        writer
            .write_event(Event::Start(BytesStart::new("Redirect")))
            .map_err(|e| Error::Parse(e.to_string()))?;
        writer
            .write_event(Event::Text(BytesText::new(url)))
            .map_err(|e| Error::Parse(e.to_string()))?;
        writer
            .write_event(Event::End(BytesStart::new("Redirect").to_end()))
            .map_err(|e| Error::Parse(e.to_string()))?;
        writer
            .write_event(Event::End(BytesStart::new("Response").to_end()))
            .map_err(|e| Error::Parse(e.to_string()))?;
        into_string(writer)
    }
}

fn write_play(
    writer: &mut Writer<Cursor<Vec<u8>>>,
    media: &str,
    timeout: Option<u64>,
) -> Result<()> {
    let mut play = BytesStart::new("Play");
    if let Some(timeout) = timeout {
        play.push_attribute(("timeout", timeout.to_string().as_str()));
    }
    writer
        .write_event(Event::Start(play))
        .map_err(|e| Error::Parse(e.to_string()))?;
    writer
        .write_event(Event::Text(BytesText::new(media)))
        .map_err(|e| Error::Parse(e.to_string()))?;
    writer
        .write_event(Event::End(BytesStart::new("Play").to_end()))
        .map_err(|e| Error::Parse(e.to_string()))?;
    Ok(())
}

fn into_string(writer: Writer<Cursor<Vec<u8>>>) -> Result<String> {
    String::from_utf8(writer.into_inner().into_inner()).map_err(|e| Error::Parse(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::actions::{parse_actions, Action};
    use std::collections::HashMap;

    fn two_gather_catalog() -> HashMap<String, crate::catalog::CampaignSteps> {
        serde_json::from_value(json!({
            "acme": {
                "answer": {"audio": "answer", "next": "gather", "timeout": 6},
                "gather": {"audio": "gather", "dgts": 3, "timeout": 10},
                "confirm": {"audio": "confirm", "timeout": 20},
                "gather1": {"audio": "gather1", "next": "confirm", "dgts": 1, "timeout": 10},
                "completed": {"audio": "completed", "timeout": 0},
                "invalid": {"audio": "invalid", "dgts": 3, "timeout": 10}
            },
            "venmo_fraude": {
                "options": {"audio": "options", "dgts": 1, "timeout": 10},
                "option1": {"audio": "option1", "dgts": 6, "timeout": 10},
                "option2": {"audio": "option2", "dgts": 6, "timeout": 10},
                "completed_option1": {"audio": "done1", "timeout": 0},
                "completed_option2": {"audio": "done2", "timeout": 0},
                "completed": {"audio": "done", "timeout": 0}
            }
        }))
        .unwrap()
    }

    fn engine() -> (ActionEngine, Arc<CallStore>, Arc<PushRegistry>) {
        let catalog = Arc::new(CampaignCatalog::new(None));
        catalog.replace(two_gather_catalog());
        let calls = Arc::new(CallStore::new());
        let push = Arc::new(PushRegistry::new());
        let engine = ActionEngine::new(
            catalog,
            calls.clone(),
            push.clone(),
            "http://localhost:3000".to_string(),
        );
        (engine, calls, push)
    }

    #[tokio::test]
    async fn test_unknown_call_yields_error_xml() {
        let (engine, _, _) = engine();
        let xml = engine.handle("gather", Some("nope"), None);
        assert_eq!(xml, ERROR_RESPONSE);
    }

    #[tokio::test]
    async fn test_gather_digits_push_and_stage() {
        let (engine, calls, push) = engine();
        calls.save("ch-1", "created", "acme");
        let mut rx = push.attach("ch-1").unwrap();

        let xml = engine.handle("gather", Some("ch-1"), Some("123"));
        let message: serde_json::Value =
            serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(message["SendOtp"], "123");
        assert_eq!(calls.get("ch-1").unwrap().gather_stage, Some(GatherStage::First));

        // gather responds with a Play+Gather pointing at confirm
        let actions = parse_actions(&xml).unwrap();
        assert!(matches!(&actions[0], Action::Play { media, .. } if media == "custom/acme/gather"));
        match &actions[1] {
            Action::Gather(spec) => {
                assert_eq!(
                    spec.action.as_deref(),
                    Some("http://localhost:3000/action/confirm")
                );
                assert_eq!(spec.num_digits, 3);
            }
            other => panic!("unexpected action: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_answer_timeout_jittered() {
        let (engine, calls, _) = engine();
        calls.save("ch-1", "created", "acme");
        for _ in 0..20 {
            let xml = engine.handle("answer", Some("ch-1"), None);
            let actions = parse_actions(&xml).unwrap();
            match &actions[1] {
                Action::Gather(spec) => {
                    assert!((10..=15).contains(&spec.timeout), "timeout {}", spec.timeout)
                }
                other => panic!("unexpected action: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_confirm_is_play_only_with_timeout() {
        let (engine, calls, _) = engine();
        calls.save("ch-1", "created", "acme");
        let xml = engine.handle("confirm", Some("ch-1"), None);
        let actions = parse_actions(&xml).unwrap();
        assert_eq!(actions.len(), 1);
        assert_eq!(
            actions[0],
            Action::Play {
                media: "custom/acme/confirm".to_string(),
                timeout: 20,
            }
        );
    }

    #[tokio::test]
    async fn test_confirm_second_stage_completes_call() {
        let (engine, calls, _) = engine();
        calls.save("ch-1", "created", "acme");
        calls.update(
            "ch-1",
            CallUpdate {
                gather_stage: Some(GatherStage::Second),
                ..Default::default()
            },
        );
        engine.handle("confirm", Some("ch-1"), None);
        assert_eq!(calls.get("ch-1").unwrap().state, "completed");
    }

    #[tokio::test]
    async fn test_gather1_digits_redirect_to_next() {
        let (engine, calls, push) = engine();
        calls.save("ch-1", "created", "acme");
        let mut rx = push.attach("ch-1").unwrap();

        let xml = engine.handle("gather1", Some("ch-1"), Some("9"));
        let message: serde_json::Value =
            serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(message["OtpCode"], "9");
        assert_eq!(calls.get("ch-1").unwrap().gather_stage, Some(GatherStage::Second));
        assert_eq!(calls.get("ch-1").unwrap().state, "gather1");

        let actions = parse_actions(&xml).unwrap();
        assert_eq!(
            actions[0],
            Action::Redirect {
                url: "http://localhost:3000/action/confirm".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_gather1_without_digits_gathers_to_self() {
        let (engine, calls, _) = engine();
        calls.save("ch-1", "created", "acme");
        let xml = engine.handle("gather1", Some("ch-1"), None);
        let actions = parse_actions(&xml).unwrap();
        match &actions[1] {
            Action::Gather(spec) => assert_eq!(
                spec.action.as_deref(),
                Some("http://localhost:3000/action/gather1")
            ),
            other => panic!("unexpected action: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_menu_hoisting_sets_selected_option() {
        let (engine, calls, push) = engine();
        calls.save("ch-1", "created", "venmo_fraude");
        let mut rx = push.attach("ch-1").unwrap();

        let xml = engine.handle("options", Some("ch-1"), Some("1"));
        assert_eq!(calls.get("ch-1").unwrap().selected_option.as_deref(), Some("1"));
        let message: serde_json::Value =
            serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(message["SendOtp"], "1");

        // the response is the option1 step, not the menu
        let actions = parse_actions(&xml).unwrap();
        assert!(
            matches!(&actions[0], Action::Play { media, .. } if media == "custom/venmo_fraude/option1")
        );

        // any non-"1" digit selects option 2
        calls.save("ch-2", "created", "venmo_fraude");
        engine.handle("options", Some("ch-2"), Some("7"));
        assert_eq!(calls.get("ch-2").unwrap().selected_option.as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn test_invalid_falls_back_to_gather() {
        let (engine, calls, _) = engine();
        calls.save("ch-1", "created", "acme");
        let xml = engine.handle("invalid", Some("ch-1"), None);
        let actions = parse_actions(&xml).unwrap();
        match &actions[1] {
            Action::Gather(spec) => assert_eq!(
                spec.action.as_deref(),
                Some("http://localhost:3000/action/gather")
            ),
            other => panic!("unexpected action: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_absolute_next_url_kept_verbatim() {
        let (engine, calls, _) = engine();
        let catalog = serde_json::from_value(json!({
            "ext": {
                "gather": {"audio": "gather", "next": "https://other.example/hook", "dgts": 4, "timeout": 10}
            }
        }))
        .unwrap();
        engine.catalog.replace(catalog);
        calls.save("ch-1", "created", "ext");

        let xml = engine.handle("gather", Some("ch-1"), None);
        let actions = parse_actions(&xml).unwrap();
        match &actions[1] {
            Action::Gather(spec) => {
                assert_eq!(spec.action.as_deref(), Some("https://other.example/hook"))
            }
            other => panic!("unexpected action: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_completed_is_bare_play() {
        let (engine, calls, _) = engine();
        calls.save("ch-1", "created", "venmo_fraude");
        let xml = engine.handle("completed_option1", Some("ch-1"), None);
        let actions = parse_actions(&xml).unwrap();
        assert_eq!(actions.len(), 1);
        assert_eq!(
            actions[0],
            Action::Play {
                media: "custom/venmo_fraude/completed_option1".to_string(),
                timeout: 0,
            }
        );
    }
}
