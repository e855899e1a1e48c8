//! Parses the XML action scripts the action engine serves back to us.

use crate::{Error, Result};
use quick_xml::events::Event;
use quick_xml::Reader;

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Play { media: String, timeout: u64 },
    Gather(GatherSpec),
    Redirect { url: String },
    Hangup,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GatherSpec {
    pub action: Option<String>,
    pub timeout: u64,
    pub num_digits: u32,
    pub finish_on_key: Option<String>,
}

impl Default for GatherSpec {
    fn default() -> Self {
        Self {
            action: None,
            timeout: 5,
            num_digits: 1,
            finish_on_key: None,
        }
    }
}

impl GatherSpec {
    /// A gather is dynamic-length only for a single-character finish key.
    pub fn finish_key(&self) -> Option<char> {
        let key = self.finish_on_key.as_deref()?;
        let mut chars = key.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) => Some(c),
            _ => None,
        }
    }
}

fn attr_value(e: &quick_xml::events::BytesStart<'_>, name: &[u8]) -> Option<String> {
    for attr in e.attributes().flatten() {
        if attr.key.as_ref() == name {
            return Some(String::from_utf8_lossy(&attr.value).to_string());
        }
    }
    None
}

fn gather_from(e: &quick_xml::events::BytesStart<'_>) -> GatherSpec {
    let timeout = attr_value(e, b"timeout")
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|t| *t > 0)
        .unwrap_or(5);
    let num_digits = attr_value(e, b"numDigits")
        .and_then(|v| v.parse::<u32>().ok())
        .filter(|n| *n > 0)
        .unwrap_or(1);
    GatherSpec {
        action: attr_value(e, b"action"),
        timeout,
        num_digits,
        finish_on_key: attr_value(e, b"finishOnKey"),
    }
}

/// Parse a `<Response>` document into its ordered action list.
pub fn parse_actions(xml: &str) -> Result<Vec<Action>> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut actions = Vec::new();
    let mut open: Option<(Vec<u8>, Option<u64>)> = None;
    let mut text = String::new();
    let mut buf = Vec::new();

    loop {
        match reader
            .read_event_into(&mut buf)
            .map_err(|e| Error::Parse(format!("action script: {}", e)))?
        {
            Event::Start(ref e) => match e.name().as_ref() {
                b"Play" | b"play" => {
                    let timeout = attr_value(e, b"timeout").and_then(|v| v.parse().ok());
                    open = Some((b"Play".to_vec(), timeout));
                    text.clear();
                }
                b"Redirect" | b"redirect" => {
                    open = Some((b"Redirect".to_vec(), None));
                    text.clear();
                }
                b"Gather" | b"gather" => actions.push(Action::Gather(gather_from(e))),
                b"Hangup" | b"hangup" => actions.push(Action::Hangup),
                _ => {}
            },
            Event::Empty(ref e) => match e.name().as_ref() {
                b"Gather" | b"gather" => actions.push(Action::Gather(gather_from(e))),
                b"Hangup" | b"hangup" => actions.push(Action::Hangup),
                b"Play" | b"play" => {
                    let timeout = attr_value(e, b"timeout").and_then(|v| v.parse().ok());
                    actions.push(Action::Play {
                        media: String::new(),
                        timeout: timeout.unwrap_or(0),
                    });
                }
                _ => {}
            },
            Event::Text(ref e) => {
                if open.is_some() {
                    text.push_str(
                        &e.unescape()
                            .map_err(|err| Error::Parse(format!("action script: {}", err)))?,
                    );
                }
            }
            Event::End(ref e) => {
                if let Some((name, timeout)) = open.take() {
                    match (name.as_slice(), e.name().as_ref()) {
                        (b"Play", b"Play") | (b"Play", b"play") => actions.push(Action::Play {
                            media: text.trim().to_string(),
                            timeout: timeout.unwrap_or(0),
                        }),
                        (b"Redirect", b"Redirect") | (b"Redirect", b"redirect") => {
                            actions.push(Action::Redirect {
                                url: text.trim().to_string(),
                            })
                        }
                        _ => open = Some((name, timeout)),
                    }
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(actions)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_play_gather() {
        let xml = r#"<Response>
            <Play timeout="20">custom/acme/gather</Play>
            <Gather input="speech dtmf" action="http://host/action/confirm" timeout="10" numDigits="6"/>
        </Response>"#;
        let actions = parse_actions(xml).unwrap();
        assert_eq!(actions.len(), 2);
        assert_eq!(
            actions[0],
            Action::Play {
                media: "custom/acme/gather".to_string(),
                timeout: 20,
            }
        );
        match &actions[1] {
            Action::Gather(spec) => {
                assert_eq!(spec.action.as_deref(), Some("http://host/action/confirm"));
                assert_eq!(spec.timeout, 10);
                assert_eq!(spec.num_digits, 6);
                assert!(spec.finish_key().is_none());
            }
            other => panic!("unexpected action: {:?}", other),
        }
    }

    #[test]
    fn test_gather_defaults() {
        let actions = parse_actions(r#"<Response><Gather action="u"/></Response>"#).unwrap();
        match &actions[0] {
            Action::Gather(spec) => {
                assert_eq!(spec.timeout, 5);
                assert_eq!(spec.num_digits, 1);
            }
            other => panic!("unexpected action: {:?}", other),
        }
    }

    #[test]
    fn test_finish_key_must_be_single_char() {
        let actions = parse_actions(
            r##"<Response><Gather action="u" numDigits="0" finishOnKey="#"/></Response>"##,
        )
        .unwrap();
        match &actions[0] {
            Action::Gather(spec) => assert_eq!(spec.finish_key(), Some('#')),
            other => panic!("unexpected action: {:?}", other),
        }

        let actions =
            parse_actions(r###"<Response><Gather action="u" finishOnKey="##"/></Response>"###).unwrap();
        match &actions[0] {
            Action::Gather(spec) => assert!(spec.finish_key().is_none()),
            other => panic!("unexpected action: {:?}", other),
        }
    }

    #[test]
    fn test_parse_redirect_and_hangup() {
        let xml = r#"<Response>
            <Redirect>http://host/action/gather1?uuid=ch-1</Redirect>
            <Hangup/>
        </Response>"#;
        let actions = parse_actions(xml).unwrap();
        assert_eq!(
            actions[0],
            Action::Redirect {
                url: "http://host/action/gather1?uuid=ch-1".to_string(),
            }
        );
        assert_eq!(actions[1], Action::Hangup);
    }

    #[test]
    fn test_parse_error_reported() {
        assert!(parse_actions("<Response><<garbage").is_err());
    }

    #[test]
    fn test_same_input_parses_identically() {
        let xml = r#"<Response><Play>custom/a/answer</Play><Gather action="u" timeout="7"/></Response>"#;
        assert_eq!(parse_actions(xml).unwrap(), parse_actions(xml).unwrap());
    }
}
