//! Log line classification.
//!
//! Each tailed line is tried as structured JSON first and falls back to
//! pattern matching on the raw text. The heuristics live in small ordered
//! rule tables so each rule can be tested and reordered on its own:
//!
//! - [`ADDRESS_RULES`]: where to find a destination domain in free text
//! - [`DEFERRAL_RULES`]: vocabulary that marks a temporary failure
//! - [`PROVIDER_RULES`]: domain suffixes of well-known mailbox providers
//!
//! Journal records whose `MESSAGE` is a byte array are decoded before
//! classification.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ledger::EventLevel;

/// Cap on Last-Error text, in characters.
pub const ERROR_TEXT_CAP: usize = 300;

/// Where a deferral was recognised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchSource {
    Json,
    Text,
}

/// Response details attached to a deferral.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureDetail {
    pub provider: Option<String>,
    pub code: Option<u16>,
    pub enhanced_code: Option<String>,
    pub text: String,
}

/// A recognised transient failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deferral {
    pub domain: String,
    pub source: MatchSource,
    pub detail: Option<FailureDetail>,
}

/// Outcome of classifying one line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub level: EventLevel,
    /// Display text: control sequences stripped, truncated
    pub message: String,
    pub deferral: Option<Deferral>,
}

// ---------------------------------------------------------------------------
// Rule tables
// ---------------------------------------------------------------------------

/// Extracts a domain (capture group 1) from free text.
pub struct AddressRule {
    pub id: &'static str,
    pattern: &'static LazyLock<Regex>,
}

impl AddressRule {
    #[must_use]
    pub fn extract(&self, text: &str) -> Option<String> {
        let domain = self.pattern.captures(text)?.get(1)?.as_str();
        normalize_domain(domain)
    }
}

static ANGLE_ADDRESS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<[^<>\s@]+@([A-Za-z0-9](?:[A-Za-z0-9-]*[A-Za-z0-9])?(?:\.[A-Za-z0-9](?:[A-Za-z0-9-]*[A-Za-z0-9])?)+)>").unwrap()
});
static PREFIXED_ADDRESS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:rcpt|to)=<?[^\s<>@]+@([A-Za-z0-9.-]+\.[A-Za-z]{2,})").unwrap()
});
static BARE_AT_DOMAIN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"@([A-Za-z0-9-]+(?:\.[A-Za-z0-9-]+)*\.[A-Za-z]{2,})").unwrap());

/// Tried in order; the first rule that yields a domain wins.
pub static ADDRESS_RULES: &[AddressRule] = &[
    AddressRule {
        id: "address:angle-bracket",
        pattern: &ANGLE_ADDRESS,
    },
    AddressRule {
        id: "address:rcpt-or-to",
        pattern: &PREFIXED_ADDRESS,
    },
    AddressRule {
        id: "address:bare-at",
        pattern: &BARE_AT_DOMAIN,
    },
];

/// Marks a line as a temporary failure.
pub struct DeferralRule {
    pub id: &'static str,
    pattern: &'static LazyLock<Regex>,
}

impl DeferralRule {
    #[must_use]
    pub fn matches(&self, text: &str) -> bool {
        self.pattern.is_match(text)
    }
}

static DEFERRAL_TERMS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:defer(?:red|ral|ring)?|transient|temporary failure|temporarily|try again|rate[ -]?limit(?:ed|ing)?|gr[ea]ylist(?:ed|ing)?|too many (?:connections|messages|recipients))").unwrap()
});
// Neither code may touch other dotted digits, so IPv4 octets such as
// `10.4.2.1` or `192.0.2.45` never read as a reply code.
static SMTP_4XX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:^|\s)(4[0-9]{2})(?:[\s-]|$)").unwrap());
static ENHANCED_4XX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:^|[^0-9.])(4\.[0-9]{1,3}\.[0-9]{1,3})\.?(?:[^0-9.]|$)").unwrap()
});

pub static DEFERRAL_RULES: &[DeferralRule] = &[
    DeferralRule {
        id: "deferral:vocabulary",
        pattern: &DEFERRAL_TERMS,
    },
    DeferralRule {
        id: "deferral:enhanced-4xx",
        pattern: &ENHANCED_4XX,
    },
    DeferralRule {
        id: "deferral:smtp-4xx",
        pattern: &SMTP_4XX,
    },
];

/// Maps a domain suffix to a mailbox provider.
pub struct ProviderRule {
    pub provider: &'static str,
    pub suffixes: &'static [&'static str],
}

pub static PROVIDER_RULES: &[ProviderRule] = &[
    ProviderRule {
        provider: "google",
        suffixes: &["gmail.com", "googlemail.com", "google.com"],
    },
    ProviderRule {
        provider: "microsoft",
        suffixes: &[
            "outlook.com",
            "hotmail.com",
            "live.com",
            "msn.com",
            "office365.com",
        ],
    },
    ProviderRule {
        provider: "yahoo",
        suffixes: &["yahoo.com", "yahoo.co.uk", "ymail.com", "aol.com"],
    },
    ProviderRule {
        provider: "apple",
        suffixes: &["icloud.com", "me.com", "mac.com"],
    },
    ProviderRule {
        provider: "proton",
        suffixes: &["proton.me", "protonmail.com"],
    },
];

static TRANSIENT_EVENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(?:transient_?failure|deferr?al|deferred|delayed|tempfail)$").unwrap()
});
static LEVEL_TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(error|err|crit|critical|fatal|panic|alert|emerg|warn|warning|info|notice|debug|trace)\b").unwrap()
});
static ANSI_SEQUENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\x1b\[[0-?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[@-Z\\-_]").unwrap()
});

const EVENT_FIELDS: &[&str] = &["type", "event", "kind"];
const DOMAIN_FIELDS: &[&str] = &["domain", "rcpt_domain", "recipient_domain"];
const RECIPIENT_FIELDS: &[&str] = &["recipient", "rcpt", "rcpt_to", "envelope_to", "to"];
const BODY_FIELDS: &[&str] = &["message", "msg", "text", "reason"];
const PROVIDER_FIELDS: &[&str] = &["provider", "provider_name"];

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn normalize_domain(raw: &str) -> Option<String> {
    let domain = raw.trim().trim_end_matches('.').to_ascii_lowercase();
    (domain.contains('.') && !domain.starts_with('.')).then_some(domain)
}

/// First domain found by [`ADDRESS_RULES`].
#[must_use]
pub fn extract_domain(text: &str) -> Option<String> {
    ADDRESS_RULES.iter().find_map(|rule| rule.extract(text))
}

/// True when any [`DEFERRAL_RULES`] entry matches.
#[must_use]
pub fn has_deferral_vocabulary(text: &str) -> bool {
    DEFERRAL_RULES.iter().any(|rule| rule.matches(text))
}

/// Provider for a domain, or the domain itself when unknown.
#[must_use]
pub fn classify_provider(domain: &str) -> String {
    let domain = domain.to_ascii_lowercase();
    PROVIDER_RULES
        .iter()
        .find(|rule| {
            rule.suffixes.iter().any(|suffix| {
                domain == *suffix
                    || domain
                        .strip_suffix(suffix)
                        .is_some_and(|head| head.ends_with('.'))
            })
        })
        .map_or(domain.clone(), |rule| rule.provider.to_string())
}

/// Collapse whitespace and cap to `max_chars`.
#[must_use]
pub fn trim_text(text: &str, max_chars: usize) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    truncate_chars(&collapsed, max_chars)
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}…", &text[..idx]),
        None => text.to_string(),
    }
}

/// Strip terminal escape sequences and control characters, then truncate.
#[must_use]
pub fn clean_display(text: &str, max_chars: usize) -> String {
    let stripped = ANSI_SEQUENCE.replace_all(text, "");
    let printable: String = stripped
        .chars()
        .map(|c| if c == '\t' { ' ' } else { c })
        .filter(|c| !c.is_control())
        .collect();
    truncate_chars(printable.trim(), max_chars)
}

fn level_from_token(token: &str) -> Option<EventLevel> {
    match token.to_ascii_lowercase().as_str() {
        "error" | "err" | "crit" | "critical" | "fatal" | "panic" | "alert" | "emerg" => {
            Some(EventLevel::Error)
        }
        "warn" | "warning" => Some(EventLevel::Warn),
        "info" | "notice" => Some(EventLevel::Info),
        "debug" | "trace" => Some(EventLevel::Debug),
        _ => None,
    }
}

/// Severity from the first level token in free text; informational otherwise.
#[must_use]
pub fn infer_level(text: &str) -> EventLevel {
    LEVEL_TOKEN
        .captures(text)
        .and_then(|caps| caps.get(1))
        .and_then(|m| level_from_token(m.as_str()))
        .unwrap_or_default()
}

/// syslog priority as used by the journal (0 = emerg .. 7 = debug).
fn level_from_priority(priority: &Value) -> Option<EventLevel> {
    let value = match priority {
        Value::Number(n) => n.as_u64()?,
        Value::String(s) => s.trim().parse().ok()?,
        _ => return None,
    };
    Some(match value {
        0..=3 => EventLevel::Error,
        4 => EventLevel::Warn,
        5 | 6 => EventLevel::Info,
        _ => EventLevel::Debug,
    })
}

fn str_field<'a>(value: &'a Value, fields: &[&str]) -> Option<&'a str> {
    fields
        .iter()
        .filter_map(|field| value.get(*field))
        .find_map(Value::as_str)
}

fn code_value(value: &Value) -> Option<u16> {
    match value {
        Value::Number(n) => n.as_u64().and_then(|c| u16::try_from(c).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// `"4.2.1"` or `{"class": 4, "subject": 2, "detail": 1}`.
fn enhanced_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Object(_) => {
            let part = |key: &str| value.get(key).and_then(Value::as_u64);
            Some(format!(
                "{}.{}.{}",
                part("class")?,
                part("subject")?,
                part("detail")?
            ))
        }
        _ => None,
    }
}

/// Journal records carry the log line in `MESSAGE`, as a string or as a
/// byte array when it is not valid UTF-8.
fn journal_message(value: &Value) -> Option<String> {
    match value.get("MESSAGE")? {
        Value::String(s) => Some(s.clone()),
        Value::Array(items) => {
            let bytes: Vec<u8> = items
                .iter()
                .filter_map(|b| b.as_u64().and_then(|b| u8::try_from(b).ok()))
                .collect();
            Some(String::from_utf8_lossy(&bytes).into_owned())
        }
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

/// Classify one complete log line.
#[must_use]
pub fn classify_line(line: &str, max_display: usize) -> Classification {
    let line = line.trim_end_matches(['\r', '\n']);
    match serde_json::from_str::<Value>(line) {
        Ok(value) if value.is_object() => {
            if let Some(inner) = journal_message(&value) {
                let mut classification = classify_payload(&inner, max_display);
                if let Some(level) = value.get("PRIORITY").and_then(level_from_priority) {
                    classification.level = classification.level.max_severity(level);
                }
                return classification;
            }
            classify_json(&value, line, max_display)
        }
        _ => classify_text(line, max_display),
    }
}

/// A journal payload may itself be a JSON log record.
fn classify_payload(payload: &str, max_display: usize) -> Classification {
    match serde_json::from_str::<Value>(payload) {
        Ok(value) if value.is_object() => classify_json(&value, payload, max_display),
        _ => classify_text(payload, max_display),
    }
}

fn classify_json(value: &Value, raw: &str, max_display: usize) -> Classification {
    let level = str_field(value, &["level", "severity"])
        .and_then(level_from_token)
        .unwrap_or_else(|| infer_level(raw));

    // Unmarked records only fall back to their human-readable text, never to
    // the serialized record with its addresses and ids.
    let deferral = json_deferral(value).or_else(|| json_body(value).and_then(text_deferral));

    Classification {
        level,
        message: clean_display(raw, max_display),
        deferral,
    }
}

/// Response text, else the first message-like field.
fn json_body(value: &Value) -> Option<&str> {
    value
        .get("response")
        .and_then(|r| str_field(r, &["content", "text"]))
        .or_else(|| str_field(value, BODY_FIELDS))
}

fn json_deferral(value: &Value) -> Option<Deferral> {
    let marker = str_field(value, EVENT_FIELDS)?;
    if !TRANSIENT_EVENT.is_match(marker.trim()) {
        return None;
    }

    let response = value.get("response");
    let body = json_body(value);

    let domain = str_field(value, DOMAIN_FIELDS)
        .and_then(normalize_domain)
        .or_else(|| str_field(value, RECIPIENT_FIELDS).and_then(extract_domain))
        .or_else(|| body.and_then(extract_domain))?;

    let code = response
        .and_then(|r| r.get("code"))
        .or_else(|| value.get("code"))
        .and_then(code_value);
    let enhanced_code = response
        .and_then(|r| r.get("enhanced_code"))
        .or_else(|| value.get("enhanced_code"))
        .and_then(enhanced_value);
    let provider = str_field(value, PROVIDER_FIELDS).map(str::to_string);

    let detail = (code.is_some() || enhanced_code.is_some() || body.is_some()).then(|| {
        FailureDetail {
            provider,
            code,
            enhanced_code,
            text: trim_text(body.unwrap_or_default(), ERROR_TEXT_CAP),
        }
    });

    Some(Deferral {
        domain,
        source: MatchSource::Json,
        detail,
    })
}

fn classify_text(line: &str, max_display: usize) -> Classification {
    let cleaned = clean_display(line, usize::MAX);
    Classification {
        level: infer_level(&cleaned),
        message: truncate_chars(&cleaned, max_display),
        deferral: text_deferral(&cleaned),
    }
}

fn text_deferral(line: &str) -> Option<Deferral> {
    if !has_deferral_vocabulary(line) {
        return None;
    }
    let domain = extract_domain(line)?;

    let code_match = SMTP_4XX.captures(line).and_then(|caps| caps.get(1));
    let enhanced_match = ENHANCED_4XX.captures(line).and_then(|caps| caps.get(1));
    let detail = if code_match.is_some() || enhanced_match.is_some() {
        let text_start = [code_match, enhanced_match]
            .into_iter()
            .flatten()
            .map(|m| m.end())
            .max()
            .unwrap_or(0);
        let tail = line[text_start..].trim();
        Some(FailureDetail {
            provider: None,
            code: code_match.and_then(|m| m.as_str().parse().ok()),
            enhanced_code: enhanced_match.map(|m| m.as_str().to_string()),
            text: trim_text(if tail.is_empty() { line } else { tail }, ERROR_TEXT_CAP),
        })
    } else {
        None
    };

    Some(Deferral {
        domain,
        source: MatchSource::Text,
        detail,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_transient_failure_with_explicit_domain() {
        let line = r#"{"event":"TransientFailure","domain":"example.com","response":{"code":450,"text":"try again"}}"#;
        let c = classify_line(line, 400);
        let deferral = c.deferral.expect("deferral");
        assert_eq!(deferral.domain, "example.com");
        assert_eq!(deferral.source, MatchSource::Json);
        let detail = deferral.detail.expect("detail");
        assert_eq!(detail.code, Some(450));
        assert_eq!(detail.text, "try again");
    }

    #[test]
    fn json_domain_from_recipient_field() {
        let line = r#"{"type":"TransientFailure","recipient":"Bob@Mail.Example.NET","response":{"code":421,"enhanced_code":{"class":4,"subject":7,"detail":0},"content":"  too   busy  "}}"#;
        let deferral = classify_line(line, 400).deferral.unwrap();
        assert_eq!(deferral.domain, "mail.example.net");
        let detail = deferral.detail.unwrap();
        assert_eq!(detail.enhanced_code.as_deref(), Some("4.7.0"));
        assert_eq!(detail.text, "too busy");
    }

    #[test]
    fn json_domain_from_message_body() {
        let line = r#"{"type":"Deferred","message":"queue for <x@corp.example> held"}"#;
        let deferral = classify_line(line, 400).deferral.unwrap();
        assert_eq!(deferral.domain, "corp.example");
    }

    #[test]
    fn json_delivery_is_not_a_deferral() {
        let line = r#"{"type":"Delivery","recipient":"a@b.com","response":{"code":250}}"#;
        let c = classify_line(line, 400);
        assert!(c.deferral.is_none());
        assert_eq!(c.level, EventLevel::Info);
    }

    #[test]
    fn json_delivery_with_peer_address_is_not_a_deferral() {
        let line = r#"{"type":"Delivery","recipient":"a@corp.example","peer_address":{"addr":"10.4.2.1"},"response":{"code":250,"content":"2.0.0 OK"}}"#;
        assert!(classify_line(line, 400).deferral.is_none());
    }

    #[test]
    fn unmarked_json_falls_back_to_body_text_only() {
        let line = r#"{"level":"warn","message":"rcpt=<x@corp.example> 451 4.7.1 try again later","id":"4.2.1"}"#;
        let deferral = classify_line(line, 400).deferral.unwrap();
        assert_eq!(deferral.domain, "corp.example");
        assert_eq!(deferral.source, MatchSource::Text);
        let detail = deferral.detail.unwrap();
        assert_eq!(detail.enhanced_code.as_deref(), Some("4.7.1"));
        assert_eq!(detail.text, "try again later");
    }

    #[test]
    fn json_level_field_sets_severity() {
        let c = classify_line(r#"{"level":"WARN","fields":{"message":"disk low"}}"#, 400);
        assert_eq!(c.level, EventLevel::Warn);
    }

    #[test]
    fn text_rcpt_line_yields_domain() {
        let line = "smtp: rcpt=<user@mail.example.org> 450 4.2.1 mailbox temporarily unavailable";
        let deferral = classify_line(line, 400).deferral.unwrap();
        assert_eq!(deferral.domain, "mail.example.org");
        assert_eq!(deferral.source, MatchSource::Text);
        let detail = deferral.detail.unwrap();
        assert_eq!(detail.code, Some(450));
        assert_eq!(detail.enhanced_code.as_deref(), Some("4.2.1"));
        assert_eq!(detail.text, "mailbox temporarily unavailable");
    }

    #[test]
    fn text_without_address_is_not_a_deferral() {
        assert!(classify_line("connection deferred by peer", 400).deferral.is_none());
    }

    #[test]
    fn text_without_vocabulary_is_not_a_deferral() {
        assert!(classify_line("delivered to <a@b.com> 250 ok", 400).deferral.is_none());
    }

    #[test]
    fn ipv4_octets_are_not_status_codes() {
        let line = "delivered to <a@corp.example> via 10.4.2.1 status=sent";
        assert!(classify_line(line, 400).deferral.is_none());
        assert!(!DEFERRAL_RULES[1].matches("peer 192.0.2.45 4.2.1.9"));
        assert!(!DEFERRAL_RULES[2].matches("peer 198.51.100.4 450.1"));
        assert!(DEFERRAL_RULES[1].matches("mailbox busy (4.2.1)."));
    }

    #[test]
    fn greylisting_counts_as_deferral() {
        let deferral = classify_line("to=jane@greylist.example greylisted, come back later", 400)
            .deferral
            .unwrap();
        assert_eq!(deferral.domain, "greylist.example");
        assert!(deferral.detail.is_none());
    }

    #[test]
    fn address_rules_apply_in_order() {
        let text = "from @sender.example to=a@rcpt.example <b@angle.example>";
        assert_eq!(extract_domain(text).as_deref(), Some("angle.example"));
        assert_eq!(
            ADDRESS_RULES[1].extract(text).as_deref(),
            Some("rcpt.example")
        );
        assert_eq!(
            ADDRESS_RULES[2].extract(text).as_deref(),
            Some("sender.example")
        );
    }

    #[test]
    fn each_deferral_rule_matches_its_vocabulary() {
        assert!(DEFERRAL_RULES[0].matches("Rate limited, Try Again later"));
        assert!(DEFERRAL_RULES[1].matches("status 4.7.1"));
        assert!(DEFERRAL_RULES[2].matches("451 local error"));
        assert!(!DEFERRAL_RULES[2].matches("size=4500 bytes"));
    }

    #[test]
    fn journal_byte_array_is_decoded() {
        let text = "rcpt=<u@bytes.example> 451 temporary failure";
        let bytes: Vec<String> = text.bytes().map(|b| b.to_string()).collect();
        let line = format!(r#"{{"MESSAGE":[{}],"PRIORITY":"4"}}"#, bytes.join(","));
        let c = classify_line(&line, 400);
        assert_eq!(c.deferral.unwrap().domain, "bytes.example");
        assert_eq!(c.level, EventLevel::Warn);
        assert!(c.message.starts_with("rcpt="));
    }

    #[test]
    fn journal_string_message_wrapping_json_record() {
        let inner = r#"{\"type\":\"TransientFailure\",\"domain\":\"j.example\"}"#;
        let line = format!(r#"{{"MESSAGE":"{inner}","PRIORITY":"6"}}"#);
        let deferral = classify_line(&line, 400).deferral.unwrap();
        assert_eq!(deferral.domain, "j.example");
        assert!(deferral.detail.is_none());
    }

    #[test]
    fn control_sequences_are_stripped_and_truncated() {
        let c = classify_line("\x1b[31mERROR\x1b[0m something\tbroke\x07", 12);
        assert_eq!(c.message, "ERROR someth…");
        assert_eq!(c.level, EventLevel::Error);
    }

    #[test]
    fn provider_rules_match_suffixes() {
        assert_eq!(classify_provider("gmail.com"), "google");
        assert_eq!(classify_provider("eu.outlook.com"), "microsoft");
        assert_eq!(classify_provider("notgmail.com"), "notgmail.com");
        assert_eq!(classify_provider("Example.ORG"), "example.org");
    }

    #[test]
    fn trim_text_collapses_and_caps() {
        assert_eq!(trim_text(" a \n b\t\tc ", 10), "a b c");
        assert_eq!(trim_text("abcdef", 3), "abc…");
    }

    #[test]
    fn level_defaults_to_info() {
        assert_eq!(infer_level("nothing to see"), EventLevel::Info);
        assert_eq!(infer_level("[debug] probe"), EventLevel::Debug);
    }
}
