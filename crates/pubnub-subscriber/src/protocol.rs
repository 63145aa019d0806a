//! PubNub wire protocol: request builders, subscribe response decoding, and
//! request signing.

use std::collections::BTreeMap;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE;
use hmac::{Hmac, Mac};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use serde::{Deserialize, Deserializer};
use sha2::Sha256;

use crate::config::Config;
use crate::state::{Cursor, HeartbeatTicket, SubscribeSnapshot};
use crate::transport::Request;
use crate::types::{
    Error, Message, MessageKind, Operation, Presence, PresenceAction, SubscribeEnvelope,
};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

pub const PNSDK: &str = "pubnub-subscriber-rs/0.1";
pub const PRESENCE_SUFFIX: &str = "-pnpres";

/// Everything but RFC 3986 unreserved characters.
const COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

const MESSAGE_TYPE_MESSAGE: i64 = 0;
const MESSAGE_TYPE_SIGNAL: i64 = 1;

type HmacSha256 = Hmac<Sha256>;

// ---------------------------------------------------------------------------
// Encoding helpers
// ---------------------------------------------------------------------------

/// Percent-encode a single path segment or query value.
pub fn encode_component(value: &str) -> String {
    utf8_percent_encode(value, COMPONENT).to_string()
}

/// Comma-join encoded names; the server expects `,` for "no channels".
pub fn join_channels(channels: &[String]) -> String {
    if channels.is_empty() {
        return ",".to_string();
    }
    channels
        .iter()
        .map(|c| encode_component(c))
        .collect::<Vec<_>>()
        .join(",")
}

/// `uuid` and `pnsdk`.
pub(crate) fn base_query(config: &Config) -> Vec<(String, String)> {
    vec![
        ("uuid".to_string(), config.user_id.clone()),
        ("pnsdk".to_string(), PNSDK.to_string()),
    ]
}

/// [`base_query`] plus `auth` when an auth key is configured.
pub(crate) fn default_query(config: &Config) -> Vec<(String, String)> {
    let mut query = base_query(config);
    if let Some(auth) = config.auth_key.as_deref().filter(|a| !a.is_empty()) {
        query.push(("auth".to_string(), auth.to_string()));
    }
    query
}

fn push_groups(query: &mut Vec<(String, String)>, groups: &[String]) {
    if !groups.is_empty() {
        query.push(("channel-group".to_string(), groups.join(",")));
    }
}

fn push_presence_timeout(query: &mut Vec<(String, String)>, config: &Config) {
    let secs = config.presence_timeout.as_secs();
    if secs > 0 {
        query.push(("heartbeat".to_string(), secs.to_string()));
    }
}

// ---------------------------------------------------------------------------
// Request builders
// ---------------------------------------------------------------------------

pub(crate) fn subscribe_request(config: &Config, snapshot: &SubscribeSnapshot) -> Request {
    let path = format!(
        "/v2/subscribe/{}/{}/0",
        encode_component(&config.subscribe_key),
        join_channels(&snapshot.channels)
    );
    let mut request = Request::get(Operation::Subscribe, path);
    let query = &mut request.query;
    query.push(("tt".to_string(), snapshot.cursor.timetoken.to_string()));
    if let Some(region) = snapshot.cursor.region {
        query.push(("tr".to_string(), region.to_string()));
    }
    push_presence_timeout(query, config);
    push_groups(query, &snapshot.groups);
    if let Some(expr) = snapshot.filter_expression.as_deref().filter(|e| !e.is_empty()) {
        query.push(("filter-expr".to_string(), expr.to_string()));
    }
    query.extend(default_query(config));
    request
}

pub(crate) fn heartbeat_request(config: &Config, ticket: &HeartbeatTicket) -> Request {
    let path = format!(
        "/v2/presence/sub-key/{}/channel/{}/heartbeat",
        encode_component(&config.subscribe_key),
        join_channels(&ticket.channels)
    );
    let mut request = Request::get(Operation::Heartbeat, path);
    push_presence_timeout(&mut request.query, config);
    push_groups(&mut request.query, &ticket.groups);
    request.query.extend(default_query(config));
    request
}

pub(crate) fn leave_request(config: &Config, channels: &[String], groups: &[String]) -> Request {
    let path = format!(
        "/v2/presence/sub-key/{}/channel/{}/leave",
        encode_component(&config.subscribe_key),
        join_channels(channels)
    );
    let mut request = Request::get(Operation::Leave, path);
    push_groups(&mut request.query, groups);
    request.query.extend(default_query(config));
    request
}

// ---------------------------------------------------------------------------
// Subscribe response decoding
// ---------------------------------------------------------------------------

/// Decoded subscribe response: the next cursor and the envelopes to deliver.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscribeResponse {
    pub cursor: Cursor,
    pub envelopes: Vec<SubscribeEnvelope>,
}

#[derive(Deserialize)]
struct RawResponse {
    t: RawCursor,
    #[serde(default)]
    m: Vec<serde_json::Value>,
}

#[derive(Deserialize)]
struct RawCursor {
    #[serde(deserialize_with = "timetoken")]
    t: u64,
    #[serde(default)]
    r: Option<u32>,
}

#[derive(Deserialize)]
struct RawEnvelope {
    #[serde(rename = "c")]
    channel: String,
    #[serde(rename = "b", default)]
    subscription: Option<String>,
    #[serde(rename = "d", default)]
    payload: serde_json::Value,
    #[serde(rename = "e", default)]
    message_type: Option<i64>,
    #[serde(rename = "i", default)]
    publisher: Option<String>,
    #[serde(rename = "p", default)]
    publish: Option<RawCursor>,
    #[serde(rename = "u", default)]
    user_metadata: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct RawPresence {
    action: PresenceAction,
    #[serde(default)]
    uuid: Option<String>,
    #[serde(default)]
    occupancy: u32,
    #[serde(default)]
    timestamp: i64,
    #[serde(default)]
    data: Option<serde_json::Value>,
    #[serde(default)]
    join: Vec<String>,
    #[serde(default)]
    leave: Vec<String>,
    #[serde(default)]
    timeout: Vec<String>,
    #[serde(default)]
    here_now_refresh: bool,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawTimetoken {
    Text(String),
    Number(u64),
}

fn timetoken<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    match RawTimetoken::deserialize(deserializer)? {
        RawTimetoken::Number(n) => Ok(n),
        RawTimetoken::Text(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

/// Decode a subscribe response body.
///
/// A body that is not a subscribe response is an error. A single envelope
/// that cannot be decoded is logged and skipped; the rest are still returned.
pub fn parse_subscribe_response(body: &[u8]) -> Result<SubscribeResponse, Error> {
    let raw: RawResponse = serde_json::from_slice(body)
        .map_err(|e| Error::ResponseParsing(format!("invalid subscribe response: {e}")))?;
    let cursor = Cursor {
        timetoken: raw.t.t,
        region: raw.t.r,
    };

    let mut envelopes = Vec::with_capacity(raw.m.len());
    for value in raw.m {
        match decode_envelope(value, cursor.timetoken) {
            Ok(Some(envelope)) => envelopes.push(envelope),
            Ok(None) => {}
            Err(e) => tracing::warn!("Skipping undecodable envelope: {e}"),
        }
    }
    Ok(SubscribeResponse { cursor, envelopes })
}

fn decode_envelope(
    value: serde_json::Value,
    fallback_timetoken: u64,
) -> Result<Option<SubscribeEnvelope>, serde_json::Error> {
    let raw: RawEnvelope = serde_json::from_value(value)?;
    let timetoken = raw.publish.as_ref().map_or(fallback_timetoken, |p| p.t);

    if let Some(channel) = raw.channel.strip_suffix(PRESENCE_SUFFIX) {
        let channel = channel.to_string();
        let subscription = subscription_match(
            raw.subscription
                .as_deref()
                .map(|b| b.strip_suffix(PRESENCE_SUFFIX).unwrap_or(b)),
            &channel,
        );
        let presence: RawPresence = serde_json::from_value(raw.payload)?;
        return Ok(Some(SubscribeEnvelope::Presence(Presence {
            action: presence.action,
            channel,
            subscription,
            timetoken,
            uuid: presence.uuid,
            occupancy: presence.occupancy,
            timestamp: presence.timestamp,
            state: presence.data,
            join: presence.join,
            leave: presence.leave,
            timeout: presence.timeout,
            here_now_refresh: presence.here_now_refresh,
        })));
    }

    let kind = match raw.message_type.unwrap_or(MESSAGE_TYPE_MESSAGE) {
        MESSAGE_TYPE_MESSAGE => MessageKind::Message,
        MESSAGE_TYPE_SIGNAL => MessageKind::Signal,
        other => {
            tracing::debug!(message_type = other, channel = %raw.channel, "Ignoring unsupported envelope type");
            return Ok(None);
        }
    };
    let subscription = subscription_match(raw.subscription.as_deref(), &raw.channel);
    Ok(Some(SubscribeEnvelope::Message(Message {
        kind,
        channel: raw.channel,
        subscription,
        timetoken,
        payload: raw.payload,
        publisher: raw.publisher,
        user_metadata: raw.user_metadata,
    })))
}

fn subscription_match(subscription: Option<&str>, channel: &str) -> Option<String> {
    subscription
        .filter(|s| !s.is_empty() && *s != channel)
        .map(str::to_string)
}

// ---------------------------------------------------------------------------
// Signing
// ---------------------------------------------------------------------------

/// Canonical string signed by access-manager requests:
/// `sub \n pub \n operation \n sorted-encoded-query`.
pub fn signature_input(
    subscribe_key: &str,
    publish_key: &str,
    operation: &str,
    query: &[(String, String)],
) -> String {
    let sorted: BTreeMap<&str, &str> = query
        .iter()
        .filter(|(k, _)| k != "signature")
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect();
    let canonical = sorted
        .into_iter()
        .map(|(k, v)| format!("{}={}", encode_component(k), encode_component(v)))
        .collect::<Vec<_>>()
        .join("&");
    format!("{subscribe_key}\n{publish_key}\n{operation}\n{canonical}")
}

/// HMAC-SHA256 of `input` keyed by `secret`, URL-safe base64.
pub fn sign(secret: &str, input: &str) -> Result<String, Error> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| Error::Validation(format!("invalid secret key: {e}")))?;
    mac.update(input.as_bytes());
    Ok(URL_SAFE.encode(mac.finalize().into_bytes()))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn config() -> Config {
        Config::new("sub-key", "me")
    }

    fn snapshot(channels: &[&str], groups: &[&str], cursor: Cursor) -> SubscribeSnapshot {
        SubscribeSnapshot {
            channels: channels.iter().map(|s| s.to_string()).collect(),
            groups: groups.iter().map(|s| s.to_string()).collect(),
            cursor,
            filter_expression: None,
            generation: 1,
        }
    }

    #[test]
    fn handshake_request() {
        let request = subscribe_request(&config(), &snapshot(&["a", "b c"], &[], Cursor::default()));
        assert_eq!(request.path, "/v2/subscribe/sub-key/a,b%20c/0");
        assert_eq!(request.query_value("tt"), Some("0"));
        assert_eq!(request.query_value("tr"), None);
        assert_eq!(request.query_value("heartbeat"), Some("300"));
        assert_eq!(request.query_value("uuid"), Some("me"));
        assert_eq!(request.query_value("pnsdk"), Some(PNSDK));
        assert_eq!(request.query_value("auth"), None);
        assert_eq!(request.query_value("channel-group"), None);
    }

    #[test]
    fn subscribe_request_echoes_cursor() {
        let mut config = config();
        config.auth_key = Some("secret-auth".to_string());
        let mut snap = snapshot(
            &[],
            &["cg1", "cg2"],
            Cursor {
                timetoken: 100,
                region: Some(2),
            },
        );
        snap.filter_expression = Some("uuid != 'me'".to_string());
        let request = subscribe_request(&config, &snap);
        assert_eq!(request.path, "/v2/subscribe/sub-key/,/0");
        assert_eq!(request.query_value("tt"), Some("100"));
        assert_eq!(request.query_value("tr"), Some("2"));
        assert_eq!(request.query_value("channel-group"), Some("cg1,cg2"));
        assert_eq!(request.query_value("filter-expr"), Some("uuid != 'me'"));
        assert_eq!(request.query_value("auth"), Some("secret-auth"));
    }

    #[test]
    fn zero_presence_timeout_omits_heartbeat_param() {
        let config = config().with_presence_timeout(Duration::ZERO);
        let request = subscribe_request(&config, &snapshot(&["a"], &[], Cursor::default()));
        assert_eq!(request.query_value("heartbeat"), None);
    }

    #[test]
    fn heartbeat_and_leave_requests() {
        let config = config().with_presence_timeout(Duration::from_secs(6));
        let ticket = HeartbeatTicket {
            channels: vec!["ch".to_string()],
            groups: vec!["cg".to_string()],
            interval: Duration::from_secs(2),
        };
        let request = heartbeat_request(&config, &ticket);
        assert_eq!(request.operation, Operation::Heartbeat);
        assert_eq!(request.path, "/v2/presence/sub-key/sub-key/channel/ch/heartbeat");
        assert_eq!(request.query_value("heartbeat"), Some("6"));
        assert_eq!(request.query_value("channel-group"), Some("cg"));

        let request = leave_request(&config, &[], &["cg".to_string()]);
        assert_eq!(request.operation, Operation::Leave);
        assert_eq!(request.path, "/v2/presence/sub-key/sub-key/channel/,/leave");
        assert_eq!(request.query_value("channel-group"), Some("cg"));
        assert_eq!(request.query_value("heartbeat"), None);
    }

    #[test]
    fn parse_messages_signals_and_presence() {
        let body = br#"{
            "t": {"t": "15000000000000001", "r": 12},
            "m": [
                {"a": "1", "c": "ch1", "d": {"text": "hi"}, "i": "alice",
                 "p": {"t": "14999999999999999", "r": 12}, "k": "sub-key"},
                {"c": "ch1", "b": "cg", "d": "ping", "e": 1,
                 "p": {"t": "15000000000000000", "r": 12}, "u": {"x": 1}},
                {"c": "ch1-pnpres", "b": "ch1-pnpres",
                 "d": {"action": "join", "uuid": "bob", "occupancy": 2, "timestamp": 1700000000},
                 "p": {"t": "15000000000000001", "r": 12}},
                {"c": "ch1", "d": {}, "e": 2, "p": {"t": "1", "r": 12}}
            ]
        }"#;
        let response = parse_subscribe_response(body).unwrap();
        assert_eq!(
            response.cursor,
            Cursor {
                timetoken: 15000000000000001,
                region: Some(12)
            }
        );
        assert_eq!(response.envelopes.len(), 3);

        match &response.envelopes[0] {
            SubscribeEnvelope::Message(m) => {
                assert_eq!(m.kind, MessageKind::Message);
                assert_eq!(m.channel, "ch1");
                assert_eq!(m.subscription, None);
                assert_eq!(m.timetoken, 14999999999999999);
                assert_eq!(m.payload, serde_json::json!({"text": "hi"}));
                assert_eq!(m.publisher.as_deref(), Some("alice"));
            }
            other => panic!("expected message, got {other:?}"),
        }
        match &response.envelopes[1] {
            SubscribeEnvelope::Message(m) => {
                assert_eq!(m.kind, MessageKind::Signal);
                assert_eq!(m.subscription.as_deref(), Some("cg"));
                assert_eq!(m.user_metadata, Some(serde_json::json!({"x": 1})));
            }
            other => panic!("expected signal, got {other:?}"),
        }
        match &response.envelopes[2] {
            SubscribeEnvelope::Presence(p) => {
                assert_eq!(p.action, PresenceAction::Join);
                assert_eq!(p.channel, "ch1");
                assert_eq!(p.subscription, None);
                assert_eq!(p.uuid.as_deref(), Some("bob"));
                assert_eq!(p.occupancy, 2);
                assert_eq!(p.timestamp, 1700000000);
            }
            other => panic!("expected presence, got {other:?}"),
        }
    }

    #[test]
    fn parse_interval_presence() {
        let body = br#"{"t":{"t":"2","r":1},"m":[{"c":"lobby-pnpres","d":{
            "action":"interval","occupancy":4,"timestamp":10,
            "join":["a","b"],"leave":["c"],"here_now_refresh":true}}]}"#;
        let response = parse_subscribe_response(body).unwrap();
        let SubscribeEnvelope::Presence(p) = &response.envelopes[0] else {
            panic!("expected presence");
        };
        assert_eq!(p.action, PresenceAction::Interval);
        assert_eq!(p.timetoken, 2);
        assert_eq!(p.join, vec!["a", "b"]);
        assert_eq!(p.leave, vec!["c"]);
        assert!(p.timeout.is_empty());
        assert!(p.here_now_refresh);
    }

    #[test]
    fn numeric_timetoken_and_missing_messages() {
        let response = parse_subscribe_response(br#"{"t":{"t":42,"r":3}}"#).unwrap();
        assert_eq!(response.cursor.timetoken, 42);
        assert!(response.envelopes.is_empty());
    }

    #[test]
    fn bad_envelope_is_skipped() {
        let body = br#"{"t":{"t":"5","r":1},"m":[{"d":"no channel"},{"c":"ok","d":1}]}"#;
        let response = parse_subscribe_response(body).unwrap();
        assert_eq!(response.envelopes.len(), 1);
    }

    #[test]
    fn malformed_response_is_an_error() {
        for body in [&b"<html>"[..], br#"{"m":[]}"#, br#"{"t":{"t":"abc"}}"#] {
            let err = parse_subscribe_response(body).unwrap_err();
            assert!(matches!(err, Error::ResponseParsing(_)));
        }
    }

    #[test]
    fn encode_component_reserved() {
        assert_eq!(encode_component("a b/c,d"), "a%20b%2Fc%2Cd");
        assert_eq!(encode_component("safe-_.~"), "safe-_.~");
        assert_eq!(join_channels(&[]), ",");
    }

    #[test]
    fn signature_input_sorts_and_encodes() {
        let query = vec![
            ("w".to_string(), "1".to_string()),
            ("auth".to_string(), "key one".to_string()),
            ("signature".to_string(), "ignored".to_string()),
            ("r".to_string(), "1".to_string()),
        ];
        assert_eq!(
            signature_input("sub", "pub", "grant", &query),
            "sub\npub\ngrant\nauth=key%20one&r=1&w=1"
        );
    }

    #[test]
    fn sign_is_url_safe_base64() {
        let signature = sign("secret", "sub\npub\ngrant\nr=1").unwrap();
        assert_eq!(signature.len(), 44);
        assert!(!signature.contains('+'));
        assert!(!signature.contains('/'));
        assert_eq!(signature, sign("secret", "sub\npub\ngrant\nr=1").unwrap());
        assert_ne!(signature, sign("other", "sub\npub\ngrant\nr=1").unwrap());
    }
}
