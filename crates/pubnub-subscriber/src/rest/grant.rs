//! Access-manager grant.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Deserializer};

use super::{Endpoint, parse_error, set_query_params};
use crate::config::Config;
use crate::protocol::{base_query, encode_component, sign, signature_input};
use crate::types::{Error, Operation};

/// Grant read/write/manage/delete permissions on channels and channel groups,
/// optionally scoped to auth keys. Requires publish and secret keys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Grant {
    pub auth_keys: Vec<String>,
    pub channels: Vec<String>,
    pub channel_groups: Vec<String>,
    pub read: bool,
    pub write: bool,
    pub manage: bool,
    pub delete: bool,
    /// Minutes. `None` leaves the server default.
    pub ttl: Option<i64>,
    pub query_params: Vec<(String, String)>,
}

impl Grant {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn auth_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.auth_keys = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn channels<I, S>(mut self, channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.channels = channels.into_iter().map(Into::into).collect();
        self
    }

    pub fn channel_groups<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.channel_groups = groups.into_iter().map(Into::into).collect();
        self
    }

    pub fn read(mut self, enabled: bool) -> Self {
        self.read = enabled;
        self
    }

    pub fn write(mut self, enabled: bool) -> Self {
        self.write = enabled;
        self
    }

    pub fn manage(mut self, enabled: bool) -> Self {
        self.manage = enabled;
        self
    }

    pub fn delete(mut self, enabled: bool) -> Self {
        self.delete = enabled;
        self
    }

    pub fn ttl(mut self, minutes: i64) -> Self {
        self.ttl = Some(minutes);
        self
    }

    pub fn query_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query_params.push((key.into(), value.into()));
        self
    }

    fn unsigned_query(&self, config: &Config, timestamp: u64) -> Vec<(String, String)> {
        let mut query = Vec::new();
        if !self.auth_keys.is_empty() {
            query.push(("auth".to_string(), self.auth_keys.join(",")));
        }
        if !self.channels.is_empty() {
            query.push(("channel".to_string(), self.channels.join(",")));
        }
        if !self.channel_groups.is_empty() {
            query.push(("channel-group".to_string(), self.channel_groups.join(",")));
        }
        query.push(("r".to_string(), bit(self.read)));
        query.push(("w".to_string(), bit(self.write)));
        query.push(("m".to_string(), bit(self.manage)));
        query.push(("d".to_string(), bit(self.delete)));
        if let Some(ttl) = self.ttl.filter(|ttl| *ttl >= -1) {
            query.push(("ttl".to_string(), ttl.to_string()));
        }
        query.push(("timestamp".to_string(), timestamp.to_string()));
        query.extend(base_query(config));
        set_query_params(&mut query, &self.query_params);
        query
    }
}

fn bit(enabled: bool) -> String {
    let bit = if enabled { "1" } else { "0" };
    bit.to_string()
}

fn required<'a>(value: Option<&'a str>, what: &str) -> Result<&'a str, Error> {
    value
        .filter(|v| !v.is_empty())
        .ok_or_else(|| Error::Validation(format!("missing {what}")))
}

impl Endpoint for Grant {
    type Output = GrantResponse;

    fn operation(&self) -> Operation {
        Operation::Grant
    }

    fn validate(&self, config: &Config) -> Result<(), Error> {
        required(Some(config.subscribe_key.as_str()), "subscribe key")?;
        required(config.secret_key.as_deref(), "secret key")?;
        required(config.publish_key.as_deref(), "publish key")?;
        Ok(())
    }

    fn build_path(&self, config: &Config) -> Result<String, Error> {
        Ok(format!(
            "/v2/auth/grant/sub-key/{}",
            encode_component(&config.subscribe_key)
        ))
    }

    fn build_query(&self, config: &Config) -> Result<Vec<(String, String)>, Error> {
        let secret = required(config.secret_key.as_deref(), "secret key")?;
        let publish_key = required(config.publish_key.as_deref(), "publish key")?;
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let mut query = self.unsigned_query(config, timestamp);
        let input = signature_input(&config.subscribe_key, publish_key, "grant", &query);
        query.push(("signature".to_string(), sign(secret, &input)?));
        Ok(query)
    }

    fn parse(&self, body: &[u8]) -> Result<GrantResponse, Error> {
        let envelope: RawEnvelope =
            serde_json::from_slice(body).map_err(|e| parse_error(e, body))?;
        Ok(GrantResponse::from(envelope.payload))
    }
}

// ---------------------------------------------------------------------------
// Response
// ---------------------------------------------------------------------------

/// Scope a grant response applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum GrantLevel {
    #[serde(rename = "user")]
    User,
    #[serde(rename = "channel")]
    Channel,
    #[serde(rename = "subkey")]
    Subkey,
    #[serde(rename = "channel-group")]
    ChannelGroup,
    #[serde(rename = "channel-group+auth")]
    ChannelGroupAuth,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthPermissions {
    pub read_enabled: bool,
    pub write_enabled: bool,
    pub manage_enabled: bool,
    pub delete_enabled: bool,
    pub ttl: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourcePermissions {
    pub name: String,
    pub read_enabled: bool,
    pub write_enabled: bool,
    pub manage_enabled: bool,
    pub delete_enabled: bool,
    /// The resource's own TTL, or the grant's TTL when absent.
    pub ttl: i64,
    pub auth_keys: HashMap<String, AuthPermissions>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrantResponse {
    pub level: GrantLevel,
    pub subscribe_key: String,
    pub ttl: i64,
    pub read_enabled: bool,
    pub write_enabled: bool,
    pub manage_enabled: bool,
    pub delete_enabled: bool,
    pub channels: HashMap<String, ResourcePermissions>,
    pub channel_groups: HashMap<String, ResourcePermissions>,
}

#[derive(Deserialize)]
struct RawEnvelope {
    payload: RawPayload,
}

#[derive(Deserialize)]
struct RawPayload {
    level: GrantLevel,
    #[serde(default)]
    subscribe_key: String,
    #[serde(default)]
    ttl: i64,
    #[serde(flatten)]
    perms: RawPerms,
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    channels: HashMap<String, RawResource>,
    #[serde(rename = "channel-groups", default)]
    channel_groups: Option<RawGroups>,
    #[serde(default)]
    auths: HashMap<String, RawPerms>,
}

/// `channel-groups` is a bare name for single-group grants, a map otherwise.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawGroups {
    Single(String),
    Many(HashMap<String, RawResource>),
}

#[derive(Deserialize)]
struct RawResource {
    #[serde(flatten)]
    perms: RawPerms,
    #[serde(default)]
    auths: HashMap<String, RawPerms>,
}

#[derive(Deserialize, Default)]
struct RawPerms {
    #[serde(default, deserialize_with = "flag")]
    r: bool,
    #[serde(default, deserialize_with = "flag")]
    w: bool,
    #[serde(default, deserialize_with = "flag")]
    m: bool,
    #[serde(default, deserialize_with = "flag")]
    d: bool,
    #[serde(default)]
    ttl: Option<i64>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawFlag {
    Bool(bool),
    Int(i64),
}

fn flag<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    Ok(match RawFlag::deserialize(deserializer)? {
        RawFlag::Bool(b) => b,
        RawFlag::Int(n) => n == 1,
    })
}

impl From<RawPerms> for AuthPermissions {
    fn from(raw: RawPerms) -> Self {
        Self {
            read_enabled: raw.r,
            write_enabled: raw.w,
            manage_enabled: raw.m,
            delete_enabled: raw.d,
            ttl: raw.ttl,
        }
    }
}

fn resource(
    name: String,
    perms: &RawPerms,
    auths: HashMap<String, RawPerms>,
    inherited_ttl: i64,
) -> ResourcePermissions {
    ResourcePermissions {
        read_enabled: perms.r,
        write_enabled: perms.w,
        manage_enabled: perms.m,
        delete_enabled: perms.d,
        ttl: perms.ttl.unwrap_or(inherited_ttl),
        auth_keys: auths
            .into_iter()
            .map(|(key, p)| (key, AuthPermissions::from(p)))
            .collect(),
        name,
    }
}

impl From<RawPayload> for GrantResponse {
    fn from(raw: RawPayload) -> Self {
        let ttl = raw.ttl;
        let mut channels: HashMap<String, ResourcePermissions> = raw
            .channels
            .into_iter()
            .map(|(name, r)| (name.clone(), resource(name, &r.perms, r.auths, ttl)))
            .collect();
        let mut channel_groups = HashMap::new();
        let mut top_auths = Some(raw.auths);

        match raw.channel_groups {
            Some(RawGroups::Many(groups)) => {
                for (name, r) in groups {
                    let res = resource(name.clone(), &r.perms, r.auths, ttl);
                    channel_groups.insert(name, res);
                }
            }
            Some(RawGroups::Single(name)) => {
                let auths = top_auths.take().unwrap_or_default();
                let res = resource(name.clone(), &raw.perms, auths, ttl);
                channel_groups.insert(name, res);
            }
            None => {}
        }
        if let Some(name) = raw.channel {
            let auths = top_auths.take().unwrap_or_default();
            let res = resource(name.clone(), &raw.perms, auths, ttl);
            channels.insert(name, res);
        }

        Self {
            level: raw.level,
            subscribe_key: raw.subscribe_key,
            ttl,
            read_enabled: raw.perms.r,
            write_enabled: raw.perms.w,
            manage_enabled: raw.perms.m,
            delete_enabled: raw.perms.d,
            channels,
            channel_groups,
        }
    }
}
