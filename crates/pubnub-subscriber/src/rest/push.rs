//! List the channels a device is registered on for push notifications.

use std::fmt;

use super::{Endpoint, parse_error, set_query_params};
use crate::config::Config;
use crate::protocol::{default_query, encode_component};
use crate::types::{Error, Operation};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushType {
    Gcm,
    Apns,
    Mpns,
}

impl PushType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Gcm => "gcm",
            Self::Apns => "apns",
            Self::Mpns => "mpns",
        }
    }
}

impl fmt::Display for PushType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListPushProvisions {
    pub device_id: String,
    pub push_type: Option<PushType>,
    pub query_params: Vec<(String, String)>,
}

impl ListPushProvisions {
    pub fn new(device_id: impl Into<String>, push_type: PushType) -> Self {
        Self {
            device_id: device_id.into(),
            push_type: Some(push_type),
            query_params: Vec::new(),
        }
    }

    pub fn query_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query_params.push((key.into(), value.into()));
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListPushProvisionsResponse {
    pub channels: Vec<String>,
}

impl Endpoint for ListPushProvisions {
    type Output = ListPushProvisionsResponse;

    fn operation(&self) -> Operation {
        Operation::ListPushProvisions
    }

    fn validate(&self, config: &Config) -> Result<(), Error> {
        if config.subscribe_key.is_empty() {
            return Err(Error::Validation("missing subscribe key".to_string()));
        }
        if self.device_id.is_empty() {
            return Err(Error::Validation("missing device id".to_string()));
        }
        if self.push_type.is_none() {
            return Err(Error::Validation("missing push type".to_string()));
        }
        Ok(())
    }

    fn build_path(&self, config: &Config) -> Result<String, Error> {
        Ok(format!(
            "/v1/push/sub-key/{}/devices/{}",
            encode_component(&config.subscribe_key),
            encode_component(&self.device_id)
        ))
    }

    fn build_query(&self, config: &Config) -> Result<Vec<(String, String)>, Error> {
        let push_type = self
            .push_type
            .ok_or_else(|| Error::Validation("missing push type".to_string()))?;
        let mut query = default_query(config);
        query.push(("type".to_string(), push_type.to_string()));
        set_query_params(&mut query, &self.query_params);
        Ok(query)
    }

    /// A JSON array of channel names. Any other JSON value yields no channels.
    fn parse(&self, body: &[u8]) -> Result<ListPushProvisionsResponse, Error> {
        let value: serde_json::Value =
            serde_json::from_slice(body).map_err(|e| parse_error(e, body))?;
        let channels = match value {
            serde_json::Value::Array(items) => items
                .into_iter()
                .map(|item| match item {
                    serde_json::Value::String(s) => Ok(s),
                    other => Err(Error::ResponseParsing(format!(
                        "expected channel name, got {other}"
                    ))),
                })
                .collect::<Result<Vec<_>, _>>()?,
            _ => Vec::new(),
        };
        Ok(ListPushProvisionsResponse { channels })
    }
}
