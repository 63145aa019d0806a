//! One-shot REST endpoints executed over the subscriber's [`Transport`].
//!
//! Each endpoint describes its request (path, query, body) and decodes its
//! response; [`Subscriber::execute`](crate::Subscriber::execute) does the rest.

mod grant;
mod push;

pub use grant::{AuthPermissions, Grant, GrantLevel, GrantResponse, ResourcePermissions};
pub use push::{ListPushProvisions, ListPushProvisionsResponse, PushType};

use crate::config::Config;
use crate::transport::{Method, Request, Transport};
use crate::types::{Error, Operation};

/// A one-shot request/response operation.
pub trait Endpoint: Send + Sync {
    type Output;

    fn operation(&self) -> Operation;

    /// Check the endpoint's arguments against `config` before any network call.
    fn validate(&self, config: &Config) -> Result<(), Error>;

    /// Percent-encoded request path.
    fn build_path(&self, config: &Config) -> Result<String, Error>;

    /// Query parameters, including the defaults from [`Config`].
    fn build_query(&self, config: &Config) -> Result<Vec<(String, String)>, Error>;

    fn build_body(&self) -> Result<Option<Vec<u8>>, Error> {
        Ok(None)
    }

    fn method(&self) -> Method {
        Method::Get
    }

    fn parse(&self, body: &[u8]) -> Result<Self::Output, Error>;
}

pub(crate) async fn execute<E: Endpoint>(
    config: &Config,
    transport: &dyn Transport,
    endpoint: &E,
) -> Result<E::Output, Error> {
    endpoint.validate(config)?;
    let request = Request {
        operation: endpoint.operation(),
        method: endpoint.method(),
        path: endpoint.build_path(config)?,
        query: endpoint.build_query(config)?,
        body: endpoint.build_body()?,
    };
    tracing::debug!(operation = ?request.operation, path = %request.path, "Executing endpoint");
    let response = transport
        .execute(&request, config.timing.request_timeout)
        .await?;
    endpoint.parse(&response.body)
}

/// Set caller-supplied parameters, replacing any existing value for the same key.
pub(crate) fn set_query_params(query: &mut Vec<(String, String)>, extras: &[(String, String)]) {
    for (key, value) in extras {
        match query.iter_mut().find(|(k, _)| k == key) {
            Some(existing) => existing.1 = value.clone(),
            None => query.push((key.clone(), value.clone())),
        }
    }
}

pub(crate) fn parse_error(e: serde_json::Error, body: &[u8]) -> Error {
    Error::ResponseParsing(format!(
        "Error unmarshalling response: {e}: {}",
        String::from_utf8_lossy(body)
    ))
}
