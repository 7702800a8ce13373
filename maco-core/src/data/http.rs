//! Blocking HTTP plumbing shared by the network providers.

use reqwest::blocking::Client;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;

use super::provider::ProviderError;
use super::retry::{Attempt, RetryPolicy};

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36";

pub(crate) fn build_client(timeout: Duration) -> Result<Client, ProviderError> {
    Client::builder()
        .timeout(timeout)
        .user_agent(USER_AGENT)
        .build()
        .map_err(|e| ProviderError::Client(e.to_string()))
}

/// GET `url` and decode a JSON body under the single-retry policy.
///
/// Errors are rendered without the request URL so query-string credentials
/// never reach logs.
pub(crate) fn get_json<T: DeserializeOwned>(
    client: &Client,
    url: &str,
    query: &[(&str, String)],
    policy: &RetryPolicy,
) -> Result<T, String> {
    policy.run(|attempt| {
        debug!(attempt, url, "provider request");
        let resp = match client.get(url).query(query).send() {
            Ok(resp) => resp,
            Err(e) => return Attempt::Failed(format!("request failed: {}", e.without_url())),
        };

        let status = resp.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Attempt::RateLimited;
        }
        if !status.is_success() {
            return Attempt::Failed(format!("HTTP {status}"));
        }

        match resp.json::<T>() {
            Ok(body) => Attempt::Done(body),
            Err(e) => Attempt::Failed(format!("malformed response: {}", e.without_url())),
        }
    })
}
