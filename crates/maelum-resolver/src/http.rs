//! HTTP transport against the public resolver service.

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use maelum_core::AddressHash;

use crate::records::{AddressInfo, OrganisationInfo, ResolverConfig, RoutingInfo};
use crate::{ResolveError, Resolver};

const LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);
const LOOKUP_ATTEMPTS: u32 = 3;
const BACKOFF_BASE: Duration = Duration::from_millis(250);

pub struct HttpResolver {
    base_url: String,
    client: reqwest::Client,
}

impl HttpResolver {
    /// Creates a client against `base_url` (e.g. `https://resolver.maelum.org`).
    pub fn new(base_url: impl Into<String>) -> Result<Self, ResolveError> {
        let client = reqwest::Client::builder()
            .timeout(LOOKUP_TIMEOUT)
            .build()
            .map_err(|err| ResolveError::Transport(err.to_string()))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ResolveError> {
        let url = format!("{}{path}", self.base_url);
        let mut last_err = None;
        for attempt in 0..LOOKUP_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(BACKOFF_BASE * 2u32.pow(attempt - 1)).await;
            }
            match self.client.get(&url).send().await {
                Ok(response) if response.status() == reqwest::StatusCode::NOT_FOUND => {
                    return Err(ResolveError::NotFound);
                }
                Ok(response) if response.status().is_success() => {
                    return response
                        .json()
                        .await
                        .map_err(|err| ResolveError::Transport(err.to_string()));
                }
                Ok(response) if response.status().is_client_error() => {
                    return Err(ResolveError::Transport(format!(
                        "resolver rejected request: {}",
                        response.status()
                    )));
                }
                Ok(response) => {
                    last_err = Some(format!("resolver returned {}", response.status()));
                }
                Err(err) => {
                    last_err = Some(err.to_string());
                }
            }
            tracing::debug!(url = %url, attempt, "resolver lookup retrying");
        }
        Err(ResolveError::Transport(
            last_err.unwrap_or_else(|| "resolver unreachable".to_string()),
        ))
    }

    async fn post_json<T: Serialize>(&self, path: &str, body: &T) -> Result<(), ResolveError> {
        let url = format!("{}{path}", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|err| ResolveError::Transport(err.to_string()))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(ResolveError::Transport(format!(
                "resolver rejected upload: {}",
                response.status()
            )))
        }
    }
}

#[async_trait]
impl Resolver for HttpResolver {
    async fn address(&self, hash: &AddressHash) -> Result<AddressInfo, ResolveError> {
        self.get_json(&format!("/address/{hash}")).await
    }

    async fn routing(&self, routing_id: &str) -> Result<RoutingInfo, ResolveError> {
        self.get_json(&format!("/routing/{routing_id}")).await
    }

    async fn organisation(&self, hash: &AddressHash) -> Result<OrganisationInfo, ResolveError> {
        self.get_json(&format!("/organisation/{hash}")).await
    }

    async fn config(&self) -> Result<ResolverConfig, ResolveError> {
        self.get_json("/config").await
    }

    async fn publish_address(&self, info: &AddressInfo) -> Result<(), ResolveError> {
        self.post_json(&format!("/address/{}", info.address_hash), info)
            .await
    }

    async fn publish_routing(&self, info: &RoutingInfo) -> Result<(), ResolveError> {
        self.post_json(&format!("/routing/{}", info.routing_id), info)
            .await
    }

    async fn publish_organisation(&self, info: &OrganisationInfo) -> Result<(), ResolveError> {
        self.post_json(&format!("/organisation/{}", info.org_hash), info)
            .await
    }
}
