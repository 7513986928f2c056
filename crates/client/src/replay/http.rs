// reqwest-backed delivery transport.
//
// Base URLs must be https; plain http is allowed only for loopback hosts
// during local testing.

use std::net::IpAddr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use url::Url;

use folio_common::protocol::{IDEMPOTENCY_KEY_HEADER, OPERATION_KIND_HEADER};
use folio_common::types::HttpMethod;

use super::{DeliveryRequest, DeliveryResponse, MutationTransport};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Production transport delivering queued mutations over HTTP.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    base_url: Url,
    auth_token: Option<String>,
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(base_url: &str) -> Result<Self> {
        let base_url = validate_base_url(base_url)?;
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to build http client")?;
        Ok(Self { base_url, auth_token: None, client })
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }
}

impl MutationTransport for HttpTransport {
    async fn deliver(&mut self, request: DeliveryRequest<'_>) -> Result<DeliveryResponse> {
        let url = self
            .base_url
            .join(request.path)
            .with_context(|| format!("invalid mutation path `{}`", request.path))?;

        let method = match request.method {
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Patch => reqwest::Method::PATCH,
        };

        let mut builder = self
            .client
            .request(method, url)
            .header(IDEMPOTENCY_KEY_HEADER, request.idempotency_key.to_string())
            .header(OPERATION_KIND_HEADER, request.operation.as_str())
            .json(request.body);

        if let Some(token) = &self.auth_token {
            builder = builder.bearer_auth(token);
        }

        let response = builder.send().await.context("delivery request failed")?;
        let status = response.status().as_u16();
        let body = response.json().await.ok();

        Ok(DeliveryResponse { status, body })
    }
}

fn validate_base_url(value: &str) -> Result<Url> {
    let parsed =
        Url::parse(value).map_err(|error| anyhow!("invalid base_url `{value}`: {error}"))?;
    match parsed.scheme() {
        "https" => Ok(parsed),
        "http" if is_loopback_host(parsed.host_str()) => Ok(parsed),
        _ => Err(anyhow!("base_url must use https (http is allowed only for localhost testing)")),
    }
}

fn is_loopback_host(host: Option<&str>) -> bool {
    let Some(host) = host else {
        return false;
    };
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    host.parse::<IpAddr>().is_ok_and(|addr| addr.is_loopback())
}
