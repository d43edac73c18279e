use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use serde_json::{json, Value};
use std::time::Duration;
use url::Url;

use crate::config::ApiConfig;
use crate::error::RequestError;
use crate::key::Params;

/// The upstream API as the request layer sees it: `endpoint + params -> JSON`.
#[async_trait]
pub trait Backend: Send + Sync {
  /// Fetch a single resource.
  async fn call(&self, endpoint: &str, params: &Params) -> Result<Value, RequestError>;

  /// Fetch several parameter sets of one endpoint in a single round trip.
  /// Results are positionally aligned with `requests`.
  async fn call_batch(&self, endpoint: &str, requests: &[Params]) -> Result<Vec<Value>, RequestError>;

  /// Send a mutation. Never cached or retried.
  async fn send(&self, endpoint: &str, body: &Value) -> Result<Value, RequestError>;
}

/// HTTP implementation of [`Backend`] on top of reqwest.
#[derive(Clone)]
pub struct HttpBackend {
  client: reqwest::Client,
  base_url: String,
  token: Option<String>,
}

impl HttpBackend {
  pub fn new(api: &ApiConfig, token: Option<String>) -> Result<Self> {
    Url::parse(&api.url).map_err(|e| eyre!("Invalid API url {}: {}", api.url, e))?;

    let client = reqwest::Client::builder()
      .timeout(Duration::from_millis(api.timeout_millis))
      .gzip(true)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      base_url: api.url.trim_end_matches('/').to_string(),
      token,
    })
  }

  fn url_for(&self, endpoint: &str) -> Result<Url, RequestError> {
    let raw = format!("{}/{}", self.base_url, endpoint.trim_start_matches('/'));
    Url::parse(&raw).map_err(|e| RequestError::network(endpoint, e))
  }

  fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
    match &self.token {
      Some(token) => request.bearer_auth(token),
      None => request,
    }
  }

  async fn execute(&self, endpoint: &str, request: reqwest::RequestBuilder) -> Result<Value, RequestError> {
    let response = self
      .authorize(request)
      .send()
      .await
      .map_err(|e| RequestError::network(endpoint, e))?;

    let status = response.status();
    if !status.is_success() {
      return Err(RequestError::Status {
        endpoint: endpoint.to_string(),
        status: status.as_u16(),
      });
    }

    response
      .json::<Value>()
      .await
      .map_err(|e| RequestError::Decode {
        endpoint: endpoint.to_string(),
        message: e.to_string(),
      })
  }
}

/// Accept either a bare JSON array or `{"results": [...]}` from a batch call.
fn unpack_batch(endpoint: &str, body: Value) -> Result<Vec<Value>, RequestError> {
  match body {
    Value::Array(items) => Ok(items),
    Value::Object(mut map) => match map.remove("results") {
      Some(Value::Array(items)) => Ok(items),
      _ => Err(RequestError::batch(endpoint, "response has no results array")),
    },
    other => Err(RequestError::batch(
      endpoint,
      format!("unexpected batch response: {}", other),
    )),
  }
}

#[async_trait]
impl Backend for HttpBackend {
  async fn call(&self, endpoint: &str, params: &Params) -> Result<Value, RequestError> {
    let mut url = self.url_for(endpoint)?;
    if !params.is_empty() {
      url
        .query_pairs_mut()
        .extend_pairs(params.iter().map(|(k, v)| (k, v.as_query_value())));
    }
    self.execute(endpoint, self.client.get(url)).await
  }

  async fn call_batch(&self, endpoint: &str, requests: &[Params]) -> Result<Vec<Value>, RequestError> {
    let url = self.url_for(endpoint)?;
    let body = json!({
      "batch": true,
      "requests": requests,
    });

    let response = self
      .execute(endpoint, self.client.post(url).json(&body))
      .await
      .map_err(|e| RequestError::batch(endpoint, e))?;

    unpack_batch(endpoint, response)
  }

  async fn send(&self, endpoint: &str, body: &Value) -> Result<Value, RequestError> {
    let url = self.url_for(endpoint)?;
    self.execute(endpoint, self.client.post(url).json(body)).await
  }
}
