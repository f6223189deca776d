use color_eyre::{eyre::eyre, Result};
use futures::future::BoxFuture;
use futures::FutureExt;
use reqwest::{Method, StatusCode};
use serde_json::Value;
use tracing::debug;
use url::Url;

use super::api_types::{error_message, normalize};
use super::{Fetcher, Operation, Payload};
use crate::cache::QueryKey;
use crate::config::{ApiConfig, Config};
use crate::entity::{EntityId, ResourceType};
use crate::error::HttpError;

/// REST client for the admin API.
///
/// Endpoints are resource-scoped (`/{resource}`, `/{resource}/{id}`), bodies
/// are JSON, and every request carries the bearer token.
#[derive(Clone)]
pub struct HttpFetcher {
  client: reqwest::Client,
  base: Url,
  token: String,
}

impl HttpFetcher {
  pub fn new(config: &ApiConfig) -> Result<Self> {
    let token = Config::get_api_token(&config.token_env)?;
    let base = Url::parse(&config.url).map_err(|e| eyre!("Invalid API url {}: {}", config.url, e))?;
    if base.cannot_be_a_base() {
      return Err(eyre!("API url {} cannot be used as a base", config.url));
    }

    let client = reqwest::Client::builder()
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client, base, token })
  }

  fn endpoint(&self, resource: ResourceType, tail: &[&str]) -> Url {
    let mut url = self.base.clone();
    if let Ok(mut segments) = url.path_segments_mut() {
      segments.pop_if_empty().push(resource.path());
      for part in tail {
        segments.push(part);
      }
    }
    url
  }

  fn list_url(&self, key: &QueryKey) -> Url {
    let mut url = self.endpoint(key.resource, &[]);
    {
      let mut query = url.query_pairs_mut();
      query
        .append_pair("page", &key.page.to_string())
        .append_pair("pageSize", &key.page_size.to_string());
      if let Some(deleted) = key.view.deleted_param() {
        query.append_pair("isDeleted", if deleted { "true" } else { "false" });
      }
      if let Some(term) = &key.search {
        query.append_pair("search", term);
      }
      if !key.sort.is_empty() {
        let sort: Vec<String> = key.sort.iter().map(ToString::to_string).collect();
        query.append_pair("sort", &sort.join(","));
      }
      for (field, value) in &key.filters {
        query.append_pair(field, value);
      }
    }
    url
  }

  fn request(&self, resource: ResourceType, operation: &Operation) -> (Method, Url, Option<Value>) {
    let id = |id: &EntityId| id.to_string();
    match operation {
      Operation::List(key) => (Method::GET, self.list_url(key), None),
      Operation::Get(i) => (Method::GET, self.endpoint(resource, &[id(i).as_str()]), None),
      Operation::Create(payload) => (
        Method::POST,
        self.endpoint(resource, &[]),
        Some(Value::Object(payload.clone())),
      ),
      Operation::Update { id: i, delta } => {
        let body: serde_json::Map<String, Value> = delta
          .iter()
          .map(|(field, value)| (field.to_string(), value.cloned().unwrap_or(Value::Null)))
          .collect();
        (Method::PATCH, self.endpoint(resource, &[id(i).as_str()]), Some(Value::Object(body)))
      }
      Operation::SoftDelete(i) => (Method::DELETE, self.endpoint(resource, &[id(i).as_str()]), None),
      Operation::Restore(i) => (Method::POST, self.endpoint(resource, &[id(i).as_str(), "restore"]), None),
      Operation::HardDelete(i) => (
        Method::DELETE,
        self.endpoint(resource, &[id(i).as_str(), "permanent"]),
        None,
      ),
    }
  }

  async fn send(&self, resource: ResourceType, operation: Operation) -> Result<Payload, HttpError> {
    let (method, url, body) = self.request(resource, &operation);
    debug!(%method, %url, op = operation.name(), "sending request");

    let mut request = self.client.request(method, url).bearer_auth(&self.token);
    if let Some(body) = body {
      request = request.json(&body);
    }

    let response = request
      .send()
      .await
      .map_err(|e| HttpError::transport(e.to_string()))?;
    let status = response.status();
    let text = response
      .text()
      .await
      .map_err(|e| HttpError::transport(e.to_string()))?;

    if !status.is_success() {
      let message = error_message(&text).unwrap_or_else(|| {
        status
          .canonical_reason()
          .unwrap_or("request failed")
          .to_string()
      });
      return Err(HttpError::status(status.as_u16(), message));
    }

    decode_body(resource, status, &text)
  }
}

/// Parse a success response.
fn decode_body(resource: ResourceType, status: StatusCode, text: &str) -> Result<Payload, HttpError> {
  if status == StatusCode::NO_CONTENT || text.trim().is_empty() {
    return Ok(Payload::Empty);
  }

  let body: Value = serde_json::from_str(text)
    .map_err(|e| HttpError::undecodable(status.as_u16(), format!("Invalid JSON response: {}", e)))?;
  normalize(resource, body)
    .map_err(|e| HttpError::undecodable(status.as_u16(), format!("Failed to parse response: {}", e)))
}

impl Fetcher for HttpFetcher {
  fn call(&self, resource: ResourceType, operation: Operation) -> BoxFuture<'_, Result<Payload, HttpError>> {
    self.send(resource, operation).boxed()
  }
}
