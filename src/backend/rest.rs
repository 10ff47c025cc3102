//! Hosted backend speaking the PostgREST dialect.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_RANGE};
use reqwest::{Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::marker::PhantomData;
use tracing::debug;
use url::Url;

use crate::query::Filters;
use crate::resource::{Entity, Operations, ResourceService, ResourceSummary};

const SINGLE_OBJECT: &str = "application/vnd.pgrst.object+json";

/// HTTP client for the backend's REST endpoint.
#[derive(Clone)]
pub struct RestClient {
  http: reqwest::Client,
  base_url: Url,
}

impl RestClient {
  /// `base_url` is the project URL; tables live under `rest/v1/`.
  pub fn new(base_url: &str, api_key: &str) -> Result<Self> {
    let mut base_url =
      Url::parse(base_url).map_err(|e| eyre!("Invalid backend URL {}: {}", base_url, e))?;
    if !base_url.path().ends_with('/') {
      let path = format!("{}/", base_url.path());
      base_url.set_path(&path);
    }

    let mut headers = HeaderMap::new();
    let key = HeaderValue::from_str(api_key).map_err(|e| eyre!("Invalid API key: {}", e))?;
    let bearer = HeaderValue::from_str(&format!("Bearer {}", api_key))
      .map_err(|e| eyre!("Invalid API key: {}", e))?;
    headers.insert("apikey", key);
    headers.insert(AUTHORIZATION, bearer);

    let http = reqwest::Client::builder()
      .default_headers(headers)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { http, base_url })
  }

  /// URL of `resource` with `select` and equality filters applied.
  pub fn table_url(&self, resource: &str, select: &str, filters: &[(String, String)]) -> Result<Url> {
    let mut url = self
      .base_url
      .join(&format!("rest/v1/{}", resource))
      .map_err(|e| eyre!("Invalid resource name {}: {}", resource, e))?;
    {
      let mut pairs = url.query_pairs_mut();
      pairs.append_pair("select", select);
      for (field, value) in filters {
        pairs.append_pair(field, &format!("eq.{}", value));
      }
    }
    Ok(url)
  }

  fn request(&self, method: Method, url: Url) -> RequestBuilder {
    self.http.request(method, url)
  }
}

/// Filter value as it appears after `eq.`.
fn filter_value(value: &Value) -> String {
  match value {
    Value::String(s) => s.clone(),
    other => other.to_string(),
  }
}

fn filter_pairs(filters: Option<&Filters>) -> Vec<(String, String)> {
  filters
    .map(|f| {
      f.iter()
        .map(|(field, value)| (field.clone(), filter_value(value)))
        .collect()
    })
    .unwrap_or_default()
}

fn id_filter(id: &str) -> Vec<(String, String)> {
  vec![("id".to_string(), id.to_string())]
}

/// Total row count from a `Content-Range` header such as `0-24/310` or `*/0`.
pub fn parse_content_range_total(header: &str) -> Option<u64> {
  header.rsplit_once('/')?.1.trim().parse().ok()
}

async fn check(response: Response, what: &str) -> Result<Response> {
  let status = response.status();
  if status.is_success() {
    return Ok(response);
  }
  let body = response.text().await.unwrap_or_default();
  Err(eyre!("Failed to {}: {} {}", what, status, body.trim()))
}

async fn read_json<T: DeserializeOwned>(response: Response, what: &str) -> Result<T> {
  check(response, what)
    .await?
    .json()
    .await
    .map_err(|e| eyre!("Failed to parse response to {}: {}", what, e))
}

/// One table of the hosted backend.
pub struct RestService<T> {
  client: RestClient,
  resource: String,
  _entity: PhantomData<fn() -> T>,
}

impl<T> RestService<T> {
  pub fn new(client: RestClient, resource: impl Into<String>) -> Self {
    Self {
      client,
      resource: resource.into(),
      _entity: PhantomData,
    }
  }
}

#[async_trait]
impl<T: Entity> ResourceService for RestService<T> {
  type Entity = T;
  type Create = Value;
  type Update = Value;
  type Summary = ResourceSummary;

  fn operations(&self) -> Operations {
    Operations::CRUD.with_summary()
  }

  async fn get_list(&self, filters: Option<&Filters>) -> Result<Vec<T>> {
    let url = self
      .client
      .table_url(&self.resource, "*", &filter_pairs(filters))?;
    debug!(url = %url, "GET list");
    let response = self
      .client
      .request(Method::GET, url)
      .send()
      .await
      .map_err(|e| eyre!("Failed to list {}: {}", self.resource, e))?;
    read_json(response, &format!("list {}", self.resource)).await
  }

  async fn get_by_id(&self, id: &str) -> Result<T> {
    let url = self
      .client
      .table_url(&self.resource, "*", &id_filter(id))?;
    let response = self
      .client
      .request(Method::GET, url)
      .header(ACCEPT, SINGLE_OBJECT)
      .send()
      .await
      .map_err(|e| eyre!("Failed to get {} {}: {}", self.resource, id, e))?;
    read_json(response, &format!("get {} {}", self.resource, id)).await
  }

  async fn create(&self, data: Value) -> Result<T> {
    let url = self.client.table_url(&self.resource, "*", &[])?;
    let response = self
      .client
      .request(Method::POST, url)
      .header(ACCEPT, SINGLE_OBJECT)
      .header("Prefer", "return=representation")
      .json(&data)
      .send()
      .await
      .map_err(|e| eyre!("Failed to create {}: {}", self.resource, e))?;
    read_json(response, &format!("create {}", self.resource)).await
  }

  async fn update(&self, id: &str, data: Value) -> Result<T> {
    let url = self
      .client
      .table_url(&self.resource, "*", &id_filter(id))?;
    let response = self
      .client
      .request(Method::PATCH, url)
      .header(ACCEPT, SINGLE_OBJECT)
      .header("Prefer", "return=representation")
      .json(&data)
      .send()
      .await
      .map_err(|e| eyre!("Failed to update {} {}: {}", self.resource, id, e))?;
    read_json(response, &format!("update {} {}", self.resource, id)).await
  }

  async fn delete(&self, id: &str) -> Result<()> {
    let url = self
      .client
      .table_url(&self.resource, "*", &id_filter(id))?;
    let response = self
      .client
      .request(Method::DELETE, url)
      .send()
      .await
      .map_err(|e| eyre!("Failed to delete {} {}: {}", self.resource, id, e))?;
    check(response, &format!("delete {} {}", self.resource, id)).await?;
    Ok(())
  }

  async fn get_summary(&self) -> Result<ResourceSummary> {
    let url = self.client.table_url(&self.resource, "id", &[])?;
    let response = self
      .client
      .request(Method::HEAD, url)
      .header("Prefer", "count=exact")
      .send()
      .await
      .map_err(|e| eyre!("Failed to count {}: {}", self.resource, e))?;
    let response = check(response, &format!("count {}", self.resource)).await?;

    let count = response
      .headers()
      .get(CONTENT_RANGE)
      .and_then(|v| v.to_str().ok())
      .and_then(parse_content_range_total)
      .ok_or_else(|| eyre!("Backend did not report a row count for {}", self.resource))?;

    Ok(ResourceSummary { count })
  }
}
