use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Response, StatusCode};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use super::{rejected, AuthSession, RemoteStore, Selection, SessionUser};
use crate::cache::ID_COLUMN;

/// Backend REST client following PostgREST conventions.
#[derive(Clone)]
pub struct RestClient {
  client: reqwest::Client,
  base_url: String,
  anon_key: String,
  access_token: Option<String>,
  schema: String,
}

impl RestClient {
  pub fn new(base_url: &str, anon_key: &str) -> Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(Duration::from_secs(30))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      base_url: base_url.trim_end_matches('/').to_string(),
      anon_key: anon_key.to_string(),
      access_token: None,
      schema: "public".to_string(),
    })
  }

  /// Act as a signed-in user instead of the anonymous role.
  pub fn with_access_token(mut self, token: Option<String>) -> Self {
    self.access_token = token;
    self
  }

  pub fn with_schema(mut self, schema: &str) -> Self {
    self.schema = schema.to_string();
    self
  }

  pub fn base_url(&self) -> &str {
    &self.base_url
  }

  fn table_url(&self, table: &str) -> String {
    format!("{}/rest/v1/{}", self.base_url, table)
  }

  fn headers(&self) -> Result<HeaderMap> {
    let bearer = self.access_token.as_deref().unwrap_or(&self.anon_key);
    let mut headers = HeaderMap::new();
    headers.insert("apikey", header_value(&self.anon_key)?);
    headers.insert(AUTHORIZATION, header_value(&format!("Bearer {}", bearer))?);
    headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
    headers.insert("accept-profile", header_value(&self.schema)?);
    headers.insert("content-profile", header_value(&self.schema)?);
    Ok(headers)
  }

  fn write_headers(&self) -> Result<HeaderMap> {
    let mut headers = self.headers()?;
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert("prefer", HeaderValue::from_static("return=representation"));
    Ok(headers)
  }
}

fn header_value(value: &str) -> Result<HeaderValue> {
  HeaderValue::from_str(value).map_err(|e| eyre!("Invalid header value: {}", e))
}

/// Query string pairs for a selection.
pub(crate) fn query_pairs(selection: &Selection) -> Vec<(String, String)> {
  let mut pairs = vec![("select".to_string(), "*".to_string())];
  for (column, value) in &selection.filters {
    pairs.push((column.clone(), format!("eq.{}", value)));
  }
  if let Some(order) = &selection.order {
    let direction = if order.ascending { "asc" } else { "desc" };
    pairs.push(("order".to_string(), format!("{}.{}", order.column, direction)));
  }
  if let Some(limit) = selection.limit {
    pairs.push(("limit".to_string(), limit.to_string()));
  }
  pairs
}

fn id_filter(id: &str) -> [(String, String); 1] {
  [(ID_COLUMN.to_string(), format!("eq.{}", id))]
}

/// Client errors the server will repeat no matter how often we retry. Auth,
/// timeouts and rate limits can clear up on their own.
fn is_permanent(status: StatusCode) -> bool {
  status.is_client_error()
    && !matches!(
      status,
      StatusCode::UNAUTHORIZED | StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS
    )
}

async fn check(response: Response, action: &str) -> Result<Response> {
  let status = response.status();
  if status.is_success() {
    return Ok(response);
  }
  let body = response.text().await.unwrap_or_default();
  let reason = format!("Failed to {}: {} {}", action, status, body.trim());
  if is_permanent(status) {
    Err(rejected(Some(status.as_u16()), reason))
  } else {
    Err(eyre!(reason))
  }
}

async fn rows(response: Response, action: &str) -> Result<Vec<Value>> {
  response
    .json::<Vec<Value>>()
    .await
    .map_err(|e| eyre!("Failed to parse response to {}: {}", action, e))
}

#[async_trait]
impl RemoteStore for RestClient {
  async fn select(&self, selection: &Selection) -> Result<Vec<Value>> {
    let action = format!("select from {}", selection.table);
    let response = self
      .client
      .get(self.table_url(&selection.table))
      .headers(self.headers()?)
      .query(&query_pairs(selection))
      .send()
      .await
      .map_err(|e| eyre!("Failed to {}: {}", action, e))?;

    let rows = rows(check(response, &action).await?, &action).await?;
    debug!(table = %selection.table, count = rows.len(), "Selected rows");
    Ok(rows)
  }

  async fn insert(&self, table: &str, row: Value) -> Result<Value> {
    let action = format!("insert into {}", table);
    let response = self
      .client
      .post(self.table_url(table))
      .headers(self.write_headers()?)
      .json(&row)
      .send()
      .await
      .map_err(|e| eyre!("Failed to {}: {}", action, e))?;

    rows(check(response, &action).await?, &action)
      .await?
      .into_iter()
      .next()
      .ok_or_else(|| eyre!("Failed to {}: no row returned", action))
  }

  async fn update(&self, table: &str, id: &str, patch: Value) -> Result<Value> {
    let action = format!("update {} {}", table, id);
    let response = self
      .client
      .patch(self.table_url(table))
      .headers(self.write_headers()?)
      .query(&id_filter(id))
      .json(&patch)
      .send()
      .await
      .map_err(|e| eyre!("Failed to {}: {}", action, e))?;

    // An empty representation means no row matched (or row-level security hid it).
    rows(check(response, &action).await?, &action)
      .await?
      .into_iter()
      .next()
      .ok_or_else(|| rejected(None, format!("Failed to {}: no such row", action)))
  }

  async fn delete(&self, table: &str, id: &str) -> Result<()> {
    let action = format!("delete {} {}", table, id);
    let response = self
      .client
      .delete(self.table_url(table))
      .headers(self.headers()?)
      .query(&id_filter(id))
      .send()
      .await
      .map_err(|e| eyre!("Failed to {}: {}", action, e))?;

    check(response, &action).await?;
    Ok(())
  }
}

#[async_trait]
impl AuthSession for RestClient {
  async fn get_user(&self) -> Result<Option<SessionUser>> {
    if self.access_token.is_none() {
      return Ok(None);
    }

    let response = self
      .client
      .get(format!("{}/auth/v1/user", self.base_url))
      .headers(self.headers()?)
      .send()
      .await
      .map_err(|e| eyre!("Failed to get session user: {}", e))?;

    let status = response.status();
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
      return Ok(None);
    }

    let user = check(response, "get session user")
      .await?
      .json::<SessionUser>()
      .await
      .map_err(|e| eyre!("Failed to parse session user: {}", e))?;
    Ok(Some(user))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn pairs(selection: &Selection) -> Vec<String> {
    query_pairs(selection)
      .into_iter()
      .map(|(k, v)| format!("{}={}", k, v))
      .collect()
  }

  #[test]
  fn test_query_pairs() {
    let selection = Selection::from("mcard_statuses")
      .eq("mcard_id", "m1")
      .order_by("created_at", false)
      .limit(20);

    assert_eq!(
      pairs(&selection),
      vec![
        "select=*",
        "mcard_id=eq.m1",
        "order=created_at.desc",
        "limit=20"
      ]
    );
    assert_eq!(pairs(&Selection::from("mcards")), vec!["select=*"]);
  }

  #[test]
  fn test_headers_prefer_access_token() {
    let client = RestClient::new("https://db.example.com/", "anon").unwrap();
    assert_eq!(client.base_url(), "https://db.example.com");
    assert_eq!(client.table_url("mcards"), "https://db.example.com/rest/v1/mcards");

    let headers = client.headers().unwrap();
    assert_eq!(headers["apikey"], "anon");
    assert_eq!(headers[AUTHORIZATION], "Bearer anon");

    let signed_in = client
      .with_access_token(Some("jwt".into()))
      .with_schema("finderid");
    let headers = signed_in.write_headers().unwrap();
    assert_eq!(headers[AUTHORIZATION], "Bearer jwt");
    assert_eq!(headers["accept-profile"], "finderid");
    assert_eq!(headers["prefer"], "return=representation");
  }

  #[test]
  fn test_permanent_statuses() {
    assert!(is_permanent(StatusCode::CONFLICT));
    assert!(is_permanent(StatusCode::BAD_REQUEST));
    assert!(is_permanent(StatusCode::FORBIDDEN));

    assert!(!is_permanent(StatusCode::UNAUTHORIZED));
    assert!(!is_permanent(StatusCode::REQUEST_TIMEOUT));
    assert!(!is_permanent(StatusCode::TOO_MANY_REQUESTS));
    assert!(!is_permanent(StatusCode::SERVICE_UNAVAILABLE));
  }

  #[tokio::test]
  async fn test_no_token_means_no_user() {
    let client = RestClient::new("http://127.0.0.1:9", "anon").unwrap();
    assert_eq!(client.get_user().await.unwrap(), None);
  }
}
