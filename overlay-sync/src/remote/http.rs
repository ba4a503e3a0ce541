use async_trait::async_trait;
use reqwest::{Client, Response};
use serde_json::Value;
use shared_types::{EntityId, ListPage, ListQuery};

use super::RemoteDataService;
use crate::error::RemoteError;

/// JSON-over-HTTP client for the remote data service
///
/// - `POST   {base}/{resource}`
/// - `PATCH  {base}/{resource}/{id}`
/// - `DELETE {base}/{resource}/{id}`
/// - `GET    {base}/{resource}?page=&per_page=&{filter}` -> `{items, total}`
#[derive(Debug, Clone)]
pub struct HttpRemote {
    client: Client,
    base_url: String,
}

impl HttpRemote {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(Client::new(), base_url)
    }

    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { client, base_url }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn collection_url(&self, resource: &str) -> String {
        format!("{}/{}", self.base_url, resource)
    }

    fn record_url(&self, resource: &str, id: &EntityId) -> String {
        format!("{}/{}/{}", self.base_url, resource, id)
    }
}

async fn describe_http_error(response: Response) -> RemoteError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    if body.trim().is_empty() {
        return RemoteError::from_status(status, format!("HTTP error: {status}"));
    }

    if let Ok(json) = serde_json::from_str::<Value>(&body) {
        if let Some(error) = json.get("error").and_then(|v| v.as_str()) {
            return RemoteError::from_status(status, error);
        }
        if let Some(message) = json.get("message").and_then(|v| v.as_str()) {
            return RemoteError::from_status(status, message);
        }
    }

    RemoteError::from_status(status, body)
}

fn transport_error(err: reqwest::Error) -> RemoteError {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RemoteError::Network(format!("Request failed: {err}"))
    } else {
        RemoteError::Unknown(format!("Request failed: {err}"))
    }
}

/// Read a JSON body, tolerating empty 2xx responses.
async fn json_body(response: Response) -> Result<Value, RemoteError> {
    let body = response.text().await.map_err(transport_error)?;
    if body.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(&body).map_err(|e| RemoteError::Unknown(format!("Failed to parse JSON: {e}")))
}

#[async_trait]
impl RemoteDataService for HttpRemote {
    async fn create(&self, resource: &str, fields: &Value, token: &str) -> Result<Value, RemoteError> {
        let response = self
            .client
            .post(self.collection_url(resource))
            .bearer_auth(token)
            .json(fields)
            .send()
            .await
            .map_err(transport_error)?;

        if !response.status().is_success() {
            return Err(describe_http_error(response).await);
        }
        json_body(response).await
    }

    async fn update(
        &self,
        resource: &str,
        id: &EntityId,
        patch: &Value,
        token: &str,
    ) -> Result<Value, RemoteError> {
        let response = self
            .client
            .patch(self.record_url(resource, id))
            .bearer_auth(token)
            .json(patch)
            .send()
            .await
            .map_err(transport_error)?;

        if !response.status().is_success() {
            return Err(describe_http_error(response).await);
        }
        json_body(response).await
    }

    async fn delete(&self, resource: &str, id: &EntityId, token: &str) -> Result<(), RemoteError> {
        let response = self
            .client
            .delete(self.record_url(resource, id))
            .bearer_auth(token)
            .send()
            .await
            .map_err(transport_error)?;

        // Already gone counts as deleted.
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        if !response.status().is_success() {
            return Err(describe_http_error(response).await);
        }
        Ok(())
    }

    async fn list(&self, resource: &str, query: &ListQuery, token: &str) -> Result<ListPage, RemoteError> {
        let mut params: Vec<(String, String)> = vec![
            ("page".to_string(), query.pagination.page.to_string()),
            ("per_page".to_string(), query.pagination.per_page.to_string()),
        ];
        params.extend(query.filter.iter().map(|(k, v)| (k.clone(), v.clone())));

        let response = self
            .client
            .get(self.collection_url(resource))
            .bearer_auth(token)
            .query(&params)
            .send()
            .await
            .map_err(transport_error)?;

        if !response.status().is_success() {
            return Err(describe_http_error(response).await);
        }

        let body = json_body(response).await?;
        parse_list_page(body)
    }
}

/// Accept `{items, total}` or a bare array.
fn parse_list_page(body: Value) -> Result<ListPage, RemoteError> {
    match body {
        Value::Array(items) => Ok(ListPage {
            total: items.len() as u64,
            items,
        }),
        Value::Object(_) => {
            let mut page: ListPage = serde_json::from_value(body)
                .map_err(|e| RemoteError::Unknown(format!("Failed to parse JSON: {e}")))?;
            page.total = page.total.max(page.items.len() as u64);
            Ok(page)
        }
        Value::Null => Ok(ListPage::default()),
        other => Err(RemoteError::Unknown(format!(
            "Unexpected list response: {other}"
        ))),
    }
}
