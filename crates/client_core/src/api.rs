use parking_lot::RwLock;
use reqwest::{Client, RequestBuilder};
use serde::{de::DeserializeOwned, Serialize};
use shared::error::ApiError;
use tracing::{debug, warn};
use url::Url;

use crate::error::ClientError;

/// Thin JSON client for the REST backend. Paths are resolved against the API
/// base URL (`<base>/api/`).
pub struct ApiClient {
    http: Client,
    base: Url,
    token: RwLock<Option<String>>,
}

impl ApiClient {
    pub fn new(http: Client, api_base_url: &str) -> Result<Self, ClientError> {
        let mut base = Url::parse(api_base_url.trim())?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Ok(Self {
            http,
            base,
            token: RwLock::new(None),
        })
    }

    pub fn http(&self) -> &Client {
        &self.http
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    pub fn set_token(&self, token: Option<String>) {
        *self.token.write() = token;
    }

    pub fn url(&self, path: &str) -> Result<Url, ClientError> {
        Ok(self.base.join(path.trim_start_matches('/'))?)
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, ClientError> {
        let request = self.http.get(self.url(path)?).query(query);
        self.send_json(request).await
    }

    pub async fn post_json<B, T>(&self, path: &str, body: &B) -> Result<T, ClientError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let request = self.http.post(self.url(path)?).json(body);
        self.send_json(request).await
    }

    pub async fn patch_json<B, T>(&self, path: &str, body: &B) -> Result<T, ClientError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let request = self.http.patch(self.url(path)?).json(body);
        self.send_json(request).await
    }

    pub async fn delete(&self, path: &str) -> Result<(), ClientError> {
        let request = self.http.delete(self.url(path)?);
        self.send(request).await.map(|_| ())
    }

    async fn send_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, ClientError> {
        let body = self.send(request).await?;
        Ok(serde_json::from_str(&body)?)
    }

    async fn send(&self, request: RequestBuilder) -> Result<String, ClientError> {
        let token = self.token.read().clone();
        let request = match token {
            Some(token) => request.bearer_auth(token),
            None => request,
        };
        let response = request.send().await?;
        let status = response.status();
        let url = response.url().path().to_string();
        let body = response.text().await?;
        if !status.is_success() {
            let err = ApiError::from_response(status.as_u16(), &body);
            warn!(path = %url, status = status.as_u16(), message = %err.message, "api: request failed");
            return Err(err.into());
        }
        debug!(path = %url, status = status.as_u16(), "api: request ok");
        Ok(body)
    }
}

#[cfg(test)]
#[path = "tests/api_tests.rs"]
mod tests;
