//! `reqwest`-backed remote API client

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{ACCEPT, ACCEPT_ENCODING, CONTENT_ENCODING, CONTENT_TYPE};

use super::{
    extract_records, CredentialSource, RemoteApi, RemoteRequest, RemoteResponse, TransportError,
    TransportResult, HEALTH_PATH,
};
use crate::compression::{decompress, encode_body};
use crate::config::SyncSettings;
use crate::error::{Error, Result};
use crate::models::{HttpMethod, ResourceKind};
use crate::util::{compact_text, millis_to_rfc3339};

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// HTTP client for the portal REST API
#[derive(Clone)]
pub struct HttpRemote {
    base_url: String,
    client: reqwest::Client,
    credentials: Arc<dyn CredentialSource>,
    compression_enabled: bool,
    compression_threshold: usize,
}

impl std::fmt::Debug for HttpRemote {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("HttpRemote")
            .field("base_url", &self.base_url)
            .field("has_credential", &self.has_credential())
            .field("compression_enabled", &self.compression_enabled)
            .finish_non_exhaustive()
    }
}

impl HttpRemote {
    pub fn new(settings: &SyncSettings, credentials: Arc<dyn CredentialSource>) -> Result<Self> {
        settings.validate()?;
        let client = reqwest::Client::builder()
            .build()
            .map_err(|error| Error::InvalidInput(format!("failed to build HTTP client: {error}")))?;

        Ok(Self {
            base_url: settings.api_base().to_string(),
            client,
            credentials,
            compression_enabled: settings.compression_enabled,
            compression_threshold: settings.compression_threshold,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else {
            format!("{}/{}", self.base_url, path.trim_start_matches('/'))
        }
    }

    fn request(
        &self,
        method: HttpMethod,
        path: &str,
        timeout: Duration,
    ) -> reqwest::RequestBuilder {
        let method = match method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Patch => reqwest::Method::PATCH,
            HttpMethod::Delete => reqwest::Method::DELETE,
        };

        let mut builder = self
            .client
            .request(method, self.url(path))
            .timeout(timeout)
            .header(ACCEPT, "application/json")
            .header(ACCEPT_ENCODING, "gzip");
        if let Some(token) = self.credentials.bearer_token() {
            builder = builder.bearer_auth(token);
        }
        builder
    }

    async fn execute(
        builder: reqwest::RequestBuilder,
        timeout: Duration,
    ) -> TransportResult<RemoteResponse> {
        let response = builder
            .send()
            .await
            .map_err(|error| map_reqwest_error(&error, timeout))?;

        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|error| map_reqwest_error(&error, timeout))?;
        let bytes = decompress(&bytes)
            .map_err(|error| TransportError::InvalidResponse(error.to_string()))?;

        if !status.is_success() {
            let body = String::from_utf8_lossy(&bytes);
            return Err(TransportError::from_status(status, &body));
        }

        let body = if bytes.iter().all(u8::is_ascii_whitespace) {
            None
        } else {
            Some(serde_json::from_slice(&bytes).map_err(|error| {
                TransportError::InvalidResponse(format!(
                    "{error}: {}",
                    compact_text(&String::from_utf8_lossy(&bytes))
                ))
            })?)
        };

        Ok(RemoteResponse {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl RemoteApi for HttpRemote {
    fn has_credential(&self) -> bool {
        self.credentials.bearer_token().is_some()
    }

    async fn probe(&self) -> bool {
        match self
            .request(HttpMethod::Get, HEALTH_PATH, PROBE_TIMEOUT)
            .send()
            .await
        {
            Ok(response) => !response.status().is_server_error(),
            Err(error) => {
                tracing::debug!("Reachability probe failed: {error}");
                false
            }
        }
    }

    async fn fetch_since(
        &self,
        kind: ResourceKind,
        since: Option<i64>,
        timeout: Duration,
    ) -> TransportResult<Vec<serde_json::Value>> {
        let path = match since {
            Some(since) => format!(
                "{}?updated_since={}",
                kind.collection_path(),
                urlencoding::encode(&millis_to_rfc3339(since))
            ),
            None => kind.collection_path().to_string(),
        };
        let body = self.get(&path, timeout).await?;
        extract_records(kind, body)
    }

    async fn send(&self, request: RemoteRequest) -> TransportResult<RemoteResponse> {
        let mut builder = self.request(request.method, &request.path, request.timeout);
        for (name, value) in &request.headers {
            if name.eq_ignore_ascii_case("host") || name.eq_ignore_ascii_case("authorization") {
                continue;
            }
            builder = builder.header(name.as_str(), value.as_str());
        }

        if let Some(body) = &request.body {
            let raw = serde_json::to_vec(body)
                .map_err(|error| TransportError::InvalidResponse(error.to_string()))?;
            let encoded = encode_body(raw, self.compression_enabled, self.compression_threshold)
                .map_err(|error| TransportError::InvalidResponse(error.to_string()))?;
            builder = builder.header(CONTENT_TYPE, "application/json");
            if encoded.gzipped {
                builder = builder.header(CONTENT_ENCODING, "gzip");
            }
            builder = builder.body(encoded.bytes);
        }

        Self::execute(builder, request.timeout).await
    }

    async fn get(
        &self,
        path_and_query: &str,
        timeout: Duration,
    ) -> TransportResult<serde_json::Value> {
        let response =
            Self::execute(self.request(HttpMethod::Get, path_and_query, timeout), timeout).await?;
        Ok(response.body.unwrap_or(serde_json::Value::Null))
    }
}

fn map_reqwest_error(error: &reqwest::Error, timeout: Duration) -> TransportError {
    if error.is_timeout() {
        TransportError::Timeout(timeout)
    } else {
        TransportError::Network(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::StaticToken;

    fn remote(token: Option<&str>) -> HttpRemote {
        let settings = SyncSettings {
            api_base_url: "https://hr.example.com/".to_string(),
            ..SyncSettings::default()
        };
        HttpRemote::new(&settings, Arc::new(StaticToken::new(token.map(str::to_string)))).unwrap()
    }

    #[test]
    fn urls_join_base_and_path() {
        let remote = remote(None);
        assert_eq!(remote.base_url(), "https://hr.example.com");
        assert_eq!(remote.url("/api/leaves"), "https://hr.example.com/api/leaves");
        assert_eq!(remote.url("api/leaves/4"), "https://hr.example.com/api/leaves/4");
        assert_eq!(remote.url("https://other.example.com/x"), "https://other.example.com/x");
    }

    #[test]
    fn credential_presence_follows_source() {
        assert!(!remote(None).has_credential());
        assert!(remote(Some("abc")).has_credential());
    }

    #[test]
    fn debug_hides_token() {
        let debug = format!("{:?}", remote(Some("top-secret")));
        assert!(!debug.contains("top-secret"));
    }

    #[test]
    fn rejects_invalid_base_url() {
        let settings = SyncSettings {
            api_base_url: "ftp://hr.example.com".to_string(),
            ..SyncSettings::default()
        };
        assert!(HttpRemote::new(&settings, Arc::new(StaticToken::default())).is_err());
    }
}
