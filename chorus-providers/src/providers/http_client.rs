use crate::error::ProviderError;
use reqwest::{header::HeaderMap, Client, Method, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;

#[derive(Clone, Debug)]
pub enum AuthStrategy {
    Bearer { token: String },
    Header { name: String, value: String },
    None,
}

/// Thin reqwest wrapper shared by all HTTP-backed adapters. Owns the base
/// URL, default headers and auth; maps non-success responses to the
/// provider error taxonomy.
#[derive(Clone)]
pub struct HttpProviderClient {
    http: Client,
    base_url: String,
    default_headers: HeaderMap,
}

impl HttpProviderClient {
    pub fn new(
        timeout: Duration,
        base_url: Option<String>,
        default_base: &str,
        headers: &HashMap<String, String>,
        auth: AuthStrategy,
    ) -> Result<Self, ProviderError> {
        let http = Client::builder().timeout(timeout).build().map_err(|e| {
            ProviderError::Configuration {
                message: format!("failed to create HTTP client: {e}"),
            }
        })?;

        let mut default_headers = HeaderMap::new();

        match auth {
            AuthStrategy::Bearer { token } => {
                let value = format!("Bearer {token}")
                    .parse()
                    .map_err(|_| ProviderError::Configuration {
                        message: "API key contains invalid header characters".to_string(),
                    })?;
                default_headers.insert("Authorization", value);
            }
            AuthStrategy::Header { name, value } => {
                match (name.parse::<reqwest::header::HeaderName>(), value.parse()) {
                    (Ok(name), Ok(value)) => {
                        default_headers.insert(name, value);
                    }
                    _ => {
                        return Err(ProviderError::Configuration {
                            message: format!("invalid auth header: {name}"),
                        })
                    }
                }
            }
            AuthStrategy::None => {}
        }

        for (k, v) in headers {
            if let (Ok(name), Ok(value)) = (k.parse::<reqwest::header::HeaderName>(), v.parse()) {
                default_headers.insert(name, value);
            }
        }

        let base_url = base_url.unwrap_or_else(|| default_base.to_string());

        Ok(Self {
            http,
            base_url,
            default_headers,
        })
    }

    fn build_url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url.trim_end_matches('/'), path)
        } else {
            format!("{}/{}", self.base_url.trim_end_matches('/'), path)
        }
    }

    pub async fn post_json<TReq: Serialize, TResp: DeserializeOwned>(
        &self,
        path: &str,
        body: &TReq,
    ) -> Result<TResp, ProviderError> {
        let url = self.build_url(path);
        let resp = self
            .http
            .request(Method::POST, url)
            .headers(self.default_headers.clone())
            .json(body)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(map_error_response(resp).await);
        }
        Ok(resp.json::<TResp>().await?)
    }

    pub async fn get_json<TResp: DeserializeOwned>(
        &self,
        path: &str,
    ) -> Result<TResp, ProviderError> {
        let url = self.build_url(path);
        let resp = self
            .http
            .request(Method::GET, url)
            .headers(self.default_headers.clone())
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(map_error_response(resp).await);
        }
        Ok(resp.json::<TResp>().await?)
    }
}

/// Map a non-success HTTP response onto the provider error taxonomy:
/// 401/403 are auth, 429 is rate-limited (honouring Retry-After), 408/504
/// are timeouts, everything else is provider-internal.
pub async fn map_error_response(resp: Response) -> ProviderError {
    let status = resp.status();
    let retry_after = resp
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs);

    let message = match resp.text().await {
        Ok(body) => {
            // Pull a message from common JSON error shapes before falling
            // back to the raw body.
            serde_json::from_str::<serde_json::Value>(&body)
                .ok()
                .and_then(|v| v.get("error").cloned())
                .and_then(|e| {
                    e.get("message")
                        .and_then(|m| m.as_str().map(str::to_string))
                        .or_else(|| e.as_str().map(str::to_string))
                })
                .unwrap_or(body)
        }
        Err(_) => "failed to read error response".to_string(),
    };

    match status.as_u16() {
        401 | 403 => ProviderError::Auth { message },
        429 => ProviderError::RateLimited { retry_after },
        408 | 504 => ProviderError::Timeout,
        code => ProviderError::ProviderInternal { code, message },
    }
}
