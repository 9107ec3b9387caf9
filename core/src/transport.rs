//! HTTP access to the Campus API.
//!
//! Every request carries the current access token. A request rejected with
//! `401 Unauthorized` is replayed once after the session has been refreshed;
//! a second rejection is returned to the caller as-is.

use crate::auth::{AuthCoordinator, RefreshFailure};
use crate::config::ClientConfig;
use crate::store::SessionStore;
use reqwest::{Client, Method, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Network(#[from] reqwest::Error),
    #[error("server answered {status}: {message}")]
    Status { status: StatusCode, message: String },
    #[error("session expired, sign in again")]
    SessionExpired(#[source] RefreshFailure),
    #[error("unexpected response body: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("request body could not be encoded: {0}")]
    Encode(#[source] serde_json::Error),
}

impl TransportError {
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Status { status, .. } => Some(*status),
            Self::Network(err) => err.status(),
            _ => None,
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::SessionExpired(_)) || self.status() == Some(StatusCode::UNAUTHORIZED)
    }
}

/// Description of one API call, independent of any particular attempt.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
    retried: bool,
    refreshable: bool,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
            retried: false,
            refreshable: true,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn json<B: Serialize + ?Sized>(mut self, body: &B) -> Result<Self, TransportError> {
        self.body = Some(serde_json::to_value(body).map_err(TransportError::Encode)?);
        Ok(self)
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    /// Never attempt a session refresh for this request (credential exchange
    /// endpoints answer 401 for bad input, not for an expired session).
    pub fn without_refresh(mut self) -> Self {
        self.refreshable = false;
        self
    }

    pub fn is_retried(&self) -> bool {
        self.retried
    }
}

#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub body: Value,
}

impl ApiResponse {
    pub fn decode<T: DeserializeOwned>(self) -> Result<T, TransportError> {
        serde_json::from_value(unwrap_envelope(self.body)).map_err(TransportError::Decode)
    }
}

#[derive(Clone)]
pub struct SessionTransport {
    http: Client,
    base_url: String,
    auth: AuthCoordinator,
}

impl SessionTransport {
    pub fn new(config: &ClientConfig, store: SessionStore) -> Result<Self, TransportError> {
        let http = Client::builder().timeout(config.request_timeout).build()?;
        let base_url = config.api_url.trim_end_matches('/').to_string();
        let auth = AuthCoordinator::new(store, http.clone(), format!("{base_url}/auth/refresh"));
        Ok(Self {
            http,
            base_url,
            auth,
        })
    }

    pub fn auth(&self) -> &AuthCoordinator {
        &self.auth
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    pub async fn request(&self, mut request: ApiRequest) -> Result<ApiResponse, TransportError> {
        loop {
            let token = self.auth.store().access_token();
            let response = self.dispatch(&request, token.as_deref()).await?;
            if response.status() != StatusCode::UNAUTHORIZED
                || request.retried
                || !request.refreshable
            {
                return finish(response).await;
            }
            request.retried = true;
            self.on_unauthorized(token.as_deref()).await?;
            debug!(method = %request.method, path = %request.path, "replaying request with refreshed session");
        }
    }

    pub async fn send<T: DeserializeOwned>(&self, request: ApiRequest) -> Result<T, TransportError> {
        self.request(request).await?.decode()
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, TransportError> {
        self.send(ApiRequest::get(path)).await
    }

    pub async fn post<T, B>(&self, path: &str, body: &B) -> Result<T, TransportError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        self.send(ApiRequest::post(path).json(body)?).await
    }

    async fn on_unauthorized(&self, used: Option<&str>) -> Result<(), TransportError> {
        let current = self.auth.store().access_token();
        if current.is_some() && current.as_deref() != used {
            debug!("access token already rotated by a concurrent refresh");
            return Ok(());
        }
        self.auth
            .refresh()
            .await
            .map(|_| ())
            .map_err(TransportError::SessionExpired)
    }

    async fn dispatch(
        &self,
        request: &ApiRequest,
        token: Option<&str>,
    ) -> Result<Response, TransportError> {
        let mut builder = self
            .http
            .request(request.method.clone(), self.endpoint(&request.path));
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(token) = token {
            builder = builder.bearer_auth(token);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        let response = builder.send().await?;
        debug!(
            method = %request.method,
            path = %request.path,
            status = response.status().as_u16(),
            retried = request.retried,
            "api response"
        );
        Ok(response)
    }
}

async fn finish(response: Response) -> Result<ApiResponse, TransportError> {
    let status = response.status();
    let bytes = response.bytes().await?;
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
    };
    if status.is_success() {
        return Ok(ApiResponse { status, body });
    }
    Err(TransportError::Status {
        status,
        message: error_message(&body, status),
    })
}

fn error_message(body: &Value, status: StatusCode) -> String {
    let from_body = match body {
        Value::Object(map) => map
            .get("message")
            .or_else(|| map.get("error"))
            .and_then(Value::as_str)
            .map(str::to_string),
        Value::String(text) if !text.trim().is_empty() => Some(text.trim().to_string()),
        _ => None,
    };
    from_body.unwrap_or_else(|| {
        status
            .canonical_reason()
            .unwrap_or("request failed")
            .to_string()
    })
}

/// Accept both bare payloads and `{ "data": ... }` wrapped ones.
pub(crate) fn unwrap_envelope(value: Value) -> Value {
    match value {
        Value::Object(mut map) if map.contains_key("data") && !map.contains_key("id") => {
            map.remove("data").unwrap_or(Value::Null)
        }
        other => other,
    }
}
