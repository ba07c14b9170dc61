/// Downstream REST calls made by service handlers
///
/// Every failure (transport error, non-2xx status, undecodable body) comes
/// back as `BusError::RestFailure`, so a handler can hand it straight to its
/// `Responder`.
use crate::errors::BusError;
use crate::logger::{self, LogTag};
use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Longest error body echoed back in a failure message
const MAX_ERROR_BODY: usize = 256;

#[derive(Debug, Clone)]
pub struct RestServiceRequest {
    pub uri: String,
    pub method: Method,
    pub headers: HashMap<String, String>,
    pub query: Vec<(String, String)>,
    pub body: Option<serde_json::Value>,
}

impl RestServiceRequest {
    pub fn get(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            method: Method::GET,
            headers: HashMap::new(),
            query: Vec::new(),
            body: None,
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_string(), value.to_string());
        self
    }

    pub fn with_query(mut self, name: &str, value: impl ToString) -> Self {
        self.query.push((name.to_string(), value.to_string()));
        self
    }

    pub fn with_json_body(mut self, method: Method, body: serde_json::Value) -> Self {
        self.method = method;
        self.body = Some(body);
        self
    }

    /// Ask for JSON in the response
    pub fn accept_json(self) -> Self {
        self.with_header("Accept", "application/json")
    }
}

/// HTTP client wrapper with timeout
#[derive(Clone)]
pub struct RestClient {
    client: Client,
    timeout: Duration,
}

impl RestClient {
    pub fn new(timeout: Duration) -> Result<Self, String> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("galaxybus/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| format!("Failed to create HTTP client: {}", e))?;
        Ok(Self { client, timeout })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Execute a request and decode the JSON body into `T`
    pub async fn execute<T: DeserializeOwned>(
        &self,
        request: &RestServiceRequest,
    ) -> Result<T, BusError> {
        let mut builder = self
            .client
            .request(request.method.clone(), &request.uri)
            .query(&request.query);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let start = Instant::now();
        let response = builder.send().await.map_err(|e| BusError::RestFailure {
            status: e.status().map(|s| s.as_u16()).unwrap_or(0),
            message: format!("{} {} failed: {}", request.method, request.uri, e),
        })?;

        let status = response.status();
        logger::debug(
            LogTag::Rest,
            &format!(
                "{} {} -> {} in {}ms",
                request.method,
                request.uri,
                status.as_u16(),
                start.elapsed().as_millis()
            ),
        );

        if !status.is_success() {
            let mut body = response.text().await.unwrap_or_default();
            if body.len() > MAX_ERROR_BODY {
                let mut cut = MAX_ERROR_BODY;
                while !body.is_char_boundary(cut) {
                    cut -= 1;
                }
                body.truncate(cut);
            }
            return Err(BusError::RestFailure {
                status: status.as_u16(),
                message: format!("{} {}: {}", request.method, request.uri, body),
            });
        }

        response.json::<T>().await.map_err(|e| BusError::RestFailure {
            status: status.as_u16(),
            message: format!("failed to parse response from {}: {}", request.uri, e),
        })
    }
}

impl std::fmt::Debug for RestClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestClient")
            .field("timeout", &self.timeout)
            .finish()
    }
}
