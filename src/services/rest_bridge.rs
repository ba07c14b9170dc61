/// REST-to-bus translation
///
/// Maps `{method, path}` to a service channel. An inbound call is turned into
/// a Request by the route's builder, sent over the bus, and the correlated
/// Response becomes the reply. Serving HTTP is left to the embedding
/// application; this module only does the translation.
use crate::bus::{EventBus, Request, Response};
use crate::errors::BusError;
use crate::logger::{self, LogTag};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Builds the bus Request for an inbound call
pub type RequestBuilder = Arc<dyn Fn(&RestCall) -> Result<Request, BusError> + Send + Sync>;

/// An inbound HTTP call, already parsed by the embedding server
#[derive(Debug, Clone, Default)]
pub struct RestCall {
    pub method: String,
    pub path: String,
    pub query: HashMap<String, String>,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl RestCall {
    pub fn new(method: &str, path: &str) -> Self {
        Self {
            method: method.to_ascii_uppercase(),
            path: path.to_string(),
            ..Self::default()
        }
    }
}

#[derive(Clone)]
pub struct RestBridgeConfig {
    pub service_channel: String,
    pub uri: String,
    pub method: String,
    pub allow_head: bool,
    pub allow_options: bool,
    pub request_builder: RequestBuilder,
}

impl RestBridgeConfig {
    /// Route that always sends the same command with no payload
    pub fn command(channel: &str, method: &str, uri: &str, command: &'static str) -> Self {
        Self {
            service_channel: channel.to_string(),
            uri: uri.to_string(),
            method: method.to_ascii_uppercase(),
            allow_head: false,
            allow_options: false,
            request_builder: Arc::new(move |_call: &RestCall| Ok(Request::new(command))),
        }
    }

    pub fn with_head(mut self) -> Self {
        self.allow_head = true;
        self
    }

    pub fn with_options(mut self) -> Self {
        self.allow_options = true;
        self
    }
}

impl std::fmt::Debug for RestBridgeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestBridgeConfig")
            .field("service_channel", &self.service_channel)
            .field("uri", &self.uri)
            .field("method", &self.method)
            .field("allow_head", &self.allow_head)
            .field("allow_options", &self.allow_options)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestReply {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RestReply {
    fn json(status: u16, value: &serde_json::Value) -> Self {
        Self {
            status,
            headers: vec![("Content-Type".to_string(), "application/json".to_string())],
            body: serde_json::to_vec(value).unwrap_or_default(),
        }
    }

    fn error(status: u16, message: &str) -> Self {
        Self::json(
            status,
            &serde_json::json!({ "error": true, "errorCode": status, "errorMessage": message }),
        )
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Build the reply for a service Response
    pub fn from_response(response: &Response) -> Self {
        if !response.error {
            return Self::json(200, &response.payload);
        }
        let status = u16::try_from(response.error_code)
            .ok()
            .filter(|code| (400..=599).contains(code))
            .unwrap_or(500);
        let mut body = serde_json::json!({
            "error": true,
            "errorCode": response.error_code,
            "errorMessage": response.error_message.clone().unwrap_or_default(),
        });
        if !response.payload.is_null() {
            body["payload"] = response.payload.clone();
        }
        Self::json(status, &body)
    }
}

pub struct RestBridge {
    bus: EventBus,
    routes: RwLock<Vec<RestBridgeConfig>>,
    timeout: Duration,
}

impl RestBridge {
    pub fn new(bus: EventBus, timeout: Duration) -> Self {
        Self {
            bus,
            routes: RwLock::new(Vec::new()),
            timeout,
        }
    }

    /// Add a route; the same method on the same path cannot be mapped twice
    pub fn register(&self, config: RestBridgeConfig) -> Result<(), BusError> {
        let mut routes = self.routes.write();
        if let Some(existing) = routes
            .iter()
            .find(|r| r.uri == config.uri && r.method == config.method)
        {
            return Err(BusError::MappingConflict {
                channel: format!("{} {}", config.method, config.uri),
                existing: existing.service_channel.clone(),
            });
        }
        logger::info(
            LogTag::Rest,
            &format!(
                "REST bridge {} {} -> '{}'",
                config.method, config.uri, config.service_channel
            ),
        );
        routes.push(config);
        Ok(())
    }

    /// Drop every route that targets `channel`
    pub fn unregister_channel(&self, channel: &str) -> usize {
        let mut routes = self.routes.write();
        let before = routes.len();
        routes.retain(|r| r.service_channel != channel);
        before - routes.len()
    }

    pub fn routes(&self) -> Vec<(String, String, String)> {
        self.routes
            .read()
            .iter()
            .map(|r| (r.method.clone(), r.uri.clone(), r.service_channel.clone()))
            .collect()
    }

    fn allowed_methods(routes: &[RestBridgeConfig]) -> String {
        let mut methods: Vec<&str> = Vec::new();
        for route in routes {
            methods.push(route.method.as_str());
            if route.allow_head && route.method == "GET" {
                methods.push("HEAD");
            }
            if route.allow_options {
                methods.push("OPTIONS");
            }
        }
        methods.sort();
        methods.dedup();
        methods.join(", ")
    }

    /// Translate one call into a bus round trip
    pub async fn handle(&self, call: RestCall) -> RestReply {
        let method = call.method.to_ascii_uppercase();
        let on_path: Vec<RestBridgeConfig> = self
            .routes
            .read()
            .iter()
            .filter(|r| r.uri == call.path)
            .cloned()
            .collect();

        if on_path.is_empty() {
            return RestReply::error(404, &format!("no route for {}", call.path));
        }
        let allow = Self::allowed_methods(&on_path);

        if method == "OPTIONS" && on_path.iter().any(|r| r.allow_options) {
            return RestReply {
                status: 204,
                headers: vec![("Allow".to_string(), allow)],
                body: Vec::new(),
            };
        }

        let head = method == "HEAD";
        let route = on_path.iter().find(|r| {
            r.method == method || (head && r.allow_head && r.method == "GET")
        });
        let Some(route) = route else {
            let mut reply = RestReply::error(405, &format!("{} not allowed", method));
            reply.headers.push(("Allow".to_string(), allow));
            return reply;
        };

        let request = match (route.request_builder)(&call) {
            Ok(request) => request,
            Err(e) => return RestReply::error(400, &e.to_string()),
        };

        logger::debug(
            LogTag::Rest,
            &format!(
                "{} {} -> '{}' ({})",
                method, call.path, route.service_channel, request.request
            ),
        );

        let mut reply = match self
            .bus
            .request(&route.service_channel, request, self.timeout)
            .await
        {
            Ok(response) => RestReply::from_response(&response),
            Err(e) => {
                let status = u16::try_from(e.status_code()).unwrap_or(500);
                RestReply::error(status, &e.to_string())
            }
        };

        if head {
            reply.body.clear();
        }
        reply
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BusConfig;
    use crate::services::dispatcher::{RequestDispatcher, Responder};
    use serde_json::json;

    fn bridge_with_echo() -> (RestBridge, RequestDispatcher) {
        let bus = EventBus::new(BusConfig::default());
        let dispatcher = RequestDispatcher::start(
            &bus,
            "joke-service",
            &["get-joke", "boom"],
            None,
            Arc::new(|req: Request, responder: Responder| {
                if req.request == "boom" {
                    responder.fail(418, "teapot", Some(json!({"why": "short and stout"})));
                } else {
                    responder.ok(&json!({"joke": "ha"}));
                }
            }),
        )
        .unwrap();

        let bridge = RestBridge::new(bus, Duration::from_secs(1));
        bridge
            .register(
                RestBridgeConfig::command("joke-service", "GET", "/rest/joke", "get-joke")
                    .with_head()
                    .with_options(),
            )
            .unwrap();
        bridge
            .register(RestBridgeConfig::command(
                "joke-service",
                "POST",
                "/rest/boom",
                "boom",
            ))
            .unwrap();
        (bridge, dispatcher)
    }

    #[tokio::test]
    async fn test_get_returns_payload() {
        let (bridge, _dispatcher) = bridge_with_echo();
        let reply = bridge.handle(RestCall::new("GET", "/rest/joke")).await;
        assert_eq!(reply.status, 200);
        assert_eq!(reply.header("content-type"), Some("application/json"));
        let body: serde_json::Value = serde_json::from_slice(&reply.body).unwrap();
        assert_eq!(body["joke"], "ha");
    }

    #[tokio::test]
    async fn test_head_options_and_errors() {
        let (bridge, _dispatcher) = bridge_with_echo();

        let head = bridge.handle(RestCall::new("HEAD", "/rest/joke")).await;
        assert_eq!(head.status, 200);
        assert!(head.body.is_empty());

        let options = bridge.handle(RestCall::new("OPTIONS", "/rest/joke")).await;
        assert_eq!(options.status, 204);
        assert_eq!(options.header("Allow"), Some("GET, HEAD, OPTIONS"));

        let wrong = bridge.handle(RestCall::new("DELETE", "/rest/joke")).await;
        assert_eq!(wrong.status, 405);

        let missing = bridge.handle(RestCall::new("GET", "/rest/nothing")).await;
        assert_eq!(missing.status, 404);

        let failed = bridge.handle(RestCall::new("POST", "/rest/boom")).await;
        assert_eq!(failed.status, 418);
        let body: serde_json::Value = serde_json::from_slice(&failed.body).unwrap();
        assert_eq!(body["errorMessage"], "teapot");
        assert_eq!(body["payload"]["why"], "short and stout");
    }

    #[tokio::test]
    async fn test_duplicate_route_conflicts() {
        let (bridge, _dispatcher) = bridge_with_echo();
        let err = bridge
            .register(RestBridgeConfig::command("other", "GET", "/rest/joke", "x"))
            .unwrap_err();
        assert!(matches!(err, BusError::MappingConflict { .. }));
        assert_eq!(bridge.unregister_channel("joke-service"), 2);
        assert!(bridge.routes().is_empty());
    }
}
