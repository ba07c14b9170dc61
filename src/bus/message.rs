/// Message, Request and Response types
///
/// A `Message` is what subscribers see: an opaque payload plus the channel
/// context it was published on. `Request` and `Response` are the typed JSON
/// bodies exchanged on service channels:
///
/// ```text
/// request  {"id":"…","request":"get-joke","payload":null}
/// response {"id":"…","error":false,"errorCode":0,"payload":{…}}
/// ```
use crate::errors::BusError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

// ============================================================================
// PAYLOAD
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    Json,
    Text,
    Binary,
}

impl ContentType {
    pub fn mime(&self) -> &'static str {
        match self {
            ContentType::Json => "application/json",
            ContentType::Text => "text/plain",
            ContentType::Binary => "application/octet-stream",
        }
    }

    /// Infer from a transport content-type header
    pub fn from_mime(mime: &str) -> Self {
        let mime = mime.split(';').next().unwrap_or("").trim();
        if mime.ends_with("json") {
            ContentType::Json
        } else if mime.starts_with("text/") {
            ContentType::Text
        } else {
            ContentType::Binary
        }
    }
}

/// Opaque bytes plus a declared content type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    bytes: Vec<u8>,
    content_type: ContentType,
}

impl Payload {
    /// Serialize a value as a JSON payload
    pub fn json<T: Serialize + ?Sized>(value: &T) -> Result<Self, BusError> {
        Ok(Self {
            bytes: serde_json::to_vec(value)?,
            content_type: ContentType::Json,
        })
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self {
            bytes: text.into().into_bytes(),
            content_type: ContentType::Text,
        }
    }

    pub fn binary(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            content_type: ContentType::Binary,
        }
    }

    /// Wrap bytes received from a broker, inferring JSON when they parse as JSON
    pub fn inferred(bytes: Vec<u8>) -> Self {
        let content_type = if serde_json::from_slice::<serde::de::IgnoredAny>(&bytes).is_ok() {
            ContentType::Json
        } else if std::str::from_utf8(&bytes).is_ok() {
            ContentType::Text
        } else {
            ContentType::Binary
        };
        Self { bytes, content_type }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn content_type(&self) -> ContentType {
        self.content_type
    }

    pub fn as_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.bytes).ok()
    }

    /// Fallible typed decode
    ///
    /// Text payloads decode into `String` targets even when they are not
    /// quoted JSON, so plain-text brokers interoperate.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, BusError> {
        match serde_json::from_slice::<T>(&self.bytes) {
            Ok(value) => Ok(value),
            Err(e) if self.content_type == ContentType::Text => {
                let text = self.as_text().unwrap_or_default();
                serde_json::from_value(serde_json::Value::String(text.to_string()))
                    .map_err(|_| BusError::SerializationError(e.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

// ============================================================================
// MESSAGE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Request,
    Response,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Request => write!(f, "request"),
            Direction::Response => write!(f, "response"),
        }
    }
}

/// A payload in channel context
#[derive(Debug, Clone)]
pub struct Message {
    pub id: Uuid,
    pub channel: String,
    pub direction: Direction,
    pub payload: Payload,
    /// Broker destination the message arrived from, if bridged
    pub destination: Option<String>,
}

impl Message {
    pub fn new(channel: impl Into<String>, direction: Direction, payload: Payload) -> Self {
        Self {
            id: Uuid::new_v4(),
            channel: channel.into(),
            direction,
            payload,
            destination: None,
        }
    }

    pub fn response(channel: impl Into<String>, payload: Payload) -> Self {
        Self::new(channel, Direction::Response, payload)
    }

    pub fn request(channel: impl Into<String>, payload: Payload) -> Self {
        Self::new(channel, Direction::Request, payload)
    }

    /// Build a message from an inbound broker frame
    ///
    /// A JSON object with a string `request` key is a Request; everything
    /// else is treated as a Response.
    pub fn from_frame(channel: &str, destination: &str, body: Vec<u8>) -> Self {
        let direction = match serde_json::from_slice::<serde_json::Value>(&body) {
            Ok(serde_json::Value::Object(map))
                if matches!(map.get("request"), Some(serde_json::Value::String(_))) =>
            {
                Direction::Request
            }
            _ => Direction::Response,
        };
        let mut message = Self::new(channel, direction, Payload::inferred(body));
        message.destination = Some(destination.to_string());
        message
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, BusError> {
        self.payload.decode()
    }
}

// ============================================================================
// REQUEST / RESPONSE
// ============================================================================

/// A correlatable command sent to a service channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    /// Correlation identity; generated when absent on the wire
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    /// Command name
    pub request: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
}

impl Request {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            request: command.into(),
            payload: serde_json::Value::Null,
            headers: HashMap::new(),
        }
    }

    pub fn with_payload<T: Serialize>(mut self, payload: &T) -> Result<Self, BusError> {
        self.payload = serde_json::to_value(payload)?;
        Ok(self)
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn decode_payload<T: DeserializeOwned>(&self) -> Result<T, BusError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// The single terminal outcome of a Request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub id: Uuid,
    #[serde(default)]
    pub error: bool,
    #[serde(default)]
    pub error_code: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Response {
    pub fn ok<T: Serialize>(id: Uuid, payload: &T) -> Result<Self, BusError> {
        Ok(Self {
            id,
            error: false,
            error_code: 0,
            error_message: None,
            payload: serde_json::to_value(payload)?,
        })
    }

    pub fn failure(
        id: Uuid,
        code: i32,
        message: impl Into<String>,
        payload: Option<serde_json::Value>,
    ) -> Self {
        Self {
            id,
            error: true,
            error_code: code,
            error_message: Some(message.into()),
            payload: payload.unwrap_or(serde_json::Value::Null),
        }
    }

    pub fn from_error(id: Uuid, err: &BusError) -> Self {
        Self::failure(id, err.status_code(), err.to_string(), None)
    }

    pub fn decode_payload<T: DeserializeOwned>(&self) -> Result<T, BusError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Joke {
        id: String,
        joke: String,
        status: u16,
    }

    #[test]
    fn test_request_without_id_gets_one() {
        let req: Request = serde_json::from_str(r#"{"request":"get-joke"}"#).unwrap();
        assert_eq!(req.request, "get-joke");
        assert!(!req.id.is_nil());
        assert!(req.payload.is_null());
    }

    #[test]
    fn test_response_wire_shape() {
        let id = Uuid::new_v4();
        let resp = Response::failure(id, 404, "unknown command 'x'", None);
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["errorCode"], 404);
        assert_eq!(json["error"], true);
        assert_eq!(json["id"], id.to_string());
    }

    #[test]
    fn test_frame_direction_inference() {
        let req = Message::from_frame("jokes", "/queue/j", br#"{"request":"get-joke"}"#.to_vec());
        assert_eq!(req.direction, Direction::Request);
        assert_eq!(req.destination.as_deref(), Some("/queue/j"));

        let resp = Message::from_frame("jokes", "/queue/j", br#"{"id":"1","joke":"ha","status":200}"#.to_vec());
        assert_eq!(resp.direction, Direction::Response);
        let joke: Joke = resp.decode().unwrap();
        assert_eq!(joke.status, 200);

        let word = Message::from_frame("words", "/topic/w", b"ember".to_vec());
        assert_eq!(word.payload.content_type(), ContentType::Text);
        assert_eq!(word.decode::<String>().unwrap(), "ember");
    }

    #[test]
    fn test_decode_mismatch_is_serialization_error() {
        let payload = Payload::json(&vec![1, 2, 3]).unwrap();
        let err = payload.decode::<Joke>().unwrap_err();
        assert!(matches!(err, BusError::SerializationError(_)));
    }

    #[test]
    fn test_content_type_from_mime() {
        assert_eq!(ContentType::from_mime("application/json;charset=utf-8"), ContentType::Json);
        assert_eq!(ContentType::from_mime("text/plain"), ContentType::Text);
        assert_eq!(ContentType::from_mime(""), ContentType::Binary);
    }
}
