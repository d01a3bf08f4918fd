//! Wire shapes exchanged over the transport.
//!
//! A frame carries one JSON envelope `{ "requests": [...], "responses": [...] }`.
//! Request objects are kept as raw [`Value`]s inside the envelope so that a
//! single malformed entry can be answered individually instead of rejecting
//! the whole batch.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::RequestError;
use crate::stream::StreamState;

/// Top-level message envelope.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub responses: Option<Vec<Value>>,
}

impl Envelope {
    /// Envelope carrying a batch of responses.
    pub fn responses(responses: &[Response]) -> Result<Self, serde_json::Error> {
        let values = responses
            .iter()
            .map(serde_json::to_value)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            requests: None,
            responses: Some(values),
        })
    }

    /// Envelope carrying a batch of requests.
    pub fn requests(requests: &[Request]) -> Result<Self, serde_json::Error> {
        let values = requests
            .iter()
            .map(serde_json::to_value)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            requests: Some(values),
            responses: None,
        })
    }

    /// An empty envelope is the keep-alive frame.
    pub fn is_empty(&self) -> bool {
        self.requests.as_ref().map_or(true, Vec::is_empty)
            && self.responses.as_ref().map_or(true, Vec::is_empty)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Decode every complete envelope contained in a text frame.
///
/// Frames normally hold exactly one envelope, but back-to-back objects are
/// accepted as well.
pub fn decode_frame(text: &str) -> Result<Vec<Envelope>, serde_json::Error> {
    serde_json::Deserializer::from_str(text)
        .into_iter::<Envelope>()
        .collect()
}

/// A single request inside an envelope.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub rid: i64,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Method-specific payload (`value`, `params`, `paths`, `sids`, ...).
    #[serde(flatten)]
    pub params: Map<String, Value>,
}

impl Request {
    pub fn new(rid: i64, method: impl Into<String>) -> Self {
        Self {
            rid,
            method: method.into(),
            path: None,
            params: Map::new(),
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: Value) -> Self {
        let _ = self.params.insert(key.into(), value);
        self
    }

    /// Parse a raw request object.
    pub fn from_value(value: Value) -> Result<Self, RequestError> {
        Ok(serde_json::from_value(value)?)
    }

    pub fn param(&self, key: &str) -> Option<&Value> {
        self.params.get(key)
    }

    /// Extract a required payload field.
    pub fn require(&self, key: &str) -> Result<&Value, RequestError> {
        self.params
            .get(key)
            .ok_or_else(|| RequestError::protocol(format!("Missing required field: {key}")))
    }
}

/// Best-effort rid extraction from a request object that failed to parse.
pub fn raw_rid(value: &Value) -> i64 {
    value.get("rid").and_then(Value::as_i64).unwrap_or(0)
}

/// `error` object of a failed response.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseError {
    #[serde(alias = "msg")]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// A single response inside an envelope.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub rid: i64,
    #[serde(default, skip_serializing_if = "StreamState::is_initialized")]
    pub stream: StreamState,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub updates: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ResponseError>,
}

impl Response {
    pub fn new(rid: i64, stream: StreamState) -> Self {
        Self {
            rid,
            stream,
            updates: Vec::new(),
            error: None,
        }
    }

    pub fn closed(rid: i64) -> Self {
        Self::new(rid, StreamState::Closed)
    }

    /// Closed response describing why the request for `rid` failed.
    pub fn failure(rid: i64, err: &RequestError) -> Self {
        Self {
            rid,
            stream: StreamState::Closed,
            updates: Vec::new(),
            error: Some(ResponseError {
                message: err.to_string(),
                detail: Some(err.detail()),
            }),
        }
    }

    pub fn with_updates(mut self, updates: Vec<Value>) -> Self {
        self.updates = updates;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn initialized_stream_is_omitted() {
        let resp = Response::new(3, StreamState::Initialized);
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json, json!({"rid": 3}));
    }

    #[test]
    fn closed_response_has_no_updates_or_error() {
        let json = serde_json::to_value(Response::closed(2)).unwrap();
        assert_eq!(json, json!({"rid": 2, "stream": "closed"}));
    }

    #[test]
    fn failure_carries_message_and_detail() {
        let err = RequestError::protocol("Unknown method");
        let json = serde_json::to_value(Response::failure(9, &err)).unwrap();
        assert_eq!(json["stream"], "closed");
        assert_eq!(json["error"]["message"], "Unknown method");
        assert!(json["error"]["detail"].is_string());
    }

    #[test]
    fn request_keeps_method_payload() {
        let req = Request::from_value(json!({
            "rid": 2, "method": "set", "path": "/a/b", "value": 5
        }))
        .unwrap();
        assert_eq!(req.rid, 2);
        assert_eq!(req.path.as_deref(), Some("/a/b"));
        assert_eq!(req.param("value"), Some(&json!(5)));
    }

    #[test]
    fn request_without_rid_is_rejected() {
        let err = Request::from_value(json!({"method": "list"})).unwrap_err();
        assert_eq!(err.kind(), "json");
    }

    #[test]
    fn require_reports_missing_field() {
        let req = Request::new(1, "set");
        let err = req.require("value").unwrap_err();
        assert_eq!(err.to_string(), "Missing required field: value");
    }

    #[test]
    fn raw_rid_falls_back_to_zero() {
        assert_eq!(raw_rid(&json!({"rid": 12})), 12);
        assert_eq!(raw_rid(&json!({"rid": "x"})), 0);
        assert_eq!(raw_rid(&json!("junk")), 0);
    }

    #[test]
    fn decode_frame_accepts_concatenated_envelopes() {
        let frames = decode_frame(r#"{"requests":[]} {"responses":[{"rid":1}]}"#).unwrap();
        assert_eq!(frames.len(), 2);
        assert!(frames[0].is_empty());
        assert!(!frames[1].is_empty());
    }

    #[test]
    fn response_reads_legacy_msg_field() {
        let resp: Response = serde_json::from_value(json!({
            "rid": 4, "stream": "closed", "error": {"msg": "boom"}
        }))
        .unwrap();
        assert_eq!(resp.error.unwrap().message, "boom");
    }

    #[test]
    fn envelope_omits_absent_sections() {
        let env = Envelope::responses(&[Response::closed(1)]).unwrap();
        assert_eq!(
            env.to_json().unwrap(),
            r#"{"responses":[{"rid":1,"stream":"closed"}]}"#
        );
    }
}
