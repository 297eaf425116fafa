//! The event envelope carried from ingress to the workers.
//!
//! Events travel as CloudEvents over HTTP in either content mode: structured
//! (`application/cloudevents+json`, the whole envelope in the body) or binary
//! (attributes in `ce-*` headers, data in the body). Both the router and the
//! gate forward events without interpreting the data payload.

use std::collections::BTreeMap;

use bytes::Bytes;
use http::{header, HeaderMap, Request, Uri};
use hyper::Body;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use snafu::{OptionExt, ResultExt, Snafu};

const STRUCTURED_CONTENT_TYPE: &str = "application/cloudevents+json";

#[derive(Debug, Snafu)]
pub enum EnvelopeError {
    #[snafu(display("Invalid structured event payload: {}", source))]
    InvalidPayload { source: serde_json::Error },
    #[snafu(display("Missing required attribute `{}`", name))]
    MissingAttribute { name: &'static str },
    #[snafu(display("Attribute header `{}` is not valid UTF-8", name))]
    InvalidHeader { name: String },
}

/// The event payload. JSON data keeps its structure; anything else rides
/// along as opaque bytes.
#[derive(Clone, Debug, PartialEq)]
pub enum Data {
    Json(Value),
    Binary(Bytes),
    Empty,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Envelope {
    pub id: String,
    pub source: String,
    pub event_type: String,
    pub spec_version: String,
    pub content_type: Option<String>,
    pub extensions: BTreeMap<String, String>,
    pub data: Data,
}

/// Wire form of the structured content mode.
#[derive(Deserialize, Serialize)]
struct StructuredEnvelope {
    id: String,
    source: String,
    #[serde(rename = "type")]
    event_type: String,
    #[serde(rename = "specversion", default = "default_spec_version")]
    spec_version: String,
    #[serde(rename = "datacontenttype", skip_serializing_if = "Option::is_none")]
    content_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
    #[serde(flatten)]
    extensions: BTreeMap<String, Value>,
}

fn default_spec_version() -> String {
    "1.0".to_owned()
}

fn is_json(content_type: &str) -> bool {
    content_type.starts_with("application/json") || content_type.ends_with("+json")
}

impl Envelope {
    pub fn new(event_type: impl Into<String>, source: impl Into<String>, data: Data) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            source: source.into(),
            event_type: event_type.into(),
            spec_version: default_spec_version(),
            content_type: match &data {
                Data::Json(_) => Some("application/json".to_owned()),
                _ => None,
            },
            extensions: BTreeMap::new(),
            data,
        }
    }

    /// Parses an inbound HTTP request body and headers into an envelope,
    /// accepting either content mode.
    pub fn from_parts(headers: &HeaderMap, body: Bytes) -> Result<Self, EnvelopeError> {
        let content_type = headers
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);

        match content_type.as_deref() {
            Some(value) if value.starts_with(STRUCTURED_CONTENT_TYPE) => {
                Self::from_structured(&body)
            }
            _ => Self::from_binary(headers, body, content_type),
        }
    }

    fn from_structured(body: &[u8]) -> Result<Self, EnvelopeError> {
        let wire: StructuredEnvelope =
            serde_json::from_slice(body).context(InvalidPayloadSnafu)?;

        let extensions = wire
            .extensions
            .into_iter()
            .map(|(name, value)| {
                let value = match value {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                (name, value)
            })
            .collect();

        Ok(Self {
            id: wire.id,
            source: wire.source,
            event_type: wire.event_type,
            spec_version: wire.spec_version,
            content_type: wire.content_type,
            extensions,
            data: wire.data.map_or(Data::Empty, Data::Json),
        })
    }

    fn from_binary(
        headers: &HeaderMap,
        body: Bytes,
        content_type: Option<String>,
    ) -> Result<Self, EnvelopeError> {
        let attribute = |name: &'static str| -> Result<Option<String>, EnvelopeError> {
            match headers.get(name) {
                None => Ok(None),
                Some(value) => value
                    .to_str()
                    .map(|value| Some(value.to_owned()))
                    .ok()
                    .context(InvalidHeaderSnafu { name }),
            }
        };

        let id = attribute("ce-id")?.context(MissingAttributeSnafu { name: "id" })?;
        let source = attribute("ce-source")?.context(MissingAttributeSnafu { name: "source" })?;
        let event_type = attribute("ce-type")?.context(MissingAttributeSnafu { name: "type" })?;
        let spec_version = attribute("ce-specversion")?.unwrap_or_else(default_spec_version);

        let mut extensions = BTreeMap::new();
        for (name, value) in headers {
            let name = name.as_str();
            if let Some(ext) = name.strip_prefix("ce-") {
                if !matches!(ext, "id" | "source" | "type" | "specversion") {
                    if let Ok(value) = value.to_str() {
                        extensions.insert(ext.to_owned(), value.to_owned());
                    }
                }
            }
        }

        let data = if body.is_empty() {
            Data::Empty
        } else if content_type.as_deref().is_some_and(is_json) {
            match serde_json::from_slice(&body) {
                Ok(value) => Data::Json(value),
                Err(_) => Data::Binary(body),
            }
        } else {
            Data::Binary(body)
        };

        Ok(Self {
            id,
            source,
            event_type,
            spec_version,
            content_type,
            extensions,
            data,
        })
    }

    /// Builds a binary-mode POST carrying this envelope, preserving all
    /// attributes as `ce-*` headers.
    pub fn to_request(&self, target: &Uri) -> Result<Request<Body>, http::Error> {
        let mut builder = Request::post(target.clone())
            .header("ce-specversion", &self.spec_version)
            .header("ce-id", &self.id)
            .header("ce-source", &self.source)
            .header("ce-type", &self.event_type);

        for (name, value) in &self.extensions {
            builder = builder.header(format!("ce-{}", name), value);
        }

        let body = match &self.data {
            Data::Json(value) => {
                let content_type = self
                    .content_type
                    .clone()
                    .unwrap_or_else(|| "application/json".to_owned());
                builder = builder.header(header::CONTENT_TYPE, content_type);
                Body::from(serde_json::to_vec(value).expect("JSON value always serializes"))
            }
            Data::Binary(bytes) => {
                if let Some(content_type) = &self.content_type {
                    builder = builder.header(header::CONTENT_TYPE, content_type);
                }
                Body::from(bytes.clone())
            }
            Data::Empty => Body::empty(),
        };

        builder.body(body)
    }
}

#[cfg(test)]
mod tests {
    use http::HeaderValue;

    use super::*;

    fn binary_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("ce-id", HeaderValue::from_static("42"));
        headers.insert("ce-source", HeaderValue::from_static("/ingress"));
        headers.insert("ce-type", HeaderValue::from_static("dev.example.image"));
        headers.insert("ce-specversion", HeaderValue::from_static("1.0"));
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        headers
    }

    #[test]
    fn parses_binary_mode() {
        let body = Bytes::from_static(br#"{"imageData":"aGk="}"#);
        let envelope = Envelope::from_parts(&binary_headers(), body).unwrap();

        assert_eq!(envelope.id, "42");
        assert_eq!(envelope.source, "/ingress");
        assert_eq!(envelope.event_type, "dev.example.image");
        assert_eq!(
            envelope.data,
            Data::Json(serde_json::json!({ "imageData": "aGk=" }))
        );
    }

    #[test]
    fn parses_structured_mode() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/cloudevents+json"),
        );
        let body = Bytes::from_static(
            br#"{"id":"7","source":"/trigger","type":"dev.example.image","specversion":"1.0","datacontenttype":"application/json","data":{"n":1},"traceparent":"00-abc"}"#,
        );

        let envelope = Envelope::from_parts(&headers, body).unwrap();
        assert_eq!(envelope.id, "7");
        assert_eq!(envelope.data, Data::Json(serde_json::json!({ "n": 1 })));
        assert_eq!(
            envelope.extensions.get("traceparent").map(String::as_str),
            Some("00-abc")
        );
    }

    #[test]
    fn rejects_binary_mode_without_id() {
        let mut headers = binary_headers();
        headers.remove("ce-id");

        let error = Envelope::from_parts(&headers, Bytes::new()).unwrap_err();
        assert!(matches!(
            error,
            EnvelopeError::MissingAttribute { name: "id" }
        ));
    }

    #[test]
    fn forward_request_preserves_attributes() {
        let body = Bytes::from_static(br#"{"imageData":"aGk="}"#);
        let mut envelope = Envelope::from_parts(&binary_headers(), body).unwrap();
        envelope
            .extensions
            .insert("traceparent".to_owned(), "00-abc".to_owned());

        let request = envelope
            .to_request(&Uri::from_static("http://service1/"))
            .unwrap();

        let headers = request.headers();
        assert_eq!(headers.get("ce-id").unwrap(), "42");
        assert_eq!(headers.get("ce-type").unwrap(), "dev.example.image");
        assert_eq!(headers.get("ce-traceparent").unwrap(), "00-abc");
        assert_eq!(headers.get(header::CONTENT_TYPE).unwrap(), "application/json");
    }
}
