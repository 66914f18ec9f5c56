use std::sync::Arc;

use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode, Uri, Version};
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use tokio::sync::watch;
use uuid::Uuid;

use crate::connection::ConnContext;
use crate::http::Body;

pub mod encoding;

pub use encoding::EncodingError;

/// The captured request half of a flow. `body` stays `None` while only the
/// headers have been read, and permanently when the flow is streaming.
#[derive(Debug)]
pub struct Request {
	pub method: Method,
	pub url: Uri,
	pub version: Version,
	pub headers: HeaderMap,
	pub body: Option<Bytes>,
}

impl Request {
	pub fn from_parts(parts: &::http::request::Parts, url: Uri) -> Self {
		Request {
			method: parts.method.clone(),
			url,
			version: parts.version,
			headers: parts.headers.clone(),
			body: None,
		}
	}

	pub fn host(&self) -> &str {
		self.url.host().unwrap_or_default()
	}
}

/// The response half. Addons may install one before the upstream is contacted
/// (short-circuit) by setting `body`, or stream one via `body_stream`.
#[derive(Default)]
pub struct Response {
	pub status: StatusCode,
	pub headers: HeaderMap,
	pub body: Option<Bytes>,
	/// A streaming body supplied by an addon; consumed when replying.
	pub body_stream: Option<Body>,
	pub(crate) close: bool,
	decoded: Option<Result<Bytes, EncodingError>>,
}

impl std::fmt::Debug for Response {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Response")
			.field("status", &self.status)
			.field("headers", &self.headers)
			.field("body_len", &self.body.as_ref().map(Bytes::len))
			.field("streamed", &self.body_stream.is_some())
			.finish()
	}
}

const TEXT_CONTENT_TYPES: &[&str] = &["text", "javascript", "json"];

impl Response {
	pub fn new(status: StatusCode) -> Self {
		Response {
			status,
			..Default::default()
		}
	}

	pub fn with_body(status: StatusCode, body: impl Into<Bytes>) -> Self {
		Response {
			status,
			body: Some(body.into()),
			..Default::default()
		}
	}

	pub fn is_text_content_type(&self) -> bool {
		let Some(ct) = self
			.headers
			.get(http::header::CONTENT_TYPE)
			.and_then(|v| v.to_str().ok())
		else {
			return false;
		};
		TEXT_CONTENT_TYPES.iter().any(|t| ct.contains(t))
	}

	fn content_encoding(&self) -> Option<String> {
		self
			.headers
			.get(http::header::CONTENT_ENCODING)
			.and_then(|v| v.to_str().ok())
			.map(|s| s.trim().to_string())
			.filter(|s| !s.is_empty() && s != "identity")
	}

	/// The body after undoing Content-Encoding. Both the decoded bytes and a
	/// decode failure are memoized; repeated calls never decode twice.
	pub async fn decoded_body(&mut self) -> Result<Bytes, EncodingError> {
		if let Some(cached) = &self.decoded {
			return cached.clone();
		}
		let result = match (&self.body, self.content_encoding()) {
			(None, _) => Ok(Bytes::new()),
			(Some(body), None) => Ok(body.clone()),
			(Some(body), _) if body.is_empty() => Ok(body.clone()),
			(Some(body), Some(enc)) => encoding::decode(&enc, body).await,
		};
		self.decoded = Some(result.clone());
		result
	}

	/// Replaces the body with its decoded form and fixes up the headers:
	/// Content-Encoding and Transfer-Encoding go away, Content-Length is set.
	/// A decode failure leaves the response untouched.
	pub async fn replace_to_decoded_body(&mut self) {
		let Ok(body) = self.decoded_body().await else {
			return;
		};
		self.headers.remove(http::header::CONTENT_ENCODING);
		self.headers.remove(http::header::TRANSFER_ENCODING);
		self.headers.insert(
			http::header::CONTENT_LENGTH,
			http::HeaderValue::from(body.len()),
		);
		self.body = Some(body);
		self.decoded = None;
	}
}

/// One request/response exchange on a connection, threaded through every
/// addon hook. Once `stream` flips to true it never flips back.
pub struct Flow {
	pub id: Uuid,
	pub conn: Arc<ConnContext>,
	pub request: Request,
	pub response: Option<Response>,
	pub stream: bool,
	pub use_separate_client: bool,
	created_at: std::time::Instant,
	done_tx: watch::Sender<bool>,
}

impl Flow {
	pub fn new(conn: Arc<ConnContext>, request: Request) -> Self {
		let (done_tx, _) = watch::channel(false);
		Flow {
			id: Uuid::new_v4(),
			conn,
			request,
			response: None,
			stream: false,
			use_separate_client: false,
			created_at: std::time::Instant::now(),
			done_tx,
		}
	}

	pub fn elapsed(&self) -> std::time::Duration {
		self.created_at.elapsed()
	}

	/// Completion signal: resolves after the response has been fully written
	/// (or the flow was short-circuited) and every hook has run.
	pub fn done(&self) -> watch::Receiver<bool> {
		self.done_tx.subscribe()
	}

	pub(crate) fn finish(&self) {
		let _ = self.done_tx.send(true);
	}
}

impl std::fmt::Debug for Flow {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Flow")
			.field("id", &self.id)
			.field("method", &self.request.method)
			.field("url", &self.request.url)
			.field("stream", &self.stream)
			.finish()
	}
}

fn serialize_headers<S: Serializer>(headers: &HeaderMap, serializer: S) -> Result<S::Ok, S::Error> {
	let mut map = serializer.serialize_map(None)?;
	for key in headers.keys() {
		let values: Vec<_> = headers
			.get_all(key)
			.iter()
			.filter_map(|v| v.to_str().ok())
			.collect();
		map.serialize_entry(key.as_str(), &values)?;
	}
	map.end()
}

// Metadata-only snapshots, the shape external consoles consume. Bodies are
// deliberately excluded.
impl Serialize for Request {
	fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		let mut map = serializer.serialize_map(Some(4))?;
		map.serialize_entry("method", self.method.as_str())?;
		map.serialize_entry("url", &self.url.to_string())?;
		map.serialize_entry("proto", &format!("{:?}", self.version))?;
		map.serialize_entry("header", &HeaderMapSnapshot(&self.headers))?;
		map.end()
	}
}

impl Serialize for Response {
	fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		let mut map = serializer.serialize_map(Some(2))?;
		map.serialize_entry("statusCode", &self.status.as_u16())?;
		map.serialize_entry("header", &HeaderMapSnapshot(&self.headers))?;
		map.end()
	}
}

impl Serialize for Flow {
	fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		let mut map = serializer.serialize_map(Some(3))?;
		map.serialize_entry("id", &self.id.to_string())?;
		map.serialize_entry("request", &self.request)?;
		map.serialize_entry("response", &self.response)?;
		map.end()
	}
}

struct HeaderMapSnapshot<'a>(&'a HeaderMap);

impl Serialize for HeaderMapSnapshot<'_> {
	fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		serialize_headers(self.0, serializer)
	}
}
