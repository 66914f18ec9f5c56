use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};

mod buflist;
mod replay;

pub use replay::{IngestedBody, ingest_body};

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The one body type used on both sides of the proxy. Upstream `Incoming`
/// bodies, buffered bytes, and addon-supplied streams are all erased into it.
pub type Body = BoxBody<Bytes, BoxError>;

pub type Request = ::http::Request<Body>;
pub type Response = ::http::Response<Body>;

pub fn empty() -> Body {
	Empty::new().map_err(|never| match never {}).boxed()
}

pub fn full(data: impl Into<Bytes>) -> Body {
	Full::new(data.into()).map_err(|never| match never {}).boxed()
}

pub fn incoming(body: hyper::body::Incoming) -> Body {
	body.map_err(BoxError::from).boxed()
}

/// Collects a whole body into memory, failing once `limit` bytes are exceeded.
pub async fn read_body_with_limit(body: Body, limit: usize) -> Result<Bytes, BoxError> {
	Ok(
		http_body_util::Limited::new(body, limit)
			.collect()
			.await?
			.to_bytes(),
	)
}
