use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use http::HeaderMap;
use http_body::{Frame, SizeHint};
use http_body_util::BodyExt;
use pin_project_lite::pin_project;

use crate::http::buflist::BufList;
use crate::http::{Body, BoxError};

/// Outcome of trying to buffer a body bounded by the streaming threshold.
pub enum IngestedBody {
	/// The whole body fit under the limit.
	Buffered(Bytes),
	/// The limit was reached first. The returned body replays the consumed
	/// prefix and then continues from the live stream, without duplication.
	Streamed(Body),
}

/// Reads `body` into memory until EOF or until `limit` bytes have been
/// consumed, whichever comes first. Reaching the limit switches the flow to
/// streaming mode: the prefix is stitched back in front of the remainder.
pub async fn ingest_body(body: Body, limit: usize) -> Result<IngestedBody, BoxError> {
	let mut inner = body;
	let mut buffer = BufList::default();
	let mut trailers: Option<HeaderMap> = None;
	loop {
		if buffer.remaining() >= limit {
			let replay = ReplayBody {
				buffer,
				trailers,
				inner,
			};
			return Ok(IngestedBody::Streamed(BodyExt::boxed(replay)));
		}
		match inner.frame().await {
			Some(Ok(frame)) => match frame.into_data() {
				Ok(data) => buffer.push(data),
				Err(frame) => {
					if let Ok(t) = frame.into_trailers() {
						trailers = Some(t);
					}
				},
			},
			Some(Err(err)) => return Err(err),
			None => return Ok(IngestedBody::Buffered(buffer.copy_to_bytes())),
		}
	}
}

pin_project! {
	struct ReplayBody {
		buffer: BufList,
		trailers: Option<HeaderMap>,
		#[pin]
		inner: Body,
	}
}

impl http_body::Body for ReplayBody {
	type Data = Bytes;
	type Error = BoxError;

	fn poll_frame(
		mut self: Pin<&mut Self>,
		cx: &mut Context<'_>,
	) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
		if let Some(data) = self.buffer.pop_front() {
			return Poll::Ready(Some(Ok(Frame::data(data))));
		}
		match self.as_mut().project().inner.poll_frame(cx) {
			Poll::Ready(None) => match self.project().trailers.take() {
				Some(t) => Poll::Ready(Some(Ok(Frame::trailers(t)))),
				None => Poll::Ready(None),
			},
			other => other,
		}
	}

	fn is_end_stream(&self) -> bool {
		!self.buffer.has_remaining() && self.trailers.is_none() && self.inner.is_end_stream()
	}

	fn size_hint(&self) -> SizeHint {
		let rem = self.buffer.remaining() as u64;
		let mut hint = self.inner.size_hint();
		if let Some(upper) = hint.upper() {
			hint.set_upper(upper.saturating_add(rem));
		}
		hint.set_lower(hint.lower() + rem);
		hint
	}
}
