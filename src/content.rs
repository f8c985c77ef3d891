//! Message body payloads.
//!
//! A [`Content`] is one of three shapes: a buffered byte string, a streamed
//! body produced by a restartable generator factory, or an externally-fed
//! body consuming frames from a gateway.

// ----------

use bytes::{Bytes, BytesMut};
use futures_util::stream::{self, BoxStream, Stream, StreamExt};
use serde::Serialize;

use crate::{
	errors::HttpError,
	gateway::{FrameKind, ReceivedFrame},
	BoxedError, BoxedFuture,
};

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------

pub type ChunkStream = BoxStream<'static, Result<Bytes, BoxedError>>;

/// A factory producing a fresh body stream on every call, so `read` and
/// `stream` can each traverse the content independently.
pub type StreamFactory = Box<dyn Fn() -> ChunkStream + Send + Sync>;

/// An async callback yielding body frames from a gateway.
pub type ReceiveFn = Box<dyn FnMut() -> BoxedFuture<Result<ReceivedFrame, BoxedError>> + Send + Sync>;

// --------------------------------------------------
// Content

pub struct Content {
	media_type: Bytes,
	some_length: Option<u64>,
	source: ContentSource,
}

enum ContentSource {
	Buffered(Bytes),
	Streamed(StreamFactory),
	Gateway(GatewayFeed),
}

struct GatewayFeed {
	some_receive: Option<ReceiveFn>,
	some_buffered: Option<Bytes>,
	aborted: bool,
}

impl Content {
	pub fn from_bytes<T: AsRef<[u8]>, B: Into<Bytes>>(media_type: T, body: B) -> Self {
		let body = body.into();

		Self {
			media_type: Bytes::copy_from_slice(media_type.as_ref()),
			some_length: Some(body.len() as u64),
			source: ContentSource::Buffered(body),
		}
	}

	#[inline]
	pub fn text<T: Into<String>>(text: T) -> Self {
		Self::from_bytes("text/plain; charset=utf-8", text.into())
	}

	#[inline]
	pub fn html<T: Into<String>>(html: T) -> Self {
		Self::from_bytes("text/html; charset=utf-8", html.into())
	}

	pub fn json<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
		serde_json::to_vec(value).map(|body| Self::from_bytes("application/json", body))
	}

	/// Content produced by a stream factory. A declared length of `None`
	/// triggers chunked transfer encoding on the wire.
	pub fn streamed<T, F, S>(media_type: T, some_length: Option<u64>, factory: F) -> Self
	where
		T: AsRef<[u8]>,
		F: Fn() -> S + Send + Sync + 'static,
		S: Stream<Item = Result<Bytes, BoxedError>> + Send + 'static,
	{
		Self {
			media_type: Bytes::copy_from_slice(media_type.as_ref()),
			some_length,
			source: ContentSource::Streamed(Box::new(move || factory().boxed())),
		}
	}

	/// Content fed by a gateway's receive callback.
	pub fn from_gateway<T: AsRef<[u8]>>(media_type: T, receive: ReceiveFn) -> Self {
		Self {
			media_type: Bytes::copy_from_slice(media_type.as_ref()),
			some_length: None,
			source: ContentSource::Gateway(GatewayFeed {
				some_receive: Some(receive),
				some_buffered: None,
				aborted: false,
			}),
		}
	}

	#[inline(always)]
	pub fn media_type(&self) -> &Bytes {
		&self.media_type
	}

	#[inline(always)]
	pub fn length(&self) -> Option<u64> {
		self.some_length
	}

	/// The buffered body, when the content has one.
	pub fn body(&self) -> Option<&Bytes> {
		match &self.source {
			ContentSource::Buffered(body) => Some(body),
			ContentSource::Streamed(_) => None,
			ContentSource::Gateway(feed) => feed.some_buffered.as_ref(),
		}
	}

	/// Reads the whole body.
	///
	/// Gateway-fed content memoises the result, so repeated reads are
	/// permitted; a disconnect frame fails the read with
	/// [`HttpError::Aborted`].
	pub async fn read(&mut self) -> Result<Bytes, HttpError> {
		match &mut self.source {
			ContentSource::Buffered(body) => Ok(body.clone()),
			ContentSource::Streamed(factory) => {
				let mut body = BytesMut::new();
				let mut chunks = factory();

				while let Some(chunk) = chunks.next().await {
					body.extend_from_slice(&chunk.map_err(HttpError::internal)?);
				}

				Ok(body.freeze())
			}
			ContentSource::Gateway(feed) => {
				if let Some(buffered) = feed.some_buffered.as_ref() {
					return Ok(buffered.clone());
				}

				if feed.aborted {
					return Err(HttpError::Aborted);
				}

				let Some(mut receive) = feed.some_receive.take() else {
					return Err(HttpError::InvalidOperation(
						"the gateway body was already consumed",
					));
				};

				let mut body = BytesMut::new();

				loop {
					let frame = receive().await.map_err(HttpError::internal)?;

					if let FrameKind::Disconnect = frame.kind {
						feed.aborted = true;

						return Err(HttpError::Aborted);
					}

					body.extend_from_slice(&frame.body);

					if !frame.more_body {
						break;
					}
				}

				let body = body.freeze();
				feed.some_buffered = Some(body.clone());

				Ok(body)
			}
		}
	}

	/// The body as a stream of chunks.
	///
	/// Buffered content yields its body in one chunk; streamed content
	/// starts a fresh traversal; gateway content can be streamed once.
	pub fn stream(&mut self) -> Result<ChunkStream, HttpError> {
		match &mut self.source {
			ContentSource::Buffered(body) => {
				if body.is_empty() {
					return Ok(stream::empty().boxed());
				}

				Ok(stream::once(std::future::ready(Ok(body.clone()))).boxed())
			}
			ContentSource::Streamed(factory) => Ok(factory()),
			ContentSource::Gateway(feed) => {
				if let Some(buffered) = feed.some_buffered.as_ref() {
					let buffered = buffered.clone();

					return Ok(stream::once(std::future::ready(Ok(buffered))).boxed());
				}

				let Some(receive) = feed.some_receive.take() else {
					return Err(HttpError::InvalidOperation(
						"the gateway body stream cannot be restarted",
					));
				};

				Ok(gateway_stream(receive))
			}
		}
	}

	/// Drops the buffered body and clears the receive callback.
	pub fn dispose(&mut self) {
		self.some_length = Some(0);
		self.source = ContentSource::Buffered(Bytes::new());
	}
}

impl std::fmt::Debug for Content {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let source = match &self.source {
			ContentSource::Buffered(body) => format!("Buffered({} bytes)", body.len()),
			ContentSource::Streamed(_) => "Streamed".to_owned(),
			ContentSource::Gateway(_) => "Gateway".to_owned(),
		};

		f.debug_struct("Content")
			.field("media_type", &self.media_type)
			.field("some_length", &self.some_length)
			.field("source", &source)
			.finish()
	}
}

// --------------------------------------------------

fn gateway_stream(receive: ReceiveFn) -> ChunkStream {
	stream::unfold((receive, false), |(mut receive, done)| async move {
		if done {
			return None;
		}

		match receive().await {
			Err(error) => Some((Err(error), (receive, true))),
			Ok(frame) => match frame.kind {
				FrameKind::Disconnect => {
					Some((Err(HttpError::Aborted.into()), (receive, true)))
				}
				FrameKind::Request => {
					let done = !frame.more_body;

					Some((Ok(frame.body), (receive, done)))
				}
			},
		}
	})
	.boxed()
}

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------

#[cfg(test)]
mod test {
	use std::collections::VecDeque;
	use std::sync::{Arc, Mutex};

	use super::*;

	// --------------------------------------------------------------------------------
	// --------------------------------------------------------------------------------

	#[tokio::test]
	async fn buffered() {
		let mut content = Content::text("hi");

		assert_eq!(&content.media_type()[..], b"text/plain; charset=utf-8");
		assert_eq!(content.length(), Some(2));
		assert_eq!(&content.read().await.unwrap()[..], b"hi");
		assert_eq!(&content.read().await.unwrap()[..], b"hi");

		content.dispose();
		assert_eq!(content.length(), Some(0));
	}

	#[tokio::test]
	async fn json_content() {
		let mut content = Content::json(&serde_json::json!({"id": 7})).unwrap();

		assert_eq!(&content.media_type()[..], b"application/json");
		assert_eq!(&content.read().await.unwrap()[..], br#"{"id":7}"#);
	}

	#[tokio::test]
	async fn streamed_restartable() {
		let mut content = Content::streamed("application/octet-stream", None, || {
			stream::iter(vec![
				Ok(Bytes::from_static(b"aaaa")),
				Ok(Bytes::from_static(b"bb")),
			])
		});

		assert_eq!(content.length(), None);
		assert_eq!(&content.read().await.unwrap()[..], b"aaaabb");

		// A fresh traversal after a full read.
		let chunks: Vec<_> = content
			.stream()
			.unwrap()
			.map(|chunk| chunk.unwrap())
			.collect()
			.await;
		assert_eq!(chunks, [Bytes::from_static(b"aaaa"), Bytes::from_static(b"bb")]);
	}

	// ----------

	fn frames_receive(frames: Vec<ReceivedFrame>) -> ReceiveFn {
		let frames = Arc::new(Mutex::new(VecDeque::from(frames)));

		Box::new(move || {
			let frames = frames.clone();

			Box::pin(async move {
				Ok(
					frames
						.lock()
						.unwrap()
						.pop_front()
						.expect("the content must not read past the last frame"),
				)
			})
		})
	}

	#[tokio::test]
	async fn gateway_read_memoised() {
		let receive = frames_receive(vec![
			ReceivedFrame::request(Bytes::from_static(b"abc"), true),
			ReceivedFrame::request(Bytes::from_static(b"def"), false),
		]);

		let mut content = Content::from_gateway("application/octet-stream", receive);

		assert_eq!(&content.read().await.unwrap()[..], b"abcdef");

		// The second read must come from the memo; the feed is exhausted.
		assert_eq!(&content.read().await.unwrap()[..], b"abcdef");
	}

	#[tokio::test]
	async fn gateway_disconnect_aborts() {
		let receive = frames_receive(vec![
			ReceivedFrame::request(Bytes::from_static(b"abc"), true),
			ReceivedFrame::disconnect(),
		]);

		let mut content = Content::from_gateway("application/octet-stream", receive);

		assert!(matches!(content.read().await, Err(HttpError::Aborted)));
		assert!(matches!(content.read().await, Err(HttpError::Aborted)));
	}

	#[tokio::test]
	async fn gateway_stream_single_shot() {
		let receive = frames_receive(vec![ReceivedFrame::request(Bytes::from_static(b"x"), false)]);

		let mut content = Content::from_gateway("application/octet-stream", receive);

		let chunks: Vec<_> = content
			.stream()
			.unwrap()
			.map(|chunk| chunk.unwrap())
			.collect()
			.await;
		assert_eq!(chunks, [Bytes::from_static(b"x")]);

		assert!(matches!(
			content.stream(),
			Err(HttpError::InvalidOperation(_)),
		));
	}
}
