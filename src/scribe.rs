//! Serialisation of requests and responses: status lines, content headers,
//! the small-response fast path, chunked transfer framing, and server-sent
//! events.

// ----------

use std::sync::OnceLock;

use bytes::{BufMut, Bytes, BytesMut};
use futures_util::stream::{self, StreamExt};
use serde::Serialize;

use crate::{
	content::{ChunkStream, Content},
	errors::{reason_phrase, HttpError},
	headers::Headers,
	messages::{Request, Response},
};

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------

/// Bodies below this size are serialised and written in a single transport
/// call; anything else is streamed in bounded chunks.
pub const MAX_RESPONSE_CHUNK_SIZE: usize = 61440;

/// The interim response for `Expect: 100-continue` requests.
pub const CONTINUE_RESPONSE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

// --------------------------------------------------
// Status lines

/// The status line for the code, precomputed for the 100-599 range.
pub fn status_line(status: u16) -> Bytes {
	static TABLE: OnceLock<Vec<Bytes>> = OnceLock::new();

	let table = TABLE.get_or_init(|| {
		(100u16..=599).map(|status| build_status_line(status)).collect()
	});

	match status {
		100..=599 => table[(status - 100) as usize].clone(),
		_ => build_status_line(status),
	}
}

fn build_status_line(status: u16) -> Bytes {
	Bytes::from(format!("HTTP/1.1 {} {}\r\n", status, reason_phrase(status)))
}

// --------------------------------------------------
// Content headers

/// Applies the content-header policy. Must run exactly once before a
/// message head is written.
///
/// No content gets `Content-Length: 0`; an unknown length gets
/// `Transfer-Encoding: chunked`; everything else gets `Content-Type` and
/// `Content-Length`.
pub fn set_headers_for_content(headers: &mut Headers, some_content: Option<&Content>) {
	let Some(content) = some_content else {
		headers.set("Content-Length", "0");

		return;
	};

	let media_type = if content.media_type().is_empty() {
		Bytes::from_static(b"application/octet-stream")
	} else {
		content.media_type().clone()
	};

	match content.length() {
		None => {
			headers.set("Transfer-Encoding", "chunked");
			headers.remove("Content-Length");
			headers.set("Content-Type", media_type);
		}
		Some(length) => {
			headers.set("Content-Type", media_type);
			headers.set("Content-Length", length.to_string());
		}
	}
}

fn write_headers(buffer: &mut BytesMut, headers: &Headers) {
	for header in headers {
		buffer.put_slice(&header.name);
		buffer.put_slice(b": ");
		buffer.put_slice(&header.value);
		buffer.put_slice(b"\r\n");
	}

	buffer.put_slice(b"\r\n");
}

// --------------------------------------------------
// Response path

/// Whether the response qualifies for the single-write fast path.
pub fn is_small_response(response: &Response) -> bool {
	match response.content() {
		None => true,
		Some(content) => content
			.length()
			.map(|length| (length as usize) < MAX_RESPONSE_CHUNK_SIZE)
			.unwrap_or(false),
	}
}

/// Serialises the whole response into one byte string. Only valid for
/// [small responses](is_small_response).
pub async fn serialize_response(response: &mut Response) -> Result<Bytes, HttpError> {
	let (headers, some_content) = response.headers_and_content();
	set_headers_for_content(headers, some_content);

	let body = match response.content_mut() {
		Some(content) => content.read().await?,
		None => Bytes::new(),
	};

	let status_line = status_line(response.status);

	let mut buffer = BytesMut::with_capacity(status_line.len() + body.len() + 256);
	buffer.put_slice(&status_line);
	write_headers(&mut buffer, &response.headers);
	buffer.put_slice(&body);

	Ok(buffer.freeze())
}

/// Serialises the status line and headers, applying the content-header
/// policy.
pub fn serialize_response_head(response: &mut Response) -> Bytes {
	let (headers, some_content) = response.headers_and_content();
	set_headers_for_content(headers, some_content);

	let status_line = status_line(response.status);

	let mut buffer = BytesMut::with_capacity(status_line.len() + 256);
	buffer.put_slice(&status_line);
	write_headers(&mut buffer, &response.headers);

	buffer.freeze()
}

/// The response body as wire-ready frames.
///
/// Known-length bodies are sliced to [`MAX_RESPONSE_CHUNK_SIZE`];
/// unknown-length bodies are framed with chunked transfer encoding and
/// terminated by a zero-length chunk.
pub fn body_frames(content: &mut Content) -> Result<ChunkStream, HttpError> {
	let chunks = content.stream()?;

	match content.length() {
		Some(_) => Ok(
			chunks
				.flat_map(|result| match result {
					Ok(chunk) => stream::iter(slice_chunk(chunk)).boxed(),
					Err(error) => stream::iter(vec![Err(error)]).boxed(),
				})
				.boxed(),
		),
		None => Ok(
			chunks
				.filter_map(|result| async move {
					match result {
						Ok(chunk) if chunk.is_empty() => None,
						Ok(chunk) => Some(Ok(chunk_frame(&chunk))),
						Err(error) => Some(Err(error)),
					}
				})
				.chain(stream::once(std::future::ready(Ok(Bytes::from_static(
					b"0\r\n\r\n",
				)))))
				.boxed(),
		),
	}
}

fn slice_chunk(chunk: Bytes) -> Vec<Result<Bytes, crate::BoxedError>> {
	if chunk.len() <= MAX_RESPONSE_CHUNK_SIZE {
		return vec![Ok(chunk)];
	}

	let mut slices = Vec::with_capacity(chunk.len() / MAX_RESPONSE_CHUNK_SIZE + 1);
	let mut position = 0;

	while position < chunk.len() {
		let end = (position + MAX_RESPONSE_CHUNK_SIZE).min(chunk.len());
		slices.push(Ok(chunk.slice(position..end)));
		position = end;
	}

	slices
}

fn chunk_frame(chunk: &[u8]) -> Bytes {
	let mut frame = BytesMut::with_capacity(chunk.len() + 10);
	frame.put_slice(format!("{:x}\r\n", chunk.len()).as_bytes());
	frame.put_slice(chunk);
	frame.put_slice(b"\r\n");

	frame.freeze()
}

// --------------------------------------------------
// Request path

/// Serialises the request line and headers, ensuring a `Host` header and
/// applying the content-header policy.
pub fn serialize_request_head(request: &mut Request) -> Bytes {
	if !request.headers.contains("host") {
		if let Some(host) = request.url.host.clone() {
			match request.url.port {
				Some(port) => request
					.headers
					.set("Host", format!("{}:{}", String::from_utf8_lossy(&host), port)),
				None => request.headers.set("Host", host),
			}
		}
	}

	let (headers, some_content) = request.headers_and_content();
	set_headers_for_content(headers, some_content);

	let mut buffer = BytesMut::with_capacity(256);
	buffer.put_slice(&request.method);
	buffer.put_u8(b' ');
	buffer.put_slice(&request.url.path);

	if let Some(query) = request.url.query.as_deref() {
		buffer.put_u8(b'?');
		buffer.put_slice(query);
	}

	buffer.put_slice(b" HTTP/1.1\r\n");
	write_headers(&mut buffer, &request.headers);

	buffer.freeze()
}

// --------------------------------------------------
// Server-sent events

/// A server-sent event. Non-string data is JSON-encoded on write; CR/LF in
/// string data are escaped so an event cannot split in two.
#[derive(Debug, Default)]
pub struct ServerSentEvent {
	pub some_id: Option<String>,
	pub some_event: Option<String>,
	pub some_data: Option<EventData>,
	pub some_retry: Option<u64>,
}

#[derive(Debug)]
pub enum EventData {
	Text(String),
	Json(serde_json::Value),
}

impl ServerSentEvent {
	#[inline(always)]
	pub fn new() -> Self {
		Self::default()
	}

	pub fn with_id<T: Into<String>>(mut self, id: T) -> Self {
		self.some_id = Some(id.into());

		self
	}

	pub fn with_event<T: Into<String>>(mut self, event: T) -> Self {
		self.some_event = Some(event.into());

		self
	}

	pub fn with_data<T: Into<String>>(mut self, data: T) -> Self {
		self.some_data = Some(EventData::Text(data.into()));

		self
	}

	pub fn with_json_data<T: Serialize>(mut self, data: T) -> Result<Self, serde_json::Error> {
		self.some_data = Some(EventData::Json(serde_json::to_value(data)?));

		Ok(self)
	}

	pub fn with_retry(mut self, retry_ms: u64) -> Self {
		self.some_retry = Some(retry_ms);

		self
	}
}

/// Writes the textual payload of a server-sent event.
pub fn write_sse(event: &ServerSentEvent) -> Bytes {
	let mut buffer = BytesMut::new();

	if let Some(id) = event.some_id.as_deref() {
		buffer.put_slice(format!("id: {}\n", escape_line_breaks(id)).as_bytes());
	}

	if let Some(name) = event.some_event.as_deref() {
		buffer.put_slice(format!("event: {}\n", escape_line_breaks(name)).as_bytes());
	}

	match event.some_data.as_ref() {
		Some(EventData::Text(data)) => {
			buffer.put_slice(format!("data: {}\n", escape_line_breaks(data)).as_bytes());
		}
		Some(EventData::Json(data)) => {
			buffer.put_slice(format!("data: {}\n", data).as_bytes());
		}
		None => {}
	}

	if let Some(retry) = event.some_retry {
		buffer.put_slice(format!("retry: {}\n", retry).as_bytes());
	}

	buffer.put_u8(b'\n');

	buffer.freeze()
}

fn escape_line_breaks(value: &str) -> String {
	value.replace('\r', "\\r").replace('\n', "\\n")
}

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------
