//! The incremental HTTP/1.1 request parser driving the connection state
//! machine.
//!
//! Built over `httparse`: bytes are buffered until the head parses, then
//! the body is framed by `Content-Length` counting or chunked decoding.
//! Head events, body chunks, and message completion are reported through
//! [`ParserEvent`]s; upgrades and framing violations surface as
//! distinguishable [`ParserError`]s.

// ----------

use bytes::{Buf, Bytes, BytesMut};

use crate::ImplError;

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------

/// Hard cap on the buffered request head.
pub const MAX_REQUEST_HEAD_SIZE: usize = 656 * 1024;

// The chunk-size line, with extensions, can never be this long.
const MAX_CHUNK_SIZE_LINE: usize = 16 * 1024;

const MAX_PARSED_HEADERS: usize = 256;

// --------------------------------------------------
// Events

#[derive(Debug, PartialEq)]
pub enum ParserEvent {
	RequestLine { method: Bytes, target: Bytes },
	Header { name: Bytes, value: Bytes },
	HeadersComplete,
	Body(Bytes),
	MessageComplete,
}

// --------------------------------------------------
// Errors

#[derive(Debug, ImplError)]
pub enum ParserError {
	#[error("invalid request: {0}")]
	Invalid(httparse::Error),

	#[error("conflicting body framing headers")]
	InvalidFraming,

	#[error("invalid chunked body")]
	InvalidChunkedBody,

	#[error("the request head exceeds {MAX_REQUEST_HEAD_SIZE} bytes")]
	HeadTooLarge,

	/// The request asks for a protocol upgrade. Raised after the head
	/// events have been emitted, so the connection can materialise the
	/// request before deciding on the upgrade.
	#[error("the client requested a protocol upgrade")]
	UpgradeRequest,
}

// --------------------------------------------------
// HttpParser

#[derive(Debug)]
enum ParseState {
	Head,
	Body(BodyFraming),
	Done,
	Upgraded,
}

#[derive(Debug)]
enum BodyFraming {
	ContentLength(u64),
	Chunked(ChunkedState),
}

#[derive(Debug)]
enum ChunkedState {
	Size,
	Data(u64),
	DataCrLf,
	Trailers,
}

#[derive(Debug)]
pub struct HttpParser {
	buffer: BytesMut,
	state: ParseState,
	method: Bytes,
	keep_alive: bool,
	some_upgrade_protocol: Option<Bytes>,
}

impl HttpParser {
	pub fn new() -> Self {
		Self {
			buffer: BytesMut::new(),
			state: ParseState::Head,
			method: Bytes::new(),
			keep_alive: true,
			some_upgrade_protocol: None,
		}
	}

	/// Feeds bytes into the parser, appending the resulting events.
	///
	/// Events emitted before an error are kept; bytes beyond a complete
	/// message stay buffered for the next request.
	pub fn feed_data(
		&mut self,
		data: &[u8],
		events: &mut Vec<ParserEvent>,
	) -> Result<(), ParserError> {
		self.buffer.extend_from_slice(data);

		loop {
			match &mut self.state {
				ParseState::Head => {
					if !self.parse_head(events)? {
						return Ok(());
					}
				}
				ParseState::Body(framing) => {
					let complete = match framing {
						BodyFraming::ContentLength(remaining) => {
							drain_sized(&mut self.buffer, remaining, events)
						}
						BodyFraming::Chunked(chunked) => {
							drain_chunked(&mut self.buffer, chunked, events)?
						}
					};

					if !complete {
						return Ok(());
					}

					events.push(ParserEvent::MessageComplete);
					self.state = ParseState::Done;

					return Ok(());
				}
				// Bytes beyond the current message wait for a reset; bytes
				// after an upgrade belong to the switched protocol.
				ParseState::Done | ParseState::Upgraded => return Ok(()),
			}
		}
	}

	// Returns true when the head is complete and parsing should continue
	// with the body.
	fn parse_head(&mut self, events: &mut Vec<ParserEvent>) -> Result<bool, ParserError> {
		let mut header_storage = [httparse::EMPTY_HEADER; MAX_PARSED_HEADERS];
		let mut parsed_request = httparse::Request::new(&mut header_storage);

		let head_size = match parsed_request.parse(&self.buffer) {
			Ok(httparse::Status::Complete(head_size)) => head_size,
			Ok(httparse::Status::Partial) => {
				if self.buffer.len() > MAX_REQUEST_HEAD_SIZE {
					return Err(ParserError::HeadTooLarge);
				}

				return Ok(false);
			}
			Err(parse_error) => return Err(ParserError::Invalid(parse_error)),
		};

		let method = Bytes::copy_from_slice(
			parsed_request.method.unwrap_or_default().as_bytes(),
		);
		let target = Bytes::copy_from_slice(parsed_request.path.unwrap_or_default().as_bytes());
		let version = parsed_request.version.unwrap_or(1);

		self.method = method.clone();
		events.push(ParserEvent::RequestLine { method, target });

		let mut some_content_length: Option<u64> = None;
		let mut chunked = false;
		let mut some_connection: Option<Bytes> = None;
		let mut some_upgrade: Option<Bytes> = None;

		for header in parsed_request.headers.iter() {
			let name = Bytes::copy_from_slice(header.name.as_bytes());
			let value = Bytes::copy_from_slice(header.value);

			if name.eq_ignore_ascii_case(b"content-length") {
				let length = std::str::from_utf8(&value)
					.ok()
					.and_then(|value| value.trim().parse::<u64>().ok())
					.ok_or(ParserError::InvalidFraming)?;

				some_content_length = Some(length);
			} else if name.eq_ignore_ascii_case(b"transfer-encoding") {
				if header_value_has_token(&value, b"chunked") {
					chunked = true;
				}
			} else if name.eq_ignore_ascii_case(b"connection") {
				some_connection = Some(value.clone());
			} else if name.eq_ignore_ascii_case(b"upgrade") {
				some_upgrade = Some(value.clone());
			}

			events.push(ParserEvent::Header { name, value });
		}

		if chunked && some_content_length.is_some() {
			return Err(ParserError::InvalidFraming);
		}

		self.keep_alive = match some_connection.as_deref() {
			Some(connection) if header_value_has_token(connection, b"close") => false,
			Some(connection) if header_value_has_token(connection, b"keep-alive") => true,
			_ => version == 1,
		};

		self.buffer.advance(head_size);
		events.push(ParserEvent::HeadersComplete);

		let upgrade_requested = some_upgrade.is_some()
			&& some_connection
				.as_deref()
				.map(|connection| header_value_has_token(connection, b"upgrade"))
				.unwrap_or(false);

		if upgrade_requested {
			self.some_upgrade_protocol = some_upgrade;
			self.state = ParseState::Upgraded;

			return Err(ParserError::UpgradeRequest);
		}

		if chunked {
			self.state = ParseState::Body(BodyFraming::Chunked(ChunkedState::Size));
		} else if let Some(length) = some_content_length.filter(|length| *length > 0) {
			self.state = ParseState::Body(BodyFraming::ContentLength(length));
		} else {
			events.push(ParserEvent::MessageComplete);
			self.state = ParseState::Done;
		}

		Ok(true)
	}

	/// The method of the request being parsed.
	#[inline(always)]
	pub fn method(&self) -> &Bytes {
		&self.method
	}

	#[inline(always)]
	pub fn should_keep_alive(&self) -> bool {
		self.keep_alive
	}

	/// The protocol the client asked to upgrade to, if any.
	#[inline(always)]
	pub fn upgrade_protocol(&self) -> Option<&Bytes> {
		self.some_upgrade_protocol.as_ref()
	}

	#[inline(always)]
	pub fn is_message_complete(&self) -> bool {
		matches!(self.state, ParseState::Done)
	}

	/// Takes the bytes buffered beyond the parsed message. After an
	/// upgrade these belong to the switched protocol.
	pub fn take_buffered(&mut self) -> Bytes {
		self.buffer.split().freeze()
	}

	/// Re-arms the parser for the next pipelined request, keeping any
	/// unconsumed buffered bytes.
	pub fn reset(&mut self) {
		self.state = ParseState::Head;
		self.method = Bytes::new();
		self.keep_alive = true;
		self.some_upgrade_protocol = None;
	}
}

// --------------------------------------------------

fn drain_sized(buffer: &mut BytesMut, remaining: &mut u64, events: &mut Vec<ParserEvent>) -> bool {
	if buffer.is_empty() {
		return false;
	}

	let take = (*remaining).min(buffer.len() as u64) as usize;
	let chunk = buffer.split_to(take).freeze();
	*remaining -= take as u64;

	events.push(ParserEvent::Body(chunk));

	*remaining == 0
}

fn drain_chunked(
	buffer: &mut BytesMut,
	state: &mut ChunkedState,
	events: &mut Vec<ParserEvent>,
) -> Result<bool, ParserError> {
	loop {
		match state {
			ChunkedState::Size => {
				let Some(line_end) = memchr::memmem::find(buffer, b"\r\n") else {
					if buffer.len() > MAX_CHUNK_SIZE_LINE {
						return Err(ParserError::InvalidChunkedBody);
					}

					return Ok(false);
				};

				let size_field = &buffer[..line_end];
				// Chunk extensions are permitted but ignored.
				let size_field = match size_field.iter().position(|ch| *ch == b';') {
					Some(semicolon) => &size_field[..semicolon],
					None => size_field,
				};

				let size = std::str::from_utf8(size_field)
					.ok()
					.and_then(|size| u64::from_str_radix(size.trim(), 16).ok())
					.ok_or(ParserError::InvalidChunkedBody)?;

				buffer.advance(line_end + 2);

				*state = if size == 0 {
					ChunkedState::Trailers
				} else {
					ChunkedState::Data(size)
				};
			}
			ChunkedState::Data(remaining) => {
				if buffer.is_empty() {
					return Ok(false);
				}

				let take = (*remaining).min(buffer.len() as u64) as usize;
				let chunk = buffer.split_to(take).freeze();
				*remaining -= take as u64;

				events.push(ParserEvent::Body(chunk));

				if *remaining > 0 {
					return Ok(false);
				}

				*state = ChunkedState::DataCrLf;
			}
			ChunkedState::DataCrLf => {
				if buffer.len() < 2 {
					return Ok(false);
				}

				if &buffer[..2] != b"\r\n" {
					return Err(ParserError::InvalidChunkedBody);
				}

				buffer.advance(2);
				*state = ChunkedState::Size;
			}
			ChunkedState::Trailers => {
				if buffer.starts_with(b"\r\n") {
					buffer.advance(2);

					return Ok(true);
				}

				// A trailer line; dropped without inspection.
				let Some(line_end) = memchr::memmem::find(buffer, b"\r\n") else {
					if buffer.len() > MAX_CHUNK_SIZE_LINE {
						return Err(ParserError::InvalidChunkedBody);
					}

					return Ok(false);
				};

				buffer.advance(line_end + 2);
			}
		}
	}
}

fn header_value_has_token(header_value: &[u8], token: &[u8]) -> bool {
	header_value
		.split(|ch| *ch == b',')
		.any(|candidate| candidate.trim_ascii().eq_ignore_ascii_case(token))
}

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------
