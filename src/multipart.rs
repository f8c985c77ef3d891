//! `multipart/form-data` decoding and encoding.
//!
//! Decoding runs over a byte stream and yields parts either fully parsed
//! (in-memory or disk-spooled) or one at a time as streaming parts, so
//! large uploads never have to materialise in RAM.

// ----------

use std::{
	collections::HashMap,
	io::{Read, Seek, SeekFrom, Write},
	marker::PhantomData,
	sync::{Arc, Mutex},
};

use bytes::{BufMut, Bytes, BytesMut};
use futures_util::stream::{self, Stream, StreamExt};
use rand::{rngs::SmallRng, RngCore, SeedableRng};
use tempfile::SpooledTempFile;
use tokio::io::AsyncWriteExt;

use crate::{content::ChunkStream, errors::HttpError, BoxedError};

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------

/// Part payloads growing past this size are spooled to a temporary file.
pub const PART_SPOOL_THRESHOLD: usize = 1024 * 1024;

const LARGE_TEXT_PART_SIZE: usize = 1024 * 1024;

const POISONED_SPOOL: &str = "poisoned spool lock";

// --------------------------------------------------
// Boundary

/// Extracts the boundary parameter from a `multipart/form-data` media type.
pub fn parse_boundary(content_type: &[u8]) -> Result<String, HttpError> {
	let content_type = std::str::from_utf8(content_type)
		.map_err(|_| HttpError::bad_request("invalid multipart content type"))?;

	multer::parse_boundary(content_type).map_err(Into::into)
}

/// Generates a fresh `----<32 hex chars>` boundary.
pub fn generate_boundary() -> String {
	let mut random_bytes = [0u8; 16];
	SmallRng::from_entropy().fill_bytes(&mut random_bytes);

	let mut boundary = String::with_capacity(36);
	boundary.push_str("----");
	for byte in random_bytes {
		boundary.push_str(&format!("{:02x}", byte));
	}

	boundary
}

#[inline]
pub fn multipart_media_type(boundary: &str) -> Bytes {
	Bytes::from(format!("multipart/form-data; boundary={}", boundary))
}

// --------------------------------------------------
// FileBuffer

/// A spooled part payload: in-memory up to [`PART_SPOOL_THRESHOLD`], then
/// overflowing to a temporary file on disk.
pub struct FileBuffer {
	file: SpooledTempFile,
	length: u64,
}

impl FileBuffer {
	pub fn new() -> Self {
		Self::with_memory_limit(PART_SPOOL_THRESHOLD)
	}

	pub fn with_memory_limit(limit: usize) -> Self {
		Self {
			file: SpooledTempFile::new(limit),
			length: 0,
		}
	}

	pub fn write(&mut self, chunk: &[u8]) -> std::io::Result<()> {
		self.file.write_all(chunk)?;
		self.length += chunk.len() as u64;

		Ok(())
	}

	#[inline(always)]
	pub fn len(&self) -> u64 {
		self.length
	}

	#[inline(always)]
	pub fn is_empty(&self) -> bool {
		self.length == 0
	}

	/// Whether the payload overflowed to disk.
	#[inline(always)]
	pub fn is_spooled(&self) -> bool {
		self.file.is_rolled()
	}

	pub fn read_to_bytes(&mut self) -> std::io::Result<Bytes> {
		self.file.seek(SeekFrom::Start(0))?;

		let mut body = Vec::with_capacity(self.length as usize);
		self.file.read_to_end(&mut body)?;
		self.file.seek(SeekFrom::End(0))?;

		Ok(Bytes::from(body))
	}
}

// --------------------------------------------------
// FormPart

/// A fully parsed part of a multipart form.
#[derive(Clone)]
pub struct FormPart {
	pub name: String,
	pub some_file_name: Option<String>,
	pub some_content_type: Option<String>,
	pub some_charset: Option<String>,
	data: PartData,
}

#[derive(Clone)]
enum PartData {
	Memory(Bytes),
	Spooled(Arc<Mutex<FileBuffer>>),
}

impl FormPart {
	pub fn new<N: Into<String>, B: Into<Bytes>>(name: N, body: B) -> Self {
		Self {
			name: name.into(),
			some_file_name: None,
			some_content_type: None,
			some_charset: None,
			data: PartData::Memory(body.into()),
		}
	}

	pub fn with_file_name<F: Into<String>>(mut self, file_name: F) -> Self {
		self.some_file_name = Some(file_name.into());

		self
	}

	pub fn with_content_type<T: Into<String>>(mut self, content_type: T) -> Self {
		self.some_content_type = Some(content_type.into());

		self
	}

	#[inline(always)]
	pub fn is_file(&self) -> bool {
		self.some_file_name.is_some()
	}

	pub fn len(&self) -> u64 {
		match &self.data {
			PartData::Memory(body) => body.len() as u64,
			PartData::Spooled(buffer) => buffer.lock().expect(POISONED_SPOOL).len(),
		}
	}

	#[inline(always)]
	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// The part payload, read back from memory or from the spool file.
	pub fn bytes(&self) -> Result<Bytes, HttpError> {
		match &self.data {
			PartData::Memory(body) => Ok(body.clone()),
			PartData::Spooled(buffer) => buffer
				.lock()
				.expect(POISONED_SPOOL)
				.read_to_bytes()
				.map_err(HttpError::internal),
		}
	}

	/// The payload decoded as text with the part's declared charset
	/// (utf-8 when undeclared).
	pub fn text(&self) -> Result<String, HttpError> {
		let body = self.bytes()?;

		Ok(decode_text(&body, self.some_charset.as_deref()))
	}
}

impl std::fmt::Debug for FormPart {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("FormPart")
			.field("name", &self.name)
			.field("some_file_name", &self.some_file_name)
			.field("some_content_type", &self.some_content_type)
			.field("length", &self.len())
			.finish()
	}
}

fn decode_text(body: &[u8], some_charset: Option<&str>) -> String {
	let encoding = some_charset
		.and_then(|charset| encoding_rs::Encoding::for_label(charset.as_bytes()))
		.unwrap_or(encoding_rs::UTF_8);

	encoding.decode(body).0.into_owned()
}

// --------------------------------------------------
// Parsing

/// Parses all parts of a multipart body, spooling large payloads to disk.
pub async fn parse_multipart<S, E>(boundary: String, body: S) -> Result<Vec<FormPart>, HttpError>
where
	S: Stream<Item = Result<Bytes, E>> + Send + 'static,
	E: Into<BoxedError> + 'static,
{
	let mut multipart = multer::Multipart::new(body, boundary);
	let mut parts = Vec::new();

	while let Some(mut field) = multipart.next_field().await? {
		let name = field.name().unwrap_or_default().to_owned();
		let some_file_name = field.file_name().map(str::to_owned);
		let (some_content_type, some_charset) = content_type_of(&field);

		let mut buffered = BytesMut::new();
		let mut some_spooled: Option<FileBuffer> = None;

		while let Some(chunk) = field.chunk().await? {
			if let Some(spooled) = some_spooled.as_mut() {
				spooled.write(&chunk).map_err(HttpError::internal)?;

				continue;
			}

			if buffered.len() + chunk.len() > PART_SPOOL_THRESHOLD {
				let mut spooled = FileBuffer::new();
				spooled.write(&buffered).map_err(HttpError::internal)?;
				spooled.write(&chunk).map_err(HttpError::internal)?;

				buffered.clear();
				some_spooled = Some(spooled);

				continue;
			}

			buffered.extend_from_slice(&chunk);
		}

		let data = match some_spooled {
			Some(spooled) => PartData::Spooled(Arc::new(Mutex::new(spooled))),
			None => PartData::Memory(buffered.freeze()),
		};

		parts.push(FormPart {
			name,
			some_file_name,
			some_content_type,
			some_charset,
			data,
		});
	}

	Ok(parts)
}

fn content_type_of(field: &multer::Field<'static>) -> (Option<String>, Option<String>) {
	match field.content_type() {
		Some(mime) => (
			Some(mime.essence_str().to_owned()),
			mime.get_param(mime::CHARSET).map(|charset| charset.to_string()),
		),
		None => (None, None),
	}
}

impl From<multer::Error> for HttpError {
	fn from(error: multer::Error) -> Self {
		HttpError::bad_request(format!("invalid multipart body: {}", error))
	}
}

// --------------------------------------------------
// Streaming parse

/// An *"async iterator"* over the parts of a multipart body.
pub struct MultipartReader {
	inner: multer::Multipart<'static>,
}

impl MultipartReader {
	pub fn new<S, E>(boundary: String, body: S) -> Self
	where
		S: Stream<Item = Result<Bytes, E>> + Send + 'static,
		E: Into<BoxedError> + 'static,
	{
		Self {
			inner: multer::Multipart::new(body, boundary),
		}
	}

	pub async fn next_part(&mut self) -> Result<Option<StreamingFormPart<'_>>, HttpError> {
		self
			.inner
			.next_field()
			.await
			.map(|some_field| {
				some_field.map(|field| StreamingFormPart {
					inner: field,
					_lifetime_mark: PhantomData,
				})
			})
			.map_err(Into::into)
	}
}

/// A single part whose payload is read as a byte stream.
pub struct StreamingFormPart<'p> {
	inner: multer::Field<'static>,
	_lifetime_mark: PhantomData<&'p mut MultipartReader>,
}

impl<'p> StreamingFormPart<'p> {
	pub fn name(&self) -> Option<&str> {
		self.inner.name()
	}

	pub fn file_name(&self) -> Option<&str> {
		self.inner.file_name()
	}

	pub fn content_type(&self) -> Option<&mime::Mime> {
		self.inner.content_type()
	}

	/// The next available chunk of the part's payload.
	pub async fn chunk(&mut self) -> Result<Option<Bytes>, HttpError> {
		self.inner.chunk().await.map_err(Into::into)
	}

	/// The full payload of the part.
	pub async fn bytes(self) -> Result<Bytes, HttpError> {
		self.inner.bytes().await.map_err(Into::into)
	}

	/// Streams the payload into a file, returning the number of bytes
	/// written.
	pub async fn save_to<P: AsRef<std::path::Path>>(mut self, path: P) -> Result<u64, HttpError> {
		let mut file = tokio::fs::File::create(path).await.map_err(HttpError::internal)?;
		let mut written = 0u64;

		while let Some(chunk) = self.chunk().await? {
			file.write_all(&chunk).await.map_err(HttpError::internal)?;
			written += chunk.len() as u64;
		}

		file.flush().await.map_err(HttpError::internal)?;

		Ok(written)
	}
}

// --------------------------------------------------
// Encoding

/// Serialises parts as a `multipart/form-data` byte stream with the given
/// boundary.
pub fn write_multipart(boundary: &str, parts: Vec<FormPart>) -> ChunkStream {
	let boundary = boundary.to_owned();
	let closing = Bytes::from(format!("--{}--\r\n", boundary));

	stream::iter(parts)
		.flat_map(move |part| {
			let header = part_header(&boundary, &part);
			let body = part.bytes().map_err(Into::<BoxedError>::into);

			stream::iter(vec![Ok(header), body, Ok(Bytes::from_static(b"\r\n"))])
		})
		.chain(stream::once(std::future::ready(Ok(closing))))
		.boxed()
}

fn part_header(boundary: &str, part: &FormPart) -> Bytes {
	let mut header = BytesMut::new();

	header.put_slice(format!("--{}\r\n", boundary).as_bytes());
	header.put_slice(format!("Content-Disposition: form-data; name=\"{}\"", part.name).as_bytes());

	if let Some(file_name) = part.some_file_name.as_deref() {
		header.put_slice(format!("; filename=\"{}\"", file_name).as_bytes());
	}

	header.put_slice(b"\r\n");

	if let Some(content_type) = part.some_content_type.as_deref() {
		header.put_slice(format!("Content-Type: {}\r\n", content_type).as_bytes());
	}

	header.put_slice(b"\r\n");

	header.freeze()
}

// --------------------------------------------------
// Simplified view

/// A simplified multipart or url-encoded form value.
#[derive(Debug, Clone)]
pub enum FormValue {
	Text(String),
	Texts(Vec<String>),
	File(FormPart),
	Files(Vec<FormPart>),
}

impl FormValue {
	pub fn as_text(&self) -> Option<&str> {
		match self {
			Self::Text(text) => Some(text),
			_ => None,
		}
	}

	pub fn as_file(&self) -> Option<&FormPart> {
		match self {
			Self::File(part) => Some(part),
			_ => None,
		}
	}
}

/// Collapses single-valued keys to a scalar and decodes non-file text
/// parts with their declared charset.
pub fn simplify_multipart_data(parts: &[FormPart]) -> Result<HashMap<String, FormValue>, HttpError> {
	let mut grouped: Vec<(String, Vec<&FormPart>)> = Vec::new();

	for part in parts {
		match grouped.iter_mut().find(|(name, _)| *name == part.name) {
			Some((_, group)) => group.push(part),
			None => grouped.push((part.name.clone(), vec![part])),
		}
	}

	let mut simplified = HashMap::with_capacity(grouped.len());

	for (name, group) in grouped {
		let value = if group.len() == 1 {
			let part = group[0];

			if part.is_file() {
				FormValue::File(part.clone())
			} else {
				FormValue::Text(text_of(part)?)
			}
		} else if group.iter().any(|part| part.is_file()) {
			FormValue::Files(group.into_iter().cloned().collect())
		} else {
			FormValue::Texts(
				group
					.into_iter()
					.map(text_of)
					.collect::<Result<Vec<_>, _>>()?,
			)
		};

		simplified.insert(name, value);
	}

	Ok(simplified)
}

fn text_of(part: &FormPart) -> Result<String, HttpError> {
	if part.len() > LARGE_TEXT_PART_SIZE as u64 {
		tracing::warn!(
			part = %part.name,
			size = part.len(),
			"decoding an unusually large text form part",
		);
	}

	part.text()
}

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------

#[cfg(test)]
mod test {
	use super::*;

	// --------------------------------------------------------------------------------
	// --------------------------------------------------------------------------------

	fn body_stream(body: &'static [u8]) -> impl Stream<Item = Result<Bytes, std::io::Error>> {
		stream::iter(vec![Ok(Bytes::from_static(body))])
	}

	const TWO_PART_BODY: &[u8] = b"--boundary\r\n\
		Content-Disposition: form-data; name=\"textfield\"\r\n\
		\r\n\
		hello\r\n\
		--boundary\r\n\
		Content-Disposition: form-data; name=\"filefield\"; filename=\"cat.txt\"\r\n\
		Content-Type: text/plain\r\n\
		\r\n\
		meow\r\n\
		--boundary--\r\n";

	// ----------

	#[test]
	fn boundary() {
		let boundary =
			parse_boundary(b"multipart/form-data; boundary=----8d93b4e314b04c26").unwrap();
		assert_eq!(boundary, "----8d93b4e314b04c26");

		let quoted = parse_boundary(b"multipart/form-data; boundary=\"simple boundary\"").unwrap();
		assert_eq!(quoted, "simple boundary");

		assert!(parse_boundary(b"application/json").is_err());
	}

	#[test]
	fn generated_boundary_shape() {
		let boundary = generate_boundary();

		assert_eq!(boundary.len(), 36);
		assert!(boundary.starts_with("----"));
		assert!(boundary[4..]
			.chars()
			.all(|ch| ch.is_ascii_hexdigit() && !ch.is_ascii_uppercase()));

		assert_ne!(boundary, generate_boundary());
	}

	#[tokio::test]
	async fn parse_two_parts() {
		let parts = parse_multipart("boundary".to_owned(), body_stream(TWO_PART_BODY))
			.await
			.unwrap();

		assert_eq!(parts.len(), 2);

		assert_eq!(parts[0].name, "textfield");
		assert!(!parts[0].is_file());
		assert_eq!(&parts[0].bytes().unwrap()[..], b"hello");

		assert_eq!(parts[1].name, "filefield");
		assert_eq!(parts[1].some_file_name.as_deref(), Some("cat.txt"));
		assert_eq!(parts[1].some_content_type.as_deref(), Some("text/plain"));
		assert_eq!(&parts[1].bytes().unwrap()[..], b"meow");
	}

	#[tokio::test]
	async fn streaming_parts() {
		let mut reader = MultipartReader::new("boundary".to_owned(), body_stream(TWO_PART_BODY));

		let part = reader.next_part().await.unwrap().unwrap();
		assert_eq!(part.name(), Some("textfield"));
		assert_eq!(&part.bytes().await.unwrap()[..], b"hello");

		let mut part = reader.next_part().await.unwrap().unwrap();
		assert_eq!(part.file_name(), Some("cat.txt"));

		let mut payload = BytesMut::new();
		while let Some(chunk) = part.chunk().await.unwrap() {
			payload.extend_from_slice(&chunk);
		}
		assert_eq!(&payload[..], b"meow");

		assert!(reader.next_part().await.unwrap().is_none());
	}

	#[tokio::test]
	async fn save_part_to_disk() {
		let mut reader = MultipartReader::new("boundary".to_owned(), body_stream(TWO_PART_BODY));

		let _ = reader.next_part().await.unwrap().unwrap();
		let part = reader.next_part().await.unwrap().unwrap();

		let directory = tempfile::tempdir().unwrap();
		let path = directory.path().join("cat.txt");

		let written = part.save_to(&path).await.unwrap();
		assert_eq!(written, 4);
		assert_eq!(std::fs::read(&path).unwrap(), b"meow");
	}

	#[test]
	fn file_buffer_spools() {
		let mut buffer = FileBuffer::with_memory_limit(8);

		buffer.write(b"1234").unwrap();
		assert!(!buffer.is_spooled());

		buffer.write(b"56789abc").unwrap();
		assert!(buffer.is_spooled());
		assert_eq!(buffer.len(), 12);

		assert_eq!(&buffer.read_to_bytes().unwrap()[..], b"123456789abc");

		// Reading must not disturb the write position.
		buffer.write(b"!").unwrap();
		assert_eq!(&buffer.read_to_bytes().unwrap()[..], b"123456789abc!");
	}

	#[tokio::test]
	async fn encode_round_trip() {
		let parts = vec![
			FormPart::new("textfield", Bytes::from_static(b"hello")),
			FormPart::new("filefield", Bytes::from_static(b"meow"))
				.with_file_name("cat.txt")
				.with_content_type("text/plain"),
		];

		let boundary = generate_boundary();
		let encoded: Vec<_> = write_multipart(&boundary, parts)
			.map(|chunk| chunk.unwrap())
			.collect()
			.await;

		let mut body = BytesMut::new();
		for chunk in &encoded {
			body.extend_from_slice(chunk);
		}

		let body = body.freeze();
		assert!(body.ends_with(format!("--{}--\r\n", boundary).as_bytes()));

		let parsed = parse_multipart(
			boundary,
			stream::iter(vec![Ok::<_, std::io::Error>(body)]),
		)
		.await
		.unwrap();

		assert_eq!(parsed.len(), 2);
		assert_eq!(parsed[0].name, "textfield");
		assert_eq!(&parsed[0].bytes().unwrap()[..], b"hello");
		assert_eq!(parsed[1].some_file_name.as_deref(), Some("cat.txt"));
		assert_eq!(&parsed[1].bytes().unwrap()[..], b"meow");
	}

	#[test]
	fn simplify() {
		let parts = vec![
			FormPart::new("textfield", Bytes::from_static(b"hello")),
			FormPart::new("filefield", Bytes::from_static(b"meow")).with_file_name("cat.txt"),
			FormPart::new("tags", Bytes::from_static(b"a")),
			FormPart::new("tags", Bytes::from_static(b"b")),
		];

		let simplified = simplify_multipart_data(&parts).unwrap();

		assert_eq!(
			simplified.get("textfield").and_then(FormValue::as_text),
			Some("hello"),
		);
		assert!(simplified.get("filefield").and_then(FormValue::as_file).is_some());

		match simplified.get("tags").unwrap() {
			FormValue::Texts(tags) => assert_eq!(tags, &["a", "b"]),
			other => panic!("expected Texts, got {:?}", other),
		}
	}
}
