//! Request and response messages over headers and content, with body-wait
//! synchronisation for parser-fed requests.

// ----------

use std::{
	collections::HashMap,
	str::FromStr,
	sync::{Arc, Mutex},
};

use bytes::{Bytes, BytesMut};
use futures_util::stream;
use serde::de::DeserializeOwned;
use tokio::sync::Notify;

use crate::{
	content::Content,
	cookies::{self, Cookie},
	errors::HttpError,
	headers::Headers,
	multipart::{self, FormPart, FormValue},
	url::Url,
};

const POISONED_INBOX: &str = "poisoned body inbox lock";
const FRESH_FORM_CACHE: &str = "the form cache was just filled";

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------

// --------------------------------------------------
// BodyInbox

/// The accumulation point for a parser-fed request body: the parser pushes
/// chunks in the background while the handler awaits completion. Once
/// complete or aborted, the inbox stays that way and every past and future
/// waiter observes it.
#[derive(Debug)]
pub(crate) struct BodyInbox {
	state: Mutex<InboxState>,
	on_complete: Notify,
}

#[derive(Debug)]
struct InboxState {
	buffer: BytesMut,
	complete: bool,
	aborted: bool,
}

impl BodyInbox {
	pub(crate) fn new() -> Arc<Self> {
		Arc::new(Self {
			state: Mutex::new(InboxState {
				buffer: BytesMut::new(),
				complete: false,
				aborted: false,
			}),
			on_complete: Notify::new(),
		})
	}

	/// Appends a body chunk, returning the accumulated size.
	pub(crate) fn push(&self, chunk: &[u8]) -> usize {
		let mut state = self.state.lock().expect(POISONED_INBOX);
		state.buffer.extend_from_slice(chunk);

		state.buffer.len()
	}

	/// Marks the body complete and wakes the readers.
	pub(crate) fn seal(&self) {
		self.state.lock().expect(POISONED_INBOX).complete = true;
		self.on_complete.notify_waiters();
	}

	/// Marks the message aborted and wakes the readers. Idempotent.
	pub(crate) fn abort(&self) {
		{
			let mut state = self.state.lock().expect(POISONED_INBOX);
			state.aborted = true;
			state.complete = true;
		}

		self.on_complete.notify_waiters();
	}

	pub(crate) fn is_aborted(&self) -> bool {
		self.state.lock().expect(POISONED_INBOX).aborted
	}

	pub(crate) fn is_complete(&self) -> bool {
		self.state.lock().expect(POISONED_INBOX).complete
	}

	pub(crate) async fn wait_complete(&self) {
		loop {
			let notified = self.on_complete.notified();
			tokio::pin!(notified);

			// Registration must precede the flag check, or a seal between
			// the check and the await would be missed.
			notified.as_mut().enable();

			if self.is_complete() {
				return;
			}

			notified.await;
		}
	}

	pub(crate) async fn read(&self) -> Result<Bytes, HttpError> {
		self.wait_complete().await;

		let state = self.state.lock().expect(POISONED_INBOX);
		if state.aborted {
			return Err(HttpError::Aborted);
		}

		Ok(Bytes::copy_from_slice(&state.buffer))
	}
}

// --------------------------------------------------
// Request

const BODYLESS_METHODS: [&[u8]; 5] = [b"GET", b"HEAD", b"TRACE", b"OPTIONS", b"CONNECT"];

#[derive(Debug)]
pub struct Request {
	pub method: Bytes,
	pub url: Url,
	pub headers: Headers,
	pub route_values: HashMap<String, String>,
	some_content: Option<Content>,
	some_inbox: Option<Arc<BodyInbox>>,
	some_form_cache: Option<FormCache>,
}

#[derive(Debug)]
enum FormCache {
	UrlEncoded(Vec<(String, String)>),
	Multipart(Vec<FormPart>),
}

impl Request {
	pub fn new<M: AsRef<[u8]>>(method: M, url: Url) -> Self {
		Self {
			method: Bytes::copy_from_slice(method.as_ref()),
			url,
			headers: Headers::new(),
			route_values: HashMap::new(),
			some_content: None,
			some_inbox: None,
			some_form_cache: None,
		}
	}

	pub fn with_headers(mut self, headers: Headers) -> Self {
		self.headers = headers;

		self
	}

	pub fn with_content(mut self, content: Content) -> Self {
		self.some_content = Some(content);

		self
	}

	/// A request materialised from parser callbacks. Its body arrives
	/// through the returned inbox; body-less methods are complete at birth.
	pub(crate) fn incoming(method: Bytes, url: Url, headers: Headers) -> (Self, Arc<BodyInbox>) {
		let inbox = BodyInbox::new();

		if BODYLESS_METHODS.contains(&&method[..]) {
			inbox.seal();
		}

		let request = Self {
			method,
			url,
			headers,
			route_values: HashMap::new(),
			some_content: None,
			some_inbox: Some(inbox.clone()),
			some_form_cache: None,
		};

		(request, inbox)
	}

	#[inline(always)]
	pub fn content(&self) -> Option<&Content> {
		self.some_content.as_ref()
	}

	#[inline(always)]
	pub fn content_mut(&mut self) -> Option<&mut Content> {
		self.some_content.as_mut()
	}

	/// Whether the connection behind the request is still alive.
	pub fn is_active(&self) -> bool {
		self
			.some_inbox
			.as_ref()
			.map(|inbox| !inbox.is_aborted())
			.unwrap_or(true)
	}

	pub fn is_aborted(&self) -> bool {
		!self.is_active()
	}

	pub fn is_complete(&self) -> bool {
		self
			.some_inbox
			.as_ref()
			.map(|inbox| inbox.is_complete())
			.unwrap_or(true)
	}

	/// Resolves once the body has fully arrived or the connection is lost.
	pub async fn when_complete(&self) {
		if let Some(inbox) = self.some_inbox.as_ref() {
			inbox.wait_complete().await;
		}
	}

	/// Awaits body completion and returns the accumulated bytes.
	pub async fn read(&mut self) -> Result<Bytes, HttpError> {
		if let Some(inbox) = self.some_inbox.as_ref() {
			return inbox.read().await;
		}

		match self.some_content.as_mut() {
			Some(content) => content.read().await,
			None => Ok(Bytes::new()),
		}
	}

	pub async fn text(&mut self) -> Result<String, HttpError> {
		let some_content_type = self.content_type();
		let body = self.read().await?;

		Ok(decode_body_text(&body, some_content_type.as_deref()))
	}

	pub async fn json<T: DeserializeOwned>(&mut self) -> Result<T, HttpError> {
		let some_content_type = self.content_type();
		let body = self.read().await?;

		json_body(some_content_type.as_deref(), &body)
	}

	/// The form data of the request, parsed from a www-form-urlencoded or
	/// multipart body and memoised.
	pub async fn form(&mut self) -> Result<HashMap<String, FormValue>, HttpError> {
		self.ensure_form_cache().await?;

		form_view(self.some_form_cache.as_ref().expect(FRESH_FORM_CACHE))
	}

	/// The multipart file parts, optionally filtered by field name.
	pub async fn files(&mut self, some_name: Option<&str>) -> Result<Vec<FormPart>, HttpError> {
		let is_multipart = self
			.content_type()
			.map(|content_type| starts_with_ignore_case(&content_type, b"multipart/form-data"))
			.unwrap_or(false);

		if !is_multipart {
			return Ok(Vec::new());
		}

		self.ensure_form_cache().await?;

		match self.some_form_cache.as_ref().expect(FRESH_FORM_CACHE) {
			FormCache::Multipart(parts) => Ok(
				parts
					.iter()
					.filter(|part| part.is_file())
					.filter(|part| some_name.map(|name| part.name == name).unwrap_or(true))
					.cloned()
					.collect(),
			),
			FormCache::UrlEncoded(_) => Ok(Vec::new()),
		}
	}

	async fn ensure_form_cache(&mut self) -> Result<(), HttpError> {
		if self.some_form_cache.is_some() {
			return Ok(());
		}

		let Some(content_type) = self.content_type() else {
			return Err(HttpError::bad_request("missing content type"));
		};

		let body = self.read().await?;
		self.some_form_cache = Some(parse_form(&content_type, body).await?);

		Ok(())
	}

	/// The `{name: value}` view over the `Cookie` headers, recomputed from
	/// the header list on every call.
	pub fn cookies(&self) -> HashMap<String, String> {
		let mut cookies = HashMap::new();

		for value in self.headers.get("cookie") {
			for (name, pair_value) in cookies::parse_cookie_header(value) {
				cookies.insert(name, pair_value);
			}
		}

		cookies
	}

	/// Whether the client asked for a `100 Continue` interim response.
	pub fn expect_100_continue(&self) -> bool {
		self
			.headers
			.get_first("expect")
			.map(|value| value.eq_ignore_ascii_case(b"100-continue"))
			.unwrap_or(false)
	}

	pub fn content_type(&self) -> Option<Bytes> {
		message_content_type(&self.headers, self.some_content.as_ref())
	}

	/// Splits the message into its mutable headers and its content, for
	/// serialisers that set headers from the content.
	pub fn headers_and_content(&mut self) -> (&mut Headers, Option<&Content>) {
		(&mut self.headers, self.some_content.as_ref())
	}

	/// Releases the body resources on connection loss.
	pub fn dispose(&mut self) {
		if let Some(content) = self.some_content.as_mut() {
			content.dispose();
		}

		self.some_content = None;
		self.some_form_cache = None;
	}
}

// --------------------------------------------------
// Response

#[derive(Debug)]
pub struct Response {
	pub status: u16,
	pub headers: Headers,
	some_content: Option<Content>,
	some_form_cache: Option<FormCache>,
}

impl Response {
	pub fn new(status: u16) -> Self {
		Self {
			status,
			headers: Headers::new(),
			some_content: None,
			some_form_cache: None,
		}
	}

	pub fn with_content(mut self, content: Content) -> Self {
		self.some_content = Some(content);

		self
	}

	#[inline(always)]
	pub fn content(&self) -> Option<&Content> {
		self.some_content.as_ref()
	}

	#[inline(always)]
	pub fn content_mut(&mut self) -> Option<&mut Content> {
		self.some_content.as_mut()
	}

	#[inline]
	pub fn is_redirect(&self) -> bool {
		matches!(self.status, 301 | 302 | 303 | 307 | 308)
	}

	pub async fn read(&mut self) -> Result<Bytes, HttpError> {
		match self.some_content.as_mut() {
			Some(content) => content.read().await,
			None => Ok(Bytes::new()),
		}
	}

	pub async fn text(&mut self) -> Result<String, HttpError> {
		let some_content_type = self.content_type();
		let body = self.read().await?;

		Ok(decode_body_text(&body, some_content_type.as_deref()))
	}

	pub async fn json<T: DeserializeOwned>(&mut self) -> Result<T, HttpError> {
		let some_content_type = self.content_type();
		let body = self.read().await?;

		json_body(some_content_type.as_deref(), &body)
	}

	pub async fn form(&mut self) -> Result<HashMap<String, FormValue>, HttpError> {
		if self.some_form_cache.is_none() {
			let Some(content_type) = self.content_type() else {
				return Err(HttpError::bad_request("missing content type"));
			};

			let body = self.read().await?;
			self.some_form_cache = Some(parse_form(&content_type, body).await?);
		}

		form_view(self.some_form_cache.as_ref().expect(FRESH_FORM_CACHE))
	}

	/// Appends a `Set-Cookie` header for the cookie.
	pub fn set_cookie(&mut self, cookie: &Cookie) {
		self
			.headers
			.add(("Set-Cookie", cookies::write_cookie_for_response(cookie)));
	}

	/// Appends a `Set-Cookie` header that unsets the named cookie.
	pub fn unset_cookie(&mut self, name: &str) {
		self
			.headers
			.add(("Set-Cookie", cookies::write_removal_cookie(name)));
	}

	/// The `{name: Cookie}` view over the `Set-Cookie` headers, recomputed
	/// from the header list on every call.
	pub fn cookies(&self) -> HashMap<String, Cookie> {
		let mut view = HashMap::new();

		for value in self.headers.get("set-cookie") {
			if let Ok(cookie) = cookies::parse_cookie(value) {
				view.insert(cookie.name.clone(), cookie);
			}
		}

		view
	}

	pub fn content_type(&self) -> Option<Bytes> {
		message_content_type(&self.headers, self.some_content.as_ref())
	}

	/// Splits the message into its mutable headers and its content, for
	/// serialisers that set headers from the content.
	pub fn headers_and_content(&mut self) -> (&mut Headers, Option<&Content>) {
		(&mut self.headers, self.some_content.as_ref())
	}
}

// --------------------------------------------------
// Shared body helpers

fn message_content_type(headers: &Headers, some_content: Option<&Content>) -> Option<Bytes> {
	headers
		.get_first("content-type")
		.cloned()
		.or_else(|| some_content.map(|content| content.media_type().clone()))
		.filter(|content_type| !content_type.is_empty())
}

fn declares_json(content_type: &[u8]) -> bool {
	content_type
		.windows(4)
		.any(|window| window.eq_ignore_ascii_case(b"json"))
}

fn json_body<T: DeserializeOwned>(
	some_content_type: Option<&[u8]>,
	body: &[u8],
) -> Result<T, HttpError> {
	if !some_content_type.map(declares_json).unwrap_or(false) {
		return Err(HttpError::InvalidOperation(
			"the content type does not declare JSON",
		));
	}

	serde_json::from_slice(body).map_err(|error| HttpError::BadRequestFormat {
		expected: "JSON",
		source: error.into(),
	})
}

fn form_view(cache: &FormCache) -> Result<HashMap<String, FormValue>, HttpError> {
	match cache {
		FormCache::UrlEncoded(pairs) => Ok(simplify_urlencoded(pairs)),
		FormCache::Multipart(parts) => multipart::simplify_multipart_data(parts),
	}
}

fn starts_with_ignore_case(value: &[u8], prefix: &[u8]) -> bool {
	value.len() >= prefix.len() && value[..prefix.len()].eq_ignore_ascii_case(prefix)
}

fn charset_of(content_type: &[u8]) -> Option<String> {
	let content_type = std::str::from_utf8(content_type).ok()?;
	let mime = mime::Mime::from_str(content_type).ok()?;

	mime.get_param(mime::CHARSET).map(|charset| charset.to_string())
}

// Declared charset, then strict UTF-8, then ISO-8859-1 (total, so always
// the last resort).
fn decode_body_text(body: &[u8], some_content_type: Option<&[u8]>) -> String {
	let some_encoding = some_content_type
		.and_then(charset_of)
		.and_then(|charset| encoding_rs::Encoding::for_label(charset.as_bytes()));

	if let Some(encoding) = some_encoding {
		return encoding.decode(body).0.into_owned();
	}

	match std::str::from_utf8(body) {
		Ok(text) => text.to_owned(),
		Err(_) => encoding_rs::WINDOWS_1252.decode(body).0.into_owned(),
	}
}

async fn parse_form(content_type: &[u8], body: Bytes) -> Result<FormCache, HttpError> {
	if starts_with_ignore_case(content_type, b"application/x-www-form-urlencoded") {
		let pairs = serde_urlencoded::from_bytes::<Vec<(String, String)>>(&body)
			.map_err(|error| HttpError::BadRequestFormat {
				expected: "form data",
				source: error.into(),
			})?;

		return Ok(FormCache::UrlEncoded(pairs));
	}

	if starts_with_ignore_case(content_type, b"multipart/form-data") {
		let boundary = multipart::parse_boundary(content_type)?;
		let parts = multipart::parse_multipart(
			boundary,
			stream::iter(vec![Ok::<_, crate::BoxedError>(body)]),
		)
		.await?;

		return Ok(FormCache::Multipart(parts));
	}

	Err(HttpError::bad_request("the content is not form data"))
}

fn simplify_urlencoded(pairs: &[(String, String)]) -> HashMap<String, FormValue> {
	let mut simplified: HashMap<String, FormValue> = HashMap::new();

	for (name, value) in pairs {
		let combined = match simplified.remove(name) {
			None => FormValue::Text(value.clone()),
			Some(FormValue::Text(first)) => FormValue::Texts(vec![first, value.clone()]),
			Some(FormValue::Texts(mut values)) => {
				values.push(value.clone());

				FormValue::Texts(values)
			}
			Some(other) => other,
		};

		simplified.insert(name.clone(), combined);
	}

	simplified
}

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------
