//! Cookie records, `Cookie`/`Set-Cookie` parsing, and response
//! serialisation per RFC 6265.

// ----------

use std::time::{Duration, SystemTime};

use bytes::{BufMut, Bytes, BytesMut};
use percent_encoding::{percent_decode, utf8_percent_encode, AsciiSet, CONTROLS};

use crate::{errors::HttpError, ImplError};

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------

// Characters that cannot appear raw in a cookie name or value.
const COOKIE_ENCODE_SET: &AsciiSet = &CONTROLS
	.add(b' ')
	.add(b'"')
	.add(b',')
	.add(b';')
	.add(b'=')
	.add(b'%')
	.add(b'\\');

/// The longest serialised value accepted on construction. Common clients
/// refuse to store anything bigger.
pub const MAX_COOKIE_VALUE_SIZE: usize = 4096;

// --------------------------------------------------
// SameSite

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SameSite {
	#[default]
	Undefined,
	Lax,
	Strict,
	None,
}

impl SameSite {
	fn as_str(&self) -> Option<&'static str> {
		match self {
			Self::Undefined => Option::None,
			Self::Lax => Some("Lax"),
			Self::Strict => Some("Strict"),
			Self::None => Some("None"),
		}
	}
}

// --------------------------------------------------
// Cookie

#[derive(Debug, Clone, PartialEq)]
pub struct Cookie {
	pub name: String,
	pub value: String,
	pub some_expires: Option<SystemTime>,
	pub some_domain: Option<String>,
	pub some_path: Option<String>,
	pub http_only: bool,
	pub secure: bool,
	pub some_max_age: Option<i64>,
	pub same_site: SameSite,
}

impl Cookie {
	pub fn new<N: Into<String>, V: Into<String>>(name: N, value: V) -> Result<Self, CookieError> {
		let name = name.into();
		if name.is_empty() {
			return Err(CookieError::EmptyName);
		}

		let value = value.into();
		if utf8_percent_encode(&value, COOKIE_ENCODE_SET).to_string().len() > MAX_COOKIE_VALUE_SIZE {
			return Err(CookieError::ValueTooLarge);
		}

		Ok(Self::bare(name, value))
	}

	// A cookie with nothing but its pair set.
	fn bare(name: String, value: String) -> Self {
		Self {
			name,
			value,
			some_expires: None,
			some_domain: None,
			some_path: None,
			http_only: false,
			secure: false,
			some_max_age: None,
			same_site: SameSite::Undefined,
		}
	}

	pub fn with_expires(mut self, expires: SystemTime) -> Self {
		self.some_expires = Some(expires);

		self
	}

	pub fn with_domain<D: Into<String>>(mut self, domain: D) -> Self {
		self.some_domain = Some(domain.into());

		self
	}

	pub fn with_path<P: Into<String>>(mut self, path: P) -> Self {
		self.some_path = Some(path.into());

		self
	}

	pub fn with_http_only(mut self) -> Self {
		self.http_only = true;

		self
	}

	pub fn with_secure(mut self) -> Self {
		self.secure = true;

		self
	}

	pub fn with_max_age(mut self, max_age: i64) -> Self {
		self.some_max_age = Some(max_age);

		self
	}

	pub fn with_same_site(mut self, same_site: SameSite) -> Self {
		self.same_site = same_site;

		self
	}
}

// --------------------------------------------------
// Parsing

/// Parses a cookie from either a `Cookie` pair string or a full
/// `Set-Cookie` value with attributes.
///
/// Both `"; "` and `";"` separators are tolerated; unknown attributes are
/// skipped. Oversized values from the peer are accepted as-is.
pub fn parse_cookie(value: &[u8]) -> Result<Cookie, CookieError> {
	let mut segments = value.split(|ch| *ch == b';');

	let pair = segments.next().ok_or(CookieError::Malformed("empty value"))?;
	let (name, value) = split_pair(pair).ok_or(CookieError::Malformed("missing '='"))?;

	if name.is_empty() {
		return Err(CookieError::EmptyName);
	}

	let mut cookie = Cookie::bare(decode(name), decode(unquote(value)));

	for segment in segments {
		let segment = segment.trim_ascii();

		let (attribute, some_attribute_value) = match split_pair(segment) {
			Some((attribute, attribute_value)) => (attribute, Some(attribute_value)),
			Option::None => (segment, Option::None),
		};

		match attribute.to_ascii_lowercase().as_slice() {
			b"expires" => {
				if let Some(attribute_value) = some_attribute_value {
					cookie.some_expires = parse_cookie_date(attribute_value);
				}
			}
			b"domain" => {
				if let Some(attribute_value) = some_attribute_value {
					cookie.some_domain = Some(String::from_utf8_lossy(attribute_value).into_owned());
				}
			}
			b"path" => {
				if let Some(attribute_value) = some_attribute_value {
					cookie.some_path = Some(String::from_utf8_lossy(attribute_value).into_owned());
				}
			}
			b"max-age" => {
				cookie.some_max_age = some_attribute_value
					.and_then(|attribute_value| std::str::from_utf8(attribute_value).ok())
					.and_then(|attribute_value| attribute_value.parse::<i64>().ok());
			}
			b"httponly" => cookie.http_only = true,
			b"secure" => cookie.secure = true,
			b"samesite" => {
				cookie.same_site = match some_attribute_value.map(|v| v.to_ascii_lowercase()) {
					Some(ref v) if v == b"lax" => SameSite::Lax,
					Some(ref v) if v == b"strict" => SameSite::Strict,
					Some(ref v) if v == b"none" => SameSite::None,
					_ => SameSite::Undefined,
				};
			}
			// Unknown attributes are silently skipped.
			_ => {}
		}
	}

	Ok(cookie)
}

fn split_pair(segment: &[u8]) -> Option<(&[u8], &[u8])> {
	segment.iter().position(|ch| *ch == b'=').map(|position| {
		(
			segment[..position].trim_ascii(),
			segment[position + 1..].trim_ascii(),
		)
	})
}

// RFC 6265 permits the cookie value to be wrapped in one pair of DQUOTEs.
fn unquote(value: &[u8]) -> &[u8] {
	match value {
		[b'"', inner @ .., b'"'] => inner,
		_ => value,
	}
}

fn decode(value: &[u8]) -> String {
	percent_decode(value).decode_utf8_lossy().into_owned()
}

// Accepts RFC 1123 dates and the `%a, %d-%b-%Y %H:%M:%S GMT` variant.
fn parse_cookie_date(value: &[u8]) -> Option<SystemTime> {
	let value = std::str::from_utf8(value).ok()?;

	if let Ok(time) = httpdate::parse_http_date(value) {
		return Some(time);
	}

	httpdate::parse_http_date(&value.replacen('-', " ", 2)).ok()
}

// --------------------------------------------------
// Serialisation

/// Writes the cookie as a `Set-Cookie` header value.
///
/// Attribute order is fixed: `Expires`, `Max-Age`, `Domain`, `Path`,
/// `HttpOnly`, `Secure`, `SameSite`. A `Strict` or `None` same-site mode
/// forces `Secure`.
pub fn write_cookie_for_response(cookie: &Cookie) -> Bytes {
	let mut buffer = BytesMut::new();

	buffer.put_slice(utf8_percent_encode(&cookie.name, COOKIE_ENCODE_SET).to_string().as_bytes());
	buffer.put_u8(b'=');
	buffer.put_slice(utf8_percent_encode(&cookie.value, COOKIE_ENCODE_SET).to_string().as_bytes());

	if let Some(expires) = cookie.some_expires {
		buffer.put_slice(b"; Expires=");
		buffer.put_slice(httpdate::fmt_http_date(expires).as_bytes());
	}

	if let Some(max_age) = cookie.some_max_age {
		if max_age >= 0 {
			buffer.put_slice(format!("; Max-Age={}", max_age).as_bytes());
		}
	}

	if let Some(domain) = cookie.some_domain.as_deref() {
		buffer.put_slice(b"; Domain=");
		buffer.put_slice(domain.as_bytes());
	}

	if let Some(path) = cookie.some_path.as_deref() {
		buffer.put_slice(b"; Path=");
		buffer.put_slice(path.as_bytes());
	}

	if cookie.http_only {
		buffer.put_slice(b"; HttpOnly");
	}

	if cookie.secure || matches!(cookie.same_site, SameSite::Strict | SameSite::None) {
		buffer.put_slice(b"; Secure");
	}

	if let Some(same_site) = cookie.same_site.as_str() {
		buffer.put_slice(b"; SameSite=");
		buffer.put_slice(same_site.as_bytes());
	}

	buffer.freeze()
}

// --------------------------------------------------
// CookieError

#[derive(Debug, ImplError)]
pub enum CookieError {
	#[error("a cookie name cannot be empty")]
	EmptyName,
	#[error("the serialised cookie value exceeds {MAX_COOKIE_VALUE_SIZE} bytes")]
	ValueTooLarge,
	#[error("malformed cookie: {0}")]
	Malformed(&'static str),
}

impl From<CookieError> for HttpError {
	fn from(error: CookieError) -> Self {
		HttpError::bad_request(error.to_string())
	}
}

// --------------------------------------------------

/// Splits a `Cookie` request header into its decoded name/value pairs.
pub(crate) fn parse_cookie_header(value: &[u8]) -> Vec<(String, String)> {
	value
		.split(|ch| *ch == b';')
		.filter_map(|segment| {
			split_pair(segment)
				.filter(|(name, _)| !name.is_empty())
				.map(|(name, pair_value)| (decode(name), decode(pair_value)))
		})
		.collect()
}

// --------------------------------------------------

/// A `Set-Cookie` value that unsets the named cookie on the client.
pub(crate) fn write_removal_cookie(name: &str) -> Bytes {
	let cookie = Cookie::bare(name.to_owned(), String::new())
		.with_expires(SystemTime::UNIX_EPOCH + Duration::from_secs(1));

	write_cookie_for_response(&cookie)
}

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------
