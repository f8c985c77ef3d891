//! The error taxonomy of the core. Every variant that reaches the
//! application boundary is reified into an HTTP response by
//! [`BaseApplication`](crate::application::BaseApplication).

// ----------

use http::StatusCode;

use crate::{BoxedError, ImplError};

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------

#[derive(Debug, ImplError)]
pub enum HttpError {
	/// Malformed body or parameters.
	#[error("Bad Request: {reason}")]
	BadRequest {
		reason: String,
		some_details: Option<serde_json::Value>,
	},

	/// The content type declared a format the body does not parse as.
	#[error("cannot parse content as {expected}")]
	BadRequestFormat {
		expected: &'static str,
		#[source]
		source: BoxedError,
	},

	#[error("Resource not found")]
	NotFound,

	// Reserved for range-request support.
	#[error("Range Not Satisfiable")]
	RangeNotSatisfiable,

	/// An upgrade the server does not implement.
	#[error("Not Implemented")]
	NotImplementedByServer,

	/// The general handler-raised exception, carrying its HTTP status.
	#[error("{}", status_message(.status, .some_message))]
	Status {
		status: u16,
		some_message: Option<String>,
	},

	/// The connection was lost before the message was complete. Never
	/// written to the wire; the connection is disposed instead.
	#[error("the message was aborted before its body was complete")]
	Aborted,

	#[error("invalid operation: {0}")]
	InvalidOperation(&'static str),

	#[error("internal server error")]
	InternalServerError(#[source] BoxedError),
}

impl HttpError {
	#[inline(always)]
	pub fn bad_request<R: Into<String>>(reason: R) -> Self {
		Self::BadRequest {
			reason: reason.into(),
			some_details: None,
		}
	}

	#[inline(always)]
	pub fn internal<E: Into<BoxedError>>(error: E) -> Self {
		Self::InternalServerError(error.into())
	}

	pub fn status(&self) -> u16 {
		match self {
			Self::BadRequest { .. } | Self::BadRequestFormat { .. } => 400,
			Self::NotFound => 404,
			Self::RangeNotSatisfiable => 416,
			Self::NotImplementedByServer => 501,
			Self::Status { status, .. } => *status,
			// An aborted message never becomes a response; the status is
			// only ever used for logging.
			Self::Aborted => 400,
			Self::InvalidOperation(_) | Self::InternalServerError(_) => 500,
		}
	}

	#[inline(always)]
	pub fn is_aborted(&self) -> bool {
		matches!(self, Self::Aborted)
	}
}

// --------------------------------------------------

/// The standard reason phrase for a status code.
pub fn reason_phrase(status: u16) -> &'static str {
	StatusCode::from_u16(status)
		.ok()
		.and_then(|status_code| status_code.canonical_reason())
		.unwrap_or("Unknown Status")
}

fn status_message(status: &u16, some_message: &Option<String>) -> String {
	match some_message {
		Some(message) => message.clone(),
		None => reason_phrase(*status).to_owned(),
	}
}

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------
