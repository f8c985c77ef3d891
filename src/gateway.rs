//! The frame-level contract with an external HTTP gateway that already
//! frames messages: receive frames feed request bodies, response frames
//! carry the status, headers, and body back.

// ----------

use std::future::Future;

use bytes::Bytes;
use futures_util::StreamExt;

use crate::{errors::HttpError, messages::Response, scribe, BoxedError};

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------

// --------------------------------------------------
// Receive frames

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
	Request,
	Disconnect,
}

/// A request-body frame delivered by the gateway.
#[derive(Debug, Clone)]
pub struct ReceivedFrame {
	pub kind: FrameKind,
	pub body: Bytes,
	pub more_body: bool,
}

impl ReceivedFrame {
	#[inline(always)]
	pub fn request(body: Bytes, more_body: bool) -> Self {
		Self {
			kind: FrameKind::Request,
			body,
			more_body,
		}
	}

	/// The frame signalling that the client went away.
	#[inline(always)]
	pub fn disconnect() -> Self {
		Self {
			kind: FrameKind::Disconnect,
			body: Bytes::new(),
			more_body: false,
		}
	}
}

// --------------------------------------------------
// Response frames

#[derive(Debug)]
pub enum ResponseFrame {
	Start {
		status: u16,
		headers: Vec<(Bytes, Bytes)>,
	},
	Body {
		body: Bytes,
		more_body: bool,
	},
}

/// Sends a response through the gateway: one start frame, then body
/// frames, terminated by an empty `more_body = false` frame.
///
/// The content-header policy is applied before the start frame, so the
/// gateway sees the same headers a raw-socket client would. The gateway
/// owns the wire framing; chunked bodies are delivered as plain frames.
pub async fn send_response<SendFn, Fut>(
	response: &mut Response,
	mut send: SendFn,
) -> Result<(), HttpError>
where
	SendFn: FnMut(ResponseFrame) -> Fut,
	Fut: Future<Output = Result<(), BoxedError>>,
{
	let (headers, some_content) = response.headers_and_content();
	scribe::set_headers_for_content(headers, some_content);

	let headers = response
		.headers
		.iter()
		.map(|header| (header.name.clone(), header.value.clone()))
		.collect();

	send(ResponseFrame::Start {
		status: response.status,
		headers,
	})
	.await
	.map_err(HttpError::internal)?;

	let Some(content) = response.content_mut() else {
		return send(ResponseFrame::Body {
			body: Bytes::new(),
			more_body: false,
		})
		.await
		.map_err(HttpError::internal);
	};

	let mut chunks = content.stream()?;

	while let Some(chunk) = chunks.next().await {
		let chunk = chunk.map_err(HttpError::internal)?;

		if chunk.is_empty() {
			continue;
		}

		send(ResponseFrame::Body {
			body: chunk,
			more_body: true,
		})
		.await
		.map_err(HttpError::internal)?;
	}

	send(ResponseFrame::Body {
		body: Bytes::new(),
		more_body: false,
	})
	.await
	.map_err(HttpError::internal)
}

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------
