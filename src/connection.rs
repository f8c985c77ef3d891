//! The server connection state machine.
//!
//! One [`ServerConnection`] drives one transport: bytes are fed to the
//! parser, a handler task is spawned as soon as a request's headers are
//! complete, the body streams into the request's inbox in the background,
//! and the response is written back through a shared, flow-controlled
//! transport handle.

// ----------

use std::{
	ops::ControlFlow,
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc,
	},
	time::{Duration, Instant},
};

use bytes::Bytes;
use futures_util::StreamExt;
use tokio::{
	io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf},
	sync::Notify,
	task::JoinHandle,
};
use tracing::{debug, warn};

use crate::{
	application::BaseApplication,
	errors::HttpError,
	headers::{Header, Headers},
	messages::{BodyInbox, Request, Response},
	parser::{HttpParser, ParserError, ParserEvent},
	scribe,
	url::Url,
	BoxedFuture,
};

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------

pub const MAX_REQUEST_HEADERS_COUNT: usize = 80;
pub const MAX_REQUEST_HEADER_SIZE: usize = 8192;

const DEFAULT_MAX_BODY_SIZE: usize = 24 * 1024 * 1024;
const DEFAULT_KEEP_ALIVE_TIMEOUT: Duration = Duration::from_secs(300);

const READ_BUFFER_SIZE: usize = 8192;

// The reader is only taken out of the run loop on an upgrade hand-off.
const READER_PRESENT: &str = "the reader is present until an upgrade";
const TRANSPORT_PRESENT: &str = "the transport is set while the connection runs";
const HANDLER_PRESENT: &str = "an unfinished request has a handler task";

const SWITCHING_PROTOCOLS_RESPONSE: &[u8] =
	b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n";

// --------------------------------------------------
// ConnectionOptions

/// Admission limits and timeouts of a single connection.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
	pub max_body_size: usize,
	pub keep_alive_timeout: Duration,
}

impl Default for ConnectionOptions {
	fn default() -> Self {
		Self {
			max_body_size: DEFAULT_MAX_BODY_SIZE,
			keep_alive_timeout: DEFAULT_KEEP_ALIVE_TIMEOUT,
		}
	}
}

impl ConnectionOptions {
	pub fn with_max_body_size(mut self, max_body_size: usize) -> Self {
		self.max_body_size = max_body_size;

		self
	}

	pub fn with_keep_alive_timeout(mut self, keep_alive_timeout: Duration) -> Self {
		self.keep_alive_timeout = keep_alive_timeout;

		self
	}
}

// --------------------------------------------------
// FlowGate

// An open/paused gate; writers and the read loop await it while paused.
#[derive(Debug, Default)]
struct FlowGate {
	paused: AtomicBool,
	notify: Notify,
}

impl FlowGate {
	fn pause(&self) {
		self.paused.store(true, Ordering::Release);
	}

	fn resume(&self) {
		self.paused.store(false, Ordering::Release);
		self.notify.notify_waiters();
	}

	fn is_paused(&self) -> bool {
		self.paused.load(Ordering::Acquire)
	}

	async fn wait_open(&self) {
		loop {
			if !self.is_paused() {
				return;
			}

			let notified = self.notify.notified();
			tokio::pin!(notified);
			notified.as_mut().enable();

			if !self.is_paused() {
				return;
			}

			notified.await;
		}
	}
}

// --------------------------------------------------
// TransportHandle

/// The shared write side of a connection: serialised writes behind a
/// flow-control gate, with an idempotent close that prevents any write
/// after connection loss.
pub struct TransportHandle {
	some_writer: tokio::sync::Mutex<Option<Box<dyn AsyncWrite + Send + Unpin>>>,
	writable: FlowGate,
	readable: FlowGate,
	closed: AtomicBool,
}

impl TransportHandle {
	pub fn new(writer: Box<dyn AsyncWrite + Send + Unpin>) -> Arc<Self> {
		Arc::new(Self {
			some_writer: tokio::sync::Mutex::new(Some(writer)),
			writable: FlowGate::default(),
			readable: FlowGate::default(),
			closed: AtomicBool::new(false),
		})
	}

	/// Writes the whole buffer, first awaiting the writable gate.
	pub async fn write(&self, data: &[u8]) -> Result<(), HttpError> {
		if self.is_closed() {
			return Err(HttpError::Aborted);
		}

		self.writable.wait_open().await;

		let mut guard = self.some_writer.lock().await;
		let Some(writer) = guard.as_mut() else {
			return Err(HttpError::Aborted);
		};

		if let Err(error) = writer.write_all(data).await {
			debug!(%error, "transport write failed");
			drop(guard);
			self.close().await;

			return Err(HttpError::Aborted);
		}

		writer.flush().await.map_err(|_| HttpError::Aborted)
	}

	pub fn pause_writing(&self) {
		self.writable.pause();
	}

	pub fn resume_writing(&self) {
		self.writable.resume();
	}

	pub fn pause_reading(&self) {
		self.readable.pause();
	}

	pub fn resume_reading(&self) {
		self.readable.resume();
	}

	pub(crate) async fn wait_readable(&self) {
		self.readable.wait_open().await;
	}

	#[inline(always)]
	pub fn is_closed(&self) -> bool {
		self.closed.load(Ordering::Acquire)
	}

	/// Closes the transport and nulls the writer. Safe to call repeatedly
	/// and from either the parser or the writer side.
	pub async fn close(&self) {
		if self.closed.swap(true, Ordering::AcqRel) {
			return;
		}

		// Wake anyone parked on the gate so they observe the closed flag.
		self.writable.resume();

		if let Some(mut writer) = self.some_writer.lock().await.take() {
			let _ = writer.shutdown().await;
		}
	}
}

// --------------------------------------------------
// Upgrades

/// A connection handed over after a `101 Switching Protocols` response.
pub struct UpgradedConnection {
	pub request: Request,
	/// Bytes that arrived beyond the upgrade request's head.
	pub leftover: Bytes,
	pub reader: Box<dyn AsyncRead + Send + Unpin>,
	pub transport: Arc<TransportHandle>,
}

pub type UpgradeHandler = Box<dyn FnOnce(UpgradedConnection) -> BoxedFuture<()> + Send>;

// --------------------------------------------------
// ServerConnection

struct HeadBuilder {
	method: Bytes,
	target: Bytes,
	headers: Headers,
}

struct CurrentRequest {
	inbox: Arc<BodyInbox>,
	some_handler: Option<JoinHandle<()>>,
	handler_done: bool,
	message_complete: bool,
	body_size: usize,
	ignore_more_body: bool,
}

enum FeedOutcome {
	Continue,
	Close,
	Upgrade,
}

enum Step {
	Read(usize),
	HandlerDone,
	Eof,
	TimedOut,
}

pub struct ServerConnection {
	app: Arc<BaseApplication>,
	options: ConnectionOptions,
	parser: HttpParser,
	some_transport: Option<Arc<TransportHandle>>,
	some_head: Option<HeadBuilder>,
	some_current: Option<CurrentRequest>,
	some_upgrade_handler: Option<UpgradeHandler>,
	some_upgrade_request: Option<Request>,
	upgrade_pending: bool,
	time_of_last_activity: Instant,
}

impl ServerConnection {
	pub fn new(app: Arc<BaseApplication>) -> Self {
		Self {
			app,
			options: ConnectionOptions::default(),
			parser: HttpParser::new(),
			some_transport: None,
			some_head: None,
			some_current: None,
			some_upgrade_handler: None,
			some_upgrade_request: None,
			upgrade_pending: false,
			time_of_last_activity: Instant::now(),
		}
	}

	pub fn with_options(mut self, options: ConnectionOptions) -> Self {
		self.options = options;

		self
	}

	/// Registers the handler that takes over after a websocket upgrade.
	pub fn with_upgrade_handler(mut self, upgrade_handler: UpgradeHandler) -> Self {
		self.some_upgrade_handler = Some(upgrade_handler);

		self
	}

	/// Drives the connection until it is closed, timed out, or upgraded.
	pub async fn run<IO>(mut self, io: IO)
	where
		IO: AsyncRead + AsyncWrite + Send + 'static,
	{
		let (reader, writer) = tokio::io::split(io);
		let mut some_reader = Some(reader);

		let transport = TransportHandle::new(Box::new(writer));
		self.some_transport = Some(transport.clone());
		self.time_of_last_activity = Instant::now();

		let mut read_buffer = vec![0u8; READ_BUFFER_SIZE];
		let mut events: Vec<ParserEvent> = Vec::new();

		loop {
			// A finished request/response cycle: drain is done, reset for
			// the next pipelined request or close.
			let cycle_finished = self
				.some_current
				.as_ref()
				.map(|current| current.handler_done && current.message_complete)
				.unwrap_or(false);

			if cycle_finished {
				if !self.parser.should_keep_alive() {
					self.dispose().await;

					return;
				}

				self.some_current = None;
				self.parser.reset();

				match self.feed(&[], &mut events).await {
					FeedOutcome::Continue => continue,
					FeedOutcome::Close => return,
					FeedOutcome::Upgrade => {
						let reader = some_reader.take().expect(READER_PRESENT);
						self.handle_upgrade(reader).await;

						return;
					}
				}
			}

			let step = self.next_step(&mut some_reader, &mut read_buffer, &transport).await;

			match step {
				Step::Read(read_count) => {
					self.time_of_last_activity = Instant::now();

					match self.feed(&read_buffer[..read_count], &mut events).await {
						FeedOutcome::Continue => {}
						FeedOutcome::Close => return,
						FeedOutcome::Upgrade => {
							let reader = some_reader.take().expect(READER_PRESENT);
							self.handle_upgrade(reader).await;

							return;
						}
					}
				}
				Step::HandlerDone => {
					if let Some(current) = self.some_current.as_mut() {
						current.handler_done = true;
						current.some_handler = None;

						// Late body bytes for the answered request drain
						// into the void before the next request is parsed.
						if !current.message_complete {
							current.ignore_more_body = true;
						}
					}
				}
				Step::Eof => {
					self.connection_lost().await;

					return;
				}
				Step::TimedOut => {
					debug!("closing the connection on keep-alive timeout");
					self.dispose().await;

					return;
				}
			}
		}
	}

	async fn next_step<IO>(
		&mut self,
		some_reader: &mut Option<ReadHalf<IO>>,
		read_buffer: &mut [u8],
		transport: &Arc<TransportHandle>,
	) -> Step
	where
		IO: AsyncRead + AsyncWrite + Send + 'static,
	{
		let reader = some_reader.as_mut().expect(READER_PRESENT);

		let handler_running = self
			.some_current
			.as_ref()
			.map(|current| !current.handler_done)
			.unwrap_or(false);

		if handler_running {
			let handler = self
				.some_current
				.as_mut()
				.expect(HANDLER_PRESENT)
				.some_handler
				.as_mut()
				.expect(HANDLER_PRESENT);

			tokio::select! {
				read_result = async {
					transport.wait_readable().await;

					reader.read(read_buffer).await
				} => match read_result {
					Ok(0) | Err(_) => Step::Eof,
					Ok(read_count) => Step::Read(read_count),
				},
				join_result = handler => {
					if let Err(join_error) = join_result {
						debug!(%join_error, "the handler task failed");
					}

					Step::HandlerDone
				}
			}
		} else {
			let read_with_gate = async {
				transport.wait_readable().await;

				reader.read(read_buffer).await
			};

			match tokio::time::timeout(self.options.keep_alive_timeout, read_with_gate).await {
				Err(_) => Step::TimedOut,
				Ok(Ok(0)) | Ok(Err(_)) => Step::Eof,
				Ok(Ok(read_count)) => Step::Read(read_count),
			}
		}
	}

	async fn feed(&mut self, data: &[u8], events: &mut Vec<ParserEvent>) -> FeedOutcome {
		events.clear();

		match self.parser.feed_data(data, events) {
			Ok(()) => match self.dispatch_events(events).await {
				ControlFlow::Continue(()) => FeedOutcome::Continue,
				ControlFlow::Break(()) => FeedOutcome::Close,
			},
			Err(ParserError::UpgradeRequest) => {
				// The head events were emitted before the error; the
				// request is materialised without spawning a handler.
				self.upgrade_pending = true;

				match self.dispatch_events(events).await {
					ControlFlow::Continue(()) => FeedOutcome::Upgrade,
					ControlFlow::Break(()) => FeedOutcome::Close,
				}
			}
			Err(parser_error) => {
				// Framing errors from misbehaving clients drop the
				// connection without a response.
				debug!(%parser_error, "dropping the connection");
				let _ = self.dispatch_events(events).await;
				self.dispose().await;

				FeedOutcome::Close
			}
		}
	}

	async fn dispatch_events(&mut self, events: &mut Vec<ParserEvent>) -> ControlFlow<()> {
		for event in events.drain(..) {
			match event {
				ParserEvent::RequestLine { method, target } => {
					self.some_head = Some(HeadBuilder {
						method,
						target,
						headers: Headers::new(),
					});
				}
				ParserEvent::Header { name, value } => {
					let breached = match self.some_head.as_mut() {
						None => continue,
						Some(head) => {
							if head.headers.len() >= MAX_REQUEST_HEADERS_COUNT
								|| value.len() > MAX_REQUEST_HEADER_SIZE
							{
								true
							} else {
								head.headers.add(Header { name, value });

								false
							}
						}
					};

					if breached {
						warn!("refusing a request with oversized headers");
						self.refuse(413).await;

						return ControlFlow::Break(());
					}
				}
				ParserEvent::HeadersComplete => {
					let Some(head) = self.some_head.take() else {
						continue;
					};

					let url = match Url::parse(&head.target) {
						Ok(url) => url,
						Err(invalid_url) => {
							warn!(%invalid_url, "refusing a request with an invalid target");
							self.refuse(400).await;

							return ControlFlow::Break(());
						}
					};

					let (request, inbox) = Request::incoming(head.method, url, head.headers);

					if self.upgrade_pending {
						self.some_upgrade_request = Some(request);

						continue;
					}

					let handler = tokio::spawn(handle_request(
						self.app.clone(),
						request,
						self.transport(),
					));

					self.some_current = Some(CurrentRequest {
						inbox,
						some_handler: Some(handler),
						handler_done: false,
						message_complete: false,
						body_size: 0,
						ignore_more_body: false,
					});
				}
				ParserEvent::Body(chunk) => {
					let overflowed = {
						let Some(current) = self.some_current.as_mut() else {
							continue;
						};

						if current.ignore_more_body {
							continue;
						}

						current.body_size += chunk.len();

						if current.body_size > self.options.max_body_size {
							current.ignore_more_body = true;

							true
						} else {
							current.inbox.push(&chunk);

							false
						}
					};

					if overflowed {
						warn!(
							max_body_size = self.options.max_body_size,
							"refusing a request with an oversized body",
						);
						self.refuse(400).await;

						return ControlFlow::Break(());
					}
				}
				ParserEvent::MessageComplete => {
					if let Some(current) = self.some_current.as_mut() {
						current.inbox.seal();
						current.message_complete = true;
					}
				}
			}
		}

		ControlFlow::Continue(())
	}

	async fn handle_upgrade<IO>(&mut self, reader: ReadHalf<IO>)
	where
		IO: AsyncRead + AsyncWrite + Send + 'static,
	{
		let some_request = self.some_upgrade_request.take();

		let is_websocket = self
			.parser
			.upgrade_protocol()
			.map(|protocol| protocol.eq_ignore_ascii_case(b"websocket"))
			.unwrap_or(false);

		let (Some(request), true, Some(upgrade_handler)) = (
			some_request,
			is_websocket,
			self.some_upgrade_handler.take(),
		) else {
			self.refuse(501).await;

			return;
		};

		let transport = self.transport();
		if transport.write(SWITCHING_PROTOCOLS_RESPONSE).await.is_err() {
			self.dispose().await;

			return;
		}

		let upgraded = UpgradedConnection {
			request,
			leftover: self.parser.take_buffered(),
			reader: Box::new(reader),
			transport,
		};

		upgrade_handler(upgraded).await;
	}

	// Writes a bare status response and disposes of the connection.
	async fn refuse(&mut self, status: u16) {
		let mut response = Response::new(status);

		if let Ok(data) = scribe::serialize_response(&mut response).await {
			let _ = self.transport().write(&data).await;
		}

		self.dispose().await;
	}

	async fn connection_lost(&mut self) {
		debug!("connection lost");
		self.dispose().await;
	}

	/// Aborts the current request, wakes its readers, and closes the
	/// transport. Idempotent.
	async fn dispose(&mut self) {
		if let Some(current) = self.some_current.take() {
			current.inbox.abort();

			if let Some(handler) = current.some_handler {
				// The handler observes the abort through its reads and
				// failed writes; it is left to finish on its own.
				drop(handler);
			}
		}

		self.some_head = None;
		self.some_upgrade_request = None;

		if let Some(transport) = self.some_transport.as_ref() {
			transport.close().await;
		}
	}

	#[inline(always)]
	fn transport(&self) -> Arc<TransportHandle> {
		self
			.some_transport
			.as_ref()
			.expect(TRANSPORT_PRESENT)
			.clone()
	}

	/// The instant of the last received buffer, for external idle reapers.
	#[inline(always)]
	pub fn time_of_last_activity(&self) -> Instant {
		self.time_of_last_activity
	}
}

// --------------------------------------------------

async fn handle_request(
	app: Arc<BaseApplication>,
	request: Request,
	transport: Arc<TransportHandle>,
) {
	if request.expect_100_continue() && transport.write(scribe::CONTINUE_RESPONSE).await.is_err() {
		return;
	}

	match app.handle(request).await {
		Ok(mut response) => {
			if let Err(error) = write_response(&mut response, &transport).await {
				debug!(%error, "failed to write the response");
				transport.close().await;
			}
		}
		Err(_aborted) => {
			// The connection is being disposed; there is nothing to write
			// and nowhere to write it.
		}
	}
}

/// Writes a response: one transport call for small bodies, streamed
/// frames behind the flow-control gate otherwise.
pub(crate) async fn write_response(
	response: &mut Response,
	transport: &TransportHandle,
) -> Result<(), HttpError> {
	if scribe::is_small_response(response) {
		let data = scribe::serialize_response(response).await?;

		return transport.write(&data).await;
	}

	let head = scribe::serialize_response_head(response);
	transport.write(&head).await?;

	let content = response
		.content_mut()
		.expect("responses outside the fast path carry content");
	let mut frames = scribe::body_frames(content)?;

	while let Some(frame) = frames.next().await {
		let frame = frame.map_err(HttpError::internal)?;
		transport.write(&frame).await?;
	}

	Ok(())
}

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------

#[cfg(test)]
mod test {
	use std::time::Duration;

	use futures_util::stream;
	use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

	use super::*;
	use crate::{
		application::{handler, MapRouter},
		content::Content,
	};

	// --------------------------------------------------------------------------------
	// --------------------------------------------------------------------------------

	fn hello_app() -> Arc<BaseApplication> {
		let router = MapRouter::new()
			.with(
				"GET",
				"/",
				handler(|_| async { Ok(Some(Response::new(200).with_content(Content::text("hi")))) }),
			)
			.with(
				"POST",
				"/echo",
				handler(|mut request: Request| async move {
					let body = request.read().await?;
					let echoed = String::from_utf8_lossy(&body).into_owned();

					Ok(Some(Response::new(200).with_content(Content::text(echoed))))
				}),
			)
			.with(
				"GET",
				"/stream",
				handler(|_| async {
					let content = Content::streamed("text/plain", None, || {
						stream::iter(vec![
							Ok(Bytes::from(vec![b'a'; 10])),
							Ok(Bytes::from(vec![b'b'; 10])),
						])
					});

					Ok(Some(Response::new(200).with_content(content)))
				}),
			);

		Arc::new(BaseApplication::new(Box::new(router)))
	}

	fn spawn_connection(app: Arc<BaseApplication>, options: ConnectionOptions) -> DuplexStream {
		let (client, server) = tokio::io::duplex(256 * 1024);

		tokio::spawn(ServerConnection::new(app).with_options(options).run(server));

		client
	}

	async fn read_available(client: &mut DuplexStream, at_least: usize) -> Vec<u8> {
		let mut received = Vec::new();
		let mut chunk = [0u8; 4096];

		while received.len() < at_least {
			match tokio::time::timeout(Duration::from_secs(5), client.read(&mut chunk)).await {
				Ok(Ok(0)) | Err(_) => break,
				Ok(Ok(read_count)) => received.extend_from_slice(&chunk[..read_count]),
				Ok(Err(_)) => break,
			}
		}

		received
	}

	// ----------

	#[tokio::test]
	async fn get_root() {
		let mut client = spawn_connection(hello_app(), ConnectionOptions::default());

		client
			.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n")
			.await
			.unwrap();

		let expected = b"HTTP/1.1 200 OK\r\n\
			Content-Type: text/plain; charset=utf-8\r\n\
			Content-Length: 2\r\n\
			\r\n\
			hi";

		let received = read_available(&mut client, expected.len()).await;
		assert_eq!(
			String::from_utf8_lossy(&received),
			String::from_utf8_lossy(expected),
		);
	}

	#[tokio::test]
	async fn handler_reads_body_fed_in_background() {
		let mut client = spawn_connection(hello_app(), ConnectionOptions::default());

		client
			.write_all(b"POST /echo HTTP/1.1\r\nHost: x\r\nContent-Length: 12\r\n\r\nhello,")
			.await
			.unwrap();

		// The handler is already running; the rest of the body arrives
		// later.
		tokio::time::sleep(Duration::from_millis(10)).await;
		client.write_all(b" world").await.unwrap();

		let received = read_available(&mut client, 64).await;
		let received = String::from_utf8_lossy(&received);

		assert!(received.starts_with("HTTP/1.1 200 OK\r\n"), "{}", received);
		assert!(received.ends_with("hello, world"), "{}", received);
	}

	#[tokio::test]
	async fn pipelined_requests_share_the_connection() {
		let mut client = spawn_connection(hello_app(), ConnectionOptions::default());

		client
			.write_all(
				b"GET / HTTP/1.1\r\nHost: x\r\n\r\nGET / HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n",
			)
			.await
			.unwrap();

		// The second request closes the connection; read to EOF.
		let received = read_available(&mut client, usize::MAX).await;
		let received = String::from_utf8_lossy(&received);

		assert_eq!(received.matches("HTTP/1.1 200 OK\r\n").count(), 2, "{}", received);
		assert_eq!(received.matches("hi").count(), 2, "{}", received);
	}

	#[tokio::test]
	async fn oversized_body_gets_400_and_close() {
		let options = ConnectionOptions::default().with_max_body_size(1024);
		let mut client = spawn_connection(hello_app(), options);

		client
			.write_all(b"POST /echo HTTP/1.1\r\nHost: x\r\nContent-Length: 26000000\r\n\r\n")
			.await
			.unwrap();

		let flood = vec![b'x'; 2048];
		client.write_all(&flood).await.unwrap();

		let received = read_available(&mut client, 16).await;
		let received = String::from_utf8_lossy(&received);

		assert!(received.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{}", received);

		// The connection is disposed; the client sees EOF on further reads.
		let mut probe = [0u8; 16];
		let _ = client.write_all(b"more").await;
		let eof = tokio::time::timeout(Duration::from_secs(5), client.read(&mut probe)).await;
		assert!(matches!(eof, Ok(Ok(0))), "{:?}", eof);
	}

	#[tokio::test]
	async fn oversized_header_gets_413() {
		let mut client = spawn_connection(hello_app(), ConnectionOptions::default());

		let mut request = Vec::from(&b"GET / HTTP/1.1\r\nX-Big: "[..]);
		request.extend(std::iter::repeat(b'x').take(MAX_REQUEST_HEADER_SIZE + 1));
		request.extend_from_slice(b"\r\n\r\n");

		client.write_all(&request).await.unwrap();

		let received = read_available(&mut client, 16).await;
		assert!(
			received.starts_with(b"HTTP/1.1 413 Payload Too Large\r\n"),
			"{}",
			String::from_utf8_lossy(&received),
		);
	}

	#[tokio::test]
	async fn expect_100_continue_gets_interim_response() {
		let mut client = spawn_connection(hello_app(), ConnectionOptions::default());

		client
			.write_all(
				b"POST /echo HTTP/1.1\r\nHost: x\r\nExpect: 100-continue\r\nContent-Length: 2\r\n\r\nok",
			)
			.await
			.unwrap();

		let received = read_available(&mut client, 64).await;
		let received = String::from_utf8_lossy(&received);

		assert!(received.starts_with("HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 200 OK\r\n"), "{}", received);
		assert!(received.ends_with("ok"), "{}", received);
	}

	#[tokio::test]
	async fn streamed_response_is_chunked() {
		let mut client = spawn_connection(hello_app(), ConnectionOptions::default());

		client
			.write_all(b"GET /stream HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n")
			.await
			.unwrap();

		let received = read_available(&mut client, usize::MAX).await;
		let received = String::from_utf8_lossy(&received);

		assert!(received.contains("Transfer-Encoding: chunked\r\n"), "{}", received);
		assert!(
			received.ends_with("a\r\naaaaaaaaaa\r\na\r\nbbbbbbbbbb\r\n0\r\n\r\n"),
			"{}",
			received,
		);
	}

	#[tokio::test]
	async fn aborted_request_wakes_the_handler() {
		let (sender, receiver) = tokio::sync::oneshot::channel::<bool>();
		let sender = std::sync::Mutex::new(Some(sender));

		let router = MapRouter::new().with(
			"POST",
			"/drain",
			handler(move |mut request: Request| {
				let sender = sender.lock().unwrap().take();

				async move {
					let aborted = matches!(request.read().await, Err(HttpError::Aborted));

					if let Some(sender) = sender {
						let _ = sender.send(aborted);
					}

					Err(HttpError::Aborted)
				}
			}),
		);

		let app = Arc::new(BaseApplication::new(Box::new(router)));
		let mut client = spawn_connection(app, ConnectionOptions::default());

		client
			.write_all(b"POST /drain HTTP/1.1\r\nHost: x\r\nContent-Length: 100\r\n\r\npartial")
			.await
			.unwrap();

		tokio::time::sleep(Duration::from_millis(10)).await;
		drop(client);

		let aborted = tokio::time::timeout(Duration::from_secs(5), receiver)
			.await
			.unwrap()
			.unwrap();
		assert!(aborted);
	}

	#[tokio::test]
	async fn keep_alive_timeout_closes_idle_connections() {
		let options =
			ConnectionOptions::default().with_keep_alive_timeout(Duration::from_millis(50));
		let mut client = spawn_connection(hello_app(), options);

		let mut probe = [0u8; 16];
		let eof = tokio::time::timeout(Duration::from_secs(5), client.read(&mut probe)).await;
		assert!(matches!(eof, Ok(Ok(0))), "{:?}", eof);
	}

	#[tokio::test]
	async fn websocket_upgrade_without_handler_gets_501() {
		let mut client = spawn_connection(hello_app(), ConnectionOptions::default());

		client
			.write_all(
				b"GET /chat HTTP/1.1\r\nHost: x\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\r\n",
			)
			.await
			.unwrap();

		let received = read_available(&mut client, 16).await;
		assert!(
			received.starts_with(b"HTTP/1.1 501 Not Implemented\r\n"),
			"{}",
			String::from_utf8_lossy(&received),
		);
	}

	#[tokio::test]
	async fn websocket_upgrade_with_handler_gets_101() {
		let (sender, receiver) = tokio::sync::oneshot::channel::<Bytes>();

		let upgrade_handler: UpgradeHandler = Box::new(move |upgraded: UpgradedConnection| {
			Box::pin(async move {
				let _ = sender.send(Bytes::copy_from_slice(&upgraded.request.url.path));
			})
		});

		let (mut client, server) = tokio::io::duplex(64 * 1024);
		tokio::spawn(
			ServerConnection::new(hello_app())
				.with_upgrade_handler(upgrade_handler)
				.run(server),
		);

		client
			.write_all(
				b"GET /chat HTTP/1.1\r\nHost: x\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\r\n",
			)
			.await
			.unwrap();

		let received = read_available(&mut client, 32).await;
		assert!(
			received.starts_with(b"HTTP/1.1 101 Switching Protocols\r\n"),
			"{}",
			String::from_utf8_lossy(&received),
		);

		let path = tokio::time::timeout(Duration::from_secs(5), receiver)
			.await
			.unwrap()
			.unwrap();
		assert_eq!(&path[..], b"/chat");
	}

	#[tokio::test]
	async fn paused_writes_resume() {
		let transport = TransportHandle::new(Box::new(tokio::io::sink()));

		transport.pause_writing();

		let write = {
			let transport = transport.clone();

			tokio::spawn(async move { transport.write(b"later").await })
		};

		tokio::time::sleep(Duration::from_millis(10)).await;
		assert!(!write.is_finished());

		transport.resume_writing();
		write.await.unwrap().unwrap();
	}

	#[tokio::test]
	async fn close_is_idempotent_and_blocks_writes() {
		let transport = TransportHandle::new(Box::new(tokio::io::sink()));

		transport.close().await;
		transport.close().await;

		assert!(transport.is_closed());
		assert!(matches!(
			transport.write(b"too late").await,
			Err(HttpError::Aborted),
		));
	}
}
