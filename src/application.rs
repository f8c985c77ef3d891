//! The application boundary: dispatches a parsed request to a route match
//! and reifies every failure into an HTTP response.

// ----------

use std::{collections::HashMap, future::Future, sync::Arc};

use bytes::Bytes;
use tracing::error;

use crate::{
	content::Content,
	errors::{reason_phrase, HttpError},
	messages::{Request, Response},
	BoxedFuture, StdError,
};

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------

pub type DynRequestHandler =
	dyn Fn(Request) -> BoxedFuture<Result<Option<Response>, HttpError>> + Send + Sync;

pub type DynExceptionHandler =
	dyn Fn(&HttpError) -> BoxedFuture<Result<Response, HttpError>> + Send + Sync;

/// Boxes an async request handler.
pub fn handler<Func, Fut>(func: Func) -> Arc<DynRequestHandler>
where
	Func: Fn(Request) -> Fut + Send + Sync + 'static,
	Fut: Future<Output = Result<Option<Response>, HttpError>> + Send + 'static,
{
	Arc::new(move |request| Box::pin(func(request)))
}

/// Boxes an async exception handler.
pub fn exception_handler<Func, Fut>(func: Func) -> Arc<DynExceptionHandler>
where
	Func: Fn(&HttpError) -> Fut + Send + Sync + 'static,
	Fut: Future<Output = Result<Response, HttpError>> + Send + 'static,
{
	Arc::new(move |error| Box::pin(func(error)))
}

// --------------------------------------------------
// Router

/// The routing collaborator: resolves a method and path to a handler and
/// its route values.
pub trait Router: Send + Sync {
	fn find(&self, method: &[u8], path: &[u8]) -> Option<RouteMatch>;
}

pub struct RouteMatch {
	pub handler: Arc<DynRequestHandler>,
	pub route_values: HashMap<String, String>,
}

/// A minimal exact-match router, enough for tests and small tools.
#[derive(Default)]
pub struct MapRouter {
	routes: Vec<(Bytes, Bytes, Arc<DynRequestHandler>)>,
}

impl MapRouter {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn add<M, P>(&mut self, method: M, path: P, route_handler: Arc<DynRequestHandler>)
	where
		M: AsRef<[u8]>,
		P: AsRef<[u8]>,
	{
		self.routes.push((
			Bytes::copy_from_slice(method.as_ref()),
			Bytes::copy_from_slice(path.as_ref()),
			route_handler,
		));
	}

	pub fn with<M, P>(mut self, method: M, path: P, route_handler: Arc<DynRequestHandler>) -> Self
	where
		M: AsRef<[u8]>,
		P: AsRef<[u8]>,
	{
		self.add(method, path, route_handler);

		self
	}
}

impl Router for MapRouter {
	fn find(&self, method: &[u8], path: &[u8]) -> Option<RouteMatch> {
		self
			.routes
			.iter()
			.find(|(route_method, route_path, _)| {
				route_method == method && route_path == path
			})
			.map(|(_, _, route_handler)| RouteMatch {
				handler: route_handler.clone(),
				route_values: HashMap::new(),
			})
	}
}

// --------------------------------------------------
// BaseApplication

pub struct BaseApplication {
	router: Box<dyn Router>,
	exception_handlers: HashMap<u16, Arc<DynExceptionHandler>>,
	show_error_details: bool,
}

impl BaseApplication {
	pub fn new(router: Box<dyn Router>) -> Self {
		Self {
			router,
			exception_handlers: HashMap::new(),
			show_error_details: false,
		}
	}

	/// Renders a diagnostic page instead of the terse default on 500s.
	pub fn with_error_details(mut self) -> Self {
		self.show_error_details = true;

		self
	}

	/// Registers an exception handler for the HTTP status.
	pub fn with_exception_handler(
		mut self,
		status: u16,
		exception_handler: Arc<DynExceptionHandler>,
	) -> Self {
		self.exception_handlers.insert(status, exception_handler);

		self
	}

	/// Handles one request. The only failure that escapes is
	/// [`HttpError::Aborted`], which the connection swallows while
	/// disposing.
	pub async fn handle(&self, mut request: Request) -> Result<Response, HttpError> {
		let Some(route_match) = self.router.find(&request.method, &request.url.path) else {
			return self.handle_error(HttpError::NotFound).await;
		};

		request.route_values = route_match.route_values;

		match (route_match.handler)(request).await {
			Ok(Some(response)) => Ok(response),
			Ok(None) => Ok(Response::new(204)),
			Err(error) => self.handle_error(error).await,
		}
	}

	async fn handle_error(&self, error: HttpError) -> Result<Response, HttpError> {
		if error.is_aborted() {
			return Err(HttpError::Aborted);
		}

		let Some(registered) = self.exception_handlers.get(&error.status()) else {
			return Ok(self.build_error_response(&error));
		};

		match registered(&error).await {
			Ok(response) => Ok(response),
			// A failing handler is routed through the same mechanism once;
			// a second failure falls through to the built-ins.
			Err(second_error) => {
				if second_error.is_aborted() {
					return Err(HttpError::Aborted);
				}

				match self.exception_handlers.get(&second_error.status()) {
					Some(second_registered) => match second_registered(&second_error).await {
						Ok(response) => Ok(response),
						Err(third_error) => Ok(self.build_error_response(&third_error)),
					},
					None => Ok(self.build_error_response(&second_error)),
				}
			}
		}
	}

	fn build_error_response(&self, error: &HttpError) -> Response {
		let status = error.status();

		match error {
			HttpError::BadRequest {
				reason,
				some_details,
			} => {
				let content = match some_details {
					Some(details) => Content::json(details)
						.unwrap_or_else(|_| Content::text(format!("Bad Request: {}", reason))),
					None => Content::text(format!("Bad Request: {}", reason)),
				};

				Response::new(400).with_content(content)
			}
			HttpError::BadRequestFormat { .. } => {
				Response::new(400).with_content(Content::text(format!("Bad Request: {}", error)))
			}
			HttpError::NotFound => {
				Response::new(404).with_content(Content::text("Resource not found"))
			}
			HttpError::InvalidOperation(_) | HttpError::InternalServerError(_) => {
				error!(%error, "internal server error");

				if self.show_error_details {
					Response::new(500).with_content(Content::html(diagnostic_page(error)))
				} else {
					Response::new(500).with_content(Content::text("Internal server error."))
				}
			}
			_ => Response::new(status).with_content(Content::text(reason_phrase(status))),
		}
	}
}

// An HTML page carrying the error and its source chain.
fn diagnostic_page(error: &HttpError) -> String {
	let mut chain = String::new();
	let mut some_source = error.source();

	while let Some(source) = some_source {
		chain.push_str(&format!("<li>{}</li>", escape_html(&source.to_string())));
		some_source = source.source();
	}

	format!(
		"<!DOCTYPE html>\n<html><head><title>Internal server error</title></head>\
		<body><h1>Internal server error</h1><p>{}</p><ol>{}</ol></body></html>",
		escape_html(&error.to_string()),
		chain,
	)
}

fn escape_html(value: &str) -> String {
	value
		.replace('&', "&amp;")
		.replace('<', "&lt;")
		.replace('>', "&gt;")
}

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------

#[cfg(test)]
mod test {
	use super::*;
	use crate::url::Url;

	// --------------------------------------------------------------------------------
	// --------------------------------------------------------------------------------

	fn request(method: &str, path: &[u8]) -> Request {
		Request::new(method, Url::parse(path).unwrap())
	}

	fn hello_app() -> BaseApplication {
		let router = MapRouter::new()
			.with(
				"GET",
				"/",
				handler(|_| async { Ok(Some(Response::new(200).with_content(Content::text("hi")))) }),
			)
			.with("GET", "/none", handler(|_| async { Ok(None) }))
			.with(
				"GET",
				"/teapot",
				handler(|_| async {
					Err(HttpError::Status {
						status: 418,
						some_message: None,
					})
				}),
			)
			.with(
				"GET",
				"/boom",
				handler(|_| async { Err(HttpError::internal(std::fmt::Error)) }),
			);

		BaseApplication::new(Box::new(router))
	}

	// ----------

	#[tokio::test]
	async fn routes_and_handles() {
		let app = hello_app();

		let mut response = app.handle(request("GET", b"/")).await.unwrap();
		assert_eq!(response.status, 200);
		assert_eq!(&response.read().await.unwrap()[..], b"hi");
	}

	#[tokio::test]
	async fn none_becomes_204() {
		let app = hello_app();

		let response = app.handle(request("GET", b"/none")).await.unwrap();
		assert_eq!(response.status, 204);
		assert!(response.content().is_none());
	}

	#[tokio::test]
	async fn no_match_becomes_404() {
		let app = hello_app();

		let mut response = app.handle(request("GET", b"/missing")).await.unwrap();
		assert_eq!(response.status, 404);
		assert_eq!(&response.read().await.unwrap()[..], b"Resource not found");
	}

	#[tokio::test]
	async fn status_errors_get_reason_text() {
		let app = hello_app();

		let mut response = app.handle(request("GET", b"/teapot")).await.unwrap();
		assert_eq!(response.status, 418);
		assert_eq!(&response.read().await.unwrap()[..], b"I'm a teapot");
	}

	#[tokio::test]
	async fn internal_errors_become_500() {
		let app = hello_app();

		let mut response = app.handle(request("GET", b"/boom")).await.unwrap();
		assert_eq!(response.status, 500);
		assert_eq!(&response.read().await.unwrap()[..], b"Internal server error.");
	}

	#[tokio::test]
	async fn diagnostic_page_with_details() {
		let app = hello_app().with_error_details();

		let mut response = app.handle(request("GET", b"/boom")).await.unwrap();
		assert_eq!(response.status, 500);

		let page = response.text().await.unwrap();
		assert!(page.contains("<h1>Internal server error</h1>"));
	}

	#[tokio::test]
	async fn registered_exception_handler_wins() {
		let app = hello_app().with_exception_handler(
			418,
			exception_handler(|_| async {
				Ok(Response::new(200).with_content(Content::text("short and stout")))
			}),
		);

		let mut response = app.handle(request("GET", b"/teapot")).await.unwrap();
		assert_eq!(response.status, 200);
		assert_eq!(&response.read().await.unwrap()[..], b"short and stout");
	}

	#[tokio::test]
	async fn failing_exception_handler_is_rerouted_once() {
		let app = hello_app().with_exception_handler(
			418,
			exception_handler(|_| async { Err(HttpError::NotFound) }),
		);

		// 418 handler fails with NotFound; no 404 handler is registered,
		// so the built-in renders it.
		let mut response = app.handle(request("GET", b"/teapot")).await.unwrap();
		assert_eq!(response.status, 404);
		assert_eq!(&response.read().await.unwrap()[..], b"Resource not found");
	}

	#[tokio::test]
	async fn bad_request_with_details_is_json() {
		let router = MapRouter::new().with(
			"GET",
			"/validate",
			handler(|_| async {
				Err(HttpError::BadRequest {
					reason: "invalid payload".to_owned(),
					some_details: Some(serde_json::json!({"field": "name"})),
				})
			}),
		);

		let app = BaseApplication::new(Box::new(router));

		let mut response = app.handle(request("GET", b"/validate")).await.unwrap();
		assert_eq!(response.status, 400);
		assert_eq!(
			response.content().unwrap().media_type(),
			"application/json",
		);

		let details: serde_json::Value = response.json().await.unwrap();
		assert_eq!(details["field"], "name");
	}

	#[tokio::test]
	async fn aborted_errors_escape() {
		let router = MapRouter::new().with(
			"GET",
			"/aborted",
			handler(|_| async { Err(HttpError::Aborted) }),
		);

		let app = BaseApplication::new(Box::new(router));

		assert!(matches!(
			app.handle(request("GET", b"/aborted")).await,
			Err(HttpError::Aborted),
		));
	}
}
