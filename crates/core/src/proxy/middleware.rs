//! Layers wrapped around the forwarding handler.
//!
//! From the outside in: panic recovery, access logging, CORS.

use std::any::Any;
use std::net::SocketAddr;
use std::time::Instant;

use axum::Router;
use axum::extract::{ConnectInfo, Request};
use axum::http::{HeaderValue, Method, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use tower_http::catch_panic::CatchPanicLayer;
use tracing::{debug, error};

const ALLOW_METHODS: &str = "GET, POST, PUT, DELETE, OPTIONS";
const ALLOW_HEADERS: &str = "Content-Type, Authorization, X-Requested-With";

/// Wraps `router` with recovery, logging and CORS.
pub fn apply(router: Router) -> Router {
	router
		.layer(middleware::from_fn(cors))
		.layer(middleware::from_fn(access_log))
		.layer(CatchPanicLayer::custom(panic_response))
}

/// Permissive development CORS; preflight requests never reach the backend.
pub async fn cors(req: Request, next: Next) -> Response {
	let mut response = if req.method() == Method::OPTIONS {
		StatusCode::OK.into_response()
	} else {
		next.run(req).await
	};

	let headers = response.headers_mut();
	headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
	headers.insert(header::ACCESS_CONTROL_ALLOW_METHODS, HeaderValue::from_static(ALLOW_METHODS));
	headers.insert(header::ACCESS_CONTROL_ALLOW_HEADERS, HeaderValue::from_static(ALLOW_HEADERS));
	headers.insert(header::ACCESS_CONTROL_ALLOW_CREDENTIALS, HeaderValue::from_static("true"));
	response
}

pub async fn access_log(req: Request, next: Next) -> Response {
	let method = req.method().clone();
	let path = req.uri().path().to_string();
	let remote = client_addr(&req);
	let started = Instant::now();

	let response = next.run(req).await;

	debug!(
		target = "nsm.proxy",
		%method,
		path = %path,
		status = response.status().as_u16(),
		duration_ms = started.elapsed().as_millis() as u64,
		remote_addr = %remote.map(|a| a.ip().to_string()).unwrap_or_default(),
		"request processed"
	);
	response
}

fn panic_response(err: Box<dyn Any + Send + 'static>) -> Response {
	let detail = if let Some(s) = err.downcast_ref::<String>() {
		s.clone()
	} else if let Some(s) = err.downcast_ref::<&str>() {
		s.to_string()
	} else {
		"unknown panic".to_string()
	};
	error!(target = "nsm.proxy", error = %detail, "panic in proxy handler");
	(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response()
}

/// Peer address stored on the request by the accept loop.
pub(crate) fn client_addr(req: &Request) -> Option<SocketAddr> {
	req.extensions().get::<ConnectInfo<SocketAddr>>().map(|info| info.0)
}
