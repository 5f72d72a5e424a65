//! Request forwarding to the single backend.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use axum::http::uri::Authority;
use axum::http::{StatusCode, Uri, Version};
use axum::response::{IntoResponse, Response};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tracing::{debug, warn};

use super::holding_page::HoldingPage;
use super::middleware::client_addr;

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");
const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");
const X_NSM_VERSION: HeaderName = HeaderName::from_static("x-nsm-version");
const X_NSM_PROJECT: HeaderName = HeaderName::from_static("x-nsm-project");

/// Connection-scoped headers never copied between hops.
const HOP_BY_HOP: [HeaderName; 8] = [
	header::CONNECTION,
	HeaderName::from_static("keep-alive"),
	header::PROXY_AUTHENTICATE,
	header::PROXY_AUTHORIZATION,
	header::TE,
	header::TRAILER,
	header::TRANSFER_ENCODING,
	header::UPGRADE,
];

/// Shared state of the forwarding handler.
pub struct Forwarder {
	client: Client<HttpConnector, Body>,
	/// `host:port` of the backend.
	authority: String,
	scheme: &'static str,
	project: HeaderValue,
	holding: HoldingPage,
}

impl Forwarder {
	pub fn new(backend: SocketAddr, https: bool, holding: HoldingPage) -> Self {
		let project = HeaderValue::from_str(&holding.project_name).unwrap_or_else(|_| HeaderValue::from_static("unknown"));
		Self {
			client: Client::builder(TokioExecutor::new()).build_http(),
			authority: backend.to_string(),
			scheme: if https { "https" } else { "http" },
			project,
			holding,
		}
	}

	fn backend_uri(&self, original: &Uri) -> Result<Uri, axum::http::Error> {
		let path = original.path_and_query().map(|p| p.as_str()).unwrap_or("/");
		Uri::builder().scheme("http").authority(self.authority.as_str()).path_and_query(path).build()
	}

	/// Adds forwarding and identity headers and points `Host` at the backend.
	///
	/// `authority` is the request URI's authority; HTTP/2 carries the host
	/// there (`:authority`) instead of in a `Host` header.
	fn rewrite_headers(&self, headers: &mut HeaderMap, authority: Option<&Authority>, client: Option<SocketAddr>) {
		let original_host = headers
			.get(header::HOST)
			.cloned()
			.or_else(|| authority.and_then(|a| HeaderValue::from_str(a.as_str()).ok()));
		if let Some(host) = original_host {
			headers.insert(X_FORWARDED_HOST, host);
		}
		headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static(self.scheme));

		if let Some(addr) = client {
			let ip = addr.ip().to_string();
			let value = match headers.get(&X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
				Some(prior) if !prior.is_empty() => format!("{prior}, {ip}"),
				_ => ip,
			};
			if let Ok(value) = HeaderValue::from_str(&value) {
				headers.insert(X_FORWARDED_FOR, value);
			}
		}

		headers.insert(X_NSM_VERSION, HeaderValue::from_static(crate::VERSION));
		headers.insert(X_NSM_PROJECT, self.project.clone());
		if let Ok(host) = HeaderValue::from_str(&self.authority) {
			headers.insert(header::HOST, host);
		}
	}
}

/// Fallback handler: every request goes to the backend.
pub async fn forward(State(fwd): State<Arc<Forwarder>>, req: Request) -> Response {
	if is_upgrade(req.headers()) {
		return tunnel(fwd, req).await;
	}

	let client = client_addr(&req);
	let (mut parts, body) = req.into_parts();
	let authority = parts.uri.authority().cloned();
	parts.uri = match fwd.backend_uri(&parts.uri) {
		Ok(uri) => uri,
		Err(e) => return (StatusCode::BAD_REQUEST, format!("Invalid request URI: {e}")).into_response(),
	};
	parts.version = Version::HTTP_11;
	strip_hop_by_hop(&mut parts.headers);
	fwd.rewrite_headers(&mut parts.headers, authority.as_ref(), client);

	match fwd.client.request(Request::from_parts(parts, body)).await {
		Ok(response) => {
			let (mut parts, body) = response.into_parts();
			strip_hop_by_hop(&mut parts.headers);
			Response::from_parts(parts, Body::new(body))
		}
		Err(e) if e.is_connect() => {
			debug!(target = "nsm.proxy", backend = %fwd.authority, error = %e, "backend not accepting connections");
			(&fwd.holding).into_response()
		}
		Err(e) => {
			warn!(target = "nsm.proxy", backend = %fwd.authority, error = %e, "proxy error");
			(StatusCode::BAD_GATEWAY, "Bad Gateway").into_response()
		}
	}
}

/// Relays an `Upgrade` handshake and then splices both connections together.
async fn tunnel(fwd: Arc<Forwarder>, mut req: Request) -> Response {
	let client = client_addr(&req);
	let uri = match fwd.backend_uri(req.uri()) {
		Ok(uri) => uri,
		Err(e) => return (StatusCode::BAD_REQUEST, format!("Invalid request URI: {e}")).into_response(),
	};

	let mut backend_req = Request::builder().method(req.method().clone()).uri(uri);
	if let Some(headers) = backend_req.headers_mut() {
		headers.extend(req.headers().iter().map(|(k, v)| (k.clone(), v.clone())));
		fwd.rewrite_headers(headers, req.uri().authority(), client);
	}
	let backend_req = match backend_req.body(Body::empty()) {
		Ok(r) => r,
		Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
	};

	let mut backend_res = match fwd.client.request(backend_req).await {
		Ok(res) => res,
		Err(e) => {
			warn!(target = "nsm.proxy", backend = %fwd.authority, error = %e, "upgrade request failed");
			return (StatusCode::BAD_GATEWAY, "Bad Gateway").into_response();
		}
	};

	if backend_res.status() != StatusCode::SWITCHING_PROTOCOLS {
		let (parts, body) = backend_res.into_parts();
		return Response::from_parts(parts, Body::new(body));
	}

	let mut response = Response::builder().status(StatusCode::SWITCHING_PROTOCOLS);
	if let Some(headers) = response.headers_mut() {
		headers.extend(backend_res.headers().iter().map(|(k, v)| (k.clone(), v.clone())));
	}

	let client_upgrade = hyper::upgrade::on(&mut req);
	tokio::spawn(async move {
		let backend_upgrade = hyper::upgrade::on(&mut backend_res);
		match tokio::try_join!(client_upgrade, backend_upgrade) {
			Ok((client_io, backend_io)) => {
				debug!(target = "nsm.proxy", "upgrade tunnel established");
				let mut client_io = TokioIo::new(client_io);
				let mut backend_io = TokioIo::new(backend_io);
				if let Err(e) = tokio::io::copy_bidirectional(&mut client_io, &mut backend_io).await {
					debug!(target = "nsm.proxy", error = %e, "upgrade tunnel closed with error");
				}
			}
			Err(e) => warn!(target = "nsm.proxy", error = %e, "failed to upgrade connections"),
		}
	});

	response.body(Body::empty()).unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response())
}

fn is_upgrade(headers: &HeaderMap) -> bool {
	headers.contains_key(header::UPGRADE)
		&& headers
			.get_all(header::CONNECTION)
			.iter()
			.filter_map(|v| v.to_str().ok())
			.flat_map(|v| v.split(','))
			.any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
	// Headers named in `Connection` are hop-by-hop as well.
	let named: Vec<HeaderName> = headers
		.get_all(header::CONNECTION)
		.iter()
		.filter_map(|v| v.to_str().ok())
		.flat_map(|v| v.split(','))
		.filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
		.collect();
	for name in named.iter().chain(HOP_BY_HOP.iter()) {
		headers.remove(name);
	}
}
