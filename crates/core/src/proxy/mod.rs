//! Single-backend reverse proxy terminating HTTPS (or plain HTTP) on the public port.

mod forward;
pub mod holding_page;
pub mod middleware;

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::ConnectInfo;
use axum::http::Request;
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use hyper_util::service::TowerToHyperService;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower::ServiceExt;
use tracing::{debug, info, warn};

use self::forward::Forwarder;
use self::holding_page::HoldingPage;
use crate::config::{LOOPBACK_HOST, SessionConfig};
use crate::error::{CertificateProblem, Error, Result};
use crate::ports::wait_until_listening;
use crate::tls::load_tls_config;

/// Default bound on the post-bind readiness probe.
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(10);

const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// What the proxy needs to know about the session.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
	pub backend_port: u16,
	pub https: bool,
	pub cert_path: Option<PathBuf>,
	pub key_path: Option<PathBuf>,
	pub domain: String,
	pub project_name: String,
	pub project_type: String,
}

impl ProxyConfig {
	pub fn from_session(config: &SessionConfig) -> Self {
		Self {
			backend_port: config.http_port,
			https: config.flags.https,
			cert_path: config.cert_path.clone(),
			key_path: config.key_path.clone(),
			domain: config.domain.clone(),
			project_name: config.project_name.clone(),
			project_type: config.project_type.to_string(),
		}
	}

	fn backend_addr(&self) -> SocketAddr {
		SocketAddr::from((Ipv4Addr::LOCALHOST, self.backend_port))
	}

	fn holding_page(&self) -> HoldingPage {
		HoldingPage {
			project_name: self.project_name.clone(),
			project_type: self.project_type.clone(),
			domain: self.domain.clone(),
			target: format!("http://{LOOPBACK_HOST}:{}", self.backend_port),
		}
	}

	fn tls_acceptor(&self) -> Result<TlsAcceptor> {
		let invalid = |reason| Error::CertificateInvalid {
			domain: self.domain.clone(),
			reason,
		};
		let (Some(cert), Some(key)) = (&self.cert_path, &self.key_path) else {
			return Err(invalid(CertificateProblem::Unreadable("no certificate configured".into())));
		};
		let config = load_tls_config(cert, key).map_err(invalid)?;
		Ok(TlsAcceptor::from(config))
	}
}

struct Serving {
	port: u16,
	shutdown: CancellationToken,
	/// Cancelled when the graceful drain runs out of time.
	force: CancellationToken,
	connections: TaskTracker,
	accept: JoinHandle<()>,
}

/// Reverse proxy for one session. Construct with [`ReverseProxy::new`], then [`ReverseProxy::start`].
pub struct ReverseProxy {
	config: ProxyConfig,
	ready_timeout: Duration,
	serving: Option<Serving>,
}

impl ReverseProxy {
	pub fn new(config: ProxyConfig) -> Self {
		Self {
			config,
			ready_timeout: DEFAULT_READY_TIMEOUT,
			serving: None,
		}
	}

	pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
		self.ready_timeout = timeout;
		self
	}

	pub fn config(&self) -> &ProxyConfig {
		&self.config
	}

	pub fn is_running(&self) -> bool {
		self.serving.is_some()
	}

	/// Port the proxy listens on, once started.
	pub fn local_port(&self) -> Option<u16> {
		self.serving.as_ref().map(|s| s.port)
	}

	/// Binds `port` (0 picks one), starts serving and waits until the port answers.
	///
	/// Returns the bound port. TLS material is loaded before binding so a bad
	/// certificate fails fast with [`Error::CertificateInvalid`].
	pub async fn start(&mut self, port: u16) -> Result<u16> {
		if let Some(serving) = &self.serving {
			debug!(target = "nsm.proxy", port = serving.port, "proxy already running");
			return Ok(serving.port);
		}

		let acceptor = if self.config.https { Some(self.config.tls_acceptor()?) } else { None };

		let forwarder = Arc::new(Forwarder::new(self.config.backend_addr(), self.config.https, self.config.holding_page()));
		let app = middleware::apply(Router::new().fallback(forward::forward).with_state(forwarder));

		let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, port))
			.await
			.map_err(|source| Error::ProxyBindFailed { port, source })?;
		let port = listener.local_addr()?.port();

		let shutdown = CancellationToken::new();
		let force = CancellationToken::new();
		let connections = TaskTracker::new();
		let accept = tokio::spawn(accept_loop(
			listener,
			acceptor,
			app,
			shutdown.clone(),
			force.clone(),
			connections.clone(),
		));
		self.serving = Some(Serving {
			port,
			shutdown,
			force,
			connections,
			accept,
		});

		if !wait_until_listening(port, self.ready_timeout).await {
			let _ = self.stop(Duration::ZERO).await;
			return Err(Error::ProxyStartTimeout {
				port,
				waited: self.ready_timeout,
			});
		}

		info!(
			target = "nsm.proxy",
			port,
			backend = %self.config.backend_addr(),
			tls = self.config.https,
			"reverse proxy started"
		);
		Ok(port)
	}

	/// Stops accepting, lets in-flight requests finish for up to `timeout`, then drops the rest.
	pub async fn stop(&mut self, timeout: Duration) -> Result<()> {
		let Some(serving) = self.serving.take() else {
			return Ok(());
		};
		info!(target = "nsm.proxy", port = serving.port, "stopping reverse proxy");

		serving.shutdown.cancel();
		let accept_result = serving.accept.await;
		serving.connections.close();

		let drained = tokio::time::timeout(timeout, serving.connections.wait()).await.is_ok();
		if !drained {
			serving.force.cancel();
			return Err(Error::ProxyShutdown(format!(
				"{} connection(s) still open after {timeout:?}",
				serving.connections.len()
			)));
		}
		accept_result.map_err(|e| Error::ProxyShutdown(format!("accept loop failed: {e}")))?;
		debug!(target = "nsm.proxy", "reverse proxy stopped");
		Ok(())
	}
}

impl Drop for ReverseProxy {
	fn drop(&mut self) {
		if let Some(serving) = &self.serving {
			serving.shutdown.cancel();
			serving.force.cancel();
		}
	}
}

async fn accept_loop(
	listener: TcpListener,
	acceptor: Option<TlsAcceptor>,
	app: Router,
	shutdown: CancellationToken,
	force: CancellationToken,
	connections: TaskTracker,
) {
	loop {
		let (stream, remote) = tokio::select! {
			_ = shutdown.cancelled() => break,
			accepted = listener.accept() => match accepted {
				Ok(conn) => conn,
				Err(e) => {
					warn!(target = "nsm.proxy", error = %e, "accept failed");
					tokio::time::sleep(ACCEPT_BACKOFF).await;
					continue;
				}
			},
		};

		let app = app.clone();
		let acceptor = acceptor.clone();
		let shutdown = shutdown.clone();
		let force = force.clone();
		connections.spawn(async move {
			match acceptor {
				None => serve_connection(stream, remote, app, shutdown, force).await,
				Some(acceptor) => match tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, acceptor.accept(stream)).await {
					Ok(Ok(tls)) => serve_connection(tls, remote, app, shutdown, force).await,
					Ok(Err(e)) => debug!(target = "nsm.proxy", %remote, error = %e, "TLS handshake failed"),
					Err(_) => debug!(target = "nsm.proxy", %remote, "TLS handshake timed out"),
				},
			}
		});
	}
	debug!(target = "nsm.proxy", "accept loop stopped");
}

async fn serve_connection<I>(io: I, remote: SocketAddr, app: Router, shutdown: CancellationToken, force: CancellationToken)
where
	I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
	let app = ServiceExt::<Request<Incoming>>::map_request(app, move |mut req: Request<Incoming>| {
		req.extensions_mut().insert(ConnectInfo(remote));
		req
	});
	let builder = auto::Builder::new(TokioExecutor::new());
	let conn = builder.serve_connection_with_upgrades(TokioIo::new(io), TowerToHyperService::new(app));
	tokio::pin!(conn);

	let result = tokio::select! {
		result = conn.as_mut() => result,
		_ = shutdown.cancelled() => {
			conn.as_mut().graceful_shutdown();
			tokio::select! {
				result = conn.as_mut() => result,
				_ = force.cancelled() => {
					debug!(target = "nsm.proxy", %remote, "dropping connection after shutdown grace");
					return;
				}
			}
		}
	};
	if let Err(e) = result {
		debug!(target = "nsm.proxy", %remote, error = %e, "connection closed with error");
	}
}

#[cfg(test)]
mod tests {
	use axum::http::{HeaderMap, StatusCode};
	use axum::routing::get;

	use super::*;

	fn config(backend_port: u16) -> ProxyConfig {
		ProxyConfig {
			backend_port,
			https: false,
			cert_path: None,
			key_path: None,
			domain: "localhost".into(),
			project_name: "shop".into(),
			project_type: "vite".into(),
		}
	}

	/// A port nothing listens on.
	fn closed_port() -> u16 {
		std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap().local_addr().unwrap().port()
	}

	async fn spawn_backend() -> u16 {
		let app = Router::new().route(
			"/echo",
			get(|headers: HeaderMap| async move {
				let get = |name: &str| headers.get(name).and_then(|v| v.to_str().ok()).unwrap_or("").to_string();
				format!("{}|{}|{}|{}", get("host"), get("x-forwarded-host"), get("x-forwarded-proto"), get("x-nsm-project"))
			}),
		);
		let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
		let port = listener.local_addr().unwrap().port();
		tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
		port
	}

	#[tokio::test]
	async fn unreachable_backend_yields_holding_page() {
		let mut proxy = ReverseProxy::new(config(closed_port()));
		let port = proxy.start(0).await.unwrap();
		assert!(proxy.is_running());

		let response = reqwest::get(format!("http://127.0.0.1:{port}/")).await.unwrap();
		assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
		assert!(response.text().await.unwrap().contains("Starting shop project"));

		proxy.stop(Duration::from_secs(2)).await.unwrap();
		assert!(!proxy.is_running());
	}

	#[tokio::test]
	async fn requests_are_forwarded_with_rewritten_headers() {
		let backend = spawn_backend().await;
		let mut proxy = ReverseProxy::new(config(backend));
		let port = proxy.start(0).await.unwrap();

		let response = reqwest::get(format!("http://127.0.0.1:{port}/echo")).await.unwrap();
		assert_eq!(response.status(), StatusCode::OK);
		assert_eq!(response.headers()["access-control-allow-origin"], "*");
		assert_eq!(response.text().await.unwrap(), format!("127.0.0.1:{backend}|127.0.0.1:{port}|http|shop"));

		proxy.stop(Duration::from_secs(2)).await.unwrap();
	}

	#[tokio::test]
	async fn busy_port_fails_to_bind() {
		let taken = std::net::TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0)).unwrap();
		let port = taken.local_addr().unwrap().port();
		let mut proxy = ReverseProxy::new(config(closed_port()));
		let err = proxy.start(port).await.unwrap_err();
		assert!(matches!(err, Error::ProxyBindFailed { port: p, .. } if p == port));
		assert!(!proxy.is_running());
	}

	#[tokio::test]
	async fn https_without_certificate_is_rejected_before_binding() {
		let mut cfg = config(closed_port());
		cfg.https = true;
		let mut proxy = ReverseProxy::new(cfg);
		let err = proxy.start(0).await.unwrap_err();
		assert!(matches!(err, Error::CertificateInvalid { .. }));
		assert!(proxy.local_port().is_none());
	}

	#[tokio::test]
	async fn stop_is_idempotent_and_releases_the_port() {
		let mut proxy = ReverseProxy::new(config(closed_port()));
		let port = proxy.start(0).await.unwrap();
		proxy.stop(Duration::from_secs(2)).await.unwrap();
		proxy.stop(Duration::from_secs(2)).await.unwrap();
		assert!(std::net::TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).is_ok());
	}
}
