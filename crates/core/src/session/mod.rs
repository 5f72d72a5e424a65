//! Session orchestration: setup pipeline, service start and ordered teardown.
//!
//! A [`Session`] owns every resource it acquires. [`Session::setup`] runs the
//! pipeline steps strictly in order, each bounded by the step timeout in
//! [`crate::config::Timeouts`]; [`Session::start_services`] brings up
//! the proxy and the development command; [`Session::shutdown`] tears
//! everything down in reverse and reports every failure it saw.

mod status;

use std::path::PathBuf;
use std::sync::Arc;

use nsm_protocol::{PORT_DESCRIPTOR_FILE, PortDescriptor, SessionEvent, StepName, StepStatus};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub use self::status::{SessionState, SessionStatus};
use crate::cert::{CertificateAuthority, CertificateProvider, Mkcert};
use crate::config::{FALLBACK_HTTPS_PORT, PRIVILEGED_HTTPS_PORT, SessionConfig};
use crate::dns::{self, DomainResolver, ResolverBackend};
use crate::error::{Error, Result};
use crate::events::EventBus;
use crate::ports::{PortAllocator, wait_until_listening};
use crate::process::ProcessSupervisor;
use crate::proxy::{ProxyConfig, ReverseProxy};

/// One orchestrated development session.
pub struct Session {
	config: SessionConfig,
	events: EventBus,
	ports: PortAllocator,
	/// Ports this session reserved, released on shutdown.
	claimed: Vec<u16>,
	authority: Option<Arc<dyn CertificateAuthority>>,
	dns_backend: Option<Arc<dyn ResolverBackend>>,
	certs: Option<CertificateProvider>,
	resolver: Option<DomainResolver>,
	proxy: Option<ReverseProxy>,
	supervisor: ProcessSupervisor,
	descriptor: Option<PathBuf>,
	state: SessionState,
}

impl Session {
	pub fn new(config: SessionConfig) -> Self {
		Self::with_events(config, EventBus::new())
	}

	pub fn with_events(config: SessionConfig, events: EventBus) -> Self {
		let supervisor = ProcessSupervisor::with_grace(events.clone(), config.timeouts.process_grace);
		Self {
			config,
			events,
			ports: PortAllocator::new(),
			claimed: Vec::new(),
			authority: None,
			dns_backend: None,
			certs: None,
			resolver: None,
			proxy: None,
			supervisor,
			descriptor: None,
			state: SessionState::Created,
		}
	}

	/// Uses `authority` instead of locating `mkcert`.
	pub fn with_certificate_authority(mut self, authority: Arc<dyn CertificateAuthority>) -> Self {
		self.authority = Some(authority);
		self
	}

	/// Uses `backend` instead of the platform's default resolver strategy.
	pub fn with_resolver_backend(mut self, backend: Arc<dyn ResolverBackend>) -> Self {
		self.dns_backend = Some(backend);
		self
	}

	pub fn config(&self) -> &SessionConfig {
		&self.config
	}

	pub fn events(&self) -> &EventBus {
		&self.events
	}

	pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
		self.events.subscribe()
	}

	pub fn state(&self) -> SessionState {
		self.state
	}

	pub fn ports(&self) -> &PortAllocator {
		&self.ports
	}

	pub fn status(&self) -> SessionStatus {
		SessionStatus {
			state: self.state,
			running: self.state.is_running(),
			project_name: self.config.project_name.clone(),
			project_type: self.config.project_type,
			domain: self.config.domain.clone(),
			url: self.config.public_url(),
			http_port: self.config.http_port,
			https_port: self.config.https_port,
			clean_urls: self.config.clean_urls(),
			https: self.config.flags.https,
			dns: self.config.flags.dns,
			dns_configured: self.resolver.as_ref().is_some_and(DomainResolver::is_configured),
			pid: self.supervisor.pid(),
			process_running: self.supervisor.is_running(),
		}
	}

	/// Runs setup and services, then waits for `cancel` and shuts down.
	///
	/// A failed start is reported as [`SessionEvent::Fatal`], torn down, and returned.
	pub async fn run(&mut self, cancel: CancellationToken) -> Result<()> {
		let started = tokio::select! {
			biased;
			_ = cancel.cancelled() => None,
			result = self.start() => Some(result),
		};

		match started {
			None => {
				info!(target = "nsm.session", "cancelled during startup");
				self.shutdown().await
			}
			Some(Ok(())) => {
				cancel.cancelled().await;
				info!(target = "nsm.session", "received shutdown signal");
				self.shutdown().await
			}
			Some(Err(err)) => {
				error!(target = "nsm.session", error = %err, "session failed to start");
				self.events.emit(SessionEvent::Fatal {
					message: err.to_string(),
					hints: err.remediation_hints(),
				});
				if let Err(teardown) = self.shutdown().await {
					warn!(target = "nsm.session", error = %teardown, "teardown after failed start reported errors");
				}
				Err(err)
			}
		}
	}

	/// [`Session::setup`] followed by [`Session::start_services`].
	pub async fn start(&mut self) -> Result<()> {
		self.setup().await?;
		self.start_services().await
	}

	/// Executes the setup pipeline. Stops at the first fatal step.
	pub async fn setup(&mut self) -> Result<()> {
		for step in StepName::PIPELINE {
			self.state = state_for(step);
			info!(target = "nsm.session", %step, "executing setup step");
			self.events.step(step, StepStatus::Loading, "In progress...");

			let limit = self.config.timeouts.step;
			// Dropping a timed-out step does not stop external commands it already spawned.
			let outcome = match tokio::time::timeout(limit, self.execute(step)).await {
				Ok(result) => result.map_err(|e| e.in_step(step)),
				Err(_) => Err(Error::StepTimeout { step, after: limit }),
			};

			match outcome {
				Ok(details) => self.events.step(step, StepStatus::Success, details),
				Err(err) => {
					self.events.step(step, StepStatus::Error, err.to_string());
					self.state = SessionState::Failed;
					return Err(err);
				}
			}
		}

		self.events.emit(SessionEvent::SetupComplete);
		Ok(())
	}

	async fn execute(&mut self, step: StepName) -> Result<String> {
		match step {
			StepName::Validate => self.validate().await,
			StepName::Ports => self.allocate_ports(),
			StepName::Certs => self.provision_certificate().await,
			StepName::Dns => Ok(self.configure_dns().await),
			StepName::Proxy | StepName::Dev => Err(Error::Validation(format!("{step} is not a setup step"))),
		}
	}

	async fn validate(&mut self) -> Result<String> {
		self.config.validate()?;
		if !self.config.project_dir.is_dir() {
			return Err(Error::Validation(format!(
				"project directory does not exist: {}",
				self.config.project_dir.display()
			)));
		}

		for dir in self.config.data_subdirs() {
			tokio::fs::create_dir_all(&dir)
				.await
				.map_err(|e| Error::Validation(format!("create directory {}: {e}", dir.display())))?;
		}

		if self.config.flags.https && self.certs.is_none() {
			let authority: Arc<dyn CertificateAuthority> = match &self.authority {
				Some(authority) => authority.clone(),
				None => Arc::new(Mkcert::locate()?),
			};
			self.certs = Some(CertificateProvider::new(self.config.cert_dir(), authority));
		}
		Ok("Completed".into())
	}

	fn allocate_ports(&mut self) -> Result<String> {
		let http = match self.config.http_port {
			0 => self.ports.allocate_free_port()?,
			pinned => self.ports.claim(pinned)?,
		};
		self.claimed.push(http);
		self.config.http_port = http;

		if self.config.flags.proxy {
			let public = self.public_port()?;
			self.claimed.push(public);
			self.config.https_port = public;
		}

		info!(
			target = "nsm.session",
			http = self.config.http_port,
			https = self.config.https_port,
			clean_urls = self.config.clean_urls(),
			"ports configured"
		);
		Ok(match self.config.https_port {
			0 => format!("HTTP {}", self.config.http_port),
			https => format!("HTTP {}, HTTPS {https}", self.config.http_port),
		})
	}

	fn public_port(&self) -> Result<u16> {
		if self.config.https_port != 0 {
			return self.ports.claim(self.config.https_port);
		}
		if !self.config.flags.prefer_privileged_port {
			return self.ports.allocate_near(FALLBACK_HTTPS_PORT);
		}
		if self.ports.can_bind_privileged_port() {
			info!(target = "nsm.session", "using port 443 for clean URLs");
			return self.ports.allocate_near(PRIVILEGED_HTTPS_PORT);
		}

		let port = self.ports.allocate_near(FALLBACK_HTTPS_PORT)?;
		warn!(target = "nsm.session", port, "port 443 unavailable, falling back");
		self.events.warning(format!(
			"Port {PRIVILEGED_HTTPS_PORT} is not available; URLs will include the port suffix :{port}"
		));
		Ok(port)
	}

	async fn provision_certificate(&mut self) -> Result<String> {
		if !self.config.flags.https {
			info!(target = "nsm.session", "HTTPS disabled, skipping certificate setup");
			return Ok("Skipped (HTTPS disabled)".into());
		}
		let Some(certs) = &self.certs else {
			return Err(Error::CertificateAuthorityMissing);
		};

		let record = certs.ensure_certificate(&self.config.domain, false).await?;
		self.config.cert_path = Some(record.cert_path);
		self.config.key_path = Some(record.key_path);
		let details = if record.created { "Created new certificate" } else { "Using existing certificate" };
		Ok(details.into())
	}

	/// Never fails: problems are downgraded to warnings.
	async fn configure_dns(&mut self) -> String {
		if !self.config.flags.dns || self.config.is_localhost() {
			info!(target = "nsm.session", "DNS setup skipped");
			return "Skipped".into();
		}

		let backend: Arc<dyn ResolverBackend> = match &self.dns_backend {
			Some(backend) => backend.clone(),
			None => Arc::from(dns::for_current_platform().await),
		};
		let resolver = self.resolver.insert(DomainResolver::new(&self.config.domain, backend));

		let outcome = match resolver.setup().await {
			Ok(()) => resolver.test().await,
			Err(err) => Err(err),
		};
		match outcome {
			Ok(()) => {
				info!(target = "nsm.session", domain = %self.config.domain, "DNS resolution configured");
				format!("{} resolves to loopback", self.config.domain)
			}
			Err(err) => {
				warn!(target = "nsm.session", error = %err, "DNS setup degraded, continuing without custom DNS");
				self.events.warning(format!("DNS: {err}"));
				format!("Degraded: {err}")
			}
		}
	}

	/// Starts the proxy (when enabled) and the development command.
	///
	/// The backend not becoming reachable in time is a warning: the proxy's
	/// holding page covers it.
	pub async fn start_services(&mut self) -> Result<()> {
		if self.config.flags.proxy {
			self.state = SessionState::StartingProxy;
			self.events.step(StepName::Proxy, StepStatus::Loading, StepName::Proxy.description());

			let mut proxy = ReverseProxy::new(ProxyConfig::from_session(&self.config)).with_ready_timeout(self.config.timeouts.proxy_ready);
			match proxy.start(self.config.https_port).await {
				Ok(port) => {
					self.proxy = Some(proxy);
					self.events.step(StepName::Proxy, StepStatus::Success, format!("Running on port {port}"));
				}
				Err(err) => return Err(self.fail(StepName::Proxy, err)),
			}
		}

		if let Err(err) = self.write_port_descriptor().await {
			warn!(target = "nsm.session", error = %err, "failed to write port descriptor");
		}

		self.state = SessionState::StartingBackend;
		self.events.step(StepName::Dev, StepStatus::Loading, StepName::Dev.description());
		let env = self.config.child_env();
		if let Err(err) = self.supervisor.start(&self.config.command, &self.config.project_dir, &env) {
			return Err(self.fail(StepName::Dev, err));
		}

		let port = self.config.http_port;
		let waited = self.config.timeouts.backend_ready;
		let exited = tokio::select! {
			ready = wait_until_listening(port, waited) => (!ready).then_some(None),
			code = self.supervisor.wait() => Some(code.flatten()),
		};
		match exited {
			None => {}
			Some(None) => {
				let err = Error::BackendNotReady { port, waited };
				warn!(target = "nsm.session", error = %err, "development server may not be ready");
				self.events.warning(err.to_string());
			}
			Some(Some(code)) => {
				warn!(target = "nsm.session", port, exit_code = code, "development server exited before accepting connections");
				self.events.warning(format!("Development server exited with code {code} before listening on port {port}"));
			}
		}

		self.events.step(StepName::Dev, StepStatus::Success, format!("Running on port {port}"));
		self.state = SessionState::Running;
		self.events.emit(SessionEvent::ServerStarted {
			http_port: self.config.http_port,
			https_port: self.config.https_port,
		});
		info!(target = "nsm.session", url = %self.config.public_url(), "session running");
		Ok(())
	}

	fn fail(&mut self, step: StepName, err: Error) -> Error {
		let err = err.in_step(step);
		self.events.step(step, StepStatus::Error, err.to_string());
		self.state = SessionState::Failed;
		err
	}

	async fn write_port_descriptor(&mut self) -> Result<()> {
		let path = self.config.project_dir.join(PORT_DESCRIPTOR_FILE);
		let descriptor = PortDescriptor::loopback(self.config.http_port, self.config.https_port);
		tokio::fs::write(&path, serde_json::to_vec_pretty(&descriptor)?).await?;
		debug!(target = "nsm.session", path = %path.display(), "wrote port descriptor");
		self.descriptor = Some(path);
		Ok(())
	}

	/// Tears down in reverse start order. Every step runs even when an earlier
	/// one fails; failures come back together as [`Error::ShutdownPartialFailure`].
	pub async fn shutdown(&mut self) -> Result<()> {
		if self.state == SessionState::Stopped {
			return Ok(());
		}
		info!(target = "nsm.session", "shutting down session");
		self.state = SessionState::ShuttingDown;
		let mut failures = Vec::new();

		if let Err(e) = self.supervisor.stop().await {
			failures.push(format!("stop development server: {e}"));
		}

		if let Some(mut proxy) = self.proxy.take() {
			if let Err(e) = proxy.stop(self.config.timeouts.proxy_shutdown).await {
				failures.push(format!("stop proxy server: {e}"));
			}
		}

		if let Some(mut resolver) = self.resolver.take() {
			if let Err(e) = resolver.cleanup().await {
				failures.push(format!("cleanup DNS: {e}"));
			}
		}

		for port in self.claimed.drain(..) {
			self.ports.release(port);
		}

		if let Some(path) = self.descriptor.take() {
			match tokio::fs::remove_file(&path).await {
				Ok(()) => debug!(target = "nsm.session", path = %path.display(), "removed port descriptor"),
				Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
				Err(e) => failures.push(format!("remove port descriptor {}: {e}", path.display())),
			}
		}

		self.state = SessionState::Stopped;
		if failures.is_empty() {
			info!(target = "nsm.session", "shutdown completed");
			return Ok(());
		}
		for failure in &failures {
			warn!(target = "nsm.session", error = %failure, "shutdown step failed");
		}
		Err(Error::ShutdownPartialFailure(failures))
	}
}

fn state_for(step: StepName) -> SessionState {
	match step {
		StepName::Validate => SessionState::Validating,
		StepName::Ports => SessionState::AllocatingPorts,
		StepName::Certs => SessionState::ProvisioningCertificate,
		StepName::Dns => SessionState::ConfiguringDns,
		StepName::Proxy => SessionState::StartingProxy,
		StepName::Dev => SessionState::StartingBackend,
	}
}
