//! Per-platform ways of pointing a domain at loopback.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::hosts::{HostsOverlay, loopback_entry};
use crate::error::{Error, Result};

/// Port the managed dnsmasq instance listens on.
pub const FORWARDER_PORT: u16 = 5353;

/// Top-level labels answered locally by the forwarder.
pub const MANAGED_LABELS: [&str; 4] = ["dev", "test", "local", "app"];

/// Strategy used by [`super::DomainResolver`] to register and unregister a domain.
#[async_trait]
pub trait ResolverBackend: Send + Sync {
	fn name(&self) -> &'static str;

	/// Makes `domain` (whose last label is `tld`) resolve to loopback.
	async fn configure(&self, domain: &str, tld: &str) -> Result<()>;

	/// Undoes the mapping added by [`ResolverBackend::configure`].
	async fn unconfigure(&self, domain: &str) -> Result<()>;
}

/// Picks the strategy for the running OS.
pub async fn for_current_platform() -> Box<dyn ResolverBackend> {
	if cfg!(target_os = "macos") {
		Box::new(DnsmasqBackend::macos().await)
	} else if cfg!(target_os = "linux") {
		Box::new(DnsmasqBackend::linux())
	} else {
		Box::new(ManualBackend)
	}
}

/// Renders the forwarder configuration pointing at `hosts_path`.
pub fn dnsmasq_config(hosts_path: &Path) -> String {
	let mut out = String::from("# NSM dnsmasq configuration\n");
	out.push_str(&format!("port={FORWARDER_PORT}\nlisten-address=127.0.0.1\nbind-interfaces\n\n"));
	out.push_str("# Handle local development domains\n");
	for label in MANAGED_LABELS {
		out.push_str(&format!("local=/{label}/\n"));
	}
	out.push_str(&format!("\n# Additional hosts file\naddn-hosts={}\n\n", hosts_path.display()));
	out.push_str("# Upstream DNS servers\nserver=1.1.1.1\nserver=1.0.0.1\nserver=8.8.8.8\n\n");
	out.push_str("# Cache settings\ncache-size=1000\nneg-ttl=60\n\n");
	out.push_str("# Don't read /etc/hosts\nno-hosts\n\n# Don't poll /etc/resolv.conf\nno-poll\n");
	out
}

/// Content of a per-label resolver hint file.
pub fn resolver_hint() -> String {
	format!("nameserver 127.0.0.1\nport {FORWARDER_PORT}\n")
}

/// Drives a local dnsmasq forwarder through its config and hosts overlay files.
#[derive(Debug, Clone)]
pub struct DnsmasqBackend {
	config_path: PathBuf,
	overlay: HostsOverlay,
	/// Directory of per-label resolver hints (`/etc/resolver` on macOS).
	resolver_dir: Option<PathBuf>,
	/// Service-control commands tried in order until one succeeds.
	restart: Vec<Vec<String>>,
	require_binary: bool,
	/// Domains whose overlay entry was written here; only those are removed again.
	added: Arc<Mutex<HashSet<String>>>,
}

impl DnsmasqBackend {
	pub fn new(config_path: impl Into<PathBuf>, hosts_path: impl Into<PathBuf>) -> Self {
		Self {
			config_path: config_path.into(),
			overlay: HostsOverlay::new(hosts_path),
			resolver_dir: None,
			restart: Vec::new(),
			require_binary: false,
			added: Arc::default(),
		}
	}

	pub fn resolver_dir(mut self, dir: impl Into<PathBuf>) -> Self {
		self.resolver_dir = Some(dir.into());
		self
	}

	pub fn restart_with(mut self, command: &[&str]) -> Self {
		self.restart.push(command.iter().map(|s| s.to_string()).collect());
		self
	}

	/// Fail configuration when `dnsmasq` is not on `PATH`.
	pub fn require_binary(mut self) -> Self {
		self.require_binary = true;
		self
	}

	/// Homebrew layout: files under `$(brew --prefix)/etc`, hints in `/etc/resolver`.
	pub async fn macos() -> Self {
		let etc = match brew_prefix().await {
			Some(prefix) => prefix.join("etc"),
			None => PathBuf::from("/etc"),
		};
		Self::new(etc.join("dnsmasq.conf"), etc.join("dnsmasq.hosts"))
			.resolver_dir("/etc/resolver")
			.restart_with(&["brew", "services", "restart", "dnsmasq"])
			.restart_with(&["sudo", "-n", "systemctl", "restart", "dnsmasq"])
			.restart_with(&["sudo", "-n", "service", "dnsmasq", "restart"])
			.require_binary()
	}

	pub fn linux() -> Self {
		Self::new("/etc/dnsmasq.conf", "/etc/dnsmasq.hosts")
			.restart_with(&["sudo", "-n", "systemctl", "restart", "dnsmasq"])
			.restart_with(&["sudo", "-n", "service", "dnsmasq", "restart"])
			.require_binary()
	}

	pub fn overlay(&self) -> &HostsOverlay {
		&self.overlay
	}

	fn ensure_config(&self) -> std::io::Result<()> {
		if let Ok(existing) = std::fs::read_to_string(&self.config_path) {
			if existing.contains(&format!("port={FORWARDER_PORT}")) {
				debug!(target = "nsm.dns", file = %self.config_path.display(), "dnsmasq config already managed");
				return Ok(());
			}
		}
		std::fs::write(&self.config_path, dnsmasq_config(self.overlay.path()))?;
		info!(target = "nsm.dns", file = %self.config_path.display(), "wrote dnsmasq configuration");
		Ok(())
	}

	fn write_resolver_hint(&self, tld: &str) -> std::io::Result<()> {
		let Some(dir) = &self.resolver_dir else {
			return Ok(());
		};
		if tld.is_empty() || !dir.is_dir() {
			debug!(target = "nsm.dns", dir = %dir.display(), "no resolver directory, skipping hint");
			return Ok(());
		}

		let file = dir.join(tld);
		let port = FORWARDER_PORT.to_string();
		if let Ok(existing) = std::fs::read_to_string(&file) {
			if existing.contains("127.0.0.1") && existing.contains(&port) {
				return Ok(());
			}
		}
		std::fs::write(&file, resolver_hint())?;
		info!(target = "nsm.dns", file = %file.display(), "created resolver hint");
		Ok(())
	}

	async fn restart_service(&self) -> bool {
		for command in &self.restart {
			let Some((program, args)) = command.split_first() else {
				continue;
			};
			let status = Command::new(program)
				.args(args)
				.stdin(Stdio::null())
				.stdout(Stdio::null())
				.stderr(Stdio::null())
				.status()
				.await;
			if matches!(status, Ok(s) if s.success()) {
				debug!(target = "nsm.dns", via = %command.join(" "), "restarted dnsmasq");
				return true;
			}
		}
		self.restart.is_empty()
	}
}

#[async_trait]
impl ResolverBackend for DnsmasqBackend {
	fn name(&self) -> &'static str {
		"dnsmasq"
	}

	async fn configure(&self, domain: &str, tld: &str) -> Result<()> {
		if self.require_binary && which::which("dnsmasq").is_err() {
			return Err(Error::DomainConfigurationFailed("dnsmasq not installed".into()));
		}

		self.ensure_config()
			.map_err(|e| Error::DomainConfigurationFailed(format!("dnsmasq config {}: {e}", self.config_path.display())))?;
		self.overlay
			.ensure_exists()
			.map_err(|e| Error::DomainConfigurationFailed(format!("dnsmasq hosts {}: {e}", self.overlay.path().display())))?;

		if let Err(e) = self.write_resolver_hint(tld) {
			warn!(target = "nsm.dns", tld, error = %e, "failed to create resolver hint");
		}

		let added = self
			.overlay
			.add(domain)
			.map_err(|e| Error::DomainConfigurationFailed(format!("add hosts entry: {e}")))?;
		if added {
			self.added.lock().insert(domain.to_string());
		}

		if !self.restart_service().await {
			warn!(target = "nsm.dns", "failed to restart dnsmasq");
		}
		Ok(())
	}

	async fn unconfigure(&self, domain: &str) -> Result<()> {
		if !self.added.lock().contains(domain) {
			debug!(target = "nsm.dns", domain, "hosts entry predates this session, keeping it");
			return Ok(());
		}
		self.overlay
			.remove(domain)
			.map_err(|e| Error::DomainConfigurationFailed(format!("remove hosts entry: {e}")))?;
		self.added.lock().remove(domain);
		Ok(())
	}
}

/// Fallback for platforms without automatic configuration: tells the user what to add.
#[derive(Debug, Clone, Copy, Default)]
pub struct ManualBackend;

#[async_trait]
impl ResolverBackend for ManualBackend {
	fn name(&self) -> &'static str {
		"manual"
	}

	async fn configure(&self, domain: &str, _tld: &str) -> Result<()> {
		warn!(target = "nsm.dns", "DNS auto-configuration not supported on this platform");
		info!(target = "nsm.dns", "add this line to your hosts file: {}", loopback_entry(domain));
		Ok(())
	}

	async fn unconfigure(&self, _domain: &str) -> Result<()> {
		Ok(())
	}
}

async fn brew_prefix() -> Option<PathBuf> {
	let output = Command::new("brew").arg("--prefix").stderr(Stdio::null()).output().await.ok()?;
	if !output.status.success() {
		return None;
	}
	let prefix = String::from_utf8_lossy(&output.stdout).trim().to_string();
	(!prefix.is_empty()).then(|| PathBuf::from(prefix))
}
