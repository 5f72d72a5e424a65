//! Local name resolution for the session domain.

mod backend;
mod hosts;

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

pub use self::backend::{
	DnsmasqBackend, FORWARDER_PORT, MANAGED_LABELS, ManualBackend, ResolverBackend, dnsmasq_config, for_current_platform, resolver_hint,
};
pub use self::hosts::{HostsOverlay, loopback_entry};
use crate::config::DEFAULT_DOMAIN;
use crate::error::{Error, Result};

/// Bound on a verification lookup.
pub const LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Registers one domain with a [`ResolverBackend`] and can verify or undo it.
pub struct DomainResolver {
	domain: String,
	tld: String,
	configured: bool,
	backend: Arc<dyn ResolverBackend>,
}

impl DomainResolver {
	pub fn new(domain: &str, backend: Arc<dyn ResolverBackend>) -> Self {
		let domain = if domain.is_empty() { DEFAULT_DOMAIN.to_string() } else { domain.to_string() };
		Self {
			tld: top_level_label(&domain).to_string(),
			domain,
			configured: false,
			backend,
		}
	}

	pub fn domain(&self) -> &str {
		&self.domain
	}

	pub fn tld(&self) -> &str {
		&self.tld
	}

	pub fn is_configured(&self) -> bool {
		self.configured
	}

	/// Registers the domain. `localhost` needs nothing.
	pub async fn setup(&mut self) -> Result<()> {
		if self.domain == DEFAULT_DOMAIN {
			debug!(target = "nsm.dns", "skipping DNS setup for localhost");
			return Ok(());
		}

		info!(target = "nsm.dns", domain = %self.domain, backend = self.backend.name(), "setting up DNS resolution");
		self.backend.configure(&self.domain, &self.tld).await?;
		self.configured = true;
		Ok(())
	}

	/// Resolves the domain and requires at least one loopback address.
	pub async fn test(&self) -> Result<()> {
		if self.domain == DEFAULT_DOMAIN {
			return Ok(());
		}

		let lookup = tokio::net::lookup_host((self.domain.as_str(), 0));
		let addrs: Vec<_> = match tokio::time::timeout(LOOKUP_TIMEOUT, lookup).await {
			Ok(Ok(addrs)) => addrs.map(|a| a.ip()).collect(),
			Ok(Err(e)) => return Err(Error::DomainConfigurationFailed(format!("DNS lookup for {} failed: {e}", self.domain))),
			Err(_) => return Err(Error::DomainConfigurationFailed(format!("DNS lookup for {} timed out", self.domain))),
		};

		if let Some(ip) = addrs.iter().find(|ip| ip.is_loopback()) {
			debug!(target = "nsm.dns", domain = %self.domain, %ip, "DNS resolution working");
			return Ok(());
		}
		Err(Error::DomainNotLoopback {
			domain: self.domain.clone(),
			addresses: addrs.iter().map(ToString::to_string).collect(),
		})
	}

	/// Removes what [`DomainResolver::setup`] added. Safe to call repeatedly.
	pub async fn cleanup(&mut self) -> Result<()> {
		if !self.configured {
			return Ok(());
		}
		info!(target = "nsm.dns", domain = %self.domain, "cleaning up DNS configuration");
		self.backend.unconfigure(&self.domain).await?;
		self.configured = false;
		Ok(())
	}
}

/// Last dot-separated label, or empty for single-label names.
pub fn top_level_label(domain: &str) -> &str {
	match domain.rsplit_once('.') {
		Some((_, tld)) => tld,
		None => "",
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::{AtomicUsize, Ordering};

	use async_trait::async_trait;
	use tempfile::TempDir;

	use super::*;

	#[derive(Default)]
	struct CountingBackend {
		configured: AtomicUsize,
		unconfigured: AtomicUsize,
	}

	#[async_trait]
	impl ResolverBackend for CountingBackend {
		fn name(&self) -> &'static str {
			"counting"
		}

		async fn configure(&self, _domain: &str, _tld: &str) -> Result<()> {
			self.configured.fetch_add(1, Ordering::SeqCst);
			Ok(())
		}

		async fn unconfigure(&self, _domain: &str) -> Result<()> {
			self.unconfigured.fetch_add(1, Ordering::SeqCst);
			Ok(())
		}
	}

	#[test]
	fn tld_is_last_label() {
		assert_eq!(top_level_label("shop.dev"), "dev");
		assert_eq!(top_level_label("api.shop.test"), "test");
		assert_eq!(top_level_label("localhost"), "");
	}

	#[tokio::test]
	async fn localhost_is_never_configured() {
		let backend = Arc::new(CountingBackend::default());
		let mut resolver = DomainResolver::new("", backend.clone());
		assert_eq!(resolver.domain(), "localhost");
		resolver.setup().await.unwrap();
		resolver.test().await.unwrap();
		resolver.cleanup().await.unwrap();
		assert_eq!(backend.configured.load(Ordering::SeqCst), 0);
		assert_eq!(backend.unconfigured.load(Ordering::SeqCst), 0);
	}

	#[tokio::test]
	async fn cleanup_runs_once_after_setup() {
		let backend = Arc::new(CountingBackend::default());
		let mut resolver = DomainResolver::new("shop.dev", backend.clone());
		resolver.cleanup().await.unwrap();
		assert_eq!(backend.unconfigured.load(Ordering::SeqCst), 0);

		resolver.setup().await.unwrap();
		assert!(resolver.is_configured());
		resolver.cleanup().await.unwrap();
		resolver.cleanup().await.unwrap();
		assert_eq!(backend.unconfigured.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn dnsmasq_setup_and_cleanup_round_trip_the_overlay() {
		let tmp = TempDir::new().unwrap();
		let backend = Arc::new(DnsmasqBackend::new(tmp.path().join("dnsmasq.conf"), tmp.path().join("dnsmasq.hosts")));
		let mut resolver = DomainResolver::new("shop.dev", backend.clone());

		resolver.setup().await.unwrap();
		assert!(backend.overlay().contains("shop.dev").unwrap());
		resolver.cleanup().await.unwrap();
		assert!(!backend.overlay().contains("shop.dev").unwrap());
	}

	#[tokio::test]
	async fn unresolvable_domain_fails_the_test() {
		let resolver = DomainResolver::new("nsm-does-not-exist.invalid", Arc::new(ManualBackend));
		assert!(resolver.test().await.is_err());
	}
}
