#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use nsm::{CertificateAuthority, FeatureFlags, Result, SessionConfig, SessionEvent, Timeouts};
use rcgen::{CertificateParams, KeyPair};
use tempfile::TempDir;
use tokio::sync::broadcast;

/// Mints self-signed certificates with rcgen instead of shelling out to mkcert.
#[derive(Default)]
pub struct InProcessAuthority {
	pub mints: AtomicUsize,
}

impl InProcessAuthority {
	pub fn mint_count(&self) -> usize {
		self.mints.load(Ordering::SeqCst)
	}
}

#[async_trait]
impl CertificateAuthority for InProcessAuthority {
	async fn mint(&self, hosts: &[String], cert_path: &Path, key_path: &Path) -> Result<()> {
		self.mints.fetch_add(1, Ordering::SeqCst);
		write_pair(hosts, cert_path, key_path);
		Ok(())
	}

	async fn install_trust_root(&self) -> Result<()> {
		Ok(())
	}

	async fn trust_root_location(&self) -> Result<PathBuf> {
		Ok(PathBuf::from("/nonexistent/ca"))
	}
}

pub fn write_pair(hosts: &[String], cert_path: &Path, key_path: &Path) {
	let key = KeyPair::generate().unwrap();
	let cert = CertificateParams::new(hosts.to_vec()).unwrap().self_signed(&key).unwrap();
	std::fs::write(cert_path, cert.pem()).unwrap();
	std::fs::write(key_path, key.serialize_pem()).unwrap();
}

pub fn flags(https: bool, dns: bool, proxy: bool) -> FeatureFlags {
	FeatureFlags {
		https,
		dns,
		proxy,
		prefer_privileged_port: false,
	}
}

/// A port the OS just handed out and nothing holds.
pub fn free_port() -> u16 {
	std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap().local_addr().unwrap().port()
}

/// Public port is pinned so tests running side by side never probe the same range.
pub fn config(tmp: &TempDir, command: &str, domain: &str, flags: FeatureFlags) -> SessionConfig {
	let project = tmp.path().join("shop");
	std::fs::create_dir_all(&project).unwrap();
	SessionConfig::builder(&project)
		.command(command)
		.domain(domain)
		.data_dir(tmp.path().join("data"))
		.https_port(free_port())
		.flags(flags)
		.timeouts(Timeouts {
			backend_ready: Duration::from_millis(500),
			proxy_shutdown: Duration::from_secs(2),
			process_grace: Duration::from_secs(2),
			..Timeouts::default()
		})
		.build()
		.unwrap()
}

/// Receives until `pred` matches or `limit` elapses.
pub async fn wait_for(rx: &mut broadcast::Receiver<SessionEvent>, limit: Duration, pred: impl Fn(&SessionEvent) -> bool) -> Option<SessionEvent> {
	tokio::time::timeout(limit, async {
		loop {
			match rx.recv().await {
				Ok(event) if pred(&event) => return Some(event),
				Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
				Err(broadcast::error::RecvError::Closed) => return None,
			}
		}
	})
	.await
	.ok()
	.flatten()
}

/// Everything already queued on `rx`.
pub fn drain(rx: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
	std::iter::from_fn(|| rx.try_recv().ok()).collect()
}

pub fn insecure_client() -> reqwest::Client {
	reqwest::Client::builder().danger_accept_invalid_certs(true).build().unwrap()
}
