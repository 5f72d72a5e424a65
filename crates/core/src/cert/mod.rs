//! Per-domain TLS certificates kept in a local store directory.

mod authority;
mod validate;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

pub use self::authority::{CertificateAuthority, Mkcert};
pub use self::validate::{CertificateStatus, EXPIRY_WARNING, validate_certificate};
use crate::config::DEFAULT_DOMAIN;
use crate::error::{CertificateProblem, Error, Result};

/// Certificate and key for one domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CertificateRecord {
	pub domain: String,
	pub cert_path: PathBuf,
	pub key_path: PathBuf,
	/// `true` when the pair was minted by this call.
	pub created: bool,
}

/// A stored pair together with the outcome of validating it.
#[derive(Debug, Clone)]
pub struct StoredCertificate {
	pub domain: String,
	pub cert_path: PathBuf,
	pub key_path: PathBuf,
	pub validity: std::result::Result<CertificateStatus, CertificateProblem>,
}

impl StoredCertificate {
	pub fn not_after(&self) -> Option<DateTime<Utc>> {
		self.validity.as_ref().ok().map(|s| s.not_after)
	}
}

pub struct CertificateProvider {
	store: PathBuf,
	authority: Arc<dyn CertificateAuthority>,
}

impl CertificateProvider {
	pub fn new(store: impl Into<PathBuf>, authority: Arc<dyn CertificateAuthority>) -> Self {
		Self {
			store: store.into(),
			authority,
		}
	}

	/// Provider backed by `mkcert`; fails with [`Error::CertificateAuthorityMissing`] when it is not installed.
	pub fn with_mkcert(store: impl Into<PathBuf>) -> Result<Self> {
		Ok(Self::new(store, Arc::new(Mkcert::locate()?)))
	}

	pub fn store(&self) -> &Path {
		&self.store
	}

	/// `<store>/<domain>.pem` and `<store>/<domain>-key.pem`.
	pub fn paths_for(&self, domain: &str) -> (PathBuf, PathBuf) {
		(self.store.join(format!("{domain}.pem")), self.store.join(format!("{domain}-key.pem")))
	}

	/// Returns a valid pair for `domain`, reusing the stored one unless it fails
	/// validation or `force` is set.
	pub async fn ensure_certificate(&self, domain: &str, force: bool) -> Result<CertificateRecord> {
		let domain = if domain.is_empty() { DEFAULT_DOMAIN } else { domain };
		let (cert_path, key_path) = self.paths_for(domain);

		if !force && cert_path.is_file() && key_path.is_file() {
			match validate_certificate(&cert_path, &key_path, domain) {
				Ok(status) => {
					if status.expires_soon {
						warn!(target = "nsm.cert", domain, expires = %status.not_after, "certificate expires soon");
					}
					info!(target = "nsm.cert", domain, "using existing certificate");
					return Ok(CertificateRecord {
						domain: domain.to_string(),
						cert_path,
						key_path,
						created: false,
					});
				}
				Err(problem) => warn!(target = "nsm.cert", domain, error = %problem, "existing certificate is invalid, recreating"),
			}
		}

		tokio::fs::create_dir_all(&self.store).await?;
		info!(target = "nsm.cert", domain, "creating new certificate");
		self.authority.mint(&hosts_for(domain), &cert_path, &key_path).await?;

		if !cert_path.is_file() || !key_path.is_file() {
			return Err(Error::CertificateAuthority("certificate files not found after creation".into()));
		}
		validate_certificate(&cert_path, &key_path, domain).map_err(|reason| Error::CertificateInvalid {
			domain: domain.to_string(),
			reason,
		})?;

		Ok(CertificateRecord {
			domain: domain.to_string(),
			cert_path,
			key_path,
			created: true,
		})
	}

	/// Every complete pair in the store, validated against its own domain.
	pub fn list_certificates(&self) -> Result<Vec<StoredCertificate>> {
		let entries = match std::fs::read_dir(&self.store) {
			Ok(entries) => entries,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
			Err(e) => return Err(e.into()),
		};

		let mut certs = Vec::new();
		for entry in entries {
			let entry = entry?;
			if !entry.file_type()?.is_file() {
				continue;
			}
			let name = entry.file_name().to_string_lossy().into_owned();
			let Some(domain) = name.strip_suffix(".pem").filter(|_| !name.ends_with("-key.pem")) else {
				continue;
			};

			let (cert_path, key_path) = self.paths_for(domain);
			if !key_path.is_file() {
				continue;
			}
			let validity = validate_certificate(&cert_path, &key_path, domain);
			certs.push(StoredCertificate {
				domain: domain.to_string(),
				cert_path,
				key_path,
				validity,
			});
		}
		certs.sort_by(|a, b| a.domain.cmp(&b.domain));
		Ok(certs)
	}

	/// Deletes every pair that no longer validates; returns the affected domains.
	pub fn cleanup_expired(&self) -> Result<Vec<String>> {
		let mut removed = Vec::new();
		for cert in self.list_certificates()? {
			let Err(problem) = &cert.validity else {
				continue;
			};
			info!(target = "nsm.cert", domain = %cert.domain, error = %problem, "removing invalid certificate");
			for path in [&cert.cert_path, &cert.key_path] {
				if let Err(e) = std::fs::remove_file(path) {
					debug!(target = "nsm.cert", path = %path.display(), error = %e, "remove failed");
				}
			}
			removed.push(cert.domain);
		}
		Ok(removed)
	}

	pub async fn install_trust_root(&self) -> Result<()> {
		self.authority.install_trust_root().await
	}

	pub async fn trust_root_location(&self) -> Result<PathBuf> {
		self.authority.trust_root_location().await
	}
}

/// Names placed in the certificate; `localhost` also covers the loopback addresses.
fn hosts_for(domain: &str) -> Vec<String> {
	let mut hosts = vec![domain.to_string()];
	if domain == DEFAULT_DOMAIN {
		hosts.push("127.0.0.1".to_string());
		hosts.push("::1".to_string());
	}
	hosts
}
