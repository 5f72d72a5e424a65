//! External certificate authorities that mint locally-trusted certificates.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Issues certificates trusted by the local machine.
#[async_trait]
pub trait CertificateAuthority: Send + Sync {
	/// Writes a certificate covering `hosts` to `cert_path` and its key to `key_path`.
	async fn mint(&self, hosts: &[String], cert_path: &Path, key_path: &Path) -> Result<()>;

	/// Installs the authority's root into the system trust stores.
	async fn install_trust_root(&self) -> Result<()>;

	/// Directory holding the authority's root certificate.
	async fn trust_root_location(&self) -> Result<PathBuf>;
}

/// [`CertificateAuthority`] backed by the `mkcert` binary.
#[derive(Debug, Clone)]
pub struct Mkcert {
	bin: PathBuf,
}

impl Mkcert {
	/// Finds `mkcert` on `PATH`.
	pub fn locate() -> Result<Self> {
		let bin = which::which("mkcert").map_err(|_| Error::CertificateAuthorityMissing)?;
		debug!(target = "nsm.cert", bin = %bin.display(), "found mkcert");
		Ok(Self { bin })
	}

	pub fn with_binary(bin: impl Into<PathBuf>) -> Self {
		Self { bin: bin.into() }
	}

	pub fn is_installed() -> bool {
		which::which("mkcert").is_ok()
	}

	async fn run(&self, args: &[&str]) -> Result<String> {
		let output = Command::new(&self.bin)
			.args(args)
			.output()
			.await
			.map_err(|e| Error::CertificateAuthority(format!("failed to run {}: {e}", self.bin.display())))?;

		if !output.status.success() {
			let stderr = String::from_utf8_lossy(&output.stderr);
			let stdout = String::from_utf8_lossy(&output.stdout);
			return Err(Error::CertificateAuthority(format!(
				"mkcert {} exited with {}: {}",
				args.first().copied().unwrap_or_default(),
				output.status,
				format!("{stdout}{stderr}").trim()
			)));
		}
		Ok(String::from_utf8_lossy(&output.stdout).into_owned())
	}
}

#[async_trait]
impl CertificateAuthority for Mkcert {
	async fn mint(&self, hosts: &[String], cert_path: &Path, key_path: &Path) -> Result<()> {
		let cert = cert_path.to_string_lossy();
		let key = key_path.to_string_lossy();
		let mut args = vec!["-cert-file", cert.as_ref(), "-key-file", key.as_ref()];
		args.extend(hosts.iter().map(String::as_str));

		info!(target = "nsm.cert", hosts = ?hosts, "minting certificate with mkcert");
		self.run(&args).await.map(|_| ())
	}

	async fn install_trust_root(&self) -> Result<()> {
		info!(target = "nsm.cert", "installing mkcert CA");
		self.run(&["-install"]).await.map(|_| ())
	}

	async fn trust_root_location(&self) -> Result<PathBuf> {
		let out = self.run(&["-CAROOT"]).await?;
		Ok(PathBuf::from(out.trim()))
	}
}
