//! Loading PEM certificate/key pairs into a rustls server configuration.

use std::path::Path;
use std::sync::Arc;

use rustls::ServerConfig;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};

use crate::error::CertificateProblem;

/// Builds a TLS 1.2/1.3 server configuration from `cert_path` and `key_path`.
///
/// Fails when either file is unreadable, holds no usable PEM, or when the key
/// does not belong to the end-entity certificate.
pub fn load_tls_config(cert_path: &Path, key_path: &Path) -> Result<Arc<ServerConfig>, CertificateProblem> {
	let cert_pem = std::fs::read(cert_path).map_err(|e| CertificateProblem::Unreadable(format!("{}: {e}", cert_path.display())))?;
	let key_pem = std::fs::read(key_path).map_err(|e| CertificateProblem::Unreadable(format!("{}: {e}", key_path.display())))?;

	let certs = CertificateDer::pem_slice_iter(&cert_pem)
		.collect::<Result<Vec<_>, _>>()
		.map_err(|e| CertificateProblem::MalformedPem(e.to_string()))?;
	if certs.is_empty() {
		return Err(CertificateProblem::MalformedPem("no certificates found".into()));
	}
	let key = PrivateKeyDer::from_pem_slice(&key_pem).map_err(|e| CertificateProblem::KeyMismatch(format!("failed to parse private key: {e}")))?;

	let provider = Arc::new(rustls::crypto::ring::default_provider());
	let mut config = ServerConfig::builder_with_provider(provider)
		.with_safe_default_protocol_versions()
		.map_err(|e| CertificateProblem::KeyMismatch(e.to_string()))?
		.with_no_client_auth()
		.with_single_cert(certs, key)
		.map_err(|e| CertificateProblem::KeyMismatch(e.to_string()))?;
	config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
	Ok(Arc::new(config))
}
