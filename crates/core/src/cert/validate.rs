use std::net::IpAddr;
use std::path::Path;

use chrono::{DateTime, TimeDelta, Utc};
use x509_parser::extensions::GeneralName;
use x509_parser::pem::parse_x509_pem;

use crate::error::CertificateProblem;
use crate::tls::load_tls_config;

/// Certificates expiring within this window still pass but are flagged.
pub const EXPIRY_WARNING: TimeDelta = TimeDelta::days(30);

/// Result of a passing validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateStatus {
	pub not_after: DateTime<Utc>,
	pub expires_soon: bool,
}

/// Runs the checks in order: PEM/X.509 decoding, expiry, hostname coverage, key pairing.
pub fn validate_certificate(cert_path: &Path, key_path: &Path, domain: &str) -> Result<CertificateStatus, CertificateProblem> {
	validate_certificate_at(cert_path, key_path, domain, Utc::now())
}

pub(crate) fn validate_certificate_at(
	cert_path: &Path,
	key_path: &Path,
	domain: &str,
	now: DateTime<Utc>,
) -> Result<CertificateStatus, CertificateProblem> {
	let raw = std::fs::read(cert_path).map_err(|e| CertificateProblem::Unreadable(format!("{}: {e}", cert_path.display())))?;
	let (_, pem) = parse_x509_pem(&raw).map_err(|e| CertificateProblem::MalformedPem(e.to_string()))?;
	let cert = pem.parse_x509().map_err(|e| CertificateProblem::MalformedPem(e.to_string()))?;

	let not_after = DateTime::from_timestamp(cert.validity().not_after.timestamp(), 0)
		.ok_or_else(|| CertificateProblem::MalformedPem("NotAfter out of range".into()))?;
	if now > not_after {
		return Err(CertificateProblem::Expired {
			not_after: not_after.format("%Y-%m-%d").to_string(),
		});
	}

	let names = match cert.subject_alternative_name() {
		Ok(Some(san)) => san.value.general_names.iter().filter_map(SubjectName::from_general).collect(),
		Ok(None) => Vec::new(),
		Err(e) => return Err(CertificateProblem::MalformedPem(e.to_string())),
	};
	if !covers(&names, domain) {
		return Err(CertificateProblem::HostnameMismatch);
	}

	load_tls_config(cert_path, key_path)?;

	Ok(CertificateStatus {
		not_after,
		expires_soon: now + EXPIRY_WARNING > not_after,
	})
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum SubjectName {
	Dns(String),
	Ip(IpAddr),
}

impl SubjectName {
	fn from_general(name: &GeneralName<'_>) -> Option<Self> {
		match name {
			GeneralName::DNSName(dns) => Some(SubjectName::Dns(dns.to_ascii_lowercase())),
			GeneralName::IPAddress(bytes) => match bytes.len() {
				4 => <[u8; 4]>::try_from(*bytes).ok().map(|b| SubjectName::Ip(IpAddr::from(b))),
				16 => <[u8; 16]>::try_from(*bytes).ok().map(|b| SubjectName::Ip(IpAddr::from(b))),
				_ => None,
			},
			_ => None,
		}
	}
}

fn covers(names: &[SubjectName], domain: &str) -> bool {
	if let Ok(ip) = domain.parse::<IpAddr>() {
		return names.contains(&SubjectName::Ip(ip));
	}

	let domain = domain.trim_end_matches('.').to_ascii_lowercase();
	names.iter().any(|name| match name {
		SubjectName::Dns(pattern) => dns_matches(pattern, &domain),
		SubjectName::Ip(_) => false,
	})
}

/// `*.example.dev` matches exactly one extra leftmost label.
fn dns_matches(pattern: &str, domain: &str) -> bool {
	match pattern.strip_prefix("*.") {
		Some(suffix) => domain
			.split_once('.')
			.is_some_and(|(label, rest)| !label.is_empty() && rest == suffix),
		None => pattern == domain,
	}
}
