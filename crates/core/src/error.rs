//! Error taxonomy for session setup, service start and teardown.

use std::fmt;
use std::time::Duration;

use nsm_protocol::StepName;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Why an on-disk certificate was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CertificateProblem {
	Unreadable(String),
	MalformedPem(String),
	Expired { not_after: String },
	HostnameMismatch,
	KeyMismatch(String),
}

impl fmt::Display for CertificateProblem {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			CertificateProblem::Unreadable(e) => write!(f, "certificate unreadable: {e}"),
			CertificateProblem::MalformedPem(e) => write!(f, "failed to decode PEM certificate: {e}"),
			CertificateProblem::Expired { not_after } => write!(f, "certificate expired on {not_after}"),
			CertificateProblem::HostnameMismatch => f.write_str("certificate does not cover the requested domain"),
			CertificateProblem::KeyMismatch(e) => write!(f, "invalid key pair: {e}"),
		}
	}
}

#[derive(Debug, Error)]
pub enum Error {
	#[error("invalid configuration: {0}")]
	Validation(String),

	#[error("port {0} is not available")]
	PortUnavailable(u16),

	#[error("no free port could be bound")]
	PortExhausted,

	#[error("certificate for {domain} is invalid: {reason}")]
	CertificateInvalid { domain: String, reason: CertificateProblem },

	#[error("certificate authority tool (mkcert) not found on PATH")]
	CertificateAuthorityMissing,

	#[error("certificate authority failed: {0}")]
	CertificateAuthority(String),

	#[error("DNS configuration failed: {0}")]
	DomainConfigurationFailed(String),

	#[error("{domain} resolves to {addresses:?} instead of loopback")]
	DomainNotLoopback { domain: String, addresses: Vec<String> },

	#[error("proxy did not accept connections on port {port} within {waited:?}")]
	ProxyStartTimeout { port: u16, waited: Duration },

	#[error("proxy failed to bind port {port}: {source}")]
	ProxyBindFailed {
		port: u16,
		#[source]
		source: std::io::Error,
	},

	#[error("proxy shutdown failed: {0}")]
	ProxyShutdown(String),

	#[error("failed to start development server: {0}")]
	BackendStartFailed(String),

	#[error("development server not listening on port {port} after {waited:?}")]
	BackendNotReady { port: u16, waited: Duration },

	#[error("failed to stop development server: {0}")]
	BackendStopFailed(String),

	#[error("step {step} timed out after {after:?}")]
	StepTimeout { step: StepName, after: Duration },

	#[error("step {step} failed: {source}")]
	StepFailed {
		step: StepName,
		#[source]
		source: Box<Error>,
	},

	#[error("shutdown completed with errors: {}", .0.join("; "))]
	ShutdownPartialFailure(Vec<String>),

	#[error(transparent)]
	Io(#[from] std::io::Error),

	#[error(transparent)]
	Json(#[from] serde_json::Error),
}

impl Error {
	/// Returns `false` for errors that degrade the session instead of aborting it.
	pub fn is_fatal(&self) -> bool {
		match self {
			Error::DomainConfigurationFailed(_) | Error::DomainNotLoopback { .. } | Error::BackendNotReady { .. } => false,
			Error::ShutdownPartialFailure(_) => false,
			Error::StepFailed { source, .. } => source.is_fatal(),
			_ => true,
		}
	}

	/// Step that failed, when the error came out of the setup pipeline.
	pub fn step(&self) -> Option<StepName> {
		match self {
			Error::StepFailed { step, .. } | Error::StepTimeout { step, .. } => Some(*step),
			_ => None,
		}
	}

	/// Actionable suggestions shown next to a fatal error.
	pub fn remediation_hints(&self) -> Vec<String> {
		let root = match self {
			Error::StepFailed { source, .. } => source.as_ref(),
			other => other,
		};

		let mut hints = match root {
			Error::CertificateAuthorityMissing | Error::CertificateAuthority(_) => vec![
				"Verify mkcert is installed: `mkcert -version`".to_string(),
				"Install the local CA once with `mkcert -install`".to_string(),
			],
			Error::PortUnavailable(port) => vec![format!("Free port {port} or pick another with --http-port/--https-port")],
			Error::PortExhausted => vec!["Check for runaway processes holding ephemeral ports".to_string()],
			Error::ProxyBindFailed { .. } => vec!["Check permissions for binding the requested port".to_string()],
			Error::Validation(_) => vec!["Check the project directory and --command value".to_string()],
			Error::BackendStartFailed(_) => vec!["Run the development command manually to inspect its output".to_string()],
			Error::StepTimeout { .. } => vec!["A setup step hung; inspect the logs with -vv".to_string()],
			_ => Vec::new(),
		};
		hints.push("Re-run with -vv to inspect the logs, then retry".to_string());
		hints
	}

	pub(crate) fn in_step(self, step: StepName) -> Self {
		match self {
			Error::StepTimeout { .. } | Error::StepFailed { .. } => self,
			other => Error::StepFailed {
				step,
				source: Box::new(other),
			},
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn dns_and_readiness_errors_are_not_fatal() {
		assert!(!Error::DomainConfigurationFailed("dnsmasq missing".into()).is_fatal());
		assert!(
			!Error::BackendNotReady {
				port: 3000,
				waited: Duration::from_secs(30)
			}
			.is_fatal()
		);
		assert!(Error::PortUnavailable(3000).is_fatal());
		assert!(Error::CertificateAuthorityMissing.is_fatal());
	}

	#[test]
	fn step_wrapping_is_idempotent_and_exposes_step() {
		let err = Error::PortUnavailable(8080).in_step(StepName::Ports).in_step(StepName::Certs);
		assert_eq!(err.step(), Some(StepName::Ports));
		assert!(err.to_string().contains("port 8080 is not available"));
	}

	#[test]
	fn partial_failure_lists_every_sub_error() {
		let err = Error::ShutdownPartialFailure(vec!["stop development server: boom".into(), "cleanup DNS: denied".into()]);
		let text = err.to_string();
		assert!(text.contains("stop development server: boom"));
		assert!(text.contains("cleanup DNS: denied"));
	}

	#[test]
	fn hints_always_end_with_log_advice() {
		let hints = Error::CertificateAuthorityMissing.in_step(StepName::Validate).remediation_hints();
		assert!(hints.iter().any(|h| h.contains("mkcert")));
		assert!(hints.last().unwrap().contains("-vv"));
	}
}
