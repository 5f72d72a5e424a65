//! Point-in-time view of a session for status output.

use serde::Serialize;

use crate::config::ProjectType;

/// Lifecycle of a [`super::Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
	Created,
	Validating,
	AllocatingPorts,
	ProvisioningCertificate,
	ConfiguringDns,
	StartingProxy,
	StartingBackend,
	Running,
	ShuttingDown,
	Stopped,
	Failed,
}

impl SessionState {
	pub fn is_running(self) -> bool {
		self == SessionState::Running
	}
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
	pub state: SessionState,
	pub running: bool,
	pub project_name: String,
	pub project_type: ProjectType,
	pub domain: String,
	pub url: String,
	pub http_port: u16,
	pub https_port: u16,
	pub clean_urls: bool,
	pub https: bool,
	pub dns: bool,
	pub dns_configured: bool,
	/// 0 when no process is supervised.
	pub pid: u32,
	pub process_running: bool,
}
