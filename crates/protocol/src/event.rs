//! Events emitted by a running session.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A named stage of session setup or service start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepName {
	Validate,
	Ports,
	Certs,
	Dns,
	Proxy,
	Dev,
}

impl StepName {
	/// Setup pipeline steps in execution order.
	pub const PIPELINE: [StepName; 4] = [StepName::Validate, StepName::Ports, StepName::Certs, StepName::Dns];

	pub fn as_str(self) -> &'static str {
		match self {
			StepName::Validate => "validate",
			StepName::Ports => "ports",
			StepName::Certs => "certs",
			StepName::Dns => "dns",
			StepName::Proxy => "proxy",
			StepName::Dev => "dev",
		}
	}

	/// Human readable description shown next to the step.
	pub fn description(self) -> &'static str {
		match self {
			StepName::Validate => "Validating configuration",
			StepName::Ports => "Configuring ports",
			StepName::Certs => "Setting up certificates",
			StepName::Dns => "Configuring DNS",
			StepName::Proxy => "Starting HTTPS proxy",
			StepName::Dev => "Starting development server",
		}
	}
}

impl fmt::Display for StepName {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Progress of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
	#[default]
	Pending,
	Loading,
	Success,
	Error,
}

impl StepStatus {
	/// Returns `true` once the step can no longer change.
	pub fn is_terminal(self) -> bool {
		matches!(self, StepStatus::Success | StepStatus::Error)
	}
}

impl fmt::Display for StepStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let s = match self {
			StepStatus::Pending => "pending",
			StepStatus::Loading => "loading",
			StepStatus::Success => "success",
			StepStatus::Error => "error",
		};
		f.write_str(s)
	}
}

/// Output stream of the supervised process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogSource {
	Stdout,
	Stderr,
}

impl fmt::Display for LogSource {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			LogSource::Stdout => f.write_str("stdout"),
			LogSource::Stderr => f.write_str("stderr"),
		}
	}
}

/// Everything a presentation layer can observe about a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
	StepUpdate {
		step: StepName,
		status: StepStatus,
		details: String,
	},
	SetupComplete,
	Log {
		source: LogSource,
		text: String,
	},
	ServerStarted {
		http_port: u16,
		https_port: u16,
	},
	/// Non-fatal degradation the user should know about.
	Warning {
		message: String,
	},
	ProcessExited {
		code: Option<i32>,
	},
	Fatal {
		message: String,
		#[serde(default, skip_serializing_if = "Vec::is_empty")]
		hints: Vec<String>,
	},
}

impl SessionEvent {
	pub fn step(step: StepName, status: StepStatus, details: impl Into<String>) -> Self {
		SessionEvent::StepUpdate {
			step,
			status,
			details: details.into(),
		}
	}

	pub fn warning(message: impl Into<String>) -> Self {
		SessionEvent::Warning { message: message.into() }
	}
}
