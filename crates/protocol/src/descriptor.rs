//! Port descriptor written into the project directory for the child's tooling.

use serde::{Deserialize, Serialize};

/// File name of the descriptor inside the project directory.
pub const PORT_DESCRIPTOR_FILE: &str = ".nsm-ports.json";

/// `{"http": <port>, "https": <port>, "host": "127.0.0.1"}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortDescriptor {
	pub http: u16,
	pub https: u16,
	pub host: String,
}

impl PortDescriptor {
	pub fn loopback(http: u16, https: u16) -> Self {
		Self {
			http,
			https,
			host: "127.0.0.1".to_string(),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn descriptor_matches_documented_shape() {
		let json = serde_json::to_string(&PortDescriptor::loopback(5173, 8443)).unwrap();
		assert_eq!(json, r#"{"http":5173,"https":8443,"host":"127.0.0.1"}"#);
	}
}
