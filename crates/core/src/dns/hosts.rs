//! The hosts overlay file read by the DNS forwarder (`addn-hosts=`).

use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

const OVERLAY_HEADER: &str = "# NSM dnsmasq hosts file\n# Development domains will be added here automatically\n127.0.0.1 localhost\n";

/// Line mapping `domain` to IPv4 loopback.
pub fn loopback_entry(domain: &str) -> String {
	format!("127.0.0.1 {domain}")
}

#[derive(Debug, Clone)]
pub struct HostsOverlay {
	path: PathBuf,
}

impl HostsOverlay {
	pub fn new(path: impl Into<PathBuf>) -> Self {
		Self { path: path.into() }
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	/// Creates the file with its header when missing.
	pub fn ensure_exists(&self) -> io::Result<()> {
		if self.path.exists() {
			return Ok(());
		}
		std::fs::write(&self.path, OVERLAY_HEADER)?;
		info!(target = "nsm.dns", file = %self.path.display(), "created dnsmasq hosts file");
		Ok(())
	}

	pub fn contains(&self, domain: &str) -> io::Result<bool> {
		let entry = loopback_entry(domain);
		match std::fs::read_to_string(&self.path) {
			Ok(content) => Ok(content.lines().any(|line| line.trim() == entry)),
			Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
			Err(e) => Err(e),
		}
	}

	/// Appends the loopback entry for `domain`. Returns `false` when it was already present.
	pub fn add(&self, domain: &str) -> io::Result<bool> {
		if self.contains(domain)? {
			debug!(target = "nsm.dns", domain, "hosts entry already present");
			return Ok(false);
		}

		let mut content = std::fs::read_to_string(&self.path).or_else(|e| if e.kind() == io::ErrorKind::NotFound { Ok(String::new()) } else { Err(e) })?;
		if !content.is_empty() && !content.ends_with('\n') {
			content.push('\n');
		}
		content.push_str(&loopback_entry(domain));
		content.push('\n');
		std::fs::write(&self.path, content)?;
		debug!(target = "nsm.dns", domain, "added hosts entry");
		Ok(true)
	}

	/// Drops every line equal to the loopback entry for `domain`. Returns `false` when nothing matched.
	pub fn remove(&self, domain: &str) -> io::Result<bool> {
		let entry = loopback_entry(domain);
		let content = match std::fs::read_to_string(&self.path) {
			Ok(content) => content,
			Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
			Err(e) => return Err(e),
		};

		let kept: Vec<&str> = content.lines().filter(|line| line.trim() != entry).collect();
		if kept.len() == content.lines().count() {
			return Ok(false);
		}

		let mut rewritten = kept.join("\n");
		rewritten.push('\n');
		std::fs::write(&self.path, rewritten)?;
		debug!(target = "nsm.dns", domain, "removed hosts entry");
		Ok(true)
	}
}

#[cfg(test)]
mod tests {
	use tempfile::TempDir;

	use super::*;

	#[test]
	fn overlay_is_seeded_with_header() {
		let tmp = TempDir::new().unwrap();
		let overlay = HostsOverlay::new(tmp.path().join("dnsmasq.hosts"));
		overlay.ensure_exists().unwrap();
		assert!(overlay.contains("localhost").unwrap());
		assert!(std::fs::read_to_string(overlay.path()).unwrap().starts_with("# NSM dnsmasq hosts file"));
	}

	#[test]
	fn add_is_idempotent_and_remove_is_symmetric() {
		let tmp = TempDir::new().unwrap();
		let overlay = HostsOverlay::new(tmp.path().join("dnsmasq.hosts"));
		overlay.ensure_exists().unwrap();
		let before = std::fs::read_to_string(overlay.path()).unwrap();

		assert!(overlay.add("shop.dev").unwrap());
		assert!(!overlay.add("shop.dev").unwrap());
		let content = std::fs::read_to_string(overlay.path()).unwrap();
		assert_eq!(content.matches("127.0.0.1 shop.dev").count(), 1);

		assert!(overlay.remove("shop.dev").unwrap());
		assert!(!overlay.remove("shop.dev").unwrap());
		assert_eq!(std::fs::read_to_string(overlay.path()).unwrap(), before);
	}

	#[test]
	fn remove_keeps_other_domains() {
		let tmp = TempDir::new().unwrap();
		let overlay = HostsOverlay::new(tmp.path().join("hosts"));
		overlay.add("a.test").unwrap();
		overlay.add("b.test").unwrap();
		overlay.remove("a.test").unwrap();
		assert!(!overlay.contains("a.test").unwrap());
		assert!(overlay.contains("b.test").unwrap());
	}

	#[test]
	fn missing_file_is_not_an_error() {
		let tmp = TempDir::new().unwrap();
		let overlay = HostsOverlay::new(tmp.path().join("absent"));
		assert!(!overlay.contains("shop.dev").unwrap());
		assert!(!overlay.remove("shop.dev").unwrap());
	}
}
