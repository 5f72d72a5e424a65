//! TCP port reservation and readiness probing.

use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr, TcpListener};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::time::{Instant, sleep, timeout};
use tracing::{debug, warn};

use crate::config::PRIVILEGED_HTTPS_PORT;
use crate::error::{Error, Result};

/// Farthest distance from the preferred port searched by [`PortAllocator::allocate_near`].
pub const NEAR_SEARCH_RADIUS: u16 = 100;

const EPHEMERAL_ATTEMPTS: usize = 32;
const PROBE_INTERVAL: Duration = Duration::from_millis(100);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Hands out ports and remembers which ones this process has claimed.
///
/// The OS-level bind used for probing is released immediately; the reservation
/// only guarantees that one allocator never returns the same port twice while it
/// is held.
#[derive(Debug, Default)]
pub struct PortAllocator {
	reserved: Mutex<HashSet<u16>>,
}

impl PortAllocator {
	pub fn new() -> Self {
		Self::default()
	}

	/// Lets the OS pick an ephemeral port and reserves it.
	pub fn allocate_free_port(&self) -> Result<u16> {
		// Listeners stay open until we return so the OS cannot hand the same
		// port back on the next attempt.
		let mut held = Vec::new();
		for _ in 0..EPHEMERAL_ATTEMPTS {
			let listener = match TcpListener::bind((Ipv4Addr::LOCALHOST, 0)) {
				Ok(listener) => listener,
				Err(err) => {
					warn!(target = "nsm.ports", error = %err, "ephemeral bind refused");
					return Err(Error::PortExhausted);
				}
			};
			let port = listener.local_addr()?.port();
			if self.reserved.lock().insert(port) {
				debug!(target = "nsm.ports", port, "allocated free port");
				return Ok(port);
			}
			held.push(listener);
		}
		Err(Error::PortExhausted)
	}

	/// Returns `preferred` when available, otherwise the closest free port
	/// (`+1, -1, +2, -2, ...` up to [`NEAR_SEARCH_RADIUS`]), otherwise any free port.
	///
	/// Only the preferred port itself may be privileged: candidates at or below
	/// 1024 are skipped during the search.
	pub fn allocate_near(&self, preferred: u16) -> Result<u16> {
		if preferred != 0 && self.try_reserve(preferred) {
			debug!(target = "nsm.ports", port = preferred, "using preferred port");
			return Ok(preferred);
		}

		for offset in 1..=NEAR_SEARCH_RADIUS {
			for candidate in [preferred.checked_add(offset), preferred.checked_sub(offset)].into_iter().flatten() {
				if candidate > 1024 && self.try_reserve(candidate) {
					debug!(target = "nsm.ports", preferred, port = candidate, "using nearby port");
					return Ok(candidate);
				}
			}
		}

		self.allocate_free_port()
	}

	/// `true` when the port is not reserved here and the OS accepts a bind probe.
	pub fn is_available(&self, port: u16) -> bool {
		!self.reserved.lock().contains(&port) && os_port_free(port)
	}

	/// Reserves a user-pinned port, failing with [`Error::PortUnavailable`] when it is taken.
	pub fn claim(&self, port: u16) -> Result<u16> {
		if self.try_reserve(port) { Ok(port) } else { Err(Error::PortUnavailable(port)) }
	}

	/// Probes whether the well-known HTTPS port can be bound without elevated privileges.
	pub fn can_bind_privileged_port(&self) -> bool {
		let ok = !self.reserved.lock().contains(&PRIVILEGED_HTTPS_PORT) && os_port_free(PRIVILEGED_HTTPS_PORT);
		debug!(target = "nsm.ports", port = PRIVILEGED_HTTPS_PORT, bindable = ok, "privileged port probe");
		ok
	}

	/// Clears the reservation. Releasing an unknown port is a no-op.
	pub fn release(&self, port: u16) {
		if self.reserved.lock().remove(&port) {
			debug!(target = "nsm.ports", port, "released port");
		}
	}

	pub fn reserved(&self) -> Vec<u16> {
		let mut ports: Vec<_> = self.reserved.lock().iter().copied().collect();
		ports.sort_unstable();
		ports
	}

	pub async fn wait_until_listening(&self, port: u16, limit: Duration) -> bool {
		wait_until_listening(port, limit).await
	}

	fn try_reserve(&self, port: u16) -> bool {
		let mut reserved = self.reserved.lock();
		if reserved.contains(&port) || !os_port_free(port) {
			return false;
		}
		reserved.insert(port)
	}
}

fn os_port_free(port: u16) -> bool {
	TcpListener::bind((Ipv4Addr::LOCALHOST, port)).is_ok() && TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).is_ok()
}

/// Polls `127.0.0.1:port` with short-lived connects until one succeeds or `limit` elapses.
pub async fn wait_until_listening(port: u16, limit: Duration) -> bool {
	let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
	let deadline = Instant::now() + limit;
	loop {
		if let Ok(Ok(_stream)) = timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
			debug!(target = "nsm.ports", port, "port is accepting connections");
			return true;
		}
		if Instant::now() + PROBE_INTERVAL > deadline {
			return false;
		}
		sleep(PROBE_INTERVAL).await;
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn free_ports_are_never_handed_out_twice() {
		let allocator = PortAllocator::new();
		let mut seen = HashSet::new();
		for _ in 0..20 {
			let port = allocator.allocate_free_port().unwrap();
			assert!(seen.insert(port), "port {port} returned twice");
		}
		assert_eq!(allocator.reserved().len(), 20);
	}

	#[test]
	fn allocate_near_returns_preferred_when_available() {
		let allocator = PortAllocator::new();
		let probe = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
		let preferred = probe.local_addr().unwrap().port();
		drop(probe);

		assert!(allocator.is_available(preferred));
		assert_eq!(allocator.allocate_near(preferred).unwrap(), preferred);
		assert!(!allocator.is_available(preferred));

		let second = allocator.allocate_near(preferred).unwrap();
		assert_ne!(second, preferred);
	}

	#[test]
	fn bound_port_is_skipped_by_allocate_near() {
		let allocator = PortAllocator::new();
		let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
		let busy = listener.local_addr().unwrap().port();

		assert!(!allocator.is_available(busy));
		assert!(matches!(allocator.claim(busy), Err(Error::PortUnavailable(p)) if p == busy));
		assert_ne!(allocator.allocate_near(busy).unwrap(), busy);
	}

	#[test]
	fn allocate_near_tries_above_then_below() {
		let allocator = PortAllocator::new();
		let (_busy, _next, preferred) = (0..50)
			.find_map(|_| {
				let busy = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).ok()?;
				let port = busy.local_addr().ok()?.port();
				if port <= 1026 || port == u16::MAX {
					return None;
				}
				let next = TcpListener::bind((Ipv4Addr::LOCALHOST, port + 1)).ok()?;
				os_port_free(port - 1).then_some((busy, next, port))
			})
			.expect("no busy pair with a free predecessor");

		assert_eq!(allocator.allocate_near(preferred).unwrap(), preferred - 1);
	}

	#[test]
	fn privileged_ports_are_not_search_candidates() {
		let allocator = PortAllocator::new();
		let port = allocator.allocate_near(1000).unwrap();
		assert!(port == 1000 || port > 1024, "got {port}");
	}

	#[test]
	fn release_is_idempotent() {
		let allocator = PortAllocator::new();
		let port = allocator.allocate_free_port().unwrap();
		allocator.release(port);
		allocator.release(port);
		assert!(allocator.reserved().is_empty());
	}

	#[tokio::test]
	async fn wait_until_listening_sees_listener_and_times_out_without_one() {
		let listener = tokio::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
		let port = listener.local_addr().unwrap().port();
		assert!(wait_until_listening(port, Duration::from_secs(2)).await);
		drop(listener);

		let started = std::time::Instant::now();
		assert!(!wait_until_listening(port, Duration::from_millis(300)).await);
		assert!(started.elapsed() < Duration::from_secs(3));
	}
}
