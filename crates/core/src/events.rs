//! One-directional event channel from the engine to presentation layers.
//!
//! Backed by [`tokio::sync::broadcast`], so the overflow policy is drop-oldest:
//! producers never block, and a subscriber that falls behind receives
//! [`broadcast::error::RecvError::Lagged`] and resumes at the oldest retained event.

use nsm_protocol::{LogSource, SessionEvent, StepName, StepStatus};
use tokio::sync::broadcast;
use tracing::trace;

/// Events retained for slow subscribers before the oldest are dropped.
pub const EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub struct EventBus {
	tx: broadcast::Sender<SessionEvent>,
}

impl Default for EventBus {
	fn default() -> Self {
		Self::new()
	}
}

impl EventBus {
	pub fn new() -> Self {
		Self::with_capacity(EVENT_CAPACITY)
	}

	pub fn with_capacity(capacity: usize) -> Self {
		let (tx, _) = broadcast::channel(capacity.max(1));
		Self { tx }
	}

	pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
		self.tx.subscribe()
	}

	/// Publishes `event`. Without subscribers the event is discarded.
	pub fn emit(&self, event: SessionEvent) {
		if self.tx.send(event).is_err() {
			trace!(target = "nsm.session", "event dropped: no subscribers");
		}
	}

	pub fn step(&self, step: StepName, status: StepStatus, details: impl Into<String>) {
		self.emit(SessionEvent::step(step, status, details));
	}

	pub fn warning(&self, message: impl Into<String>) {
		self.emit(SessionEvent::warning(message));
	}

	pub fn log(&self, source: LogSource, text: impl Into<String>) {
		self.emit(SessionEvent::Log { source, text: text.into() });
	}
}
