use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio_util::sync::CancellationToken;

/// Monotonic generation counter shared by every boot attempt of one machine.
#[derive(Debug, Default, Clone)]
pub struct GenerationClock {
	last: Arc<AtomicU64>,
}

impl GenerationClock {
	pub fn new() -> Self {
		Self::default()
	}

	/// Advances the clock and returns the new generation. The first call yields 1.
	pub fn advance(&self) -> u64 {
		self.last.fetch_add(1, Ordering::AcqRel).wrapping_add(1)
	}

	/// Most recently issued generation, or 0 before the first boot attempt.
	pub fn current(&self) -> u64 {
		self.last.load(Ordering::Acquire)
	}
}

/// Cancellation scope of one boot attempt.
///
/// Cancelling the instance-wide parent token cancels every generation;
/// cancelling one generation leaves the parent untouched so the supervisor
/// can start the next attempt.
#[derive(Debug, Clone)]
pub struct GenerationToken {
	generation: u64,
	cancel: CancellationToken,
}

impl GenerationToken {
	/// Creates a generation scope as a child of `parent`.
	pub fn child_of(generation: u64, parent: &CancellationToken) -> Self {
		Self {
			generation,
			cancel: parent.child_token(),
		}
	}

	pub const fn generation(&self) -> u64 {
		self.generation
	}

	pub fn is_cancelled(&self) -> bool {
		self.cancel.is_cancelled()
	}

	pub fn cancel(&self) {
		self.cancel.cancel();
	}

	/// Resolves once this generation (or its parent) is cancelled.
	pub async fn cancelled(&self) {
		self.cancel.cancelled().await;
	}
}
