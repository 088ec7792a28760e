use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use automat_worker::TaskClass;

use crate::MachineError;

/// Failures kept for [`RetryAttempt::failures`]; older ones are only counted.
pub const RETRY_HISTORY: usize = 16;

/// Input to a retry decision: the failure count and the most recent failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryAttempt<'a> {
	attempt: usize,
	failures: &'a [MachineError],
}

impl<'a> RetryAttempt<'a> {
	pub(crate) fn new(attempt: usize, failures: &'a [MachineError]) -> Self {
		Self { attempt, failures }
	}

	/// Number of failed attempts so far (1 after the first failure).
	pub fn attempt(&self) -> usize {
		self.attempt
	}

	/// Failure that ended the most recent attempt.
	pub fn last_error(&self) -> Option<&'a MachineError> {
		self.failures.last()
	}

	/// Failures of the last [`RETRY_HISTORY`] attempts at most, oldest first.
	pub fn failures(&self) -> &'a [MachineError] {
		self.failures
	}
}

type RetryFn = dyn Fn(&RetryAttempt<'_>) -> Option<Duration> + Send + Sync;

/// Restart policy wrapped around a machine's whole boot-and-dispatch loop.
///
/// Initialization failures and loop defects are retried alike; interruption
/// never is.
#[derive(Clone, Default)]
pub enum RetryPolicy {
	/// A failed attempt is terminal.
	#[default]
	Never,
	/// Retries up to `times` more attempts, waiting `backoff` before each.
	Recurs { times: usize, backoff: Duration },
	/// Caller-supplied decision: `Some(delay)` retries after `delay`.
	Custom(Arc<RetryFn>),
}

impl RetryPolicy {
	/// Retries `times` times with no delay.
	pub fn recurs(times: usize) -> Self {
		Self::Recurs {
			times,
			backoff: Duration::ZERO,
		}
	}

	pub fn custom(decide: impl Fn(&RetryAttempt<'_>) -> Option<Duration> + Send + Sync + 'static) -> Self {
		Self::Custom(Arc::new(decide))
	}

	/// Returns the delay before the next attempt, or `None` to give up.
	pub(crate) fn decide(&self, attempt: &RetryAttempt<'_>) -> Option<Duration> {
		match self {
			Self::Never => None,
			Self::Recurs { times, backoff } => (attempt.attempt() <= *times).then_some(*backoff),
			Self::Custom(decide) => decide(attempt),
		}
	}
}

impl fmt::Debug for RetryPolicy {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Never => f.write_str("Never"),
			Self::Recurs { times, backoff } => f.debug_struct("Recurs").field("times", times).field("backoff", backoff).finish(),
			Self::Custom(_) => f.write_str("Custom(..)"),
		}
	}
}

/// Runtime configuration of one machine definition.
#[derive(Debug, Clone)]
pub struct MachineConfig {
	pub(crate) retry: RetryPolicy,
	pub(crate) state_buffer: usize,
	pub(crate) tracing: bool,
	pub(crate) class: TaskClass,
}

impl MachineConfig {
	/// Sets the restart policy.
	#[must_use]
	pub fn retry(mut self, retry: RetryPolicy) -> Self {
		self.retry = retry;
		self
	}

	/// Sets the state broadcast buffer capacity.
	///
	/// Subscribers that fall further behind skip to the oldest retained state.
	///
	/// # Panics
	///
	/// Panics if `size` is zero.
	#[must_use]
	pub fn state_buffer(mut self, size: usize) -> Self {
		assert!(size > 0, "state buffer size must be > 0");
		self.state_buffer = size;
		self
	}

	/// Enables span creation around sends and procedure invocations.
	#[must_use]
	pub fn tracing(mut self, enabled: bool) -> Self {
		self.tracing = enabled;
		self
	}

	/// Sets the worker class of each boot attempt's task.
	#[must_use]
	pub fn class(mut self, class: TaskClass) -> Self {
		self.class = class;
		self
	}
}

impl Default for MachineConfig {
	fn default() -> Self {
		Self {
			retry: RetryPolicy::Never,
			state_buffer: 128,
			tracing: false,
			class: TaskClass::Dispatch,
		}
	}
}
