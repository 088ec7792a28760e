//! Current-state cell plus change broadcast.

use std::sync::Arc;

use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use tokio::sync::broadcast;

/// Single-writer holder of a machine's current state.
///
/// Reads are lock-free. The write lock only orders a publish against a
/// subscriber taking its initial snapshot, so that a stream never replays a
/// value older than the one it started from.
pub(crate) struct StatePublisher<S> {
	current: ArcSwapOption<S>,
	tx: Mutex<Option<broadcast::Sender<Arc<S>>>>,
}

impl<S> StatePublisher<S>
where
	S: Send + Sync + 'static,
{
	pub(crate) fn new(capacity: usize) -> Self {
		let (tx, _) = broadcast::channel(capacity);
		Self {
			current: ArcSwapOption::const_empty(),
			tx: Mutex::new(Some(tx)),
		}
	}

	/// Installs `state` and broadcasts it. Publishing the current `Arc` again is a no-op.
	///
	/// Returns `true` if subscribers were notified.
	pub(crate) fn publish(&self, state: Arc<S>) -> bool {
		let tx = self.tx.lock();
		if self.current.load().as_ref().is_some_and(|cur| Arc::ptr_eq(cur, &state)) {
			return false;
		}
		self.current.store(Some(Arc::clone(&state)));
		if let Some(tx) = tx.as_ref() {
			let _ = tx.send(state);
		}
		true
	}

	pub(crate) fn current(&self) -> Option<Arc<S>> {
		self.current.load_full()
	}

	/// Receiver of states published after this call.
	pub(crate) fn subscribe(&self) -> broadcast::Receiver<Arc<S>> {
		Self::receiver(self.tx.lock().as_ref())
	}

	pub(crate) fn stream(&self) -> StateStream<S> {
		StateStream {
			initial: None,
			rx: self.subscribe(),
		}
	}

	pub(crate) fn stream_with_initial(&self) -> StateStream<S> {
		let tx = self.tx.lock();
		StateStream {
			initial: self.current(),
			rx: Self::receiver(tx.as_ref()),
		}
	}

	/// Ends every stream once buffered states are consumed. The current state stays readable.
	pub(crate) fn close(&self) {
		self.tx.lock().take();
	}

	fn receiver(tx: Option<&broadcast::Sender<Arc<S>>>) -> broadcast::Receiver<Arc<S>> {
		match tx {
			Some(tx) => tx.subscribe(),
			None => broadcast::channel(1).1,
		}
	}
}

/// Feed of published states.
///
/// Ends after the machine terminates for good. A consumer that falls more
/// than the configured buffer behind skips ahead to the oldest retained state.
pub struct StateStream<S> {
	initial: Option<Arc<S>>,
	rx: broadcast::Receiver<Arc<S>>,
}

impl<S> StateStream<S>
where
	S: Send + Sync + 'static,
{
	pub async fn next(&mut self) -> Option<Arc<S>> {
		if let Some(initial) = self.initial.take() {
			return Some(initial);
		}
		loop {
			match self.rx.recv().await {
				Ok(state) => return Some(state),
				Err(broadcast::error::RecvError::Lagged(skipped)) => {
					tracing::debug!(skipped, "machine.state.lagged");
				}
				Err(broadcast::error::RecvError::Closed) => return None,
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use super::*;

	#[tokio::test]
	async fn republishing_the_same_arc_is_silent() {
		let publisher = StatePublisher::new(8);
		let state = Arc::new(1);
		assert!(publisher.publish(Arc::clone(&state)));
		let mut rx = publisher.subscribe();
		assert!(!publisher.publish(Arc::clone(&state)));
		assert!(publisher.publish(Arc::new(1)));
		assert_eq!(*rx.recv().await.unwrap(), 1);
		assert!(rx.try_recv().is_err());
	}

	#[tokio::test]
	async fn stream_with_initial_starts_from_current() {
		let publisher = StatePublisher::new(8);
		publisher.publish(Arc::new("a"));
		let mut with_initial = publisher.stream_with_initial();
		let mut live = publisher.stream();
		publisher.publish(Arc::new("b"));

		assert_eq!(*with_initial.next().await.unwrap(), "a");
		assert_eq!(*with_initial.next().await.unwrap(), "b");
		assert_eq!(*live.next().await.unwrap(), "b");
	}

	#[tokio::test]
	async fn close_ends_streams() {
		let publisher = StatePublisher::new(8);
		publisher.publish(Arc::new(0u8));
		let mut live = publisher.stream();
		publisher.publish(Arc::new(1u8));
		publisher.close();

		assert_eq!(*live.next().await.unwrap(), 1);
		let end = tokio::time::timeout(Duration::from_secs(1), live.next()).await.expect("stream should end");
		assert!(end.is_none());
		assert_eq!(publisher.current().as_deref(), Some(&1));
		assert!(publisher.stream().next().await.is_none());
	}

	#[tokio::test]
	async fn lagging_stream_skips_ahead() {
		let publisher = StatePublisher::new(2);
		let mut live = publisher.stream();
		for n in 0..5 {
			publisher.publish(Arc::new(n));
		}
		assert_eq!(*live.next().await.unwrap(), 3);
		assert_eq!(*live.next().await.unwrap(), 4);
	}
}
