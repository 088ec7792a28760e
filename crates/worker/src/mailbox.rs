use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

/// Returned by [`MailboxSender::offer`] when the mailbox has been closed.
///
/// Hands the rejected message back so the caller can settle it.
#[derive(Debug, PartialEq, Eq)]
pub struct MailboxClosed<T>(pub T);

impl<T> fmt::Display for MailboxClosed<T> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("mailbox closed")
	}
}

impl<T: fmt::Debug> std::error::Error for MailboxClosed<T> {}

struct MailboxState<T> {
	queue: VecDeque<T>,
	closed: bool,
}

struct MailboxInner<T> {
	state: Mutex<MailboxState<T>>,
	notify_take: Notify,
}

/// Unbounded FIFO mailbox with many producers and one consumer.
///
/// Offering never waits, so senders never exert backpressure on the machine.
pub struct Mailbox<T> {
	inner: Arc<MailboxInner<T>>,
}

/// Producer half of a [`Mailbox`].
pub struct MailboxSender<T> {
	inner: Arc<MailboxInner<T>>,
}

/// Consumer half of a [`Mailbox`].
pub struct MailboxReceiver<T> {
	inner: Arc<MailboxInner<T>>,
}

impl<T> Clone for MailboxSender<T> {
	fn clone(&self) -> Self {
		Self {
			inner: Arc::clone(&self.inner),
		}
	}
}

impl<T> Clone for MailboxReceiver<T> {
	fn clone(&self) -> Self {
		Self {
			inner: Arc::clone(&self.inner),
		}
	}
}

impl<T> Default for Mailbox<T> {
	fn default() -> Self {
		Self::new()
	}
}

impl<T> Mailbox<T> {
	pub fn new() -> Self {
		Self {
			inner: Arc::new(MailboxInner {
				state: Mutex::new(MailboxState {
					queue: VecDeque::new(),
					closed: false,
				}),
				notify_take: Notify::new(),
			}),
		}
	}

	pub fn sender(&self) -> MailboxSender<T> {
		MailboxSender {
			inner: Arc::clone(&self.inner),
		}
	}

	pub fn receiver(&self) -> MailboxReceiver<T> {
		MailboxReceiver {
			inner: Arc::clone(&self.inner),
		}
	}
}

impl<T> MailboxSender<T> {
	/// Appends one message. Fails only once the mailbox is closed.
	pub fn offer(&self, msg: T) -> Result<(), MailboxClosed<T>> {
		let mut state = self.inner.state.lock();
		if state.closed {
			return Err(MailboxClosed(msg));
		}
		state.queue.push_back(msg);
		drop(state);
		self.inner.notify_take.notify_one();
		Ok(())
	}

	/// Closes the mailbox. Queued messages stay available to the receiver.
	pub fn close(&self) {
		self.inner.state.lock().closed = true;
		self.inner.notify_take.notify_waiters();
	}

	pub fn is_closed(&self) -> bool {
		self.inner.state.lock().closed
	}

	pub fn len(&self) -> usize {
		self.inner.state.lock().queue.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}

impl<T> MailboxReceiver<T> {
	/// Takes the oldest message, waiting while the mailbox is empty.
	///
	/// Returns `None` once the mailbox is closed and drained.
	pub async fn take(&self) -> Option<T> {
		loop {
			// Register before inspecting the queue so a concurrent close() is not missed.
			let notified = self.inner.notify_take.notified();
			{
				let mut state = self.inner.state.lock();
				if let Some(msg) = state.queue.pop_front() {
					return Some(msg);
				}
				if state.closed {
					return None;
				}
			}
			notified.await;
		}
	}

	/// Removes and returns every queued message in FIFO order without waiting.
	pub fn take_all(&self) -> Vec<T> {
		self.inner.state.lock().queue.drain(..).collect()
	}

	pub fn len(&self) -> usize {
		self.inner.state.lock().queue.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}
