//! Single-assignment completion cells.
//!
//! A [`Deferred`] is the writing half: it can be cloned and handed to several
//! parties (the dispatch loop, a procedure, a forked task) but only the first
//! [`Deferred::complete`] wins. The reading half, [`DeferredWait`], is owned by
//! the one caller that wants the value. Dropping the reader is how a caller
//! gives up; writers observe that through [`Deferred::is_done`].

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;

enum Slot<T> {
	Waiting(oneshot::Sender<T>),
	/// Nobody awaits the value; completion is accepted and discarded.
	Detached,
	Settled,
}

/// Writing half of a single-assignment cell.
pub struct Deferred<T> {
	slot: Arc<Mutex<Slot<T>>>,
}

impl<T> Clone for Deferred<T> {
	fn clone(&self) -> Self {
		Self {
			slot: Arc::clone(&self.slot),
		}
	}
}

impl<T> std::fmt::Debug for Deferred<T> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Deferred").field("done", &self.is_done()).finish()
	}
}

/// Every writer of the cell was dropped before completing it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("deferred dropped without completion")]
pub struct DeferredDropped;

/// Reading half of a single-assignment cell.
#[derive(Debug)]
pub struct DeferredWait<T> {
	rx: oneshot::Receiver<T>,
}

impl<T> Deferred<T> {
	/// Creates a cell together with its reader.
	pub fn new() -> (Self, DeferredWait<T>) {
		let (tx, rx) = oneshot::channel();
		(
			Self {
				slot: Arc::new(Mutex::new(Slot::Waiting(tx))),
			},
			DeferredWait { rx },
		)
	}

	/// Creates a cell nobody waits on, for fire-and-forget requests.
	pub fn detached() -> Self {
		Self {
			slot: Arc::new(Mutex::new(Slot::Detached)),
		}
	}

	/// Completes the cell. Returns `true` if a waiting reader received `value`.
	///
	/// Later completions, and completions after the reader gave up, are dropped.
	pub fn complete(&self, value: T) -> bool {
		let slot = std::mem::replace(&mut *self.slot.lock(), Slot::Settled);
		match slot {
			Slot::Waiting(tx) => tx.send(value).is_ok(),
			Slot::Detached | Slot::Settled => false,
		}
	}

	/// True once the cell has been completed or its reader was dropped.
	pub fn is_done(&self) -> bool {
		match &*self.slot.lock() {
			Slot::Waiting(tx) => tx.is_closed(),
			Slot::Detached => false,
			Slot::Settled => true,
		}
	}
}

impl<T> DeferredWait<T> {
	/// Waits for the value. Cancel-safe: dropping this future abandons the cell.
	pub async fn wait(self) -> Result<T, DeferredDropped> {
		self.rx.await.map_err(|_| DeferredDropped)
	}
}
