use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::{JoinError, JoinHandle};

/// Join coordination for a task whose outcome several callers want.
///
/// Only one caller (the leader) awaits the [`JoinHandle`]; every other caller
/// parks on a notify until the leader records the outcome, which is then
/// cloned out to all of them.
enum JoinState<T> {
	/// Task still owned; the first joiner takes it.
	Handle(JoinHandle<T>),
	/// A leader is currently awaiting the handle.
	Joining,
	/// Task finished with this outcome.
	Done(T),
}

pub struct JoinCtrl<T> {
	state: Mutex<JoinState<T>>,
	done: Notify,
	on_join_error: fn(JoinError) -> T,
}

impl<T> JoinCtrl<T>
where
	T: Clone + Send + 'static,
{
	/// Wraps `handle`. `on_join_error` converts a panic or abort of the task itself into an outcome.
	pub fn new(handle: JoinHandle<T>, on_join_error: fn(JoinError) -> T) -> Self {
		Self {
			state: Mutex::new(JoinState::Handle(handle)),
			done: Notify::new(),
			on_join_error,
		}
	}

	/// Waits for the task outcome. Safe to call from any number of callers.
	pub async fn join(&self) -> T {
		self.join_leased().await
	}

	/// Join that puts the handle back if the caller is cancelled mid-await.
	async fn join_leased(&self) -> T {
		loop {
			let step = {
				let mut st = self.state.lock();
				match &*st {
					JoinState::Done(outcome) => return outcome.clone(),
					// Create Notified while the lock is held so the leader's notify_waiters is not lost.
					JoinState::Joining => Step::Wait(self.done.notified()),
					JoinState::Handle(_) => {
						let JoinState::Handle(h) = std::mem::replace(&mut *st, JoinState::Joining) else {
							unreachable!()
						};
						Step::Lead(h)
					}
				}
			};
			let handle = match step {
				Step::Wait(notified) => {
					notified.await;
					continue;
				}
				Step::Lead(handle) => handle,
			};
			// If this caller is dropped mid-await the lease hands the task back.
			let mut lease = Lease { ctrl: self, handle: Some(handle) };
			let outcome = match lease.handle.as_mut() {
				Some(h) => h.await.unwrap_or_else(self.on_join_error),
				None => unreachable!(),
			};
			lease.handle = None;
			*self.state.lock() = JoinState::Done(outcome.clone());
			self.done.notify_waiters();
			return outcome;
		}
	}
}

enum Step<'a, T> {
	Wait(tokio::sync::futures::Notified<'a>),
	Lead(JoinHandle<T>),
}

/// Returns an un-awaited handle to the controller when a joining caller is dropped.
struct Lease<'a, T> {
	ctrl: &'a JoinCtrl<T>,
	handle: Option<JoinHandle<T>>,
}

impl<T> Drop for Lease<'_, T> {
	fn drop(&mut self) {
		let Some(handle) = self.handle.take() else {
			return;
		};
		*self.ctrl.state.lock() = JoinState::Handle(handle);
		self.ctrl.done.notify_waiters();
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;
	use std::time::Duration;

	use super::*;
	use crate::{TaskClass, spawn};

	fn join_error_label(err: JoinError) -> &'static str {
		if err.is_panic() { "panicked" } else { "cancelled" }
	}

	#[tokio::test]
	async fn every_joiner_sees_the_same_outcome() {
		let (tx, rx) = tokio::sync::oneshot::channel::<()>();
		let handle = spawn(TaskClass::Supervisor, async move {
			let _ = rx.await;
			"finished"
		});
		let ctrl = Arc::new(JoinCtrl::new(handle, join_error_label));

		let a = tokio::spawn({
			let ctrl = Arc::clone(&ctrl);
			async move { ctrl.join().await }
		});
		let b = tokio::spawn({
			let ctrl = Arc::clone(&ctrl);
			async move { ctrl.join().await }
		});
		tokio::task::yield_now().await;

		tx.send(()).unwrap();
		assert_eq!(a.await.unwrap(), "finished");
		assert_eq!(b.await.unwrap(), "finished");
		assert_eq!(ctrl.join().await, "finished");
	}

	#[tokio::test]
	async fn abandoned_join_returns_handle_for_later_joiners() {
		let (tx, rx) = tokio::sync::oneshot::channel::<()>();
		let handle = spawn(TaskClass::Supervisor, async move {
			let _ = rx.await;
			"late"
		});
		let ctrl = JoinCtrl::new(handle, join_error_label);

		assert!(tokio::time::timeout(Duration::from_millis(10), ctrl.join()).await.is_err());
		tx.send(()).unwrap();
		let outcome = tokio::time::timeout(Duration::from_secs(1), ctrl.join()).await.expect("join should not hang");
		assert_eq!(outcome, "late");
	}

	#[tokio::test]
	async fn panicking_task_is_mapped() {
		let handle: JoinHandle<&'static str> = spawn(TaskClass::Supervisor, async { panic!("boom") });
		let ctrl = JoinCtrl::<&'static str>::new(handle, join_error_label);
		assert_eq!(ctrl.join().await, "panicked");
	}
}
