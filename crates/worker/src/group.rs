//! Supervision groups for work forked out of a machine's procedures.
//!
//! Both groups share one fail-fast contract: the first member that fails for
//! any reason other than cancellation is recorded and surfaced through
//! `failed()`, which the owning dispatch loop races against its own work.
//! Normal completion and cancellation simply remove the member.

use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinError, JoinHandle};

use crate::{TaskClass, join_error_panic_message, spawn};

/// Failure of a supervised task. Cancellation is never a failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskFailure {
	#[error("supervised task {task} failed: {message}")]
	Failed { task: String, message: String },
	#[error("supervised task {task} panicked: {message}")]
	Panicked { task: String, message: String },
}

impl TaskFailure {
	pub fn task(&self) -> &str {
		match self {
			Self::Failed { task, .. } | Self::Panicked { task, .. } => task,
		}
	}
}

struct Member {
	id: u64,
	abort: AbortHandle,
	reaper: JoinHandle<()>,
}

struct GroupCore<K> {
	kind: &'static str,
	members: Mutex<Members<K>>,
	failure: watch::Sender<Option<TaskFailure>>,
	next_id: AtomicU64,
}

struct Members<K> {
	live: HashMap<K, Member>,
	closed: bool,
}

impl<K> GroupCore<K>
where
	K: Eq + Hash + Clone + Send + Sync + 'static,
{
	fn new(kind: &'static str) -> Arc<Self> {
		let (failure, _) = watch::channel(None);
		Arc::new(Self {
			kind,
			members: Mutex::new(Members {
				live: HashMap::new(),
				closed: false,
			}),
			failure,
			next_id: AtomicU64::new(0),
		})
	}

	/// Starts `fut` under `key` while the caller holds the members lock.
	fn start<F, E>(self: &Arc<Self>, members: &mut Members<K>, key: K, label: String, fut: F) -> bool
	where
		F: Future<Output = Result<(), E>> + Send + 'static,
		E: Display + Send + 'static,
	{
		if members.closed {
			tracing::debug!(group = self.kind, task = %label, "worker.group.fork_after_close");
			return false;
		}
		let id = self.next_id.fetch_add(1, Ordering::Relaxed);
		let work = spawn(TaskClass::Forked, fut);
		let abort = work.abort_handle();
		let core = Arc::downgrade(self);
		let reaper_key = key.clone();
		let reaper = spawn(TaskClass::Housekeeping, async move {
			let result = work.await;
			Self::settle(&core, &reaper_key, id, label, result);
		});
		if let Some(prior) = members.live.insert(key, Member { id, abort, reaper }) {
			tracing::trace!(group = self.kind, prior = prior.id, "worker.group.replace");
			prior.abort.abort();
		}
		tracing::trace!(group = self.kind, id, pending = members.live.len(), "worker.group.fork");
		true
	}

	fn settle<E: Display>(core: &Weak<Self>, key: &K, id: u64, label: String, result: Result<Result<(), E>, JoinError>) {
		let Some(core) = core.upgrade() else {
			return;
		};
		{
			let mut members = core.members.lock();
			if members.live.get(key).is_some_and(|m| m.id == id) {
				members.live.remove(key);
			}
		}
		let failure = match result {
			Ok(Ok(())) => return,
			Ok(Err(err)) => TaskFailure::Failed {
				task: label,
				message: err.to_string(),
			},
			Err(err) => match join_error_panic_message(err) {
				Some(message) => TaskFailure::Panicked { task: label, message },
				None => return,
			},
		};
		tracing::debug!(group = core.kind, failure = %failure, "worker.group.failure");
		core.failure.send_if_modified(|slot| {
			if slot.is_some() {
				return false;
			}
			*slot = Some(failure);
			true
		});
	}

	fn is_live(&self, key: &K) -> bool {
		self.members.lock().live.get(key).is_some_and(|m| !m.abort.is_finished())
	}

	fn len(&self) -> usize {
		self.members.lock().live.values().filter(|m| !m.abort.is_finished()).count()
	}

	async fn failed(&self) -> TaskFailure {
		let recorded = {
			let mut rx = self.failure.subscribe();
			rx.wait_for(Option::is_some).await.ok().and_then(|slot| slot.clone())
		};
		match recorded {
			Some(failure) => failure,
			None => std::future::pending().await,
		}
	}

	async fn shutdown(&self) {
		let drained: Vec<Member> = {
			let mut members = self.members.lock();
			members.closed = true;
			members.live.drain().map(|(_, m)| m).collect()
		};
		for member in &drained {
			member.abort.abort();
		}
		for member in drained {
			let _ = member.reaper.await;
		}
		tracing::trace!(group = self.kind, "worker.group.shutdown");
	}
}

/// Unbounded fail-fast group: every fork is tracked until it finishes.
#[derive(Clone)]
pub struct SupervisionSet {
	core: Arc<GroupCore<u64>>,
	keys: Arc<AtomicU64>,
}

impl Default for SupervisionSet {
	fn default() -> Self {
		Self::new()
	}
}

impl SupervisionSet {
	pub fn new() -> Self {
		Self {
			core: GroupCore::new("set"),
			keys: Arc::new(AtomicU64::new(0)),
		}
	}

	/// Starts `fut` as a new member. Returns `false` once the group has shut down.
	pub fn fork<F, E>(&self, fut: F) -> bool
	where
		F: Future<Output = Result<(), E>> + Send + 'static,
		E: Display + Send + 'static,
	{
		let key = self.keys.fetch_add(1, Ordering::Relaxed);
		let mut members = self.core.members.lock();
		self.core.start(&mut members, key, format!("#{key}"), fut)
	}

	/// Number of members still running.
	pub fn len(&self) -> usize {
		self.core.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Resolves with the first member failure. Never resolves if no member fails.
	pub async fn failed(&self) -> TaskFailure {
		self.core.failed().await
	}

	/// Interrupts every member and waits for all of them to settle.
	pub async fn shutdown(&self) {
		self.core.shutdown().await;
	}
}

/// Keyed fail-fast group holding at most one live task per key.
pub struct SupervisionMap<K> {
	core: Arc<GroupCore<K>>,
}

impl<K> Clone for SupervisionMap<K> {
	fn clone(&self) -> Self {
		Self {
			core: Arc::clone(&self.core),
		}
	}
}

impl<K> Default for SupervisionMap<K>
where
	K: Eq + Hash + Clone + Display + Send + Sync + 'static,
{
	fn default() -> Self {
		Self::new()
	}
}

impl<K> SupervisionMap<K>
where
	K: Eq + Hash + Clone + Display + Send + Sync + 'static,
{
	pub fn new() -> Self {
		Self {
			core: GroupCore::new("map"),
		}
	}

	/// Starts `fut` under `key` unless a live task already holds the key.
	///
	/// Returns `true` if the task was started.
	pub fn fork_one<F, E>(&self, key: K, fut: F) -> bool
	where
		F: Future<Output = Result<(), E>> + Send + 'static,
		E: Display + Send + 'static,
	{
		let mut members = self.core.members.lock();
		if members.live.get(&key).is_some_and(|m| !m.abort.is_finished()) {
			tracing::trace!(key = %key, "worker.group.fork_one_skipped");
			return false;
		}
		let label = key.to_string();
		self.core.start(&mut members, key, label, fut)
	}

	/// Interrupts any task under `key` and starts `fut` in its place.
	pub fn fork_replace<F, E>(&self, key: K, fut: F) -> bool
	where
		F: Future<Output = Result<(), E>> + Send + 'static,
		E: Display + Send + 'static,
	{
		let mut members = self.core.members.lock();
		let label = key.to_string();
		self.core.start(&mut members, key, label, fut)
	}

	/// True while a task registered under `key` is still running.
	pub fn contains(&self, key: &K) -> bool {
		self.core.is_live(key)
	}

	pub fn len(&self) -> usize {
		self.core.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Resolves with the first member failure. Never resolves if no member fails.
	pub async fn failed(&self) -> TaskFailure {
		self.core.failed().await
	}

	/// Interrupts every member and waits for all of them to settle.
	pub async fn shutdown(&self) {
		self.core.shutdown().await;
	}
}
