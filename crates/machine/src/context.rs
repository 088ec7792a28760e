use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;

use automat_worker::{SupervisionMap, SupervisionSet};

use crate::dispatch::ReplyCell;
use crate::{Machine, MachineSender, Outcome, SendError};

/// Handle given to every procedure invocation.
///
/// Background work forked here belongs to the current boot attempt: a
/// non-cancellation failure of any forked task terminates the instance, and
/// every task is interrupted when the attempt ends.
pub struct ProcedureContext<M: Machine> {
	reply: ReplyCell<M>,
	set: SupervisionSet,
	map: SupervisionMap<String>,
	sender: MachineSender<M>,
	identifier: Arc<str>,
	generation: u64,
}

impl<M: Machine> Clone for ProcedureContext<M> {
	fn clone(&self) -> Self {
		Self {
			reply: self.reply.clone(),
			set: self.set.clone(),
			map: self.map.clone(),
			sender: self.sender.clone(),
			identifier: Arc::clone(&self.identifier),
			generation: self.generation,
		}
	}
}

impl<M: Machine> ProcedureContext<M> {
	pub(crate) fn new(reply: ReplyCell<M>, set: SupervisionSet, map: SupervisionMap<String>, sender: MachineSender<M>, identifier: Arc<str>, generation: u64) -> Self {
		Self {
			reply,
			set,
			map,
			sender,
			identifier,
			generation,
		}
	}

	/// Starts `task` in the unbounded group. Its normal completion is discarded.
	pub fn fork<F, E>(&self, task: F) -> bool
	where
		F: Future<Output = Result<(), E>> + Send + 'static,
		E: Display + Send + 'static,
	{
		self.set.fork(task)
	}

	/// [`Self::fork`], then moves to `state` without replying.
	pub fn fork_with<F, E>(&self, task: F, state: impl Into<Arc<M::State>>) -> Outcome<M>
	where
		F: Future<Output = Result<(), E>> + Send + 'static,
		E: Display + Send + 'static,
	{
		self.fork(task);
		Outcome::no_reply(state)
	}

	/// Starts `task` under `key` unless a task under `key` is still running.
	///
	/// Returns `true` if `task` was started.
	pub fn fork_one<F, E>(&self, key: impl Into<String>, task: F) -> bool
	where
		F: Future<Output = Result<(), E>> + Send + 'static,
		E: Display + Send + 'static,
	{
		self.map.fork_one(key.into(), task)
	}

	pub fn fork_one_with<F, E>(&self, key: impl Into<String>, task: F, state: impl Into<Arc<M::State>>) -> Outcome<M>
	where
		F: Future<Output = Result<(), E>> + Send + 'static,
		E: Display + Send + 'static,
	{
		self.fork_one(key, task);
		Outcome::no_reply(state)
	}

	/// Interrupts any task under `key` and starts `task` in its place.
	pub fn fork_replace<F, E>(&self, key: impl Into<String>, task: F) -> bool
	where
		F: Future<Output = Result<(), E>> + Send + 'static,
		E: Display + Send + 'static,
	{
		self.map.fork_replace(key.into(), task)
	}

	pub fn fork_replace_with<F, E>(&self, key: impl Into<String>, task: F, state: impl Into<Arc<M::State>>) -> Outcome<M>
	where
		F: Future<Output = Result<(), E>> + Send + 'static,
		E: Display + Send + 'static,
	{
		self.fork_replace(key, task);
		Outcome::no_reply(state)
	}

	/// True while a task forked under `key` is still running.
	pub fn is_running(&self, key: &str) -> bool {
		self.map.contains(&key.to_owned())
	}

	/// Detached handle on the caller's reply, for answering after the procedure returns.
	pub fn responder(&self) -> Responder<M> {
		Responder {
			reply: self.reply.clone(),
		}
	}

	/// Sender into this machine's own mailbox.
	pub fn sender(&self) -> &MachineSender<M> {
		&self.sender
	}

	pub fn identifier(&self) -> &str {
		&self.identifier
	}

	/// Generation of the boot attempt running this procedure.
	pub fn generation(&self) -> u64 {
		self.generation
	}
}

/// Late reply to a request whose procedure returned [`Outcome::no_reply`].
///
/// Only the first completion of a reply takes effect.
pub struct Responder<M: Machine> {
	reply: ReplyCell<M>,
}

impl<M: Machine> Clone for Responder<M> {
	fn clone(&self) -> Self {
		Self { reply: self.reply.clone() }
	}
}

impl<M: Machine> Responder<M> {
	pub fn succeed(&self, response: M::Response) -> bool {
		self.reply.complete(Ok(response))
	}

	pub fn fail(&self, error: M::Error) -> bool {
		self.reply.complete(Err(SendError::Failed(error)))
	}

	/// True once answered or once the caller stopped waiting.
	pub fn is_done(&self) -> bool {
		self.reply.is_done()
	}
}
