//! Live machine instances: boot, the supervised restart loop, senders and observation.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use automat_worker::{Deferred, DeferredDropped, GenerationClock, GenerationToken, JoinCtrl, Mailbox, MailboxClosed, MailboxReceiver, MailboxSender, TaskClass};
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::config::{RETRY_HISTORY, RetryAttempt};
use crate::dispatch::{AttemptScope, Envelope, run_attempt};
use crate::procedure::RouteInfo;
use crate::publisher::StatePublisher;
use crate::{Machine, MachineConfig, MachineError, MachineErrorKind, SendError, StateStream, Tagged};

/// Boot progress observed by [`boot`]'s caller.
#[derive(Debug, Clone)]
pub(crate) enum Readiness {
	Pending,
	Ready,
	Failed(MachineError),
}

/// State shared by an actor handle, its senders and its supervisor.
pub(crate) struct Shared<M: Machine> {
	pub(crate) machine: Arc<M>,
	pub(crate) input: Arc<M::Input>,
	pub(crate) config: MachineConfig,
	pub(crate) publisher: StatePublisher<M::State>,
	routes: ArcSwapOption<RouteInfo>,
	mailbox: MailboxSender<Envelope<M>>,
	terminal: OnceLock<MachineError>,
	clock: GenerationClock,
	restarts: AtomicUsize,
}

impl<M: Machine> Shared<M> {
	pub(crate) fn install_routes(&self, routes: Arc<RouteInfo>) {
		self.routes.store(Some(routes));
	}

	pub(crate) fn routes(&self) -> Option<Arc<RouteInfo>> {
		self.routes.load_full()
	}

	/// Identifier of the installed procedure table, empty before the first one.
	pub(crate) fn identifier(&self) -> Arc<str> {
		match self.routes() {
			Some(routes) => Arc::clone(&routes.identifier),
			None => Arc::from(""),
		}
	}

	/// Cause reported to senders once the mailbox refuses envelopes.
	fn closed_cause(&self) -> MachineError {
		match self.terminal.get() {
			Some(cause) => cause.clone(),
			None => MachineError::interrupted("machine is shutting down"),
		}
	}

	fn offer(&self, envelope: Envelope<M>) -> Result<(), MachineError> {
		self.mailbox.offer(envelope).map_err(|MailboxClosed(_)| self.closed_cause())
	}
}

/// Cloneable handle for posting requests into one machine's mailbox.
pub struct MachineSender<M: Machine> {
	shared: Arc<Shared<M>>,
}

impl<M: Machine> Clone for MachineSender<M> {
	fn clone(&self) -> Self {
		Self {
			shared: Arc::clone(&self.shared),
		}
	}
}

impl<M: Machine> MachineSender<M> {
	pub(crate) fn new(shared: Arc<Shared<M>>) -> Self {
		Self { shared }
	}

	/// Alias of [`Self::send_await`].
	pub async fn send(&self, request: M::Request) -> Result<M::Response, SendError<M::Error>> {
		self.send_await(request).await
	}

	/// Enqueues `request` and waits for its reply.
	///
	/// Dropping the returned future abandons the reply; a request still queued
	/// at that point is skipped by the dispatch loop.
	pub async fn send_await(&self, request: M::Request) -> Result<M::Response, SendError<M::Error>> {
		let tag = request.tag();
		let traced = self.shared.config.tracing;
		let (reply, wait) = Deferred::new();
		self.shared.offer(Envelope {
			request,
			reply,
			parent: tracing::Span::current(),
			traced,
		})?;

		let outcome = if traced {
			let span = tracing::info_span!("machine.send", machine = %self.identifier(), tag);
			wait.wait().instrument(span).await
		} else {
			wait.wait().await
		};
		match outcome {
			Ok(result) => result,
			Err(DeferredDropped) => Err(SendError::Defect(MachineError::new(
				MachineErrorKind::Handler,
				format!("procedure `{tag}` finished without replying"),
			))),
		}
	}

	/// Enqueues `request` without waiting. Fails only if the machine has terminated.
	pub fn send_ignore(&self, request: M::Request) -> Result<(), MachineError> {
		self.shared.offer(Envelope {
			request,
			reply: Deferred::detached(),
			parent: tracing::Span::current(),
			traced: self.shared.config.tracing,
		})
	}

	/// Boundary entry point: like [`Self::send_await`] but refuses any tag
	/// outside the public partition without invoking a procedure.
	pub async fn send_external(&self, request: M::Request) -> Result<M::Response, SendError<M::Error>> {
		let tag = request.tag();
		if let Some(routes) = self.shared.routes()
			&& !routes.is_public(tag)
		{
			tracing::warn!(machine = %routes.identifier, tag, "machine.internal_request");
			return Err(SendError::Defect(MachineError::internal_request(tag, routes.is_known(tag))));
		}
		self.send_await(request).await
	}

	/// True if `tag` belongs to the public partition of the current procedure table.
	pub fn is_public(&self, tag: &str) -> bool {
		self.shared.routes().is_some_and(|routes| routes.is_public(tag))
	}

	/// Identifier of the current procedure table.
	pub fn identifier(&self) -> Arc<str> {
		self.shared.identifier()
	}
}

/// Handle on a running machine instance.
///
/// Dropping the handle interrupts the instance: the running attempt, its
/// forked tasks and any queued requests are torn down in that order.
pub struct Actor<M: Machine> {
	shared: Arc<Shared<M>>,
	sender: MachineSender<M>,
	cancel: CancellationToken,
	join_ctrl: Arc<JoinCtrl<MachineError>>,
}

impl<M: Machine> Drop for Actor<M> {
	fn drop(&mut self) {
		self.cancel.cancel();
		self.shared.mailbox.close();
	}
}

/// Boots `machine` with `input` and waits until its first state is published.
///
/// Fails if the instance terminates (retries included) before that.
pub async fn boot<M: Machine>(machine: M, input: M::Input) -> Result<Actor<M>, MachineError> {
	boot_from(Arc::new(machine), input, None).await
}

/// [`boot`] with a shared definition and a state handed to the first `initialize` as `previous`.
pub async fn boot_from<M: Machine>(machine: Arc<M>, input: M::Input, previous: Option<Arc<M::State>>) -> Result<Actor<M>, MachineError> {
	let config = machine.config();
	let mailbox = Mailbox::new();
	let shared = Arc::new(Shared {
		machine,
		input: Arc::new(input),
		publisher: StatePublisher::new(config.state_buffer),
		config,
		routes: ArcSwapOption::const_empty(),
		mailbox: mailbox.sender(),
		terminal: OnceLock::new(),
		clock: GenerationClock::new(),
		restarts: AtomicUsize::new(0),
	});
	let (ready_tx, mut ready_rx) = watch::channel(Readiness::Pending);
	let cancel = CancellationToken::new();

	tracing::debug!(class = shared.config.class.as_str(), "machine.boot");
	let supervisor = automat_worker::spawn(
		TaskClass::Supervisor,
		supervise(Arc::clone(&shared), mailbox.receiver(), cancel.clone(), Arc::new(ready_tx), previous),
	);
	// Built before waiting so that abandoning boot interrupts the instance.
	let actor = Actor {
		sender: MachineSender::new(Arc::clone(&shared)),
		shared,
		cancel,
		join_ctrl: Arc::new(JoinCtrl::new(supervisor, MachineError::from_join)),
	};

	let readiness = ready_rx.wait_for(|r| !matches!(r, Readiness::Pending)).await.map(|r| r.clone());
	match readiness {
		Ok(Readiness::Ready) => Ok(actor),
		Ok(Readiness::Failed(cause)) => Err(cause),
		// The supervisor went away without deciding; its exit says why.
		Ok(Readiness::Pending) | Err(_) => Err(actor.join().await),
	}
}

impl<M: Machine> Actor<M> {
	pub fn machine(&self) -> &Arc<M> {
		&self.shared.machine
	}

	pub fn input(&self) -> &Arc<M::Input> {
		&self.shared.input
	}

	/// Identifier of the current procedure table.
	pub fn identifier(&self) -> Arc<str> {
		self.sender.identifier()
	}

	/// Generation of the current boot attempt, starting at 1.
	pub fn generation(&self) -> u64 {
		self.shared.clock.current()
	}

	/// Number of restarts performed by the retry policy.
	pub fn restart_count(&self) -> usize {
		self.shared.restarts.load(Ordering::Acquire)
	}

	/// Synchronous read of the last published state.
	pub fn state(&self) -> Arc<M::State> {
		match self.shared.publisher.current() {
			Some(state) => state,
			None => unreachable!("an actor is only handed out after its first publish"),
		}
	}

	pub fn sender(&self) -> MachineSender<M> {
		self.sender.clone()
	}

	pub async fn send(&self, request: M::Request) -> Result<M::Response, SendError<M::Error>> {
		self.sender.send_await(request).await
	}

	pub async fn send_await(&self, request: M::Request) -> Result<M::Response, SendError<M::Error>> {
		self.sender.send_await(request).await
	}

	pub fn send_ignore(&self, request: M::Request) -> Result<(), MachineError> {
		self.sender.send_ignore(request)
	}

	pub async fn send_external(&self, request: M::Request) -> Result<M::Response, SendError<M::Error>> {
		self.sender.send_external(request).await
	}

	/// Receiver of every state published after this call.
	pub fn subscribe(&self) -> broadcast::Receiver<Arc<M::State>> {
		self.shared.publisher.subscribe()
	}

	/// Feed of future state changes.
	pub fn stream(&self) -> StateStream<M::State> {
		self.shared.publisher.stream()
	}

	/// Current state followed by every later change.
	pub fn stream_with_initial(&self) -> StateStream<M::State> {
		self.shared.publisher.stream_with_initial()
	}

	/// Waits until the instance is permanently dead and returns why.
	pub async fn join(&self) -> MachineError {
		self.join_ctrl.join().await
	}

	/// Terminal cause if the instance is already dead.
	pub fn try_exit(&self) -> Option<MachineError> {
		self.shared.terminal.get().cloned()
	}

	/// Requests termination without waiting. No restart follows.
	pub fn interrupt(&self) {
		self.cancel.cancel();
		self.shared.mailbox.close();
	}

	/// Interrupts the instance and waits for teardown to finish.
	pub async fn shutdown(&self) -> MachineError {
		self.interrupt();
		self.join().await
	}
}

/// Runs [`restart_loop`] and tears the instance down however that loop ends.
async fn supervise<M: Machine>(
	shared: Arc<Shared<M>>,
	rx: MailboxReceiver<Envelope<M>>,
	cancel: CancellationToken,
	ready: Arc<watch::Sender<Readiness>>,
	previous: Option<Arc<M::State>>,
) -> MachineError {
	let restarts = automat_worker::spawn(
		TaskClass::Supervisor,
		restart_loop(Arc::clone(&shared), rx.clone(), cancel.clone(), Arc::clone(&ready), previous),
	);
	let cause = match restarts.await {
		Ok(cause) => cause,
		Err(err) => {
			let cause = MachineError::from_join(err);
			tracing::error!(machine = %shared.identifier(), reason = %cause, "machine.supervisor_failed");
			cause
		}
	};
	// Stops an attempt left running by a loop that died mid-restart.
	cancel.cancel();

	let _ = shared.terminal.set(cause.clone());
	shared.mailbox.close();
	drain(&rx, &cause);
	shared.publisher.close();
	ready.send_if_modified(|r| match r {
		Readiness::Pending => {
			*r = Readiness::Failed(cause.clone());
			true
		}
		_ => false,
	});
	tracing::debug!(machine = %shared.identifier(), reason = %cause, "machine.terminated");
	cause
}

/// Boot attempts under the retry policy; returns the cause that ended the last one.
async fn restart_loop<M: Machine>(
	shared: Arc<Shared<M>>,
	rx: MailboxReceiver<Envelope<M>>,
	cancel: CancellationToken,
	ready: Arc<watch::Sender<Readiness>>,
	mut previous: Option<Arc<M::State>>,
) -> MachineError {
	let mut failed_attempts = 0usize;
	let mut failures = VecDeque::with_capacity(RETRY_HISTORY);
	loop {
		let generation = shared.clock.advance();
		let token = GenerationToken::child_of(generation, &cancel);
		let scope = AttemptScope::new();
		let attempt = automat_worker::spawn(
			shared.config.class,
			run_attempt(Arc::clone(&shared), rx.clone(), token.clone(), scope.clone(), previous.clone(), Arc::clone(&ready)),
		);
		let exit = match attempt.await {
			Ok(exit) => exit,
			Err(err) => MachineError::from_join(err),
		};

		token.cancel();
		scope.close(&exit).await;
		drain(&rx, &exit);

		tracing::debug!(
			machine = %shared.identifier(),
			generation,
			restarts = shared.restarts.load(Ordering::Relaxed),
			reason = %exit,
			"machine.exit"
		);

		if exit.is_interrupted() || cancel.is_cancelled() {
			return exit;
		}
		failed_attempts += 1;
		if failures.len() == RETRY_HISTORY {
			failures.pop_front();
		}
		failures.push_back(exit.clone());
		let Some(backoff) = shared.config.retry.decide(&RetryAttempt::new(failed_attempts, failures.make_contiguous())) else {
			return exit;
		};

		shared.restarts.fetch_add(1, Ordering::AcqRel);
		tracing::info!(machine = %shared.identifier(), generation, attempt = failed_attempts, backoff_ms = backoff.as_millis() as u64, reason = %exit, "machine.retry");
		previous = shared.publisher.current().or(previous);
		if backoff > Duration::ZERO {
			tokio::select! {
				_ = cancel.cancelled() => return MachineError::interrupted("interrupted during retry backoff"),
				_ = tokio::time::sleep(backoff) => {}
			}
		}
	}
}

/// Fails every queued envelope with `cause`.
fn drain<M: Machine>(rx: &MailboxReceiver<Envelope<M>>, cause: &MachineError) {
	let pending = rx.take_all();
	if !pending.is_empty() {
		tracing::debug!(pending = pending.len(), "machine.drain");
	}
	for envelope in pending {
		envelope.fail(cause);
	}
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests;
