//! The per-attempt loop: initialize, publish, then consume the mailbox one envelope at a time.

use std::sync::Arc;

use automat_worker::{Deferred, GenerationToken, MailboxReceiver, SupervisionMap, SupervisionSet};
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::Instrument;

use crate::actor::{Readiness, Shared};
use crate::procedure::Routes;
use crate::{HandlerError, Machine, MachineError, MachineSender, ProcedureContext, SendError, Tagged};

pub(crate) type ReplyCell<M> = Deferred<Result<<M as Machine>::Response, SendError<<M as Machine>::Error>>>;

/// Unit placed on a machine's mailbox.
pub(crate) struct Envelope<M: Machine> {
	pub(crate) request: M::Request,
	pub(crate) reply: ReplyCell<M>,
	/// Span of the sending caller; procedure spans are parented to it.
	pub(crate) parent: tracing::Span,
	pub(crate) traced: bool,
}

impl<M: Machine> Envelope<M> {
	pub(crate) fn fail(self, cause: &MachineError) {
		self.reply.complete(Err(SendError::Defect(cause.clone())));
	}
}

/// Resources owned by one boot attempt, torn down by the supervisor when it ends.
pub(crate) struct AttemptScope<M: Machine> {
	pub(crate) set: SupervisionSet,
	pub(crate) map: SupervisionMap<String>,
	/// Reply of the envelope being processed, failed with the exit cause if the attempt dies mid-request.
	pub(crate) in_flight: Arc<Mutex<Option<ReplyCell<M>>>>,
}

impl<M: Machine> Clone for AttemptScope<M> {
	fn clone(&self) -> Self {
		Self {
			set: self.set.clone(),
			map: self.map.clone(),
			in_flight: Arc::clone(&self.in_flight),
		}
	}
}

impl<M: Machine> AttemptScope<M> {
	pub(crate) fn new() -> Self {
		Self {
			set: SupervisionSet::new(),
			map: SupervisionMap::new(),
			in_flight: Arc::new(Mutex::new(None)),
		}
	}

	/// Fails the in-flight reply (if any) with `cause`, then interrupts and awaits every forked task.
	pub(crate) async fn close(&self, cause: &MachineError) {
		let reply = self.in_flight.lock().take();
		if let Some(reply) = reply {
			reply.complete(Err(SendError::Defect(cause.clone())));
		}
		self.set.shutdown().await;
		self.map.shutdown().await;
	}
}

/// Runs one boot attempt to its end and returns what ended it.
pub(crate) async fn run_attempt<M: Machine>(
	shared: Arc<Shared<M>>,
	rx: MailboxReceiver<Envelope<M>>,
	token: GenerationToken,
	scope: AttemptScope<M>,
	previous: Option<Arc<M::State>>,
	ready: Arc<watch::Sender<Readiness>>,
) -> MachineError {
	let generation = token.generation();
	let init = tokio::select! {
		biased;
		_ = token.cancelled() => return MachineError::interrupted("interrupted during initialize"),
		table = shared.machine.initialize(&shared.input, previous) => table,
	};
	let routes = match init.and_then(Routes::build) {
		Ok(routes) => routes,
		Err(err) => {
			tracing::warn!(generation, error = %format_args!("{err:#}"), "machine.init_failed");
			return MachineError::initialize(&err);
		}
	};

	shared.install_routes(Arc::clone(&routes.info));
	shared.publisher.publish(Arc::clone(&routes.initial_state));
	ready.send_if_modified(|r| match r {
		Readiness::Pending => {
			*r = Readiness::Ready;
			true
		}
		_ => false,
	});
	tracing::debug!(machine = %routes.info.identifier, generation, "machine.ready");

	let mut dispatcher = Dispatcher {
		state: Arc::clone(&routes.initial_state),
		routes,
		sender: MachineSender::new(Arc::clone(&shared)),
		shared,
		scope,
		token,
	};
	loop {
		let envelope = tokio::select! {
			biased;
			_ = dispatcher.token.cancelled() => return MachineError::interrupted("machine interrupted"),
			failure = dispatcher.scope.set.failed() => return MachineError::supervision(&failure),
			failure = dispatcher.scope.map.failed() => return MachineError::supervision(&failure),
			envelope = rx.take() => match envelope {
				Some(envelope) => envelope,
				None => return MachineError::interrupted("mailbox closed"),
			},
		};
		if let Err(cause) = dispatcher.dispatch(envelope).await {
			return cause;
		}
	}
}

/// Exclusive owner of the current state for the lifetime of one attempt.
struct Dispatcher<M: Machine> {
	shared: Arc<Shared<M>>,
	routes: Routes<M>,
	state: Arc<M::State>,
	sender: MachineSender<M>,
	scope: AttemptScope<M>,
	token: GenerationToken,
}

impl<M: Machine> Dispatcher<M> {
	/// Processes one envelope. `Err` carries a defect that ends the attempt.
	async fn dispatch(&mut self, envelope: Envelope<M>) -> Result<(), MachineError> {
		let Envelope {
			request,
			reply,
			parent,
			traced,
		} = envelope;
		let tag = request.tag();
		if reply.is_done() {
			tracing::trace!(machine = %self.routes.info.identifier, tag, "machine.discard");
			return Ok(());
		}
		let Some(procedure) = self.routes.get(tag).cloned() else {
			let cause = MachineError::unknown_request(tag);
			tracing::error!(machine = %self.routes.info.identifier, tag, "machine.unknown_request");
			reply.complete(Err(SendError::Defect(cause.clone())));
			return Err(cause);
		};

		*self.scope.in_flight.lock() = Some(reply.clone());
		let ctx = ProcedureContext::new(
			reply.clone(),
			self.scope.set.clone(),
			self.scope.map.clone(),
			self.sender.clone(),
			Arc::clone(&self.routes.info.identifier),
			self.token.generation(),
		);
		let span = if traced {
			tracing::info_span!(parent: &parent, "machine.procedure", machine = %self.routes.info.identifier, tag, generation = self.token.generation())
		} else {
			parent
		};
		let invocation = procedure.invoke(request, Arc::clone(&self.state), ctx).instrument(span);

		let result = tokio::select! {
			biased;
			_ = self.token.cancelled() => Err(MachineError::interrupted("machine interrupted")),
			failure = self.scope.set.failed() => Err(MachineError::supervision(&failure)),
			failure = self.scope.map.failed() => Err(MachineError::supervision(&failure)),
			result = invocation => Ok(result),
		};
		self.scope.in_flight.lock().take();

		match result {
			Ok(Ok(outcome)) => {
				let (response, state) = outcome.into_parts();
				self.state = Arc::clone(&state);
				self.shared.publisher.publish(state);
				if let Some(response) = response {
					reply.complete(Ok(response));
				}
				Ok(())
			}
			Ok(Err(HandlerError::Failed(err))) => {
				reply.complete(Err(SendError::Failed(err)));
				Ok(())
			}
			Ok(Err(HandlerError::Defect(err))) => {
				let cause = MachineError::handler(&err);
				tracing::error!(machine = %self.routes.info.identifier, tag, error = %format_args!("{err:#}"), "machine.defect");
				reply.complete(Err(SendError::Defect(cause.clone())));
				Err(cause)
			}
			Err(cause) => {
				reply.complete(Err(SendError::Defect(cause.clone())));
				Err(cause)
			}
		}
	}
}
