//! Procedures, their outcomes, and the per-attempt routing table.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::{HandlerError, Machine, ProcedureContext};

/// Boxed future returned by a procedure body.
pub type ProcedureFuture<M> = Pin<Box<dyn Future<Output = Result<Outcome<M>, HandlerError<<M as Machine>::Error>>> + Send>>;

type Handler<M> = dyn Fn(<M as Machine>::Request, Arc<<M as Machine>::State>, ProcedureContext<M>) -> ProcedureFuture<M> + Send + Sync;
type Validator<M> = dyn Fn(&<M as Machine>::Request) -> Result<(), <M as Machine>::Error> + Send + Sync;

/// Result of one successful procedure invocation: an optional reply and the next state.
///
/// Returning the same `Arc` that was passed in keeps the state without
/// notifying subscribers; any other value is published.
pub struct Outcome<M: Machine> {
	reply: Option<M::Response>,
	state: Arc<M::State>,
}

impl<M: Machine> Outcome<M> {
	/// Answers the caller with `response` and moves to `state`.
	pub fn reply(response: M::Response, state: impl Into<Arc<M::State>>) -> Self {
		Self {
			reply: Some(response),
			state: state.into(),
		}
	}

	/// Moves to `state` without answering. The caller's reply stays open, so
	/// either send with `send_ignore` or complete it later through a
	/// [`crate::Responder`].
	pub fn no_reply(state: impl Into<Arc<M::State>>) -> Self {
		Self {
			reply: None,
			state: state.into(),
		}
	}

	/// Attaches a reply to an outcome built without one.
	#[must_use]
	pub fn with_reply(mut self, response: M::Response) -> Self {
		self.reply = Some(response);
		self
	}

	pub fn is_reply(&self) -> bool {
		self.reply.is_some()
	}

	pub fn state(&self) -> &Arc<M::State> {
		&self.state
	}

	pub(crate) fn into_parts(self) -> (Option<M::Response>, Arc<M::State>) {
		(self.reply, self.state)
	}
}

/// One message handler: a tag, an optional validation hook and an async body.
pub struct Procedure<M: Machine> {
	tag: &'static str,
	validate: Option<Arc<Validator<M>>>,
	handler: Arc<Handler<M>>,
}

impl<M: Machine> Clone for Procedure<M> {
	fn clone(&self) -> Self {
		Self {
			tag: self.tag,
			validate: self.validate.clone(),
			handler: Arc::clone(&self.handler),
		}
	}
}

impl<M: Machine> Procedure<M> {
	pub fn new<F, Fut>(tag: &'static str, handler: F) -> Self
	where
		F: Fn(M::Request, Arc<M::State>, ProcedureContext<M>) -> Fut + Send + Sync + 'static,
		Fut: Future<Output = Result<Outcome<M>, HandlerError<M::Error>>> + Send + 'static,
	{
		Self {
			tag,
			validate: None,
			handler: Arc::new(move |request, state, ctx| Box::pin(handler(request, state, ctx))),
		}
	}

	/// Adds a check run before the body. A rejection is a declared failure:
	/// the caller gets the error and the state is untouched.
	#[must_use]
	pub fn validate(mut self, check: impl Fn(&M::Request) -> Result<(), M::Error> + Send + Sync + 'static) -> Self {
		self.validate = Some(Arc::new(check));
		self
	}

	pub fn tag(&self) -> &'static str {
		self.tag
	}

	pub(crate) fn invoke(&self, request: M::Request, state: Arc<M::State>, ctx: ProcedureContext<M>) -> ProcedureFuture<M> {
		if let Some(check) = &self.validate
			&& let Err(err) = check(&request)
		{
			return Box::pin(std::future::ready(Err(HandlerError::Failed(err))));
		}
		(self.handler)(request, state, ctx)
	}
}

/// Output of [`Machine::initialize`]: identity, initial state and procedures.
///
/// Public procedures are reachable from outside the process boundary;
/// private ones only through the machine's own sender.
pub struct ProcedureTable<M: Machine> {
	identifier: String,
	initial_state: Arc<M::State>,
	public: Vec<Procedure<M>>,
	private: Vec<Procedure<M>>,
}

impl<M: Machine> ProcedureTable<M> {
	pub fn new(identifier: impl Into<String>, initial_state: impl Into<Arc<M::State>>) -> Self {
		Self {
			identifier: identifier.into(),
			initial_state: initial_state.into(),
			public: Vec::new(),
			private: Vec::new(),
		}
	}

	#[must_use]
	pub fn public(mut self, procedure: Procedure<M>) -> Self {
		self.public.push(procedure);
		self
	}

	#[must_use]
	pub fn private(mut self, procedure: Procedure<M>) -> Self {
		self.private.push(procedure);
		self
	}

	pub fn identifier(&self) -> &str {
		&self.identifier
	}

	pub fn initial_state(&self) -> &Arc<M::State> {
		&self.initial_state
	}
}

/// Tag sets of the running attempt, shared with senders.
#[derive(Debug, Clone)]
pub(crate) struct RouteInfo {
	pub(crate) identifier: Arc<str>,
	pub(crate) public: HashSet<&'static str>,
	pub(crate) private: HashSet<&'static str>,
}

impl RouteInfo {
	pub(crate) fn is_public(&self, tag: &str) -> bool {
		self.public.contains(tag)
	}

	pub(crate) fn is_known(&self, tag: &str) -> bool {
		self.public.contains(tag) || self.private.contains(tag)
	}
}

/// Flattened `tag -> procedure` index built from one [`ProcedureTable`].
pub(crate) struct Routes<M: Machine> {
	pub(crate) info: Arc<RouteInfo>,
	pub(crate) initial_state: Arc<M::State>,
	procedures: HashMap<&'static str, Procedure<M>>,
}

impl<M: Machine> Routes<M> {
	/// Indexes both partitions. Fails if any tag is registered twice.
	pub(crate) fn build(table: ProcedureTable<M>) -> anyhow::Result<Self> {
		let ProcedureTable {
			identifier,
			initial_state,
			public,
			private,
		} = table;
		let mut procedures = HashMap::with_capacity(public.len() + private.len());
		let mut public_tags = HashSet::with_capacity(public.len());
		let mut private_tags = HashSet::with_capacity(private.len());

		let mut index = |procedure: Procedure<M>, tags: &mut HashSet<&'static str>| -> anyhow::Result<()> {
			let tag = procedure.tag();
			if procedures.insert(tag, procedure).is_some() {
				anyhow::bail!("procedure table `{identifier}` registers `{tag}` more than once");
			}
			tags.insert(tag);
			Ok(())
		};
		for procedure in public {
			index(procedure, &mut public_tags)?;
		}
		for procedure in private {
			index(procedure, &mut private_tags)?;
		}

		Ok(Self {
			info: Arc::new(RouteInfo {
				identifier: identifier.into(),
				public: public_tags,
				private: private_tags,
			}),
			initial_state,
			procedures,
		})
	}

	pub(crate) fn get(&self, tag: &str) -> Option<&Procedure<M>> {
		self.procedures.get(tag)
	}
}
