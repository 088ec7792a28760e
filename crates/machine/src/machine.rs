use std::sync::Arc;

use async_trait::async_trait;

use crate::{MachineConfig, ProcedureTable};

/// A request value that names the procedure it is routed to.
///
/// Implemented by each machine's request enum, one tag per variant.
pub trait Tagged: Send + 'static {
	fn tag(&self) -> &'static str;
}

/// Declarative definition of a machine: how to build its procedure table.
///
/// `initialize` runs once per boot attempt. On a restart it receives the last
/// state the previous attempt published, and may resume from it or ignore it.
#[async_trait]
pub trait Machine: Sized + Send + Sync + 'static {
	/// Immutable boot argument, kept for the lifetime of the actor.
	type Input: Send + Sync + 'static;
	type State: Send + Sync + 'static;
	type Request: Tagged;
	type Response: Send + 'static;
	/// Declared failure type of the machine's procedures.
	type Error: Send + 'static;

	async fn initialize(&self, input: &Self::Input, previous: Option<Arc<Self::State>>) -> anyhow::Result<ProcedureTable<Self>>;

	fn config(&self) -> MachineConfig {
		MachineConfig::default()
	}
}
