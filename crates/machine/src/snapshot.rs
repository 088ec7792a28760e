//! Persisting and resuming machine instances.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::{Actor, CodecError, Machine, RestoreError, boot_from};

/// Encoded `(input, state)` pair of one instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
	pub input: serde_json::Value,
	pub state: serde_json::Value,
}

/// Conversion between a value and its untyped representation.
pub trait StateCodec<T> {
	fn encode(&self, value: &T) -> Result<serde_json::Value, CodecError>;
	fn decode(&self, raw: &serde_json::Value) -> Result<T, CodecError>;
}

/// Plain serde codec.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl<T> StateCodec<T> for JsonCodec
where
	T: Serialize + DeserializeOwned,
{
	fn encode(&self, value: &T) -> Result<serde_json::Value, CodecError> {
		serde_json::to_value(value).map_err(|source| CodecError::Encode {
			what: std::any::type_name::<T>(),
			source,
		})
	}

	fn decode(&self, raw: &serde_json::Value) -> Result<T, CodecError> {
		T::deserialize(raw).map_err(|source| CodecError::Decode {
			what: std::any::type_name::<T>(),
			source,
		})
	}
}

impl<M: Machine> Actor<M> {
	/// Encodes the boot input and a synchronous read of the current state.
	pub fn snapshot(&self) -> Result<Snapshot, CodecError>
	where
		M::Input: Serialize + DeserializeOwned,
		M::State: Serialize + DeserializeOwned,
	{
		self.snapshot_with(&JsonCodec, &JsonCodec)
	}

	pub fn snapshot_with(&self, input: &impl StateCodec<M::Input>, state: &impl StateCodec<M::State>) -> Result<Snapshot, CodecError> {
		Ok(Snapshot {
			input: input.encode(self.input().as_ref())?,
			state: state.encode(self.state().as_ref())?,
		})
	}
}

/// Decodes `snapshot` and boots `machine` with its state as `previous`.
pub async fn restore<M>(machine: M, snapshot: &Snapshot) -> Result<Actor<M>, RestoreError>
where
	M: Machine,
	M::Input: Serialize + DeserializeOwned,
	M::State: Serialize + DeserializeOwned,
{
	restore_with(machine, snapshot, &JsonCodec, &JsonCodec).await
}

pub async fn restore_with<M>(machine: M, snapshot: &Snapshot, input: &impl StateCodec<M::Input>, state: &impl StateCodec<M::State>) -> Result<Actor<M>, RestoreError>
where
	M: Machine,
{
	let input = input.decode(&snapshot.input)?;
	let state = state.decode(&snapshot.state)?;
	tracing::debug!("machine.restore");
	Ok(boot_from(Arc::new(machine), input, Some(Arc::new(state))).await?)
}
