//! Untyped request ingress: decode, dispatch, encode the full outcome.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::{Actor, CodecError, Machine, MachineError, MachineSender, SendError, Tagged};

/// Complete outcome of a request in a serializable shape.
///
/// Encodes as `{"_tag":"Success","value":..}` or `{"_tag":"Failure","cause":..}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "_tag")]
pub enum Exit<A, E> {
	Success { value: A },
	Failure { cause: Cause<E> },
}

/// Why a request failed: its procedure's declared error, or a defect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "_tag")]
pub enum Cause<E> {
	Fail { error: E },
	Die { defect: MachineError },
}

impl<A, E> From<Result<A, SendError<E>>> for Exit<A, E> {
	fn from(result: Result<A, SendError<E>>) -> Self {
		match result {
			Ok(value) => Self::Success { value },
			Err(SendError::Failed(error)) => Self::Failure { cause: Cause::Fail { error } },
			Err(SendError::Defect(defect)) => Self::Failure { cause: Cause::Die { defect } },
		}
	}
}

impl<A, E> Exit<A, E> {
	pub fn is_success(&self) -> bool {
		matches!(self, Self::Success { .. })
	}
}

impl<M> MachineSender<M>
where
	M: Machine,
	M::Request: DeserializeOwned,
	M::Response: Serialize,
	M::Error: Serialize,
{
	/// Decodes `raw` as a public request, sends it and encodes the [`Exit`].
	///
	/// Decode failures, including well-formed requests outside the public
	/// partition, are returned to the caller and never reach the machine.
	pub async fn send_unknown(&self, raw: serde_json::Value) -> Result<serde_json::Value, CodecError> {
		let request: M::Request = serde_json::from_value(raw).map_err(|source| CodecError::Decode { what: "request", source })?;
		let tag = request.tag();
		if !self.is_public(tag) {
			return Err(CodecError::NotPublic(tag));
		}
		let exit = Exit::from(self.send_await(request).await);
		serde_json::to_value(&exit).map_err(|source| CodecError::Encode { what: "exit", source })
	}
}

impl<M> Actor<M>
where
	M: Machine,
	M::Request: DeserializeOwned,
	M::Response: Serialize,
	M::Error: Serialize,
{
	pub async fn send_unknown(&self, raw: serde_json::Value) -> Result<serde_json::Value, CodecError> {
		self.sender().send_unknown(raw).await
	}
}
