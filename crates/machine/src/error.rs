//! Error types surfaced by machines and their senders.

use std::fmt;

use automat_worker::TaskFailure;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classification of a defect that ended (or would end) a machine instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
pub enum MachineErrorKind {
	/// `initialize` failed, or produced an invalid procedure table.
	Initialize,
	/// A request reached the dispatch loop with no procedure for its tag.
	UnknownRequest,
	/// A request crossed the external boundary with a non-public tag.
	InternalRequest,
	/// A procedure reported a defect.
	Handler,
	/// `initialize` or a procedure panicked.
	Panicked,
	/// A task forked into a supervision group failed.
	Supervision,
	/// The instance was interrupted or shut down.
	Interrupted,
}

impl MachineErrorKind {
	pub const fn as_str(self) -> &'static str {
		match self {
			Self::Initialize => "initialize failed",
			Self::UnknownRequest => "unknown request",
			Self::InternalRequest => "internal request",
			Self::Handler => "procedure defect",
			Self::Panicked => "panicked",
			Self::Supervision => "supervised task failed",
			Self::Interrupted => "interrupted",
		}
	}
}

impl fmt::Display for MachineErrorKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Uniform wrapper for every unexpected failure of a machine instance.
///
/// Whatever went wrong internally, retry policies and `join` callers only
/// ever see this one type; [`MachineError::kind`] tells them what it was.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct MachineError {
	kind: MachineErrorKind,
	message: String,
}

impl MachineError {
	pub fn new(kind: MachineErrorKind, message: impl Into<String>) -> Self {
		Self {
			kind,
			message: message.into(),
		}
	}

	pub fn kind(&self) -> MachineErrorKind {
		self.kind
	}

	pub fn message(&self) -> &str {
		&self.message
	}

	pub fn is_interrupted(&self) -> bool {
		self.kind == MachineErrorKind::Interrupted
	}

	pub(crate) fn initialize(err: &anyhow::Error) -> Self {
		Self::new(MachineErrorKind::Initialize, format!("{err:#}"))
	}

	pub(crate) fn unknown_request(tag: &str) -> Self {
		Self::new(MachineErrorKind::UnknownRequest, format!("no procedure is registered for `{tag}`"))
	}

	pub(crate) fn internal_request(tag: &str, known: bool) -> Self {
		let message = if known {
			format!("request `{tag}` is marked as internal")
		} else {
			format!("request `{tag}` is not publicly routable")
		};
		Self::new(MachineErrorKind::InternalRequest, message)
	}

	pub(crate) fn handler(err: &anyhow::Error) -> Self {
		Self::new(MachineErrorKind::Handler, format!("{err:#}"))
	}

	pub(crate) fn panicked(message: impl Into<String>) -> Self {
		Self::new(MachineErrorKind::Panicked, message)
	}

	pub(crate) fn supervision(failure: &TaskFailure) -> Self {
		Self::new(MachineErrorKind::Supervision, failure.to_string())
	}

	pub(crate) fn interrupted(reason: &str) -> Self {
		Self::new(MachineErrorKind::Interrupted, reason)
	}

	/// Maps a failed join on a machine-owned task.
	pub(crate) fn from_join(err: tokio::task::JoinError) -> Self {
		match automat_worker::join_error_panic_message(err) {
			Some(message) => Self::panicked(message),
			None => Self::interrupted("task aborted"),
		}
	}
}

/// Failure returned to a sender.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError<E> {
	/// The procedure's declared failure. The instance is unaffected.
	#[error("request failed: {0}")]
	Failed(E),
	/// The instance hit a defect (or is dead) while handling the request.
	#[error(transparent)]
	Defect(#[from] MachineError),
}

impl<E> SendError<E> {
	pub fn failed(&self) -> Option<&E> {
		match self {
			Self::Failed(err) => Some(err),
			Self::Defect(_) => None,
		}
	}

	pub fn defect(&self) -> Option<&MachineError> {
		match self {
			Self::Failed(_) => None,
			Self::Defect(err) => Some(err),
		}
	}
}

/// Failure outcome of a procedure body.
#[derive(Debug)]
pub enum HandlerError<E> {
	/// Declared failure: completes the caller's reply, state is kept.
	Failed(E),
	/// Unexpected failure: completes the caller's reply and terminates the instance.
	Defect(anyhow::Error),
}

impl<E> HandlerError<E> {
	pub fn defect(message: impl fmt::Display) -> Self {
		Self::Defect(anyhow::anyhow!("{message}"))
	}
}

impl<E> From<anyhow::Error> for HandlerError<E> {
	fn from(err: anyhow::Error) -> Self {
		Self::Defect(err)
	}
}

/// Encode/decode failure at an untyped boundary.
#[derive(Debug, Error)]
pub enum CodecError {
	#[error("failed to decode {what}: {source}")]
	Decode {
		what: &'static str,
		#[source]
		source: serde_json::Error,
	},
	#[error("failed to encode {what}: {source}")]
	Encode {
		what: &'static str,
		#[source]
		source: serde_json::Error,
	},
	/// The value decoded to a request outside the public request union.
	#[error("request `{0}` is not part of the public request union")]
	NotPublic(&'static str),
}

/// Failure of [`crate::restore`].
#[derive(Debug, Error)]
pub enum RestoreError {
	#[error(transparent)]
	Codec(#[from] CodecError),
	#[error(transparent)]
	Boot(#[from] MachineError),
}
