//! Supervised state-machine actors.
//!
//! A [`Machine`] turns its boot input into a [`ProcedureTable`]: an initial
//! state plus the procedures that handle each request tag. [`boot`] runs the
//! table behind a mailbox, one procedure invocation at a time, publishing
//! every new state to subscribers and restarting the whole instance under the
//! machine's [`RetryPolicy`] when a defect ends it.
//!
//! * [`Actor`]: handle on a running instance (send, observe, join, snapshot)
//! * [`ProcedureContext`]: what a procedure body can reach (forking, late replies)
//! * [`restore`]: boot from a [`Snapshot`] taken earlier

mod actor;
mod config;
mod context;
mod dispatch;
mod error;
mod ingress;
mod machine;
mod procedure;
mod publisher;
mod snapshot;

pub use actor::{Actor, MachineSender, boot, boot_from};
pub use automat_worker::TaskClass;
pub use config::{MachineConfig, RETRY_HISTORY, RetryAttempt, RetryPolicy};
pub use context::{ProcedureContext, Responder};
pub use error::{CodecError, HandlerError, MachineError, MachineErrorKind, RestoreError, SendError};
pub use ingress::{Cause, Exit};
pub use machine::{Machine, Tagged};
pub use procedure::{Outcome, Procedure, ProcedureFuture, ProcedureTable};
pub use publisher::StateStream;
pub use snapshot::{JsonCodec, Snapshot, StateCodec, restore, restore_with};
