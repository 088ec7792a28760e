//! Concurrency primitives underneath automat machines.
//!
//! * [`Mailbox`]: unbounded many-producer FIFO feeding one dispatch loop
//! * [`Deferred`]: single-assignment reply cell with cancel propagation
//! * [`SupervisionSet`] / [`SupervisionMap`]: fail-fast groups for forked work
//! * [`JoinCtrl`]: multi-caller join over one background task
//! * [`GenerationClock`] / [`GenerationToken`]: per-attempt cancellation scopes

mod class;
mod deferred;
mod group;
mod join;
mod mailbox;
mod spawn;
mod token;

pub use class::TaskClass;
pub use deferred::{Deferred, DeferredDropped, DeferredWait};
pub use group::{SupervisionMap, SupervisionSet, TaskFailure};
pub use join::JoinCtrl;
pub use mailbox::{Mailbox, MailboxClosed, MailboxReceiver, MailboxSender};
pub use spawn::{join_error_panic_message, spawn};
pub use token::{GenerationClock, GenerationToken};
