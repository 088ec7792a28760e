/// Execution classes used to label spawned work in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskClass {
	/// The supervisor task that owns a machine's lifetime and restart loop.
	Supervisor,
	/// One boot attempt: `initialize` followed by the dispatch loop.
	Dispatch,
	/// Background work forked by a procedure into a supervision group.
	Forked,
	/// Short-lived bookkeeping tasks (reapers, forwarders).
	Housekeeping,
}

impl TaskClass {
	pub const fn as_str(self) -> &'static str {
		match self {
			Self::Supervisor => "supervisor",
			Self::Dispatch => "dispatch",
			Self::Forked => "forked",
			Self::Housekeeping => "housekeeping",
		}
	}
}
