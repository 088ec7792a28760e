use std::sync::atomic::AtomicUsize;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use super::*;
use crate::{HandlerError, Outcome, Procedure, ProcedureContext, ProcedureTable, RetryPolicy};

#[derive(Debug)]
enum Req {
	Increment(u32),
	Get,
	Reject,
	Crash,
	Panic,
	Gate,
	Quiet,
	Later,
	SpawnFailing,
	KeyedFailing,
	Tick,
	Unrouted,
}

impl Tagged for Req {
	fn tag(&self) -> &'static str {
		match self {
			Self::Increment(_) => "Increment",
			Self::Get => "Get",
			Self::Reject => "Reject",
			Self::Crash => "Crash",
			Self::Panic => "Panic",
			Self::Gate => "Gate",
			Self::Quiet => "Quiet",
			Self::Later => "Later",
			Self::SpawnFailing => "SpawnFailing",
			Self::KeyedFailing => "KeyedFailing",
			Self::Tick => "Tick",
			Self::Unrouted => "Unrouted",
		}
	}
}

#[derive(Default)]
struct Probe {
	inits: AtomicUsize,
	entered: Notify,
	release: Notify,
}

struct Counter {
	probe: Arc<Probe>,
	config: MachineConfig,
	fail_init: bool,
	duplicate: bool,
}

impl Counter {
	fn new() -> (Self, Arc<Probe>) {
		let probe = Arc::new(Probe::default());
		let machine = Self {
			probe: Arc::clone(&probe),
			config: MachineConfig::default(),
			fail_init: false,
			duplicate: false,
		};
		(machine, probe)
	}

	fn with_config(mut self, config: MachineConfig) -> Self {
		self.config = config;
		self
	}
}

type Reply = Result<Outcome<Counter>, HandlerError<String>>;

async fn increment(req: Req, state: Arc<u32>, _ctx: ProcedureContext<Counter>) -> Reply {
	let Req::Increment(by) = req else {
		return Err(HandlerError::defect("wrong request"));
	};
	let next = *state + by;
	Ok(Outcome::reply(next, next))
}

async fn get(_req: Req, state: Arc<u32>, _ctx: ProcedureContext<Counter>) -> Reply {
	Ok(Outcome::reply(*state, state))
}

async fn reject(_req: Req, _state: Arc<u32>, _ctx: ProcedureContext<Counter>) -> Reply {
	Err(HandlerError::Failed("rejected".to_string()))
}

async fn crash(_req: Req, _state: Arc<u32>, _ctx: ProcedureContext<Counter>) -> Reply {
	Err(HandlerError::defect("boom"))
}

async fn panics(_req: Req, _state: Arc<u32>, _ctx: ProcedureContext<Counter>) -> Reply {
	panic!("procedure panic");
}

async fn quiet(_req: Req, state: Arc<u32>, _ctx: ProcedureContext<Counter>) -> Reply {
	Ok(Outcome::no_reply(state))
}

async fn later(_req: Req, state: Arc<u32>, ctx: ProcedureContext<Counter>) -> Reply {
	let responder = ctx.responder();
	Ok(ctx.fork_with(
		async move {
			tokio::time::sleep(Duration::from_millis(10)).await;
			responder.succeed(42);
			Ok::<(), String>(())
		},
		state,
	))
}

async fn spawn_failing(_req: Req, state: Arc<u32>, ctx: ProcedureContext<Counter>) -> Reply {
	ctx.fork(async { Err::<(), _>("forked failure".to_string()) });
	Ok(Outcome::reply(*state, state))
}

async fn keyed_failing(_req: Req, state: Arc<u32>, ctx: ProcedureContext<Counter>) -> Reply {
	ctx.fork_one("sync", async { Err::<(), _>("keyed failure".to_string()) });
	Ok(Outcome::reply(*state, state))
}

#[async_trait]
impl Machine for Counter {
	type Input = u32;
	type State = u32;
	type Request = Req;
	type Response = u32;
	type Error = String;

	async fn initialize(&self, input: &u32, previous: Option<Arc<u32>>) -> anyhow::Result<ProcedureTable<Self>> {
		self.probe.inits.fetch_add(1, Ordering::SeqCst);
		if self.fail_init {
			anyhow::bail!("init refused");
		}
		let probe = Arc::clone(&self.probe);
		let gate = Procedure::new("Gate", move |_req: Req, state: Arc<u32>, _ctx: ProcedureContext<Counter>| {
			let probe = Arc::clone(&probe);
			async move {
				probe.entered.notify_one();
				probe.release.notified().await;
				Ok(Outcome::reply(*state, state))
			}
		});
		let mut table = ProcedureTable::new("counter", previous.unwrap_or_else(|| Arc::new(*input)))
			.public(Procedure::new("Increment", increment))
			.public(Procedure::new("Get", get))
			.public(Procedure::new("Reject", reject))
			.public(Procedure::new("Crash", crash))
			.public(Procedure::new("Panic", panics))
			.public(gate)
			.public(Procedure::new("Quiet", quiet))
			.public(Procedure::new("Later", later))
			.public(Procedure::new("SpawnFailing", spawn_failing))
			.public(Procedure::new("KeyedFailing", keyed_failing))
			.private(Procedure::new("Tick", get));
		if self.duplicate {
			table = table.private(Procedure::new("Get", get));
		}
		Ok(table)
	}

	fn config(&self) -> MachineConfig {
		self.config.clone()
	}
}

async fn within<F: std::future::Future>(fut: F) -> F::Output {
	tokio::time::timeout(Duration::from_secs(2), fut).await.expect("timed out")
}

async fn wait_for_generation(actor: &Actor<Counter>, generation: u64) {
	within(async {
		while actor.generation() < generation {
			tokio::time::sleep(Duration::from_millis(2)).await;
		}
	})
	.await;
}

#[tokio::test]
async fn concurrent_sends_are_serialized() {
	let (machine, _) = Counter::new();
	let actor = Arc::new(boot(machine, 0).await.unwrap());

	let mut tasks = Vec::new();
	for _ in 0..32 {
		let actor = Arc::clone(&actor);
		tasks.push(tokio::spawn(async move { actor.send(Req::Increment(1)).await.unwrap() }));
	}
	let mut replies = Vec::new();
	for task in tasks {
		replies.push(within(task).await.unwrap());
	}
	replies.sort_unstable();
	assert_eq!(replies, (1..=32).collect::<Vec<_>>());
	assert_eq!(*actor.state(), 32);
}

#[tokio::test]
async fn expected_failure_keeps_state_and_loop() {
	let (machine, _) = Counter::new();
	let actor = boot(machine, 3).await.unwrap();

	let err = actor.send(Req::Reject).await.unwrap_err();
	assert_eq!(err.failed().map(String::as_str), Some("rejected"));
	assert_eq!(*actor.state(), 3);
	assert_eq!(actor.send(Req::Increment(2)).await.unwrap(), 5);
	assert!(actor.try_exit().is_none());
}

#[tokio::test]
async fn defect_fails_the_reply_and_terminates() {
	let (machine, _) = Counter::new();
	let actor = boot(machine, 0).await.unwrap();

	let err = actor.send(Req::Crash).await.unwrap_err();
	assert_eq!(err.defect().map(MachineError::kind), Some(MachineErrorKind::Handler));

	let exit = within(actor.join()).await;
	assert_eq!(exit.kind(), MachineErrorKind::Handler);
	assert_eq!(actor.try_exit(), Some(exit.clone()));

	let late = actor.send(Req::Get).await.unwrap_err();
	assert_eq!(late.defect(), Some(&exit));
	assert!(actor.send_ignore(Req::Get).is_err());
}

#[tokio::test]
async fn panicking_procedure_is_a_defect() {
	let (machine, _) = Counter::new();
	let actor = boot(machine, 0).await.unwrap();

	let err = actor.send(Req::Panic).await.unwrap_err();
	assert_eq!(err.defect().map(MachineError::kind), Some(MachineErrorKind::Panicked));
	assert_eq!(within(actor.join()).await.kind(), MachineErrorKind::Panicked);
}

#[tokio::test]
async fn forked_failure_terminates_the_instance() {
	let (machine, _) = Counter::new();
	let actor = boot(machine, 0).await.unwrap();

	actor.send(Req::SpawnFailing).await.unwrap();
	let exit = within(actor.join()).await;
	assert_eq!(exit.kind(), MachineErrorKind::Supervision);
	assert!(exit.message().contains("forked failure"), "got {exit}");
}

#[tokio::test]
async fn keyed_fork_failure_terminates_the_instance() {
	let (machine, _) = Counter::new();
	let actor = boot(machine, 0).await.unwrap();

	actor.send(Req::KeyedFailing).await.unwrap();
	let exit = within(actor.join()).await;
	assert_eq!(exit.kind(), MachineErrorKind::Supervision);
	assert!(exit.message().contains("sync") && exit.message().contains("keyed failure"), "got {exit}");
	assert_eq!(actor.try_exit(), Some(exit));
}

#[tokio::test]
async fn panicking_retry_policy_still_tears_down() {
	let (machine, _) = Counter::new();
	let policy = RetryPolicy::custom(|_| panic!("policy bug"));
	let actor = boot(machine.with_config(MachineConfig::default().retry(policy)), 0).await.unwrap();

	assert!(actor.send(Req::Crash).await.is_err());
	let exit = within(actor.join()).await;
	assert_eq!(exit.kind(), MachineErrorKind::Panicked);
	assert!(exit.message().contains("policy bug"), "got {exit}");
	assert_eq!(actor.try_exit(), Some(exit.clone()));

	let late = within(actor.send(Req::Get)).await.unwrap_err();
	assert_eq!(late.defect(), Some(&exit));
	assert!(within(actor.stream().next()).await.is_none());
}

#[tokio::test]
async fn retry_history_is_bounded() {
	let (mut machine, probe) = Counter::new();
	machine.fail_init = true;
	let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
	let policy = RetryPolicy::custom({
		let seen = Arc::clone(&seen);
		move |attempt| {
			seen.lock().push((attempt.attempt(), attempt.failures().len()));
			(attempt.attempt() < RETRY_HISTORY + 4).then_some(Duration::ZERO)
		}
	});

	let err = within(boot(machine.with_config(MachineConfig::default().retry(policy)), 0)).await.err().expect("boot should fail");
	assert_eq!(err.kind(), MachineErrorKind::Initialize);
	assert_eq!(probe.inits.load(Ordering::SeqCst), RETRY_HISTORY + 4);

	let seen = seen.lock();
	assert_eq!(seen.first(), Some(&(1, 1)));
	assert_eq!(seen.last(), Some(&(RETRY_HISTORY + 4, RETRY_HISTORY)));
	assert!(seen.iter().all(|&(_, kept)| kept <= RETRY_HISTORY));
}

#[tokio::test]
async fn retry_resumes_from_last_published_state() {
	let (machine, probe) = Counter::new();
	let actor = boot(machine.with_config(MachineConfig::default().retry(RetryPolicy::recurs(1))), 0).await.unwrap();

	assert_eq!(actor.send(Req::Increment(5)).await.unwrap(), 5);
	assert!(actor.send(Req::Crash).await.is_err());
	wait_for_generation(&actor, 2).await;

	assert_eq!(actor.send(Req::Increment(1)).await.unwrap(), 6);
	assert_eq!(actor.restart_count(), 1);
	assert_eq!(probe.inits.load(Ordering::SeqCst), 2);

	assert!(actor.send(Req::Crash).await.is_err());
	assert_eq!(within(actor.join()).await.kind(), MachineErrorKind::Handler);
	assert_eq!(probe.inits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn exhausted_init_retries_fail_boot() {
	let (mut machine, probe) = Counter::new();
	machine.fail_init = true;
	let machine = machine.with_config(MachineConfig::default().retry(RetryPolicy::Recurs {
		times: 2,
		backoff: Duration::from_millis(1),
	}));

	let err = within(boot(machine, 0)).await.err().expect("boot should fail");
	assert_eq!(err.kind(), MachineErrorKind::Initialize);
	assert!(err.message().contains("init refused"));
	assert_eq!(probe.inits.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn duplicate_tags_fail_initialize() {
	let (mut machine, _) = Counter::new();
	machine.duplicate = true;

	let err = within(boot(machine, 0)).await.err().expect("boot should fail");
	assert_eq!(err.kind(), MachineErrorKind::Initialize);
	assert!(err.message().contains("`Get`"), "got {err}");
}

#[tokio::test]
async fn interrupt_fails_in_flight_and_queued_requests() {
	let (machine, probe) = Counter::new();
	let actor = Arc::new(boot(machine, 0).await.unwrap());

	let held = tokio::spawn({
		let actor = Arc::clone(&actor);
		async move { actor.send(Req::Gate).await }
	});
	within(probe.entered.notified()).await;
	let queued = tokio::spawn({
		let actor = Arc::clone(&actor);
		async move { actor.send(Req::Increment(1)).await }
	});
	tokio::task::yield_now().await;

	let exit = within(actor.shutdown()).await;
	assert!(exit.is_interrupted());
	let held = within(held).await.unwrap().unwrap_err();
	assert!(held.defect().is_some_and(MachineError::is_interrupted));
	let queued = within(queued).await.unwrap().unwrap_err();
	assert!(queued.defect().is_some_and(MachineError::is_interrupted));
	assert_eq!(*actor.state(), 0);
}

#[tokio::test]
async fn abandoned_request_is_skipped() {
	let (machine, probe) = Counter::new();
	let actor = Arc::new(boot(machine, 0).await.unwrap());

	let held = tokio::spawn({
		let actor = Arc::clone(&actor);
		async move { actor.send(Req::Gate).await }
	});
	within(probe.entered.notified()).await;
	let abandoned = tokio::time::timeout(Duration::from_millis(20), actor.send(Req::Increment(7))).await;
	assert!(abandoned.is_err());

	probe.release.notify_one();
	assert_eq!(within(held).await.unwrap().unwrap(), 0);
	assert_eq!(actor.send(Req::Get).await.unwrap(), 0);
}

#[tokio::test]
async fn no_reply_outcomes() {
	let (machine, _) = Counter::new();
	let actor = boot(machine, 1).await.unwrap();

	actor.send_ignore(Req::Quiet).unwrap();
	let err = actor.send_await(Req::Quiet).await.unwrap_err();
	assert!(err.defect().is_some_and(|e| e.message().contains("without replying")));
	assert!(actor.try_exit().is_none());

	assert_eq!(within(actor.send(Req::Later)).await.unwrap(), 42);
}

#[tokio::test]
async fn send_external_respects_visibility() {
	let (machine, _) = Counter::new();
	let actor = boot(machine, 4).await.unwrap();

	let err = actor.send_external(Req::Tick).await.unwrap_err();
	let defect = err.defect().expect("internal request is a defect");
	assert_eq!(defect.kind(), MachineErrorKind::InternalRequest);
	assert!(defect.message().contains("marked as internal"));
	assert!(actor.try_exit().is_none());

	assert_eq!(actor.send_external(Req::Get).await.unwrap(), 4);
	assert_eq!(actor.send(Req::Tick).await.unwrap(), 4);
}

#[tokio::test]
async fn unrouted_tag_terminates() {
	let (machine, _) = Counter::new();
	let actor = boot(machine, 0).await.unwrap();

	let err = actor.send(Req::Unrouted).await.unwrap_err();
	assert_eq!(err.defect().map(MachineError::kind), Some(MachineErrorKind::UnknownRequest));
	assert_eq!(within(actor.join()).await.kind(), MachineErrorKind::UnknownRequest);
}

#[tokio::test]
async fn dropping_the_actor_interrupts_it() {
	let (machine, _) = Counter::new();
	let actor = boot(machine, 0).await.unwrap();
	let sender = actor.sender();
	drop(actor);

	let err = within(async {
		loop {
			match sender.send(Req::Get).await {
				Ok(_) => tokio::task::yield_now().await,
				Err(err) => break err,
			}
		}
	})
	.await;
	assert!(err.defect().is_some_and(MachineError::is_interrupted));
}

#[tokio::test]
async fn traced_sends_behave_identically() {
	let (machine, _) = Counter::new();
	let actor = boot(machine.with_config(MachineConfig::default().tracing(true)), 0).await.unwrap();

	assert_eq!(actor.send(Req::Increment(2)).await.unwrap(), 2);
	assert_eq!(actor.identifier().as_ref(), "counter");
	assert_eq!(actor.generation(), 1);
}
