//! Pipeline sequencer
//!
//! Exposes a cooperative, one-step-at-a-time control protocol to a driver
//! loop. The driver awaits [`Pipeline::next`], which yields
//! [`Event::Next`] when the node under the cursor is ready, and answers with
//! [`Pipeline::exec`] or [`Pipeline::skip`]. After the last node the
//! pipeline finalises (stops detached containers, drains log tasks) and
//! yields [`Event::Done`] exactly once.
//!
//! Nodes and finalisation run on spawned tasks, so dropping a pending
//! `next()` future (e.g. inside `tokio::select!`) never loses progress.

use sluice_core::EngineError;
use sluice_core::domain::ExecutionState;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use tokio::sync::Notify;
use tokio::task::{JoinError, JoinHandle};
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::context::BuildContext;
use crate::node::Node;

/// What the driver loop should do next
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// The node at this index is ready; call `exec()` or `skip()`
    Next(usize),
    /// Terminal result: the first recorded error, or success
    Done(Result<(), EngineError>),
}

type Task = JoinHandle<Result<(), EngineError>>;

enum Phase {
    /// Cursor moved; `Next` not yet announced
    Pending,
    /// `Next` announced; waiting for `exec()` or `skip()`
    Waiting,
    /// Node executing, or emitting its skip status lines
    Running(Task),
    Finalizing(Task),
    Done,
}

const ACTIVE: u8 = 0;
const STOPPED: u8 = 1;
const FINISHED: u8 = 2;

/// Terminal-transition arbiter shared with stop handles
///
/// Whichever of `stop()` and natural completion wins the compare-exchange
/// decides the single `Done` event.
struct Control {
    status: AtomicU8,
    notify: Notify,
}

impl Control {
    fn new() -> Self {
        Self {
            status: AtomicU8::new(ACTIVE),
            notify: Notify::new(),
        }
    }

    fn stop(&self) -> bool {
        let won = self
            .status
            .compare_exchange(ACTIVE, STOPPED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if won {
            self.notify.notify_one();
        }
        won
    }

    fn finish(&self) -> bool {
        self.status
            .compare_exchange(ACTIVE, FINISHED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn is_stopped(&self) -> bool {
        self.status.load(Ordering::Acquire) == STOPPED
    }

    async fn stopped(&self) {
        loop {
            if self.is_stopped() {
                return;
            }
            self.notify.notified().await;
        }
    }
}

/// Cloneable handle for cancelling a pipeline from another task
#[derive(Clone)]
pub struct StopHandle {
    control: Arc<Control>,
}

impl StopHandle {
    /// Requests cancellation
    ///
    /// Returns `false` if the pipeline already completed or was already
    /// stopped; never panics.
    pub fn stop(&self) -> bool {
        self.control.stop()
    }
}

/// One executable pipeline
pub struct Pipeline {
    ctx: Arc<BuildContext>,
    nodes: Vec<Arc<dyn Node>>,
    head: usize,
    phase: Phase,
    aborted: bool,
    control: Arc<Control>,
    orphans: Vec<Task>,
    torn_down: bool,
}

impl Pipeline {
    pub(crate) fn new(ctx: Arc<BuildContext>, nodes: Vec<Arc<dyn Node>>) -> Self {
        Self {
            ctx,
            nodes,
            head: 0,
            phase: Phase::Pending,
            aborted: false,
            control: Arc::new(Control::new()),
            orphans: Vec::new(),
            torn_down: false,
        }
    }

    pub fn id(&self) -> Uuid {
        self.ctx.pipeline_id()
    }

    pub fn context(&self) -> &Arc<BuildContext> {
        &self.ctx
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Node under the cursor
    pub fn head(&self) -> Option<&Arc<dyn Node>> {
        self.nodes.get(self.head)
    }

    pub fn tail(&self) -> Option<&Arc<dyn Node>> {
        self.nodes.last()
    }

    pub fn state(&self) -> ExecutionState {
        self.ctx.state()
    }

    /// First non-zero step exit code, or 0
    pub fn exit_code(&self) -> i32 {
        self.ctx.exit_code()
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            control: Arc::clone(&self.control),
        }
    }

    /// Requests cancellation; see [`StopHandle::stop`]
    pub fn stop(&self) -> bool {
        self.control.stop()
    }

    /// Runs the announced node in the background
    pub fn exec(&mut self) {
        if !matches!(self.phase, Phase::Waiting) {
            warn!(pipeline = %self.id(), "exec() called with no node ready");
            return;
        }
        let Some(node) = self.nodes.get(self.head).cloned() else {
            return;
        };

        self.ctx.set_state(ExecutionState::Running);
        debug!(pipeline = %self.id(), node = %node.name(), "Executing node {}", self.head);

        let ctx = Arc::clone(&self.ctx);
        let span = info_span!("node", pipeline = %self.id(), node = %node.name());
        self.phase = Phase::Running(tokio::spawn(
            async move { node.run(ctx).await }.instrument(span),
        ));
    }

    /// Advances past the announced node without running it
    pub fn skip(&mut self) {
        if !matches!(self.phase, Phase::Waiting) {
            warn!(pipeline = %self.id(), "skip() called with no node ready");
            return;
        }
        let Some(node) = self.nodes.get(self.head).cloned() else {
            return;
        };
        info!(pipeline = %self.id(), node = %node.name(), "Skipping node");

        let ctx = Arc::clone(&self.ctx);
        self.phase = Phase::Running(tokio::spawn(async move {
            node.skip(&ctx).await;
            Ok::<_, EngineError>(())
        }));
    }

    /// Waits for the next protocol event
    ///
    /// Returns `None` once `Done` has been delivered. Cancel-safe.
    pub async fn next(&mut self) -> Option<Event> {
        let control = Arc::clone(&self.control);

        loop {
            if matches!(self.phase, Phase::Done) {
                return None;
            }
            if control.is_stopped() {
                return Some(self.cancel());
            }

            let transition = match &mut self.phase {
                Phase::Pending => Transition::Announce,
                Phase::Waiting => {
                    control.stopped().await;
                    continue;
                }
                Phase::Running(task) => tokio::select! {
                    joined = task => Transition::Completed(flatten(joined)),
                    _ = control.stopped() => continue,
                },
                Phase::Finalizing(task) => tokio::select! {
                    joined = task => Transition::Finished(flatten(joined)),
                    _ = control.stopped() => continue,
                },
                Phase::Done => return None,
            };

            match transition {
                Transition::Announce => {
                    if self.nodes.is_empty() {
                        debug!(pipeline = %self.id(), "Empty pipeline, finalizing");
                        self.finalize();
                        continue;
                    }
                    self.phase = Phase::Waiting;
                    return Some(Event::Next(self.head));
                }
                Transition::Completed(result) => {
                    self.record(result);
                    self.advance();
                }
                Transition::Finished(result) => return Some(self.finish(result)),
            }
        }
    }

    fn record(&mut self, result: Result<(), EngineError>) {
        let error = match result {
            Ok(()) => return,
            Err(e) if e.is_skip() => return,
            Err(e) => e,
        };

        if error.is_fatal() {
            error!(pipeline = %self.id(), "Pipeline aborted: {}", error);
            self.aborted = true;
        }
        self.ctx.record_error(error);
    }

    /// Moves the cursor forward, or finalises after the tail
    fn advance(&mut self) {
        let remaining = self.nodes.len().saturating_sub(self.head + 1);

        if self.aborted || remaining == 0 {
            if self.aborted && remaining > 0 {
                warn!(
                    pipeline = %self.id(),
                    "Not running {} remaining node(s) after abort", remaining
                );
            }
            self.finalize();
        } else {
            self.head += 1;
            self.phase = Phase::Pending;
        }
    }

    fn finalize(&mut self) {
        let ctx = Arc::clone(&self.ctx);
        self.phase = Phase::Finalizing(tokio::spawn(async move { ctx.finalize().await }));
    }

    fn finish(&mut self, result: Result<(), EngineError>) -> Event {
        if !self.control.finish() {
            // stop() won the race
            return self.cancel();
        }

        self.phase = Phase::Done;
        let state = ExecutionState::from_result(&result);
        self.ctx.set_state(state);
        info!(pipeline = %self.id(), "Pipeline finished: {}", state);
        Event::Done(result)
    }

    fn cancel(&mut self) -> Event {
        match std::mem::replace(&mut self.phase, Phase::Done) {
            Phase::Running(task) | Phase::Finalizing(task) => self.orphans.push(task),
            _ => {}
        }

        self.ctx.set_state(ExecutionState::Cancelled);
        warn!(pipeline = %self.id(), "Pipeline cancelled");
        Event::Done(Err(EngineError::Cancelled))
    }

    /// Removes every container, volume and network the pipeline created
    ///
    /// Aborts any node still running. Consuming `self` makes this a
    /// one-shot operation.
    pub async fn teardown(mut self) {
        match std::mem::replace(&mut self.phase, Phase::Done) {
            Phase::Running(task) | Phase::Finalizing(task) => task.abort(),
            _ => {}
        }
        for task in self.orphans.drain(..) {
            task.abort();
        }

        self.ctx.teardown().await;
        self.torn_down = true;
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        if self.torn_down {
            return;
        }

        for task in self.orphans.drain(..) {
            task.abort();
        }
        if let Phase::Running(task) | Phase::Finalizing(task) = &self.phase {
            task.abort();
        }

        // Best effort: only possible from inside a runtime
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let ctx = Arc::clone(&self.ctx);
                handle.spawn(async move { ctx.teardown().await });
            }
            Err(_) => warn!(pipeline = %self.id(), "Pipeline dropped without teardown"),
        }
    }
}

enum Transition {
    Announce,
    Completed(Result<(), EngineError>),
    Finished(Result<(), EngineError>),
}

fn flatten(joined: Result<Result<(), EngineError>, JoinError>) -> Result<(), EngineError> {
    match joined {
        Ok(result) => result,
        Err(e) => {
            error!("Node task panicked: {}", e);
            Err(EngineError::Panic(e.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::testing::{Call, Script, ScriptedRuntime, run_to_end};
    use crate::scheduler::PipelineBuilder;
    use crate::service::EnvTracer;
    use sluice_core::domain::{Line, LineKind, PipelineSpec, Step};
    use tokio::sync::mpsc;

    async fn build(
        runtime: &Arc<ScriptedRuntime>,
        spec: PipelineSpec,
    ) -> (Pipeline, mpsc::Receiver<Line>) {
        PipelineBuilder::new(runtime.clone())
            .build(&spec)
            .await
            .unwrap()
    }

    fn three_steps() -> PipelineSpec {
        PipelineSpec::new("ci")
            .with_step(Step::new("a", "alpine"))
            .with_step(Step::new("b", "alpine"))
            .with_step(Step::new("c", "alpine"))
    }

    #[tokio::test]
    async fn test_each_step_announced_then_done() {
        let runtime = Arc::new(ScriptedRuntime::new().with("b", Script::exit(0).stdout(["hi"])));
        let (pipeline, pipe) = build(&runtime, three_steps()).await;

        let run = run_to_end(pipeline, pipe).await;

        assert_eq!(run.nexts, vec![0, 1, 2]);
        assert_eq!(run.result, Ok(()));
        assert_eq!(run.state, ExecutionState::Succeeded);
        assert_eq!(run.exit_code, 0);
        for step in ["a", "b", "c"] {
            let exit = run
                .lines_of(step)
                .into_iter()
                .find(|l| l.kind == LineKind::ExitCode)
                .unwrap();
            assert_eq!(exit.out, "0");
        }
    }

    #[tokio::test]
    async fn test_failure_reported_on_done_with_exit_line() {
        let runtime = Arc::new(ScriptedRuntime::new().with("a", Script::exit(7)));
        let spec = PipelineSpec::new("ci").with_step(Step::new("a", "alpine"));
        let (pipeline, pipe) = build(&runtime, spec).await;

        let run = run_to_end(pipeline, pipe).await;

        assert_eq!(
            run.result,
            Err(EngineError::Exit {
                step: "a".to_string(),
                code: 7
            })
        );
        assert_eq!(run.state, ExecutionState::Failed);
        assert_eq!(run.exit_code, 7);
        assert_eq!(run.lines_of("a").last().unwrap().out, "7");
    }

    #[tokio::test]
    async fn test_oom_fails_pipeline() {
        let runtime = Arc::new(ScriptedRuntime::new().with("a", Script::oom()));
        let spec = PipelineSpec::new("ci").with_step(Step::new("a", "alpine"));
        let (pipeline, pipe) = build(&runtime, spec).await;

        let run = run_to_end(pipeline, pipe).await;
        assert!(matches!(run.result, Err(EngineError::Oom { .. })));
    }

    #[tokio::test]
    async fn test_failure_short_circuits_remaining_steps() {
        let runtime = Arc::new(ScriptedRuntime::new().with("a", Script::exit(1)));
        let spec = PipelineSpec::new("ci")
            .with_step(Step::new("a", "alpine"))
            .with_step(Step::new("b", "alpine"))
            .with_step(Step::new("c", "alpine").on_failure());
        let (pipeline, pipe) = build(&runtime, spec).await;

        let run = run_to_end(pipeline, pipe).await;

        assert!(runtime.created("a"));
        assert!(!runtime.created("b"));
        assert!(runtime.created("c"));
        assert_eq!(run.lines_of("b")[0].out, "skipped");
        assert_eq!(run.exit_code, 1);
    }

    #[tokio::test]
    async fn test_detached_step_does_not_block_completion() {
        let runtime = Arc::new(ScriptedRuntime::new().with("db", Script::hang()));
        let spec = PipelineSpec::new("ci")
            .with_service(Step::new("db", "postgres"))
            .with_step(Step::new("test", "alpine"));
        let (pipeline, pipe) = build(&runtime, spec).await;

        let run = run_to_end(pipeline, pipe).await;

        assert_eq!(run.result, Ok(()));
        let calls = runtime.calls();
        assert!(!calls.contains(&Call::Wait("db".to_string())));
        // Stopped at finalisation, removed at teardown
        assert!(calls.contains(&Call::Stop("db".to_string())));
        assert!(calls.contains(&Call::Remove("db".to_string())));
    }

    #[tokio::test]
    async fn test_parallel_stage_aggregates_failure() {
        let runtime = Arc::new(ScriptedRuntime::new().with("lint", Script::exit(2)));
        let spec = PipelineSpec::new("ci")
            .with_step(Step::new("lint", "alpine").in_group("checks"))
            .with_step(Step::new("fmt", "alpine").in_group("checks"));
        let (pipeline, pipe) = build(&runtime, spec).await;

        let run = run_to_end(pipeline, pipe).await;

        assert_eq!(run.nexts, vec![0]);
        assert!(runtime.created("lint"));
        assert!(runtime.created("fmt"));
        assert_eq!(run.exit_code, 2);
        assert_eq!(run.state, ExecutionState::Failed);
    }

    #[tokio::test]
    async fn test_positions_strictly_increase_per_step() {
        let runtime = Arc::new(ScriptedRuntime::new().with(
            "a",
            Script::exit(0).stdout(["1", "2", "3"]).stderr(["e1", "e2"]),
        ));
        let spec = PipelineSpec::new("ci").with_step(Step::new("a", "alpine"));
        let (pipeline, pipe) = build(&runtime, spec).await;

        let run = run_to_end(pipeline, pipe).await;
        let positions: Vec<usize> = run.lines_of("a").iter().map(|l| l.pos).collect();

        assert_eq!(positions, (0..6).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_stop_while_waiting_cancels() {
        let runtime = Arc::new(ScriptedRuntime::new());
        let (mut pipeline, _pipe) = build(&runtime, three_steps()).await;

        assert_eq!(pipeline.next().await, Some(Event::Next(0)));
        assert!(pipeline.stop());
        assert!(!pipeline.stop());

        assert_eq!(pipeline.next().await, Some(Event::Done(Err(EngineError::Cancelled))));
        assert_eq!(pipeline.next().await, None);
        assert_eq!(pipeline.state(), ExecutionState::Cancelled);
        assert!(!runtime.created("a"));
        pipeline.teardown().await;
    }

    #[tokio::test]
    async fn test_stop_while_running_cancels_and_teardown_removes() {
        let runtime = Arc::new(ScriptedRuntime::new().with("a", Script::hang()));
        let (mut pipeline, _pipe) = build(&runtime, three_steps()).await;
        let stop = pipeline.stop_handle();

        assert_eq!(pipeline.next().await, Some(Event::Next(0)));
        pipeline.exec();

        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            stop.stop();
        });

        assert_eq!(pipeline.next().await, Some(Event::Done(Err(EngineError::Cancelled))));
        pipeline.teardown().await;

        assert!(runtime.calls().contains(&Call::Remove("a".to_string())));
        assert!(!runtime.created("b"));
    }

    #[tokio::test]
    async fn test_stop_after_done_is_noop() {
        let runtime = Arc::new(ScriptedRuntime::new());
        let spec = PipelineSpec::new("ci").with_step(Step::new("a", "alpine"));
        let (mut pipeline, _pipe) = build(&runtime, spec).await;
        let stop = pipeline.stop_handle();

        assert_eq!(pipeline.next().await, Some(Event::Next(0)));
        pipeline.exec();
        assert_eq!(pipeline.next().await, Some(Event::Done(Ok(()))));

        assert!(!stop.stop());
        assert!(!pipeline.stop());
        assert_eq!(pipeline.next().await, None);
        assert_eq!(pipeline.state(), ExecutionState::Succeeded);
        pipeline.teardown().await;
    }

    #[tokio::test]
    async fn test_skip_advances_without_running() {
        let runtime = Arc::new(ScriptedRuntime::new());
        let (mut pipeline, mut pipe) = build(&runtime, three_steps()).await;

        let mut done = None;
        while let Some(event) = pipeline.next().await {
            match event {
                Event::Next(1) => pipeline.skip(),
                Event::Next(_) => pipeline.exec(),
                Event::Done(result) => done = Some(result),
            }
        }

        assert_eq!(done, Some(Ok(())));
        assert!(runtime.created("a"));
        assert!(!runtime.created("b"));
        assert!(runtime.created("c"));

        let mut status = Vec::new();
        while let Ok(line) = pipe.try_recv() {
            if line.kind == LineKind::Metadata {
                status.push((line.step, line.out));
            }
        }
        assert_eq!(status, vec![("b".to_string(), "skipped".to_string())]);
        pipeline.teardown().await;
    }

    #[tokio::test]
    async fn test_exec_outside_waiting_is_ignored() {
        let runtime = Arc::new(ScriptedRuntime::new());
        let (mut pipeline, _pipe) = build(&runtime, three_steps()).await;

        pipeline.exec();
        pipeline.skip();
        assert_eq!(pipeline.next().await, Some(Event::Next(0)));
        assert_eq!(pipeline.head().unwrap().name(), "a");
        pipeline.teardown().await;
    }

    #[tokio::test]
    async fn test_empty_pipeline_finishes_immediately() {
        let runtime = Arc::new(ScriptedRuntime::new());
        let (pipeline, pipe) = build(&runtime, PipelineSpec::new("empty")).await;

        let run = run_to_end(pipeline, pipe).await;
        assert!(run.nexts.is_empty());
        assert_eq!(run.result, Ok(()));
        assert_eq!(run.state, ExecutionState::Succeeded);
    }

    #[tokio::test]
    async fn test_fatal_error_aborts_remaining_nodes() {
        let mut broken = Script::exit(0);
        broken.fail_start = true;
        let runtime = Arc::new(ScriptedRuntime::new().with("a", broken));
        let spec = PipelineSpec::new("ci")
            .with_step(Step::new("a", "alpine"))
            .with_step(Step::new("b", "alpine").on_failure());
        let (pipeline, pipe) = build(&runtime, spec).await;

        let run = run_to_end(pipeline, pipe).await;

        assert!(run.result.as_ref().unwrap_err().is_fatal());
        assert_eq!(run.nexts, vec![0]);
        assert!(!runtime.created("b"));
    }

    #[tokio::test]
    async fn test_env_tracer_numbers_steps() {
        let runtime = Arc::new(ScriptedRuntime::new());
        let (pipeline, pipe) = PipelineBuilder::new(runtime.clone())
            .tracer(Arc::new(EnvTracer::new("ci-01")))
            .build(&three_steps())
            .await
            .unwrap();

        run_to_end(pipeline, pipe).await;

        let spec = runtime.spec_for("c").unwrap();
        assert_eq!(spec.environment.get("CI_STEP_NUMBER").unwrap(), "3");
        assert_eq!(spec.environment.get("CI_MACHINE").unwrap(), "ci-01");
    }

    #[tokio::test]
    async fn test_masked_values_never_reach_pipe() {
        let runtime = Arc::new(
            ScriptedRuntime::new().with("a", Script::exit(0).stdout(["password=hunter2"])),
        );
        let mut spec = PipelineSpec::new("ci").with_step(Step::new("a", "alpine"));
        spec.masked = vec!["hunter2".to_string()];
        let (pipeline, pipe) = build(&runtime, spec).await;

        let run = run_to_end(pipeline, pipe).await;
        assert!(run.lines.iter().all(|l| !l.out.contains("hunter2")));
        assert_eq!(run.lines_of("a")[0].out, "password=********");
    }
}
