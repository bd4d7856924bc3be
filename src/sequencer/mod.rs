//! Step sequencer
//!
//! The sequencer executes a [`StepProgram`] against one encoder:
//!
//! - [`ScenarioContext`] holds everything a running scenario shares between
//!   the dispatcher and the output drain loop: handles, drain state, the
//!   completion signal.
//! - [`Dispatcher`] walks the program and issues exactly one platform call
//!   per lifecycle step, judging each outcome against the expect-failure
//!   flag.
//! - [`drain`] consumes encoder events, persists output and returns buffers
//!   to the platform.
//!
//! # Expect-failure binding
//!
//! An `encode:error` marker directly after a lifecycle step makes that step
//! expect failure. A marker at the head of the queue arms the flag for the
//! next lifecycle step instead; stream steps, waits and judges pass an armed
//! flag through. `encode:release` always expects success.

pub mod drain;

use crate::codec::{CodecResult, MediaDescription, OutputBuffer, SurfaceId, VideoEncoder};
use crate::error::{AssertionFailure, Error, Result};
use crate::lock;
use crate::step::{EncodeStep, Step, StepProgram, StreamStep};
use crate::stream::{apply_params, MediaStream, StreamFactory};
use std::collections::VecDeque;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub use drain::{drain_pending, spawn_drain_loop, DrainPass};

// ---------------------------------------------------------------------------
// Completion
// ---------------------------------------------------------------------------

/// Receiving half of a scenario's completion signal
pub type CompletionReceiver = oneshot::Receiver<Result<()>>;

/// One-shot completion signal shared by the dispatcher and the drain loop.
///
/// The first invocation delivers its result; later ones are counted and
/// logged.
#[derive(Debug)]
pub struct Completion {
    tx: Mutex<Option<oneshot::Sender<Result<()>>>>,
    invocations: AtomicUsize,
}

impl Completion {
    pub fn new() -> (Self, CompletionReceiver) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                tx: Mutex::new(Some(tx)),
                invocations: AtomicUsize::new(0),
            },
            rx,
        )
    }

    pub fn complete(&self, result: Result<()>) {
        let n = self.invocations.fetch_add(1, Ordering::SeqCst) + 1;
        match lock(&self.tx).take() {
            Some(tx) => {
                info!("case to done");
                // The runner may already have stopped listening
                let _ = tx.send(result);
            }
            None => warn!(invocations = n, "completion invoked more than once"),
        }
    }

    /// Number of times `complete` has been called.
    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }

    pub fn is_completed(&self) -> bool {
        self.invocations() > 0
    }
}

// ---------------------------------------------------------------------------
// Scenario context
// ---------------------------------------------------------------------------

/// Per-scenario settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScenarioOptions {
    pub description: MediaDescription,
    /// Non-EOS records drained before the drain stops
    pub frame_total: u32,
    /// Stop, reset and release the encoder as soon as draining ends
    pub workdone_at_eos: bool,
    /// Query the output description on the first output record
    pub query_output_description: bool,
    /// A successful `flush` closes the stream and arms the finish routine
    pub flush_at_eos: bool,
    /// File the drained payload is appended to
    pub output_path: Option<PathBuf>,
}

impl Default for ScenarioOptions {
    fn default() -> Self {
        Self {
            description: MediaDescription::default(),
            frame_total: 100,
            workdone_at_eos: false,
            query_output_description: false,
            flush_at_eos: false,
            output_path: None,
        }
    }
}

#[derive(Default)]
struct Handles {
    encoder: Option<Arc<dyn VideoEncoder>>,
    stream: Option<Arc<dyn MediaStream>>,
    surface: SurfaceId,
    stream_running: bool,
}

/// Output drain bookkeeping
#[derive(Debug, Default)]
pub(crate) struct DrainState {
    pub(crate) pending: VecDeque<OutputBuffer>,
    pub(crate) frames_out: u32,
    pub(crate) stop_buffer: bool,
    pub(crate) saw_eos: bool,
    pub(crate) closed: bool,
    pub(crate) describe_next_output: bool,
    /// Run the finish routine at the next boundary
    pub(crate) workdone_at_eos: bool,
    pub(crate) flush_at_eos: bool,
}

impl DrainState {
    /// Fresh counters for a restarted encoder. The finish routine is armed.
    fn restart(&mut self) {
        self.pending.clear();
        self.frames_out = 0;
        self.saw_eos = false;
        self.closed = false;
        self.flush_at_eos = false;
        self.describe_next_output = false;
        self.workdone_at_eos = true;
    }
}

/// Copy of the drain bookkeeping for inspection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DrainSnapshot {
    pub pending: usize,
    pub frames_out: u32,
    pub stop_buffer: bool,
    pub saw_eos: bool,
    pub closed: bool,
    pub workdone_at_eos: bool,
}

/// State shared by the dispatcher and the drain loop of one scenario.
pub struct ScenarioContext {
    name: String,
    options: ScenarioOptions,
    handles: Mutex<Handles>,
    drain: Mutex<DrainState>,
    completion: Completion,
    drain_task: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for ScenarioContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScenarioContext")
            .field("name", &self.name)
            .field("options", &self.options)
            .field("drain", &self.drain_snapshot())
            .field("completed", &self.completion.is_completed())
            .finish()
    }
}

impl ScenarioContext {
    pub fn new(
        name: impl Into<String>,
        options: ScenarioOptions,
        encoder: Arc<dyn VideoEncoder>,
    ) -> (Arc<Self>, CompletionReceiver) {
        let (completion, rx) = Completion::new();
        let drain = DrainState {
            describe_next_output: options.query_output_description,
            workdone_at_eos: options.workdone_at_eos,
            flush_at_eos: options.flush_at_eos,
            ..DrainState::default()
        };
        let ctx = Self {
            name: name.into(),
            options,
            handles: Mutex::new(Handles {
                encoder: Some(encoder),
                ..Handles::default()
            }),
            drain: Mutex::new(drain),
            completion,
            drain_task: Mutex::new(None),
        };
        (Arc::new(ctx), rx)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &ScenarioOptions {
        &self.options
    }

    pub fn description(&self) -> &MediaDescription {
        &self.options.description
    }

    pub fn frame_total(&self) -> u32 {
        self.options.frame_total
    }

    pub fn completion(&self) -> &Completion {
        &self.completion
    }

    /// The encoder, while the scenario still holds it.
    pub fn encoder(&self) -> Option<Arc<dyn VideoEncoder>> {
        lock(&self.handles).encoder.clone()
    }

    /// Give up the encoder handle, e.g. before releasing it.
    pub fn take_encoder(&self) -> Option<Arc<dyn VideoEncoder>> {
        lock(&self.handles).encoder.take()
    }

    pub fn surface(&self) -> SurfaceId {
        lock(&self.handles).surface.clone()
    }

    pub fn is_stream_running(&self) -> bool {
        lock(&self.handles).stream_running
    }

    pub fn drain_snapshot(&self) -> DrainSnapshot {
        let d = lock(&self.drain);
        DrainSnapshot {
            pending: d.pending.len(),
            frames_out: d.frames_out,
            stop_buffer: d.stop_buffer,
            saw_eos: d.saw_eos,
            closed: d.closed,
            workdone_at_eos: d.workdone_at_eos,
        }
    }

    pub fn set_drain_task(&self, task: JoinHandle<()>) {
        if let Some(old) = lock(&self.drain_task).replace(task) {
            old.abort();
        }
    }

    pub fn take_drain_task(&self) -> Option<JoinHandle<()>> {
        lock(&self.drain_task).take()
    }

    /// Queue an output record for draining.
    pub fn push_output(&self, buffer: OutputBuffer) {
        lock(&self.drain).pending.push_back(buffer);
    }

    pub(crate) fn drain_state(&self) -> MutexGuard<'_, DrainState> {
        lock(&self.drain)
    }

    fn set_surface(&self, surface: SurfaceId) {
        debug!(case = %self.name, surface = %surface, "input surface acquired");
        lock(&self.handles).surface = surface;
    }

    fn stream(&self, step: Step) -> Result<Arc<dyn MediaStream>> {
        lock(&self.handles)
            .stream
            .clone()
            .ok_or_else(|| Error::Scenario(format!("{} before stream:create", step)))
    }

    fn start_stream(&self, step: Step) -> Result<()> {
        let stream = self.stream(step)?;
        let surface = {
            let mut handles = lock(&self.handles);
            if handles.stream_running {
                return Ok(());
            }
            handles.stream_running = true;
            handles.surface.clone()
        };
        info!(case = %self.name, surface = %surface, "case to start stream");
        stream.start_stream(&surface);
        Ok(())
    }

    /// Close the stream if it is running.
    pub fn close_stream(&self) {
        let (stream, surface) = {
            let mut handles = lock(&self.handles);
            if !handles.stream_running {
                return;
            }
            handles.stream_running = false;
            (handles.stream.clone(), handles.surface.clone())
        };
        if let Some(stream) = stream {
            info!(case = %self.name, surface = %surface, "case to stop stream");
            stream.close_stream(&surface);
        }
    }

    /// Reset the drain for a restart that follows end of stream.
    fn restart_after_eos(&self) {
        let mut d = lock(&self.drain);
        if d.saw_eos {
            debug!(case = %self.name, "drain re-armed after end of stream");
            d.restart();
        }
    }

    /// Close the stream after a flush and re-arm the drain.
    fn flush_at_eos(&self) {
        if !lock(&self.drain).flush_at_eos {
            return;
        }
        self.close_stream();
        debug!(case = %self.name, "drain re-armed after flush");
        lock(&self.drain).restart();
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Fixed waits used by wait steps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    /// `encode:waitForEOS`
    pub eos_wait: Duration,
    /// `encode:holdOn`
    pub hold_wait: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            eos_wait: Duration::from_millis(5000),
            hold_wait: Duration::from_millis(3000),
        }
    }
}

/// How a dispatch run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchEnd {
    /// `encode:release` ran and completion was signalled
    Released,
    /// `encode:waitForAllOuts` handed progress to the drain loop
    AwaitingOutputs,
    /// The program ran out without a release; completion was signalled
    Exhausted,
}

/// One dispatched step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchRecord {
    /// Index of the step in its program
    pub position: usize,
    pub step: Step,
    pub expect_failure: bool,
    /// Whether the platform call reported an error
    pub failed: bool,
}

/// Walks a step program against a scenario context.
pub struct Dispatcher {
    ctx: Arc<ScenarioContext>,
    streams: Arc<dyn StreamFactory>,
    timing: Timing,
    trace: Vec<DispatchRecord>,
}

impl Dispatcher {
    pub fn new(ctx: Arc<ScenarioContext>, streams: Arc<dyn StreamFactory>, timing: Timing) -> Self {
        Self {
            ctx,
            streams,
            timing,
            trace: Vec::new(),
        }
    }

    /// Steps dispatched so far.
    pub fn trace(&self) -> &[DispatchRecord] {
        &self.trace
    }

    pub fn context(&self) -> &Arc<ScenarioContext> {
        &self.ctx
    }

    /// Run `program` from its first step.
    pub async fn run(&mut self, program: &StepProgram) -> Result<DispatchEnd> {
        let mut cursor = program.cursor();
        let mut armed = false;

        while let Some(step) = cursor.peek() {
            let position = cursor.position();
            cursor.advance();
            info!(case = %self.ctx.name, step = %step, position, "case to {}", step);

            match step {
                Step::Encode(EncodeStep::Release) => {
                    if armed {
                        warn!(case = %self.ctx.name, "expect-failure marker ignored at release");
                    }
                    return self.release(position).await;
                }
                marker if marker.is_error_marker() => {
                    if armed {
                        warn!(case = %self.ctx.name, position, "repeated expect-failure marker");
                    }
                    armed = true;
                    self.record(position, step, false, false);
                }
                Step::Encode(EncodeStep::WaitForEos) => {
                    self.record(position, step, false, false);
                    tokio::time::sleep(self.timing.eos_wait).await;
                }
                Step::Encode(EncodeStep::HoldOn) => {
                    self.record(position, step, false, false);
                    tokio::time::sleep(self.timing.hold_wait).await;
                }
                Step::Encode(EncodeStep::JudgeEos) => {
                    self.record(position, step, false, false);
                    if !self.ctx.drain_snapshot().saw_eos {
                        return Err(Error::Assertion(AssertionFailure {
                            step: Some(step),
                            expected_failure: false,
                            observed: None,
                            message: "no end-of-stream record was drained".to_string(),
                        }));
                    }
                }
                Step::Encode(EncodeStep::WaitForAllOutputs) => {
                    if armed {
                        warn!(case = %self.ctx.name, "expect-failure marker left unused");
                    }
                    self.record(position, step, false, false);
                    info!(case = %self.ctx.name, "case wait for all outputs");
                    return Ok(DispatchEnd::AwaitingOutputs);
                }
                call if call.is_lifecycle_call() => {
                    let postfix = cursor.advance_if(Step::ERROR);
                    let expect_failure = postfix || armed;
                    armed = false;
                    let result = self.lifecycle(step, expect_failure).await?;
                    self.record(position, step, expect_failure, result.is_err());
                    match result {
                        Err(err) if !expect_failure => {
                            return Err(Error::mismatch(step, false, Some(err)));
                        }
                        Ok(()) if expect_failure => {
                            return Err(Error::mismatch(step, true, None));
                        }
                        Err(err) => {
                            debug!(case = %self.ctx.name, step = %step, error = %err, "expected failure observed");
                        }
                        Ok(()) => {}
                    }
                }
                Step::Stream(stream_step) => {
                    self.stream_step(step, stream_step)?;
                    self.record(position, step, false, false);
                }
                other => {
                    return Err(Error::InternalError(format!("no dispatch rule for {}", other)));
                }
            }
        }

        if armed {
            warn!(case = %self.ctx.name, "expect-failure marker left unused");
        }
        info!(case = %self.ctx.name, "step queue exhausted");
        self.ctx.completion.complete(Ok(()));
        Ok(DispatchEnd::Exhausted)
    }

    fn record(&mut self, position: usize, step: Step, expect_failure: bool, failed: bool) {
        self.trace.push(DispatchRecord {
            position,
            step,
            expect_failure,
            failed,
        });
    }

    async fn release(&mut self, position: usize) -> Result<DispatchEnd> {
        let Some(encoder) = self.ctx.take_encoder() else {
            debug!(case = %self.ctx.name, "no encoder held at release");
            self.ctx.completion.complete(Ok(()));
            return Ok(DispatchEnd::Released);
        };
        let result = encoder.release().await;
        self.record(position, Step::RELEASE, false, result.is_err());
        debug!(case = %self.ctx.name, ok = result.is_ok(), "release callback");
        match result {
            Ok(()) => {
                self.ctx.completion.complete(Ok(()));
                Ok(DispatchEnd::Released)
            }
            Err(err) => {
                let failure = Error::mismatch(Step::RELEASE, false, Some(err.clone()));
                self.ctx.completion.complete(Err(failure));
                Err(Error::mismatch(Step::RELEASE, false, Some(err)))
            }
        }
    }

    /// Issue the platform call behind a lifecycle step.
    async fn lifecycle(&self, step: Step, expect_failure: bool) -> Result<CodecResult<()>> {
        let encoder = self
            .ctx
            .encoder()
            .ok_or_else(|| Error::Scenario(format!("{} dispatched with no encoder held", step)))?;

        let result = match step {
            Step::Encode(EncodeStep::Configure) => encoder.configure(self.ctx.description()).await,
            Step::Encode(EncodeStep::GetInputSurface) => encoder
                .get_input_surface()
                .await
                .map(|surface| self.ctx.set_surface(surface)),
            Step::Encode(EncodeStep::Prepare) => encoder.prepare().await,
            Step::Encode(EncodeStep::Start) => {
                self.ctx.drain_state().stop_buffer = false;
                if !expect_failure {
                    self.ctx.restart_after_eos();
                }
                encoder.start().await
            }
            Step::Encode(EncodeStep::Flush) => {
                let result = encoder.flush().await;
                if result.is_ok() && !expect_failure {
                    self.ctx.flush_at_eos();
                }
                result
            }
            Step::Encode(EncodeStep::Stop) => {
                self.ctx.drain_state().stop_buffer = true;
                encoder.stop().await
            }
            Step::Encode(EncodeStep::Reset) => encoder.reset().await,
            other => {
                return Err(Error::InternalError(format!(
                    "{} is not a lifecycle call",
                    other
                )))
            }
        };
        debug!(case = %self.ctx.name, step = %step, ok = result.is_ok(), "case {} callback", step);
        Ok(result)
    }

    fn stream_step(&self, step: Step, stream_step: StreamStep) -> Result<()> {
        let ctx = &self.ctx;
        match stream_step {
            StreamStep::Create => {
                let stream = self.streams.create_media_test();
                lock(&ctx.handles).stream = Some(stream);
            }
            StreamStep::SetParam => apply_params(ctx.stream(step)?.as_ref(), ctx.description()),
            StreamStep::SetEosFrame => ctx.stream(step)?.set_frame_count(ctx.frame_total()),
            StreamStep::Prepare => {
                let stream = ctx.stream(step)?;
                apply_params(stream.as_ref(), ctx.description());
                stream.set_frame_count(ctx.frame_total());
            }
            StreamStep::Start => ctx.start_stream(step)?,
            StreamStep::Stop => {
                ctx.stream(step)?;
                ctx.close_stream();
            }
        }
        Ok(())
    }
}

/// Cleanup run after every scenario iteration, whatever its outcome.
pub async fn teardown(ctx: &ScenarioContext) {
    if let Some(task) = ctx.take_drain_task() {
        task.abort();
    }
    if let Some(encoder) = ctx.take_encoder() {
        match encoder.release().await {
            Ok(()) => debug!(case = %ctx.name, "teardown released encoder"),
            Err(err) => warn!(case = %ctx.name, error = %err, "teardown release failed"),
        }
    }
    ctx.close_stream();
}

/// First error of a sequence of platform calls that should all succeed.
pub(crate) fn first_failure(step: Step, result: CodecResult<()>, first: &mut Option<Error>) {
    if let Err(err) = result {
        warn!(step = %step, error = %err, "unexpected failure");
        if first.is_none() {
            *first = Some(Error::mismatch(step, false, Some(err)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::EncoderFactory;
    use crate::sim::SimPlatform;

    #[tokio::test]
    async fn test_completion_counts_invocations() {
        let (completion, rx) = Completion::new();
        completion.complete(Ok(()));
        completion.complete(Err(Error::assertion("late")));
        assert_eq!(completion.invocations(), 2);
        assert!(rx.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_stream_step_before_create_is_scenario_error() {
        let platform = Arc::new(SimPlatform::default());
        let encoder = platform.create_by_name("avenc_mpeg4").await.unwrap();
        let (ctx, _rx) = ScenarioContext::new("t", ScenarioOptions::default(), encoder);
        let mut dispatcher = Dispatcher::new(ctx, platform.clone(), Timing::default());
        let program = StepProgram::new(vec![Step::STREAM_START, Step::RELEASE]);
        let err = dispatcher.run(&program).await.unwrap_err();
        assert!(matches!(err, Error::Scenario(_)));
    }

    #[tokio::test]
    async fn test_exhausted_program_completes() {
        let platform = Arc::new(SimPlatform::default());
        let encoder = platform.create_by_name("avenc_mpeg4").await.unwrap();
        let (ctx, rx) = ScenarioContext::new("t", ScenarioOptions::default(), encoder);
        let mut dispatcher = Dispatcher::new(ctx.clone(), platform.clone(), Timing::default());
        let end = dispatcher.run(&StepProgram::new(vec![Step::CONFIGURE])).await.unwrap();
        assert_eq!(end, DispatchEnd::Exhausted);
        assert!(rx.await.unwrap().is_ok());
        assert!(ctx.encoder().is_some());
        teardown(&ctx).await;
        assert!(ctx.encoder().is_none());
        assert_eq!(platform.release_count(), 1);
    }

    #[tokio::test]
    async fn test_release_without_handle_completes_once() {
        let platform = Arc::new(SimPlatform::default());
        let encoder = platform.create_by_name("avenc_mpeg4").await.unwrap();
        let (ctx, rx) = ScenarioContext::new("t", ScenarioOptions::default(), encoder);
        ctx.take_encoder();
        let mut dispatcher = Dispatcher::new(ctx.clone(), platform.clone(), Timing::default());
        let end = dispatcher.run(&StepProgram::new(vec![Step::RELEASE])).await.unwrap();
        assert_eq!(end, DispatchEnd::Released);
        assert!(rx.await.unwrap().is_ok());
        assert_eq!(ctx.completion().invocations(), 1);
        assert_eq!(platform.release_count(), 0);
    }

    #[tokio::test]
    async fn test_armed_marker_carries_over_stream_steps() {
        let platform = Arc::new(SimPlatform::default());
        let encoder = platform.create_by_name("avenc_mpeg4").await.unwrap();
        let (ctx, _rx) = ScenarioContext::new("t", ScenarioOptions::default(), encoder);
        let mut dispatcher = Dispatcher::new(ctx, platform.clone(), Timing::default());
        let program = StepProgram::new(vec![
            Step::ERROR,
            Step::STREAM_CREATE,
            Step::STREAM_SET_PARAM,
            Step::START,
            Step::RELEASE,
        ]);
        assert_eq!(dispatcher.run(&program).await.unwrap(), DispatchEnd::Released);
        let start = dispatcher
            .trace()
            .iter()
            .find(|r| r.step == Step::START)
            .copied()
            .unwrap();
        assert!(start.expect_failure && start.failed);
    }
}
