//! Simulated encoder platform
//!
//! `SimPlatform` implements both [`EncoderFactory`] and [`StreamFactory`] on
//! top of one shared state table. Encoders follow the lifecycle observed on
//! real devices:
//!
//! | op           | legal from                       | to            |
//! |--------------|----------------------------------|---------------|
//! | configure    | Created                          | Configured    |
//! | getSurface   | Configured, Prepared             | unchanged     |
//! | prepare      | Configured                       | Prepared      |
//! | start        | Prepared, Stopped                | Running       |
//! | flush        | Running, Flushed, EndOfStream    | Flushed       |
//! | stop         | Running, Flushed, EndOfStream    | Stopped       |
//! | reset        | any but Released                 | Created       |
//! | release      | any but Released                 | Released      |
//!
//! A rejected call never changes state. While an encoder is running or
//! flushed and a stream feeds its input surface, a producer task emits one output buffer
//! per frame interval and an end-of-stream record after the stream's frame
//! count. Every call is logged, buffer frees are accounted per encoder, and
//! faults can force the n-th call of an operation to fail or succeed.

use crate::codec::{
    BufferFlags, CodecError, CodecErrorKind, CodecResult, EncoderEvent, EncoderFactory, EncoderOp,
    EventReceiver, EventSender, MediaDescription, OutputBuffer, SurfaceId, VideoEncoder,
};
use crate::stream::{MediaStream, StreamFactory, StreamParams};
use crate::{lock, serde_millis};
use async_trait::async_trait;
use rand::Rng;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Forced outcome of a faulted call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultOutcome {
    Fail,
    Succeed,
}

/// Force the `nth` call (1-based, counted across all encoders) of `op`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fault {
    pub op: EncoderOp,
    pub nth: u32,
    pub outcome: FaultOutcome,
}

impl Fault {
    pub fn fail(op: EncoderOp, nth: u32) -> Self {
        Self {
            op,
            nth,
            outcome: FaultOutcome::Fail,
        }
    }

    pub fn succeed(op: EncoderOp, nth: u32) -> Self {
        Self {
            op,
            nth,
            outcome: FaultOutcome::Succeed,
        }
    }
}

/// Simulated platform configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Encoder names accepted by `create_by_name`
    pub encoder_names: Vec<String>,
    /// Mime types accepted by `create_by_mime`
    pub mime_types: Vec<String>,
    /// Bytes of payload per output buffer
    pub payload_size: usize,
    /// Delay before every lifecycle call completes
    #[serde(rename = "op_latency_ms", with = "serde_millis")]
    pub op_latency: Duration,
    pub faults: Vec<Fault>,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            encoder_names: vec!["avenc_mpeg4".to_string()],
            mime_types: vec!["video/mp4v-es".to_string()],
            payload_size: 64,
            op_latency: Duration::ZERO,
            faults: Vec::new(),
        }
    }
}

impl SimConfig {
    pub fn with_fault(mut self, fault: Fault) -> Self {
        self.faults.push(fault);
        self
    }

    pub fn with_op_latency(mut self, latency: Duration) -> Self {
        self.op_latency = latency;
        self
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Encoder lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum EncoderState {
    Created,
    Configured,
    Prepared,
    Running,
    Flushed,
    EndOfStream,
    Stopped,
    Released,
}

impl fmt::Display for EncoderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl EncoderState {
    /// Whether a fed input surface turns into output in this state.
    pub fn is_producing(self) -> bool {
        matches!(self, EncoderState::Running | EncoderState::Flushed)
    }

    /// State after a successful `op`, or `None` when `op` is illegal here.
    pub fn after(self, op: EncoderOp) -> Option<EncoderState> {
        use EncoderState::*;
        match (op, self) {
            (_, Released) => None,
            (EncoderOp::Configure, Created) => Some(Configured),
            (EncoderOp::GetInputSurface, Configured | Prepared) => Some(self),
            (EncoderOp::Prepare, Configured) => Some(Prepared),
            (EncoderOp::Start, Prepared | Stopped) => Some(Running),
            (EncoderOp::Flush, Running | Flushed | EndOfStream) => Some(Flushed),
            (EncoderOp::Stop, Running | Flushed | EndOfStream) => Some(Stopped),
            (EncoderOp::Reset, _) => Some(Created),
            (EncoderOp::Release, _) => Some(Released),
            _ => None,
        }
    }

    /// State a forced success of `op` lands in.
    fn forced(self, op: EncoderOp) -> EncoderState {
        match op {
            EncoderOp::Configure => EncoderState::Configured,
            EncoderOp::Prepare => EncoderState::Prepared,
            EncoderOp::Start => EncoderState::Running,
            EncoderOp::Flush => EncoderState::Flushed,
            EncoderOp::Stop => EncoderState::Stopped,
            EncoderOp::Reset => EncoderState::Created,
            EncoderOp::Release => EncoderState::Released,
            _ => self,
        }
    }
}

/// One platform call, as seen by the simulator
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallRecord {
    pub encoder: u64,
    pub op: EncoderOp,
    pub ok: bool,
}

/// Point-in-time view of one encoder
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EncoderSnapshot {
    pub id: u64,
    pub name: String,
    pub state: EncoderState,
    /// Successful `free_output_buffer` calls
    pub frees: u64,
    /// Frees of an index the platform did not lend out
    pub double_frees: u64,
    /// Buffers lent out and not yet freed
    pub outstanding: usize,
    /// Non-EOS buffers emitted since creation
    pub emitted: u64,
}

#[derive(Debug)]
struct EncoderRecord {
    name: String,
    state: EncoderState,
    description: Option<MediaDescription>,
    surface: Option<SurfaceId>,
    events: Option<EventSender>,
    outstanding: FxHashSet<u32>,
    next_index: u32,
    frees: u64,
    double_frees: u64,
    emitted: u64,
    /// Bumped on every state change that invalidates a running producer
    generation: u64,
    /// Generation the live producer belongs to
    producer: Option<u64>,
    /// Frames produced since the last start
    frames_since_start: u32,
}

impl EncoderRecord {
    fn new(name: String, events: EventSender) -> Self {
        Self {
            name,
            state: EncoderState::Created,
            description: None,
            surface: None,
            events: Some(events),
            outstanding: FxHashSet::default(),
            next_index: 0,
            frees: 0,
            double_frees: 0,
            emitted: 0,
            generation: 0,
            producer: None,
            frames_since_start: 0,
        }
    }

    fn snapshot(&self, id: u64) -> EncoderSnapshot {
        EncoderSnapshot {
            id,
            name: self.name.clone(),
            state: self.state,
            frees: self.frees,
            double_frees: self.double_frees,
            outstanding: self.outstanding.len(),
            emitted: self.emitted,
        }
    }

    fn send(&self, event: EncoderEvent) {
        if let Some(ref tx) = self.events {
            // A closed receiver only means nobody listens any more
            let _ = tx.send(event);
        }
    }
}

#[derive(Debug, Default)]
struct StreamRecord {
    params: StreamParams,
    feeding: Option<SurfaceId>,
}

#[derive(Debug, Default)]
struct Shared {
    config: SimConfig,
    encoders: FxHashMap<u64, EncoderRecord>,
    streams: FxHashMap<u64, StreamRecord>,
    call_counts: FxHashMap<EncoderOp, u32>,
    calls: Vec<CallRecord>,
    releases: u64,
    next_id: u64,
}

impl Shared {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Count the call and look up a fault for it.
    fn fault_for(&mut self, op: EncoderOp) -> Option<FaultOutcome> {
        let count = self.call_counts.entry(op).or_insert(0);
        *count += 1;
        let nth = *count;
        self.config
            .faults
            .iter()
            .find(|f| f.op == op && f.nth == nth)
            .map(|f| f.outcome)
    }

    fn log(&mut self, encoder: u64, op: EncoderOp, ok: bool) {
        self.calls.push(CallRecord { encoder, op, ok });
    }

    /// Frame count of the stream feeding `surface`, if one does.
    fn feeding_stream(&self, surface: &SurfaceId) -> Option<Option<u32>> {
        self.streams
            .values()
            .find(|s| s.feeding.as_ref() == Some(surface))
            .map(|s| s.params.frame_count)
    }
}

// ---------------------------------------------------------------------------
// Platform
// ---------------------------------------------------------------------------

/// In-process encoder platform
#[derive(Debug, Clone, Default)]
pub struct SimPlatform {
    shared: Arc<Mutex<Shared>>,
}

impl SimPlatform {
    pub fn new(config: SimConfig) -> Self {
        Self {
            shared: Arc::new(Mutex::new(Shared {
                config,
                ..Shared::default()
            })),
        }
    }

    /// Every lifecycle call so far, in order.
    pub fn calls(&self) -> Vec<CallRecord> {
        lock(&self.shared).calls.clone()
    }

    /// Calls of `op` so far.
    pub fn call_count(&self, op: EncoderOp) -> usize {
        lock(&self.shared).calls.iter().filter(|c| c.op == op).count()
    }

    /// Successful releases so far.
    pub fn release_count(&self) -> u64 {
        lock(&self.shared).releases
    }

    pub fn snapshot(&self, id: u64) -> Option<EncoderSnapshot> {
        lock(&self.shared).encoders.get(&id).map(|rec| rec.snapshot(id))
    }

    /// Snapshots of every encoder ever created, by id.
    pub fn encoders(&self) -> Vec<EncoderSnapshot> {
        let shared = lock(&self.shared);
        let mut out: Vec<_> = shared.encoders.iter().map(|(id, rec)| rec.snapshot(*id)).collect();
        out.sort_by_key(|s| s.id);
        out
    }

    /// Forget recorded calls and encoders, keeping the configuration.
    pub fn clear(&self) {
        let mut shared = lock(&self.shared);
        shared.encoders.clear();
        shared.streams.clear();
        shared.call_counts.clear();
        shared.calls.clear();
        shared.releases = 0;
    }

    fn create(&self, name: String) -> CodecResult<Arc<dyn VideoEncoder>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = {
            let mut shared = lock(&self.shared);
            let id = shared.next_id();
            shared.encoders.insert(id, EncoderRecord::new(name.clone(), tx));
            shared.log(id, EncoderOp::Create, true);
            id
        };
        debug!(encoder = id, name = %name, "sim encoder created");
        Ok(Arc::new(SimEncoder {
            id,
            name,
            shared: Arc::clone(&self.shared),
            events: Mutex::new(Some(rx)),
        }))
    }

    fn not_found(&self, what: &str) -> CodecError {
        lock(&self.shared).log(0, EncoderOp::Create, false);
        CodecError::new(EncoderOp::Create, CodecErrorKind::NotFound, what)
    }
}

#[async_trait]
impl EncoderFactory for SimPlatform {
    async fn create_by_name(&self, name: &str) -> CodecResult<Arc<dyn VideoEncoder>> {
        let known = lock(&self.shared).config.encoder_names.iter().any(|n| n == name);
        if !known {
            return Err(self.not_found(name));
        }
        self.create(name.to_string())
    }

    async fn create_by_mime(&self, mime: &str) -> CodecResult<Arc<dyn VideoEncoder>> {
        let name = {
            let shared = lock(&self.shared);
            if !shared.config.mime_types.iter().any(|m| m == mime) {
                None
            } else {
                Some(
                    shared
                        .config
                        .encoder_names
                        .first()
                        .cloned()
                        .unwrap_or_else(|| mime.to_string()),
                )
            }
        };
        match name {
            Some(name) => self.create(name),
            None => Err(self.not_found(mime)),
        }
    }
}

impl StreamFactory for SimPlatform {
    fn create_media_test(&self) -> Arc<dyn MediaStream> {
        let id = {
            let mut shared = lock(&self.shared);
            let id = shared.next_id();
            shared.streams.insert(id, StreamRecord::default());
            id
        };
        debug!(stream = id, "sim stream created");
        Arc::new(SimStream {
            id,
            shared: Arc::clone(&self.shared),
        })
    }
}

// ---------------------------------------------------------------------------
// Encoder
// ---------------------------------------------------------------------------

/// Encoder handle returned by [`SimPlatform`]
pub struct SimEncoder {
    id: u64,
    name: String,
    shared: Arc<Mutex<Shared>>,
    events: Mutex<Option<EventReceiver>>,
}

impl fmt::Debug for SimEncoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimEncoder")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

impl SimEncoder {
    pub fn id(&self) -> u64 {
        self.id
    }

    async fn latency(&self) {
        let latency = lock(&self.shared).config.op_latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }

    /// Apply `op` to the state table. `effect` runs only when the call
    /// succeeds, with the state it lands in.
    fn transition<T>(
        &self,
        op: EncoderOp,
        effect: impl FnOnce(&mut EncoderRecord) -> T,
    ) -> CodecResult<T> {
        let mut shared = lock(&self.shared);
        let fault = shared.fault_for(op);
        let Some(rec) = shared.encoders.get_mut(&self.id) else {
            return Err(CodecError::new(op, CodecErrorKind::NotFound, "unknown encoder"));
        };
        let from = rec.state;
        let result = match fault {
            Some(FaultOutcome::Fail) => Err(CodecError::new(op, CodecErrorKind::Injected, "")),
            Some(FaultOutcome::Succeed) => Ok(from.forced(op)),
            None => match from.after(op) {
                Some(to) => Ok(to),
                None if from == EncoderState::Released => {
                    Err(CodecError::new(op, CodecErrorKind::Released, ""))
                }
                None => Err(CodecError::new(
                    op,
                    CodecErrorKind::InvalidState,
                    format!("state {}", from),
                )),
            },
        };
        let result = result.map(|to| {
            rec.state = to;
            effect(rec)
        });
        trace!(encoder = self.id, op = %op, from = %from, ok = result.is_ok(), "sim transition");
        shared.log(self.id, op, result.is_ok());
        result
    }

    /// Start a producer if the encoder runs and a stream feeds it.
    fn ensure_producer(&self) {
        spawn_producer_if_ready(&self.shared, self.id);
    }
}

#[async_trait]
impl VideoEncoder for SimEncoder {
    fn name(&self) -> &str {
        &self.name
    }

    async fn configure(&self, description: &MediaDescription) -> CodecResult<()> {
        self.latency().await;
        let description = description.clone();
        self.transition(EncoderOp::Configure, move |rec| {
            rec.description = Some(description);
        })
    }

    async fn get_input_surface(&self) -> CodecResult<SurfaceId> {
        self.latency().await;
        let id = self.id;
        self.transition(EncoderOp::GetInputSurface, move |rec| {
            rec.surface
                .get_or_insert_with(|| SurfaceId(format!("surface-{}", id)))
                .clone()
        })
    }

    async fn prepare(&self) -> CodecResult<()> {
        self.latency().await;
        self.transition(EncoderOp::Prepare, |_| ())
    }

    async fn start(&self) -> CodecResult<()> {
        self.latency().await;
        self.transition(EncoderOp::Start, |rec| {
            rec.generation += 1;
            rec.frames_since_start = 0;
            let description = rec.description.clone().unwrap_or_default();
            rec.send(EncoderEvent::StreamChanged(description));
        })?;
        self.ensure_producer();
        Ok(())
    }

    async fn flush(&self) -> CodecResult<()> {
        self.latency().await;
        self.transition(EncoderOp::Flush, |rec| {
            rec.generation += 1;
            rec.frames_since_start = 0;
        })
    }

    async fn stop(&self) -> CodecResult<()> {
        self.latency().await;
        self.transition(EncoderOp::Stop, |rec| {
            rec.generation += 1;
        })
    }

    async fn reset(&self) -> CodecResult<()> {
        self.latency().await;
        self.transition(EncoderOp::Reset, |rec| {
            rec.generation += 1;
            rec.description = None;
            rec.outstanding.clear();
        })
    }

    async fn release(&self) -> CodecResult<()> {
        self.latency().await;
        self.transition(EncoderOp::Release, |rec| {
            rec.generation += 1;
            rec.outstanding.clear();
            rec.events = None;
        })?;
        lock(&self.shared).releases += 1;
        debug!(encoder = self.id, "sim encoder released");
        Ok(())
    }

    async fn free_output_buffer(&self, buffer: OutputBuffer) -> CodecResult<()> {
        let op = EncoderOp::FreeOutputBuffer;
        let mut shared = lock(&self.shared);
        let Some(rec) = shared.encoders.get_mut(&self.id) else {
            return Err(CodecError::new(op, CodecErrorKind::NotFound, "unknown encoder"));
        };
        if rec.state == EncoderState::Released {
            return Err(CodecError::new(op, CodecErrorKind::Released, ""));
        }
        if rec.outstanding.remove(&buffer.index) {
            rec.frees += 1;
            Ok(())
        } else {
            rec.double_frees += 1;
            warn!(encoder = self.id, index = buffer.index, "free of a buffer not lent out");
            Err(CodecError::new(
                op,
                CodecErrorKind::InvalidBuffer,
                format!("index {}", buffer.index),
            ))
        }
    }

    async fn output_description(&self) -> CodecResult<MediaDescription> {
        let op = EncoderOp::GetOutputDescription;
        let shared = lock(&self.shared);
        match shared.encoders.get(&self.id) {
            Some(rec) if rec.state == EncoderState::Released => {
                Err(CodecError::new(op, CodecErrorKind::Released, ""))
            }
            Some(rec) => rec
                .description
                .clone()
                .ok_or_else(|| CodecError::new(op, CodecErrorKind::InvalidState, "not configured")),
            None => Err(CodecError::new(op, CodecErrorKind::NotFound, "unknown encoder")),
        }
    }

    fn take_events(&self) -> Option<EventReceiver> {
        lock(&self.events).take()
    }
}

// ---------------------------------------------------------------------------
// Producer
// ---------------------------------------------------------------------------

fn spawn_producer_if_ready(shared: &Arc<Mutex<Shared>>, id: u64) {
    let (generation, interval) = {
        let mut guard = lock(shared);
        let Some(rec) = guard.encoders.get(&id) else {
            return;
        };
        if !rec.state.is_producing() || rec.producer == Some(rec.generation) {
            return;
        }
        let Some(surface) = rec.surface.clone() else {
            return;
        };
        if guard.feeding_stream(&surface).is_none() {
            return;
        }
        let Some(rec) = guard.encoders.get_mut(&id) else {
            return;
        };
        rec.producer = Some(rec.generation);
        let interval = rec.description.clone().unwrap_or_default().frame_interval();
        (rec.generation, interval)
    };

    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            debug!(encoder = id, generation, "sim producer started");
            handle.spawn(produce(Arc::clone(shared), id, generation, interval));
        }
        Err(_) => {
            warn!(encoder = id, "no runtime to drive the sim producer");
            if let Some(rec) = lock(shared).encoders.get_mut(&id) {
                rec.producer = None;
            }
        }
    }
}

enum Tick {
    Frame,
    EndOfStream,
    Quit,
}

async fn produce(shared: Arc<Mutex<Shared>>, id: u64, generation: u64, interval: Duration) {
    loop {
        tokio::time::sleep(interval).await;
        let payload_size = lock(&shared).config.payload_size;
        let mut data = vec![0u8; payload_size];
        rand::thread_rng().fill(&mut data[..]);

        let tick = {
            let mut guard = lock(&shared);
            let frame_count = guard
                .encoders
                .get(&id)
                .and_then(|rec| rec.surface.clone())
                .and_then(|surface| guard.feeding_stream(&surface));
            match guard.encoders.get_mut(&id) {
                Some(rec) if rec.generation == generation && rec.state.is_producing() => {
                    match frame_count {
                        None => {
                            rec.producer = None;
                            Tick::Quit
                        }
                        Some(Some(total)) if rec.frames_since_start >= total => {
                            let index = rec.next_index;
                            rec.next_index = rec.next_index.wrapping_add(1);
                            rec.state = EncoderState::EndOfStream;
                            rec.producer = None;
                            rec.send(EncoderEvent::NewOutputData(OutputBuffer {
                                data: Vec::new(),
                                length: 0,
                                index,
                                flags: BufferFlags::EOS,
                                timestamp_us: timestamp(rec.frames_since_start, interval),
                            }));
                            Tick::EndOfStream
                        }
                        Some(_) => {
                            let index = rec.next_index;
                            rec.next_index = rec.next_index.wrapping_add(1);
                            rec.outstanding.insert(index);
                            let flags = if rec.frames_since_start == 0 {
                                BufferFlags::SYNC_FRAME
                            } else {
                                BufferFlags::empty()
                            };
                            let ts = timestamp(rec.frames_since_start, interval);
                            rec.frames_since_start += 1;
                            rec.emitted += 1;
                            let length = data.len();
                            rec.send(EncoderEvent::NewOutputData(OutputBuffer {
                                data,
                                length,
                                index,
                                flags,
                                timestamp_us: ts,
                            }));
                            Tick::Frame
                        }
                    }
                }
                Some(rec) => {
                    if rec.producer == Some(generation) {
                        rec.producer = None;
                    }
                    Tick::Quit
                }
                None => Tick::Quit,
            }
        };

        match tick {
            Tick::Frame => continue,
            Tick::EndOfStream => {
                debug!(encoder = id, "sim producer reached end of stream");
                return;
            }
            Tick::Quit => {
                trace!(encoder = id, generation, "sim producer stopped");
                return;
            }
        }
    }
}

fn timestamp(frame: u32, interval: Duration) -> i64 {
    (u128::from(frame) * interval.as_micros()) as i64
}

// ---------------------------------------------------------------------------
// Stream
// ---------------------------------------------------------------------------

/// Stream handle returned by [`SimPlatform`]
pub struct SimStream {
    id: u64,
    shared: Arc<Mutex<Shared>>,
}

impl fmt::Debug for SimStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimStream").field("id", &self.id).finish()
    }
}

impl SimStream {
    fn update(&self, f: impl FnOnce(&mut StreamRecord)) {
        if let Some(rec) = lock(&self.shared).streams.get_mut(&self.id) {
            f(rec);
        }
    }

    /// Encoder whose input surface is `surface`.
    fn encoder_for(&self, surface: &SurfaceId) -> Option<u64> {
        lock(&self.shared)
            .encoders
            .iter()
            .find(|(_, rec)| rec.surface.as_ref() == Some(surface))
            .map(|(id, _)| *id)
    }
}

impl MediaStream for SimStream {
    fn set_resolution(&self, width: u32, height: u32) {
        self.update(|rec| {
            rec.params.width = width;
            rec.params.height = height;
        });
    }

    fn set_frame_rate(&self, frame_rate: u32) {
        self.update(|rec| rec.params.frame_rate = frame_rate);
    }

    fn set_frame_count(&self, frame_count: u32) {
        self.update(|rec| rec.params.frame_count = Some(frame_count));
    }

    fn start_stream(&self, surface: &SurfaceId) {
        let Some(encoder) = (!surface.is_empty()).then(|| self.encoder_for(surface)).flatten() else {
            debug!(stream = self.id, surface = %surface, "stream started on an unknown surface");
            return;
        };
        self.update(|rec| rec.feeding = Some(surface.clone()));
        spawn_producer_if_ready(&self.shared, encoder);
    }

    fn close_stream(&self, surface: &SurfaceId) {
        self.update(|rec| {
            if rec.feeding.as_ref() == Some(surface) {
                rec.feeding = None;
            }
        });
    }

    fn params(&self) -> StreamParams {
        lock(&self.shared)
            .streams
            .get(&self.id)
            .map(|rec| rec.params)
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn encoder(platform: &SimPlatform) -> Arc<dyn VideoEncoder> {
        platform.create_by_name("avenc_mpeg4").await.unwrap()
    }

    #[test]
    fn test_transition_table() {
        use EncoderState::*;
        assert_eq!(Created.after(EncoderOp::Configure), Some(Configured));
        assert_eq!(Configured.after(EncoderOp::Start), None);
        assert_eq!(Stopped.after(EncoderOp::Start), Some(Running));
        assert_eq!(EndOfStream.after(EncoderOp::Flush), Some(Flushed));
        assert_eq!(Created.after(EncoderOp::Stop), None);
        assert_eq!(Running.after(EncoderOp::Reset), Some(Created));
        assert_eq!(Released.after(EncoderOp::Release), None);
        assert_eq!(Prepared.after(EncoderOp::GetInputSurface), Some(Prepared));
    }

    #[tokio::test]
    async fn test_unknown_encoder_is_not_found() {
        let platform = SimPlatform::default();
        let err = platform.create_by_name("x264").await.unwrap_err();
        assert_eq!(err.kind, CodecErrorKind::NotFound);
        assert!(platform.create_by_mime("video/mp4v-es").await.is_ok());
    }

    #[tokio::test]
    async fn test_rejected_call_keeps_state() {
        let platform = SimPlatform::default();
        let enc = encoder(&platform).await;
        assert!(enc.start().await.is_err());
        let snap = &platform.encoders()[0];
        assert_eq!(snap.state, EncoderState::Created);
        assert!(enc.configure(&MediaDescription::default()).await.is_ok());
        assert_eq!(platform.encoders()[0].state, EncoderState::Configured);
    }

    #[tokio::test]
    async fn test_second_release_fails() {
        let platform = SimPlatform::default();
        let enc = encoder(&platform).await;
        enc.release().await.unwrap();
        let err = enc.release().await.unwrap_err();
        assert_eq!(err.kind, CodecErrorKind::Released);
        assert_eq!(platform.release_count(), 1);
    }

    #[tokio::test]
    async fn test_faults_override_state() {
        let config = SimConfig::default()
            .with_fault(Fault::fail(EncoderOp::Configure, 1))
            .with_fault(Fault::succeed(EncoderOp::Start, 1));
        let platform = SimPlatform::new(config);
        let enc = encoder(&platform).await;
        let err = enc.configure(&MediaDescription::default()).await.unwrap_err();
        assert_eq!(err.kind, CodecErrorKind::Injected);
        assert!(enc.start().await.is_ok());
        assert_eq!(platform.encoders()[0].state, EncoderState::Running);
    }

    #[tokio::test]
    async fn test_free_unknown_index_counts_double_free() {
        let platform = SimPlatform::default();
        let enc = encoder(&platform).await;
        let buf = OutputBuffer {
            data: vec![0; 4],
            length: 4,
            index: 7,
            flags: BufferFlags::empty(),
            timestamp_us: 0,
        };
        let err = enc.free_output_buffer(buf).await.unwrap_err();
        assert_eq!(err.kind, CodecErrorKind::InvalidBuffer);
        assert_eq!(platform.encoders()[0].double_frees, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_producer_emits_frames_then_eos() {
        let platform = SimPlatform::default();
        let enc = encoder(&platform).await;
        let mut events = enc.take_events().unwrap();
        assert!(enc.take_events().is_none());

        enc.configure(&MediaDescription::default()).await.unwrap();
        let surface = enc.get_input_surface().await.unwrap();
        enc.prepare().await.unwrap();
        let stream = platform.create_media_test();
        stream.set_frame_count(3);
        enc.start().await.unwrap();
        stream.start_stream(&surface);

        assert!(matches!(events.recv().await, Some(EncoderEvent::StreamChanged(_))));
        let mut frames = Vec::new();
        loop {
            match events.recv().await {
                Some(EncoderEvent::NewOutputData(buf)) if buf.is_eos() => break,
                Some(EncoderEvent::NewOutputData(buf)) => frames.push(buf),
                other => panic!("unexpected event {:?}", other),
            }
        }
        assert_eq!(frames.len(), 3);
        assert!(frames[0].flags.contains(BufferFlags::SYNC_FRAME));
        assert_eq!(platform.encoders()[0].state, EncoderState::EndOfStream);
        assert_eq!(platform.encoders()[0].outstanding, 3);

        for buf in frames {
            enc.free_output_buffer(buf).await.unwrap();
        }
        let snap = &platform.encoders()[0];
        assert_eq!((snap.frees, snap.outstanding, snap.double_frees), (3, 0, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_after_eos_resumes_on_stream_restart() {
        let platform = SimPlatform::default();
        let enc = encoder(&platform).await;
        let mut events = enc.take_events().unwrap();
        enc.configure(&MediaDescription::default()).await.unwrap();
        let surface = enc.get_input_surface().await.unwrap();
        enc.prepare().await.unwrap();
        let stream = platform.create_media_test();
        stream.set_frame_count(2);
        enc.start().await.unwrap();
        stream.start_stream(&surface);

        let mut eos = 0;
        let mut frames = 0;
        while eos < 1 {
            match events.recv().await {
                Some(EncoderEvent::NewOutputData(buf)) if buf.is_eos() => eos += 1,
                Some(EncoderEvent::NewOutputData(_)) => frames += 1,
                Some(EncoderEvent::StreamChanged(_)) => {}
                other => panic!("unexpected event {:?}", other),
            }
        }
        enc.flush().await.unwrap();
        assert_eq!(platform.encoders()[0].state, EncoderState::Flushed);

        stream.close_stream(&surface);
        stream.start_stream(&surface);
        while eos < 2 {
            match events.recv().await {
                Some(EncoderEvent::NewOutputData(buf)) if buf.is_eos() => eos += 1,
                Some(EncoderEvent::NewOutputData(_)) => frames += 1,
                other => panic!("unexpected event {:?}", other),
            }
        }
        assert_eq!(frames, 4);
        assert_eq!(platform.encoders()[0].state, EncoderState::EndOfStream);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_on_unknown_surface_links_nothing() {
        let platform = SimPlatform::default();
        let stream = platform.create_media_test();
        stream.start_stream(&SurfaceId::default());
        stream.start_stream(&SurfaceId("nowhere".into()));
        stream.close_stream(&SurfaceId::default());
        assert!(platform.encoders().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_halts_producer() {
        let platform = SimPlatform::default();
        let enc = encoder(&platform).await;
        let mut events = enc.take_events().unwrap();
        enc.configure(&MediaDescription::default()).await.unwrap();
        let surface = enc.get_input_surface().await.unwrap();
        enc.prepare().await.unwrap();
        let stream = platform.create_media_test();
        stream.start_stream(&surface);
        enc.start().await.unwrap();

        let _changed = events.recv().await;
        let _first = events.recv().await;
        enc.stop().await.unwrap();
        let emitted = platform.encoders()[0].emitted;
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(platform.encoders()[0].emitted, emitted);
    }
}
