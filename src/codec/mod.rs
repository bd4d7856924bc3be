//! Encoder platform contract
//!
//! The encoder under test lives outside this crate. This module names the
//! boundary: the media description handed to `configure`, the output buffer
//! records the encoder produces, the events it delivers, and the
//! [`VideoEncoder`] / [`EncoderFactory`] traits the sequencer drives.
//!
//! Every lifecycle call is asynchronous and reports failure through
//! [`CodecError`]; the sequencer never inspects the error beyond its
//! presence.

use async_trait::async_trait;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

// ---------------------------------------------------------------------------
// MediaDescription
// ---------------------------------------------------------------------------

/// Format handed to `configure` and echoed back by `streamChanged`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaDescription {
    pub width: u32,
    pub height: u32,
    /// Platform pixel format code (3 = NV21)
    pub pixel_format: u32,
    pub frame_rate: u32,
}

impl Default for MediaDescription {
    fn default() -> Self {
        Self {
            width: 320,
            height: 240,
            pixel_format: 3,
            frame_rate: 30,
        }
    }
}

impl MediaDescription {
    /// Time between two frames at the configured rate.
    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(1000 / u64::from(self.frame_rate.max(1)))
    }

    /// Key/value view used when logging format changes.
    pub fn entries(&self) -> [(&'static str, u32); 4] {
        [
            ("width", self.width),
            ("height", self.height),
            ("pixel_format", self.pixel_format),
            ("frame_rate", self.frame_rate),
        ]
    }
}

// ---------------------------------------------------------------------------
// Output buffers
// ---------------------------------------------------------------------------

bitflags! {
    /// Flags carried by an [`OutputBuffer`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BufferFlags: u32 {
        /// Last record of the stream
        const EOS = 1;
        const SYNC_FRAME = 1 << 1;
        const PARTIAL_FRAME = 1 << 2;
        const CODEC_DATA = 1 << 3;
    }
}

/// One unit of encoded output, lent by the platform until it is handed back
/// through [`VideoEncoder::free_output_buffer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputBuffer {
    pub data: Vec<u8>,
    /// Valid bytes at the front of `data`
    pub length: usize,
    pub index: u32,
    pub flags: BufferFlags,
    pub timestamp_us: i64,
}

impl OutputBuffer {
    pub fn is_eos(&self) -> bool {
        self.flags.contains(BufferFlags::EOS)
    }

    /// The valid part of `data`.
    pub fn payload(&self) -> &[u8] {
        &self.data[..self.length.min(self.data.len())]
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Encoder operations, as named in errors and call logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncoderOp {
    Create,
    Configure,
    GetInputSurface,
    Prepare,
    Start,
    Flush,
    Stop,
    Reset,
    Release,
    FreeOutputBuffer,
    GetOutputDescription,
}

impl fmt::Display for EncoderOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EncoderOp::Create => "create",
            EncoderOp::Configure => "configure",
            EncoderOp::GetInputSurface => "getInputSurface",
            EncoderOp::Prepare => "prepare",
            EncoderOp::Start => "start",
            EncoderOp::Flush => "flush",
            EncoderOp::Stop => "stop",
            EncoderOp::Reset => "reset",
            EncoderOp::Release => "release",
            EncoderOp::FreeOutputBuffer => "freeOutputBuffer",
            EncoderOp::GetOutputDescription => "getOutputMediaDescription",
        };
        f.write_str(name)
    }
}

/// Error categories reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodecErrorKind {
    /// Operation not allowed in the encoder's current state
    InvalidState,
    /// Buffer index not owned by the caller
    InvalidBuffer,
    InvalidArgument,
    /// No encoder with that name or mime type
    NotFound,
    /// Encoder already released
    Released,
    /// Failure forced by a test fault
    Injected,
}

impl fmt::Display for CodecErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CodecErrorKind::InvalidState => "invalid state",
            CodecErrorKind::InvalidBuffer => "invalid buffer",
            CodecErrorKind::InvalidArgument => "invalid argument",
            CodecErrorKind::NotFound => "not found",
            CodecErrorKind::Released => "released",
            CodecErrorKind::Injected => "injected fault",
        };
        f.write_str(name)
    }
}

/// Error delivered to a lifecycle callback.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{op} failed: {kind}{}", detail(.message))]
pub struct CodecError {
    pub op: EncoderOp,
    pub kind: CodecErrorKind,
    pub message: String,
}

impl CodecError {
    pub fn new(op: EncoderOp, kind: CodecErrorKind, message: impl Into<String>) -> Self {
        Self {
            op,
            kind,
            message: message.into(),
        }
    }
}

fn detail(message: &str) -> String {
    if message.is_empty() {
        String::new()
    } else {
        format!(" ({})", message)
    }
}

pub type CodecResult<T> = std::result::Result<T, CodecError>;

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Notifications registered once per encoder (`newOutputData`, `error`,
/// `streamChanged`).
#[derive(Debug, Clone, PartialEq)]
pub enum EncoderEvent {
    NewOutputData(OutputBuffer),
    Error(CodecError),
    StreamChanged(MediaDescription),
}

pub type EventReceiver = mpsc::UnboundedReceiver<EncoderEvent>;
pub type EventSender = mpsc::UnboundedSender<EncoderEvent>;

/// Identifier of an encoder input surface.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct SurfaceId(pub String);

impl SurfaceId {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for SurfaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// A video encoder instance.
#[async_trait]
pub trait VideoEncoder: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    async fn configure(&self, description: &MediaDescription) -> CodecResult<()>;
    async fn get_input_surface(&self) -> CodecResult<SurfaceId>;
    async fn prepare(&self) -> CodecResult<()>;
    async fn start(&self) -> CodecResult<()>;
    async fn flush(&self) -> CodecResult<()>;
    async fn stop(&self) -> CodecResult<()>;
    async fn reset(&self) -> CodecResult<()>;
    async fn release(&self) -> CodecResult<()>;

    /// Hand a drained buffer back to the platform.
    async fn free_output_buffer(&self, buffer: OutputBuffer) -> CodecResult<()>;

    async fn output_description(&self) -> CodecResult<MediaDescription>;

    /// Register for events. Yields the receiver the first time only.
    fn take_events(&self) -> Option<EventReceiver>;
}

/// Creates encoders by codec name or mime type.
#[async_trait]
pub trait EncoderFactory: Send + Sync {
    async fn create_by_name(&self, name: &str) -> CodecResult<Arc<dyn VideoEncoder>>;
    async fn create_by_mime(&self, mime: &str) -> CodecResult<Arc<dyn VideoEncoder>>;
}

/// How a scenario obtains its encoder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncoderSelector {
    ByName(String),
    ByMime(String),
}

impl Default for EncoderSelector {
    fn default() -> Self {
        EncoderSelector::ByName("avenc_mpeg4".to_string())
    }
}

impl EncoderSelector {
    pub async fn create(&self, factory: &dyn EncoderFactory) -> CodecResult<Arc<dyn VideoEncoder>> {
        match self {
            EncoderSelector::ByName(name) => factory.create_by_name(name).await,
            EncoderSelector::ByMime(mime) => factory.create_by_mime(mime).await,
        }
    }
}

impl fmt::Display for EncoderSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncoderSelector::ByName(name) => write!(f, "name:{}", name),
            EncoderSelector::ByMime(mime) => write!(f, "mime:{}", mime),
        }
    }
}
