//! Stream harness contract
//!
//! The stream harness is the frame source of a scenario. It is created once,
//! parameterised, pointed at the encoder's input surface and closed again.
//! Its calls are synchronous and have no failure concept; the harness logs
//! and ignores what it cannot do.

use crate::codec::{MediaDescription, SurfaceId};
use std::fmt;
use std::sync::Arc;

/// Parameters applied to a stream before it starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamParams {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    /// Frames emitted before end of stream; `None` streams until closed
    pub frame_count: Option<u32>,
}

impl StreamParams {
    /// Parameters matching a media description with an open-ended stream.
    pub fn from_description(description: &MediaDescription) -> Self {
        Self {
            width: description.width,
            height: description.height,
            frame_rate: description.frame_rate,
            frame_count: None,
        }
    }
}

impl Default for StreamParams {
    fn default() -> Self {
        Self::from_description(&MediaDescription::default())
    }
}

/// A media test stream.
pub trait MediaStream: Send + Sync + fmt::Debug {
    fn set_resolution(&self, width: u32, height: u32);
    fn set_frame_rate(&self, frame_rate: u32);
    fn set_frame_count(&self, frame_count: u32);

    /// Begin feeding frames into `surface`.
    fn start_stream(&self, surface: &SurfaceId);

    fn close_stream(&self, surface: &SurfaceId);

    /// Current parameters.
    fn params(&self) -> StreamParams;
}

/// Creates media test streams.
pub trait StreamFactory: Send + Sync {
    fn create_media_test(&self) -> Arc<dyn MediaStream>;
}

/// Apply resolution and frame rate from `description`.
pub fn apply_params(stream: &dyn MediaStream, description: &MediaDescription) {
    stream.set_resolution(description.width, description.height);
    stream.set_frame_rate(description.frame_rate);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Debug, Default)]
    struct Recorder {
        params: Mutex<StreamParams>,
    }

    impl MediaStream for Recorder {
        fn set_resolution(&self, width: u32, height: u32) {
            let mut p = self.params.lock().unwrap();
            p.width = width;
            p.height = height;
        }
        fn set_frame_rate(&self, frame_rate: u32) {
            self.params.lock().unwrap().frame_rate = frame_rate;
        }
        fn set_frame_count(&self, frame_count: u32) {
            self.params.lock().unwrap().frame_count = Some(frame_count);
        }
        fn start_stream(&self, _surface: &SurfaceId) {}
        fn close_stream(&self, _surface: &SurfaceId) {}
        fn params(&self) -> StreamParams {
            *self.params.lock().unwrap()
        }
    }

    #[test]
    fn test_apply_params_copies_description() {
        let stream = Recorder::default();
        let desc = MediaDescription {
            width: 640,
            height: 480,
            pixel_format: 3,
            frame_rate: 25,
        };
        apply_params(&stream, &desc);
        let params = stream.params();
        assert_eq!((params.width, params.height, params.frame_rate), (640, 480, 25));
        assert_eq!(params.frame_count, None);
    }
}
