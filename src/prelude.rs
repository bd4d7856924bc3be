//! Prelude module for convenient imports
//!
//! This module provides the most commonly used types and traits for writing
//! and running encoder scenarios. Import everything from this module for
//! quick access:
//!
//! ```no_run
//! use encoder_reliability::prelude::*;
//!
//! fn main() -> Result<()> {
//!     let suite = ScenarioSuite::builtin()?;
//!     for scenario in &suite.scenarios {
//!         println!("{}: {}", scenario.name, scenario.program());
//!     }
//!     Ok(())
//! }
//! ```

// Error handling
pub use crate::error::{AssertionFailure, Error, Result};

// Step vocabulary
pub use crate::step::{EncodeStep, Step, StepCursor, StepProgram, StreamStep};

// Platform contract
pub use crate::codec::{
    BufferFlags, CodecError, CodecErrorKind, EncoderFactory, EncoderOp, EncoderSelector,
    MediaDescription, OutputBuffer, SurfaceId, VideoEncoder,
};
pub use crate::stream::{MediaStream, StreamFactory, StreamParams};

// Sequencer
pub use crate::sequencer::{
    DispatchEnd, DispatchRecord, Dispatcher, ScenarioContext, ScenarioOptions, Timing,
};

// Scenarios and runner
pub use crate::scenario::{Scenario, ScenarioSuite, StepEntry};
pub use crate::test_runner::{TestConfig, TestReport, TestResult, TestRunner};

// Simulated platform
pub use crate::sim::{Fault, SimConfig, SimPlatform};
