//! Step vocabulary and step programs
//!
//! A scenario is written as a flat list of symbolic steps. Encoder steps name
//! lifecycle calls on the encoder under test; stream steps drive the frame
//! source that feeds the encoder's input surface. Each step has a stable
//! token string (`"encode:configure"`, `"stream:start"`, ...) used by suite
//! files.
//!
//! A [`StepProgram`] is immutable and cheap to clone. Interpretation walks it
//! with a [`StepCursor`], so a program can be inspected or replayed after a
//! run without having been consumed.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

// ---------------------------------------------------------------------------
// Vocabulary
// ---------------------------------------------------------------------------

/// Encoder-side steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EncodeStep {
    /// `configure(description)`
    Configure,
    /// `getInputSurface()`, remembers the surface for the stream harness
    GetInputSurface,
    /// `prepare()`
    Prepare,
    /// `start()`
    Start,
    /// `flush()`
    Flush,
    /// `stop()`
    Stop,
    /// `reset()`
    Reset,
    /// Fixed wait for the encoder to reach end of stream
    WaitForEos,
    /// Hand forward progress over to the output drain loop
    WaitForAllOutputs,
    /// Expect-failure marker
    Error,
    /// `release()`, terminal
    Release,
    /// Fixed hold between steps
    HoldOn,
    /// Assert that an end-of-stream record has been drained
    JudgeEos,
}

/// Stream-harness steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamStep {
    /// Create the media test stream
    Create,
    /// Resolution, frame rate and frame count in one step
    Prepare,
    /// Resolution and frame rate
    SetParam,
    /// Frame count after which the stream signals end of stream
    SetEosFrame,
    /// Start feeding the encoder's input surface
    Start,
    /// Close the stream
    Stop,
}

/// A single step of a scenario.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Step {
    Encode(EncodeStep),
    Stream(StreamStep),
}

impl Step {
    pub const CONFIGURE: Step = Step::Encode(EncodeStep::Configure);
    pub const GET_INPUT_SURFACE: Step = Step::Encode(EncodeStep::GetInputSurface);
    pub const PREPARE: Step = Step::Encode(EncodeStep::Prepare);
    pub const START: Step = Step::Encode(EncodeStep::Start);
    pub const FLUSH: Step = Step::Encode(EncodeStep::Flush);
    pub const STOP: Step = Step::Encode(EncodeStep::Stop);
    pub const RESET: Step = Step::Encode(EncodeStep::Reset);
    pub const WAIT_FOR_EOS: Step = Step::Encode(EncodeStep::WaitForEos);
    pub const WAIT_FOR_ALL_OUTPUTS: Step = Step::Encode(EncodeStep::WaitForAllOutputs);
    pub const ERROR: Step = Step::Encode(EncodeStep::Error);
    pub const RELEASE: Step = Step::Encode(EncodeStep::Release);
    pub const HOLD_ON: Step = Step::Encode(EncodeStep::HoldOn);
    pub const JUDGE_EOS: Step = Step::Encode(EncodeStep::JudgeEos);

    pub const STREAM_CREATE: Step = Step::Stream(StreamStep::Create);
    pub const STREAM_PREPARE: Step = Step::Stream(StreamStep::Prepare);
    pub const STREAM_SET_PARAM: Step = Step::Stream(StreamStep::SetParam);
    pub const STREAM_SET_EOS_FRAME: Step = Step::Stream(StreamStep::SetEosFrame);
    pub const STREAM_START: Step = Step::Stream(StreamStep::Start);
    pub const STREAM_STOP: Step = Step::Stream(StreamStep::Stop);

    /// Every step, in vocabulary order.
    pub const ALL: [Step; 19] = [
        Step::CONFIGURE,
        Step::GET_INPUT_SURFACE,
        Step::PREPARE,
        Step::START,
        Step::FLUSH,
        Step::STOP,
        Step::RESET,
        Step::WAIT_FOR_EOS,
        Step::WAIT_FOR_ALL_OUTPUTS,
        Step::ERROR,
        Step::RELEASE,
        Step::HOLD_ON,
        Step::JUDGE_EOS,
        Step::STREAM_CREATE,
        Step::STREAM_PREPARE,
        Step::STREAM_SET_PARAM,
        Step::STREAM_SET_EOS_FRAME,
        Step::STREAM_START,
        Step::STREAM_STOP,
    ];

    /// Token string used in suite files.
    pub fn token(self) -> &'static str {
        match self {
            Step::Encode(step) => match step {
                EncodeStep::Configure => "encode:configure",
                EncodeStep::GetInputSurface => "encode:getSurface",
                EncodeStep::Prepare => "encode:prepare",
                EncodeStep::Start => "encode:start",
                EncodeStep::Flush => "encode:flush",
                EncodeStep::Stop => "encode:stop",
                EncodeStep::Reset => "encode:reset",
                EncodeStep::WaitForEos => "encode:waitForEOS",
                EncodeStep::WaitForAllOutputs => "encode:waitForAllOuts",
                EncodeStep::Error => "encode:error",
                EncodeStep::Release => "encode:release",
                EncodeStep::HoldOn => "encode:holdOn",
                EncodeStep::JudgeEos => "encode:judgeEOS",
            },
            Step::Stream(step) => match step {
                StreamStep::Create => "stream:create",
                StreamStep::Prepare => "stream:prepare",
                StreamStep::SetParam => "stream:setParam",
                StreamStep::SetEosFrame => "stream:setEOSFrame",
                StreamStep::Start => "stream:start",
                StreamStep::Stop => "stream:stop",
            },
        }
    }

    /// True for steps that issue exactly one encoder call whose success or
    /// failure is judged against the expect-failure flag.
    pub fn is_lifecycle_call(self) -> bool {
        matches!(
            self,
            Step::Encode(
                EncodeStep::Configure
                    | EncodeStep::GetInputSurface
                    | EncodeStep::Prepare
                    | EncodeStep::Start
                    | EncodeStep::Flush
                    | EncodeStep::Stop
                    | EncodeStep::Reset
            )
        )
    }

    pub fn is_error_marker(self) -> bool {
        self == Step::ERROR
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

impl FromStr for Step {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Step::ALL
            .iter()
            .copied()
            .find(|step| step.token() == s)
            .ok_or_else(|| Error::Scenario(format!("unknown step token '{}'", s)))
    }
}

impl TryFrom<String> for Step {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Step> for String {
    fn from(step: Step) -> Self {
        step.token().to_string()
    }
}

// ---------------------------------------------------------------------------
// StepProgram / StepCursor
// ---------------------------------------------------------------------------

/// Immutable, shareable sequence of steps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepProgram {
    steps: Arc<[Step]>,
}

impl StepProgram {
    pub fn new(steps: impl Into<Vec<Step>>) -> Self {
        Self {
            steps: steps.into().into(),
        }
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// A cursor positioned on the first step.
    pub fn cursor(&self) -> StepCursor {
        StepCursor {
            program: self.clone(),
            position: 0,
        }
    }
}

impl FromIterator<Step> for StepProgram {
    fn from_iter<I: IntoIterator<Item = Step>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect::<Vec<_>>())
    }
}

impl fmt::Display for StepProgram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, step) in self.steps.iter().enumerate() {
            if i > 0 {
                f.write_str(" -> ")?;
            }
            write!(f, "{}", step)?;
        }
        Ok(())
    }
}

/// Read position into a [`StepProgram`]; consumes from the front.
#[derive(Debug, Clone)]
pub struct StepCursor {
    program: StepProgram,
    position: usize,
}

impl StepCursor {
    /// The step at the head of the queue.
    pub fn peek(&self) -> Option<Step> {
        self.program.steps.get(self.position).copied()
    }

    /// Remove and return the head step.
    pub fn advance(&mut self) -> Option<Step> {
        let step = self.peek()?;
        self.position += 1;
        Some(step)
    }

    /// Remove the head step only if it equals `step`.
    pub fn advance_if(&mut self, step: Step) -> bool {
        if self.peek() == Some(step) {
            self.position += 1;
            true
        } else {
            false
        }
    }

    /// Index of the head step within the program.
    pub fn position(&self) -> usize {
        self.position
    }

    /// Steps not yet consumed.
    pub fn remaining(&self) -> &[Step] {
        &self.program.steps[self.position.min(self.program.len())..]
    }

    pub fn is_exhausted(&self) -> bool {
        self.position >= self.program.len()
    }

    pub fn program(&self) -> &StepProgram {
        &self.program
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokens_are_unique_and_parse_back() {
        for step in Step::ALL {
            assert_eq!(step.token().parse::<Step>().unwrap(), step);
        }
        let mut tokens: Vec<_> = Step::ALL.iter().map(|s| s.token()).collect();
        tokens.sort_unstable();
        tokens.dedup();
        assert_eq!(tokens.len(), Step::ALL.len());
    }

    #[test]
    fn test_unknown_token_rejected() {
        let err = "encode:explode".parse::<Step>().unwrap_err();
        assert!(err.to_string().contains("encode:explode"));
    }

    #[test]
    fn test_lifecycle_classification() {
        assert!(Step::CONFIGURE.is_lifecycle_call());
        assert!(Step::GET_INPUT_SURFACE.is_lifecycle_call());
        assert!(Step::RESET.is_lifecycle_call());
        assert!(!Step::RELEASE.is_lifecycle_call());
        assert!(!Step::ERROR.is_lifecycle_call());
        assert!(!Step::WAIT_FOR_EOS.is_lifecycle_call());
        assert!(!Step::STREAM_START.is_lifecycle_call());
        assert!(Step::ERROR.is_error_marker());
    }

    #[test]
    fn test_serde_uses_tokens() {
        let json = serde_json::to_string(&vec![Step::START, Step::STREAM_SET_EOS_FRAME]).unwrap();
        assert_eq!(json, r#"["encode:start","stream:setEOSFrame"]"#);
        let back: Vec<Step> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, vec![Step::START, Step::STREAM_SET_EOS_FRAME]);
        assert!(serde_json::from_str::<Step>(r#""stream:teleport""#).is_err());
    }

    #[test]
    fn test_cursor_consumes_without_mutating_program() {
        let program = StepProgram::new(vec![Step::CONFIGURE, Step::ERROR, Step::RELEASE]);
        let mut cursor = program.cursor();
        assert_eq!(cursor.advance(), Some(Step::CONFIGURE));
        assert!(!cursor.advance_if(Step::START));
        assert!(cursor.advance_if(Step::ERROR));
        assert_eq!(cursor.remaining(), &[Step::RELEASE]);
        assert_eq!(cursor.position(), 2);
        assert_eq!(cursor.advance(), Some(Step::RELEASE));
        assert!(cursor.is_exhausted());
        assert_eq!(cursor.advance(), None);
        assert!(cursor.remaining().is_empty());

        // a fresh cursor replays from the start
        assert_eq!(program.cursor().peek(), Some(Step::CONFIGURE));
        assert_eq!(program.len(), 3);
    }

    #[test]
    fn test_program_display() {
        let program: StepProgram = [Step::PREPARE, Step::START].into_iter().collect();
        assert_eq!(program.to_string(), "encode:prepare -> encode:start");
    }
}
