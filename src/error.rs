//! Error types for the encoder reliability sequencer

use crate::codec::CodecError;
use crate::step::Step;
use std::fmt;
use thiserror::Error;

/// A scenario assertion that did not hold
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssertionFailure {
    /// Step being dispatched when the assertion failed (if any)
    pub step: Option<Step>,
    /// Whether the step was expected to fail
    pub expected_failure: bool,
    /// The platform error observed, if the call failed
    pub observed: Option<CodecError>,
    pub message: String,
}

impl fmt::Display for AssertionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(step) = self.step {
            write!(f, "{}: ", step)?;
        }
        f.write_str(&self.message)?;
        if let Some(ref observed) = self.observed {
            write!(f, " [{}]", observed)?;
        }
        Ok(())
    }
}

/// Main error type for the sequencer
#[derive(Error, Debug)]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    /// A step outcome or judge did not match the scenario's expectation
    #[error("AssertionError: {0}")]
    Assertion(AssertionFailure),

    /// Platform call failed outside an assertion (e.g. encoder creation)
    #[error("CodecError: {0}")]
    Codec(#[from] CodecError),

    /// Malformed scenario or step program
    #[error("ScenarioError: {0}")]
    Scenario(String),

    /// Invalid runner configuration
    #[error("ConfigError: {0}")]
    Config(String),

    /// IO error
    #[error("IOError: {source}")]
    IoError {
        #[from]
        source: std::io::Error,
    },

    /// Suite or config file could not be decoded
    #[error("JSONError: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },

    /// Internal sequencer error
    #[error("InternalError: {0}")]
    InternalError(String),
}

impl Error {
    /// A lifecycle call whose outcome disagreed with the expect-failure flag
    pub fn mismatch(step: Step, expected_failure: bool, observed: Option<CodecError>) -> Self {
        let message = if expected_failure {
            "expected the call to fail, but it succeeded".to_string()
        } else {
            "expected the call to succeed, but it failed".to_string()
        };
        Error::Assertion(AssertionFailure {
            step: Some(step),
            expected_failure,
            observed,
            message,
        })
    }

    /// An assertion not tied to a lifecycle outcome
    pub fn assertion(message: impl Into<String>) -> Self {
        Error::Assertion(AssertionFailure {
            step: None,
            expected_failure: false,
            observed: None,
            message: message.into(),
        })
    }

    /// Check if this error came from a failed assertion
    pub fn is_assertion(&self) -> bool {
        matches!(self, Error::Assertion(_))
    }
}

/// Result type alias for the sequencer
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{CodecErrorKind, EncoderOp};

    #[test]
    fn test_mismatch_message_expected_failure() {
        let err = Error::mismatch(Step::START, true, None);
        assert!(err.is_assertion());
        assert_eq!(
            err.to_string(),
            "AssertionError: encode:start: expected the call to fail, but it succeeded"
        );
    }

    #[test]
    fn test_mismatch_carries_observed_error() {
        let observed = CodecError::new(EncoderOp::Stop, CodecErrorKind::InvalidState, "");
        let err = Error::mismatch(Step::STOP, false, Some(observed.clone()));
        match err {
            Error::Assertion(failure) => {
                assert_eq!(failure.observed, Some(observed));
                assert!(!failure.expected_failure);
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_codec_error_converts() {
        let codec = CodecError::new(EncoderOp::Create, CodecErrorKind::NotFound, "x264");
        let err: Error = codec.into();
        assert!(!err.is_assertion());
        assert!(err.to_string().starts_with("CodecError: create failed"));
    }
}
