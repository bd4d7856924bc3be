//! Scenario definitions
//!
//! Scenarios are pure data. A suite file is JSON:
//!
//! ```json
//! {
//!   "name": "VideoEncoderSoftwareReliability",
//!   "output_prefix": "video_reliability_",
//!   "scenarios": [
//!     { "name": "start-0100", "title": "001.create -> start",
//!       "steps": ["encode:start", "encode:error", "encode:release"] },
//!     { "name": "loop-configure-reset",
//!       "steps": [{ "repeat": 50, "steps": ["encode:configure", "encode:reset"] },
//!                 "encode:release"] }
//!   ]
//! }
//! ```
//!
//! Repeat groups are flattened when the scenario's [`StepProgram`] is built.

use crate::codec::{EncoderSelector, MediaDescription};
use crate::error::{Error, Result};
use crate::step::{Step, StepProgram};
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Suite shipped with the crate
pub const BUILTIN_SUITE: &str = include_str!("../../scenarios/video_encoder_reliability.json");

/// One entry of a scenario's step list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StepEntry {
    Single(Step),
    Repeat { repeat: u32, steps: Vec<StepEntry> },
}

impl StepEntry {
    fn flatten_into(&self, out: &mut Vec<Step>) {
        match self {
            StepEntry::Single(step) => out.push(*step),
            StepEntry::Repeat { repeat, steps } => {
                for _ in 0..*repeat {
                    for entry in steps {
                        entry.flatten_into(out);
                    }
                }
            }
        }
    }

    fn validate(&self, scenario: &str) -> Result<()> {
        if let StepEntry::Repeat { repeat, steps } = self {
            if *repeat == 0 {
                return Err(Error::Scenario(format!(
                    "scenario '{}': repeat count must be at least 1",
                    scenario
                )));
            }
            if steps.is_empty() {
                return Err(Error::Scenario(format!(
                    "scenario '{}': empty repeat group",
                    scenario
                )));
            }
            for entry in steps {
                entry.validate(scenario)?;
            }
        }
        Ok(())
    }
}

impl From<Step> for StepEntry {
    fn from(step: Step) -> Self {
        StepEntry::Single(step)
    }
}

fn default_frame_total() -> u32 {
    100
}

fn default_iterations() -> u32 {
    1
}

/// A single test case
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scenario {
    pub name: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub encoder: EncoderSelector,
    pub steps: Vec<StepEntry>,
    #[serde(default = "default_frame_total")]
    pub frame_total: u32,
    #[serde(default)]
    pub workdone_at_eos: bool,
    #[serde(default)]
    pub query_output_description: bool,
    #[serde(default)]
    pub flush_at_eos: bool,
    /// Create-and-run repetitions, each with a fresh encoder
    #[serde(default = "default_iterations")]
    pub iterations: u32,
}

impl Scenario {
    pub fn new(name: impl Into<String>, steps: impl IntoIterator<Item = Step>) -> Self {
        Self {
            name: name.into(),
            title: String::new(),
            encoder: EncoderSelector::default(),
            steps: steps.into_iter().map(StepEntry::from).collect(),
            frame_total: default_frame_total(),
            workdone_at_eos: false,
            query_output_description: false,
            flush_at_eos: false,
            iterations: default_iterations(),
        }
    }

    pub fn with_frame_total(mut self, frame_total: u32) -> Self {
        self.frame_total = frame_total;
        self
    }

    pub fn with_workdone_at_eos(mut self, enabled: bool) -> Self {
        self.workdone_at_eos = enabled;
        self
    }

    pub fn with_flush_at_eos(mut self, enabled: bool) -> Self {
        self.flush_at_eos = enabled;
        self
    }

    pub fn with_encoder(mut self, encoder: EncoderSelector) -> Self {
        self.encoder = encoder;
        self
    }

    pub fn with_iterations(mut self, iterations: u32) -> Self {
        self.iterations = iterations;
        self
    }

    /// The flattened step program.
    pub fn program(&self) -> StepProgram {
        let mut steps = Vec::new();
        for entry in &self.steps {
            entry.flatten_into(&mut steps);
        }
        StepProgram::new(steps)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Scenario("scenario with an empty name".to_string()));
        }
        if self.steps.is_empty() {
            return Err(Error::Scenario(format!("scenario '{}' has no steps", self.name)));
        }
        if self.frame_total == 0 {
            return Err(Error::Scenario(format!(
                "scenario '{}': frame_total must be positive",
                self.name
            )));
        }
        if self.iterations == 0 {
            return Err(Error::Scenario(format!(
                "scenario '{}': iterations must be at least 1",
                self.name
            )));
        }
        for entry in &self.steps {
            entry.validate(&self.name)?;
        }
        Ok(())
    }

    /// Display title, falling back to the name.
    pub fn label(&self) -> &str {
        if self.title.is_empty() {
            &self.name
        } else {
            &self.title
        }
    }
}

/// A named collection of scenarios
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScenarioSuite {
    pub name: String,
    /// Prefix of per-case output file names
    #[serde(default)]
    pub output_prefix: String,
    #[serde(default)]
    pub description: String,
    /// Format handed to `configure` in every case of the suite
    #[serde(default)]
    pub media: MediaDescription,
    pub scenarios: Vec<Scenario>,
}

impl ScenarioSuite {
    pub fn new(name: impl Into<String>, scenarios: Vec<Scenario>) -> Self {
        Self {
            name: name.into(),
            output_prefix: String::new(),
            description: String::new(),
            media: MediaDescription::default(),
            scenarios,
        }
    }

    /// Parse and validate a suite.
    pub fn from_json(source: &str) -> Result<Self> {
        let suite: ScenarioSuite = serde_json::from_str(source)?;
        suite.validate()?;
        Ok(suite)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let source = std::fs::read_to_string(path)?;
        Self::from_json(&source)
    }

    /// The suite shipped with the crate.
    pub fn builtin() -> Result<Self> {
        Self::from_json(BUILTIN_SUITE)
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = FxHashSet::default();
        for scenario in &self.scenarios {
            scenario.validate()?;
            if !seen.insert(scenario.name.as_str()) {
                return Err(Error::Scenario(format!(
                    "duplicate scenario name '{}'",
                    scenario.name
                )));
            }
        }
        Ok(())
    }

    pub fn find(&self, name: &str) -> Option<&Scenario> {
        self.scenarios.iter().find(|s| s.name == name)
    }

    pub fn len(&self) -> usize {
        self.scenarios.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scenarios.is_empty()
    }
}
