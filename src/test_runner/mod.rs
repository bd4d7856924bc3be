//! Scenario test runner
//!
//! Runs [`ScenarioSuite`]s against an encoder platform the way a
//! Jest/deccjsunit harness runs `it` blocks: a settle delay before each case
//! (`beforeEach`), a bounded run, and a teardown that always executes
//! (`afterEach`). Cases run one after another and never overlap.
//!
//! # Example
//!
//! ```no_run
//! use encoder_reliability::scenario::ScenarioSuite;
//! use encoder_reliability::sim::SimPlatform;
//! use encoder_reliability::test_runner::{TestConfig, TestRunner};
//! use std::sync::Arc;
//!
//! # async fn demo() -> encoder_reliability::Result<()> {
//! let mut runner = TestRunner::with_platform(TestConfig::default(), Arc::new(SimPlatform::default()));
//! runner.add_suite(ScenarioSuite::builtin()?);
//! let report = runner.run_all().await?;
//! println!("{}", report);
//! # Ok(())
//! # }
//! ```

use crate::codec::EncoderFactory;
use crate::error::{Error, Result};
use crate::scenario::{Scenario, ScenarioSuite};
use crate::sequencer::{
    spawn_drain_loop, teardown, CompletionReceiver, DispatchEnd, Dispatcher, ScenarioContext,
    ScenarioOptions, Timing,
};
use crate::serde_millis;
use crate::step::StepProgram;
use crate::stream::StreamFactory;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// TestResult
// ---------------------------------------------------------------------------

/// Outcome of a single test case.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TestResult {
    /// Case passed.
    Passed,
    /// Case failed with the given message.
    Failed { message: String },
    /// Case was skipped by the name filter.
    Skipped,
    /// Case exceeded the configured timeout.
    TimedOut,
}

impl fmt::Display for TestResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TestResult::Passed => write!(f, "PASSED"),
            TestResult::Failed { message } => write!(f, "FAILED: {}", message),
            TestResult::Skipped => write!(f, "SKIPPED"),
            TestResult::TimedOut => write!(f, "TIMED OUT"),
        }
    }
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// Result of one case.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CaseReport {
    pub name: String,
    pub title: String,
    #[serde(flatten)]
    pub result: TestResult,
    /// Iterations that ran to completion
    pub iterations: u32,
    #[serde(rename = "duration_ms", with = "serde_millis")]
    pub duration: Duration,
}

/// Aggregated results for a single suite.
#[derive(Debug, Clone, Serialize)]
pub struct SuiteResult {
    /// Suite name.
    pub name: String,
    pub cases: Vec<CaseReport>,
    /// Total time for the suite.
    #[serde(rename = "duration_ms", with = "serde_millis")]
    pub duration: Duration,
}

/// Summary report for an entire run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TestReport {
    pub total: usize,
    pub passed: usize,
    /// Failed cases, timed-out ones included
    pub failed: usize,
    pub skipped: usize,
    pub timed_out: usize,
    #[serde(rename = "duration_ms", with = "serde_millis")]
    pub duration: Duration,
    pub suite_results: Vec<SuiteResult>,
}

impl TestReport {
    fn record(&mut self, case: &CaseReport) {
        self.total += 1;
        match case.result {
            TestResult::Passed => self.passed += 1,
            TestResult::Failed { .. } => self.failed += 1,
            TestResult::Skipped => self.skipped += 1,
            TestResult::TimedOut => {
                self.failed += 1;
                self.timed_out += 1;
            }
        }
    }

    /// True when nothing failed or timed out.
    pub fn is_success(&self) -> bool {
        self.failed == 0
    }
}

impl fmt::Display for TestReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "\n━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━")?;
        writeln!(f, "  Encoder Reliability Report")?;
        writeln!(f, "━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━")?;

        for suite in &self.suite_results {
            writeln!(f, "\n  {} ({:?})", suite.name, suite.duration)?;
            for case in &suite.cases {
                let icon = match case.result {
                    TestResult::Passed => "✓",
                    TestResult::Failed { .. } => "✗",
                    TestResult::Skipped => "○",
                    TestResult::TimedOut => "⏱",
                };
                writeln!(f, "    {} {} ({:?})", icon, case.name, case.duration)?;
                if let TestResult::Failed { ref message } = case.result {
                    writeln!(f, "      {}", message)?;
                }
            }
        }

        writeln!(f, "\n━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━")?;
        writeln!(
            f,
            "  Total: {}  Passed: {}  Failed: {}  Skipped: {}  Timed out: {}",
            self.total, self.passed, self.failed, self.skipped, self.timed_out
        )?;
        writeln!(f, "  Duration: {:?}", self.duration)?;
        writeln!(f, "━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━")?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// TestConfig
// ---------------------------------------------------------------------------

/// Configuration for the test runner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TestConfig {
    /// Maximum time allowed per case iteration.
    #[serde(rename = "timeout_ms", with = "serde_millis")]
    pub timeout: Duration,
    /// Pause before every case.
    #[serde(rename = "settle_delay_ms", with = "serde_millis")]
    pub settle_delay: Duration,
    /// Wait of `encode:waitForEOS`.
    #[serde(rename = "eos_wait_ms", with = "serde_millis")]
    pub eos_wait: Duration,
    /// Wait of `encode:holdOn`.
    #[serde(rename = "hold_wait_ms", with = "serde_millis")]
    pub hold_wait: Duration,
    /// Regex on case names; non-matching cases are skipped.
    pub filter: Option<String>,
    /// Print per-case results to stderr while running.
    pub verbose: bool,
    /// Directory receiving `<output_prefix><case>.es` payload files.
    pub output_dir: Option<PathBuf>,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            settle_delay: Duration::from_millis(1000),
            eos_wait: Duration::from_millis(5000),
            hold_wait: Duration::from_millis(3000),
            filter: None,
            verbose: false,
            output_dir: None,
        }
    }
}

impl TestConfig {
    /// Load a JSON config file; absent fields keep their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let source = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&source)?)
    }

    pub fn timing(&self) -> Timing {
        Timing {
            eos_wait: self.eos_wait,
            hold_wait: self.hold_wait,
        }
    }

    fn filter_regex(&self) -> Result<Option<Regex>> {
        self.filter
            .as_deref()
            .map(|pattern| {
                Regex::new(pattern)
                    .map_err(|e| Error::Config(format!("invalid filter '{}': {}", pattern, e)))
            })
            .transpose()
    }
}

// ---------------------------------------------------------------------------
// TestRunner
// ---------------------------------------------------------------------------

/// Main test runner.
///
/// Register suites, then call [`run_all`](TestRunner::run_all) to execute
/// everything and obtain a [`TestReport`].
pub struct TestRunner {
    /// Registered suites.
    pub suites: Vec<ScenarioSuite>,
    /// Runner configuration.
    pub config: TestConfig,
    encoders: Arc<dyn EncoderFactory>,
    streams: Arc<dyn StreamFactory>,
}

impl fmt::Debug for TestRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestRunner")
            .field("suites", &self.suites.len())
            .field("config", &self.config)
            .finish()
    }
}

impl TestRunner {
    pub fn new(
        config: TestConfig,
        encoders: Arc<dyn EncoderFactory>,
        streams: Arc<dyn StreamFactory>,
    ) -> Self {
        Self {
            suites: Vec::new(),
            config,
            encoders,
            streams,
        }
    }

    /// Runner whose encoders and streams come from the same platform.
    pub fn with_platform<P>(config: TestConfig, platform: Arc<P>) -> Self
    where
        P: EncoderFactory + StreamFactory + 'static,
    {
        let encoders: Arc<dyn EncoderFactory> = platform.clone();
        let streams: Arc<dyn StreamFactory> = platform;
        Self::new(config, encoders, streams)
    }

    pub fn add_suite(&mut self, suite: ScenarioSuite) {
        self.suites.push(suite);
    }

    /// Execute all registered suites and return a report.
    pub async fn run_all(&self) -> Result<TestReport> {
        let run_start = Instant::now();
        let mut report = TestReport::default();
        for suite in &self.suites {
            let suite_result = self.run_suite(suite).await?;
            for case in &suite_result.cases {
                report.record(case);
            }
            report.suite_results.push(suite_result);
        }
        report.duration = run_start.elapsed();
        info!(
            total = report.total,
            passed = report.passed,
            failed = report.failed,
            "run finished"
        );
        Ok(report)
    }

    /// Execute one suite, case by case.
    pub async fn run_suite(&self, suite: &ScenarioSuite) -> Result<SuiteResult> {
        let filter = self.config.filter_regex()?;
        if let Some(ref dir) = self.config.output_dir {
            std::fs::create_dir_all(dir)?;
        }

        let suite_start = Instant::now();
        let mut cases = Vec::with_capacity(suite.scenarios.len());
        info!(suite = %suite.name, cases = suite.scenarios.len(), "suite started");

        for scenario in &suite.scenarios {
            if let Some(ref re) = filter {
                if !re.is_match(&scenario.name) {
                    debug!(case = %scenario.name, "skipped by filter");
                    cases.push(CaseReport {
                        name: scenario.name.clone(),
                        title: scenario.title.clone(),
                        result: TestResult::Skipped,
                        iterations: 0,
                        duration: Duration::ZERO,
                    });
                    continue;
                }
            }

            let case = self.run_case(suite, scenario).await;
            if self.config.verbose {
                eprintln!("  {} … {}", case.name, case.result);
            }
            cases.push(case);
        }

        Ok(SuiteResult {
            name: suite.name.clone(),
            cases,
            duration: suite_start.elapsed(),
        })
    }

    /// Run one case: settle, then every iteration until one does not pass.
    pub async fn run_case(&self, suite: &ScenarioSuite, scenario: &Scenario) -> CaseReport {
        let start = Instant::now();
        info!(case = %scenario.name, title = %scenario.label(), "case started");

        // beforeEach
        tokio::time::sleep(self.config.settle_delay).await;

        let program = scenario.program();
        let mut result = TestResult::Passed;
        let mut iterations = 0;
        for iteration in 0..scenario.iterations {
            result = self.run_iteration(suite, scenario, &program, iteration).await;
            if result != TestResult::Passed {
                break;
            }
            iterations += 1;
        }

        match result {
            TestResult::Passed => info!(case = %scenario.name, "case passed"),
            ref other => warn!(case = %scenario.name, result = %other, "case did not pass"),
        }
        CaseReport {
            name: scenario.name.clone(),
            title: scenario.title.clone(),
            result,
            iterations,
            duration: start.elapsed(),
        }
    }

    fn output_path(&self, suite: &ScenarioSuite, scenario: &Scenario) -> Option<PathBuf> {
        self.config
            .output_dir
            .as_ref()
            .map(|dir| dir.join(format!("{}{}.es", suite.output_prefix, scenario.name)))
    }

    async fn run_iteration(
        &self,
        suite: &ScenarioSuite,
        scenario: &Scenario,
        program: &StepProgram,
        iteration: u32,
    ) -> TestResult {
        let encoder = match scenario.encoder.create(self.encoders.as_ref()).await {
            Ok(encoder) => encoder,
            Err(err) => {
                return TestResult::Failed {
                    message: format!("encoder creation ({}) failed: {}", scenario.encoder, err),
                }
            }
        };
        debug!(case = %scenario.name, iteration, encoder = encoder.name(), "encoder created");

        let options = ScenarioOptions {
            description: suite.media.clone(),
            frame_total: scenario.frame_total,
            workdone_at_eos: scenario.workdone_at_eos,
            query_output_description: scenario.query_output_description,
            flush_at_eos: scenario.flush_at_eos,
            output_path: self.output_path(suite, scenario),
        };
        let (ctx, completion) = ScenarioContext::new(scenario.name.clone(), options, encoder.clone());
        match encoder.take_events() {
            Some(events) => ctx.set_drain_task(spawn_drain_loop(ctx.clone(), events)),
            None => warn!(case = %scenario.name, "encoder events already taken"),
        }

        let mut dispatcher = Dispatcher::new(ctx.clone(), self.streams.clone(), self.config.timing());
        let outcome =
            tokio::time::timeout(self.config.timeout, drive(&mut dispatcher, program, completion)).await;

        // afterEach
        teardown(&ctx).await;

        match outcome {
            Err(_) => TestResult::TimedOut,
            Ok(Ok(())) => TestResult::Passed,
            Ok(Err(err)) => TestResult::Failed {
                message: err.to_string(),
            },
        }
    }
}

/// Race the dispatcher against the completion signal.
async fn drive(
    dispatcher: &mut Dispatcher,
    program: &StepProgram,
    mut completion: CompletionReceiver,
) -> Result<()> {
    let end = tokio::select! {
        end = dispatcher.run(program) => end?,
        done = &mut completion => return settle(done),
    };
    debug!(case = %dispatcher.context().name(), ?end, "dispatcher finished");
    if end == DispatchEnd::AwaitingOutputs {
        info!(case = %dispatcher.context().name(), "waiting for the drain loop");
    }
    settle(completion.await)
}

fn settle(done: std::result::Result<Result<()>, tokio::sync::oneshot::error::RecvError>) -> Result<()> {
    match done {
        Ok(result) => result,
        Err(_) => Err(Error::InternalError(
            "completion dropped without a result".to_string(),
        )),
    }
}
