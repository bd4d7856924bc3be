//! The built-in reliability suite run end to end on the sim platform

mod common;

use common::fast_config;
use encoder_reliability::codec::EncoderOp;
use encoder_reliability::scenario::{Scenario, ScenarioSuite};
use encoder_reliability::sim::{EncoderState, Fault, SimConfig, SimPlatform};
use encoder_reliability::step::Step;
use encoder_reliability::test_runner::{TestConfig, TestResult, TestRunner};
use pretty_assertions::assert_eq;
use std::sync::Arc;

fn subset(names: &[&str]) -> ScenarioSuite {
    let builtin = ScenarioSuite::builtin().unwrap();
    let scenarios = names
        .iter()
        .map(|name| builtin.find(name).cloned().unwrap())
        .collect();
    ScenarioSuite {
        scenarios,
        ..builtin
    }
}

#[tokio::test(start_paused = true)]
async fn test_builtin_suite_passes() {
    let platform = Arc::new(SimPlatform::default());
    let mut runner = TestRunner::with_platform(fast_config(), platform.clone());
    runner.add_suite(ScenarioSuite::builtin().unwrap());
    let report = runner.run_all().await.unwrap();

    let failures: Vec<String> = report
        .suite_results
        .iter()
        .flat_map(|s| &s.cases)
        .filter(|c| c.result != TestResult::Passed)
        .map(|c| format!("{}: {}", c.name, c.result))
        .collect();
    assert_eq!(failures, Vec::<String>::new());
    assert_eq!(report.total, 64);
    assert!(report.is_success());

    // every encoder ends up released, by the case or by teardown
    for encoder in platform.encoders() {
        assert_eq!(encoder.state, EncoderState::Released, "encoder {}", encoder.id);
    }
}

#[tokio::test(start_paused = true)]
async fn test_loop_cases_create_fresh_encoders() {
    let platform = Arc::new(SimPlatform::default());
    let mut runner = TestRunner::with_platform(fast_config(), platform.clone());
    runner.add_suite(subset(&["loop-create-release", "loop-total"]));
    let report = runner.run_all().await.unwrap();

    assert_eq!(report.passed, 2);
    let cases = &report.suite_results[0].cases;
    assert_eq!(cases[0].iterations, 50);
    assert_eq!(cases[1].iterations, 50);
    assert_eq!(platform.encoders().len(), 100);
    assert_eq!(platform.release_count(), 100);
    assert_eq!(platform.call_count(EncoderOp::Flush), 50);
}

#[tokio::test(start_paused = true)]
async fn test_repeat_groups_issue_every_call() {
    let platform = Arc::new(SimPlatform::default());
    let mut runner = TestRunner::with_platform(fast_config(), platform.clone());
    runner.add_suite(subset(&["loop-configure-reset", "loop-start-stop"]));
    let report = runner.run_all().await.unwrap();

    assert_eq!(report.passed, 2);
    assert_eq!(platform.call_count(EncoderOp::Configure), 51);
    assert_eq!(platform.call_count(EncoderOp::Reset), 50);
    assert_eq!(platform.call_count(EncoderOp::Start), 50);
    assert_eq!(platform.call_count(EncoderOp::Stop), 50);
}

#[tokio::test(start_paused = true)]
async fn test_promise_cases_write_output_files() {
    let dir = tempfile::tempdir().unwrap();
    let config = TestConfig {
        output_dir: Some(dir.path().join("out")),
        ..fast_config()
    };
    let platform = Arc::new(SimPlatform::default());
    let mut runner = TestRunner::with_platform(config, platform);
    runner.add_suite(subset(&["promise-start-0300", "promise-start-0600"]));
    let report = runner.run_all().await.unwrap();
    assert_eq!(report.passed, 2);

    let file = dir.path().join("out").join("video_reliability_promise-start-0300.es");
    assert_eq!(std::fs::read(file).unwrap().len(), 10 * 64);
}

#[tokio::test(start_paused = true)]
async fn test_promise_eos_cases_finish_after_the_restart() {
    let platform = Arc::new(SimPlatform::default());
    let mut runner = TestRunner::with_platform(fast_config(), platform.clone());
    runner.add_suite(subset(&["promise-eos-0200", "promise-eos-0400"]));
    let report = runner.run_all().await.unwrap();

    assert_eq!((report.passed, report.failed), (2, 0));
    // each encoder ran two streams of two frames and was released by the drain
    for encoder in platform.encoders() {
        assert_eq!(encoder.state, EncoderState::Released, "encoder {}", encoder.id);
        assert_eq!((encoder.emitted, encoder.frees), (4, 4));
    }
    assert_eq!(platform.release_count(), 2);
    assert_eq!(platform.call_count(EncoderOp::Flush), 1);
    assert_eq!(platform.call_count(EncoderOp::Reset), 2);
}

#[tokio::test(start_paused = true)]
async fn test_fault_breaks_a_passing_case() {
    let config = SimConfig::default().with_fault(Fault::fail(EncoderOp::Prepare, 1));
    let platform = Arc::new(SimPlatform::new(config));
    let mut runner = TestRunner::with_platform(fast_config(), platform.clone());
    runner.add_suite(subset(&["prepare-0200"]));
    let report = runner.run_all().await.unwrap();

    assert_eq!(report.failed, 1);
    let case = &report.suite_results[0].cases[0];
    let TestResult::Failed { ref message } = case.result else {
        panic!("expected a failure, got {}", case.result);
    };
    assert!(message.contains("encode:prepare"), "{}", message);
    // teardown released the encoder the case left behind
    assert_eq!(platform.release_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_wrong_expectation_is_reported_per_case() {
    let suite = ScenarioSuite::new(
        "custom",
        vec![
            Scenario::new("ok", [Step::CONFIGURE, Step::RELEASE]),
            Scenario::new("bad", [Step::CONFIGURE, Step::ERROR, Step::RELEASE]),
        ],
    );
    let platform = Arc::new(SimPlatform::default());
    let mut runner = TestRunner::with_platform(fast_config(), platform);
    runner.add_suite(suite);
    let report = runner.run_all().await.unwrap();

    assert_eq!((report.passed, report.failed), (1, 1));
    let rendered = report.to_string();
    assert!(rendered.contains("✓ ok"));
    assert!(rendered.contains("✗ bad"));
    assert!(rendered.contains("expected the call to fail"));
}
