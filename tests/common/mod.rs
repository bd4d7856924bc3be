//! Shared test helpers for integration tests

use encoder_reliability::codec::{EncoderFactory, VideoEncoder};
use encoder_reliability::sequencer::{
    spawn_drain_loop, CompletionReceiver, Dispatcher, ScenarioContext, ScenarioOptions, Timing,
};
use encoder_reliability::sim::SimPlatform;
use encoder_reliability::test_runner::TestConfig;
use std::sync::Arc;
use std::time::Duration;

/// Runner config without the pause before each case
#[allow(dead_code)]
pub fn fast_config() -> TestConfig {
    TestConfig {
        settle_delay: Duration::ZERO,
        ..TestConfig::default()
    }
}

/// A fresh encoder from the sim's default name
#[allow(dead_code)]
pub async fn encoder(platform: &SimPlatform) -> Arc<dyn VideoEncoder> {
    platform
        .create_by_name("avenc_mpeg4")
        .await
        .expect("default sim encoder exists")
}

/// Context with its drain loop running, plus a dispatcher over it
#[allow(dead_code)]
pub async fn scenario(
    platform: &Arc<SimPlatform>,
    options: ScenarioOptions,
) -> (Dispatcher, Arc<ScenarioContext>, CompletionReceiver) {
    let encoder = encoder(platform).await;
    let events = encoder.take_events().expect("events not yet taken");
    let (ctx, completion) = ScenarioContext::new("it", options, encoder);
    ctx.set_drain_task(spawn_drain_loop(ctx.clone(), events));
    let dispatcher = Dispatcher::new(ctx.clone(), platform.clone(), Timing::default());
    (dispatcher, ctx, completion)
}
