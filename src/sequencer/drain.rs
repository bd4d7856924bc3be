//! Output drain loop
//!
//! One task per scenario iteration consumes the encoder's events. Output
//! records are queued and drained in arrival order: each is appended to the
//! scenario's output file and handed back to the platform. Draining stops at
//! an end-of-stream record or once `frame_total` records have gone out.

use super::{first_failure, ScenarioContext};
use crate::codec::{EncoderEvent, EventReceiver, OutputBuffer};
use crate::step::Step;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Outcome of one drain pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainPass {
    /// Queue emptied
    Idle,
    /// Stopped at end of stream or at the frame budget
    Boundary,
    /// Stopped and ran the finish routine; the loop ends
    Finished,
}

enum Next {
    Record(OutputBuffer, u32),
    Boundary { eos: bool },
}

/// Spawn the drain loop for `ctx` over `events`.
pub fn spawn_drain_loop(ctx: Arc<ScenarioContext>, events: EventReceiver) -> JoinHandle<()> {
    tokio::spawn(drain_loop(ctx, events))
}

async fn drain_loop(ctx: Arc<ScenarioContext>, mut events: EventReceiver) {
    while let Some(event) = events.recv().await {
        match event {
            EncoderEvent::NewOutputData(buffer) => {
                debug!(case = %ctx.name(), index = buffer.index, "output buffer available");
                if !accept(&ctx, buffer).await {
                    continue;
                }
                if drain_pending(&ctx).await == DrainPass::Finished {
                    break;
                }
            }
            EncoderEvent::Error(err) => {
                warn!(case = %ctx.name(), error = %err, "encoder error event");
            }
            EncoderEvent::StreamChanged(description) => {
                for (key, value) in description.entries() {
                    info!(case = %ctx.name(), key, value, "stream changed");
                }
            }
        }
    }
    debug!(case = %ctx.name(), "drain loop ended");
}

/// Queue `buffer` unless output is being dropped. The first accepted record
/// may trigger an output description query.
async fn accept(ctx: &ScenarioContext, buffer: OutputBuffer) -> bool {
    let describe = {
        let mut d = ctx.drain_state();
        if d.stop_buffer || d.closed {
            debug!(
                case = %ctx.name(),
                index = buffer.index,
                stop_buffer = d.stop_buffer,
                "output dropped"
            );
            return false;
        }
        d.pending.push_back(buffer);
        std::mem::take(&mut d.describe_next_output)
    };

    if describe {
        if let Some(encoder) = ctx.encoder() {
            match encoder.output_description().await {
                Ok(description) => {
                    for (key, value) in description.entries() {
                        info!(case = %ctx.name(), key, value, "output description");
                    }
                }
                Err(err) => warn!(case = %ctx.name(), error = %err, "output description query failed"),
            }
        }
    }
    true
}

/// Drain queued records until the queue is empty or draining stops.
///
/// A pass over an empty queue makes no platform call. A record popped at
/// the frame budget is dropped without being freed.
pub async fn drain_pending(ctx: &ScenarioContext) -> DrainPass {
    loop {
        let next = {
            let mut d = ctx.drain_state();
            let Some(buffer) = d.pending.pop_front() else {
                return DrainPass::Idle;
            };
            let eos = buffer.is_eos();
            if eos || d.frames_out >= ctx.frame_total() {
                if eos {
                    d.saw_eos = true;
                    d.closed = true;
                }
                Next::Boundary { eos }
            } else {
                d.frames_out += 1;
                Next::Record(buffer, d.frames_out)
            }
        };

        match next {
            Next::Boundary { eos } => {
                info!(case = %ctx.name(), eos, "drain reached its end");
                let workdone = ctx.drain_state().workdone_at_eos;
                if workdone {
                    ctx.drain_state().closed = true;
                    finish(ctx).await;
                    return DrainPass::Finished;
                }
                return DrainPass::Boundary;
            }
            Next::Record(buffer, frames_out) => {
                persist(ctx, &buffer).await;
                let Some(encoder) = ctx.encoder() else {
                    warn!(case = %ctx.name(), index = buffer.index, "no encoder to return buffer to");
                    continue;
                };
                let index = buffer.index;
                match encoder.free_output_buffer(buffer).await {
                    Ok(()) => debug!(case = %ctx.name(), index, frames_out, "release output"),
                    Err(err) => info!(case = %ctx.name(), index, error = %err, "release output failed"),
                }
            }
        }
    }
}

/// Append the record's payload to the output file on the blocking pool.
async fn persist(ctx: &ScenarioContext, buffer: &OutputBuffer) {
    let Some(path) = ctx.options().output_path.clone() else {
        return;
    };
    let payload = buffer.payload().to_vec();
    let result = tokio::task::spawn_blocking({
        let path = path.clone();
        move || append(&path, &payload)
    })
    .await
    .unwrap_or_else(|join_err| Err(io::Error::other(join_err)));
    if let Err(err) = result {
        warn!(case = %ctx.name(), path = %path.display(), error = %err, "write output failed");
    }
}

fn append(path: &Path, payload: &[u8]) -> io::Result<()> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?
        .write_all(payload)
}

/// Stop, close the stream, reset, release, then signal completion.
async fn finish(ctx: &ScenarioContext) {
    let mut failure = None;
    if let Some(encoder) = ctx.encoder() {
        first_failure(Step::STOP, encoder.stop().await, &mut failure);
        ctx.close_stream();
        first_failure(Step::RESET, encoder.reset().await, &mut failure);
        ctx.take_encoder();
        first_failure(Step::RELEASE, encoder.release().await, &mut failure);
        debug!(case = %ctx.name(), "finish routine done");
    }
    ctx.completion().complete(failure.map_or(Ok(()), Err));
}
