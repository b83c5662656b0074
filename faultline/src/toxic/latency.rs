use rand::Rng as _;
use serde::{Deserialize, Serialize};
use tokio::time::Duration;

use crate::stream::{SleepOutcome, StageExit, StubEvent, ToxicStub};

/// Holds each chunk for `latency_ms`, give or take up to `jitter_ms`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Latency {
    pub latency_ms: u64,
    #[serde(default)]
    pub jitter_ms: u64,
}

/// Chunks are released in arrival order; the deadline is relative to the
/// arrival stamp and never before it, so a jitter larger than the latency
/// clamps to an immediate release.
pub(crate) async fn run(stub: &mut ToxicStub, params: &Latency, toxicity: f32) -> StageExit {
    loop {
        match stub.next().await {
            StubEvent::Chunk(chunk) => {
                if stub.applies(toxicity) {
                    let deadline = chunk.timestamp + delay(stub, params);
                    if stub.sleep_until(deadline).await == SleepOutcome::Interrupted {
                        let _ = stub.send(chunk).await;
                        return StageExit::Interrupted;
                    }
                }
                if stub.send(chunk).await.is_err() {
                    stub.close_output();
                    return StageExit::Closed;
                }
            }
            StubEvent::Eos => {
                stub.close_output();
                return StageExit::Eos;
            }
            StubEvent::Interrupted => return StageExit::Interrupted,
        }
    }
}

fn delay(stub: &mut ToxicStub, params: &Latency) -> Duration {
    let jitter = params.jitter_ms as i64;
    let offset = if jitter == 0 {
        0
    } else {
        stub.rng.gen_range(-jitter..=jitter)
    };
    let millis = (params.latency_ms as i64).saturating_add(offset).max(0);
    Duration::from_millis(millis as u64)
}
