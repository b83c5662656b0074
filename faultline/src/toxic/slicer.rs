use rand::Rng as _;
use serde::{Deserialize, Serialize};
use tokio::time::Duration;

use crate::stream::{Chunk, SleepOutcome, StageExit, StubEvent, ToxicStub};

/// Slices chunks into fragments of roughly `average_size` bytes, varying by
/// up to `size_variation` in either direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slicer {
    pub average_size: u64,
    #[serde(default)]
    pub size_variation: u64,
    /// Pause between emitted fragments, in microseconds.
    #[serde(default)]
    pub delay_ms: u64,
}

pub(crate) async fn run(stub: &mut ToxicStub, params: &Slicer, toxicity: f32) -> StageExit {
    loop {
        match stub.next().await {
            StubEvent::Chunk(mut chunk) => {
                if !stub.applies(toxicity) {
                    if stub.send(chunk).await.is_err() {
                        stub.close_output();
                        return StageExit::Closed;
                    }
                    continue;
                }

                while !chunk.data.is_empty() {
                    let size = fragment_size(stub, params).min(chunk.data.len());
                    let piece = Chunk {
                        data: chunk.data.split_to(size),
                        timestamp: chunk.timestamp,
                    };
                    if stub.send(piece).await.is_err() {
                        stub.close_output();
                        return StageExit::Closed;
                    }
                    if !chunk.data.is_empty()
                        && params.delay_ms > 0
                        && stub.sleep(Duration::from_micros(params.delay_ms)).await == SleepOutcome::Interrupted
                    {
                        // Hand the unsent remainder over in one piece.
                        let _ = stub.send(chunk).await;
                        return StageExit::Interrupted;
                    }
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

fn fragment_size(stub: &mut ToxicStub, params: &Slicer) -> usize {
    let variation = params.size_variation.min(params.average_size) as i64;
    let base = params.average_size as i64;
    let size = if variation == 0 {
        base
    } else {
        base + stub.rng.gen_range(-variation..=variation)
    };
    usize::try_from(size.max(1)).unwrap_or(1)
}
