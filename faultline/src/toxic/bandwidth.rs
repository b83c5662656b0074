use serde::{Deserialize, Serialize};
use tokio::time::{Duration, Instant};

use crate::stream::{Chunk, SleepOutcome, StageExit, StubEvent, ToxicStub};

/// Caps throughput at `rate_kbps` KB/s. A rate of 0 pauses the stream
/// entirely until the toxic is removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bandwidth {
    #[serde(default)]
    pub rate_kbps: u64,
}

/// KB/s is bytes per millisecond, so the per-chunk budget is
/// `len(chunk) / rate` milliseconds. Chunks bigger than 100 ms worth of
/// budget are fragmented so the emission stays smooth.
pub(crate) async fn run(stub: &mut ToxicStub, params: &Bandwidth) -> StageExit {
    let rate = params.rate_kbps;
    let mut debt = Duration::ZERO;

    loop {
        match stub.next().await {
            StubEvent::Chunk(mut chunk) => {
                if rate == 0 {
                    // Paused: hold the chunk until a reconfiguration lets it through.
                    stub.park().await;
                    let _ = stub.send(chunk).await;
                    return StageExit::Interrupted;
                }

                debt += Duration::from_micros(chunk.data.len() as u64 * 1000 / rate);

                let window = usize::try_from(rate.saturating_mul(100)).unwrap_or(usize::MAX);
                while chunk.data.len() > window {
                    if stub.sleep(Duration::from_millis(100)).await == SleepOutcome::Interrupted {
                        let _ = stub.send(chunk).await;
                        return StageExit::Interrupted;
                    }
                    let piece = Chunk {
                        data: chunk.data.split_to(window),
                        timestamp: chunk.timestamp,
                    };
                    if stub.send(piece).await.is_err() {
                        stub.close_output();
                        return StageExit::Closed;
                    }
                    debt = debt.saturating_sub(Duration::from_millis(100));
                }

                let start = Instant::now();
                if stub.sleep(debt).await == SleepOutcome::Interrupted {
                    let _ = stub.send(chunk).await;
                    return StageExit::Interrupted;
                }
                debt = debt.saturating_sub(start.elapsed());

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
