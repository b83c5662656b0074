use serde::{Deserialize, Serialize};
use tokio::time::Duration;

use crate::stream::{SleepOutcome, StageExit, StubEvent, ToxicStub};

/// Passes data through untouched but delays the close after end-of-stream by
/// `delay_ms`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlowClose {
    pub delay_ms: u64,
}

pub(crate) async fn run(stub: &mut ToxicStub, params: &SlowClose) -> StageExit {
    loop {
        match stub.next().await {
            StubEvent::Chunk(chunk) => {
                if stub.send(chunk).await.is_err() {
                    stub.close_output();
                    return StageExit::Closed;
                }
            }
            StubEvent::Eos => {
                if stub.sleep(Duration::from_millis(params.delay_ms)).await == SleepOutcome::Interrupted {
                    return StageExit::Interrupted;
                }
                stub.close_output();
                return StageExit::Eos;
            }
            StubEvent::Interrupted => return StageExit::Interrupted,
        }
    }
}
