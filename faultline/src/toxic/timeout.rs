use serde::{Deserialize, Serialize};
use tokio::time::Duration;

use crate::stream::{SleepOutcome, StageExit, ToxicStub};

/// Stops all data from flowing and closes the stream once `timeout_ms`
/// elapses. A timeout of 0 stalls the connection forever: nothing is
/// forwarded and the pipeline sits idle until external teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timeout {
    pub timeout_ms: u64,
}

pub(crate) async fn run(stub: &mut ToxicStub, params: &Timeout) -> StageExit {
    if params.timeout_ms == 0 {
        stub.park().await;
        return StageExit::Interrupted;
    }

    match stub.sleep(Duration::from_millis(params.timeout_ms)).await {
        SleepOutcome::Elapsed => {
            stub.close_output();
            StageExit::Closed
        }
        SleepOutcome::Interrupted => StageExit::Interrupted,
    }
}
