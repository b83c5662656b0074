use std::sync::atomic::Ordering;

use serde::{Deserialize, Serialize};
use tokio::time::Duration;

use crate::stream::{SleepOutcome, StageExit, ToxicStub};

/// Aborts the connection with an RST after `timeout_ms` of holding the
/// stream (immediately when 0). No data is forwarded in the meantime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResetPeer {
    #[serde(default)]
    pub timeout_ms: u64,
}

pub(crate) async fn run(stub: &mut ToxicStub, params: &ResetPeer) -> StageExit {
    if params.timeout_ms > 0
        && stub.sleep(Duration::from_millis(params.timeout_ms)).await == SleepOutcome::Interrupted
    {
        return StageExit::Interrupted;
    }

    // The output stays open on purpose: an end-of-stream would let the writer
    // half-close gracefully, racing the RST with a FIN.
    stub.flags.reset_peer.store(true, Ordering::SeqCst);
    stub.flags.kill.notify_one();
    StageExit::Closed
}
