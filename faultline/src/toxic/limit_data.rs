use serde::{Deserialize, Serialize};

use crate::stream::{StageExit, StageState, StubEvent, ToxicStub};

/// Forwards at most `bytes` bytes, then closes the stream cleanly,
/// truncating the chunk that crosses the budget. The running total lives in
/// the stage state so it survives reconfigurations: shrinking the budget
/// below what was already forwarded closes the stream on restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitData {
    pub bytes: u64,
}

pub(crate) async fn run(stub: &mut ToxicStub, params: &LimitData) -> StageExit {
    let mut transmitted = match stub.state {
        Some(StageState::LimitData { transmitted }) => transmitted,
        None => 0,
    };

    loop {
        if transmitted >= params.bytes {
            stub.close_output();
            return StageExit::Closed;
        }

        match stub.next().await {
            StubEvent::Chunk(mut chunk) => {
                let remaining = params.bytes - transmitted;
                if chunk.data.len() as u64 > remaining {
                    chunk.data.truncate(remaining as usize);
                }
                transmitted += chunk.data.len() as u64;
                stub.state = Some(StageState::LimitData { transmitted });

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
