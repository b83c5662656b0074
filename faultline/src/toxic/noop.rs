use crate::stream::{StageExit, StubEvent, ToxicStub};

/// Identity transform. Serves as the chain's head and tail sentinels, and
/// stands in when a connection-scoped toxic misses its toxicity draw.
pub(crate) async fn run(stub: &mut ToxicStub) -> StageExit {
    loop {
        match stub.next().await {
            StubEvent::Chunk(chunk) => {
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
