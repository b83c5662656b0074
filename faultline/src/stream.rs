//! The stream primitive: timestamped chunks flowing through bounded links,
//! and the stub each pipeline stage drives.
//!
//! Links carry two distinct termination signals. End-of-stream is channel
//! closure and propagates a close down the pipeline. The interrupt signal is
//! delivered out of band during a chain reconfiguration: it makes a stage
//! yield so its links can be repositioned, and must never lose buffered data.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use bytes::Bytes;
use rand::Rng as _;
use rand::rngs::StdRng;
use tokio::sync::{Notify, mpsc};
use tokio::time::{Duration, Instant};

/// Upper bound for a single socket read; chunks are never larger than this.
pub const READ_BUFFER_SIZE: usize = 32 * 1024;

/// A slice of the byte stream, stamped with the instant it was read off the
/// source socket. Time-based toxics compute deadlines relative to the stamp.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub data: Bytes,
    pub timestamp: Instant,
}

impl Chunk {
    pub fn new(data: Bytes) -> Self {
        Self {
            data,
            timestamp: Instant::now(),
        }
    }
}

pub type ChunkSender = mpsc::Sender<Chunk>;
pub type ChunkReceiver = mpsc::Receiver<Chunk>;

/// Bounded handoff between two adjacent pipeline stages. A full link blocks
/// the producer, which is how back-pressure reaches the socket read.
pub fn link_channel(capacity: usize) -> (ChunkSender, ChunkReceiver) {
    mpsc::channel(capacity)
}

/// Signals shared by every stage of one connection pair.
#[derive(Debug, Default)]
pub struct LinkFlags {
    /// When set, teardown aborts the sockets with an RST instead of a FIN.
    pub reset_peer: AtomicBool,
    /// Force-kill switch for the whole connection pair.
    pub kill: Notify,
}

/// What a stage sees when it asks for the next chunk.
#[derive(Debug)]
pub enum StubEvent {
    Chunk(Chunk),
    Eos,
    Interrupted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SleepOutcome {
    Elapsed,
    Interrupted,
}

/// How a stage finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageExit {
    /// Input reached end-of-stream and the close was propagated.
    Eos,
    /// The toxic terminated the stream on purpose, or the output vanished.
    Closed,
    /// A reconfiguration interrupted the stage; it can be restarted.
    Interrupted,
}

/// Per-connection toxic state that must survive stage restarts.
#[derive(Debug, Clone, Copy)]
pub enum StageState {
    LimitData { transmitted: u64 },
}

/// Returned by [`ToxicStub::send`] when the downstream half of the pipeline
/// is gone.
#[derive(Debug)]
pub struct OutputClosed;

/// The (input, output) pair handed to a running stage, along with its
/// interrupt receiver, deterministic RNG and persistent state slot.
pub struct ToxicStub {
    input: ChunkReceiver,
    output: Option<ChunkSender>,
    interrupt: mpsc::Receiver<()>,
    pub rng: StdRng,
    pub state: Option<StageState>,
    pub flags: Arc<LinkFlags>,
}

impl ToxicStub {
    pub(crate) fn new(
        input: ChunkReceiver,
        output: ChunkSender,
        interrupt: mpsc::Receiver<()>,
        rng: StdRng,
        state: Option<StageState>,
        flags: Arc<LinkFlags>,
    ) -> Self {
        Self {
            input,
            output: Some(output),
            interrupt,
            rng,
            state,
            flags,
        }
    }

    /// Waits for the next chunk, yielding to the interrupt signal first.
    pub async fn next(&mut self) -> StubEvent {
        tokio::select! {
            biased;
            _ = self.interrupt.recv() => StubEvent::Interrupted,
            chunk = self.input.recv() => match chunk {
                Some(chunk) => StubEvent::Chunk(chunk),
                None => StubEvent::Eos,
            },
        }
    }

    /// Sends downstream. Deliberately not interruptible: the next stage keeps
    /// draining during a reconfiguration, and an interrupted stage flushes its
    /// in-hand chunk through here before yielding.
    pub async fn send(&mut self, chunk: Chunk) -> Result<(), OutputClosed> {
        match &self.output {
            Some(output) => output.send(chunk).await.map_err(|_| OutputClosed),
            None => Err(OutputClosed),
        }
    }

    /// Propagates end-of-stream to the next stage.
    pub fn close_output(&mut self) {
        self.output = None;
    }

    pub async fn sleep(&mut self, duration: Duration) -> SleepOutcome {
        tokio::select! {
            biased;
            _ = self.interrupt.recv() => SleepOutcome::Interrupted,
            _ = tokio::time::sleep(duration) => SleepOutcome::Elapsed,
        }
    }

    pub async fn sleep_until(&mut self, deadline: Instant) -> SleepOutcome {
        tokio::select! {
            biased;
            _ = self.interrupt.recv() => SleepOutcome::Interrupted,
            _ = tokio::time::sleep_until(deadline) => SleepOutcome::Elapsed,
        }
    }

    /// Blocks until a reconfiguration interrupt; used by toxics that stall
    /// the stream outright.
    pub async fn park(&mut self) {
        let _ = self.interrupt.recv().await;
    }

    /// Draws against the configured toxicity probability.
    pub fn applies(&mut self, toxicity: f32) -> bool {
        self.rng.r#gen::<f32>() < toxicity
    }

    pub(crate) fn output_sender(&self) -> Option<ChunkSender> {
        self.output.clone()
    }

    pub(crate) fn set_output(&mut self, output: ChunkSender) {
        self.output = Some(output);
    }

    /// Forwards whatever is still queued on the input. Used when a stage is
    /// unlinked, so buffered chunks skip the removed transform instead of
    /// being dropped.
    pub(crate) async fn drain_queued(&mut self) -> Result<(), OutputClosed> {
        while let Ok(chunk) = self.input.try_recv() {
            self.send(chunk).await?;
        }
        Ok(())
    }
}
