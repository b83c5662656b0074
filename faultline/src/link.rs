//! Per-connection instances of a toxic chain: one pipeline of stage tasks
//! per direction, spliced in place when the chain configuration changes.
//!
//! Every stage runs as its own task and owns its stub. Interrupting a stage
//! hands the stub back through the task's join handle; the link then swaps
//! channel ends around and respawns the stage. Chunks already past the splice
//! point are delivered under the old topology, chunks at or after it under
//! the new one, and nothing is dropped, duplicated or reordered.

use std::sync::Arc;

use rand::SeedableRng as _;
use rand::rngs::StdRng;
use tokio::sync::mpsc;
use tokio::time::{Duration, timeout};

use crate::stream::{ChunkReceiver, ChunkSender, LinkFlags, StageExit, ToxicStub, link_channel};
use crate::task::ChildTask;
use crate::toxic::{StreamDirection, Toxic};

/// How long an interrupted stage may take to yield before the connection is
/// forcefully dropped.
const INTERRUPT_DEADLINE: Duration = Duration::from_secs(1);

struct Stage {
    toxic: Arc<Toxic>,
    interrupt_tx: mpsc::Sender<()>,
    handle: Option<ChildTask<(ToxicStub, StageExit)>>,
}

pub(crate) struct ToxicLink {
    direction: StreamDirection,
    conn_id: u64,
    seed: u64,
    stage_ordinal: u64,
    flags: Arc<LinkFlags>,
    stages: Vec<Stage>,
}

impl ToxicLink {
    /// Builds the pipeline for one direction of one connection: a head
    /// sentinel, the configured toxics in order, and a tail sentinel.
    /// Returns the socket-facing endpoints: the sender the reader pump feeds
    /// and the receiver the writer pump drains.
    pub(crate) fn start(
        toxics: &[Arc<Toxic>],
        direction: StreamDirection,
        conn_id: u64,
        seed: u64,
        flags: Arc<LinkFlags>,
    ) -> (ChunkSender, ChunkReceiver, Self) {
        let mut chain = Vec::with_capacity(toxics.len() + 2);
        chain.push(Arc::new(Toxic::sentinel(direction)));
        chain.extend(toxics.iter().map(Arc::clone));
        chain.push(Arc::new(Toxic::sentinel(direction)));

        let mut link = ToxicLink {
            direction,
            conn_id,
            seed,
            stage_ordinal: 0,
            flags,
            stages: Vec::with_capacity(chain.len()),
        };

        let (input_tx, mut next_input) = link_channel(chain[0].kind.chunk_buffer());
        for (index, toxic) in chain.iter().enumerate() {
            let output_capacity = chain
                .get(index + 1)
                .map(|next| next.kind.chunk_buffer())
                .unwrap_or(1);
            let (output_tx, output_rx) = link_channel(output_capacity);
            let stage = link.make_stage(Arc::clone(toxic), next_input, output_tx);
            link.stages.push(stage);
            next_input = output_rx;
        }

        trace!(direction = %direction, conn_id, toxics = toxics.len(), "pipeline started");

        (input_tx, next_input, link)
    }

    /// Splices a new toxic in front of the tail sentinel.
    pub(crate) async fn add_toxic(&mut self, toxic: Arc<Toxic>) {
        let pred = self.stages.len() - 2;
        let Some(mut pred_stub) = self.interrupt_stage(pred).await else {
            // The pipeline is winding down; the dying connection keeps the
            // old topology.
            return;
        };
        let Some(tail_input) = pred_stub.output_sender() else {
            self.respawn(pred, pred_stub);
            return;
        };

        let (new_tx, new_rx) = link_channel(toxic.kind.chunk_buffer());
        pred_stub.set_output(new_tx);

        let stage = self.make_stage(toxic, new_rx, tail_input);
        self.stages.insert(pred + 1, stage);
        self.respawn(pred, pred_stub);
    }

    /// Unlinks the toxic at chain `position` (0 = first configured toxic),
    /// fusing its neighbors and forwarding anything it had buffered.
    pub(crate) async fn remove_toxic(&mut self, position: usize) {
        let index = position + 1; // head sentinel offset
        let pred = index - 1;

        let Some(mut pred_stub) = self.interrupt_stage(pred).await else {
            return;
        };
        let Some(mut removed_stub) = self.interrupt_stage(index).await else {
            self.respawn(pred, pred_stub);
            return;
        };

        // Chunks queued for the removed stage skip its transform from now on.
        let fused_output = removed_stub.output_sender();
        match timeout(INTERRUPT_DEADLINE, removed_stub.drain_queued()).await {
            Ok(_) => {}
            Err(_elapsed) => {
                warn!(direction = %self.direction, conn_id = self.conn_id, "stalled pipeline while unlinking, dropping connection");
                self.flags.kill.notify_one();
                return;
            }
        }
        if let Some(output) = fused_output {
            pred_stub.set_output(output);
        }

        self.stages.remove(index);
        self.respawn(pred, pred_stub);
    }

    /// Swaps in a new parameter struct for the toxic at chain `position`.
    /// The stage keeps its links and per-connection state.
    pub(crate) async fn update_toxic(&mut self, position: usize, toxic: Arc<Toxic>) {
        let index = position + 1;
        self.stages[index].toxic = toxic;
        if let Some(stub) = self.interrupt_stage(index).await {
            self.respawn(index, stub);
        }
    }

    /// Interrupts the stage at `index` and hands back its stub, or `None`
    /// when the stage already ran to completion.
    async fn interrupt_stage(&mut self, index: usize) -> Option<ToxicStub> {
        let Some(handle) = self.stages[index].handle.take() else {
            return None;
        };
        let _ = self.stages[index].interrupt_tx.try_send(());

        match timeout(INTERRUPT_DEADLINE, handle.join()).await {
            Ok(Ok((stub, StageExit::Interrupted))) => Some(stub),
            Ok(Ok((_stub, _exit))) => None,
            Ok(Err(join_error)) => {
                warn!(%join_error, "pipeline stage task failed");
                None
            }
            Err(_elapsed) => {
                warn!(
                    direction = %self.direction,
                    conn_id = self.conn_id,
                    "stage did not yield within the interrupt deadline, dropping connection"
                );
                self.flags.kill.notify_one();
                None
            }
        }
    }

    fn make_stage(&mut self, toxic: Arc<Toxic>, input: ChunkReceiver, output: ChunkSender) -> Stage {
        let (interrupt_tx, interrupt_rx) = mpsc::channel(1);
        let rng = StdRng::seed_from_u64(self.next_stage_seed());
        let stub = ToxicStub::new(
            input,
            output,
            interrupt_rx,
            rng,
            toxic.kind.initial_state(),
            Arc::clone(&self.flags),
        );
        let handle = spawn_pipe(Arc::clone(&toxic), stub);
        Stage {
            toxic,
            interrupt_tx,
            handle: Some(handle),
        }
    }

    fn respawn(&mut self, index: usize, stub: ToxicStub) {
        let stage = &mut self.stages[index];
        stage.handle = Some(spawn_pipe(Arc::clone(&stage.toxic), stub));
    }

    fn next_stage_seed(&mut self) -> u64 {
        let ordinal = self.stage_ordinal;
        self.stage_ordinal += 1;
        self.seed
            ^ self.conn_id.wrapping_mul(0x9E37_79B9_7F4A_7C15)
            ^ (ordinal << 2)
            ^ self.direction.index() as u64
    }
}

fn spawn_pipe(toxic: Arc<Toxic>, mut stub: ToxicStub) -> ChildTask<(ToxicStub, StageExit)> {
    ChildTask::spawn(async move {
        let exit = toxic.kind.pipe(&mut stub, toxic.toxicity).await;
        (stub, exit)
    })
}
