//! Ordered toxic chains for one proxy and the fan-out of chain mutations to
//! every live connection.
//!
//! The collection holds only the configured toxic lists; each connection has
//! its own pipeline instance, so back-pressure never couples connections and
//! a mutation only synchronizes the pipelines it actually touches. All
//! mutations serialize on one lock, which also orders them for observers.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::error::Error;
use crate::link::ToxicLink;
use crate::stream::{ChunkReceiver, ChunkSender, LinkFlags};
use crate::toxic::{StreamDirection, Toxic, ToxicPatch};

pub struct ToxicCollection {
    seed: u64,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    chains: [Vec<Arc<Toxic>>; 2],
    links: HashMap<(u64, StreamDirection), ToxicLink>,
}

impl Inner {
    fn locate(&self, name: &str) -> Option<(StreamDirection, usize)> {
        for direction in [StreamDirection::Upstream, StreamDirection::Downstream] {
            if let Some(position) = self.chains[direction.index()].iter().position(|t| t.name == name) {
                return Some((direction, position));
            }
        }
        None
    }
}

impl ToxicCollection {
    pub(crate) fn new(seed: u64) -> Self {
        Self {
            seed,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Appends a toxic to its direction's chain and splices it into every
    /// live pipeline of that direction.
    pub async fn add(&self, toxic: Toxic) -> Result<Toxic, Error> {
        let mut inner = self.inner.lock().await;
        if inner.locate(&toxic.name).is_some() {
            return Err(Error::ToxicAlreadyExists);
        }

        let direction = toxic.stream;
        let toxic = Arc::new(toxic);
        inner.chains[direction.index()].push(Arc::clone(&toxic));

        let Inner { links, .. } = &mut *inner;
        for ((_, link_direction), link) in links.iter_mut() {
            if *link_direction == direction {
                link.add_toxic(Arc::clone(&toxic)).await;
            }
        }

        debug!(name = %toxic.name, kind = toxic.kind.type_name(), %direction, "toxic added");
        Ok((*toxic).clone())
    }

    pub async fn get(&self, name: &str) -> Result<Toxic, Error> {
        let inner = self.inner.lock().await;
        let (direction, position) = inner.locate(name).ok_or(Error::ToxicNotFound)?;
        Ok((*inner.chains[direction.index()][position]).clone())
    }

    /// Replaces a toxic's parameters in place. Live stages are restarted with
    /// the new parameters but keep their links and per-connection state.
    pub async fn update(&self, name: &str, patch: ToxicPatch) -> Result<Toxic, Error> {
        let mut inner = self.inner.lock().await;
        let (direction, position) = inner.locate(name).ok_or(Error::ToxicNotFound)?;

        let updated = Arc::new(inner.chains[direction.index()][position].apply_patch(patch)?);
        inner.chains[direction.index()][position] = Arc::clone(&updated);

        let Inner { links, .. } = &mut *inner;
        for ((_, link_direction), link) in links.iter_mut() {
            if *link_direction == direction {
                link.update_toxic(position, Arc::clone(&updated)).await;
            }
        }

        debug!(name = %updated.name, %direction, "toxic updated");
        Ok((*updated).clone())
    }

    /// Unlinks a toxic from its chain and from every live pipeline.
    pub async fn remove(&self, name: &str) -> Result<(), Error> {
        let mut inner = self.inner.lock().await;
        let (direction, position) = inner.locate(name).ok_or(Error::ToxicNotFound)?;
        inner.chains[direction.index()].remove(position);

        let Inner { links, .. } = &mut *inner;
        for ((_, link_direction), link) in links.iter_mut() {
            if *link_direction == direction {
                link.remove_toxic(position).await;
            }
        }

        debug!(name, %direction, "toxic removed");
        Ok(())
    }

    /// Snapshot of all configured toxics, upstream chain first.
    pub async fn list(&self) -> Vec<Toxic> {
        let inner = self.inner.lock().await;
        inner
            .chains
            .iter()
            .flatten()
            .map(|toxic| (**toxic).clone())
            .collect()
    }

    /// Removes every toxic, restoring the default pass-through chains.
    pub async fn reset(&self) {
        let mut inner = self.inner.lock().await;
        for direction in [StreamDirection::Upstream, StreamDirection::Downstream] {
            while let Some(_removed) = inner.chains[direction.index()].pop() {
                let position = inner.chains[direction.index()].len();
                let Inner { links, .. } = &mut *inner;
                for ((_, link_direction), link) in links.iter_mut() {
                    if *link_direction == direction {
                        link.remove_toxic(position).await;
                    }
                }
            }
        }
    }

    /// Builds the pipeline instance for one direction of a new connection.
    pub(crate) async fn start_link(
        &self,
        conn_id: u64,
        direction: StreamDirection,
        flags: Arc<LinkFlags>,
    ) -> (ChunkSender, ChunkReceiver) {
        let mut inner = self.inner.lock().await;
        let toxics = inner.chains[direction.index()].clone();
        let (tx, rx, link) = ToxicLink::start(&toxics, direction, conn_id, self.seed, flags);
        inner.links.insert((conn_id, direction), link);
        (tx, rx)
    }

    /// Drops both pipeline instances of a finished connection, aborting any
    /// stage task still running.
    pub(crate) async fn remove_link(&self, conn_id: u64) {
        let mut inner = self.inner.lock().await;
        inner.links.remove(&(conn_id, StreamDirection::Upstream));
        inner.links.remove(&(conn_id, StreamDirection::Downstream));
    }

    /// Tears down every pipeline instance at once. Used by proxy stop.
    pub(crate) async fn stop(&self) {
        self.inner.lock().await.links.clear();
    }
}
