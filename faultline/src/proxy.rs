//! A single programmable proxy: listener lifecycle, accept loop, and the
//! per-connection bidirectional pipelines.

use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs as _};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};
use tokio::net::{TcpListener, TcpSocket, TcpStream};

use crate::chain::ToxicCollection;
use crate::error::Error;
use crate::stream::{Chunk, ChunkReceiver, ChunkSender, LinkFlags, READ_BUFFER_SIZE};
use crate::task::{ChildTask, ShutdownHandle, ShutdownSignal, Task, spawn_task};
use crate::toxic::StreamDirection;

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub name: String,
    pub listen: String,
    pub upstream: String,
    pub enabled: bool,
}

#[derive(Debug, Clone)]
struct Details {
    listen: String,
    upstream: String,
    enabled: bool,
}

struct RunHandles {
    shutdown: ShutdownHandle,
    acceptor: ChildTask<anyhow::Result<()>>,
}

pub struct Proxy {
    name: String,
    details: Mutex<Details>,
    toxics: Arc<ToxicCollection>,
    connections: Arc<Connections>,
    run: Mutex<Option<RunHandles>>,
}

impl std::fmt::Debug for Proxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proxy")
            .field("name", &self.name)
            .field("details", &self.details)
            .finish_non_exhaustive()
    }
}

impl Proxy {
    pub fn new(name: String, listen: String, upstream: String, seed: u64) -> Self {
        Self {
            name,
            details: Mutex::new(Details {
                listen,
                upstream,
                enabled: false,
            }),
            toxics: Arc::new(ToxicCollection::new(seed)),
            connections: Arc::new(Connections::default()),
            run: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The configured listen address; once the proxy is started this is the
    /// concretely bound address, so `:0` configurations become readable.
    pub fn listen_addr(&self) -> String {
        self.details.lock().listen.clone()
    }

    pub fn upstream_addr(&self) -> String {
        self.details.lock().upstream.clone()
    }

    pub fn is_enabled(&self) -> bool {
        self.details.lock().enabled
    }

    pub fn toxics(&self) -> &ToxicCollection {
        &self.toxics
    }

    /// Binds the listener and spawns the accept loop. On a bind failure the
    /// proxy stays disabled and the error is returned to the caller.
    pub fn start(&self) -> Result<(), Error> {
        let mut run = self.run.lock();
        if run.is_some() {
            return Err(Error::ProxyAlreadyStarted);
        }

        let mut details = self.details.lock();
        let listener = bind_listener(&details.listen)?;
        let bound = listener.local_addr().map_err(|source| Error::Bind {
            addr: details.listen.clone(),
            source,
        })?;
        details.listen = bound.to_string();
        details.enabled = true;

        let (shutdown_handle, shutdown_signal) = ShutdownHandle::new();
        let acceptor = AcceptTask {
            proxy_name: self.name.clone(),
            listener,
            upstream: details.upstream.clone(),
            toxics: Arc::clone(&self.toxics),
            connections: Arc::clone(&self.connections),
        };
        *run = Some(RunHandles {
            shutdown: shutdown_handle,
            acceptor: spawn_task(acceptor, shutdown_signal),
        });

        info!(proxy = %self.name, listen = %bound, "proxy started");
        Ok(())
    }

    /// Closes the listener, waits for the accept loop, and tears down every
    /// live connection. Idempotent.
    pub async fn stop(&self) {
        let run = self.run.lock().take();
        let Some(run) = run else {
            self.details.lock().enabled = false;
            return;
        };

        run.shutdown.signal();
        let _ = run.acceptor.join().await;

        let handles: Vec<ConnectionHandle> = {
            let mut live = self.connections.live.lock();
            live.drain().map(|(_, handle)| handle).collect()
        };
        for handle in &handles {
            handle.flags.kill.notify_one();
        }
        drop(handles);

        self.toxics.stop().await;
        self.details.lock().enabled = false;
        info!(proxy = %self.name, "proxy stopped");
    }

    /// Applies a configuration change. A new listen or upstream address
    /// restarts the proxy, closing existing connections; an `enabled` flip
    /// alone starts or stops the listener.
    pub async fn update(
        &self,
        listen: Option<String>,
        upstream: Option<String>,
        enabled: Option<bool>,
    ) -> Result<(), Error> {
        let current = self.details.lock().clone();
        let listen = listen.unwrap_or_else(|| current.listen.clone());
        let upstream = upstream.unwrap_or_else(|| current.upstream.clone());
        let enabled = enabled.unwrap_or(current.enabled);

        if listen != current.listen || upstream != current.upstream {
            self.stop().await;
            {
                let mut details = self.details.lock();
                details.listen = listen;
                details.upstream = upstream;
            }
            if enabled {
                self.start()?;
            }
        } else if enabled != current.enabled {
            if enabled {
                self.start()?;
            } else {
                self.stop().await;
            }
        }

        Ok(())
    }
}

fn bind_listener(listen: &str) -> Result<TcpListener, Error> {
    let bind_error = |source: io::Error| Error::Bind {
        addr: listen.to_owned(),
        source,
    };

    let addr = resolve_addr(listen).map_err(bind_error)?;
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
    .map_err(bind_error)?;
    socket.set_reuseaddr(true).map_err(bind_error)?;
    socket.bind(addr).map_err(bind_error)?;
    socket.listen(64).map_err(bind_error)
}

fn resolve_addr(addr: &str) -> io::Result<SocketAddr> {
    addr.to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "address resolved to nothing"))
}

#[derive(Default)]
pub(crate) struct Connections {
    next_id: AtomicU64,
    live: Mutex<HashMap<u64, ConnectionHandle>>,
}

struct ConnectionHandle {
    flags: Arc<LinkFlags>,
    _task: ChildTask<()>,
}

impl Connections {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn insert(&self, conn_id: u64, handle: ConnectionHandle) {
        self.live.lock().insert(conn_id, handle);
    }

    fn remove(&self, conn_id: u64) {
        self.live.lock().remove(&conn_id);
    }
}

struct AcceptTask {
    proxy_name: String,
    listener: TcpListener,
    upstream: String,
    toxics: Arc<ToxicCollection>,
    connections: Arc<Connections>,
}

#[async_trait]
impl Task for AcceptTask {
    type Output = anyhow::Result<()>;

    const NAME: &'static str = "proxy acceptor";

    async fn run(self, mut shutdown_signal: ShutdownSignal) -> Self::Output {
        tokio::select! {
            result = self.accept_loop() => result,
            _ = shutdown_signal.wait() => Ok(()),
        }
    }
}

impl AcceptTask {
    #[instrument("acceptor", skip_all, fields(proxy = %self.proxy_name))]
    async fn accept_loop(self) -> anyhow::Result<()> {
        loop {
            let (client, peer_addr) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(error) => {
                    error!(%error, "couldn't accept next TCP stream");
                    return Err(error.into());
                }
            };
            debug!(%peer_addr, "accepted connection");

            let conn_id = self.connections.next_id();
            let flags = Arc::new(LinkFlags::default());
            let task = ChildTask::spawn(run_connection(
                conn_id,
                client,
                self.upstream.clone(),
                Arc::clone(&self.toxics),
                Arc::clone(&self.connections),
                Arc::clone(&flags),
            ));
            self.connections.insert(conn_id, ConnectionHandle { flags, _task: task });
        }
    }
}

/// Supervises one connection pair: dials the upstream, builds the two
/// pipeline instances, and runs the four socket pumps until both directions
/// finish or the pair is killed.
#[instrument("connection", skip_all, fields(id = conn_id))]
async fn run_connection(
    conn_id: u64,
    mut client: TcpStream,
    upstream_addr: String,
    toxics: Arc<ToxicCollection>,
    connections: Arc<Connections>,
    flags: Arc<LinkFlags>,
) {
    let mut upstream = match TcpStream::connect(&upstream_addr).await {
        Ok(stream) => stream,
        Err(source) => {
            // Local failure only: drop the inbound socket, keep accepting.
            let error = Error::Dial {
                addr: upstream_addr,
                source,
            };
            warn!(%error, "connection rejected");
            connections.remove(conn_id);
            return;
        }
    };

    let (client_tx, upstream_rx) = toxics
        .start_link(conn_id, StreamDirection::Upstream, Arc::clone(&flags))
        .await;
    let (upstream_tx, client_rx) = toxics
        .start_link(conn_id, StreamDirection::Downstream, Arc::clone(&flags))
        .await;

    {
        let (mut client_read, mut client_write) = client.split();
        let (mut upstream_read, mut upstream_write) = upstream.split();

        let upstream_dir = async {
            tokio::join!(
                pump_into_chain(&mut client_read, client_tx),
                pump_from_chain(upstream_rx, &mut upstream_write),
            );
        };
        let downstream_dir = async {
            tokio::join!(
                pump_into_chain(&mut upstream_read, upstream_tx),
                pump_from_chain(client_rx, &mut client_write),
            );
        };

        tokio::select! {
            _ = flags.kill.notified() => debug!("connection killed"),
            _ = async { tokio::join!(upstream_dir, downstream_dir); } => debug!("connection closed"),
        }
    }

    if flags.reset_peer.load(Ordering::SeqCst) {
        // RST instead of FIN when the sockets drop.
        let _ = client.set_linger(Some(Duration::ZERO));
        let _ = upstream.set_linger(Some(Duration::ZERO));
    }

    toxics.remove_link(conn_id).await;
    connections.remove(conn_id);
}

/// Reads the socket into the head of the chain, stamping chunks on arrival.
async fn pump_into_chain<R: AsyncRead + Unpin>(reader: &mut R, chain: ChunkSender) {
    let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
    loop {
        match reader.read_buf(&mut buf).await {
            // EOF: dropping the sender propagates end-of-stream.
            Ok(0) => return,
            Ok(_) => {
                let chunk = Chunk::new(buf.split().freeze());
                if chain.send(chunk).await.is_err() {
                    // The chain closed early (limit_data, reset_peer, teardown).
                    return;
                }
                buf.reserve(READ_BUFFER_SIZE);
            }
            Err(error) => {
                debug!(%error, "socket read failed");
                return;
            }
        }
    }
}

/// Drains the tail of the chain into the socket and half-closes it on
/// end-of-stream.
async fn pump_from_chain<W: AsyncWrite + Unpin>(mut chain: ChunkReceiver, writer: &mut W) {
    while let Some(chunk) = chain.recv().await {
        if let Err(error) = writer.write_all(&chunk.data).await {
            debug!(%error, "socket write failed");
            return;
        }
    }
    let _ = writer.shutdown().await;
}
