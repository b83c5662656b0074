//! Shared helpers for faultline integration tests: payload generation and
//! verification, plus throwaway upstream servers to proxy against.

use std::net::SocketAddr;

use anyhow::Context as _;
use proptest::collection::size_range;
use proptest::prelude::*;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// For sane Debug display
#[derive(PartialEq, Eq, PartialOrd, Ord)]
pub struct Payload(pub Vec<u8>);

impl core::fmt::Debug for Payload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x")?;
        for v in self.0.iter().take(15) {
            write!(f, "{:X?}", v)?;
        }
        write!(f, ".. ({} bytes)", self.0.len())
    }
}

const PAYLOAD_MINIMUM_SIZE: usize = 64;
const PAYLOAD_MAXIMUM_SIZE: usize = 192 * 1024; // a few read-buffer lengths, enough to cross chunk boundaries

prop_compose! {
    pub fn payload()(data in any_with::<Vec<u8>>(size_range(PAYLOAD_MINIMUM_SIZE..PAYLOAD_MAXIMUM_SIZE).lift())) -> Payload {
        Payload(data)
    }
}

/// Deterministic payload for tests that don’t need proptest.
pub fn patterned_payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// An upstream that echoes every byte back on the same connection.
///
/// Serves connections until the returned handle is dropped or aborted.
pub async fn spawn_echo_server() -> anyhow::Result<(SocketAddr, JoinHandle<()>)> {
    let listener = TcpListener::bind("127.0.0.1:0").await.context("bind echo server")?;
    let addr = listener.local_addr().context("echo server local addr")?;

    let handle = tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
                let _ = writer.shutdown().await;
            });
        }
    });

    Ok((addr, handle))
}

/// An upstream that writes a fixed payload to every connection, half-closes
/// its write side, then drains the read side until the peer closes.
pub async fn spawn_oneshot_server(payload: Vec<u8>) -> anyhow::Result<(SocketAddr, JoinHandle<()>)> {
    let listener = TcpListener::bind("127.0.0.1:0").await.context("bind oneshot server")?;
    let addr = listener.local_addr().context("oneshot server local addr")?;

    let handle = tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            let payload = payload.clone();
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.split();
                let _ = writer.write_all(&payload).await;
                let _ = writer.shutdown().await;
                let mut sink = [0u8; 4096];
                while matches!(reader.read(&mut sink).await, Ok(n) if n > 0) {}
            });
        }
    });

    Ok((addr, handle))
}

pub async fn connect(addr: &str) -> anyhow::Result<TcpStream> {
    TcpStream::connect(addr).await.with_context(|| format!("connect to {addr}"))
}

pub async fn write_payload<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> anyhow::Result<()> {
    let mut cursor = 0;
    while cursor < payload.len() {
        let to = core::cmp::min(payload.len(), cursor + 9999);
        writer
            .write_all(&payload[cursor..to])
            .await
            .context("write_all operation")?;
        cursor = to;
    }
    writer.flush().await.context("flush operation")?;

    Ok(())
}

pub async fn read_assert_payload<R: AsyncRead + Unpin>(reader: &mut R, expected_payload: &[u8]) -> anyhow::Result<()> {
    let mut buf = [0; 5120];
    let mut current_idx = 0;
    loop {
        if current_idx == expected_payload.len() {
            break;
        }

        let n = reader.read(&mut buf).await.context("read operation")?;
        if n == 0 {
            anyhow::bail!(
                "Read {current_idx} bytes, but expected exactly {} bytes",
                expected_payload.len()
            );
        }

        let from = current_idx;
        let to = current_idx + n;

        if to > expected_payload.len() {
            anyhow::bail!("Received too many bytes");
        }

        if expected_payload[from..to] != buf[..n] {
            anyhow::bail!("Received bytes didn't match expected payload ({from}..{to})");
        }

        current_idx += n;
    }

    Ok(())
}

/// Read until EOF and return everything received.
pub async fn read_to_eof<R: AsyncRead + Unpin>(reader: &mut R) -> anyhow::Result<Vec<u8>> {
    let mut data = Vec::new();
    reader.read_to_end(&mut data).await.context("read_to_end operation")?;
    Ok(data)
}
