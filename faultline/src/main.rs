#![allow(clippy::print_stdout)]

#[macro_use]
extern crate tracing;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use faultline::api::{self, AppState};
use faultline::collection::ProxyCollection;
use faultline::config::{self, ServerConfig};
use faultline::task::{ChildTask, ShutdownHandle};
use tap::prelude::*;

enum CliAction {
    Run(ServerConfig),
    ShowVersion,
    ShowHelp,
}

fn parse_args() -> anyhow::Result<CliAction> {
    let mut args = std::env::args().skip(1);
    let mut config = ServerConfig::default();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--host" => config.host = args.next().context("missing value for --host")?,
            "--port" => {
                config.port = args
                    .next()
                    .context("missing value for --port")?
                    .parse()
                    .context("invalid --port")?;
            }
            "--config" => {
                config.config_file = Some(PathBuf::from(args.next().context("missing value for --config")?));
            }
            "--seed" => {
                config.seed = args
                    .next()
                    .context("missing value for --seed")?
                    .parse()
                    .context("invalid --seed")?;
            }
            "--version" => return Ok(CliAction::ShowVersion),
            "--help" | "-h" => return Ok(CliAction::ShowHelp),
            unknown => anyhow::bail!("unknown argument: {unknown}"),
        }
    }

    Ok(CliAction::Run(config))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = match parse_args()? {
        CliAction::ShowVersion => {
            println!("faultline-server version {}", faultline::VERSION);
            return Ok(());
        }
        CliAction::ShowHelp => {
            print_help();
            return Ok(());
        }
        CliAction::Run(config) => config,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!(version = faultline::VERSION, seed = config.seed, "starting faultline");

    let proxies = Arc::new(ProxyCollection::new(config.seed));

    if let Some(path) = &config.config_file {
        let entries = config::load_populate_file(path)
            .tap_err(|error| error!(config = %path.display(), %error, "couldn't load populate file"))?;
        let applied = proxies
            .populate(entries)
            .await
            .context("populating proxies from file")?;
        info!(proxies = applied.len(), "populated proxies from file");
    }

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("couldn't bind admin API on {addr}"))?;
    info!(%addr, "admin API listening");

    let (shutdown_handle, shutdown_signal) = ShutdownHandle::new();
    let state = AppState {
        proxies: Arc::clone(&proxies),
    };
    let server = ChildTask::spawn(api::serve(listener, state, shutdown_signal));

    build_signals_fut().await?;
    info!("shutdown started");

    shutdown_handle.signal();
    proxies.clear().await;
    let _ = server.join().await;

    Ok(())
}

fn print_help() {
    println!(
        r#"faultline — programmable TCP fault-injection proxy

USAGE:
    faultline [OPTIONS]

OPTIONS:
    --host <HOST>      Host for the admin API to listen on (default: 127.0.0.1)
    --port <PORT>      Port for the admin API to listen on (default: 8474)
    --config <FILE>    JSON file containing proxies to create on startup
    --seed <SEED>      Seed for randomizing toxics with (default: wall-clock nanoseconds)
    --version          Print the version
"#
    )
}

#[cfg(unix)]
async fn build_signals_fut() -> anyhow::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate_signal = signal(SignalKind::terminate()).context("failed to create terminate signal stream")?;
    let mut quit_signal = signal(SignalKind::quit()).context("failed to create quit signal stream")?;
    let mut interrupt_signal = signal(SignalKind::interrupt()).context("failed to create interrupt signal stream")?;

    futures::future::select_all(vec![
        Box::pin(terminate_signal.recv()),
        Box::pin(quit_signal.recv()),
        Box::pin(interrupt_signal.recv()),
    ])
    .await;

    Ok(())
}

#[cfg(not(unix))]
async fn build_signals_fut() -> anyhow::Result<()> {
    tokio::signal::ctrl_c().await.context("CTRL_C signal failed")
}
