mod config;
mod events;
mod server;

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use config::ServerConfig;
use polynet::RudpEndpoint;
use server::EchoServer;

#[derive(Parser)]
#[command(name = "polynet-server")]
#[command(about = "Echo peer for polynet clients over TCP, WebSocket and reliable UDP")]
struct Args {
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: String,

    #[arg(short, long, default_value_t = polynet::DEFAULT_PORT, help = "TCP and reliable-UDP port")]
    port: u16,

    #[arg(long, help = "WebSocket port [default: port + 1]")]
    ws_port: Option<u16>,

    #[arg(short, long, default_value_t = 256)]
    max_peers: usize,

    #[arg(long, default_value_t = 60, help = "Drop peers silent for this many seconds")]
    peer_timeout: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let ws_port = args.ws_port.unwrap_or(args.port.wrapping_add(1));
    let config = ServerConfig {
        max_peers: args.max_peers,
        peer_timeout: Duration::from_secs(args.peer_timeout.max(1)),
        ..Default::default()
    };

    let tcp = TcpListener::bind((args.bind.as_str(), args.port))
        .await
        .with_context(|| format!("binding TCP {}:{}", args.bind, args.port))?;
    let ws = TcpListener::bind((args.bind.as_str(), ws_port))
        .await
        .with_context(|| format!("binding WebSocket {}:{}", args.bind, ws_port))?;
    let rudp = RudpEndpoint::bind((args.bind.as_str(), args.port), config.rudp.clone())
        .await
        .with_context(|| format!("binding UDP {}:{}", args.bind, args.port))?;

    let (events_tx, mut events) = mpsc::unbounded_channel();
    let server = EchoServer::new(config, events_tx);

    let mut tasks = tokio::task::JoinSet::new();
    tasks.spawn(server.clone().serve_tcp(tcp));
    tasks.spawn(server.clone().serve_ws(ws));
    tasks.spawn(server.serve_rudp(rudp));

    loop {
        tokio::select! {
            Some(event) = events.recv() => event.log(),
            Some(finished) = tasks.join_next() => {
                finished.context("listener task panicked")??;
            }
            _ = tokio::signal::ctrl_c() => {
                log::info!("Server shutting down");
                break;
            }
        }
    }

    tasks.shutdown().await;
    Ok(())
}
