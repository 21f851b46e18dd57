mod net;

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};

use net::{ClientConfig, Hello, HelloClient};
use polynet::{BinaryCodec, Codec, ConnOption, Connection, JsonCodec, MsgDispatcher, TransportKind};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CodecKind {
    Json,
    Binary,
}

#[derive(Parser)]
#[command(name = "client")]
#[command(about = "Sends a hello over a polynet connection and waits for the echo")]
struct Args {
    #[arg(long, default_value = polynet::DEFAULT_HOST)]
    host: String,

    #[arg(
        short,
        long,
        help = "Server port [default: 10086, or 10087 for ws to match the server's ws port]"
    )]
    port: Option<u16>,

    #[arg(short, long, default_value = "tcp", help = "tcp, ws or rudp")]
    transport: TransportKind,

    #[arg(short, long, value_enum, default_value_t = CodecKind::Json)]
    codec: CodecKind,

    #[arg(long, default_value_t = 5, help = "Handshake timeout in seconds")]
    connect_timeout: u64,

    #[arg(long, default_value_t = 30, help = "Idle timeout in seconds, 0 to disable")]
    timeout: u64,

    #[arg(short, long, default_value = "polynet")]
    name: String,

    #[arg(long, default_value_t = 1)]
    user_id: u64,

    #[arg(long, default_value_t = 1, help = "Number of hellos to send")]
    count: u32,
}

/// The server listens for WebSocket one port above TCP and reliable UDP.
fn default_port(transport: TransportKind) -> u16 {
    match transport {
        TransportKind::WebSocket => polynet::DEFAULT_PORT + 1,
        TransportKind::Tcp | TransportKind::Rudp => polynet::DEFAULT_PORT,
    }
}

fn build_codec(kind: CodecKind) -> anyhow::Result<Arc<dyn Codec>> {
    let codec: Arc<dyn Codec> = match kind {
        CodecKind::Json => Arc::new(JsonCodec::new().with::<Hello>()?),
        CodecKind::Binary => Arc::new(BinaryCodec::new().with::<Hello>()?),
    };
    Ok(codec)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    let option = ConnOption {
        host: args.host,
        port: args.port.unwrap_or_else(|| default_port(args.transport)),
        codec: build_codec(args.codec)?,
        connect_timeout: Duration::from_secs(args.connect_timeout),
        timeout: Duration::from_secs(args.timeout),
        ..Default::default()
    };
    let config = ClientConfig {
        name: args.name,
        user_id: args.user_id,
        hellos: args.count,
        ..Default::default()
    };

    let dispatcher = Arc::new(MsgDispatcher::new());
    dispatcher.set_diagnostic_hook(|diagnostic| log::warn!("Dispatch: {:?}", diagnostic));

    let conn = Connection::new(args.transport, option);
    let client = HelloClient::new(conn, config, dispatcher);
    let replies = client.run().await?;

    if replies < args.count {
        anyhow::bail!("received {} of {} replies", replies, args.count);
    }
    log::info!("Received {} replies", replies);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_port_follows_transport() {
        assert_eq!(default_port(TransportKind::Tcp), polynet::DEFAULT_PORT);
        assert_eq!(default_port(TransportKind::Rudp), polynet::DEFAULT_PORT);
        assert_eq!(default_port(TransportKind::WebSocket), polynet::DEFAULT_PORT + 1);
    }

    #[test]
    fn test_explicit_port_wins() {
        let args = Args::parse_from(["client", "--transport", "ws", "--port", "9000"]);
        assert_eq!(args.port, Some(9000));

        let args = Args::parse_from(["client", "--transport", "ws"]);
        assert_eq!(args.port.unwrap_or_else(|| default_port(args.transport)), 10087);
    }
}
