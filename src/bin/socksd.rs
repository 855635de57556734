use clap::Parser;
use socksd::server::{ServerConfig, Socks5Server};
use std::time::Duration;

#[derive(Parser, Debug)]
struct Args {
    #[arg(short, default_value_t = 1080)]
    port: u16,

    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Drop inbound connections beyond this many live sessions.
    #[arg(long)]
    max_connections: Option<usize>,

    /// Abort DNS resolution after this many milliseconds.
    #[arg(long)]
    resolve_timeout_ms: Option<u64>,

    /// Abort the outbound connect after this many milliseconds.
    #[arg(long)]
    connect_timeout_ms: Option<u64>,
}

#[tokio::main]
async fn main() -> socksd::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut config = ServerConfig {
        listen_addr: format!("{}:{}", args.host, args.port),
        ..ServerConfig::default()
    };
    if let Some(max) = args.max_connections {
        config.max_connections = max;
    }
    config.relay.resolve_timeout = args.resolve_timeout_ms.map(Duration::from_millis);
    config.relay.connect_timeout = args.connect_timeout_ms.map(Duration::from_millis);

    // No policy hook registered: every request is accepted and relayed.
    let handle = Socks5Server::new(config).listen().await?;
    handle.join().await;
    Ok(())
}
