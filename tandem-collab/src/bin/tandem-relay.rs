use clap::Parser;

use tandem_collab::relay::{RelayConfig, RelayServer};

/// Presence relay for collaborative editing windows.
#[derive(Debug, Parser)]
#[command(name = "tandem-relay", version)]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:9090")]
    bind: String,

    /// Largest whisper forwarded, in bytes
    #[arg(long, default_value_t = tandem_collab::hub::DEFAULT_MAX_MESSAGE_BYTES)]
    max_message_bytes: usize,

    /// Connections allowed per channel
    #[arg(long, default_value_t = 100)]
    max_members: usize,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let args = Args::parse();
    let server = RelayServer::new(RelayConfig {
        bind_addr: args.bind,
        max_message_bytes: args.max_message_bytes,
        max_members_per_channel: args.max_members,
    });
    server.run().await
}
