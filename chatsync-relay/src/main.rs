//! `chatsync-relay`: the push relay chatsync clients hold their realtime socket to.

use std::time::Duration;

use chatsync_relay::{AppState, serve};
use clap::Parser;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "chatsync-relay", about = "Presence and push relay for chatsync clients")]
struct RelayArgs {
    #[arg(long, env = "CHATSYNC_RELAY_BIND", default_value = "0.0.0.0:8080")]
    bind_address: String,
    /// Seconds between keepalive pings on idle sockets.
    #[arg(
        long,
        env = "CHATSYNC_RELAY_KEEPALIVE_SECS",
        default_value_t = 30,
        value_parser = clap::value_parser!(u64).range(1..=3600)
    )]
    keepalive_secs: u64,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = RelayArgs::parse();
    let listener = match tokio::net::TcpListener::bind(&args.bind_address).await {
        Ok(listener) => listener,
        Err(err) => {
            error!("failed to bind {}: {}", args.bind_address, err);
            std::process::exit(1);
        }
    };

    info!(
        bind = %args.bind_address,
        keepalive_secs = args.keepalive_secs,
        "chatsync relay starting"
    );
    let state = AppState::with_keepalive(Duration::from_secs(args.keepalive_secs));
    if let Err(err) = serve(listener, state).await {
        warn!("relay server exited: {}", err);
    }
}
