//! crowdlink-relay: WebSocket relay for shared interactive sessions.
//!
//! Accepts WebSocket connections speaking the channel protocol, fans
//! broadcasts out to topic subscribers, and keeps presence bookkeeping.
//! Broadcast payloads are never inspected — the relay routes, it holds
//! no game state.

mod connection;
mod topics;

use clap::Parser;
use tokio::net::TcpListener;
use tokio_tungstenite::accept_async;

use crate::connection::handle_connection;
use crate::topics::TopicStore;

#[derive(Parser)]
#[command(name = "crowdlink-relay", about = "Broadcast/presence relay for crowdlink sessions")]
struct Args {
    /// Port to listen on.
    #[arg(short, long, default_value_t = 4000)]
    port: u16,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "crowdlink_relay=info".into()),
        )
        .init();

    let args = Args::parse();
    let store = TopicStore::new();

    let addr = format!("0.0.0.0:{}", args.port);
    let listener = TcpListener::bind(&addr)
        .await
        .expect("Failed to bind TCP listener");

    tracing::info!("crowdlink-relay listening on {}", addr);

    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let store = store.clone();
                tokio::spawn(async move {
                    match accept_async(stream).await {
                        Ok(ws) => handle_connection(ws, addr, store).await,
                        Err(e) => {
                            tracing::warn!(peer = %addr, error = %e, "WS handshake failed");
                        }
                    }
                });
            }
            Err(e) => {
                tracing::warn!(error = %e, "TCP accept error");
            }
        }
    }
}
