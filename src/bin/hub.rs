//! The hub binary: accepts agent and operator connections and dispatches
//! proxy commands between them (§4.5, §4.9).

use std::sync::Arc;

use clap::Parser;
use signet::crypto::{CryptoError, TrustRoot, ED25519_PUBLIC_KEY_SIZE};
use signet::hub::{server, Hub};
use signet::transport;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "signet-hub", version, about = "Signed command-and-control hub")]
struct Args {
    /// Address to listen on for agent and operator connections.
    #[arg(short, long, default_value = "0.0.0.0:4433")]
    listen: String,

    /// Comma-separated hex-encoded Ed25519 public keys trusted as operators
    /// (§4.3 "operator trust root").
    #[arg(short, long)]
    operator_keys: Option<String>,
}

fn parse_trust_root(raw: &str) -> Result<TrustRoot, CryptoError> {
    let mut pinned = Vec::new();
    for entry in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let bytes = hex::decode(entry).map_err(|_| CryptoError::InvalidPublicKey)?;
        let key: [u8; ED25519_PUBLIC_KEY_SIZE] =
            bytes.try_into().map_err(|_| CryptoError::InvalidPublicKey)?;
        pinned.push(key);
    }
    Ok(TrustRoot::new(pinned))
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("signet=info".parse().unwrap()),
        )
        .init();

    let args = Args::parse();

    let operator_trust = match args.operator_keys.as_deref() {
        Some(raw) => match parse_trust_root(raw) {
            Ok(trust) => trust,
            Err(err) => {
                error!("invalid --operator-keys: {err}");
                return;
            }
        },
        None => {
            info!("no --operator-keys given: no operator will be able to issue signed commands");
            TrustRoot::default()
        }
    };

    let listener = match transport::listen(args.listen.as_str()).await {
        Ok(listener) => listener,
        Err(err) => {
            error!("failed to bind {}: {err}", args.listen);
            return;
        }
    };

    info!("hub listening on {}", args.listen);
    let hub = Arc::new(Hub::new(operator_trust));
    if let Err(err) = server::serve(hub, listener).await {
        error!("server loop exited: {err}");
    }
}
