//! The agent binary: connects to a hub, reports its facts, and polls for
//! proxy commands (§4.5 "Agent fetch path", §4.9).

use clap::Parser;
use signet::message::Message;
use signet::session::Session;
use signet::transport;
use signet::SystemFacts;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "signet-agent", version, about = "Signet agent")]
struct Args {
    /// Hub address to connect to.
    #[arg(short = 'H', long, default_value = "127.0.0.1:4433")]
    hub: String,

    /// How often to poll the hub for new commands, in milliseconds.
    #[arg(short, long, default_value = "2000")]
    poll_interval_ms: u64,
}

/// Collects the facts the hub reserves for predicate linking (§6). Real
/// system-fact collection is out of scope (§1) — this covers only what the
/// standard library can report portably.
fn collect_facts() -> SystemFacts {
    let num_cpu = std::thread::available_parallelism()
        .map(|n| n.get() as i64)
        .unwrap_or(1);
    SystemFacts {
        num_cpu,
        cpuid_cpu: num_cpu,
        goos: std::env::consts::OS.to_string(),
        arch: std::env::consts::ARCH.to_string(),
        hostname: std::env::var("HOSTNAME").unwrap_or_default(),
        username: std::env::var("USER").unwrap_or_default(),
        home_dir: std::env::var("HOME").unwrap_or_default(),
        exec_path: std::env::current_exe()
            .map(|p| p.display().to_string())
            .unwrap_or_default(),
        features: 0,
    }
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

    let stream = match transport::connect(args.hub.as_str()).await {
        Ok(stream) => stream,
        Err(err) => {
            error!("failed to connect to hub {}: {err}", args.hub);
            return;
        }
    };
    let mut session = Session::new(stream);

    let facts = collect_facts();
    session
        .write_message(&Message::Handshake { facts })
        .await
        .expect("handshake write failed");
    let agent_id = match session.read_message().await {
        Ok(Message::HandshakeReply { id }) => id,
        Ok(other) => {
            error!("unexpected handshake reply {other:?}");
            return;
        }
        Err(err) => {
            error!("handshake failed: {err}");
            return;
        }
    };
    info!("handshake complete, agent id = {agent_id:#018x}");

    let mut last_to = 0i64;
    let mut ticker = tokio::time::interval(Duration::from_millis(args.poll_interval_ms));
    loop {
        ticker.tick().await;
        let now = signet::time::now_millis();
        if let Err(err) = session
            .write_message(&Message::FetchProxyRequest {
                from: last_to,
                to: now,
            })
            .await
        {
            warn!("fetch request failed: {err}, reconnecting is not implemented, exiting");
            return;
        }
        last_to = now;

        loop {
            match session.read_message().await {
                Ok(Message::ProxyPayload(packet)) => {
                    info!("received command payload ({} bytes)", packet.payload.len());
                }
                Ok(Message::FetchProxyReply) => break,
                Ok(other) => {
                    warn!("unexpected message while fetching: {other:?}");
                    break;
                }
                Err(err) => {
                    error!("session error: {err}");
                    return;
                }
            }
        }
    }
}
