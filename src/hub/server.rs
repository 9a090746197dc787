//! The hub's listening loop and periodic maintenance tasks (§5 "Concurrency
//! & Resource Model").

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::info;

use super::Hub;
use crate::time::now_millis;

/// How often the registry and command log are swept for stale/expired
/// entries (§4.5 "periodic garbage collector (5-second tick)").
const GC_INTERVAL: Duration = Duration::from_secs(5);

/// Accepts connections on `listener` forever, spawning one session worker
/// per accepted socket, while two independent background tasks sweep the
/// registry and command log on a fixed tick (§4.5 "Two hub-wide periodic
/// tasks run on a 5-second cadence: client GC and command GC"). The two GC
/// tasks are kept separate so a panic in one sweep can't silently take the
/// other's expiration down with it (§5 "GC tasks log and continue").
/// Returns only if `accept` itself fails fatally.
pub async fn serve(hub: Arc<Hub>, listener: TcpListener) -> std::io::Result<()> {
    let registry_hub = hub.clone();
    tokio::spawn(async move { registry_gc_loop(registry_hub).await });
    let commands_hub = hub.clone();
    tokio::spawn(async move { commands_gc_loop(commands_hub).await });

    loop {
        let (stream, peer) = listener.accept().await?;
        let hub = hub.clone();
        tokio::spawn(async move {
            super::session_worker::run(&hub, stream, peer.to_string()).await;
        });
    }
}

async fn registry_gc_loop(hub: Arc<Hub>) {
    let mut ticker = tokio::time::interval(GC_INTERVAL);
    loop {
        ticker.tick().await;
        let agents_removed = hub.registry.gc().await;
        if agents_removed > 0 {
            info!(agents_removed, "registry gc tick");
        }
    }
}

async fn commands_gc_loop(hub: Arc<Hub>) {
    let mut ticker = tokio::time::interval(GC_INTERVAL);
    loop {
        ticker.tick().await;
        let commands_removed = hub.commands.gc(now_millis()).await;
        if commands_removed > 0 {
            info!(commands_removed, "command log gc tick");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::TrustRoot;
    use crate::hub::CommandRecord;
    use crate::message::Message;
    use crate::session::Session;

    #[tokio::test]
    async fn serve_accepts_connections_and_runs_session_workers() {
        let hub = Arc::new(Hub::new(TrustRoot::default()));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(serve(hub, listener));

        let stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let mut session = Session::new(stream);
        session.write_message(&Message::Ping { token: 42 }).await.unwrap();
        match session.read_message().await.unwrap() {
            Message::PingReply { token } => assert_eq!(token, 42),
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn registry_gc_loop_sweeps_done_agents() {
        let hub = Arc::new(Hub::default());
        let id = hub.registry.allocate_new("a".into(), Default::default()).await;
        hub.registry.mark_done(id).await;

        let gc_hub = hub.clone();
        let handle = tokio::spawn(async move { registry_gc_loop(gc_hub).await });

        tokio::time::advance(GC_INTERVAL + Duration::from_millis(200)).await;
        tokio::task::yield_now().await;
        assert!(hub.registry.get(id).await.is_none());
        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn commands_gc_loop_runs_independently_of_registry_gc() {
        let hub = Arc::new(Hub::default());
        hub.commands
            .insert(CommandRecord {
                id: 0,
                program: crate::vm::compile("true").unwrap(),
                issued_on: 0,
                expires_on: 1,
                payload: crate::frame::Packet::unsigned(b"x".to_vec()),
                max_targets: 0,
            })
            .await;

        let gc_hub = hub.clone();
        let handle = tokio::spawn(async move { commands_gc_loop(gc_hub).await });

        tokio::time::advance(GC_INTERVAL + Duration::from_millis(200)).await;
        tokio::task::yield_now().await;
        assert_eq!(hub.commands.len().await, 0);
        handle.abort();
    }
}
