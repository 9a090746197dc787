//! The operator binary: a line-oriented REPL standing in for "the
//! operator's graphical interface" (§4.9), which is explicitly out of
//! scope — only the predicate compiler and `ProxyRequest` construction it
//! drives are in scope (§1).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use signet::crypto::Keypair;
use signet::frame::Packet;
use signet::message::Message;
use signet::session::Session;
use signet::transport;
use signet::vm::compile;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "signet-operator", version, about = "Signet operator console")]
struct Args {
    /// Hub address to connect to.
    #[arg(short = 'H', long, default_value = "127.0.0.1:4433")]
    hub: String,

    /// Path to a 32-byte raw Ed25519 secret key (see signet-keygen).
    #[arg(short, long)]
    secret_key: String,

    /// Background client-list refresh tick, in milliseconds (§5 "configurable
    /// tick, default 1 second").
    #[arg(short, long, default_value = "1000")]
    refresh_interval_ms: u64,
}

async fn refresh_loop(session: Arc<Mutex<Session<TcpStream>>>, keypair: Arc<Keypair>, paused: Arc<AtomicBool>, interval_ms: u64) {
    let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
    loop {
        ticker.tick().await;
        if paused.load(Ordering::Relaxed) {
            continue;
        }
        let mut session = session.lock().await;
        let reply = session
            .signed_request(&keypair, |stoken| Message::Clients { stoken })
            .await;
        match reply {
            Ok(Message::ClientsReply { ids }) => info!("background refresh: {} client(s)", ids.len()),
            Ok(other) => warn!("background refresh got unexpected reply {other:?}"),
            Err(err) => warn!("background refresh failed: {err}"),
        }
    }
}

async fn handle_command(
    line: &str,
    session: &Arc<Mutex<Session<TcpStream>>>,
    keypair: &Keypair,
    paused: &AtomicBool,
) -> bool {
    let mut parts = line.split_whitespace();
    match parts.next() {
        Some("quit") | Some("exit") => return false,
        Some("pause") => {
            paused.store(true, Ordering::Relaxed);
            println!("background refresh paused");
        }
        Some("resume") => {
            paused.store(false, Ordering::Relaxed);
            println!("background refresh resumed");
        }
        Some("clients") => {
            let mut session = session.lock().await;
            match session.signed_request(keypair, |stoken| Message::Clients { stoken }).await {
                Ok(Message::ClientsReply { ids }) => {
                    println!("{} client(s):", ids.len());
                    for id in ids {
                        println!("  {id:#018x}");
                    }
                }
                Ok(other) => println!("unexpected reply: {other:?}"),
                Err(err) => println!("error: {err}"),
            }
        }
        Some("query") => {
            let Some(id_str) = parts.next() else {
                println!("usage: query <agent-id-hex>");
                return true;
            };
            let Ok(id) = u64::from_str_radix(id_str.trim_start_matches("0x"), 16) else {
                println!("bad agent id: {id_str}");
                return true;
            };
            let mut session = session.lock().await;
            match session.signed_request(keypair, |stoken| Message::ClientQuery { id, stoken }).await {
                Ok(Message::ClientQueryReply { found, info }) => {
                    if found {
                        println!("{info:#?}");
                    } else {
                        println!("no agent with id {id:#018x}");
                    }
                }
                Ok(other) => println!("unexpected reply: {other:?}"),
                Err(err) => println!("error: {err}"),
            }
        }
        Some("issue") => {
            let args: Vec<&str> = parts.collect();
            if args.len() < 4 {
                println!("usage: issue <predicate-file> <max-targets> <ttl-secs> <payload-text>");
                return true;
            }
            let (predicate_path, max_targets, ttl_secs) = (args[0], args[1], args[2]);
            let payload_text = args[3..].join(" ");

            let source = match std::fs::read_to_string(predicate_path) {
                Ok(source) => source,
                Err(err) => {
                    println!("could not read {predicate_path}: {err}");
                    return true;
                }
            };
            let program = match compile(&source) {
                Ok(program) => program,
                Err(err) => {
                    println!("predicate compile error: {err}");
                    return true;
                }
            };
            let Ok(max_targets) = max_targets.parse::<i32>() else {
                println!("bad max-targets: {max_targets}");
                return true;
            };
            let Ok(ttl_secs) = ttl_secs.parse::<i64>() else {
                println!("bad ttl-secs: {ttl_secs}");
                return true;
            };

            let issued_on = signet::time::now_millis();
            let expires_on = issued_on + ttl_secs * 1000;
            let payload = Packet::unsigned(payload_text.into_bytes());

            let mut session = session.lock().await;
            let reply = session
                .signed_request(keypair, |stoken| Message::ProxyRequest {
                    max_targets,
                    program,
                    issued_on,
                    expires_on,
                    payload,
                    stoken,
                })
                .await;
            match reply {
                Ok(Message::ProxyReply { relayed_to }) => {
                    println!("relayed to {} agent(s):", relayed_to.len());
                    for id in relayed_to {
                        println!("  {id:#018x}");
                    }
                }
                Ok(other) => println!("unexpected reply: {other:?}"),
                Err(err) => println!("error: {err}"),
            }
        }
        Some(other) => println!("unknown command: {other} (try clients, query, issue, pause, resume, quit)"),
        None => {}
    }
    true
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

    let secret_bytes = match std::fs::read(&args.secret_key) {
        Ok(bytes) => bytes,
        Err(err) => {
            error!("failed to read secret key {}: {err}", args.secret_key);
            return;
        }
    };
    let secret: [u8; 32] = match secret_bytes.try_into() {
        Ok(bytes) => bytes,
        Err(_) => {
            error!("secret key file must be exactly 32 bytes");
            return;
        }
    };
    let keypair = Arc::new(Keypair::from_secret_bytes(secret));

    let stream = match transport::connect(args.hub.as_str()).await {
        Ok(stream) => stream,
        Err(err) => {
            error!("failed to connect to hub {}: {err}", args.hub);
            return;
        }
    };
    let session = Arc::new(Mutex::new(Session::new(stream)));
    let paused = Arc::new(AtomicBool::new(false));

    tokio::spawn(refresh_loop(
        session.clone(),
        keypair.clone(),
        paused.clone(),
        args.refresh_interval_ms,
    ));

    println!("signet operator console (commands: clients, query <id>, issue <file> <max> <ttl-secs> <payload>, pause, resume, quit)");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        use std::io::Write;
        let _ = std::io::stdout().flush();
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(err) => {
                error!("stdin read error: {err}");
                break;
            }
        };
        if !handle_command(&line, &session, &keypair, &paused).await {
            break;
        }
    }
}
