mod command;
mod event;
mod ui;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::io::BufReader;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt};

use tether_engine::auth::TokenTable;
use tether_engine::engine::{Engine, EngineCmd, EngineConfig};
use tether_engine::store::MemoryStore;
use tether_engine::tcp::TcpListenerFactory;

use crate::command::{handle_sessions_cmd, handle_transfer_cmd};
use crate::event::spawn_event_printer;
use crate::ui::{print_banner, print_help, print_prompt, read_line};

/// Tether: session relay and secure rendezvous server.
///
/// Brokers remote-control sessions between a host and a client: routes
/// signaling over framed TCP channels and relays file transfers through
/// short-lived TCP rendezvous ports.  An operator prompt lets you inspect
/// sessions and transfers while the server runs.
#[derive(Parser, Debug)]
#[command(name = "tether", version, about)]
struct Args {
    /// Address the signaling listener binds on.
    #[arg(short, long, default_value = "0.0.0.0:7400")]
    listen: String,

    /// JSON file mapping bearer tokens to user ids.
    #[arg(short, long)]
    tokens: PathBuf,

    /// Interface the per-transfer rendezvous listeners bind on.
    #[arg(long, default_value = "0.0.0.0")]
    rendezvous_host: String,

    /// Minutes of inactivity after which a session ends.
    #[arg(long, default_value_t = 30)]
    inactivity_minutes: u64,

    /// Seconds each rendezvous waits for a side to connect.
    #[arg(long, default_value_t = 60)]
    rendezvous_timeout: u64,

    /// Seconds a new connection has to send its first frame.
    #[arg(long, default_value_t = 10)]
    handshake_timeout: u64,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Tracing goes to stderr so it doesn't mix with the operator prompt
    // on stdout.
    fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                EnvFilter::new("tether_cli=info,tether_engine=info,warn")
            }),
        )
        .init();

    let auth = match TokenTable::from_json_file(&args.tokens) {
        Ok(table) => table,
        Err(e) => {
            eprintln!("Failed to load tokens: {e:#}");
            std::process::exit(1);
        }
    };
    if auth.is_empty() {
        eprintln!("Token file {} defines no users", args.tokens.display());
        std::process::exit(1);
    }

    let config = EngineConfig {
        rendezvous_host: args.rendezvous_host.clone(),
        inactivity_timeout: Duration::from_secs(args.inactivity_minutes * 60),
        rendezvous_timeout: Duration::from_secs(args.rendezvous_timeout),
        handshake_timeout: Duration::from_secs(args.handshake_timeout),
        ..EngineConfig::default()
    };
    info!(config = ?config, "Starting engine");

    let engine = Engine;
    let handle = engine.start(
        TcpListenerFactory,
        Arc::new(MemoryStore::new()),
        Arc::new(auth),
        config,
    );

    spawn_event_printer(handle.events_tx.subscribe());

    let cmd_tx = handle.cmd_tx.clone();

    if let Err(e) = cmd_tx
        .send(EngineCmd::StartAccepting {
            addr: args.listen.clone(),
        })
        .await
    {
        eprintln!("Failed to start listener: {e}");
        std::process::exit(1);
    }

    // Small delay so the "Listening on ..." event prints before
    // the banner.
    tokio::time::sleep(Duration::from_millis(100)).await;

    // ── Banner ──────────────────────────────────────────────────
    print_banner(&args.listen, &args.rendezvous_host, &args.tokens);
    print_help();
    print_prompt();

    // ── Operator prompt loop ────────────────────────────────────
    let mut stdin = BufReader::new(tokio::io::stdin());

    while let Some(line) = read_line(&mut stdin).await {
        if line.is_empty() {
            print_prompt();
            continue;
        }

        let parts: Vec<&str> = line.split_whitespace().collect();

        match parts[0] {
            "sessions" => handle_sessions_cmd(&parts, &handle.router),
            "transfer" => handle_transfer_cmd(&parts, &handle.router),
            "help" | "?" => print_help(),
            "quit" | "exit" | "q" => break,
            other => {
                println!("  ❓ Unknown command: \"{other}\".  Type 'help' for usage.");
            }
        }

        print_prompt();
    }

    println!("\n  Shutting down...");
    let _ = cmd_tx.send(EngineCmd::ShutDown).await;
    // Give channels a moment to close.
    tokio::time::sleep(Duration::from_millis(200)).await;
    println!("  Bye! 👋");
}
