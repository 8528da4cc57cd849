use tokio::sync::broadcast;

use tether_engine::engine::EngineEvent;
use tether_engine::store::TransferStatus;

use crate::ui::{format_size, print_prompt};

/// Spawns a task that listens for engine events and prints them.
pub fn spawn_event_printer(mut events_rx: broadcast::Receiver<EngineEvent>) {
    tokio::spawn(async move {
        loop {
            match events_rx.recv().await {
                Ok(event) => {
                    print_event(&event);
                    print_prompt();
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    println!("\n  ⚠ Missed {n} events");
                    print_prompt();
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

fn print_event(event: &EngineEvent) {
    match event {
        EngineEvent::Accepting { addr } => println!("\n  ✔ Listening on {addr}"),
        EngineEvent::AcceptingStopped => println!("\n  ⏹ Stopped accepting connections"),
        EngineEvent::ChannelOpened {
            connection_id,
            session_id,
            user_id,
            role,
            peer,
        } => println!(
            "\n  📡 #{connection_id} {user_id} joined {session_id} as {role:?} from {peer}"
        ),
        EngineEvent::ChannelClosed {
            connection_id,
            session_id,
        } => println!("\n  👋 #{connection_id} left {session_id}"),
        EngineEvent::TransferFinished {
            session_id,
            transfer_id,
            status,
            bytes,
        } => match status {
            TransferStatus::Completed => println!(
                "\n  🎉 Transfer {transfer_id} in {session_id} complete ({})",
                format_size(*bytes)
            ),
            other => println!(
                "\n  ❌ Transfer {transfer_id} in {session_id} ended {other:?} after {}",
                format_size(*bytes)
            ),
        },
        EngineEvent::Error { message } => println!("\n  ❌ Engine error: {message}"),
    }
}
