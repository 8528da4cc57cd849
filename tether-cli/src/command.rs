use tether_engine::router::Router;

use crate::ui::format_size;

/// Handles the `sessions <user>` command.
pub fn handle_sessions_cmd(parts: &[&str], router: &Router) {
    let Some(user_id) = parts.get(1) else {
        println!("  Usage: sessions <user_id>");
        return;
    };

    let sessions = match router.registry().active_sessions(user_id) {
        Ok(sessions) => sessions,
        Err(e) => {
            println!("  ❌ {e}");
            return;
        }
    };
    if sessions.is_empty() {
        println!("  ℹ {user_id} has no active session.");
        return;
    }

    for s in sessions {
        let client = s.client_user_id.as_deref().unwrap_or("-");
        let bound = |id: Option<u64>| id.map_or_else(|| "offline".to_string(), |c| format!("#{c}"));
        println!(
            "  {sid}  host {host} ({hc})  client {client} ({cc})  since {at}",
            sid = s.session_id,
            host = s.host_user_id,
            hc = bound(s.host_connection_id),
            cc = bound(s.client_connection_id),
            at = s.created_at.format("%Y-%m-%d %H:%M:%S"),
        );
    }
}

/// Handles the `transfer <id>` command.
pub fn handle_transfer_cmd(parts: &[&str], router: &Router) {
    let Some(transfer_id) = parts.get(1) else {
        println!("  Usage: transfer <transfer_id>");
        return;
    };

    match router.transfers().get(transfer_id) {
        Ok(t) => {
            println!(
                "  {name}  {sent} / {size}  {status:?}",
                name = t.file_name,
                sent = format_size(t.bytes_transferred),
                size = format_size(t.file_size),
                status = t.status,
            );
            println!("  {} → {} in {}", t.sender_user_id, t.receiver_user_id, t.session_id);
            if let Some(reason) = t.error_message {
                println!("  reason: {reason}");
            }
        }
        Err(e) => println!("  ❌ {e}"),
    }
}
