use std::io::Write;
use std::path::Path;

/// Formats a byte count into a human-readable string (B, KiB, MiB, GiB).
#[allow(clippy::cast_precision_loss)]
pub fn format_size(bytes: u64) -> String {
    const KIB: u64 = 1024;
    const MIB: u64 = 1024 * KIB;
    const GIB: u64 = 1024 * MIB;

    if bytes >= GIB {
        format!("{:.2} GiB", bytes as f64 / GIB as f64)
    } else if bytes >= MIB {
        format!("{:.2} MiB", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.2} KiB", bytes as f64 / KIB as f64)
    } else {
        format!("{bytes} B")
    }
}

/// Prints the prompt marker (`> `) and flushes stdout.
pub fn print_prompt() {
    print!("\n> ");
    let _ = std::io::stdout().flush();
}

/// Prints the startup banner with the listen and rendezvous settings.
pub fn print_banner(listen_addr: &str, rendezvous_host: &str, tokens: &Path) {
    println!();
    println!("╔══════════════════════════════════════════════════════╗");
    println!("║                🔗  Tether  relay  🔗                 ║");
    println!("╠══════════════════════════════════════════════════════╣");
    println!("║  Listen  : {listen_addr:<41} ║");
    println!("║  Relay on: {rendezvous_host:<41} ║");
    println!("║  Tokens  : {:<41} ║", tokens.display().to_string());
    println!("╚══════════════════════════════════════════════════════╝");
    println!();
}

/// Prints available commands.
pub fn print_help() {
    println!();
    println!("  Commands:");
    println!("    sessions <user>         List the user's active sessions");
    println!("    transfer <id>           Show one file transfer");
    println!("    help                    Show this help");
    println!("    quit                    Shut down and exit");
}

/// Reads one trimmed line from the given buffered stdin reader.
/// Returns `None` on EOF or read error.
pub async fn read_line(reader: &mut tokio::io::BufReader<tokio::io::Stdin>) -> Option<String> {
    use tokio::io::AsyncBufReadExt;

    let mut line = String::new();
    match reader.read_line(&mut line).await {
        Ok(0) | Err(_) => None,
        Ok(_) => Some(line.trim().to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn when_formatting_sizes_expect_binary_units() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(2048), "2.00 KiB");
        assert_eq!(format_size(1_000_000), "976.56 KiB");
        assert_eq!(format_size(3 * 1024 * 1024 * 1024), "3.00 GiB");
    }
}
