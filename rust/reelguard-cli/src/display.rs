//! Terminal output and prompts.

use anyhow::Result;
use chrono::{Local, TimeZone};
use reelguard_core::{GuardStatus, MonitoredTarget};
use std::io::{self, Write};

// =============================================================================
// Interactive Prompts
// =============================================================================

/// Ask for confirmation with a default value
pub fn ask_confirmation(prompt: &str, default: bool) -> Result<bool> {
    let suffix = if default { "[Y/n]" } else { "[y/N]" };
    print!("{} {} ", prompt, suffix);
    io::stdout().flush()?;

    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    Ok(parse_confirmation(&input, default))
}

fn parse_confirmation(input: &str, default: bool) -> bool {
    let input = input.trim().to_lowercase();
    if input.is_empty() {
        default
    } else {
        input.starts_with('y')
    }
}

// =============================================================================
// Formatting
// =============================================================================

/// Human form of a `blocked_until` value relative to `now_ms`.
pub fn format_block(blocked_until: i64, now_ms: i64) -> String {
    if blocked_until <= now_ms {
        return "not blocked".to_string();
    }
    let until = Local
        .timestamp_millis_opt(blocked_until)
        .single()
        .map(|t| t.format("%H:%M").to_string())
        .unwrap_or_else(|| blocked_until.to_string());
    format!(
        "blocked until {} ({} left)",
        until,
        format_remaining(blocked_until - now_ms)
    )
}

pub fn format_remaining(ms: i64) -> String {
    let total_secs = ms.max(0) / 1000;
    let (hours, mins, secs) = (total_secs / 3600, (total_secs % 3600) / 60, total_secs % 60);
    if hours > 0 {
        format!("{hours}h {mins:02}m")
    } else if mins > 0 {
        format!("{mins}m {secs:02}s")
    } else {
        format!("{secs}s")
    }
}

pub fn show_status(status: &GuardStatus, now_ms: i64) {
    println!("=== reelguard Status ===");
    println!();
    println!(
        "Engine: {}",
        if status.running { "running" } else { "stopped" }
    );
    println!("Identifier version: {}", status.identifiers_version);
    println!();

    for target in MonitoredTarget::ALL {
        let t = status.targets.get(target);
        println!("{target}:");
        println!("  Guard: {}", if t.enabled { "enabled" } else { "disabled" });
        println!("  State: {}", format_block(t.blocked_until, now_ms));
        println!("  Interventions today: {}", t.interventions_today);
    }
}
