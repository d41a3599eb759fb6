use colored::Colorize;

use crate::features::sync::{ItemStatus, QueueItem, QueueStats};

const RULE_WIDTH: usize = 72;
const ERROR_WIDTH: usize = 60;

/// Format queue counts as a short status block
pub fn format_stats_pretty(stats: &QueueStats) -> String {
    let mut lines = Vec::new();

    lines.push("Sync Queue Status".bold().to_string());
    lines.push("─".repeat(40));

    lines.push(format!(
        "  Pending:    {} {}",
        stats.pending,
        if stats.pending > 0 {
            "mutations waiting".dimmed()
        } else {
            "".dimmed()
        }
    ));
    lines.push(format!(
        "  Completed:  {} {}",
        stats.completed,
        "retained".dimmed()
    ));
    lines.push(format!(
        "  Failed:     {} {}",
        stats.failed,
        if stats.failed > 0 {
            "mutations need attention".red()
        } else {
            "".normal()
        }
    ));

    if stats.failed > 0 {
        lines.push(String::new());
        lines.push(
            "Run 'studysync sync retry --all' to requeue failed mutations"
                .dimmed()
                .to_string(),
        );
    }

    lines.join("\n")
}

/// Format queue items as a table
pub fn format_items_pretty(items: &[QueueItem], status: ItemStatus) -> String {
    if items.is_empty() {
        return format!("No {status} mutations in queue.");
    }

    let mut lines = Vec::new();

    lines.push(format!(
        "{} Mutations ({})",
        status.to_string().to_uppercase(),
        items.len()
    ));
    lines.push("─".repeat(RULE_WIDTH));
    lines.push(format!(
        "{:<6} {:<24} {:<18} {:<8} {}",
        "ID", "Action", "Created", "Tries", "Target"
    ));
    lines.push("─".repeat(RULE_WIDTH));

    for item in items {
        let created = item.created_at.format("%Y-%m-%d %H:%M").to_string();
        let action = if item.prerequisite {
            format!("{}*", item.action_type())
        } else {
            item.action_type().to_string()
        };
        let marker = match item.status {
            ItemStatus::Pending => "·".normal(),
            ItemStatus::Syncing => "▶".cyan(),
            ItemStatus::Completed => "✓".green(),
            ItemStatus::Failed => "✗".red(),
        };

        lines.push(format!(
            "{:<6} {:<24} {:<18} {:<8} {} {}",
            item.id,
            action,
            created,
            item.attempts,
            marker,
            item.mutation.target().dimmed()
        ));

        if let Some(error) = &item.last_error {
            lines.push(format!(
                "       {} {}",
                format!("[{:?}]", error.kind).to_lowercase().yellow(),
                shorten(&error.message, ERROR_WIDTH).red()
            ));
        }
    }

    lines.join("\n")
}

fn shorten(text: &str, width: usize) -> String {
    if text.chars().count() > width {
        let cut: String = text.chars().take(width - 3).collect();
        format!("{cut}...")
    } else {
        text.to_string()
    }
}
