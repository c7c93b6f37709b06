//! Terminal output formatting for all tidemark commands.
//! Uses comfy-table for tabular output and colored for
//! state-aware terminal styling.

use colored::Colorize;
use comfy_table::modifiers::UTF8_ROUND_CORNERS;
use comfy_table::presets::UTF8_FULL;
use comfy_table::{Cell, ContentArrangement, Table};

use tidemark_core::history::{ExecType, RanChangeSet};
use tidemark_core::lock::LockRecord;
use tidemark_core::{
    ChangeSetState, MigrateReport, RollbackReport, RunStatus, StatusReport, SyncReport,
    ValidateReport,
};

fn new_table(header: Vec<&str>) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(header.into_iter().map(Cell::new).collect::<Vec<_>>());
    table
}

fn format_state(state: ChangeSetState) -> String {
    let text = state.to_string();
    match state {
        ChangeSetState::Executed => text.green().to_string(),
        ChangeSetState::Reran => text.cyan().to_string(),
        ChangeSetState::MarkedRan => text.blue().to_string(),
        ChangeSetState::SkippedFiltered => text.dimmed().to_string(),
        ChangeSetState::SkippedPrecondition => text.yellow().to_string(),
        ChangeSetState::Failed => text.red().bold().to_string(),
    }
}

fn format_status(status: RunStatus) -> String {
    let text = status.to_string();
    match status {
        RunStatus::NotRan => text.yellow().to_string(),
        RunStatus::Failed => text.red().bold().to_string(),
        RunStatus::RunAlways => text.cyan().to_string(),
        RunStatus::Changed => text.cyan().to_string(),
        RunStatus::Ran => text.green().to_string(),
        RunStatus::Drifted => text.red().to_string(),
    }
}

fn format_exec_type(exec_type: ExecType) -> String {
    let text = exec_type.as_str();
    match exec_type {
        ExecType::Executed => text.green().to_string(),
        ExecType::Reran => text.cyan().to_string(),
        ExecType::MarkRan => text.blue().to_string(),
        ExecType::Skipped => text.dimmed().to_string(),
        ExecType::Failed => text.red().bold().to_string(),
    }
}

/// Print a migrate report summary.
pub fn print_migrate_summary(report: &MigrateReport) {
    if report.checksums_upgraded > 0 {
        println!(
            "{}",
            format!("Updated {} stored checksum(s)", report.checksums_upgraded).dimmed()
        );
    }

    if report.details.is_empty() {
        println!("{}", "Database is up to date. Nothing to run.".green());
        return;
    }

    let mut table = new_table(vec!["Change Set", "Description", "State", "Reason", "Time"]);
    for detail in &report.details {
        table.add_row(vec![
            Cell::new(&detail.change_set),
            Cell::new(&detail.description),
            Cell::new(format_state(detail.state)),
            Cell::new(detail.reason.as_deref().unwrap_or("")),
            Cell::new(format!("{}ms", detail.execution_time_ms)),
        ]);
    }
    println!("{table}");

    let summary = format!(
        "Executed {}, marked ran {}, skipped {}, failed {} (deployment {}, {}ms)",
        report.executed,
        report.marked_ran,
        report.skipped,
        report.failed,
        report.deployment_id,
        report.total_time_ms
    );
    if report.failed > 0 {
        println!("{}", summary.yellow().bold());
    } else {
        println!("{}", summary.green().bold());
    }
}

/// Print a rollback report summary.
pub fn print_rollback_summary(report: &RollbackReport) {
    if report.rolled_back.is_empty() {
        println!(
            "{}",
            format!("Nothing to roll back to {}.", report.target).green()
        );
        return;
    }

    println!(
        "{}",
        format!(
            "Rolled back {} change set(s) to {} ({}ms)",
            report.rolled_back.len(),
            report.target,
            report.total_time_ms
        )
        .green()
        .bold()
    );
    for undone in &report.rolled_back {
        let detail = if undone.statements == 0 {
            format!("{}, row removed", undone.exec_type)
        } else {
            format!("{} statement(s)", undone.statements)
        };
        println!(
            "  {} {} ({}, {}ms)",
            "←".green(),
            undone.change_set,
            detail,
            undone.execution_time_ms
        );
    }
}

/// Print per-change-set status plus unknown ledger rows.
pub fn print_status(report: &StatusReport) {
    if report.change_sets.is_empty() {
        println!("{}", "The changelog has no change sets.".yellow());
    } else {
        let mut table = new_table(vec!["Change Set", "Description", "Status", "Executed", "Note"]);
        for cs in &report.change_sets {
            let executed = cs
                .date_executed
                .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_default();
            table.add_row(vec![
                Cell::new(&cs.change_set),
                Cell::new(&cs.description),
                Cell::new(format_status(cs.status)),
                Cell::new(executed),
                Cell::new(cs.filtered.as_deref().unwrap_or("")),
            ]);
        }
        println!("{table}");
    }

    if report.pending.is_empty() {
        println!("{}", "No pending change sets.".green());
    } else {
        println!(
            "{}",
            format!("{} change set(s) pending", report.pending.len())
                .yellow()
                .bold()
        );
    }

    if !report.unknown.is_empty() {
        println!(
            "{}",
            format!(
                "{} ledger row(s) have no matching change set:",
                report.unknown.len()
            )
            .yellow()
        );
        for row in &report.unknown {
            println!("  {} {}", "?".yellow(), row.identity);
        }
    }
}

/// Print a validate report.
pub fn print_validate_result(report: &ValidateReport) {
    if report.valid {
        println!(
            "{}",
            format!("Validated {} change set(s). No issues found.", report.change_sets)
                .green()
                .bold()
        );
        if report.checksums_to_upgrade > 0 {
            println!(
                "{}",
                format!(
                    "{} stored checksum(s) will be updated on the next migrate.",
                    report.checksums_to_upgrade
                )
                .dimmed()
            );
        }
        return;
    }

    for issue in &report.issues {
        println!("{} {}", "ERROR:".red().bold(), issue);
    }
}

/// Print every ledger row.
pub fn print_history_table(rows: &[RanChangeSet]) {
    if rows.is_empty() {
        println!("{}", "No change sets have been run.".yellow());
        return;
    }

    let mut table = new_table(vec![
        "#",
        "Change Set",
        "Description",
        "Type",
        "Executed",
        "Tag",
        "Deployment",
    ]);
    for row in rows {
        table.add_row(vec![
            Cell::new(row.order_executed),
            Cell::new(row.identity.to_string()),
            Cell::new(&row.description),
            Cell::new(format_exec_type(row.exec_type)),
            Cell::new(row.date_executed.format("%Y-%m-%d %H:%M:%S").to_string()),
            Cell::new(row.tag.as_deref().unwrap_or("")),
            Cell::new(row.deployment_id.as_deref().unwrap_or("")),
        ]);
    }
    println!("{table}");
}

/// Print the changelog lock state.
pub fn print_lock(record: &LockRecord) {
    if !record.locked {
        println!("{}", "The changelog lock is free.".green());
        return;
    }
    println!(
        "{} {} since {}",
        "Locked by".yellow().bold(),
        record.holder.as_deref().unwrap_or("unknown"),
        record.granted_display()
    );
}

/// Print a sync report summary.
pub fn print_sync_summary(report: &SyncReport) {
    if report.marked.is_empty() {
        println!("{}", "Nothing to sync. All change sets are recorded.".green());
        return;
    }
    println!(
        "{}",
        format!(
            "Marked {} change set(s) as run (deployment {})",
            report.marked.len(),
            report.deployment_id
        )
        .green()
        .bold()
    );
    for change_set in &report.marked {
        println!("  {} {}", "✓".green(), change_set);
    }
}
