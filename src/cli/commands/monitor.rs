//! Monitor command - one staleness audit over the activity log

use crate::cli::args::{MonitorArgs, OutputFormat};
use crate::config::Config;
use crate::coordination::ActivityLog;
use crate::error::MeshResult;
use crate::monitor::{StalenessMonitor, StalenessReport, StalenessRule};
use crate::ui;
use chrono::{Duration, Utc};
use console::style;

/// Execute the monitor command
pub async fn execute(args: MonitorArgs, config: &Config) -> MeshResult<()> {
    let stamp = args.stamp.unwrap_or_else(|| config.node.stamp.clone());
    let mut rule = StalenessRule::from_config(&config.monitor);
    if let Some(minutes) = args.period_minutes {
        rule.activity_period = Duration::minutes(minutes as i64);
    }

    let log = ActivityLog::new(config.activity_log_dir());
    let report = StalenessMonitor::new(rule).run(&log, &stamp, Utc::now()).await?;

    match args.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Table => print_table(&report),
    }
    Ok(())
}

fn print_table(report: &StalenessReport) {
    ui::section(&format!("Checkpoint staleness for stamp {}", report.stamp));
    ui::key_value("window start", &report.window_start.to_rfc3339());
    ui::key_value("window end", &report.window_end.to_rfc3339());

    if report.statuses.is_empty() {
        ui::step_info("No activity in window");
        return;
    }

    println!();
    println!(
        "{:<40} {:<22} {:<22} {:>8}",
        style("MACHINE").bold(),
        style("LAST ACTIVITY").bold(),
        style("LAST RESTORE").bold(),
        style("AGE").bold()
    );
    println!("{}", "-".repeat(95));

    for status in &report.statuses {
        let restored = status
            .last_restore_time
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "-".to_string());
        let age = status
            .age()
            .map(|a| format!("{}m", a.num_minutes()))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<40} {:<22} {:<22} {:>8}",
            status.machine,
            status.last_activity_time.format("%Y-%m-%d %H:%M:%S"),
            restored,
            age
        );
    }

    println!();
    if report.alerts.is_empty() {
        ui::step_ok("No staleness alerts");
        return;
    }
    for alert in &report.alerts {
        println!("  [{}] {}", ui::severity_label(alert.severity), alert.message);
    }
}
