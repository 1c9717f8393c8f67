use clap::ValueEnum;
use serde::Deserialize;

use crate::{
    record::{RunReport, Verdict},
    task::TaskStatus,
};

const OUTPUT_TAIL_LINES: usize = 20;

#[derive(ValueEnum, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    /// Stream task output live.
    Stream,
    /// Print each task's output as a single block after it completes.
    Group,
}

/// Prints a captured block of task output under a header.
pub fn print_group(task_id: &str, output: &str) {
    if output.trim().is_empty() {
        return;
    }
    println!("── {} ──", task_id);
    print!("{}", output);
    if !output.ends_with('\n') {
        println!();
    }
}

pub fn print_summary(report: &RunReport) {
    println!();
    println!("Summary:");

    for record in &report.records {
        let took = humantime::format_duration(std::time::Duration::from_millis(
            record.duration().as_millis() as u64,
        ));
        match record.status() {
            TaskStatus::Failed(reason) => {
                println!("  ✗ {:<24} failed after {}: {}", record.task(), took, reason);
                let lines: Vec<&str> = record.output().lines().collect();
                let tail = &lines[lines.len().saturating_sub(OUTPUT_TAIL_LINES)..];
                for line in tail {
                    println!("      │ {}", line);
                }
            }
            TaskStatus::Skipped(reason) => {
                println!("  - {:<24} skipped: {}", record.task(), reason);
            }
            TaskStatus::Succeeded => {
                println!("  ✓ {:<24} succeeded in {}", record.task(), took);
            }
            other => println!("  ? {:<24} {}", record.task(), other),
        }
    }

    let verdict = match report.verdict() {
        Verdict::Succeeded | Verdict::Skipped => "ok",
        Verdict::Failed => "FAILED",
    };
    let failed = report.failed();
    let skipped = report.skipped();

    if report.cancelled {
        println!("Run cancelled: {} failed, {} skipped", failed.len(), skipped.len());
    } else if failed.is_empty() {
        println!(
            "Run {}: {} tasks, {} already satisfied",
            verdict,
            report.records.len(),
            skipped.len()
        );
    } else {
        println!(
            "Run {}: failed [{}], skipped [{}]",
            verdict,
            failed.join(", "),
            skipped.join(", ")
        );
    }
}
