//! Snapshot command handlers.

use chrono_humanize::HumanTime;

use super::context::ProjectContext;
use crate::cli::SnapshotCommands;
use crate::error::Result;
use crate::process::Budget;
use crate::snapshot::{RetentionPolicy, SnapshotKind};

pub fn handle_snapshot(ctx: &ProjectContext, command: &SnapshotCommands) -> Result<i32> {
    let store = ctx.snapshots()?;
    let project_id = ctx.project.id.as_str();
    let budget = Budget::new(ctx.cancel.clone(), None, "snapshot");

    match command {
        SnapshotCommands::Create { description } => {
            let snapshot = store.create(
                project_id,
                SnapshotKind::Manual,
                description.as_deref(),
                &budget,
            )?;
            println!(
                "Created {} ({} bytes)",
                snapshot.absolute_path.display(),
                snapshot.size_bytes
            );
        }
        SnapshotCommands::List => {
            let snapshots = store.list(project_id)?;
            if snapshots.is_empty() {
                println!("No snapshots for '{}'. Use 'stax snapshot create' first.", project_id);
            }
            for s in snapshots {
                println!(
                    "{:<48} {:<6} {:>12}  {}{}",
                    s.file_name,
                    s.kind.as_str(),
                    s.size_bytes,
                    HumanTime::from(s.created_at),
                    s.description
                        .as_deref()
                        .map(|d| format!("  {}", d))
                        .unwrap_or_default()
                );
            }
        }
        SnapshotCommands::Restore { name } => {
            let stats = store.restore(name, &budget)?;
            println!(
                "Restored {} ({} tables in {:.1}s)",
                name,
                stats.tables,
                stats.duration.as_secs_f64()
            );
        }
        SnapshotCommands::Delete { name } => {
            if store.delete(name)? {
                println!("Deleted {}", name);
            }
        }
        SnapshotCommands::Prune {
            auto_days,
            manual_days,
        } => {
            let configured = ctx.project.retention();
            let retention = RetentionPolicy {
                auto_days: auto_days.unwrap_or(configured.auto_days),
                manual_days: manual_days.unwrap_or(configured.manual_days),
            };
            let report = store.prune(project_id, retention)?;
            for name in &report.deleted {
                println!("Deleted {}", name);
            }
            for (name, cause) in &report.failed {
                eprintln!("Could not delete {}: {}", name, cause);
            }
            println!("{} deleted, {} kept", report.deleted.len(), report.kept);
        }
    }

    Ok(exit_code(ctx))
}

/// 2 when the operation left warnings behind, 0 otherwise.
pub(crate) fn exit_code(ctx: &ProjectContext) -> i32 {
    let warnings = ctx.warnings.snapshot();
    for w in &warnings {
        eprintln!("warning: [{}] {}", w.source, w.message);
    }
    if warnings.is_empty() { 0 } else { 2 }
}
