//! Pull command handler.

use chrono_humanize::HumanTime;

use super::context::ProjectContext;
use crate::cli::{FilesScope, PullArgs};
use crate::error::{Result, StaxError};
use crate::provider::Environment;
use crate::pull::{Coordinator, FileScope, PullReport, PullRequest, StageStatus};
use crate::transport::{HostKeyStatus, TransferOptions};

/// Build the pull request from flags layered over the project config.
pub fn build_request(ctx: &ProjectContext, args: &PullArgs) -> Result<PullRequest> {
    let environment: Environment = args.environment.parse()?;
    let project = &ctx.project;
    let install = project.install_for(environment).ok_or_else(|| {
        StaxError::config(format!(
            "project '{}' has no install mapped to {}",
            project.id, environment
        ))
    })?;

    let mut request = PullRequest::new(&project.id, environment, install, &project.local_url);
    request.table_prefix = project.table_prefix();
    request.target_database = ctx.target_database()?;
    request.snapshot = args.snapshot;
    request.skip_replace = args.skip_replace;
    request.skip_hooks = args.skip_hooks;
    request.skip_logs = args.skip_logs;
    request.skip_transients = args.skip_transients;
    request.skip_spam = args.skip_spam;
    request.sanitize = args.sanitize;
    request.dry_run = args.dry_run;
    request.from_url = args.from.clone();
    request.exclude_uploads = args.exclude_uploads;
    request.exclude_tables = project.skip_tables();
    request.exclude_tables.extend(args.exclude_tables.iter().cloned());

    match args.files {
        FilesScope::All => request.file_scope = FileScope::All,
        FilesScope::Themes => request.file_scope = FileScope::ThemesOnly,
        FilesScope::Plugins => request.file_scope = FileScope::PluginsOnly,
        FilesScope::None => request.skip_files = true,
    }

    request.transfer = TransferOptions {
        dry_run: args.dry_run,
        delete_extraneous: args.delete_extraneous,
        bandwidth_limit_kibibytes_per_sec: args
            .bandwidth_limit
            .or_else(|| project.bandwidth_limit())
            .unwrap_or(0),
        include_globs: project.transfer_includes(),
        exclude_globs: project.transfer_excludes(),
        verify_after: args.verify,
        workers: ctx.config.workers(),
        ..TransferOptions::default()
    };
    request.local_content_dir = project.content_dir();
    request.temp_dir = ctx.config.temp_dir();
    request.ssh_gateway = project.ssh_gateway();
    request.ssh_key_name = project.ssh_key_name();
    Ok(request)
}

/// Handle the pull command. Returns the process exit code.
pub async fn handle_pull(ctx: &ProjectContext, args: &PullArgs) -> Result<i32> {
    let request = build_request(ctx, args)?;
    if request.transfer.delete_extraneous && !request.skip_files {
        eprintln!("Local files missing on the remote will be deleted.");
    }
    println!(
        "Pulling {} ({}) into {}{}",
        request.install,
        request.environment,
        request.local_url,
        if request.dry_run { " [dry run]" } else { "" }
    );

    let coordinator = Coordinator::new(ctx.collaborators()?, ctx.warnings.clone());
    let report = coordinator.pull(request, ctx.cancel.clone()).await;
    print_report(&report);
    Ok(report.exit_code())
}

fn print_report(report: &PullReport) {
    println!();
    for record in &report.stages {
        match &record.status {
            StageStatus::Completed => {
                println!("  ✓ {:<24} {:>6.1}s", record.stage, record.duration.as_secs_f64())
            }
            StageStatus::Skipped(reason) => println!("  - {:<24} skipped: {}", record.stage, reason),
            StageStatus::Failed(cause) => println!("  ✗ {:<24} {}", record.stage, cause),
        }
    }
    println!();

    if let Some(source) = &report.credential_source {
        println!("Credentials: {}", source);
    }
    if let Some(HostKeyStatus::Pinned { fingerprint }) = &report.host_key {
        println!("Pinned new host key {}", fingerprint);
    }
    if let Some(snapshot) = &report.snapshot {
        println!(
            "Snapshot: {} ({})",
            snapshot.file_name,
            HumanTime::from(snapshot.created_at)
        );
    }
    if let Some(bytes) = report.export_bytes {
        println!("Export: {} bytes", bytes);
    }
    if let Some(import) = &report.import {
        println!(
            "Import: {} tables in {:.1}s",
            import.tables,
            import.duration.as_secs_f64()
        );
    }
    if let Some(files) = &report.files {
        println!(
            "Files: {} transferred ({} bytes), {} unchanged, {} deleted",
            files.files, files.bytes, files.unchanged, files.deleted
        );
    }
    if let Some(verify) = &report.verify {
        println!("Verify: {} files, {} bytes on both sides", verify.files, verify.bytes);
    }
    if let Some(rewrite) = &report.rewrite {
        println!(
            "Rewrite: {} replacements in {} rows across {} tables{}",
            rewrite.replacements(),
            rewrite.rows_changed(),
            rewrite.tables.len(),
            if rewrite.dry_run { " (not written)" } else { "" }
        );
        for pair in &report.pairs {
            println!("  {} -> {}", pair.from, pair.to);
        }
        for (table, cause) in &rewrite.failed {
            println!("  failed {}: {}", table, cause);
        }
    }
    if let Some(users) = report.sanitized_users {
        println!("Sanitized {} users", users);
    }

    if !report.warnings.is_empty() {
        eprintln!("\n{} warning(s):", report.warnings.len());
        for w in &report.warnings {
            eprintln!("  [{}] {}", w.source, w.message);
        }
    }
    if let Some(e) = &report.error {
        eprintln!("\nPull failed: {}", e);
    } else if report.dry_run {
        println!("Dry run complete. Nothing was changed.");
    } else {
        println!("Pull complete.");
    }
}
