//! Replace command handler: a standalone URL rewrite of the local database.

use super::context::ProjectContext;
use super::snapshot::exit_code;
use crate::cli::ReplaceArgs;
use crate::error::Result;
use crate::process::Budget;
use crate::rewrite::{ReplacementPair, RewriteMode, UrlRewriter};

pub fn handle_replace(ctx: &ProjectContext, args: &ReplaceArgs) -> Result<i32> {
    let database = ctx.database()?;

    let mut options = ctx.rewrite_options();
    options.mode = match (&args.url, args.network) {
        (Some(site_url), _) => RewriteMode::Scoped {
            site_url: site_url.clone(),
        },
        (None, true) => RewriteMode::Network,
        (None, false) => RewriteMode::SingleSite,
    };
    options.all_tables = args.all_tables;
    options.skip_tables.extend(args.exclude_tables.iter().cloned());
    options.skip_logs = args.skip_logs;
    options.skip_transients = args.skip_transients;
    options.skip_spam = args.skip_spam;
    options.dry_run = args.dry_run;

    let pairs = [ReplacementPair::new(&args.from, &args.to)];
    let budget = Budget::new(ctx.cancel.clone(), None, "rewrite_urls");
    let report = UrlRewriter::new(database.as_ref(), options, ctx.warnings.clone())
        .run(&pairs, &budget)?;

    for table in &report.tables {
        if table.rows_changed == 0 {
            continue;
        }
        let columns: Vec<String> = table
            .columns
            .iter()
            .map(|(column, n)| format!("{}={}", column, n))
            .collect();
        println!("{:<32} {:>6} rows  {}", table.table, table.rows_changed, columns.join(" "));
    }
    for (table, reason) in &report.skipped {
        println!("{:<32} skipped: {}", table, reason);
    }
    for (table, cause) in &report.failed {
        eprintln!("{:<32} failed: {}", table, cause);
    }
    println!(
        "{} {} replacements in {} rows, {} site records",
        if report.dry_run { "Would make" } else { "Made" },
        report.replacements(),
        report.rows_changed(),
        report.site_records
    );

    Ok(exit_code(ctx))
}
