//! Doctor command handler: credential sources, key files and the local environment.

use super::context::ProjectContext;
use crate::config::Config;
use crate::container::LocalEnvironment;
use crate::credentials::{CredentialResolver, DiagnosticReport, DiagnosticStatus};
use crate::error::Result;
use crate::utils::permissions::broader_than_owner;

pub fn handle_doctor(config: &Config, ctx: Option<&ProjectContext>) -> Result<i32> {
    let mut reports = CredentialResolver::standard(config.credentials_file()).diagnose();
    reports.push(check_private_file("known hosts", &config.known_hosts_file()));
    if let Some(ctx) = ctx {
        reports.push(match ctx.container().is_running() {
            Ok(true) => DiagnosticReport::ok("local environment", "running"),
            Ok(false) => DiagnosticReport::warning(
                "local environment",
                format!("not running; start it with '{} start'", ctx.container().program()),
            ),
            Err(e) => DiagnosticReport::error("local environment", e.to_string()),
        });
    }

    let mut worst = DiagnosticStatus::Ok;
    for report in &reports {
        let marker = match report.status {
            DiagnosticStatus::Ok => "✓",
            DiagnosticStatus::Warning => "!",
            DiagnosticStatus::Error => "✗",
        };
        println!("{} {:<20} {}", marker, report.name, report.message);
        for line in &report.detail {
            println!("    {}", line);
        }
        worst = match (worst, report.status) {
            (DiagnosticStatus::Error, _) | (_, DiagnosticStatus::Error) => DiagnosticStatus::Error,
            (DiagnosticStatus::Warning, _) | (_, DiagnosticStatus::Warning) => {
                DiagnosticStatus::Warning
            }
            _ => DiagnosticStatus::Ok,
        };
    }

    Ok(match worst {
        DiagnosticStatus::Ok => 0,
        DiagnosticStatus::Warning => 2,
        DiagnosticStatus::Error => 1,
    })
}

fn check_private_file(name: &str, path: &std::path::Path) -> DiagnosticReport {
    if !path.exists() {
        return DiagnosticReport::ok(name, format!("{} (created on first connect)", path.display()));
    }
    match broader_than_owner(path) {
        Ok(None) => DiagnosticReport::ok(name, path.display().to_string()),
        Ok(Some(mode)) => DiagnosticReport::warning(
            name,
            format!("{} has mode {:o}; chmod 600 it", path.display(), mode),
        ),
        Err(e) => DiagnosticReport::error(name, format!("{}: {}", path.display(), e)),
    }
}
