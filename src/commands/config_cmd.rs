//! Config command handlers - generating and showing configuration.

use std::path::Path;

use crate::cli::ConfigCommands;
use crate::config::{Config, DatabaseEngine};
use crate::error::Result;

pub fn handle_config(config: &Config, source: Option<&Path>, command: &ConfigCommands) -> Result<i32> {
    match command {
        ConfigCommands::Generate { path, overwrite } => {
            let config_path = Config::generate_config_file(path.clone(), *overwrite)?;
            println!("Config file generated at: {}", config_path.display());
        }
        ConfigCommands::Show => show(config, source),
    }
    Ok(0)
}

fn show(config: &Config, source: Option<&Path>) {
    match source {
        Some(path) => println!("Config file: {}", path.display()),
        None => println!("Config file: (none found, using defaults)"),
    }
    println!("  snapshots_dir: {}", config.snapshots_dir().display());
    println!("  known_hosts: {}", config.known_hosts_file().display());
    println!("  credentials_file: {}", config.credentials_file().display());
    println!("  temp_dir: {}", config.temp_dir().display());
    println!("  workers: {}", config.workers());
    println!("  api_base: {}", config.api_base());
    println!();

    if config.projects.is_empty() {
        println!("Projects: (none configured)");
        return;
    }
    println!("Projects:");
    for p in &config.projects {
        println!("  {} -> {}", p.id, p.local_url);
        for install in &p.installs {
            println!("    install {}: {}", install.environment, install.name);
        }
        println!("    table_prefix: {}", p.table_prefix());
        println!("    content_dir: {}", p.content_dir().display());
        println!(
            "    container: {} in {}",
            p.container_program(),
            p.container_dir().display()
        );
        match p.database_engine() {
            DatabaseEngine::Mysql { name } => println!("    database: mysql {}", name),
            DatabaseEngine::Sqlite { path } => println!("    database: sqlite {}", path.display()),
        }
        let (gateway, port) = p.ssh_gateway();
        print!("    ssh: {}:{}", gateway, port);
        if let Some(key) = p.ssh_key_name() {
            print!(" key={}", key);
        }
        println!();
        let retention = p.retention();
        println!(
            "    retention: auto {}d, manual {}d",
            retention.auto_days, retention.manual_days
        );
        if let Some(limit) = p.bandwidth_limit() {
            println!("    bandwidth_limit: {} KiB/s", limit);
        }
        for glob in p.transfer_includes() {
            println!("    include: {}", glob);
        }
        for glob in p.transfer_excludes() {
            println!("    exclude: {}", glob);
        }
        for hook in p.hooks() {
            println!("    hook: {}", hook.join(" "));
        }
        for table in p.skip_tables() {
            println!("    skip_table: {}", table);
        }
    }
}
