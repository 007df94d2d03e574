//! Integration tests for the stax library.
//!
//! These tests verify the public API works correctly.

use clap::Parser;
use stax::cli::{Cli, Commands, FilesScope};
use stax::commands::{ProjectContext, build_request};
use stax::config::Config;
use stax::db::SqliteDatabase;
use stax::process::Budget;
use stax::provider::Environment;
use stax::pull::FileScope;
use stax::snapshot::SnapshotKind;
use tokio_util::sync::CancellationToken;

fn config_in(dir: &std::path::Path) -> Config {
    Config::parse(&format!(
        r#"
defaults snapshots_dir="{snaps}" temp_dir="{tmp}" workers=2
project "mysite" local_url="https://mysite.ddev.site" table_prefix="wp_" {{
    install "production" "mysite"
    install "staging" "mysitestg"
    database engine="sqlite" path="{db}"
    ssh key="id_rsa"
    transfer bandwidth_limit=256 {{
        exclude "*.zip"
    }}
    skip_table "wp_actionscheduler_logs"
}}
"#,
        snaps = dir.join("snapshots").display(),
        tmp = dir.join("tmp").display(),
        db = dir.join("site.sqlite").display(),
    ))
    .unwrap()
}

fn pull_args(argv: &[&str]) -> stax::cli::PullArgs {
    let mut full = vec!["stax", "pull"];
    full.extend_from_slice(argv);
    match Cli::parse_from(full).command {
        Commands::Pull(args) => args,
        other => panic!("expected pull, got {:?}", other),
    }
}

#[test]
fn test_pull_defaults() {
    let args = pull_args(&[]);
    assert_eq!(args.environment, "production");
    assert!(args.snapshot);
    assert!(!args.delete_extraneous);
    assert!(matches!(args.files, FilesScope::All));
}

#[test]
fn test_pull_flags_map_onto_request() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = ProjectContext::new(config_in(dir.path()), None, CancellationToken::new()).unwrap();

    let args = pull_args(&[
        "--environment",
        "staging",
        "--snapshot=false",
        "--exclude-tables",
        "wp_a,wp_b",
        "--files",
        "themes",
        "--dry-run",
        "--sanitize",
    ]);
    let request = build_request(&ctx, &args).unwrap();

    assert_eq!(request.environment, Environment::Staging);
    assert_eq!(request.install, "mysitestg");
    assert_eq!(request.local_url, "https://mysite.ddev.site");
    assert!(!request.snapshot);
    assert!(request.dry_run);
    assert!(request.transfer.dry_run);
    assert!(request.sanitize);
    assert_eq!(request.file_scope, FileScope::ThemesOnly);
    assert!(!request.skip_files);
    assert_eq!(
        request.exclude_tables,
        vec!["wp_actionscheduler_logs", "wp_a", "wp_b"]
    );
    assert_eq!(request.transfer.bandwidth_limit_kibibytes_per_sec, 256);
    assert_eq!(request.transfer.exclude_globs, vec!["*.zip".to_string()]);
    assert_eq!(request.transfer.workers, 2);
    assert!(!request.transfer.delete_extraneous);
    assert_eq!(request.ssh_key_name.as_deref(), Some("id_rsa"));
    assert_eq!(request.temp_dir, dir.path().join("tmp"));
}

#[test]
fn test_cli_bandwidth_overrides_config() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = ProjectContext::new(config_in(dir.path()), None, CancellationToken::new()).unwrap();
    let args = pull_args(&["--bandwidth-limit", "64", "--files", "none", "--delete-extraneous"]);
    let request = build_request(&ctx, &args).unwrap();
    assert_eq!(request.transfer.bandwidth_limit_kibibytes_per_sec, 64);
    assert!(request.skip_files);
    assert!(request.transfer.delete_extraneous);
}

#[test]
fn test_unmapped_environment_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = ProjectContext::new(config_in(dir.path()), None, CancellationToken::new()).unwrap();
    assert!(build_request(&ctx, &pull_args(&["-e", "development"])).is_err());
    assert!(build_request(&ctx, &pull_args(&["-e", "qa"])).is_err());
}

#[test]
fn test_replace_network_conflicts_with_url() {
    let parsed = Cli::try_parse_from([
        "stax",
        "replace",
        "--from",
        "https://a.test",
        "--to",
        "https://b.test",
        "--network",
        "--url",
        "https://a.test/blog",
    ]);
    assert!(parsed.is_err());
}

#[test]
fn test_snapshot_round_trip_through_context() {
    let dir = tempfile::tempdir().unwrap();
    let db = SqliteDatabase::open(&dir.path().join("site.sqlite")).unwrap();
    db.execute_batch(
        "CREATE TABLE wp_options (option_id INTEGER PRIMARY KEY, option_name TEXT, option_value TEXT);
         INSERT INTO wp_options VALUES (1, 'siteurl', 'https://mysite.ddev.site');",
    )
    .unwrap();

    let ctx = ProjectContext::new(config_in(dir.path()), Some("mysite"), CancellationToken::new())
        .unwrap();
    let store = ctx.snapshots().unwrap();
    let budget = Budget::unbounded("test");

    let created = store
        .create("mysite", SnapshotKind::Manual, Some("before theme work"), &budget)
        .unwrap();
    assert!(created.absolute_path.starts_with(dir.path().join("snapshots")));
    assert!(created.size_bytes > 0);

    let listed = store.list("mysite").unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].description.as_deref(), Some("before theme work"));

    assert!(store.delete(&created.file_name).unwrap());
    assert!(store.list("mysite").unwrap().is_empty());
    assert!(ctx.warnings.is_empty());
}
