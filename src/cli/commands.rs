//! CLI command implementations.
//!
//! Commands are thin shells: resolve configuration, call into the lifecycle
//! or history modules, render the result. No command here touches storage
//! or transport directly.

use std::env;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde_json::json;

use super::args::{Cli, Command};
use super::errors::{CliError, CliResult};
use super::io::{ok_envelope, write_json};
use crate::config::{self, Config};
use crate::history::HistoryWalker;
use crate::layout;
use crate::lifecycle::{self, SyncOptions, SyncOutcome};
use crate::manifest::{snapshot_number, Manifest, ManifestEntry};
use crate::observability::{set_level_floor, Severity};

fn cwd() -> PathBuf {
    env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}

fn sync_options(cli: &Cli, message: Option<String>) -> SyncOptions {
    SyncOptions {
        message,
        dry_run: cli.dry_run,
        force: cli.force,
        normalize: cli.normalize,
    }
}

fn outcome_body(outcome: &SyncOutcome) -> serde_json::Value {
    json!({
        "snapshot_id": outcome.snapshot_id,
        "uploads": outcome.uploads,
        "downloads": outcome.downloads,
        "delete_local": outcome.deletes_local,
        "delete_remote": outcome.deletes_remote,
        "no_op": outcome.no_op,
        "dry_run": outcome.dry_run,
        "warnings": outcome.warnings,
    })
}

fn print_outcome(operation: &str, outcome: &SyncOutcome, json_mode: bool) {
    if json_mode {
        write_json(&ok_envelope(operation, outcome_body(outcome)));
        return;
    }
    if outcome.dry_run {
        println!(
            "{} (dry run): {} up, {} down, {} local deletes, {} remote deletes",
            operation,
            outcome.uploads,
            outcome.downloads,
            outcome.deletes_local,
            outcome.deletes_remote
        );
        return;
    }
    if outcome.no_op {
        println!("{}: already in sync", operation);
        return;
    }
    println!(
        "{}: snapshot {} ({} up, {} down, {} local deletes, {} remote deletes)",
        operation,
        outcome.snapshot_id.as_deref().unwrap_or("-"),
        outcome.uploads,
        outcome.downloads,
        outcome.deletes_local,
        outcome.deletes_remote
    );
}

/// Main CLI entry point: parse and dispatch.
pub fn run() -> CliResult<()> {
    let cli = Cli::parse_args();
    run_cli(cli)
}

pub fn run_cli(cli: Cli) -> CliResult<()> {
    if cli.verbose {
        set_level_floor(Severity::Trace);
    } else if cli.quiet {
        set_level_floor(Severity::Error);
    }

    match &cli.command {
        Command::Init { message } => init(&cli, message.clone()),
        Command::Clone { source } => clone(&cli, source),
        Command::Sync { message } => sync(&cli, message.clone()),
        Command::Status => status(&cli),
        Command::Log {
            limit,
            author,
            since,
        } => log(&cli, *limit, author.as_deref(), since.as_deref()),
        Command::Blame { file } => blame(&cli, file),
        Command::ListFiles { path } => list_files(&cli, path.as_deref()),
        Command::ListRepos => list_repos(&cli),
        Command::ValidateConfig { check_backend } => validate_config(&cli, *check_backend),
        Command::ValidateFile { file } => validate_file(&cli, file),
        Command::ValidateSnapshot { num } => validate_snapshot(&cli, *num),
        Command::ValidateChain => validate_chain(&cli),
    }
}

fn load_config() -> CliResult<Config> {
    Ok(Config::load(&cwd()).map_err(crate::errors::DsgError::from)?)
}

fn init(cli: &Cli, message: Option<String>) -> CliResult<()> {
    let config = load_config()?;
    let outcome = lifecycle::init_repository(&config, &sync_options(cli, message))?;
    print_outcome("init", &outcome, cli.json);
    Ok(())
}

fn clone(cli: &Cli, source: &str) -> CliResult<()> {
    let config = load_config().map_err(|e| match e {
        CliError::Dsg(crate::errors::DsgError::Config(_)) => CliError::usage(format!(
            "clone needs a .dsgconfig.yml describing {}; create one and run dsg clone again",
            source
        )),
        other => other,
    })?;
    // The positional source must name the configured repository.
    let name = config.project.repo_name();
    if source != name && !source.ends_with(&format!("/{}", name)) {
        return Err(CliError::usage(format!(
            "source {:?} does not match the configured repository {:?}",
            source, name
        )));
    }
    let outcome = lifecycle::clone_repository(&config, &sync_options(cli, None))?;
    print_outcome("clone", &outcome, cli.json);
    Ok(())
}

fn sync(cli: &Cli, message: Option<String>) -> CliResult<()> {
    let config = load_config()?;
    let outcome = lifecycle::sync_repository(&config, &sync_options(cli, message))?;
    print_outcome("sync", &outcome, cli.json);
    Ok(())
}

fn status(cli: &Cli) -> CliResult<()> {
    let config = load_config()?;
    // Shallow comparison is enough for status and skips hashing every file.
    let status = lifecycle::get_sync_status(&config, false)?;
    if cli.json {
        let states: serde_json::Map<String, serde_json::Value> = status
            .states
            .iter()
            .map(|(path, state)| (path.clone(), json!(state.name())))
            .collect();
        write_json(&ok_envelope(
            "status",
            json!({"states": states, "warnings": status.warnings}),
        ));
        return Ok(());
    }
    let mut pending = 0;
    for (path, state) in &status.states {
        use crate::merger::SyncState;
        if *state == SyncState::sLCR__all_eq {
            continue;
        }
        pending += 1;
        println!("{:<24} {}", state.name(), path);
    }
    if pending == 0 {
        println!("working copy is in sync");
    }
    Ok(())
}

fn log(
    cli: &Cli,
    limit: Option<usize>,
    author: Option<&str>,
    since: Option<&str>,
) -> CliResult<()> {
    let config = load_config()?;
    let since = match since {
        Some(text) => Some(
            DateTime::parse_from_rfc3339(text)
                .map_err(|e| CliError::usage(format!("bad --since value {:?}: {}", text, e)))?
                .with_timezone(&Utc),
        ),
        None => None,
    };
    let walker = HistoryWalker::new(&config.project_root);
    let entries = walker.log(limit, author, since.as_ref());

    if cli.json {
        let items: Vec<_> = entries
            .iter()
            .map(|e| {
                json!({
                    "snapshot_id": e.snapshot_id,
                    "created_at": e.created_at,
                    "created_by": e.created_by,
                    "entry_count": e.entry_count,
                    "message": e.snapshot_message,
                })
            })
            .collect();
        write_json(&ok_envelope("log", json!({"snapshots": items})));
        return Ok(());
    }
    for e in entries {
        println!(
            "{:<6} {} {} ({} files) {}",
            e.snapshot_id, e.created_at, e.created_by, e.entry_count, e.snapshot_message
        );
    }
    Ok(())
}

fn blame(cli: &Cli, file: &str) -> CliResult<()> {
    let config = load_config()?;
    let walker = HistoryWalker::new(&config.project_root);
    let events = walker.blame_3way(file);

    if cli.json {
        let items: Vec<_> = events
            .iter()
            .map(|e| {
                json!({
                    "snapshot_id": e.snapshot_id,
                    "created_at": e.created_at,
                    "created_by": e.created_by,
                    "event": e.event.as_str(),
                    "message": e.snapshot_message,
                })
            })
            .collect();
        write_json(&ok_envelope("blame", json!({"file": file, "events": items})));
        return Ok(());
    }
    if events.is_empty() {
        println!("{}: no history", file);
        return Ok(());
    }
    for e in events {
        println!(
            "{:<6} {:<8} {} {} {}",
            e.snapshot_id,
            e.event.as_str(),
            e.created_at,
            e.created_by,
            e.snapshot_message
        );
    }
    Ok(())
}

fn list_files(cli: &Cli, path_filter: Option<&str>) -> CliResult<()> {
    let config = load_config()?;
    let manifest_path = layout::last_sync_path(&config.project_root);
    if !manifest_path.exists() {
        return Err(CliError::usage(
            "no manifest yet; run dsg init or dsg clone first",
        ));
    }
    let manifest = Manifest::from_file(&manifest_path).map_err(crate::errors::DsgError::from)?;
    let matches = |p: &str| match path_filter {
        Some(prefix) => p == prefix || p.starts_with(&format!("{}/", prefix.trim_end_matches('/'))),
        None => true,
    };

    if cli.json {
        let files: Vec<_> = manifest
            .entries
            .iter()
            .filter(|(p, _)| matches(p))
            .map(|(p, e)| match e {
                ManifestEntry::File(f) => json!({
                    "path": p, "type": "file", "filesize": f.filesize,
                    "mtime": f.mtime, "hash": f.hash, "user": f.user,
                }),
                ManifestEntry::Link(l) => json!({
                    "path": p, "type": "link", "reference": l.reference,
                }),
            })
            .collect();
        write_json(&ok_envelope("list-files", json!({"files": files})));
        return Ok(());
    }
    for (path, entry) in &manifest.entries {
        if !matches(path) {
            continue;
        }
        match entry {
            ManifestEntry::File(f) => println!("{:>12}  {}", f.filesize, path),
            ManifestEntry::Link(l) => println!("{:>12}  {} -> {}", "link", path, l.reference),
        }
    }
    Ok(())
}

fn list_repos(cli: &Cli) -> CliResult<()> {
    let user = config::load_merged_user_config().map_err(crate::errors::DsgError::from)?;
    let base = user.default_project_path.ok_or_else(|| {
        CliError::usage("set default_project_path in dsg.yml to list repositories")
    })?;
    let listings = lifecycle::list_repositories(&base);

    if cli.json {
        let repos: Vec<_> = listings
            .iter()
            .map(|r| json!({"name": r.name, "snapshot_id": r.snapshot_id}))
            .collect();
        write_json(&ok_envelope("list-repos", json!({"repos": repos})));
        return Ok(());
    }
    for r in listings {
        println!(
            "{:<32} {}",
            r.name,
            r.snapshot_id.as_deref().unwrap_or("(no snapshots)")
        );
    }
    Ok(())
}

fn report_problems(
    cli: &Cli,
    operation: &str,
    extra: serde_json::Value,
    problems: Vec<String>,
) -> CliResult<()> {
    if cli.json {
        let mut body = json!({"problems": problems});
        if let (Some(obj), Some(extra)) = (body.as_object_mut(), extra.as_object()) {
            for (k, v) in extra {
                obj.insert(k.clone(), v.clone());
            }
        }
        write_json(&ok_envelope(operation, body));
    } else if problems.is_empty() {
        println!("{}: ok", operation);
    } else {
        for p in &problems {
            println!("{}: {}", operation, p);
        }
    }
    if problems.is_empty() {
        Ok(())
    } else {
        Err(CliError::ValidationFailed {
            count: problems.len(),
        })
    }
}

fn validate_config(cli: &Cli, check_backend: bool) -> CliResult<()> {
    let mut problems = config::validate_config(&cwd());
    if check_backend && problems.is_empty() {
        let config = load_config()?;
        match crate::transaction::factory::create_remote_filesystem(&config) {
            Ok(remote) => {
                if let Err(e) = remote.file_exists(layout::PROJECT_CONFIG_FILE) {
                    problems.push(format!("backend unreachable: {}", e));
                }
            }
            Err(e) => problems.push(format!("backend: {}", e)),
        }
    }
    report_problems(cli, "validate-config", json!({}), problems)
}

fn validate_file(cli: &Cli, file: &str) -> CliResult<()> {
    let config = load_config()?;
    let problems = lifecycle::validate_file(&config, file)?;
    report_problems(cli, "validate-file", json!({"file": file}), problems)
}

fn newest_archived(config: &Config) -> Option<u64> {
    let archive = layout::archive_dir(&config.project_root);
    let mut newest = None;
    for entry in std::fs::read_dir(archive).ok()?.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        if let Some(id) = name.strip_suffix("-sync.json.gz") {
            if let Some(n) = snapshot_number(id) {
                newest = Some(newest.map_or(n, |m: u64| m.max(n)));
            }
        }
    }
    newest
}

fn validate_snapshot(cli: &Cli, num: Option<u64>) -> CliResult<()> {
    let config = load_config()?;
    let number = num.or_else(|| newest_archived(&config)).ok_or_else(|| {
        CliError::usage("no archived snapshots; nothing to validate")
    })?;
    let problems = lifecycle::validate_snapshot(&config.project_root, number)?;
    report_problems(
        cli,
        "validate-snapshot",
        json!({"snapshot": format!("s{}", number)}),
        problems,
    )
}

fn validate_chain(cli: &Cli) -> CliResult<()> {
    let config = load_config()?;
    let problems = lifecycle::validate_chain(&config.project_root)?;
    report_problems(cli, "validate-chain", json!({}), problems)
}
