//! Lifecycle operations: init, clone, sync, status, and the validators.
//!
//! Each operation assembles the three manifests it needs, runs the merger
//! and planner, and drives the transaction coordinator. Sync locks the
//! remote repository (the authoritative side); init locks locally because
//! the remote repository does not exist until its transaction commits.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{SecondsFormat, Utc};

use crate::config::{Config, TransportKind};
use crate::errors::{DsgError, DsgResult};
use crate::layout;
use crate::locking::{LocalLockStore, LockStore, SshLockStore, SyncLock};
use crate::manifest::messages::SnapshotMessage;
use crate::manifest::{next_snapshot_id, Manifest, SyncMessages};
use crate::merger::{ManifestMerger, SyncState};
use crate::observability::Logger;
use crate::planner::{
    self, calculate_sync_plan, conflict_paths, conflicts::clear_conflicts_file,
    conflicts::conflicts_path, parse_conflicts_file, write_conflicts_file, SyncPlan,
};
use crate::scanner::{scan_directory, ScanOptions};
use crate::storage::{ClientFilesystem, RemoteFilesystem};
use crate::transaction::factory::{create_remote_filesystem, create_transport};
use crate::transaction::{generate_transaction_id, RetryPolicy, Transaction};
use crate::transport::{is_local_host, TempFile, Transport, TransportError};

#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    pub message: Option<String>,
    pub dry_run: bool,
    pub force: bool,
    pub normalize: bool,
}

/// Result of an init, clone, or sync.
#[derive(Debug, Clone, Default)]
pub struct SyncOutcome {
    pub snapshot_id: Option<String>,
    pub uploads: usize,
    pub downloads: usize,
    pub deletes_local: usize,
    pub deletes_remote: usize,
    pub no_op: bool,
    pub dry_run: bool,
    pub warnings: Vec<String>,
}

/// Result of `dsg status`.
#[derive(Debug)]
pub struct SyncStatus {
    pub states: BTreeMap<String, SyncState>,
    pub warnings: Vec<String>,
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn load_cache(root: &Path) -> DsgResult<Manifest> {
    let path = layout::last_sync_path(root);
    if path.exists() {
        Ok(Manifest::from_file(&path)?)
    } else {
        Ok(Manifest::new())
    }
}

fn load_remote_manifest(
    remote: &dyn RemoteFilesystem,
) -> DsgResult<(Manifest, Option<Vec<u8>>)> {
    let rel = format!("{}/{}", layout::DSG_DIR, layout::LAST_SYNC_FILE);
    if !remote.file_exists(&rel)? {
        return Ok((Manifest::new(), None));
    }
    let raw = remote.read_file(&rel)?;
    let manifest = Manifest::from_json(&String::from_utf8_lossy(&raw))?;
    Ok((manifest, Some(raw)))
}

/// The lock store for the authoritative (remote) side of this repository.
fn remote_lock_store(config: &Config) -> DsgResult<Box<dyn LockStore>> {
    let ssh = match config.project.transport {
        TransportKind::Ssh => config.project.ssh.as_ref(),
        _ => None,
    }
    .ok_or_else(|| DsgError::sync("ssh transport required for locking"))?;
    let repo_root = ssh.path.join(config.project.repo_name());
    if is_local_host(&ssh.host) {
        Ok(Box::new(LocalLockStore::new(&repo_root)))
    } else {
        Ok(Box::new(SshLockStore::new(
            &ssh.host,
            ssh.port.unwrap_or(22),
            &repo_root,
        )))
    }
}

fn scan_local(config: &Config, opts: &SyncOptions, compute_hashes: bool) -> DsgResult<(Manifest, Vec<String>)> {
    let outcome = scan_directory(
        &config.project_root,
        &config.project.project,
        &ScanOptions {
            user_id: config.user.user_id.clone(),
            compute_hashes,
            normalize: opts.normalize,
        },
    )?;
    for warning in &outcome.warnings {
        Logger::warn("SCAN_WARNING", &[("detail", warning)]);
    }
    Ok((outcome.manifest, outcome.warnings))
}

/// The post-sync manifest: for every classified path, the entry that will
/// exist once the plan commits, in sorted path order.
fn build_result_manifest(
    states: &BTreeMap<String, SyncState>,
    local: &Manifest,
    cache: &Manifest,
    remote: &Manifest,
) -> Manifest {
    let mut result = Manifest::new();
    for (path, state) in states {
        let chosen = match state {
            // Unchanged since last sync: keep the cache record with its
            // original author.
            SyncState::sLCR__all_eq => cache.get(path),
            // Remote side wins or already matches.
            SyncState::sLCR__L_eq_C_ne_R
            | SyncState::sLCR__L_eq_R_ne_C
            | SyncState::sLxCR__L_eq_R
            | SyncState::sxLCxR__only_R => remote.get(path),
            // Local side wins.
            SyncState::sLCR__C_eq_R_ne_L | SyncState::sLxCxR__only_L => local.get(path),
            // Path ends up absent.
            SyncState::sxLCR__C_eq_R
            | SyncState::sLCxR__L_eq_C
            | SyncState::sxLCRx__only_C
            | SyncState::sxLxCxR__none => None,
            // Conflicts were rejected before planning.
            SyncState::sLCR__all_ne
            | SyncState::sxLCR__C_ne_R
            | SyncState::sLxCR__L_ne_R
            | SyncState::sLCxR__L_ne_C => None,
        };
        if let Some(entry) = chosen {
            result.insert(entry.clone());
        }
    }
    result
}

/// Millisecond mtimes a manifest records for the given paths.
fn recorded_mtimes<'a, I>(
    manifest: &Manifest,
    paths: I,
) -> BTreeMap<String, i64>
where
    I: IntoIterator<Item = &'a String>,
{
    let mut mtimes = BTreeMap::new();
    for path in paths {
        if let Some(crate::manifest::ManifestEntry::File(f)) = manifest.get(path) {
            if let Some(ms) = crate::manifest::entry::mtime_millis(&f.mtime) {
                mtimes.insert(path.clone(), ms);
            }
        }
    }
    mtimes
}

fn snapshot_message_record(meta: &crate::manifest::ManifestMetadata) -> SnapshotMessage {
    SnapshotMessage {
        snapshot_id: meta.snapshot_id.clone(),
        created_at: meta.created_at.clone(),
        created_by: meta.created_by.clone(),
        message: meta.snapshot_message.clone(),
        snapshot_notes: meta.snapshot_notes.clone(),
    }
}

/// Staged metadata writes for a new snapshot: the manifest itself and the
/// appended message ledger. The ledger base is the remote's when one exists
/// (it may record snapshots other workstations pushed), the local one
/// otherwise.
fn staged_metadata(
    root: &Path,
    manifest: &Manifest,
    remote_ledger: Option<&[u8]>,
) -> DsgResult<Vec<(String, Vec<u8>)>> {
    let manifest_json = manifest.to_json()?;
    let mut ledger = match remote_ledger {
        Some(raw) => serde_json::from_slice(raw)
            .map_err(|e| DsgError::sync(format!("bad remote message ledger: {}", e)))?,
        None => SyncMessages::load_or_default(&layout::sync_messages_path(root))?,
    };
    if let Some(meta) = manifest.metadata.as_ref() {
        ledger.append(snapshot_message_record(meta));
    }
    let ledger_json = serde_json::to_vec_pretty(&ledger)
        .map_err(|e| DsgError::sync(format!("cannot encode message ledger: {}", e)))?;
    Ok(vec![
        (
            format!("{}/{}", layout::DSG_DIR, layout::LAST_SYNC_FILE),
            manifest_json.into_bytes(),
        ),
        (
            format!("{}/{}", layout::DSG_DIR, layout::SYNC_MESSAGES_FILE),
            ledger_json,
        ),
    ])
}

fn archive_snapshot(root: &Path, manifest: &Manifest) -> DsgResult<()> {
    let Some(meta) = manifest.metadata.as_ref() else {
        return Ok(());
    };
    std::fs::create_dir_all(layout::archive_dir(root))
        .map_err(|e| DsgError::sync(format!("cannot create archive dir: {}", e)))?;
    manifest.to_gz_file(&layout::archive_path(root, &meta.snapshot_id))?;
    Ok(())
}

/// Initialize a repository: first snapshot locally, first dataset remotely.
pub fn init_repository(config: &Config, opts: &SyncOptions) -> DsgResult<SyncOutcome> {
    let root = &config.project_root;
    if layout::last_sync_path(root).exists() {
        return Err(DsgError::sync_with_hint(
            "repository is already initialized",
            "run dsg sync to synchronize, or remove .dsg to start over",
        ));
    }

    let (local, warnings) = scan_local(config, opts, true)?;
    let manifest = local.clone().with_metadata(
        "s1",
        &now_rfc3339(),
        &config.user.user_id,
        opts.message.as_deref().unwrap_or("initial snapshot"),
        None,
        None,
        "init",
        config.project.to_audit_value(),
    );

    let mut plan = SyncPlan::default();
    plan.upload_files = manifest.entries.keys().cloned().collect();
    for metadata_file in layout::METADATA_FILES {
        plan.upload_files.push(metadata_file.to_string());
    }

    let mut outcome = SyncOutcome {
        snapshot_id: Some("s1".to_string()),
        uploads: manifest.len(),
        warnings,
        ..Default::default()
    };
    if opts.dry_run {
        outcome.dry_run = true;
        return Ok(outcome);
    }

    // The remote repository does not exist yet, so serialize locally.
    let mut lock = SyncLock::new(
        Box::new(LocalLockStore::new(root)) as Box<dyn LockStore>,
        &config.user.user_id,
        "init",
    );
    lock.acquire()?;

    let staged = staged_metadata(root, &manifest, None)?;
    let client = ClientFilesystem::new(root, false);
    let remote = create_remote_filesystem(config)?;
    let transport = create_transport(config)?;
    Transaction::new(client, remote, transport).execute(&plan, &staged)?;

    archive_snapshot(root, &manifest)?;
    lock.release();
    Logger::info("INIT_DONE", &[("snapshot", "s1"), ("repo", config.project.repo_name())]);
    Ok(outcome)
}

/// Download files from the remote into the client working copy and adopt
/// the remote's manifest as the new cache, byte-identical. The remote is
/// never mutated, so the snapshot chain does not advance. Used by clone and
/// by pull-only syncs.
fn pull_into_client(
    config: &Config,
    opts: &SyncOptions,
    remote: &mut dyn RemoteFilesystem,
    remote_manifest: &Manifest,
    raw_manifest: &[u8],
    download_files: &[String],
    delete_local: &[String],
) -> DsgResult<usize> {
    let root = &config.project_root;
    let tx_id = generate_transaction_id();
    let mut client =
        ClientFilesystem::new(root, config.user.backup_on_conflict && !opts.force);
    client.set_expected_mtimes(recorded_mtimes(remote_manifest, download_files.iter()));
    let mut transport = create_transport(config)?;
    let retry = RetryPolicy::default();

    let mut downloads = 0usize;
    let result = (|| -> DsgResult<()> {
        client.begin(&tx_id).map_err(DsgError::from)?;
        transport.begin_session()?;

        for rel_path in download_files {
            match remote_manifest.get(rel_path) {
                Some(crate::manifest::ManifestEntry::Link(l)) => {
                    client.create_symlink(rel_path, &l.reference)?;
                }
                Some(crate::manifest::ManifestEntry::File(_)) => {
                    let declared = remote.send_file(rel_path)?.size();
                    let mut temp: TempFile = retry.run(rel_path, || {
                        let mut stream = remote
                            .send_file(rel_path)
                            .map_err(|e| TransportError::io_message(e.message().to_string()))?;
                        transport.transfer_to_local(stream.as_mut())
                    })?;
                    if temp.size != declared {
                        return Err(DsgError::sync(format!(
                            "transfer size mismatch for {}: expected {}, got {}",
                            rel_path, declared, temp.size
                        )));
                    }
                    client.recv_file(rel_path, &mut temp)?;
                    downloads += 1;
                }
                None => {
                    return Err(DsgError::sync(format!(
                        "remote manifest has no entry for {}",
                        rel_path
                    )))
                }
            }
        }
        for rel_path in delete_local {
            client.delete_file(rel_path);
        }

        // The local cache becomes byte-identical to the remote manifest.
        client.stage_file_bytes(
            &format!("{}/{}", layout::DSG_DIR, layout::LAST_SYNC_FILE),
            raw_manifest,
        )?;
        let messages_rel = format!("{}/{}", layout::DSG_DIR, layout::SYNC_MESSAGES_FILE);
        if remote.file_exists(&messages_rel)? {
            let ledger = remote.read_file(&messages_rel)?;
            client.stage_file_bytes(&messages_rel, &ledger)?;
        }

        client.commit(&tx_id).map_err(DsgError::from)
    })();

    let outcome = match result {
        Ok(()) => Ok(downloads),
        Err(e) => {
            let _ = client.rollback(&tx_id);
            Err(e)
        }
    };
    let _ = transport.end_session();
    outcome
}

/// Clone a remote repository into an empty local working copy.
pub fn clone_repository(config: &Config, opts: &SyncOptions) -> DsgResult<SyncOutcome> {
    let root = &config.project_root;
    if layout::last_sync_path(root).exists() {
        return Err(DsgError::sync_with_hint(
            "local repository already has sync state",
            "clone requires an empty .dsg; use dsg sync instead",
        ));
    }

    let mut remote = create_remote_filesystem(config)?;
    let (remote_manifest, raw) = load_remote_manifest(remote.as_ref())?;
    let Some(raw_manifest) = raw else {
        return Err(DsgError::sync_with_hint(
            "remote repository has no manifest",
            "initialize the repository with dsg init first",
        ));
    };

    if opts.dry_run {
        return Ok(SyncOutcome {
            snapshot_id: remote_manifest.snapshot_id().map(str::to_string),
            downloads: remote_manifest.len(),
            dry_run: true,
            ..Default::default()
        });
    }

    let mut lock = SyncLock::new(remote_lock_store(config)?, &config.user.user_id, "clone");
    lock.acquire()?;

    let all_paths: Vec<String> = remote_manifest.entries.keys().cloned().collect();
    let result = pull_into_client(
        config,
        opts,
        remote.as_mut(),
        &remote_manifest,
        &raw_manifest,
        &all_paths,
        &[],
    );
    lock.release();
    let downloads = result?;

    Logger::info(
        "CLONE_DONE",
        &[
            ("repo", config.project.repo_name()),
            ("files", &downloads.to_string()),
        ],
    );
    Ok(SyncOutcome {
        snapshot_id: remote_manifest.snapshot_id().map(str::to_string),
        downloads,
        ..Default::default()
    })
}

/// Classify without mutating anything.
pub fn get_sync_status(config: &Config, compute_hashes: bool) -> DsgResult<SyncStatus> {
    let opts = SyncOptions::default();
    let (local, warnings) = scan_local(config, &opts, compute_hashes)?;
    let cache = load_cache(&config.project_root)?;
    let remote = create_remote_filesystem(config)?;
    let (remote_manifest, _) = load_remote_manifest(remote.as_ref())?;

    let states = ManifestMerger::new(&local, &cache, &remote_manifest).merge();
    Ok(SyncStatus { states, warnings })
}

/// Synchronize the working copy with the remote repository.
pub fn sync_repository(config: &Config, opts: &SyncOptions) -> DsgResult<SyncOutcome> {
    let root = &config.project_root;

    // Finish anything a crashed transaction left behind before reading
    // local state.
    if ClientFilesystem::recover(root)? {
        Logger::info("SYNC_RECOVERED_PRIOR_TX", &[]);
    }

    let (local, warnings) = scan_local(config, opts, true)?;
    let cache = load_cache(root)?;

    let mut lock = SyncLock::new(remote_lock_store(config)?, &config.user.user_id, "sync");
    let locked = !opts.dry_run;
    if locked {
        lock.acquire()?;
    }

    let result = sync_locked(config, opts, local, cache, warnings);
    if locked {
        lock.release();
    }
    result
}

fn sync_locked(
    config: &Config,
    opts: &SyncOptions,
    local: Manifest,
    cache: Manifest,
    warnings: Vec<String>,
) -> DsgResult<SyncOutcome> {
    let root = &config.project_root;
    let mut remote = create_remote_filesystem(config)?;
    let (remote_manifest, raw_remote) = load_remote_manifest(remote.as_ref())?;

    let mut states = ManifestMerger::new(&local, &cache, &remote_manifest).merge();

    // Resolve or report conflicts before anything touches either side.
    let mut conflicts = conflict_paths(&states);
    if !conflicts.is_empty() && conflicts_path(root).exists() {
        let (resolutions, _) = parse_conflicts_file(root)
            .map_err(|e| DsgError::sync(format!("cannot read conflicts.txt: {}", e)))?;
        planner::apply_resolutions(&mut states, &resolutions);
        conflicts = conflict_paths(&states);
    }
    if !conflicts.is_empty() {
        // A dry run reports conflicts without writing the annotation file.
        if !opts.dry_run {
            write_conflicts_file(root, &conflicts)
                .map_err(|e| DsgError::sync(format!("cannot write conflicts.txt: {}", e)))?;
        }
        let listed: Vec<String> = conflicts.iter().map(|(p, _)| p.clone()).collect();
        return Err(DsgError::sync_with_hint(
            format!(
                "{} unresolved conflict(s): {}",
                listed.len(),
                listed.join(", ")
            ),
            "annotate conflicts.txt with L, C, or R and run dsg sync again",
        ));
    }

    let plan = calculate_sync_plan(&states);
    let mut outcome = SyncOutcome {
        snapshot_id: cache.snapshot_id().map(str::to_string),
        uploads: plan
            .upload_files
            .iter()
            .filter(|f| !layout::METADATA_FILES.contains(&f.as_str()))
            .count(),
        downloads: plan.download_files.len(),
        deletes_local: plan.delete_local.len(),
        deletes_remote: plan.delete_remote.len(),
        warnings,
        ..Default::default()
    };

    if opts.dry_run {
        outcome.dry_run = true;
        return Ok(outcome);
    }

    if plan.is_empty() && plan.cache_refresh.is_empty() {
        // Nothing moved. Rewrite the identical manifest; the chain does not
        // advance.
        if !cache.is_empty() || cache.metadata.is_some() {
            cache.to_file(&layout::last_sync_path(root))?;
        }
        clear_conflicts_file(root);
        outcome.no_op = true;
        Logger::info("SYNC_NOOP", &[("repo", config.project.repo_name())]);
        return Ok(outcome);
    }

    // A sync that changes nothing on the remote is a pull: the working copy
    // and cache adopt the remote's snapshot, and the chain does not advance.
    if outcome.uploads == 0 && outcome.deletes_remote == 0 {
        let raw_manifest = match raw_remote {
            Some(raw) => raw,
            None => remote_manifest.to_json()?.into_bytes(),
        };
        let downloads = pull_into_client(
            config,
            opts,
            remote.as_mut(),
            &remote_manifest,
            &raw_manifest,
            &plan.download_files,
            &plan.delete_local,
        )?;
        if remote_manifest.metadata.is_some() {
            archive_snapshot(root, &remote_manifest)?;
        }
        clear_conflicts_file(root);
        outcome.downloads = downloads;
        outcome.snapshot_id = remote_manifest.snapshot_id().map(str::to_string);
        Logger::info(
            "SYNC_PULLED",
            &[
                ("repo", config.project.repo_name()),
                ("snapshot", outcome.snapshot_id.as_deref().unwrap_or("-")),
            ],
        );
        return Ok(outcome);
    }

    let messages_rel = format!("{}/{}", layout::DSG_DIR, layout::SYNC_MESSAGES_FILE);
    let remote_ledger = if remote.file_exists(&messages_rel)? {
        Some(remote.read_file(&messages_rel)?)
    } else {
        None
    };
    drop(remote);

    // Build the post-sync snapshot, chained onto the remote's head (the
    // causal parent of the state this sync publishes); the cache stands in
    // only when the remote has no manifest yet.
    let prev_meta = remote_manifest
        .metadata
        .as_ref()
        .or(cache.metadata.as_ref());
    let prev_id = prev_meta.map(|m| m.snapshot_id.as_str());
    let prev_hash = prev_meta.map(|m| m.snapshot_hash.as_str());
    let snapshot_id = next_snapshot_id(prev_id);
    let result_manifest = build_result_manifest(&states, &local, &cache, &remote_manifest)
        .with_metadata(
            &snapshot_id,
            &now_rfc3339(),
            &config.user.user_id,
            opts.message.as_deref().unwrap_or("sync"),
            prev_id,
            prev_hash,
            "sync",
            config.project.to_audit_value(),
        );

    let staged = staged_metadata(root, &result_manifest, remote_ledger.as_deref())?;
    let mut client =
        ClientFilesystem::new(root, config.user.backup_on_conflict && !opts.force);
    client.set_expected_mtimes(recorded_mtimes(
        &remote_manifest,
        plan.download_files.iter(),
    ));
    let remote = create_remote_filesystem(config)?;
    let transport = create_transport(config)?;
    Transaction::new(client, remote, transport).execute(&plan, &staged)?;

    archive_snapshot(root, &result_manifest)?;
    clear_conflicts_file(root);
    outcome.snapshot_id = Some(snapshot_id.clone());
    Logger::info(
        "SYNC_DONE",
        &[
            ("repo", config.project.repo_name()),
            ("snapshot", &snapshot_id),
        ],
    );
    Ok(outcome)
}

/// Check one archived snapshot's internal integrity.
pub fn validate_snapshot(root: &Path, number: u64) -> DsgResult<Vec<String>> {
    let id = format!("s{}", number);
    let path = layout::archive_path(root, &id);
    let mut problems = Vec::new();
    if !path.exists() {
        problems.push(format!("archive {} missing", path.display()));
        return Ok(problems);
    }
    let manifest = Manifest::from_gz_file(&path)?;
    let Some(meta) = manifest.metadata.as_ref() else {
        problems.push(format!("{}: no metadata block", id));
        return Ok(problems);
    };
    if meta.snapshot_id != id {
        problems.push(format!(
            "{}: metadata names snapshot {}",
            id, meta.snapshot_id
        ));
    }
    if meta.entry_count != manifest.len() {
        problems.push(format!(
            "{}: entry_count {} but {} entries",
            id,
            meta.entry_count,
            manifest.len()
        ));
    }
    let recomputed = manifest.entries_hash();
    if recomputed != meta.entries_hash {
        problems.push(format!(
            "{}: entries_hash mismatch (recorded {}, recomputed {})",
            id, meta.entries_hash, recomputed
        ));
    }
    Ok(problems)
}

/// Verify the id and hash linkage of the whole snapshot chain.
pub fn validate_chain(root: &Path) -> DsgResult<Vec<String>> {
    let mut problems = Vec::new();
    let mut prev: Option<(String, String)> = None;

    let mut number = 1u64;
    loop {
        let id = format!("s{}", number);
        let archived = layout::archive_path(root, &id);
        let manifest = if archived.exists() {
            Manifest::from_gz_file(&archived)?
        } else if number == 1 {
            problems.push("no snapshots found".to_string());
            return Ok(problems);
        } else {
            break;
        };
        let Some(meta) = manifest.metadata.as_ref() else {
            problems.push(format!("{}: no metadata block", id));
            break;
        };
        match (&prev, &meta.snapshot_previous) {
            (None, None) => {}
            (None, Some(p)) => {
                problems.push(format!("{}: first snapshot names parent {}", id, p))
            }
            (Some(_), None) => {
                problems.push(format!("{}: missing parent link", id));
            }
            (Some((prev_id, _)), Some(named)) if named != prev_id => {
                problems.push(format!(
                    "{}: parent is {} but chain expects {}",
                    id, named, prev_id
                ));
            }
            _ => {}
        }
        let expected_hash = manifest.compute_snapshot_hash(
            &meta.snapshot_message,
            prev.as_ref().map(|(_, h)| h.as_str()),
        );
        if expected_hash != meta.snapshot_hash {
            problems.push(format!(
                "{}: snapshot_hash mismatch (recorded {}, recomputed {})",
                id, meta.snapshot_hash, expected_hash
            ));
        }
        prev = Some((id, meta.snapshot_hash.clone()));
        number += 1;
    }
    Ok(problems)
}

/// Validate one working file against the current manifest.
pub fn validate_file(config: &Config, rel_path: &str) -> DsgResult<Vec<String>> {
    let mut problems = Vec::new();
    crate::manifest::entry::validate_rel_path(rel_path)?;
    let cache = load_cache(&config.project_root)?;
    let on_disk = config.project_root.join(rel_path);
    match cache.get(rel_path) {
        None => problems.push(format!("{} is not in the current manifest", rel_path)),
        Some(crate::manifest::ManifestEntry::File(f)) => {
            if !on_disk.exists() {
                problems.push(format!("{} recorded but missing on disk", rel_path));
            } else {
                let hash = crate::manifest::hashing::hash_file(&on_disk)
                    .map_err(|e| DsgError::sync(format!("cannot hash {}: {}", rel_path, e)))?;
                if f.hash != crate::manifest::UNKNOWN_HASH && hash != f.hash {
                    problems.push(format!(
                        "{}: content hash {} does not match recorded {}",
                        rel_path, hash, f.hash
                    ));
                }
            }
        }
        Some(crate::manifest::ManifestEntry::Link(_)) => {
            if !on_disk.symlink_metadata().map(|m| m.file_type().is_symlink()).unwrap_or(false) {
                problems.push(format!("{} recorded as link but is not one", rel_path));
            }
        }
    }
    Ok(problems)
}

/// A repository visible under the discovery base path.
#[derive(Debug, Clone)]
pub struct RepoListing {
    pub name: String,
    pub snapshot_id: Option<String>,
}

/// Thin discovery shell: directories under `base` carrying a project config.
pub fn list_repositories(base: &Path) -> Vec<RepoListing> {
    let mut listings = Vec::new();
    let Ok(entries) = std::fs::read_dir(base) else {
        return listings;
    };
    let mut dirs: Vec<_> = entries.flatten().map(|e| e.path()).collect();
    dirs.sort();
    for dir in dirs {
        if !dir.join(layout::PROJECT_CONFIG_FILE).exists() {
            continue;
        }
        let snapshot_id = Manifest::from_file(&layout::last_sync_path(&dir))
            .ok()
            .and_then(|m| m.snapshot_id().map(str::to_string));
        listings.push(RepoListing {
            name: dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            snapshot_id,
        });
    }
    listings
}
