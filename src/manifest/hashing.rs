//! Content and manifest hashing.
//!
//! All hashes are 64-bit xxh3 rendered as 16 lowercase hex digits. File
//! content streams through the hasher in 8 KiB chunks; the entry map folds
//! into a single running hash over canonical tab-delimited lines so the
//! result is stable across JSON serializations that preserve entry order.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use xxhash_rust::xxh3::Xxh3;

use super::entry::{mtime_millis, ManifestEntry};

/// Chunk size for streaming file hashes.
pub const HASH_CHUNK_SIZE: usize = 8 * 1024;

fn hex64(value: u64) -> String {
    format!("{:016x}", value)
}

/// Hash a file's content by streaming it through xxh3_64.
pub fn hash_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Xxh3::new();
    let mut buf = [0u8; HASH_CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex64(hasher.digest()))
}

/// Canonical line for one entry, folded into the entries hash.
///
/// Files: `path\tfile\t<filesize>\t<mtime_ms>\t<hash>\n`
/// Links: `path\tlink\t<reference>\n`
///
/// The mtime folds as epoch milliseconds so the hash does not depend on how
/// the offset was spelled when the manifest was serialized.
pub fn canonical_entry_line(entry: &ManifestEntry) -> String {
    match entry {
        ManifestEntry::File(f) => {
            let ms = mtime_millis(&f.mtime).unwrap_or(0);
            format!("{}\tfile\t{}\t{}\t{}\n", f.path, f.filesize, ms, f.hash)
        }
        ManifestEntry::Link(l) => format!("{}\tlink\t{}\n", l.path, l.reference),
    }
}

/// Fold entries, in insertion order, into the stable entries hash.
pub fn entries_hash<'a, I>(entries: I) -> String
where
    I: IntoIterator<Item = &'a ManifestEntry>,
{
    let mut hasher = Xxh3::new();
    for entry in entries {
        hasher.update(canonical_entry_line(entry).as_bytes());
    }
    hex64(hasher.digest())
}

/// Deterministic snapshot hash linking a snapshot to its parent.
///
/// Input is `entries_hash\tmessage\tprev_hash` with an empty string standing
/// in for the missing parent of the first snapshot.
pub fn snapshot_hash(entries_hash: &str, message: &str, prev_snapshot_hash: Option<&str>) -> String {
    let mut hasher = Xxh3::new();
    hasher.update(entries_hash.as_bytes());
    hasher.update(b"\t");
    hasher.update(message.as_bytes());
    hasher.update(b"\t");
    hasher.update(prev_snapshot_hash.unwrap_or("").as_bytes());
    hex64(hasher.digest())
}
