//! Keeps tick directories and tick logs bounded. Best-effort: nothing here
//! can fail a tick.

use crate::tick::{logs_dir, TICK_DIR_PREFIX};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, warn};
use walkdir::WalkDir;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Pruned {
    pub tick_dirs: usize,
    pub log_files: usize,
}

pub fn enforce(out_dir: &Path, max_tick_dirs: usize, max_log_files: usize) -> Pruned {
    let tick_dirs = list_entries(out_dir, |p, is_dir| is_dir && has_tick_prefix(p));
    let logs = list_entries(&logs_dir(out_dir), |p, is_dir| {
        !is_dir && has_tick_prefix(p) && p.extension().is_some_and(|e| e == "log")
    });
    let pruned = Pruned {
        tick_dirs: prune(tick_dirs, max_tick_dirs, |p| fs::remove_dir_all(p)),
        log_files: prune(logs, max_log_files, |p| fs::remove_file(p)),
    };
    if pruned.tick_dirs > 0 || pruned.log_files > 0 {
        debug!(
            tick_dirs = pruned.tick_dirs,
            log_files = pruned.log_files,
            "retention pruned"
        );
    }
    pruned
}

fn has_tick_prefix(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with(TICK_DIR_PREFIX))
}

struct Entry {
    path: PathBuf,
    created: SystemTime,
}

fn list_entries(dir: &Path, keep: impl Fn(&Path, bool) -> bool) -> Vec<Entry> {
    if !dir.is_dir() {
        return Vec::new();
    }
    WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| keep(e.path(), e.file_type().is_dir()))
        .map(|e| {
            let created = e
                .metadata()
                .ok()
                .and_then(|m| m.created().or_else(|_| m.modified()).ok())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            Entry {
                path: e.into_path(),
                created,
            }
        })
        .collect()
}

/// Ordering key from a tick name: the timestamp part, then the collision
/// suffix as a number so `-10` sorts after `-9`.
fn tick_key(path: &Path) -> (String, u64) {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let stem = name.strip_suffix(".log").unwrap_or(&name);
    match stem.rsplit_once('-') {
        Some((base, n)) => match n.parse::<u64>() {
            Ok(n) => (base.to_string(), n),
            Err(_) => (stem.to_string(), 0),
        },
        None => (stem.to_string(), 0),
    }
}

/// Sort newest first and delete everything past `keep`. Names embed the tick
/// timestamp, so they break ties between equal creation times.
fn prune(
    mut entries: Vec<Entry>,
    keep: usize,
    remove: impl Fn(&Path) -> std::io::Result<()>,
) -> usize {
    if entries.len() <= keep {
        return 0;
    }
    entries.sort_by(|a, b| {
        b.created
            .cmp(&a.created)
            .then_with(|| tick_key(&b.path).cmp(&tick_key(&a.path)))
    });
    let mut removed = 0;
    for entry in entries.iter().skip(keep) {
        match remove(&entry.path) {
            Ok(()) => removed += 1,
            Err(e) => warn!(path = %entry.path.display(), error = %e, "retention delete failed"),
        }
    }
    removed
}
