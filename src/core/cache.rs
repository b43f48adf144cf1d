//! Content-addressed check result cache.
//!
//! A key is the SHA-256 of the check name and the content hashes of its
//! scoped files (or the tree identity when the scope is empty), so a live hit is
//! always the result of running the same check on the same bytes. The TTL
//! only bounds growth and forces periodic re-verification of
//! environment-sensitive checks.
//!
//! One JSON record per key under `.phasegate/cache/`. Writes replace the
//! record atomically; concurrent writers of one key are last-write-wins.

use crate::core::error::PhasegateError;
use crate::core::glob;
use crate::core::store::write_atomic;
use crate::core::time;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

const KEY_DOMAIN: &str = "phasegate.cache.v1";
const MISSING_FILE_MARKER: &str = "<missing>";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub cache_key: String,
    pub check_name: String,
    pub exit_code: i32,
    pub written_at: String,
    pub ttl_hours: u64,
    pub source_files: Vec<String>,
    #[serde(default)]
    pub measurements: BTreeMap<String, f64>,
    #[serde(default)]
    pub detail: String,
}

impl CacheEntry {
    pub fn is_expired(&self, now_secs: u64) -> bool {
        let Some(written) = time::epoch_secs(&self.written_at) else {
            return true;
        };
        now_secs.saturating_sub(written) >= self.ttl_hours.saturating_mul(3600)
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub expired: usize,
    pub corrupt: usize,
    pub bytes: u64,
}

#[derive(Debug, Clone)]
pub struct ContentCache {
    dir: PathBuf,
    repo_root: PathBuf,
    ttl_hours: u64,
    commit_id: String,
}

impl ContentCache {
    /// `commit_id` keys checks that have no file scope. Callers fold any
    /// uncommitted state into it.
    pub fn new(dir: &Path, repo_root: &Path, ttl_hours: u64, commit_id: &str) -> Self {
        Self {
            dir: dir.to_path_buf(),
            repo_root: repo_root.to_path_buf(),
            ttl_hours,
            commit_id: commit_id.to_string(),
        }
    }

    pub fn ttl_hours(&self) -> u64 {
        self.ttl_hours
    }

    /// Content identity of `(name, files)`.
    pub fn key(&self, name: &str, files: &[String]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(KEY_DOMAIN.as_bytes());
        hasher.update([0]);
        hasher.update(name.as_bytes());
        hasher.update([0]);

        let mut sorted: Vec<&String> = files.iter().collect();
        sorted.sort();
        sorted.dedup();

        if sorted.is_empty() {
            hasher.update(b"commit");
            hasher.update([0]);
            hasher.update(self.commit_id.as_bytes());
        } else {
            for path in sorted {
                hasher.update(path.as_bytes());
                hasher.update([0]);
                hasher.update(self.file_digest(path).as_bytes());
                hasher.update([0]);
            }
        }
        hex::encode(hasher.finalize())
    }

    fn file_digest(&self, rel: &str) -> String {
        match fs::read(self.repo_root.join(rel)) {
            Ok(bytes) => hex::encode(Sha256::digest(&bytes)),
            // Deleted files are part of the change too.
            Err(_) => MISSING_FILE_MARKER.to_string(),
        }
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }

    /// True iff a live entry exists for `(name, files)`.
    pub fn check(&self, name: &str, files: &[String]) -> bool {
        self.lookup(name, files).is_some()
    }

    pub fn lookup(&self, name: &str, files: &[String]) -> Option<CacheEntry> {
        self.get(&self.key(name, files), time::now_secs())
    }

    /// Live entry for `(name, files)` as seen at `now_secs`.
    pub fn lookup_at(&self, name: &str, files: &[String], now_secs: u64) -> Option<CacheEntry> {
        self.get(&self.key(name, files), now_secs)
    }

    /// Fetch by precomputed key. Expired entries are deleted; corrupt ones
    /// are misses.
    pub fn get(&self, key: &str, now_secs: u64) -> Option<CacheEntry> {
        let path = self.entry_path(key);
        if !path.exists() {
            return None;
        }
        let entry = match read_entry(&path) {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "unreadable cache entry treated as miss");
                return None;
            }
        };
        if entry.cache_key != key {
            tracing::warn!(path = %path.display(), "cache entry key mismatch treated as miss");
            return None;
        }
        if entry.is_expired(now_secs) {
            tracing::debug!(check = %entry.check_name, "cache entry expired");
            let _ = fs::remove_file(&path);
            return None;
        }
        Some(entry)
    }

    pub fn write(
        &self,
        name: &str,
        exit_code: i32,
        files: &[String],
    ) -> Result<CacheEntry, PhasegateError> {
        let key = self.key(name, files);
        self.put(&key, name, exit_code, files, BTreeMap::new(), "")
    }

    /// Store a result under a key computed before the check ran.
    pub fn put(
        &self,
        key: &str,
        name: &str,
        exit_code: i32,
        files: &[String],
        measurements: BTreeMap<String, f64>,
        detail: &str,
    ) -> Result<CacheEntry, PhasegateError> {
        let mut source_files = files.to_vec();
        source_files.sort();
        source_files.dedup();
        let entry = CacheEntry {
            cache_key: key.to_string(),
            check_name: name.to_string(),
            exit_code,
            written_at: time::now_epoch_z(),
            ttl_hours: self.ttl_hours,
            source_files,
            measurements,
            detail: detail.to_string(),
        };
        let bytes = serde_json::to_vec_pretty(&entry)?;
        write_atomic(&self.entry_path(key), &bytes)?;
        Ok(entry)
    }

    /// Remove every entry whose recorded source files match `pattern`.
    pub fn invalidate(&self, pattern: &str) -> Result<usize, PhasegateError> {
        let matcher = glob::glob_to_regex(pattern).map_err(|e| {
            PhasegateError::ValidationError(format!("invalid pattern '{}': {}", pattern, e))
        })?;
        let mut removed = 0;
        for path in self.entry_paths()? {
            let Ok(entry) = read_entry(&path) else {
                continue;
            };
            if entry.source_files.iter().any(|f| matcher.is_match(f)) {
                fs::remove_file(&path)?;
                removed += 1;
            }
        }
        tracing::info!(pattern, removed, "cache invalidated");
        Ok(removed)
    }

    /// Delete expired and unreadable entries.
    pub fn prune(&self) -> Result<usize, PhasegateError> {
        let now = time::now_secs();
        let mut removed = 0;
        for path in self.entry_paths()? {
            let stale = match read_entry(&path) {
                Ok(entry) => entry.is_expired(now),
                Err(_) => true,
            };
            if stale {
                fs::remove_file(&path)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub fn clear(&self) -> Result<usize, PhasegateError> {
        let paths = self.entry_paths()?;
        for path in &paths {
            fs::remove_file(path)?;
        }
        Ok(paths.len())
    }

    pub fn stats(&self) -> Result<CacheStats, PhasegateError> {
        let now = time::now_secs();
        let mut stats = CacheStats::default();
        for path in self.entry_paths()? {
            stats.entries += 1;
            stats.bytes += fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
            match read_entry(&path) {
                Ok(entry) if entry.is_expired(now) => stats.expired += 1,
                Ok(_) => {}
                Err(_) => stats.corrupt += 1,
            }
        }
        Ok(stats)
    }

    fn entry_paths(&self) -> Result<Vec<PathBuf>, PhasegateError> {
        if !self.dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut paths = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|e| e == "json") {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }
}

fn read_entry(path: &Path) -> Result<CacheEntry, String> {
    let raw = fs::read_to_string(path).map_err(|e| e.to_string())?;
    serde_json::from_str(&raw).map_err(|e| e.to_string())
}
