//! On-disk cache of compiled program binaries.
//!
//! Layout of the cache directory:
//!
//! ```text
//! kernel_cache_index.json   device fingerprint + one entry per composite key
//! <sha256(key)>.bin         program binary
//! ```
//!
//! Binaries are only handed back for the device fingerprint they were
//! saved with. Any mismatch, missing file or checksum failure is a cache
//! miss. Each entry also records the digest of the program payload it was
//! built from, so a restored binary is rebuilt once its source changes.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use std::io;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::program_store::{ProgramStore, composite_key, hash_hex};

const INDEX_FILE: &str = "kernel_cache_index.json";
const INDEX_VERSION: u32 = 2;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheIndex {
    version: u32,
    fingerprint: String,
    entries: BTreeMap<String, IndexEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexEntry {
    program_name: String,
    options: String,
    source_sha256: String,
    file: String,
    size: u64,
    sha256: String,
}

/// A binary read back from the cache, with the parts of its key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedProgram {
    pub program_name: String,
    pub options: String,
    pub source_hash: String,
    pub binary: Vec<u8>,
}

fn is_binary_file(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "bin")
}

fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err.into()),
        _ => Ok(()),
    }
}

/// Directory-backed binary cache.
#[derive(Debug, Clone)]
pub struct KernelCacheStore {
    dir: PathBuf,
}

impl KernelCacheStore {
    /// Open `dir`, creating it if needed.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn index_path(&self) -> PathBuf {
        self.dir.join(INDEX_FILE)
    }

    /// Write every compiled program in `store`, replacing the previous
    /// index, and delete binaries the new index no longer lists. Returns
    /// the number of binaries written.
    pub fn save(&self, fingerprint: &str, store: &ProgramStore) -> Result<usize> {
        let mut index =
            CacheIndex { version: INDEX_VERSION, fingerprint: fingerprint.to_owned(), entries: BTreeMap::new() };

        for (key, program) in store.all_compiled()? {
            let binary = match program.binary() {
                Ok(binary) => binary,
                Err(err) => {
                    warn!(%key, %err, "cannot read program binary; not persisting it");
                    continue;
                }
            };
            let file = format!("{}.bin", hash_hex(key.as_bytes()));
            fs::write(self.dir.join(&file), &binary)?;
            index.entries.insert(
                key,
                IndexEntry {
                    program_name: program.program_name().to_owned(),
                    options: program.options().to_owned(),
                    source_sha256: program.source_hash().to_owned(),
                    file,
                    size: binary.len() as u64,
                    sha256: hash_hex(&binary),
                },
            );
        }

        let tmp = self.dir.join(format!("{INDEX_FILE}.tmp"));
        fs::write(&tmp, serde_json::to_string_pretty(&index)?)?;
        fs::rename(&tmp, self.index_path())?;
        let removed = self.remove_orphans(&index)?;
        info!(dir = %self.dir.display(), entries = index.entries.len(), removed, "saved kernel cache");
        Ok(index.entries.len())
    }

    fn remove_orphans(&self, index: &CacheIndex) -> Result<usize> {
        let listed: BTreeSet<&str> = index.entries.values().map(|e| e.file.as_str()).collect();
        let mut removed = 0;
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let orphan = is_binary_file(&path)
                && path.file_name().and_then(|n| n.to_str()).is_some_and(|n| !listed.contains(n));
            if orphan {
                remove_if_present(&path)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn read_index(&self) -> Option<CacheIndex> {
        let path = self.index_path();
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(err) => {
                debug!(path = %path.display(), %err, "no kernel cache index");
                return None;
            }
        };
        match serde_json::from_str::<CacheIndex>(&text) {
            Ok(index) if index.version == INDEX_VERSION => Some(index),
            Ok(index) => {
                warn!(version = index.version, "unsupported kernel cache index version; ignoring cache");
                None
            }
            Err(err) => {
                warn!(%err, "corrupt kernel cache index; ignoring cache");
                None
            }
        }
    }

    fn read_entry(&self, key: &str, entry: &IndexEntry) -> Option<CachedProgram> {
        if composite_key(&entry.program_name, &entry.options) != key {
            warn!(%key, "kernel cache entry does not match its key; skipping");
            return None;
        }
        let binary = match fs::read(self.dir.join(&entry.file)) {
            Ok(binary) => binary,
            Err(err) => {
                warn!(%key, %err, "missing kernel cache binary; skipping");
                return None;
            }
        };
        if binary.len() as u64 != entry.size || hash_hex(&binary) != entry.sha256 {
            warn!(%key, "kernel cache binary failed integrity check; skipping");
            return None;
        }
        Some(CachedProgram {
            program_name: entry.program_name.clone(),
            options: entry.options.clone(),
            source_hash: entry.source_sha256.clone(),
            binary,
        })
    }

    /// Binaries saved for `fingerprint`, by composite key.
    ///
    /// `None` when there is no usable index or it was written for another
    /// device. Individual entries that fail verification are left out.
    pub fn load(&self, fingerprint: &str) -> Option<BTreeMap<String, CachedProgram>> {
        let index = self.read_index()?;
        if index.fingerprint != fingerprint {
            warn!(
                cached = %index.fingerprint,
                current = fingerprint,
                "kernel cache was written for a different device or driver; forcing a miss"
            );
            return None;
        }
        let programs: BTreeMap<_, _> = index
            .entries
            .iter()
            .filter_map(|(key, entry)| self.read_entry(key, entry).map(|p| (key.clone(), p)))
            .collect();
        debug!(loaded = programs.len(), indexed = index.entries.len(), "loaded kernel cache");
        Some(programs)
    }

    /// Remove the index and every binary it lists.
    pub fn clear(&self) -> Result<()> {
        if let Some(index) = self.read_index() {
            for entry in index.entries.values() {
                remove_if_present(&self.dir.join(&entry.file))?;
            }
        }
        remove_if_present(&self.index_path())
    }
}
