//! Content-addressed download cache (component C, §4.C).
//!
//! A single directory holds `policy.yaml` (re-read on every [`Store::open`]),
//! an append-only [`journal`], and a blob tree sharded by key prefix. All
//! mutating operations serialise through an in-process mutex; a single
//! process additionally holds an exclusive `flock` on the directory for the
//! duration of a build.

pub mod entry;
pub mod eviction;
pub mod journal;
pub mod key;

use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use parking_lot::RwLock;

pub use entry::CacheEntry;

use crate::policy::{Class, EffectivePolicy, PolicyFile};

/// Errors raised by the cache store.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Underlying filesystem operation failed.
    #[error("cache I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// The journal could not be read or written.
    #[error(transparent)]
    Journal(#[from] journal::Error),
    /// `policy.yaml` failed to parse.
    #[error("invalid policy.yaml: {0}")]
    InvalidPolicy(#[from] serde_yaml::Error),
    /// A policy resolution (filter regex, size/duration string) failed.
    #[error(transparent)]
    Policy(#[from] crate::policy::Error),
    /// Another process already holds the cache lock.
    #[error("cache directory is locked by another build")]
    Busy,
}

/// Outcome of a [`Store::lookup`].
#[derive(Debug, Clone)]
pub enum LookupResult {
    /// A fresh entry is present.
    Hit(CacheEntry),
    /// An entry is present but should be revalidated before reuse.
    StaleHit(CacheEntry),
    /// No entry for this key.
    Miss,
    /// Policy excludes this source from caching.
    Ignored,
}

/// Why an [`Store::admit`] call was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    /// Policy disables caching for this entry.
    Disabled,
    /// No room could be freed even after evicting every eligible candidate.
    NoRoom,
}

/// Outcome of a [`Store::admit`].
#[derive(Debug, Clone)]
pub enum AdmitOutcome {
    /// The blob was committed and is now tracked.
    Admitted(CacheEntry),
    /// Admission was refused; the caller's temp blob is left untouched.
    Rejected(RejectReason),
}

/// An open cache directory: policy, journal, in-memory index, and file lock.
#[derive(Debug)]
pub struct Store {
    root: PathBuf,
    policy: PolicyFile,
    index: RwLock<HashMap<String, CacheEntry>>,
    journal: parking_lot::Mutex<journal::Journal>,
    _lock: File,
}

impl Store {
    /// Opens (creating directory structure as needed) the cache at `root`,
    /// acquiring the exclusive build lock.
    ///
    /// # Errors
    /// Returns [`Error::Busy`] if another process holds the lock.
    pub fn open(root: &Path) -> Result<Self, Error> {
        fs::create_dir_all(root.join("blobs"))?;
        fs::create_dir_all(root.join("meta"))?;

        let policy_path = root.join("policy.yaml");
        let policy = if policy_path.exists() {
            serde_yaml::from_str(&fs::read_to_string(&policy_path)?)?
        } else {
            PolicyFile::default()
        };

        let lock_path = root.join(".lock");
        let lock_file = File::options()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)?;
        nix::fcntl::flock(&lock_file, nix::fcntl::FlockArg::LockExclusiveNonblock)
            .map_err(|_| Error::Busy)?;

        let journal_path = root.join("index.journal");
        let mut index = journal::Journal::replay(&journal_path)?;
        let mut journal = journal::Journal::open(&journal_path)?;
        reconcile_blobs(root, &mut index, &mut journal)?;

        Ok(Self {
            root: root.to_owned(),
            policy,
            index: RwLock::new(index),
            journal: parking_lot::Mutex::new(journal),
            _lock: lock_file,
        })
    }

    /// Resolves the effective policy that would govern `source` in `class`.
    pub fn policy_for(&self, class: Class, source: &str) -> Result<EffectivePolicy, Error> {
        Ok(self.policy.resolve(class, source)?)
    }

    /// Looks up `source`'s cache entry, touching `last_used` on a hit.
    pub fn lookup(&self, class: Class, source: &str) -> Result<LookupResult, Error> {
        let policy = self.policy_for(class, source)?;
        if policy.is_disabled() {
            return Ok(LookupResult::Ignored);
        }

        let key = key::digest(&key::canonicalize(source));
        let found = self.index.read().get(&key).cloned();
        let Some(entry) = found else {
            return Ok(LookupResult::Miss);
        };

        let now = chrono::Utc::now();
        self.index.write().entry(key.clone()).and_modify(|e| e.last_used = now);
        self.journal.lock().append(&journal::Record::Touched {
            key,
            last_used: now,
            checked_on: None,
        })?;

        let stale = policy
            .max_age
            .is_some_and(|max_age| (now - entry.checked_on).num_seconds() > max_age);
        Ok(if stale {
            LookupResult::StaleHit(entry)
        } else {
            LookupResult::Hit(entry)
        })
    }

    /// Marks `key` as revalidated as of now, advancing `checked_on` without
    /// disturbing `last_used`. A no-op if `key` is no longer present (e.g.
    /// evicted between the lookup and the revalidation).
    pub fn mark_checked(&self, key: &str) -> Result<(), Error> {
        let now = chrono::Utc::now();
        let last_used = {
            let mut index = self.index.write();
            let Some(entry) = index.get_mut(key) else {
                return Ok(());
            };
            entry.checked_on = now;
            entry.last_used
        };
        self.journal.lock().append(&journal::Record::Touched {
            key: key.to_owned(),
            last_used,
            checked_on: Some(now),
        })?;
        Ok(())
    }

    /// Admits a blob already staged at `tmp_blob` into the cache, running
    /// eviction first if necessary to make room.
    #[allow(clippy::too_many_arguments)]
    pub fn admit(
        &self,
        class: Class,
        source: &str,
        tmp_blob: &Path,
        size: u64,
        checksum: Option<String>,
        identifier: Option<String>,
        version: Option<String>,
    ) -> Result<AdmitOutcome, Error> {
        let policy = self.policy_for(class, source)?;
        if policy.is_disabled() {
            return Ok(AdmitOutcome::Rejected(RejectReason::Disabled));
        }

        let canonical = key::canonicalize(source);
        let key = key::digest(&canonical);

        let class_candidates: Vec<CacheEntry> = self
            .index
            .read()
            .values()
            .filter(|e| e.class == class)
            .cloned()
            .collect();
        let total_size: u64 = class_candidates.iter().map(|e| e.size).sum();

        let mut victims = eviction::hard_cap_victims(&class_candidates, &policy);
        let Some(extra) =
            eviction::capacity_victims(&class_candidates, &victims, &policy, total_size, size)
        else {
            return Ok(AdmitOutcome::Rejected(RejectReason::NoRoom));
        };
        victims.extend(extra);

        if policy.keep_identified_versions {
            if let (Some(ident), Some(ver)) = (&identifier, &version) {
                let host = url::Url::parse(source)
                    .ok()
                    .and_then(|u| u.host_str().map(str::to_owned))
                    .unwrap_or_default();
                victims.extend(eviction::identified_version_victims(
                    &class_candidates,
                    ident,
                    &host,
                    ver,
                ));
            }
        }
        victims.sort_unstable();
        victims.dedup();

        for victim in &victims {
            self.remove_locked(victim)?;
        }

        let now = chrono::Utc::now();
        let entry = CacheEntry {
            key: key.clone(),
            class,
            source: canonical,
            identifier,
            version,
            size,
            checksum,
            added_on: now,
            last_used: now,
            checked_on: now,
        };

        let dest = key::blob_path(&self.root, &key);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(tmp_blob, &dest)?;
        let f = File::open(&dest)?;
        f.sync_all()?;

        self.journal.lock().append(&journal::Record::Added(entry.clone()))?;
        self.index.write().insert(key, entry.clone());

        Ok(AdmitOutcome::Admitted(entry))
    }

    /// Forcibly removes `key`, deleting its blob and journalling the removal.
    pub fn invalidate(&self, key: &str) -> Result<(), Error> {
        self.remove_locked(key)
    }

    fn remove_locked(&self, key: &str) -> Result<(), Error> {
        let existed = self.index.write().remove(key);
        if existed.is_some() {
            let blob = key::blob_path(&self.root, key);
            if blob.exists() {
                fs::remove_file(&blob)?;
            }
            self.journal.lock().append(&journal::Record::Removed {
                key: key.to_owned(),
            })?;
        }
        Ok(())
    }

    /// Runs eviction for every class against its own `max_age`/`max_num`/
    /// `max_size`, without any pending admission.
    pub fn purge(&self) -> Result<(), Error> {
        for class in [Class::OciImages, Class::Files] {
            let candidates: Vec<CacheEntry> = self
                .index
                .read()
                .values()
                .filter(|e| e.class == class)
                .cloned()
                .collect();
            if candidates.is_empty() {
                continue;
            }
            // Use the class-root policy (no source) as the purge-wide policy.
            let policy = self.policy_for(class, "")?;
            let total_size: u64 = candidates.iter().map(|e| e.size).sum();
            let mut victims = eviction::hard_cap_victims(&candidates, &policy);
            if let Some(extra) =
                eviction::capacity_victims(&candidates, &victims, &policy, total_size, 0)
            {
                victims.extend(extra);
            }
            victims.sort_unstable();
            victims.dedup();
            for v in victims {
                self.remove_locked(&v)?;
            }
        }
        Ok(())
    }

    /// Rewrites the journal from the current in-memory snapshot.
    pub fn compact(&self) -> Result<(), Error> {
        let snapshot = self.index.read().clone();
        self.journal.lock().compact(&snapshot)?;
        Ok(())
    }

    /// The cache root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Reconciles the replayed index against what is actually on disk
/// (§4.C Crash-safety): an entry whose blob went missing (crash between
/// rename and journal fsync, or manual tampering) is dropped from the index
/// and journalled as removed; a blob with no matching entry (crash before
/// the `Added` record reached disk) is deleted outright.
fn reconcile_blobs(
    root: &Path,
    index: &mut HashMap<String, CacheEntry>,
    journal: &mut journal::Journal,
) -> Result<(), Error> {
    let blobs_dir = root.join("blobs");
    let on_disk: HashSet<String> = walkdir::WalkDir::new(&blobs_dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.file_name().to_str().map(str::to_owned))
        .collect();

    let missing_blobs: Vec<String> = index
        .keys()
        .filter(|key| !on_disk.contains(*key))
        .cloned()
        .collect();
    for key in missing_blobs {
        index.remove(&key);
        journal.append(&journal::Record::Removed { key })?;
    }

    for name in on_disk {
        if !index.contains_key(&name) {
            let _ = fs::remove_file(key::blob_path(root, &name));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admit_then_lookup_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();

        let tmp = dir.path().join("staged.bin");
        fs::write(&tmp, b"hello").unwrap();

        let outcome = store
            .admit(Class::Files, "https://example.com/a.bin", &tmp, 5, None, None, None)
            .unwrap();
        assert!(matches!(outcome, AdmitOutcome::Admitted(_)));

        let looked = store.lookup(Class::Files, "https://example.com/a.bin").unwrap();
        assert!(matches!(looked, LookupResult::Hit(_)));
    }

    #[test]
    fn second_open_is_busy() {
        let dir = tempfile::tempdir().unwrap();
        let _first = Store::open(dir.path()).unwrap();
        let second = Store::open(dir.path());
        assert!(matches!(second, Err(Error::Busy)));
    }

    #[test]
    fn disabled_policy_yields_ignored_lookup() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("policy.yaml"),
            "enabled: true\nfiles:\n  enabled: false\n",
        )
        .unwrap();
        let store = Store::open(dir.path()).unwrap();
        let looked = store.lookup(Class::Files, "https://example.com/a.bin").unwrap();
        assert!(matches!(looked, LookupResult::Ignored));
    }

    #[test]
    fn admit_rejected_when_no_room() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("policy.yaml"), "max_size: 10\n").unwrap();
        let store = Store::open(dir.path()).unwrap();
        let tmp = dir.path().join("staged.bin");
        fs::write(&tmp, vec![0u8; 100]).unwrap();
        let outcome = store
            .admit(Class::Files, "https://example.com/a.bin", &tmp, 100, None, None, None)
            .unwrap();
        assert!(matches!(
            outcome,
            AdmitOutcome::Rejected(RejectReason::NoRoom)
        ));
    }

    #[test]
    fn invalidate_removes_entry_and_blob() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let tmp = dir.path().join("staged.bin");
        fs::write(&tmp, b"hello").unwrap();
        let AdmitOutcome::Admitted(entry) = store
            .admit(Class::Files, "https://example.com/a.bin", &tmp, 5, None, None, None)
            .unwrap()
        else {
            panic!("expected admission");
        };
        store.invalidate(&entry.key).unwrap();
        assert!(!entry.blob_path(store.root()).exists());
        let looked = store.lookup(Class::Files, "https://example.com/a.bin").unwrap();
        assert!(matches!(looked, LookupResult::Miss));
    }

    #[test]
    fn mark_checked_advances_checked_on_without_touching_last_used() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let tmp = dir.path().join("staged.bin");
        fs::write(&tmp, b"hello").unwrap();
        let AdmitOutcome::Admitted(entry) = store
            .admit(Class::Files, "https://example.com/a.bin", &tmp, 5, None, None, None)
            .unwrap()
        else {
            panic!("expected admission");
        };
        let original_last_used = entry.last_used;

        store.mark_checked(&entry.key).unwrap();

        let LookupResult::Hit(refreshed) =
            store.lookup(Class::Files, "https://example.com/a.bin").unwrap()
        else {
            panic!("expected a hit");
        };
        assert!(refreshed.checked_on > entry.checked_on);
        assert_eq!(refreshed.last_used, original_last_used);
    }

    #[test]
    fn reopen_reaps_orphan_blob_and_drops_entry_for_missing_blob() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = Store::open(dir.path()).unwrap();
            let tmp = dir.path().join("staged.bin");
            fs::write(&tmp, b"hello").unwrap();
            store
                .admit(Class::Files, "https://example.com/a.bin", &tmp, 5, None, None, None)
                .unwrap();
        }

        // An orphan blob with no journal record at all.
        let orphan_path = key::blob_path(dir.path(), "orphan-key-0123456789");
        fs::create_dir_all(orphan_path.parent().unwrap()).unwrap();
        fs::write(&orphan_path, b"stray").unwrap();

        let store = Store::open(dir.path()).unwrap();
        let looked = store.lookup(Class::Files, "https://example.com/a.bin").unwrap();
        assert!(matches!(looked, LookupResult::Hit(_)));
        assert!(!orphan_path.exists());
    }

    #[test]
    fn reopen_drops_entry_whose_blob_vanished() {
        let dir = tempfile::tempdir().unwrap();
        let blob_path = {
            let store = Store::open(dir.path()).unwrap();
            let tmp = dir.path().join("staged.bin");
            fs::write(&tmp, b"hello").unwrap();
            let AdmitOutcome::Admitted(entry) = store
                .admit(Class::Files, "https://example.com/a.bin", &tmp, 5, None, None, None)
                .unwrap()
            else {
                panic!("expected admission");
            };
            entry.blob_path(dir.path())
        };
        fs::remove_file(&blob_path).unwrap();

        let store = Store::open(dir.path()).unwrap();
        let looked = store.lookup(Class::Files, "https://example.com/a.bin").unwrap();
        assert!(matches!(looked, LookupResult::Miss));
    }
}
