//! Reversible quarantine for soft-deleted files.
//!
//! A soft delete moves the target (not a copy) under the trash root and
//! records it in a JSON index keyed by restore token. Restore moves the
//! content back after checking the original path is free or holds
//! identical bytes; purge drops entries past their TTL. Restores and
//! purges may race: a per-token claim decides the winner, so a purge
//! never removes an entry mid-restore.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use time::OffsetDateTime;

use agentwarden_core::ids::RestoreToken;

#[derive(Debug, Error)]
pub enum RestoreError {
    #[error("unknown or already used restore token")]
    NotFound,
    #[error("original path {0} now holds different content")]
    Conflict(PathBuf),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrashEntry {
    pub token: RestoreToken,
    pub original_path: PathBuf,
    pub stored_path: PathBuf,
    pub deleted_at: OffsetDateTime,
    pub expires_at: OffsetDateTime,
    pub size_bytes: u64,
    pub content_sha256: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct TrashIndex {
    entries: HashMap<RestoreToken, TrashEntry>,
}

impl TrashIndex {
    fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = fs::read_to_string(path)
            .with_context(|| format!("read trash index {}", path.display()))?;
        let index = serde_json::from_str(&contents).context("parse trash index JSON")?;
        Ok(index)
    }

    fn save(&self, path: &Path) -> Result<()> {
        let contents = serde_json::to_string_pretty(self).context("render trash index JSON")?;
        fs::write(path, contents)
            .with_context(|| format!("write trash index {}", path.display()))?;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Inner {
    index: TrashIndex,
    /// Tokens with a restore or purge removal in flight.
    in_flight: HashSet<RestoreToken>,
    /// Bumped on every index mutation; persist() re-snapshots until the
    /// write reflects the generation it started from.
    generation: u64,
}

#[derive(Debug)]
pub struct TrashStore {
    objects_dir: PathBuf,
    index_path: PathBuf,
    ttl: Duration,
    inner: Mutex<Inner>,
}

impl TrashStore {
    /// Opens (or creates) the trash area and reconciles the index with
    /// what is actually on disk: an entry exists iff its object exists.
    pub fn open(root: &Path, ttl_days: u32) -> Result<Self> {
        let objects_dir = root.join("objects");
        fs::create_dir_all(&objects_dir)
            .with_context(|| format!("create trash dir {}", objects_dir.display()))?;
        let index_path = root.join("index.json");
        let mut index = TrashIndex::load(&index_path)?;

        let before = index.entries.len();
        index
            .entries
            .retain(|_, entry| entry.stored_path.is_file());
        for object in fs::read_dir(&objects_dir)? {
            let object = object?;
            let known = index
                .entries
                .values()
                .any(|entry| entry.stored_path == object.path());
            if !known {
                // Orphan from an interrupted quarantine; nothing can
                // restore it, so reclaim the space.
                let _ = fs::remove_file(object.path());
            }
        }
        if index.entries.len() != before {
            index.save(&index_path)?;
        }

        Ok(Self {
            objects_dir,
            index_path,
            ttl: Duration::from_secs(u64::from(ttl_days) * 24 * 60 * 60),
            inner: Mutex::new(Inner {
                index,
                in_flight: HashSet::new(),
                generation: 0,
            }),
        })
    }

    /// Moves `original` into the trash area and returns its entry. The
    /// index is written after the content move, so a crash in between
    /// leaves an orphan object that open() reclaims, never a dangling
    /// entry.
    pub fn quarantine(&self, original: &Path) -> Result<TrashEntry> {
        let metadata = fs::metadata(original)
            .with_context(|| format!("stat quarantine target {}", original.display()))?;
        if !metadata.is_file() {
            anyhow::bail!(
                "quarantine target {} is not a regular file",
                original.display()
            );
        }
        let content_sha256 = hash_file(original)?;
        let token = RestoreToken::new();
        let stored_path = self.objects_dir.join(token.to_string());
        move_file(original, &stored_path)?;

        let deleted_at = OffsetDateTime::now_utc();
        let entry = TrashEntry {
            token,
            original_path: original.to_path_buf(),
            stored_path,
            deleted_at,
            expires_at: deleted_at + self.ttl,
            size_bytes: metadata.len(),
            content_sha256,
        };

        {
            let mut inner = self.lock_inner()?;
            inner.index.entries.insert(token, entry.clone());
            inner.generation += 1;
        }
        self.persist()?;
        Ok(entry)
    }

    /// Moves the content back to its original path and consumes the
    /// token. A path occupied by different content is a `Conflict` and
    /// leaves the entry intact; identical content is overwritten.
    pub fn restore(&self, token: RestoreToken) -> Result<PathBuf, RestoreError> {
        let entry = {
            let mut inner = self.lock_inner()?;
            if !inner.in_flight.insert(token) {
                // A purge is removing this token right now; it loses no
                // data, so the restore simply loses the race.
                return Err(RestoreError::NotFound);
            }
            match inner.index.entries.get(&token) {
                Some(entry) => entry.clone(),
                None => {
                    inner.in_flight.remove(&token);
                    return Err(RestoreError::NotFound);
                }
            }
        };

        if entry.original_path.exists() {
            let occupant = hash_file(&entry.original_path);
            match occupant {
                Ok(sha) if sha == entry.content_sha256 => {}
                Ok(_) => {
                    self.release(token);
                    return Err(RestoreError::Conflict(entry.original_path));
                }
                Err(err) => {
                    self.release(token);
                    return Err(RestoreError::Other(err));
                }
            }
        }

        if let Err(err) = move_file(&entry.stored_path, &entry.original_path) {
            self.release(token);
            return Err(RestoreError::Other(err));
        }

        {
            let mut inner = self.lock_inner()?;
            inner.index.entries.remove(&token);
            inner.in_flight.remove(&token);
            inner.generation += 1;
        }
        self.persist()?;
        Ok(entry.original_path)
    }

    /// Removes entries past their deadline and their stored content.
    /// `older_than` overrides the per-entry TTL with an age measured
    /// from deletion time. Safe to call repeatedly and concurrently
    /// with restores.
    pub fn purge(&self, older_than: Option<Duration>) -> Result<u32> {
        let now = OffsetDateTime::now_utc();
        let expired: Vec<RestoreToken> = {
            let inner = self.lock_inner()?;
            inner
                .index
                .entries
                .values()
                .filter(|entry| match older_than {
                    Some(age) => now - entry.deleted_at >= age,
                    None => now >= entry.expires_at,
                })
                .map(|entry| entry.token)
                .collect()
        };

        let mut removed = 0u32;
        for token in expired {
            let stored_path = {
                let mut inner = self.lock_inner()?;
                if !inner.in_flight.insert(token) {
                    // Restore in progress; leave the entry to it.
                    continue;
                }
                match inner.index.entries.get(&token) {
                    Some(entry) => entry.stored_path.clone(),
                    None => {
                        inner.in_flight.remove(&token);
                        continue;
                    }
                }
            };

            match fs::remove_file(&stored_path) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    self.release(token);
                    return Err(err).with_context(|| {
                        format!("remove quarantined object {}", stored_path.display())
                    });
                }
            }

            {
                let mut inner = self.lock_inner()?;
                inner.index.entries.remove(&token);
                inner.in_flight.remove(&token);
                inner.generation += 1;
            }
            self.persist()?;
            removed += 1;
        }
        Ok(removed)
    }

    /// Entries newest first.
    pub fn list(&self) -> Result<Vec<TrashEntry>> {
        let inner = self.lock_inner()?;
        let mut entries: Vec<TrashEntry> = inner.index.entries.values().cloned().collect();
        entries.sort_by(|a, b| b.deleted_at.cmp(&a.deleted_at));
        Ok(entries)
    }

    pub fn len(&self) -> usize {
        self.lock_inner().map(|inner| inner.index.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Writes the index to disk with the lock released: the snapshot is
    /// serialized inside the critical section, the write happens outside
    /// it. A writer that raced a newer mutation re-snapshots, so the
    /// file never regresses behind the in-memory state.
    fn persist(&self) -> Result<()> {
        loop {
            let (contents, generation) = {
                let inner = self.lock_inner()?;
                let contents = serde_json::to_string_pretty(&inner.index)
                    .context("render trash index JSON")?;
                (contents, inner.generation)
            };
            fs::write(&self.index_path, contents)
                .with_context(|| format!("write trash index {}", self.index_path.display()))?;
            if self.lock_inner()?.generation == generation {
                return Ok(());
            }
        }
    }

    fn lock_inner(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| anyhow::anyhow!("trash index lock poisoned"))
    }

    fn release(&self, token: RestoreToken) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.in_flight.remove(&token);
        }
    }
}

/// Rename when possible; across filesystems fall back to copy+unlink.
fn move_file(from: &Path, to: &Path) -> Result<()> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create dir {}", parent.display()))?;
    }
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(err) if err.raw_os_error() == Some(libc::EXDEV) => {
            fs::copy(from, to)
                .with_context(|| format!("copy {} to {}", from.display(), to.display()))?;
            fs::remove_file(from)
                .with_context(|| format!("remove {} after copy", from.display()))?;
            Ok(())
        }
        Err(err) => Err(err)
            .with_context(|| format!("move {} to {}", from.display(), to.display())),
    }
}

fn hash_file(path: &Path) -> Result<String> {
    let mut file =
        fs::File::open(path).with_context(|| format!("open {} for hashing", path.display()))?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)
        .with_context(|| format!("hash {}", path.display()))?;
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct Fixture {
        _workspace: TempDir,
        _trash: TempDir,
        store: TrashStore,
        file: PathBuf,
    }

    fn fixture(ttl_days: u32) -> Fixture {
        let workspace = TempDir::new().unwrap();
        let trash = TempDir::new().unwrap();
        let file = workspace.path().join("notes.txt");
        fs::write(&file, b"original content").unwrap();
        let store = TrashStore::open(trash.path(), ttl_days).unwrap();
        Fixture {
            _workspace: workspace,
            _trash: trash,
            store,
            file,
        }
    }

    #[test]
    fn soft_delete_round_trip_restores_identical_bytes() {
        let fx = fixture(14);
        let entry = fx.store.quarantine(&fx.file).unwrap();
        assert!(!fx.file.exists());
        assert!(entry.stored_path.is_file());

        let restored = fx.store.restore(entry.token).unwrap();
        assert_eq!(restored, fx.file);
        assert_eq!(fs::read(&fx.file).unwrap(), b"original content");
        assert!(fx.store.is_empty());
    }

    #[test]
    fn a_token_is_single_use() {
        let fx = fixture(14);
        let entry = fx.store.quarantine(&fx.file).unwrap();
        fx.store.restore(entry.token).unwrap();
        // Consumed: the file is back but must not restore twice.
        fs::remove_file(&fx.file).unwrap();
        let err = fx.store.restore(entry.token).unwrap_err();
        assert!(matches!(err, RestoreError::NotFound));
    }

    #[test]
    fn restore_onto_different_content_is_a_conflict() {
        let fx = fixture(14);
        let entry = fx.store.quarantine(&fx.file).unwrap();
        fs::write(&fx.file, b"someone else wrote this").unwrap();

        let err = fx.store.restore(entry.token).unwrap_err();
        assert!(matches!(err, RestoreError::Conflict(_)));
        // The occupant and the entry both survive the failed restore.
        assert_eq!(fs::read(&fx.file).unwrap(), b"someone else wrote this");
        assert_eq!(fx.store.len(), 1);

        // Clearing the conflict makes the same token usable again.
        fs::remove_file(&fx.file).unwrap();
        fx.store.restore(entry.token).unwrap();
        assert_eq!(fs::read(&fx.file).unwrap(), b"original content");
    }

    #[test]
    fn restore_onto_identical_content_succeeds() {
        let fx = fixture(14);
        let entry = fx.store.quarantine(&fx.file).unwrap();
        fs::write(&fx.file, b"original content").unwrap();
        fx.store.restore(entry.token).unwrap();
        assert_eq!(fs::read(&fx.file).unwrap(), b"original content");
    }

    #[test]
    fn purge_is_idempotent_and_respects_ttl() {
        let fx = fixture(0); // entries expire immediately
        let entry = fx.store.quarantine(&fx.file).unwrap();

        assert_eq!(fx.store.purge(None).unwrap(), 1);
        assert!(!entry.stored_path.exists());
        assert_eq!(fx.store.purge(None).unwrap(), 0);

        let err = fx.store.restore(entry.token).unwrap_err();
        assert!(matches!(err, RestoreError::NotFound));
    }

    #[test]
    fn unexpired_entries_survive_a_purge() {
        let fx = fixture(14);
        fx.store.quarantine(&fx.file).unwrap();
        assert_eq!(fx.store.purge(None).unwrap(), 0);
        assert_eq!(fx.store.len(), 1);

        // An explicit age override still takes them.
        assert_eq!(fx.store.purge(Some(Duration::ZERO)).unwrap(), 1);
        assert!(fx.store.is_empty());
    }

    #[test]
    fn index_persists_across_reopen() {
        let workspace = TempDir::new().unwrap();
        let trash = TempDir::new().unwrap();
        let file = workspace.path().join("keep.txt");
        fs::write(&file, b"payload").unwrap();

        let token = {
            let store = TrashStore::open(trash.path(), 14).unwrap();
            store.quarantine(&file).unwrap().token
        };

        let store = TrashStore::open(trash.path(), 14).unwrap();
        assert_eq!(store.len(), 1);
        store.restore(token).unwrap();
        assert_eq!(fs::read(&file).unwrap(), b"payload");
    }

    #[test]
    fn reopen_drops_entries_whose_object_vanished() {
        let workspace = TempDir::new().unwrap();
        let trash = TempDir::new().unwrap();
        let file = workspace.path().join("gone.txt");
        fs::write(&file, b"payload").unwrap();

        let entry = {
            let store = TrashStore::open(trash.path(), 14).unwrap();
            store.quarantine(&file).unwrap()
        };
        fs::remove_file(&entry.stored_path).unwrap();

        let store = TrashStore::open(trash.path(), 14).unwrap();
        assert!(store.is_empty());
        assert!(matches!(
            store.restore(entry.token).unwrap_err(),
            RestoreError::NotFound
        ));
    }

    #[test]
    fn concurrent_operations_persist_a_complete_index() {
        use std::sync::{Arc, Barrier};

        let workspace = TempDir::new().unwrap();
        let trash = TempDir::new().unwrap();
        let store = Arc::new(TrashStore::open(trash.path(), 14).unwrap());
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = Arc::clone(&store);
                let barrier = Arc::clone(&barrier);
                let file = workspace.path().join(format!("file-{i}.txt"));
                fs::write(&file, format!("payload {i}")).unwrap();
                std::thread::spawn(move || {
                    barrier.wait();
                    store.quarantine(&file).unwrap()
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        // Every racing write made it to disk: a fresh store sees all
        // eight entries and none were reclaimed as orphans.
        drop(store);
        let reopened = TrashStore::open(trash.path(), 14).unwrap();
        assert_eq!(reopened.len(), 8);
    }

    #[test]
    fn directories_are_refused() {
        let fx = fixture(14);
        let dir = fx.file.parent().unwrap().join("subdir");
        fs::create_dir(&dir).unwrap();
        assert!(fx.store.quarantine(&dir).is_err());
    }

    #[test]
    fn quarantining_two_files_with_the_same_name_keeps_both() {
        let fx = fixture(14);
        let entry_a = fx.store.quarantine(&fx.file).unwrap();
        fs::write(&fx.file, b"second incarnation").unwrap();
        let entry_b = fx.store.quarantine(&fx.file).unwrap();
        assert_ne!(entry_a.token, entry_b.token);
        assert_eq!(fx.store.len(), 2);

        fx.store.restore(entry_b.token).unwrap();
        assert_eq!(fs::read(&fx.file).unwrap(), b"second incarnation");
    }
}
