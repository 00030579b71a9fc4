//! Rooted disk store implementation
//!
//! [`DiskStore`] translates logical keys into real paths under a single canonical root and
//! performs the synchronous filesystem work behind the local disk driver: atomic commits,
//! idempotent removal, subtree listing and teardown, partial files for chunked uploads, and
//! housekeeping sweeps.
//!
//! # Containment
//!
//! Every resolution is checked twice:
//!
//! 1. Lexically, since [`StoragePath`] cannot contain `..` or absolute segments
//! 2. Physically, by canonicalising the deepest existing ancestor and requiring it to live
//!    under the canonical root, which catches symlinks planted inside the tree

use crate::constants::{PARTIAL_SUFFIX, TEMP_SUFFIX, UPLOADS_DIR_NAME};
use crate::digest::{detect_media_type, ContentDigest};
use crate::{DiskError, DiskResult};
use phistore_types::{StoragePath, StoragePrefix};
use std::fs;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;
use uuid::Uuid;

/// Disk access scoped to one storage class root.
#[derive(Debug, Clone)]
pub struct DiskStore {
    /// Canonicalised root directory
    root: PathBuf,
}

impl DiskStore {
    /// Opens (creating if needed) the root directory of a storage class.
    ///
    /// # Errors
    ///
    /// Returns [`DiskError::InvalidRootDirectory`] if the path exists but is not a directory,
    /// or if it cannot be created or canonicalised.
    pub fn open(root: &Path) -> DiskResult<Self> {
        if root.exists() && !root.is_dir() {
            return Err(DiskError::InvalidRootDirectory(format!(
                "Path is not a directory: {}",
                root.display()
            )));
        }

        fs::create_dir_all(root).map_err(|e| {
            DiskError::InvalidRootDirectory(format!("Cannot create {}: {}", root.display(), e))
        })?;

        let root = root.canonicalize().map_err(|e| {
            DiskError::InvalidRootDirectory(format!(
                "Cannot canonicalize path {}: {}",
                root.display(),
                e
            ))
        })?;

        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolves a logical path to its location under the root.
    pub fn resolve(&self, path: &StoragePath) -> DiskResult<PathBuf> {
        let candidate = path.to_fs_path(&self.root);
        self.ensure_contained(&candidate)?;
        Ok(candidate)
    }

    pub fn resolve_prefix(&self, prefix: &StoragePrefix) -> DiskResult<PathBuf> {
        let candidate = prefix.to_fs_path(&self.root);
        self.ensure_contained(&candidate)?;
        Ok(candidate)
    }

    fn ensure_contained(&self, candidate: &Path) -> DiskResult<()> {
        let lexically_inside = candidate.starts_with(&self.root)
            && !candidate
                .components()
                .any(|c| matches!(c, Component::ParentDir));
        if !lexically_inside {
            return Err(DiskError::PathTraversal(candidate.display().to_string()));
        }

        let mut existing = candidate.to_path_buf();
        loop {
            match fs::symlink_metadata(&existing) {
                Ok(_) => break,
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    if !existing.pop() {
                        return Err(DiskError::PathTraversal(candidate.display().to_string()));
                    }
                }
                Err(e) => return Err(DiskError::io(existing.display(), e)),
            }
        }

        // A dangling symlink fails to canonicalise; treat it like one pointing outside.
        let real = existing
            .canonicalize()
            .map_err(|_| DiskError::PathTraversal(candidate.display().to_string()))?;

        if real.starts_with(&self.root) {
            Ok(())
        } else {
            Err(DiskError::PathTraversal(candidate.display().to_string()))
        }
    }

    /// Creates the parent directories of `path` and returns `(target, temp)` where `temp` is
    /// a fresh hidden sibling of `target`.
    pub fn prepare_write(&self, path: &StoragePath) -> DiskResult<(PathBuf, PathBuf)> {
        let target = self.resolve(path)?;
        if target.is_dir() {
            return Err(DiskError::InvalidTarget(format!("{} is a directory", path)));
        }

        let parent = target
            .parent()
            .ok_or_else(|| DiskError::InvalidTarget(path.to_string()))?;
        fs::create_dir_all(parent).map_err(|e| DiskError::io(parent.display(), e))?;

        let temp = parent.join(format!(
            ".{}.{}{}",
            path.file_name(),
            Uuid::new_v4().simple(),
            TEMP_SUFFIX
        ));
        Ok((target, temp))
    }

    /// Atomically renames a fully written temp file onto its target.
    pub fn commit(&self, temp: &Path, target: &Path) -> DiskResult<()> {
        fs::rename(temp, target).map_err(|e| DiskError::io(target.display(), e))?;
        if let Some(parent) = target.parent() {
            sync_dir(parent)?;
        }
        Ok(())
    }

    /// Removes a temp file left behind by a failed write. Missing files are ignored.
    pub fn discard(&self, temp: &Path) -> DiskResult<()> {
        match fs::remove_file(temp) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(DiskError::io(temp.display(), e)),
        }
    }

    /// Removes one object. Returns `false` when there was nothing to remove.
    pub fn remove(&self, path: &StoragePath) -> DiskResult<bool> {
        let target = self.resolve(path)?;

        match fs::symlink_metadata(&target) {
            Ok(meta) if meta.is_dir() => {
                return Err(DiskError::InvalidTarget(format!("{} is a directory", path)))
            }
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(DiskError::io(target.display(), e)),
        }

        match fs::remove_file(&target) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(DiskError::io(target.display(), e)),
        }

        self.prune_empty_parents(&target);
        Ok(true)
    }

    /// Removes everything under `prefix` in a single subtree walk and returns how many
    /// objects were removed. The class root itself is never removed.
    pub fn remove_prefix(&self, prefix: &StoragePrefix) -> DiskResult<u64> {
        if prefix.is_root() {
            return Err(DiskError::InvalidTarget(
                "refusing to remove the storage root".into(),
            ));
        }

        let target = self.resolve_prefix(prefix)?;
        let meta = match fs::symlink_metadata(&target) {
            Ok(meta) => meta,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(DiskError::io(target.display(), e)),
        };

        let count = if meta.is_dir() {
            let count = count_visible_files(&target)?;
            match fs::remove_dir_all(&target) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(DiskError::io(target.display(), e)),
            }
            count
        } else if meta.is_file() {
            match fs::remove_file(&target) {
                Ok(()) => 1,
                Err(e) if e.kind() == ErrorKind::NotFound => 0,
                Err(e) => return Err(DiskError::io(target.display(), e)),
            }
        } else {
            return Err(DiskError::InvalidTarget(format!(
                "{} is not a regular file or directory",
                prefix
            )));
        };

        self.prune_empty_parents(&target);
        Ok(count)
    }

    /// Lists visible objects under `prefix`, sorted.
    pub fn list(&self, prefix: &StoragePrefix) -> DiskResult<Vec<StoragePath>> {
        let start = self.resolve_prefix(prefix)?;
        let meta = match fs::symlink_metadata(&start) {
            Ok(meta) => meta,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(DiskError::io(start.display(), e)),
        };

        let mut out = Vec::new();
        if meta.is_file() {
            out.extend(self.logical_path(&start));
        } else if meta.is_dir() {
            self.collect_visible(&start, &mut out)?;
        }

        out.sort();
        Ok(out)
    }

    fn collect_visible(&self, dir: &Path, out: &mut Vec<StoragePath>) -> DiskResult<()> {
        for entry in fs::read_dir(dir).map_err(|e| DiskError::io(dir.display(), e))? {
            let entry = entry.map_err(|e| DiskError::io(dir.display(), e))?;
            if is_hidden(&entry.file_name()) {
                continue;
            }
            let file_type = entry
                .file_type()
                .map_err(|e| DiskError::io(entry.path().display(), e))?;
            if file_type.is_dir() {
                self.collect_visible(&entry.path(), out)?;
            } else if file_type.is_file() {
                out.extend(self.logical_path(&entry.path()));
            }
        }
        Ok(())
    }

    /// Maps an absolute path under the root back to its logical key.
    fn logical_path(&self, absolute: &Path) -> Option<StoragePath> {
        let relative = absolute.strip_prefix(&self.root).ok()?;
        let parts = relative
            .components()
            .map(|c| c.as_os_str().to_str())
            .collect::<Option<Vec<_>>>()?;
        StoragePath::parse(parts.join("/")).ok()
    }

    pub fn exists(&self, path: &StoragePath) -> DiskResult<bool> {
        let target = self.resolve(path)?;
        match fs::symlink_metadata(&target) {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(DiskError::io(target.display(), e)),
        }
    }

    /// Size in bytes of a stored object.
    pub fn file_len(&self, path: &StoragePath) -> DiskResult<u64> {
        let target = self.resolve(path)?;
        match fs::metadata(&target) {
            Ok(meta) if meta.is_file() => Ok(meta.len()),
            Ok(_) => Err(DiskError::NotFound(path.to_string())),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(DiskError::NotFound(path.to_string())),
            Err(e) => Err(DiskError::io(target.display(), e)),
        }
    }

    /// Path of the partial file for an upload session. Session ids are restricted to
    /// `[a-z0-9-]` so they cannot address anything outside the uploads directory.
    pub fn partial_path(&self, session_id: &str) -> DiskResult<PathBuf> {
        let valid = !session_id.is_empty()
            && session_id
                .bytes()
                .all(|b| matches!(b, b'a'..=b'z' | b'0'..=b'9' | b'-'));
        if !valid {
            return Err(DiskError::InvalidTarget(format!(
                "invalid session id: {}",
                session_id
            )));
        }
        Ok(self
            .root
            .join(UPLOADS_DIR_NAME)
            .join(format!("{}{}", session_id, PARTIAL_SUFFIX)))
    }

    /// Creates an empty partial file for a new upload session.
    pub fn create_partial(&self, session_id: &str) -> DiskResult<PathBuf> {
        let partial = self.partial_path(session_id)?;
        let uploads = self.root.join(UPLOADS_DIR_NAME);
        fs::create_dir_all(&uploads).map_err(|e| DiskError::io(uploads.display(), e))?;
        fs::File::create(&partial).map_err(|e| DiskError::io(partial.display(), e))?;
        Ok(partial)
    }

    /// Moves a completed partial file onto its final logical path.
    pub fn commit_partial(&self, session_id: &str, path: &StoragePath) -> DiskResult<PathBuf> {
        let partial = self.partial_path(session_id)?;
        if !partial.is_file() {
            return Err(DiskError::NotFound(format!("partial upload {}", session_id)));
        }

        let (target, _) = self.prepare_write(path)?;
        self.commit(&partial, &target)?;
        Ok(target)
    }

    /// SHA-256 and sniffed media type of a partial upload, read back from disk.
    pub fn fingerprint_partial(
        &self,
        session_id: &str,
    ) -> DiskResult<(String, Option<&'static str>)> {
        use std::io::Read;

        let partial = self.partial_path(session_id)?;
        let mut file = fs::File::open(&partial).map_err(|e| match e.kind() {
            ErrorKind::NotFound => DiskError::NotFound(format!("partial upload {}", session_id)),
            _ => DiskError::io(partial.display(), e),
        })?;

        let mut digest = ContentDigest::new();
        let mut media_type = None;
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = file
                .read(&mut buf)
                .map_err(|e| DiskError::io(partial.display(), e))?;
            if n == 0 {
                break;
            }
            if digest.bytes() == 0 {
                media_type = detect_media_type(&buf[..n]);
            }
            digest.update(&buf[..n]);
        }
        Ok((digest.finish(), media_type))
    }

    /// Removes a partial file. Returns `false` if it was already gone.
    pub fn remove_partial(&self, session_id: &str) -> DiskResult<bool> {
        let partial = self.partial_path(session_id)?;
        match fs::remove_file(&partial) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(DiskError::io(partial.display(), e)),
        }
    }

    /// Session ids that currently have a partial file on disk.
    pub fn partial_session_ids(&self) -> DiskResult<Vec<String>> {
        let uploads = self.root.join(UPLOADS_DIR_NAME);
        let entries = match fs::read_dir(&uploads) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(DiskError::io(uploads.display(), e)),
        };

        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| DiskError::io(uploads.display(), e))?;
            if let Some(id) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.strip_suffix(PARTIAL_SUFFIX))
            {
                ids.push(id.to_owned());
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Confirms the root accepts writes by creating and removing a hidden marker file.
    ///
    /// Stored objects are never touched.
    pub fn check_writable(&self) -> DiskResult<()> {
        use std::io::Write;

        let marker = self
            .root
            .join(format!(".health-{}{}", Uuid::new_v4().simple(), TEMP_SUFFIX));
        let result = fs::File::create(&marker)
            .and_then(|mut f| {
                f.write_all(b"ok")?;
                f.sync_all()
            })
            .map_err(|e| DiskError::io(marker.display(), e));
        let cleanup = self.discard(&marker);
        result.and(cleanup)
    }

    /// Removes hidden temp files last modified before `cutoff`, left behind by writes that
    /// never committed. Returns the number removed.
    pub fn sweep_stale_temp(&self, cutoff: SystemTime) -> DiskResult<u64> {
        fn sweep(dir: &Path, cutoff: SystemTime, removed: &mut u64) -> DiskResult<()> {
            for entry in fs::read_dir(dir).map_err(|e| DiskError::io(dir.display(), e))? {
                let entry = entry.map_err(|e| DiskError::io(dir.display(), e))?;
                let name = entry.file_name();
                let file_type = entry
                    .file_type()
                    .map_err(|e| DiskError::io(entry.path().display(), e))?;

                if file_type.is_dir() {
                    if name != UPLOADS_DIR_NAME {
                        sweep(&entry.path(), cutoff, removed)?;
                    }
                    continue;
                }

                let is_temp = name
                    .to_str()
                    .is_some_and(|n| n.starts_with('.') && n.ends_with(TEMP_SUFFIX));
                if !file_type.is_file() || !is_temp {
                    continue;
                }

                let modified = entry
                    .metadata()
                    .and_then(|m| m.modified())
                    .map_err(|e| DiskError::io(entry.path().display(), e))?;
                if modified < cutoff {
                    match fs::remove_file(entry.path()) {
                        Ok(()) => *removed += 1,
                        Err(e) if e.kind() == ErrorKind::NotFound => {}
                        Err(e) => return Err(DiskError::io(entry.path().display(), e)),
                    }
                }
            }
            Ok(())
        }

        let mut removed = 0;
        sweep(&self.root, cutoff, &mut removed)?;
        Ok(removed)
    }

    /// Removes now-empty directories between `path` and the root. Best effort.
    fn prune_empty_parents(&self, path: &Path) {
        let mut current = path.parent();
        while let Some(dir) = current {
            if dir == self.root || !dir.starts_with(&self.root) {
                break;
            }
            if fs::remove_dir(dir).is_err() {
                break;
            }
            current = dir.parent();
        }
    }
}

fn is_hidden(name: &std::ffi::OsStr) -> bool {
    name.to_str().map_or(true, |n| n.starts_with('.'))
}

fn count_visible_files(dir: &Path) -> DiskResult<u64> {
    let mut count = 0;
    for entry in fs::read_dir(dir).map_err(|e| DiskError::io(dir.display(), e))? {
        let entry = entry.map_err(|e| DiskError::io(dir.display(), e))?;
        let file_type = entry
            .file_type()
            .map_err(|e| DiskError::io(entry.path().display(), e))?;
        if file_type.is_dir() {
            count += count_visible_files(&entry.path())?;
        } else if file_type.is_file() && !is_hidden(&entry.file_name()) {
            count += 1;
        }
    }
    Ok(count)
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> DiskResult<()> {
    fs::File::open(dir)
        .and_then(|f| f.sync_all())
        .map_err(|e| DiskError::io(dir.display(), e))
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> DiskResult<()> {
    Ok(())
}
