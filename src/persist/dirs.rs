//! Keyed overlay upper/work directories.
//!
//! Each `(rootfs, sandbox mount point)` pair maps to one directory holding
//! `upper/` and `work/` as siblings on the same filesystem. The mapping is
//! memoized per store, and a store lives as long as its executor: looking
//! the pair up twice within one executor returns the same directories
//! (which is what makes overlay state survive across runs), while a fresh
//! executor allocates fresh directories and restarts from the lower layer.
//!
//! Persistent keyed directories are left behind on release; `meta.json`
//! records their provenance so [`OverlayStore::prune`] can collect them out
//! of band.

use std::collections::HashMap;
use std::fs;
use std::hash::{Hash, Hasher};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};
use walkdir::WalkDir;

use crate::error::HostError;

/// Directory permissions: owner read/write/execute only (0700).
const DIR_PERMISSIONS: u32 = 0o700;

/// Name of the provenance file inside each keyed directory.
const META_FILE: &str = "meta.json";

/// Identity of one overlay's persistent state.
///
/// Derived from the mount's host path and its sandbox mount point; equal
/// keys always resolve to the same upper/work pair within a store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PersistenceKey {
    rootfs: PathBuf,
    mount: PathBuf,
}

impl PersistenceKey {
    #[must_use]
    pub fn new(rootfs: impl Into<PathBuf>, mount: impl Into<PathBuf>) -> Self {
        Self {
            rootfs: rootfs.into(),
            mount: mount.into(),
        }
    }

    /// Stable name prefix for this key: `<rootfs-basename>-<hex-hash>`.
    ///
    /// The basename keeps directories recognizable to a human poking around
    /// the persistence root; the hash disambiguates mount points.
    #[must_use]
    pub fn dirname(&self) -> String {
        let stem = self
            .rootfs
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "rootfs".to_string());

        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.rootfs.hash(&mut hasher);
        self.mount.hash(&mut hasher);
        format!("{stem}-{:016x}", hasher.finish())
    }
}

/// The upper/work directory pair backing one overlay mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayDirs {
    pub upper: PathBuf,
    pub work: PathBuf,
}

impl OverlayDirs {
    fn keydir(&self) -> &Path {
        // upper and work are siblings by construction.
        self.upper.parent().unwrap_or(&self.upper)
    }
}

/// Provenance of a keyed directory, persisted as `meta.json`.
///
/// Exists so the host application can prune stale state without guessing
/// which rootfs a directory belonged to.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct OverlayMeta {
    rootfs: PathBuf,
    mount: PathBuf,
    created_at: DateTime<Utc>,
    last_used: DateTime<Utc>,
}

impl OverlayMeta {
    fn new(key: &PersistenceKey) -> Self {
        let now = Utc::now();
        Self {
            rootfs: key.rootfs.clone(),
            mount: key.mount.clone(),
            created_at: now,
            last_used: now,
        }
    }

    fn load(path: &Path) -> std::io::Result<Self> {
        let content = fs::read_to_string(path)?;
        serde_json::from_str(&content).map_err(std::io::Error::other)
    }

    /// Saves atomically: temp file then rename.
    fn save(&self, path: &Path) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self).map_err(std::io::Error::other)?;
        let temp_path = path.with_extension("json.tmp");
        fs::write(&temp_path, json)?;
        fs::rename(&temp_path, path)
    }
}

/// Per-executor table of keyed overlay directories.
///
/// A *persistent* store allocates unique keyed directories under the probed
/// persistence root and leaves them behind on drop. An *ephemeral* store
/// sits on a per-run scratch directory owned by the executor, which removes
/// it wholesale on release.
#[derive(Debug)]
pub struct OverlayStore {
    root: PathBuf,
    persistent: bool,
    entries: HashMap<PersistenceKey, OverlayDirs>,
}

impl OverlayStore {
    /// Store rooted on the probed persistence root.
    #[must_use]
    pub fn persistent(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            persistent: true,
            entries: HashMap::new(),
        }
    }

    /// Store rooted on a per-run scratch directory.
    #[must_use]
    pub fn ephemeral(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            persistent: false,
            entries: HashMap::new(),
        }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the upper/work pair for a key. Repeated calls with the same
    /// key return the same pair for the lifetime of this store.
    ///
    /// For persistent stores the first lookup allocates a unique keyed
    /// directory under the root, so two executors over the same rootfs never
    /// share (or trample) each other's overlay state.
    ///
    /// # Errors
    ///
    /// Returns `HostError::Persistence` when the keyed directory cannot be
    /// allocated.
    pub fn dirs_for(&mut self, key: &PersistenceKey) -> Result<OverlayDirs, HostError> {
        if let Some(dirs) = self.entries.get(key) {
            return Ok(dirs.clone());
        }

        let keydir = if self.persistent {
            ensure_dir(&self.root)?;
            let unique = tempfile::Builder::new()
                .prefix(&format!("{}-", key.dirname()))
                .tempdir_in(&self.root)
                .map_err(|source| HostError::Persistence {
                    context: format!(
                        "failed to allocate keyed directory under {}",
                        self.root.display()
                    ),
                    source,
                })?;
            unique.keep()
        } else {
            self.root.join(key.dirname())
        };

        let dirs = OverlayDirs {
            upper: keydir.join("upper"),
            work: keydir.join("work"),
        };
        trace!(keydir = %keydir.display(), "Allocated overlay directories");
        self.entries.insert(key.clone(), dirs.clone());
        Ok(dirs)
    }

    /// Creates the directories for a key on disk and returns them.
    ///
    /// The work directory is emptied first (overlayfs refuses a dirty work
    /// directory), and for persistent stores the provenance metadata is
    /// written or refreshed.
    ///
    /// # Errors
    ///
    /// Returns `HostError::Persistence` when directory creation fails.
    pub fn realize(&mut self, key: &PersistenceKey) -> Result<OverlayDirs, HostError> {
        let dirs = self.dirs_for(key)?;
        let keydir = dirs.keydir().to_path_buf();

        ensure_dir(&keydir)?;
        ensure_dir(&dirs.upper)?;
        empty_directory(&dirs.work)?;
        ensure_dir(&dirs.work)?;

        if self.persistent {
            let meta_path = keydir.join(META_FILE);
            let meta = match OverlayMeta::load(&meta_path) {
                Ok(mut meta) => {
                    meta.last_used = Utc::now();
                    meta
                }
                Err(_) => OverlayMeta::new(key),
            };
            meta.save(&meta_path).map_err(|source| HostError::Persistence {
                context: format!("failed to write {}", meta_path.display()),
                source,
            })?;
        }

        Ok(dirs)
    }

    /// Removes every keyed directory this store has handed out.
    pub fn remove_all(&mut self) {
        for dirs in self.entries.values() {
            let keydir = dirs.keydir();
            if let Err(e) = fs::remove_dir_all(keydir) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(dir = %keydir.display(), error = %e, "Failed to remove overlay directory");
                }
            }
        }
        self.entries.clear();
    }

    /// Garbage-collects a persistence root: removes keyed directories whose
    /// metadata is missing or corrupted, or whose rootfs no longer exists.
    ///
    /// Returns the number of directories removed. This is the out-of-band
    /// hook for host applications; live executors never call it.
    pub fn prune(root: &Path) -> usize {
        if !root.exists() {
            return 0;
        }

        let mut removed = 0;
        for entry in WalkDir::new(root)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }

            let stale = match OverlayMeta::load(&path.join(META_FILE)) {
                Ok(meta) => !meta.rootfs.exists(),
                Err(_) => true,
            };

            if stale {
                debug!(dir = %path.display(), "Pruning stale overlay state");
                match fs::remove_dir_all(path) {
                    Ok(()) => removed += 1,
                    Err(e) => warn!(dir = %path.display(), error = %e, "Failed to prune"),
                }
            }
        }
        removed
    }
}

fn ensure_dir(path: &Path) -> Result<(), HostError> {
    fs::create_dir_all(path).map_err(|source| HostError::Persistence {
        context: format!("failed to create directory {}", path.display()),
        source,
    })?;
    fs::set_permissions(path, fs::Permissions::from_mode(DIR_PERMISSIONS)).map_err(|source| {
        HostError::Persistence {
            context: format!("failed to set permissions on {}", path.display()),
            source,
        }
    })
}

/// Removes a directory's contents by removing and recreating it.
fn empty_directory(path: &Path) -> Result<(), HostError> {
    if path.exists() {
        fs::remove_dir_all(path).map_err(|source| HostError::Persistence {
            context: format!("failed to empty directory {}", path.display()),
            source,
        })?;
    }
    Ok(())
}
