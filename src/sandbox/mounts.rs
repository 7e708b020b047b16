//! The declarative mount graph: sandbox path -> host path + mount semantics.
//!
//! # Application order
//!
//! The namespace helper applies `--mount` arguments in reverse arrival order,
//! so emitting sandbox paths longest-first yields correct top-down mounting:
//! every parent mount point is established before anything nested beneath it.
//! [`MountGraph::ordered`] exposes that canonical order.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::ConfigError;
use crate::system;

/// Write semantics of a single mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountType {
    /// Bind-mount the host path read-only.
    ReadOnly,
    /// Bind-mount the host path writable; writes are visible on the host.
    ReadWrite,
    /// Host path is an overlay lower layer; sandbox writes land in an upper
    /// layer backed by persistence or tmpfs and are never visible on the host.
    Overlayed,
    /// Overlay with a read-only upper: interposes an overlay at a location
    /// while forbidding mutation.
    OverlayedReadOnly,
}

impl MountType {
    /// Returns true for the overlay-backed variants, which need upper/work
    /// directories and a directory as host path.
    #[must_use]
    pub fn is_overlay(self) -> bool {
        matches!(self, Self::Overlayed | Self::OverlayedReadOnly)
    }

    /// The token used for this type on the helper command line.
    #[must_use]
    pub fn token(self) -> &'static str {
        match self {
            Self::ReadOnly => "ro",
            Self::ReadWrite => "rw",
            Self::Overlayed => "overlay",
            Self::OverlayedReadOnly => "overlay-ro",
        }
    }
}

impl std::fmt::Display for MountType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.token())
    }
}

/// A host path together with its mount semantics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountInfo {
    /// Absolute host path, symlinks resolved up to the nearest existing stem.
    pub host_path: PathBuf,
    pub kind: MountType,
}

impl MountInfo {
    /// Creates a validated mount description.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the host path is relative, cannot be resolved,
    /// or is not a directory while `kind` is an overlay variant.
    pub fn new(host_path: impl Into<PathBuf>, kind: MountType) -> Result<Self, ConfigError> {
        let host_path = host_path.into();
        if !host_path.is_absolute() {
            return Err(ConfigError::RelativeHostPath { path: host_path });
        }

        let host_path = system::realpath_stem(&host_path).map_err(|source| {
            ConfigError::UnresolvablePath {
                path: host_path.clone(),
                source,
            }
        })?;

        if kind.is_overlay() && !host_path.is_dir() {
            return Err(ConfigError::NotADirectory { path: host_path });
        }

        Ok(Self { host_path, kind })
    }

    /// Read-only bind mount of `host_path`.
    pub fn read_only(host_path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        Self::new(host_path, MountType::ReadOnly)
    }

    /// Writable bind mount of `host_path`.
    pub fn read_write(host_path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        Self::new(host_path, MountType::ReadWrite)
    }

    /// Overlay with `host_path` as the lower layer.
    pub fn overlayed(host_path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        Self::new(host_path, MountType::Overlayed)
    }
}

/// Validated mapping from sandbox path to [`MountInfo`].
///
/// Invariants held after construction:
/// - every key is an absolute, normalized sandbox path;
/// - the key `/` is present;
/// - every host path is absolute and stem-resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountGraph {
    entries: BTreeMap<PathBuf, MountInfo>,
}

impl MountGraph {
    /// Builds a mount graph from `(sandbox path, mount)` pairs.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::MissingRoot` when no `/` entry is present,
    /// `ConfigError::RelativeSandboxPath` for non-absolute keys, and
    /// `ConfigError::DuplicateMount` when two pairs normalize to the same
    /// sandbox path.
    pub fn new(
        entries: impl IntoIterator<Item = (PathBuf, MountInfo)>,
    ) -> Result<Self, ConfigError> {
        let mut map = BTreeMap::new();
        for (sandbox_path, info) in entries {
            if !sandbox_path.is_absolute() {
                return Err(ConfigError::RelativeSandboxPath { path: sandbox_path });
            }
            let normalized: PathBuf = sandbox_path.components().collect();
            if map.insert(normalized.clone(), info).is_some() {
                return Err(ConfigError::DuplicateMount { path: normalized });
            }
        }

        if !map.contains_key(Path::new("/")) {
            return Err(ConfigError::MissingRoot);
        }

        Ok(Self { entries: map })
    }

    /// The mount backing the sandbox root.
    #[must_use]
    pub fn root(&self) -> &MountInfo {
        // Guaranteed by construction.
        &self.entries[Path::new("/")]
    }

    /// Looks up the mount at a sandbox path.
    #[must_use]
    pub fn get(&self, sandbox_path: &Path) -> Option<&MountInfo> {
        self.entries.get(sandbox_path)
    }

    /// All entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&Path, &MountInfo)> {
        self.entries.iter().map(|(k, v)| (k.as_path(), v))
    }

    /// Non-root entries in application order: sandbox-path length descending.
    ///
    /// The sort is stable, so equal-length paths keep their lexicographic
    /// order.
    #[must_use]
    pub fn ordered(&self) -> Vec<(&Path, &MountInfo)> {
        let mut mounts: Vec<(&Path, &MountInfo)> = self
            .entries
            .iter()
            .filter(|(k, _)| k.as_path() != Path::new("/"))
            .map(|(k, v)| (k.as_path(), v))
            .collect();
        mounts.sort_by_key(|(k, _)| std::cmp::Reverse(k.as_os_str().len()));
        mounts
    }

    /// Overlay-backed entries needing upper/work directories, root first,
    /// then the remaining overlays in application order.
    #[must_use]
    pub fn overlays(&self) -> Vec<(&Path, &MountInfo)> {
        let mut overlays = vec![(Path::new("/"), self.root())];
        overlays.extend(
            self.ordered()
                .into_iter()
                .filter(|(_, info)| info.kind.is_overlay()),
        );
        overlays
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
