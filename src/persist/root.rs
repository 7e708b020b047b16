//! Persistence root selection.
//!
//! Overlayfs is picky about what may back its upper and work directories:
//! ecryptfs, zfs and overlay itself are out, and some filesystems only work
//! with the `userxattr` mount option. The only reliable answer comes from
//! actually trying, so candidates are probed with the external overlay probe
//! helper until one succeeds.

use std::path::{Path, PathBuf};

use tracing::{debug, instrument, trace, warn};

use crate::error::HostError;
use crate::executor::helpers;
use crate::system::{self, MountEntry};

/// Filesystem types that can never back overlay upper/work directories,
/// plus the non-data pseudo-filesystems not worth probing.
const FSTYPE_DENYLIST: &[&str] = &[
    "ecryptfs",
    "zfs",
    "overlay",
    "proc",
    "sysfs",
    "cgroup2",
    "devpts",
    "devtmpfs",
    "bpf",
    "autofs",
    "auristorfs",
    "binfmt_misc",
    "configfs",
    "debugfs",
    "efivarfs",
    "fusectl",
    "hugetlbfs",
    "mqueue",
    "nsfs",
    "pstore",
    "ramfs",
    "rpc_pipefs",
    "securityfs",
    "tracefs",
];

/// A directory probed to support overlay upper/work storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistenceRoot {
    pub path: PathBuf,
    /// Whether overlay mounts on this root need the `userxattr` option.
    pub userxattr: bool,
}

/// Default hint directories, in the order they are tried.
///
/// `SANDBOX_PERSISTENCE_DIR` first, then the per-user data directory, then a
/// per-application scratch directory on the system temp filesystem.
#[must_use]
pub fn default_hints() -> Vec<PathBuf> {
    let mut hints = Vec::new();
    if let Ok(dir) = std::env::var("SANDBOX_PERSISTENCE_DIR") {
        if !dir.is_empty() {
            hints.push(PathBuf::from(dir));
        }
    }
    hints.push(helpers::user_data_dir().join("persist"));
    hints.push(std::env::temp_dir().join("nsbox-persist"));
    hints
}

/// Finds a directory whose filesystem supports being the overlay upper/work
/// backing store for `rootfs`.
///
/// Hints are tried first, then every mount point surviving the fstype
/// deny-list, those owned by the current user first. At each candidate
/// `userxattr=true` is tried before `userxattr=false`; the first success
/// wins. Returns `None` when every probe fails.
///
/// # Errors
///
/// Returns `HostError::StatFailed` when ownership of a candidate mount point
/// cannot be determined for a reason other than permission-denied.
#[instrument(skip_all, fields(rootfs = %rootfs.display()))]
pub fn find_persist_root(
    rootfs: &Path,
    hints: &[PathBuf],
    verbose: bool,
) -> Result<Option<PersistenceRoot>, HostError> {
    if !system::overlayfs_loaded() {
        warn!("overlay filesystem module not loaded; probes are likely to fail");
    }

    let mounts = system::mounts();
    let uid = system::uid();
    select_with(
        hints,
        &mounts,
        |path| owned_by(path, uid),
        |candidate, userxattr| probe_overlay(rootfs, candidate, userxattr, verbose),
    )
}

/// Core of [`find_persist_root`], parameterized over the mount table, the
/// ownership check and the probe so the selection order is testable without
/// a kernel.
pub(crate) fn select_with(
    hints: &[PathBuf],
    mounts: &[MountEntry],
    is_owned: impl FnMut(&Path) -> Result<bool, HostError>,
    mut probe: impl FnMut(&Path, bool) -> bool,
) -> Result<Option<PersistenceRoot>, HostError> {
    for hint in hints {
        if let Some(root) = try_candidate(hint, &mut probe) {
            debug!(root = %root.path.display(), userxattr = root.userxattr, "Hint accepted as persistence root");
            return Ok(Some(root));
        }
    }

    let mut candidates: Vec<&Path> = mounts
        .iter()
        .filter(|m| !FSTYPE_DENYLIST.contains(&m.fstype.as_str()))
        .map(|m| m.mount_point.as_path())
        .collect();
    sort_owned_first(&mut candidates, is_owned)?;

    for candidate in candidates {
        if let Some(root) = try_candidate(candidate, &mut probe) {
            debug!(root = %root.path.display(), userxattr = root.userxattr, "Mount point accepted as persistence root");
            return Ok(Some(root));
        }
    }

    trace!("No candidate survived the overlay probe");
    Ok(None)
}

fn try_candidate(
    candidate: &Path,
    probe: &mut impl FnMut(&Path, bool) -> bool,
) -> Option<PersistenceRoot> {
    for userxattr in [true, false] {
        if probe(candidate, userxattr) {
            return Some(PersistenceRoot {
                path: candidate.to_path_buf(),
                userxattr,
            });
        }
    }
    None
}

/// Stable-sorts candidates so those owned by `uid` come first.
pub(crate) fn sort_owned_first<'a>(
    candidates: &mut [&'a Path],
    mut is_owned: impl FnMut(&Path) -> Result<bool, HostError>,
) -> Result<(), HostError> {
    let mut keyed = Vec::with_capacity(candidates.len());
    for path in candidates.iter() {
        keyed.push(is_owned(path)?);
    }
    let mut paired: Vec<(bool, &Path)> = keyed.into_iter().zip(candidates.iter().copied()).collect();
    paired.sort_by_key(|(owned, _)| !*owned);
    for (slot, (_, path)) in candidates.iter_mut().zip(paired) {
        *slot = path;
    }
    Ok(())
}

/// Ownership check backing the candidate sort. Permission-denied counts as
/// not-owned; any other stat failure propagates.
fn owned_by(path: &Path, uid: u32) -> Result<bool, HostError> {
    use std::os::unix::fs::MetadataExt;

    match std::fs::metadata(path) {
        Ok(meta) => Ok(meta.uid() == uid),
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => Ok(false),
        Err(source) => Err(HostError::StatFailed {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Runs the external overlay probe helper against one candidate.
///
/// The candidate directory is created if missing so that scratch hints work
/// on first use. A missing probe helper fails every candidate, which
/// surfaces later as `NoPersistRoot`.
fn probe_overlay(rootfs: &Path, candidate: &Path, userxattr: bool, verbose: bool) -> bool {
    let Some(probe_bin) = helpers::helper_path(helpers::OVERLAY_PROBE_HELPER) else {
        warn!(helper = helpers::OVERLAY_PROBE_HELPER, "Overlay probe helper not found");
        return false;
    };

    if std::fs::create_dir_all(candidate).is_err() && !candidate.is_dir() {
        trace!(candidate = %candidate.display(), "Candidate is not a usable directory");
        return false;
    }

    let mut cmd = std::process::Command::new(&probe_bin);
    if verbose {
        cmd.arg("--verbose");
    }
    if userxattr {
        cmd.arg("--userxattr");
    }
    cmd.arg(rootfs).arg(candidate);
    if !verbose {
        cmd.stdout(std::process::Stdio::null());
        cmd.stderr(std::process::Stdio::null());
    }

    match cmd.status() {
        Ok(status) => {
            trace!(
                candidate = %candidate.display(),
                userxattr,
                success = status.success(),
                "Overlay probe finished"
            );
            status.success()
        }
        Err(e) => {
            warn!(probe = %probe_bin.display(), error = %e, "Failed to run overlay probe");
            false
        }
    }
}
