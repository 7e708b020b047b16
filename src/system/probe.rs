//! Host probing implementation.
//!
//! Everything in this module is best-effort: an unreadable kernel table yields
//! an empty result, never an error. Callers that need a hard failure (for
//! example the persistence-root selector when `stat` fails for a reason other
//! than permission-denied) layer that on top.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::trace;

/// Kernel mount table, as exposed by procfs.
const MOUNT_TABLE: &str = "/proc/mounts";

/// Kernel module table, as exposed by procfs.
const MODULE_TABLE: &str = "/proc/modules";

/// Shortest parseable kernel release: `X.Y.Z`.
const MIN_RELEASE_LEN: usize = 5;

/// A parsed kernel version triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct KernelVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl std::fmt::Display for KernelVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// One entry of the kernel mount table.
///
/// `mount_point` is canonicalized to end with `/` so that prefix matching
/// against file paths cannot confuse `/home` with `/homework`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub mount_point: PathBuf,
    pub fstype: String,
}

/// One entry of the kernel module table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleInfo {
    pub name: String,
    pub size: u64,
    pub refcount: i64,
}

/// Returns the current real user id.
#[must_use]
pub fn uid() -> u32 {
    nix::unistd::getuid().as_raw()
}

/// Returns the current real group id.
#[must_use]
pub fn gid() -> u32 {
    nix::unistd::getgid().as_raw()
}

/// Returns the running kernel version, or `None` if the release string
/// cannot be parsed.
///
/// The release field often carries a distro suffix (`6.8.0-47-generic`);
/// parsing is retried on successively shorter prefixes, down to the minimum
/// length of a bare `X.Y.Z` triple.
#[must_use]
pub fn kernel_version() -> Option<KernelVersion> {
    let uname = nix::sys::utsname::uname().ok()?;
    let release = uname.release().to_string_lossy().to_string();
    parse_kernel_release(&release)
}

/// Parse a kernel release string into a version triple, trimming trailing
/// non-numeric suffixes by attempting the longest prefix first.
fn parse_kernel_release(release: &str) -> Option<KernelVersion> {
    for end in (MIN_RELEASE_LEN..=release.len()).rev() {
        if !release.is_char_boundary(end) {
            continue;
        }
        if let Some(version) = parse_triple(&release[..end]) {
            return Some(version);
        }
    }
    None
}

fn parse_triple(s: &str) -> Option<KernelVersion> {
    let mut parts = s.splitn(3, '.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    let patch = parts.next()?.parse().ok()?;
    Some(KernelVersion {
        major,
        minor,
        patch,
    })
}

/// Returns the host mount table as `(mount_point, fstype)` pairs.
///
/// Returns an empty list if the table is unreadable (restricted procfs,
/// exotic chroots).
#[must_use]
pub fn mounts() -> Vec<MountEntry> {
    match fs::read_to_string(MOUNT_TABLE) {
        Ok(table) => parse_mount_table(&table),
        Err(e) => {
            trace!(error = %e, "Mount table unreadable, treating as empty");
            Vec::new()
        }
    }
}

/// Parse a procfs mount table: `device mount_point fstype options dump pass`.
fn parse_mount_table(table: &str) -> Vec<MountEntry> {
    table
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let _device = fields.next()?;
            let mount_point = fields.next()?;
            let fstype = fields.next()?;
            Some(MountEntry {
                mount_point: PathBuf::from(with_trailing_slash(mount_point)),
                fstype: fstype.to_string(),
            })
        })
        .collect()
}

fn with_trailing_slash(path: &str) -> String {
    if path.ends_with('/') {
        path.to_string()
    } else {
        format!("{path}/")
    }
}

/// Returns the kernel modules currently in `Live` state.
///
/// Returns an empty list if the table is unreadable, which also covers
/// kernels built without module support.
#[must_use]
pub fn loaded_modules() -> Vec<ModuleInfo> {
    match fs::read_to_string(MODULE_TABLE) {
        Ok(table) => parse_module_table(&table),
        Err(e) => {
            trace!(error = %e, "Module table unreadable, treating as empty");
            Vec::new()
        }
    }
}

/// Parse a procfs module table: `name size refcount deps state address`.
fn parse_module_table(table: &str) -> Vec<ModuleInfo> {
    table
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 5 || fields[4] != "Live" {
                return None;
            }
            Some(ModuleInfo {
                name: fields[0].to_string(),
                size: fields[1].parse().ok()?,
                refcount: fields[2].parse().ok()?,
            })
        })
        .collect()
}

/// Returns true when the overlay filesystem is usable: either loaded as a
/// module or built into the kernel.
#[must_use]
pub fn overlayfs_loaded() -> bool {
    loaded_modules().iter().any(|m| m.name == "overlay")
        || Path::new("/sys/module/overlay").exists()
}

/// Reports whether `path` sits on an ecryptfs mount, together with the mount
/// point that covers it.
///
/// If no mount covers the path at all (possible inside a chroot where the
/// mount table does not describe the visible filesystem), returns
/// `(false, path)` unchanged.
#[must_use]
pub fn is_encrypted(path: &Path) -> (bool, PathBuf) {
    encryption_status(&mounts(), path)
}

/// Core of [`is_encrypted`], parameterized over the mount table for testing.
pub(crate) fn encryption_status(mounts: &[MountEntry], path: &Path) -> (bool, PathBuf) {
    let canonical = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    let mut probe = canonical.to_string_lossy().into_owned();
    if canonical.is_dir() {
        probe = with_trailing_slash(&probe);
    }

    // Longest mount-point prefix wins; mount points carry a trailing slash.
    let covering = mounts
        .iter()
        .filter(|m| probe.starts_with(&m.mount_point.to_string_lossy().into_owned()))
        .max_by_key(|m| m.mount_point.as_os_str().len());

    match covering {
        Some(entry) => (entry.fstype == "ecryptfs", entry.mount_point.clone()),
        None => (false, path.to_path_buf()),
    }
}

/// Canonicalizes a path, tolerating a non-existent leaf.
///
/// If the path exists this is plain `fs::canonicalize`. Otherwise the parent
/// is resolved recursively and the missing leaf re-appended, so symlinks in
/// the existing stem are still collapsed.
///
/// # Errors
///
/// Fails when the recursion reaches a path that cannot be split further
/// (a relative path with no existing stem), or when `canonicalize` itself
/// fails on the existing stem.
pub fn realpath_stem(path: &Path) -> std::io::Result<PathBuf> {
    if path.exists() {
        return fs::canonicalize(path);
    }

    let (Some(parent), Some(leaf)) = (path.parent(), path.file_name()) else {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("cannot resolve path with no parent: {}", path.display()),
        ));
    };
    if parent.as_os_str().is_empty() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("no existing stem for relative path: {}", path.display()),
        ));
    }

    Ok(realpath_stem(parent)?.join(leaf))
}

/// Returns true when unprivileged user namespaces are enabled.
///
/// Reads `/proc/sys/kernel/unprivileged_userns_clone` where present (Debian
/// and derivatives); on kernels without that knob user namespaces are
/// unconditionally enabled, modulo the `max_user_namespaces` limit.
#[must_use]
pub fn userns_supported() -> bool {
    let clone_knob = Path::new("/proc/sys/kernel/unprivileged_userns_clone");
    if clone_knob.exists() {
        let enabled = fs::read_to_string(clone_knob)
            .map(|v| v.trim() == "1")
            .unwrap_or(false);
        if !enabled {
            return false;
        }
    }

    // A zero namespace quota disables the feature even where the clone knob
    // is absent or permissive.
    match fs::read_to_string("/proc/sys/user/max_user_namespaces") {
        Ok(v) => v.trim().parse::<u64>().map(|n| n > 0).unwrap_or(true),
        Err(_) => true,
    }
}
