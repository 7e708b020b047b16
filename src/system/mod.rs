//! Host probing: static queries about the machine a sandbox will run on.

mod probe;

pub use probe::{
    gid, is_encrypted, kernel_version, loaded_modules, mounts, overlayfs_loaded, realpath_stem,
    uid, userns_supported, KernelVersion, ModuleInfo, MountEntry,
};
