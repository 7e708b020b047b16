//! nsbox - Linux process sandboxing engine.
//!
//! This crate launches a child command inside an isolated root filesystem
//! assembled from multiple host directories, each mounted at a chosen
//! sandbox path with chosen write semantics: read-only, read-write, or
//! overlay-backed (writes captured in an upper layer, never visible on the
//! host). Isolation is performed by a trusted external helper program; this
//! engine's job is to validate the mount graph, pick a filesystem that can
//! back overlay state, construct the helper command line and manage
//! lifecycle.
//!
//! # Platform Requirements
//!
//! - Linux only. On other platforms every executor reports unavailable.
//! - For the user-namespace executors: the `nsbox-helper` and
//!   `nsbox-overlay-probe` binaries, plus unprivileged user namespaces (or a
//!   usable root escalation).
//! - For the container-runtime executor: an OCI CLI (`docker` by default).
//!
//! # Example
//!
//! ```no_run
//! use std::collections::BTreeMap;
//! use std::path::PathBuf;
//! use nsbox::executor::{run, with_executor};
//! use nsbox::sandbox::SandboxConfig;
//!
//! let mut ro = BTreeMap::new();
//! ro.insert(PathBuf::from("/"), PathBuf::from("/srv/rootfs"));
//!
//! let config = SandboxConfig::from_maps(ro, BTreeMap::new(), BTreeMap::new())?
//!     .with_hostname("sandy");
//!
//! with_executor(None, |exe| {
//!     run(exe, &config, &["/bin/uname".to_string(), "-n".to_string()])
//! })?;
//! # Ok::<(), nsbox::Error>(())
//! ```

pub mod error;
pub mod executor;
pub mod persist;
pub mod sandbox;
pub mod system;

// Re-export commonly used types
pub use error::{ConfigError, Error, ExecError, HostError, Result};
pub use executor::{
    executor_available, run, success, with_executor, CommandStatus, Executor, ExecutorKind,
    PreparedCommand,
};
pub use sandbox::{MountGraph, MountInfo, MountType, SandboxConfig, StdioSpec};
