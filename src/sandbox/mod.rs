//! Sandbox description: the mount graph and the immutable run configuration.
//!
//! A sandbox is declared, not built: callers describe which host directories
//! appear where inside the sandbox and with which write semantics, then hand
//! the resulting [`SandboxConfig`] to an executor. All validation happens at
//! construction time, before any process is spawned.
//!
//! # Example
//!
//! ```no_run
//! use std::collections::BTreeMap;
//! use std::path::PathBuf;
//! use nsbox::sandbox::SandboxConfig;
//!
//! let mut ro = BTreeMap::new();
//! ro.insert(PathBuf::from("/"), PathBuf::from("/srv/rootfs"));
//! let mut rw = BTreeMap::new();
//! rw.insert(PathBuf::from("/workspace"), PathBuf::from("/tmp/workspace"));
//!
//! let config = SandboxConfig::from_maps(ro, rw, BTreeMap::new()).unwrap();
//! assert_eq!(config.pwd, PathBuf::from("/"));
//! ```

mod config;
mod mounts;

pub use config::{SandboxConfig, StdioSpec};
pub use mounts::{MountGraph, MountInfo, MountType};
