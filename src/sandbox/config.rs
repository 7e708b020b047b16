//! The immutable sandbox run configuration.
//!
//! A [`SandboxConfig`] is a value: cloning it is cheap enough, mutating it is
//! impossible from outside, and the same config can back any number of runs.
//! Deriving a variant ("same sandbox, different stdout") is a clone followed
//! by builder calls.
//!
//! # Example
//!
//! ```no_run
//! use std::path::PathBuf;
//! use nsbox::sandbox::{MountGraph, MountInfo, SandboxConfig, StdioSpec};
//!
//! let graph = MountGraph::new(vec![(
//!     PathBuf::from("/"),
//!     MountInfo::overlayed("/srv/rootfs").unwrap(),
//! )])
//! .unwrap();
//!
//! let config = SandboxConfig::new(graph)
//!     .with_env("PATH", "/usr/bin:/bin")
//!     .with_hostname("sandy")
//!     .with_pwd("/workspace")
//!     .unwrap();
//!
//! let quiet = config.clone().with_stdout(StdioSpec::Null);
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::process::Stdio;

use crate::error::ConfigError;
use crate::sandbox::mounts::{MountGraph, MountInfo, MountType};
use crate::system;

/// Where one of the child's standard streams comes from or goes to.
///
/// Resolved to a concrete file descriptor only at spawn time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StdioSpec {
    /// Share the corresponding stream of the calling process.
    Inherit,
    /// `/dev/null`.
    Null,
    /// A file on the host: opened for reading when used as stdin, created
    /// and appended to when used as stdout/stderr.
    File(PathBuf),
}

impl StdioSpec {
    /// Resolves this spec for use as the child's stdin.
    pub(crate) fn to_stdin(&self) -> std::io::Result<Stdio> {
        match self {
            Self::Inherit => Ok(Stdio::inherit()),
            Self::Null => Ok(Stdio::null()),
            Self::File(path) => Ok(Stdio::from(File::open(path)?)),
        }
    }

    /// Resolves this spec for use as the child's stdout or stderr.
    pub(crate) fn to_output(&self) -> std::io::Result<Stdio> {
        match self {
            Self::Inherit => Ok(Stdio::inherit()),
            Self::Null => Ok(Stdio::null()),
            Self::File(path) => {
                let file = OpenOptions::new().create(true).append(true).open(path)?;
                Ok(Stdio::from(file))
            }
        }
    }
}

/// The immutable request object describing one sandbox.
///
/// Defaults: `pwd = "/"`, `persist = true`, stdin null, stdout/stderr
/// inherited, empty environment, host uid/gid, no hostname, no entrypoint,
/// no multiarch formats.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxConfig {
    /// The validated mount graph.
    pub mounts: MountGraph,
    /// Environment seen by the sandboxed command. Nothing from the host
    /// environment leaks in implicitly.
    pub env: BTreeMap<String, String>,
    /// Absolute sandbox path exec'd in front of the user command.
    pub entrypoint: Option<PathBuf>,
    /// Working directory inside the sandbox.
    pub pwd: PathBuf,
    pub stdin: StdioSpec,
    pub stdout: StdioSpec,
    pub stderr: StdioSpec,
    /// Keep overlay upper/work state across runs of the same executor.
    pub persist: bool,
    /// User id seen inside the sandbox.
    pub uid: u32,
    /// Group id seen inside the sandbox.
    pub gid: u32,
    /// Hostname inside the new UTS namespace; inherits the host's if unset.
    pub hostname: Option<String>,
    /// Size in bytes of the tmpfs backing non-persistent overlays.
    pub tmpfs_size: Option<u64>,
    /// Platform tags whose binfmt handlers the helper registers before exec.
    pub multiarch: BTreeSet<String>,
    /// Forward diagnostic output from helpers and probes.
    pub verbose: bool,
}

impl SandboxConfig {
    /// Full-form constructor: an explicit mount graph plus defaults for
    /// everything else.
    #[must_use]
    pub fn new(mounts: MountGraph) -> Self {
        Self {
            mounts,
            env: BTreeMap::new(),
            entrypoint: None,
            pwd: PathBuf::from("/"),
            stdin: StdioSpec::Null,
            stdout: StdioSpec::Inherit,
            stderr: StdioSpec::Inherit,
            persist: true,
            uid: system::uid(),
            gid: system::gid(),
            hostname: None,
            tmpfs_size: None,
            multiarch: BTreeSet::new(),
            verbose: false,
        }
    }

    /// Legacy-form constructor from three maps.
    ///
    /// The `/` entry of `read_only` becomes the `Overlayed` rootfs, the other
    /// read-only entries become `ReadOnly` mounts and the read-write entries
    /// become `ReadWrite` mounts. Both maps are keyed by sandbox path.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::MissingRoot` when `read_only` has no `/` entry,
    /// and `ConfigError::DuplicateMount` when a sandbox path appears in both
    /// maps.
    pub fn from_maps(
        read_only: BTreeMap<PathBuf, PathBuf>,
        read_write: BTreeMap<PathBuf, PathBuf>,
        env: BTreeMap<String, String>,
    ) -> Result<Self, ConfigError> {
        let mut entries = Vec::new();
        for (sandbox_path, host_path) in read_only {
            let kind = if sandbox_path == Path::new("/") {
                MountType::Overlayed
            } else {
                MountType::ReadOnly
            };
            entries.push((sandbox_path, MountInfo::new(host_path, kind)?));
        }
        for (sandbox_path, host_path) in read_write {
            entries.push((sandbox_path, MountInfo::new(host_path, MountType::ReadWrite)?));
        }

        let graph = MountGraph::new(entries)?;
        Ok(Self::new(graph).with_envs(env))
    }

    /// Adds one environment variable.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Adds environment variables from an iterator.
    #[must_use]
    pub fn with_envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (k, v) in vars {
            self.env.insert(k.into(), v.into());
        }
        self
    }

    /// Sets the working directory inside the sandbox.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::RelativePath` unless the path is absolute.
    pub fn with_pwd(mut self, pwd: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let pwd = pwd.into();
        if !pwd.is_absolute() {
            return Err(ConfigError::RelativePath {
                field: "pwd",
                path: pwd,
            });
        }
        self.pwd = pwd;
        Ok(self)
    }

    /// Sets an entrypoint exec'd in front of the user command.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::RelativePath` unless the path is absolute.
    pub fn with_entrypoint(mut self, entrypoint: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let entrypoint = entrypoint.into();
        if !entrypoint.is_absolute() {
            return Err(ConfigError::RelativePath {
                field: "entrypoint",
                path: entrypoint,
            });
        }
        self.entrypoint = Some(entrypoint);
        Ok(self)
    }

    #[must_use]
    pub fn with_stdin(mut self, stdin: StdioSpec) -> Self {
        self.stdin = stdin;
        self
    }

    #[must_use]
    pub fn with_stdout(mut self, stdout: StdioSpec) -> Self {
        self.stdout = stdout;
        self
    }

    #[must_use]
    pub fn with_stderr(mut self, stderr: StdioSpec) -> Self {
        self.stderr = stderr;
        self
    }

    /// Controls whether overlay upper/work state survives across runs of the
    /// same executor.
    #[must_use]
    pub fn with_persist(mut self, persist: bool) -> Self {
        self.persist = persist;
        self
    }

    /// Sets the identity seen inside the sandbox.
    #[must_use]
    pub fn with_ids(mut self, uid: u32, gid: u32) -> Self {
        self.uid = uid;
        self.gid = gid;
        self
    }

    #[must_use]
    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    /// Sets the size of the tmpfs backing non-persistent overlays.
    #[must_use]
    pub fn with_tmpfs_size(mut self, bytes: u64) -> Self {
        self.tmpfs_size = Some(bytes);
        self
    }

    /// Requests binfmt registration for a platform tag before exec.
    #[must_use]
    pub fn with_multiarch(mut self, format: impl Into<String>) -> Self {
        self.multiarch.insert(format.into());
        self
    }

    #[must_use]
    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }
}
