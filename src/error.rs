//! Error types for the sandbox engine.
//!
//! Uses thiserror for deriving std::error::Error and miette for rich diagnostics.
//!
//! The split follows the lifecycle of a sandbox run: `ConfigError` is raised
//! while a configuration is being constructed, before any process is spawned;
//! `HostError` is raised when the host is probed or an executor is acquired;
//! `ExecError` is raised by `run` itself.

use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

/// Top-level error type for the crate.
#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    /// Invalid sandbox configuration
    #[error("Invalid sandbox configuration")]
    #[diagnostic(code(nsbox::config))]
    Config(#[from] ConfigError),

    /// Host discovery or capability error
    #[error("Host error")]
    #[diagnostic(code(nsbox::host))]
    Host(#[from] HostError),

    /// Sandbox execution error
    #[error("Execution error")]
    #[diagnostic(code(nsbox::exec))]
    Exec(#[from] ExecError),

    /// I/O error
    #[error("I/O error: {0}")]
    #[diagnostic(code(nsbox::io))]
    Io(#[from] std::io::Error),
}

/// Errors raised while validating a sandbox configuration.
///
/// All of these surface at construction time, before any process is spawned.
#[derive(Error, Debug, Diagnostic)]
pub enum ConfigError {
    /// The mount graph has no entry for `/`
    #[error("Mount graph has no entry for \"/\"")]
    #[diagnostic(
        code(nsbox::config::missing_root),
        help("Every sandbox needs a rootfs; add a mount with sandbox path \"/\"")
    )]
    MissingRoot,

    /// A sandbox mount point is not an absolute path
    #[error("Sandbox path is not absolute: {}", path.display())]
    #[diagnostic(code(nsbox::config::relative_sandbox_path))]
    RelativeSandboxPath { path: PathBuf },

    /// A host path is not absolute
    #[error("Host path is not absolute: {}", path.display())]
    #[diagnostic(code(nsbox::config::relative_host_path))]
    RelativeHostPath { path: PathBuf },

    /// `pwd` or `entrypoint` is not an absolute sandbox path
    #[error("{field} must be an absolute sandbox path, got: {}", path.display())]
    #[diagnostic(code(nsbox::config::relative_path))]
    RelativePath { field: &'static str, path: PathBuf },

    /// The same sandbox path was mapped more than once
    #[error("Sandbox path mapped more than once: {}", path.display())]
    #[diagnostic(
        code(nsbox::config::duplicate_mount),
        help("Each sandbox path may carry exactly one mount; remove the duplicate")
    )]
    DuplicateMount { path: PathBuf },

    /// An overlay mount's host path is not a directory
    #[error("Overlay host path is not a directory: {}", path.display())]
    #[diagnostic(code(nsbox::config::not_a_directory))]
    NotADirectory { path: PathBuf },

    /// A host path could not be resolved against the filesystem
    #[error("Cannot resolve host path: {}", path.display())]
    #[diagnostic(code(nsbox::config::unresolvable_path))]
    UnresolvablePath {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors raised while probing the host or acquiring an executor.
#[derive(Error, Debug, Diagnostic)]
pub enum HostError {
    /// No executor can run on this host
    #[error("No sandbox executor is available on this host")]
    #[diagnostic(
        code(nsbox::host::no_executor),
        help(
            "Enable unprivileged user namespaces (sysctl kernel.unprivileged_userns_clone=1), \
             install the namespace helper, or install a container runtime"
        )
    )]
    NoExecutor,

    /// The requested executor kind cannot run here
    #[error("Executor {kind} is not available on this host")]
    #[diagnostic(code(nsbox::host::executor_unavailable))]
    ExecutorUnavailable { kind: String },

    /// Root escalation is required but no mechanism exists
    #[error("Root escalation required but neither sudo nor su is usable")]
    #[diagnostic(code(nsbox::host::escalation_unavailable))]
    EscalationUnavailable,

    /// No filesystem on this host can back overlay upper/work directories
    #[error("No persistence root found for rootfs {}", rootfs.display())]
    #[diagnostic(
        code(nsbox::host::no_persist_root),
        help(
            "Every candidate filesystem failed the overlay probe; set \
             SANDBOX_PERSISTENCE_DIR to a directory on a plain local filesystem \
             (not ecryptfs, zfs or overlay)"
        )
    )]
    NoPersistRoot { rootfs: PathBuf },

    /// A mount combination the chosen executor cannot express
    #[error("Mount {} ({kind}) is not supported by the {executor} executor", mount_point.display())]
    #[diagnostic(
        code(nsbox::host::broken_mount),
        help("Use a user-namespace executor for overlay mounts below the rootfs")
    )]
    BrokenMount {
        mount_point: PathBuf,
        kind: String,
        executor: String,
    },

    /// A required helper binary could not be located
    #[error("Helper binary not found: {name}")]
    #[diagnostic(
        code(nsbox::host::helper_missing),
        help("Set SANDBOX_HELPER_DIR to the directory holding the helper binaries")
    )]
    HelperMissing { name: String },

    /// The container runtime could not prepare the rootfs image
    #[error("Container runtime image preparation failed: {context}")]
    #[diagnostic(code(nsbox::host::runtime_image))]
    RuntimeImage { context: String },

    /// stat() failed for a reason other than permission-denied
    #[error("Failed to stat {}", path.display())]
    #[diagnostic(code(nsbox::host::stat_failed))]
    StatFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Persistence state on disk could not be created or updated
    #[error("Persistence state error: {context}")]
    #[diagnostic(code(nsbox::host::persistence))]
    Persistence {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

/// Errors raised while launching or waiting on the sandboxed child.
#[derive(Error, Debug, Diagnostic)]
pub enum ExecError {
    /// The helper (or runtime CLI) could not be spawned
    #[error("Failed to spawn {}", program.display())]
    #[diagnostic(code(nsbox::exec::spawn))]
    SpawnFailed {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Waiting on the child failed
    #[error("Failed to wait for sandboxed child")]
    #[diagnostic(code(nsbox::exec::wait))]
    WaitFailed {
        #[source]
        source: std::io::Error,
    },

    /// The user command exited non-zero
    #[error("Sandboxed command failed with exit code {code}")]
    #[diagnostic(code(nsbox::exec::child_failure))]
    ChildFailure { code: i32 },

    /// A helper produced output the engine cannot interpret
    #[error("Malformed helper output: {context}")]
    #[diagnostic(code(nsbox::exec::internal))]
    MalformedHelperOutput { context: String },
}

/// Result type alias for this crate.
pub type Result<T> = std::result::Result<T, Error>;
