//! Executors: turning a [`SandboxConfig`] into a running child process.
//!
//! Three backends implement the same capability set:
//!
//! - [`ExecutorKind::UnprivilegedUserNamespaces`] — the namespace helper
//!   running under the caller's own uid, using kernel user namespaces.
//! - [`ExecutorKind::PrivilegedUserNamespaces`] — the same helper behind a
//!   root-escalation wrapper, for kernels that refuse overlay mounts inside
//!   user namespaces.
//! - [`ExecutorKind::ContainerRuntime`] — an external OCI CLI, with the
//!   mount graph translated to volume flags.
//!
//! An [`Executor`] owns the live state of its runs: the probed persistence
//! root, the keyed overlay directories, and any per-run scratch space. All
//! of it is released when the executor is dropped, so [`with_executor`]
//! guarantees cleanup on every exit path, panics included.
//!
//! # Example
//!
//! ```no_run
//! use nsbox::executor::{run, with_executor};
//! use nsbox::sandbox::SandboxConfig;
//! # fn config() -> SandboxConfig { unimplemented!() }
//!
//! let config = config();
//! let status = with_executor(None, |exe| {
//!     run(exe, &config, &["id".to_string()])
//! })?;
//! assert_eq!(status.code, 0);
//! # Ok::<(), nsbox::Error>(())
//! ```

pub(crate) mod helpers;
mod runtime;
mod userns;

use std::path::PathBuf;
use std::process::Command;

use tempfile::TempDir;
use tracing::{debug, instrument, trace, warn};

use crate::error::{Error, ExecError, HostError, Result};
use crate::persist::{self, OverlayDirs, OverlayStore, PersistenceKey, PersistenceRoot};
use crate::sandbox::SandboxConfig;

pub use helpers::{build_local_sandbox, NAMESPACE_HELPER, OVERLAY_PROBE_HELPER};

/// The isolation backends this engine can drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorKind {
    UnprivilegedUserNamespaces,
    PrivilegedUserNamespaces,
    ContainerRuntime,
}

impl ExecutorKind {
    /// Preference order used when the caller does not pick a kind.
    pub const PREFERENCE: [Self; 3] = [
        Self::UnprivilegedUserNamespaces,
        Self::PrivilegedUserNamespaces,
        Self::ContainerRuntime,
    ];

    /// Static check whether this executor can run on the current host.
    #[must_use]
    pub fn available(self) -> bool {
        if !cfg!(target_os = "linux") {
            return false;
        }
        match self {
            Self::UnprivilegedUserNamespaces => {
                crate::system::userns_supported()
                    && helpers::helper_path(NAMESPACE_HELPER).is_some()
            }
            Self::PrivilegedUserNamespaces => {
                helpers::helper_path(NAMESPACE_HELPER).is_some()
                    && helpers::escalation().usable()
            }
            Self::ContainerRuntime => runtime::runtime_available(),
        }
    }
}

impl std::fmt::Display for ExecutorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::UnprivilegedUserNamespaces => "unprivileged user namespaces",
            Self::PrivilegedUserNamespaces => "privileged user namespaces",
            Self::ContainerRuntime => "container runtime",
        };
        f.write_str(name)
    }
}

/// A concrete child-process launch, inspectable before (or instead of)
/// spawning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

/// How the sandboxed command ended.
///
/// Signal death is mirrored the way shells do it: `code` is `128 + signal`
/// and `signal` carries the number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandStatus {
    pub code: i32,
    pub signal: Option<i32>,
}

impl CommandStatus {
    #[must_use]
    pub fn success(self) -> bool {
        self.code == 0 && self.signal.is_none()
    }

    fn from_exit(status: std::process::ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;

        match status.code() {
            Some(code) => Self { code, signal: None },
            None => {
                let signal = status.signal().unwrap_or(0);
                Self {
                    code: 128 + signal,
                    signal: Some(signal),
                }
            }
        }
    }
}

/// Live state owned by one executor: the probed persistence root with its
/// keyed overlay store, plus per-run scratch directories for non-persistent
/// overlays. Scratch space dies with the executor.
#[derive(Debug, Default)]
struct ExecutorState {
    persistent: Option<(PersistenceRoot, OverlayStore)>,
    scratch: Vec<(TempDir, OverlayStore)>,
}

/// One acquired isolation backend.
///
/// Construction performs no availability check; that belongs to
/// [`with_executor`] and [`executor_available`]. Multiple sequential `run`
/// calls on the same executor share persistence state, which is what makes
/// `persist = true` overlays accumulate.
#[derive(Debug)]
pub struct Executor {
    kind: ExecutorKind,
    state: ExecutorState,
}

impl Executor {
    #[must_use]
    pub fn new(kind: ExecutorKind) -> Self {
        Self {
            kind,
            state: ExecutorState::default(),
        }
    }

    #[must_use]
    pub fn kind(&self) -> ExecutorKind {
        self.kind
    }

    /// Transforms a config and argv into the concrete helper (or runtime)
    /// invocation, allocating overlay workspace paths as needed.
    ///
    /// # Errors
    ///
    /// Returns `HostError::HelperMissing` when the namespace helper cannot be
    /// located, `HostError::NoPersistRoot` when persistent overlays are
    /// requested but no filesystem can back them, and
    /// `HostError::BrokenMount` for mount kinds the chosen backend cannot
    /// express.
    #[instrument(skip(self, config, argv), fields(kind = %self.kind))]
    pub fn build_command(
        &mut self,
        config: &SandboxConfig,
        argv: &[String],
    ) -> Result<PreparedCommand> {
        match self.kind {
            ExecutorKind::UnprivilegedUserNamespaces => {
                let helper = namespace_helper()?;
                let (workspaces, userxattr) = self.plan_workspaces(config)?;
                Ok(PreparedCommand {
                    program: helper,
                    args: userns::build_helper_args(config, argv, &workspaces, userxattr),
                })
            }
            ExecutorKind::PrivilegedUserNamespaces => {
                let helper = namespace_helper()?;
                let (workspaces, userxattr) = self.plan_workspaces(config)?;
                let args = userns::build_helper_args(config, argv, &workspaces, userxattr);
                let escalation = helpers::escalation();
                if !escalation.usable() {
                    warn!("running privileged helper without an escalation wrapper");
                }
                let (program, args) = helpers::wrap(escalation, helper, args);
                Ok(PreparedCommand { program, args })
            }
            ExecutorKind::ContainerRuntime => {
                let image = runtime::image_tag(&config.mounts.root().host_path);
                let args = runtime::build_run_args(config, argv, &image)?;
                Ok(PreparedCommand {
                    program: PathBuf::from(helpers::runtime_cli()),
                    args,
                })
            }
        }
    }

    /// Launches the sandboxed command and blocks until it terminates.
    ///
    /// The child's exit code is mirrored without interpretation; use the
    /// [`run`] facade to turn non-zero exits into typed failures.
    #[instrument(skip(self, config, argv), fields(kind = %self.kind))]
    pub fn run(&mut self, config: &SandboxConfig, argv: &[String]) -> Result<CommandStatus> {
        let prepared = self.build_command(config, argv)?;
        self.realize_workspaces(config)?;

        debug!(program = %prepared.program.display(), "Spawning sandbox");
        let mut cmd = Command::new(&prepared.program);
        cmd.args(&prepared.args);
        cmd.stdin(config.stdin.to_stdin()?);
        cmd.stdout(config.stdout.to_output()?);
        cmd.stderr(config.stderr.to_output()?);

        let status = cmd.status().map_err(|source| ExecError::SpawnFailed {
            program: prepared.program.clone(),
            source,
        })?;

        let status = CommandStatus::from_exit(status);
        trace!(code = status.code, signal = ?status.signal, "Sandbox finished");
        Ok(status)
    }

    /// Releases per-run scratch space. Persistent overlay state is left on
    /// disk for the next executor over the same rootfs.
    pub fn cleanup(&mut self) {
        for (scratch, _) in self.state.scratch.drain(..) {
            let path = scratch.path().to_path_buf();
            if let Err(e) = scratch.close() {
                warn!(dir = %path.display(), error = %e, "Failed to remove scratch directory");
            }
        }
    }

    /// Allocates the upper/work pair for every overlay mount, without
    /// touching the persistent ones on disk yet.
    fn plan_workspaces(
        &mut self,
        config: &SandboxConfig,
    ) -> Result<(Vec<OverlayDirs>, bool)> {
        let keys = overlay_keys(config);
        let (userxattr, store) = self.store_for(config)?;
        let mut dirs = Vec::with_capacity(keys.len());
        for key in &keys {
            dirs.push(store.dirs_for(key)?);
        }
        Ok((dirs, userxattr))
    }

    /// Creates the planned workspace directories on disk.
    ///
    /// Must follow a `build_command` for the same config: non-persistent
    /// workspaces are realized in the scratch store that the plan allocated
    /// them in.
    fn realize_workspaces(&mut self, config: &SandboxConfig) -> Result<()> {
        if self.kind == ExecutorKind::ContainerRuntime {
            runtime::ensure_image(&config.mounts.root().host_path, config.verbose)?;
            return Ok(());
        }

        let keys = overlay_keys(config);
        let store = if config.persist {
            let (_, store) = self.store_for(config)?;
            store
        } else {
            let Some((_, store)) = self.state.scratch.last_mut() else {
                return Err(ExecError::MalformedHelperOutput {
                    context: "workspaces realized before being planned".to_string(),
                }
                .into());
            };
            store
        };

        for key in &keys {
            store.realize(key)?;
        }
        Ok(())
    }

    /// Returns the overlay store for this config, selecting (and memoizing)
    /// a persistence root on first persistent use.
    fn store_for(&mut self, config: &SandboxConfig) -> Result<(bool, &mut OverlayStore)> {
        if !config.persist {
            return self.scratch_store();
        }

        if self.state.persistent.is_none() {
            let rootfs = &config.mounts.root().host_path;
            let hints = persist::default_hints();
            let root = persist::find_persist_root(rootfs, &hints, config.verbose)?.ok_or_else(
                || HostError::NoPersistRoot {
                    rootfs: rootfs.clone(),
                },
            )?;
            debug!(root = %root.path.display(), userxattr = root.userxattr, "Selected persistence root");
            let store = OverlayStore::persistent(&root.path);
            self.state.persistent = Some((root, store));
        }

        // Initialized just above; lock-step with the None check.
        let (root, store) = self
            .state
            .persistent
            .as_mut()
            .expect("persistent store initialized above");
        Ok((root.userxattr, store))
    }

    /// A fresh per-run scratch store on the (usually tmpfs-backed) system
    /// temp directory.
    fn scratch_store(&mut self) -> Result<(bool, &mut OverlayStore)> {
        let scratch = tempfile::Builder::new()
            .prefix("nsbox-run-")
            .tempdir()
            .map_err(|source| HostError::Persistence {
                context: "failed to create per-run scratch directory".to_string(),
                source,
            })?;
        let store = OverlayStore::ephemeral(scratch.path());
        self.state.scratch.push((scratch, store));
        // Just pushed; the vector cannot be empty.
        let (_, store) = self
            .state
            .scratch
            .last_mut()
            .expect("scratch store pushed above");
        Ok((false, store))
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        self.cleanup();
    }
}

fn namespace_helper() -> Result<PathBuf> {
    helpers::helper_path(NAMESPACE_HELPER).ok_or_else(|| {
        Error::from(HostError::HelperMissing {
            name: NAMESPACE_HELPER.to_string(),
        })
    })
}

/// One persistence key per overlay mount, root first, in application order.
fn overlay_keys(config: &SandboxConfig) -> Vec<PersistenceKey> {
    config
        .mounts
        .overlays()
        .into_iter()
        .map(|(sandbox_path, info)| PersistenceKey::new(&info.host_path, sandbox_path))
        .collect()
}

/// Chooses an executor, runs `body` against it and releases it on every exit
/// path.
///
/// With `kind = None` the first available entry of
/// [`ExecutorKind::PREFERENCE`] is used.
///
/// # Errors
///
/// Returns `HostError::NoExecutor` when nothing is available, or
/// `HostError::ExecutorUnavailable` when the requested kind cannot run here.
pub fn with_executor<T>(
    kind: Option<ExecutorKind>,
    body: impl FnOnce(&mut Executor) -> Result<T>,
) -> Result<T> {
    let kind = match kind {
        Some(kind) => {
            if !kind.available() {
                return Err(HostError::ExecutorUnavailable {
                    kind: kind.to_string(),
                }
                .into());
            }
            kind
        }
        None => ExecutorKind::PREFERENCE
            .into_iter()
            .find(|kind| kind.available())
            .ok_or(HostError::NoExecutor)?,
    };

    debug!(%kind, "Acquired executor");
    let mut executor = Executor::new(kind);
    // Drop on `executor` releases scratch state even if `body` panics.
    body(&mut executor)
}

/// Runs a command and fails with `ExecError::ChildFailure` on non-zero exit.
pub fn run(
    executor: &mut Executor,
    config: &SandboxConfig,
    argv: &[String],
) -> Result<CommandStatus> {
    let status = executor.run(config, argv)?;
    if !status.success() {
        return Err(ExecError::ChildFailure { code: status.code }.into());
    }
    Ok(status)
}

/// Runs a command, reporting success as a boolean instead of an error.
pub fn success(
    executor: &mut Executor,
    config: &SandboxConfig,
    argv: &[String],
) -> Result<bool> {
    Ok(executor.run(config, argv)?.success())
}

/// Whether an executor kind can run on this host.
#[must_use]
pub fn executor_available(kind: ExecutorKind) -> bool {
    kind.available()
}
