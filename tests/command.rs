//! Integration tests for executor command construction and spawn plumbing.
//!
//! These tests install a stub namespace helper (a shell script) in a private
//! directory and point `SANDBOX_HELPER_DIR` at it, so the full
//! build-command-and-spawn path runs without kernel namespaces. Tests that
//! mutate the environment serialize on a mutex.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

use nsbox::error::{Error, ExecError, HostError};
use nsbox::executor::{self, Executor, ExecutorKind};
use nsbox::sandbox::{MountGraph, MountInfo, MountType, SandboxConfig, StdioSpec};

static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

fn env_lock() -> std::sync::MutexGuard<'static, ()> {
    ENV_LOCK
        .get_or_init(|| Mutex::new(()))
        .lock()
        .expect("env lock poisoned")
}

/// Installs a stub helper script and returns its directory.
fn install_stub_helper(body: &str) -> tempfile::TempDir {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::tempdir().expect("helper dir");
    let path = dir.path().join("nsbox-helper");
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write helper");
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
        .expect("chmod helper");
    dir
}

fn rootfs_config(rootfs: &Path) -> SandboxConfig {
    let graph = MountGraph::new(vec![(
        PathBuf::from("/"),
        MountInfo::new(rootfs, MountType::Overlayed).expect("rootfs mount"),
    )])
    .expect("graph");
    // Non-persistent: command tests must not depend on an overlay probe.
    SandboxConfig::new(graph).with_persist(false)
}

#[test]
fn test_build_command_emits_mounts_longest_first() {
    let _guard = env_lock();
    let helper_dir = install_stub_helper("exit 0");
    std::env::set_var("SANDBOX_HELPER_DIR", helper_dir.path());

    let rootfs = tempfile::tempdir().expect("rootfs");
    let mut entries = vec![(
        PathBuf::from("/"),
        MountInfo::new(rootfs.path(), MountType::Overlayed).expect("mount"),
    )];
    let sandbox_paths = ["/usr", "/usr/lib", "/usr/lib/test", "/etc", "/etc/config"];
    for sandbox in sandbox_paths {
        entries.push((
            PathBuf::from(sandbox),
            MountInfo::new("/etc", MountType::ReadOnly).expect("mount"),
        ));
    }
    let config =
        SandboxConfig::new(MountGraph::new(entries).expect("graph")).with_persist(false);

    let mut executor = Executor::new(ExecutorKind::UnprivilegedUserNamespaces);
    let prepared = executor
        .build_command(&config, &["/bin/true".to_string()])
        .expect("build_command");

    let mounts: Vec<&str> = prepared
        .args
        .iter()
        .enumerate()
        .filter(|(_, a)| *a == "--mount")
        .map(|(i, _)| prepared.args[i + 1].as_str())
        .collect();

    // A permutation of the non-root keys...
    let mut seen: Vec<&str> = mounts
        .iter()
        .map(|m| m.split(':').nth(1).expect("sandbox path"))
        .collect();
    let mut expected: Vec<&str> = sandbox_paths.to_vec();
    seen.sort_unstable();
    expected.sort_unstable();
    assert_eq!(seen, expected);

    // ...in non-increasing sandbox-path length.
    let lengths: Vec<usize> = mounts
        .iter()
        .map(|m| m.split(':').nth(1).expect("sandbox path").len())
        .collect();
    for pair in lengths.windows(2) {
        assert!(pair[0] >= pair[1], "mount lengths out of order: {lengths:?}");
    }

    std::env::remove_var("SANDBOX_HELPER_DIR");
}

#[test]
fn test_build_command_fails_without_helper() {
    let _guard = env_lock();
    let empty = tempfile::tempdir().expect("empty dir");
    std::env::set_var("SANDBOX_HELPER_DIR", empty.path());
    // Keep $PATH from providing one by accident.
    let saved_path = std::env::var_os("PATH");
    std::env::set_var("PATH", empty.path());

    let rootfs = tempfile::tempdir().expect("rootfs");
    let config = rootfs_config(rootfs.path());
    let mut executor = Executor::new(ExecutorKind::UnprivilegedUserNamespaces);

    let err = executor
        .build_command(&config, &["/bin/true".to_string()])
        .expect_err("must fail without a helper");
    assert!(matches!(
        err,
        Error::Host(HostError::HelperMissing { .. })
    ));

    if let Some(path) = saved_path {
        std::env::set_var("PATH", path);
    }
    std::env::remove_var("SANDBOX_HELPER_DIR");
}

/// The stub helper echoes its argv; running through the executor must
/// deliver it to the configured stdout file.
#[test]
fn test_run_passes_flags_and_captures_stdout() {
    let _guard = env_lock();
    let helper_dir = install_stub_helper("printf '%s\\n' \"$@\"");
    std::env::set_var("SANDBOX_HELPER_DIR", helper_dir.path());

    let rootfs = tempfile::tempdir().expect("rootfs");
    let out_dir = tempfile::tempdir().expect("out dir");
    let out_file = out_dir.path().join("stdout");

    let config = rootfs_config(rootfs.path())
        .with_env("SHELL", "monster")
        .with_hostname("sandy")
        .with_stdout(StdioSpec::File(out_file.clone()));

    let mut executor = Executor::new(ExecutorKind::UnprivilegedUserNamespaces);
    let status = executor
        .run(&config, &["/bin/echo".to_string(), "hi".to_string()])
        .expect("run");
    assert!(status.success());

    let captured = std::fs::read_to_string(&out_file).expect("read stdout file");
    let lines: Vec<&str> = captured.lines().collect();
    assert!(lines.contains(&"--rootfs"));
    assert!(lines.contains(&"SHELL=monster"));
    assert!(lines.contains(&"--hostname"));
    assert!(lines.contains(&"sandy"));
    assert!(lines.contains(&"--"));
    assert_eq!(lines.last(), Some(&"hi"));

    std::env::remove_var("SANDBOX_HELPER_DIR");
}

/// Workspace directories planned by build_command exist on disk after run
/// and are removed when the executor is released.
#[test]
fn test_scratch_workspaces_cleaned_on_release() {
    let _guard = env_lock();
    let helper_dir = install_stub_helper("printf '%s\\n' \"$@\"");
    std::env::set_var("SANDBOX_HELPER_DIR", helper_dir.path());

    let rootfs = tempfile::tempdir().expect("rootfs");
    let out_dir = tempfile::tempdir().expect("out dir");
    let out_file = out_dir.path().join("stdout");
    let config = rootfs_config(rootfs.path()).with_stdout(StdioSpec::File(out_file.clone()));

    let mut executor = Executor::new(ExecutorKind::UnprivilegedUserNamespaces);
    let status = executor
        .run(&config, &["/bin/true".to_string()])
        .expect("run");
    assert!(status.success());

    // The stub echoed the argv of the real run; recover its workspace pair.
    let captured = std::fs::read_to_string(&out_file).expect("read stdout file");
    let lines: Vec<&str> = captured.lines().collect();
    let workspace_idx = lines
        .iter()
        .position(|l| *l == "--workspace")
        .expect("workspace flag");
    let workspace = lines[workspace_idx + 1];
    let upper = PathBuf::from(workspace.split(':').next().expect("upper"));
    let work = PathBuf::from(workspace.split(':').nth(1).expect("work"));

    assert!(upper.is_dir(), "upper must exist while the executor lives");
    assert!(work.is_dir(), "work must exist while the executor lives");

    // Release: scoped cleanup runs on drop, panics included.
    drop(executor);
    assert!(!upper.exists(), "scratch upper must be removed on release");
    assert!(!work.exists(), "scratch work must be removed on release");

    std::env::remove_var("SANDBOX_HELPER_DIR");
}

#[test]
fn test_child_failure_is_typed() {
    let _guard = env_lock();
    let helper_dir = install_stub_helper("exit 7");
    std::env::set_var("SANDBOX_HELPER_DIR", helper_dir.path());

    let rootfs = tempfile::tempdir().expect("rootfs");
    let config = rootfs_config(rootfs.path());
    let mut executor = Executor::new(ExecutorKind::UnprivilegedUserNamespaces);

    // The raw executor mirrors the exit code.
    let status = executor
        .run(&config, &["/bin/true".to_string()])
        .expect("run");
    assert_eq!(status.code, 7);
    assert!(!status.success());

    // The facade turns it into a typed failure.
    let err = executor::run(&mut executor, &config, &["/bin/true".to_string()])
        .expect_err("non-zero exit must be a ChildFailure");
    assert!(matches!(
        err,
        Error::Exec(ExecError::ChildFailure { code: 7 })
    ));

    // The status-ignoring wrapper reports it as a boolean.
    let ok = executor::success(&mut executor, &config, &["/bin/true".to_string()])
        .expect("success");
    assert!(!ok);

    std::env::remove_var("SANDBOX_HELPER_DIR");
}

/// OverlayedReadOnly on the container runtime is reported broken, never
/// silently downgraded.
#[test]
fn test_container_runtime_reports_broken_overlay() {
    let rootfs = tempfile::tempdir().expect("rootfs");
    let lower = tempfile::tempdir().expect("lower");
    let graph = MountGraph::new(vec![
        (
            PathBuf::from("/"),
            MountInfo::new(rootfs.path(), MountType::Overlayed).expect("mount"),
        ),
        (
            PathBuf::from("/frozen"),
            MountInfo::new(lower.path(), MountType::OverlayedReadOnly).expect("mount"),
        ),
    ])
    .expect("graph");
    let config = SandboxConfig::new(graph).with_persist(false);

    let mut executor = Executor::new(ExecutorKind::ContainerRuntime);
    let err = executor
        .build_command(&config, &["/bin/true".to_string()])
        .expect_err("overlay-ro must be reported broken");
    assert!(matches!(
        err,
        Error::Host(HostError::BrokenMount { .. })
    ));
}

#[test]
fn test_with_executor_rejects_unavailable_kind() {
    let _guard = env_lock();
    // No helper anywhere: the unprivileged kind cannot be available.
    let empty = tempfile::tempdir().expect("empty dir");
    std::env::set_var("SANDBOX_HELPER_DIR", empty.path());
    let saved_path = std::env::var_os("PATH");
    std::env::set_var("PATH", empty.path());

    let result = executor::with_executor(
        Some(ExecutorKind::UnprivilegedUserNamespaces),
        |_| Ok(()),
    );
    assert!(matches!(
        result,
        Err(Error::Host(HostError::ExecutorUnavailable { .. }))
    ));

    if let Some(path) = saved_path {
        std::env::set_var("PATH", path);
    }
    std::env::remove_var("SANDBOX_HELPER_DIR");
}
