//! Integration tests for sandbox configuration construction.
//!
//! Covers the equivalence of the legacy three-map constructor with the full
//! mount-graph form, the copy form, and the validation boundaries.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use nsbox::error::ConfigError;
use nsbox::sandbox::{MountGraph, MountInfo, MountType, SandboxConfig, StdioSpec};

fn rootfs() -> tempfile::TempDir {
    tempfile::tempdir().expect("failed to create rootfs tempdir")
}

/// The legacy `(ro_maps, rw_maps)` form must yield the same mount graph as
/// spelling the kinds out by hand.
#[test]
fn test_legacy_and_full_forms_agree() {
    let rootfs = rootfs();

    let mut ro = BTreeMap::new();
    ro.insert(PathBuf::from("/"), rootfs.path().to_path_buf());
    ro.insert(PathBuf::from("/static/etc"), PathBuf::from("/etc"));
    let mut rw = BTreeMap::new();
    rw.insert(PathBuf::from("/workspace"), PathBuf::from("/tmp"));

    let legacy = SandboxConfig::from_maps(ro, rw, BTreeMap::new()).expect("legacy config");

    let full = SandboxConfig::new(
        MountGraph::new(vec![
            (
                PathBuf::from("/"),
                MountInfo::new(rootfs.path(), MountType::Overlayed).expect("mount"),
            ),
            (
                PathBuf::from("/static/etc"),
                MountInfo::new("/etc", MountType::ReadOnly).expect("mount"),
            ),
            (
                PathBuf::from("/workspace"),
                MountInfo::new("/tmp", MountType::ReadWrite).expect("mount"),
            ),
        ])
        .expect("graph"),
    );

    assert_eq!(legacy.mounts, full.mounts);
}

#[test]
fn test_legacy_form_env_is_applied() {
    let rootfs = rootfs();
    let mut ro = BTreeMap::new();
    ro.insert(PathBuf::from("/"), rootfs.path().to_path_buf());
    let mut env = BTreeMap::new();
    env.insert("PATH".to_string(), "/usr/bin:/bin".to_string());

    let config = SandboxConfig::from_maps(ro, BTreeMap::new(), env).expect("config");
    assert_eq!(config.env.get("PATH"), Some(&String::from("/usr/bin:/bin")));
}

/// Every key and every host path in a validated config is absolute, and `/`
/// is always present.
#[test]
fn test_validated_graph_invariants() {
    let rootfs = rootfs();
    let mut ro = BTreeMap::new();
    ro.insert(PathBuf::from("/"), rootfs.path().to_path_buf());
    ro.insert(PathBuf::from("/static/etc"), PathBuf::from("/etc"));
    let config = SandboxConfig::from_maps(ro, BTreeMap::new(), BTreeMap::new()).expect("config");

    assert!(config.mounts.get(Path::new("/")).is_some());
    for (sandbox_path, info) in config.mounts.iter() {
        assert!(sandbox_path.is_absolute(), "{sandbox_path:?}");
        assert!(info.host_path.is_absolute(), "{:?}", info.host_path);
    }
}

#[test]
fn test_rejects_relative_pwd_and_entrypoint() {
    let rootfs = rootfs();
    let graph = MountGraph::new(vec![(
        PathBuf::from("/"),
        MountInfo::new(rootfs.path(), MountType::Overlayed).expect("mount"),
    )])
    .expect("graph");

    let err = SandboxConfig::new(graph.clone())
        .with_pwd("lib")
        .expect_err("pwd=\"lib\" must be rejected");
    assert!(matches!(err, ConfigError::RelativePath { field: "pwd", .. }));

    let err = SandboxConfig::new(graph)
        .with_entrypoint("init")
        .expect_err("entrypoint=\"init\" must be rejected");
    assert!(matches!(
        err,
        ConfigError::RelativePath {
            field: "entrypoint",
            ..
        }
    ));
}

/// Deriving a config that only changes stdio must leave every other field
/// untouched.
#[test]
fn test_copy_form_preserves_everything_but_stdio() {
    let rootfs = rootfs();
    let mut ro = BTreeMap::new();
    ro.insert(PathBuf::from("/"), rootfs.path().to_path_buf());
    let base = SandboxConfig::from_maps(ro, BTreeMap::new(), BTreeMap::new())
        .expect("config")
        .with_env("SHELL", "monster")
        .with_hostname("sandy")
        .with_ids(999, 999)
        .with_tmpfs_size(1 << 20)
        .with_multiarch("linux/arm64")
        .with_persist(false)
        .with_verbose(true);

    let derived = base
        .clone()
        .with_stdin(StdioSpec::File(PathBuf::from("/tmp/in")))
        .with_stdout(StdioSpec::Null)
        .with_stderr(StdioSpec::File(PathBuf::from("/tmp/err")));

    assert_eq!(derived.mounts, base.mounts);
    assert_eq!(derived.env, base.env);
    assert_eq!(derived.entrypoint, base.entrypoint);
    assert_eq!(derived.pwd, base.pwd);
    assert_eq!(derived.persist, base.persist);
    assert_eq!((derived.uid, derived.gid), (base.uid, base.gid));
    assert_eq!(derived.hostname, base.hostname);
    assert_eq!(derived.tmpfs_size, base.tmpfs_size);
    assert_eq!(derived.multiarch, base.multiarch);
    assert_eq!(derived.verbose, base.verbose);
}

#[test]
fn test_duplicate_sandbox_path_rejected_across_maps() {
    let rootfs = rootfs();
    let mut ro = BTreeMap::new();
    ro.insert(PathBuf::from("/"), rootfs.path().to_path_buf());
    ro.insert(PathBuf::from("/mixed"), PathBuf::from("/etc"));
    let mut rw = BTreeMap::new();
    rw.insert(PathBuf::from("/mixed"), PathBuf::from("/tmp"));

    let err = SandboxConfig::from_maps(ro, rw, BTreeMap::new())
        .expect_err("duplicate key must be rejected");
    assert!(matches!(err, ConfigError::DuplicateMount { .. }));
}
