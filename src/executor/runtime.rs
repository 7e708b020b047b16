//! The container-runtime executor boundary.
//!
//! Instead of the namespace helper, this executor drives an OCI-compatible
//! CLI (`docker` by default, `SANDBOX_RUNTIME_CLI` to override). The rootfs
//! is imported once per path as an image; bind mounts translate to volume
//! flags; the runtime's own copy-on-write layer stands in for the rootfs
//! overlay. What the runtime cannot express is reported as broken rather
//! than silently downgraded: overlay mounts below the rootfs are refused.

use std::hash::{Hash, Hasher};
use std::path::Path;
use std::process::{Command, Stdio};

use tracing::{debug, trace, warn};

use crate::error::{Error, ExecError, HostError};
use crate::executor::helpers;
use crate::sandbox::{MountType, SandboxConfig};

/// Returns true when the runtime CLI answers a version query.
pub(crate) fn runtime_available() -> bool {
    Command::new(helpers::runtime_cli())
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Image tag for a rootfs path: stable per path, safe for image references.
pub(crate) fn image_tag(rootfs: &Path) -> String {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    rootfs.hash(&mut hasher);
    format!("nsbox/rootfs:{:016x}", hasher.finish())
}

/// Imports the rootfs as an image unless the tag already exists.
///
/// The import streams `tar -c` straight into `<cli> import -`, so nothing is
/// staged on disk.
pub(crate) fn ensure_image(rootfs: &Path, verbose: bool) -> Result<String, Error> {
    let cli = helpers::runtime_cli();
    let tag = image_tag(rootfs);

    let exists = Command::new(cli)
        .args(["image", "inspect", &tag])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false);
    if exists {
        trace!(%tag, "Rootfs image already imported");
        return Ok(tag);
    }

    debug!(rootfs = %rootfs.display(), %tag, "Importing rootfs image");
    let mut tar = Command::new("tar")
        .arg("-c")
        .arg("-C")
        .arg(rootfs)
        .arg(".")
        .stdout(Stdio::piped())
        .stderr(if verbose { Stdio::inherit() } else { Stdio::null() })
        .spawn()
        .map_err(|source| ExecError::SpawnFailed {
            program: "tar".into(),
            source,
        })?;

    let tar_stdout = tar.stdout.take().ok_or_else(|| HostError::RuntimeImage {
        context: "tar produced no stdout pipe".to_string(),
    })?;

    let import_status = Command::new(cli)
        .args(["import", "-", &tag])
        .stdin(Stdio::from(tar_stdout))
        .stdout(Stdio::null())
        .stderr(if verbose { Stdio::inherit() } else { Stdio::null() })
        .status()
        .map_err(|source| ExecError::SpawnFailed {
            program: cli.into(),
            source,
        })?;

    let tar_status = tar.wait().map_err(|source| ExecError::WaitFailed { source })?;
    if !tar_status.success() {
        return Err(HostError::RuntimeImage {
            context: format!("tar of {} failed", rootfs.display()),
        }
        .into());
    }
    if !import_status.success() {
        return Err(HostError::RuntimeImage {
            context: format!("{cli} import of {} failed", rootfs.display()),
        }
        .into());
    }

    Ok(tag)
}

/// Builds the `run` argument vector for the runtime CLI.
///
/// # Errors
///
/// Returns `HostError::BrokenMount` for mount kinds this executor cannot
/// express: `OverlayedReadOnly` anywhere, and `Overlayed` anywhere but `/`.
pub(crate) fn build_run_args(
    config: &SandboxConfig,
    argv: &[String],
    image: &str,
) -> Result<Vec<String>, Error> {
    let mut args = vec!["run".to_string(), "--rm".to_string(), "-i".to_string()];

    for (sandbox_path, info) in config.mounts.ordered() {
        match info.kind {
            MountType::ReadOnly => {
                args.push("-v".to_string());
                args.push(format!(
                    "{}:{}:ro",
                    info.host_path.display(),
                    sandbox_path.display()
                ));
            }
            MountType::ReadWrite => {
                args.push("-v".to_string());
                args.push(format!(
                    "{}:{}",
                    info.host_path.display(),
                    sandbox_path.display()
                ));
            }
            MountType::Overlayed | MountType::OverlayedReadOnly => {
                return Err(HostError::BrokenMount {
                    mount_point: sandbox_path.to_path_buf(),
                    kind: info.kind.to_string(),
                    executor: "container runtime".to_string(),
                }
                .into());
            }
        }
    }

    args.push("--user".to_string());
    args.push(format!("{}:{}", config.uid, config.gid));
    if let Some(hostname) = &config.hostname {
        args.push("--hostname".to_string());
        args.push(hostname.clone());
    }
    args.push("-w".to_string());
    args.push(config.pwd.to_string_lossy().into_owned());

    for (key, value) in &config.env {
        args.push("-e".to_string());
        args.push(format!("{key}={value}"));
    }

    if let Some(entrypoint) = &config.entrypoint {
        args.push("--entrypoint".to_string());
        args.push(entrypoint.to_string_lossy().into_owned());
    }

    if !config.multiarch.is_empty() {
        warn!("multiarch formats are not supported by the container-runtime executor; ignoring");
    }
    if config.persist {
        trace!("container-runtime copy-on-write state does not persist across runs");
    }

    args.push(image.to_string());
    args.extend(argv.iter().cloned());

    Ok(args)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::sandbox::{MountGraph, MountInfo};

    fn test_config(rootfs: &Path) -> SandboxConfig {
        let graph = MountGraph::new(vec![(
            PathBuf::from("/"),
            MountInfo::overlayed(rootfs).expect("rootfs mount"),
        )])
        .expect("graph");
        SandboxConfig::new(graph)
    }

    #[test]
    fn test_image_tag_stable_per_path() {
        assert_eq!(
            image_tag(Path::new("/srv/rootfs")),
            image_tag(Path::new("/srv/rootfs"))
        );
        assert_ne!(
            image_tag(Path::new("/srv/rootfs")),
            image_tag(Path::new("/srv/other"))
        );
        assert!(image_tag(Path::new("/srv/rootfs")).starts_with("nsbox/rootfs:"));
    }

    #[test]
    fn test_run_args_shape() {
        let rootfs = tempfile::tempdir().expect("tempdir");
        let config = test_config(rootfs.path())
            .with_env("PATH", "/bin")
            .with_ids(1000, 1000)
            .with_hostname("sandy");

        let args =
            build_run_args(&config, &["id".to_string()], "nsbox/rootfs:abc").expect("args");

        assert_eq!(&args[..3], &["run", "--rm", "-i"]);
        assert!(args.windows(2).any(|w| w == ["--user", "1000:1000"]));
        assert!(args.windows(2).any(|w| w == ["--hostname", "sandy"]));
        assert!(args.windows(2).any(|w| w == ["-e", "PATH=/bin"]));
        assert_eq!(&args[args.len() - 2..], &["nsbox/rootfs:abc", "id"]);
    }

    #[test]
    fn test_volume_flags() {
        let rootfs = tempfile::tempdir().expect("tempdir");
        let graph = MountGraph::new(vec![
            (
                PathBuf::from("/"),
                MountInfo::overlayed(rootfs.path()).expect("mount"),
            ),
            (
                PathBuf::from("/read_only"),
                MountInfo::read_only("/etc").expect("mount"),
            ),
            (
                PathBuf::from("/workspace"),
                MountInfo::read_write("/tmp").expect("mount"),
            ),
        ])
        .expect("graph");
        let config = SandboxConfig::new(graph);

        let args = build_run_args(&config, &["true".to_string()], "img").expect("args");
        assert!(args.contains(&"/etc:/read_only:ro".to_string()));
        assert!(args.contains(&"/tmp:/workspace".to_string()));
    }

    #[test]
    fn test_overlay_below_root_reported_broken() {
        let rootfs = tempfile::tempdir().expect("tempdir");
        let lower = tempfile::tempdir().expect("tempdir");
        let graph = MountGraph::new(vec![
            (
                PathBuf::from("/"),
                MountInfo::overlayed(rootfs.path()).expect("mount"),
            ),
            (
                PathBuf::from("/opt/tool"),
                MountInfo::new(lower.path(), MountType::OverlayedReadOnly).expect("mount"),
            ),
        ])
        .expect("graph");
        let config = SandboxConfig::new(graph);

        let err = build_run_args(&config, &["true".to_string()], "img")
            .expect_err("overlay-ro must be reported broken");
        assert!(matches!(
            err,
            Error::Host(HostError::BrokenMount { .. })
        ));
    }
}
