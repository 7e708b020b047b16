//! Command-line construction for the namespace helper.
//!
//! Both user-namespace executors speak the same helper CLI; the privileged
//! variant only differs by the escalation wrapper applied afterwards. The
//! helper applies `--mount` arguments in reverse arrival order, so they are
//! emitted longest-sandbox-path-first (see [`MountGraph::ordered`]).
//!
//! [`MountGraph::ordered`]: crate::sandbox::MountGraph::ordered

use std::path::Path;

use crate::persist::OverlayDirs;
use crate::sandbox::SandboxConfig;

/// Builds the flag vector for one helper invocation.
///
/// `workspaces` must be aligned with `config.mounts.overlays()`: the rootfs
/// workspace first, then one pair per overlay mount in application order.
pub(crate) fn build_helper_args(
    config: &SandboxConfig,
    argv: &[String],
    workspaces: &[OverlayDirs],
    userxattr: bool,
) -> Vec<String> {
    debug_assert_eq!(workspaces.len(), config.mounts.overlays().len());

    let mut args = Vec::new();

    args.push("--rootfs".to_string());
    args.push(path_arg(&config.mounts.root().host_path));

    for (sandbox_path, info) in config.mounts.ordered() {
        args.push("--mount".to_string());
        args.push(format!(
            "{}:{}:{}",
            info.host_path.display(),
            sandbox_path.display(),
            info.kind.token()
        ));
    }

    for dirs in workspaces {
        args.push("--workspace".to_string());
        args.push(format!("{}:{}", dirs.upper.display(), dirs.work.display()));
    }

    for (key, value) in &config.env {
        args.push("--env".to_string());
        args.push(format!("{key}={value}"));
    }

    args.push("--cd".to_string());
    args.push(path_arg(&config.pwd));
    args.push("--uid".to_string());
    args.push(config.uid.to_string());
    args.push("--gid".to_string());
    args.push(config.gid.to_string());

    if let Some(hostname) = &config.hostname {
        args.push("--hostname".to_string());
        args.push(hostname.clone());
    }
    if let Some(entrypoint) = &config.entrypoint {
        args.push("--entrypoint".to_string());
        args.push(path_arg(entrypoint));
    }
    if let Some(bytes) = config.tmpfs_size {
        args.push("--tmpfs-size".to_string());
        args.push(bytes.to_string());
    }
    for format in &config.multiarch {
        args.push("--multiarch".to_string());
        args.push(format.clone());
    }
    if userxattr {
        args.push("--userxattr".to_string());
    }
    if config.verbose {
        args.push("--verbose".to_string());
    }

    args.push("--".to_string());
    args.extend(argv.iter().cloned());

    args
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
