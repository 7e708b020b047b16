//! Helper binary discovery, process-wide memos, and shell plumbing shared by
//! the executors.
//!
//! The escalation wrapper and the env-backed preferences are resolved at most
//! once per process: every winner of a first-write race computes the same
//! value, so a plain `OnceLock` is enough.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use tracing::{debug, warn};

use crate::system;

/// The trusted program that enters namespaces, applies mounts and execs the
/// user command.
pub const NAMESPACE_HELPER: &str = "nsbox-helper";

/// The trusted program that answers "can this directory back an overlay?".
pub const OVERLAY_PROBE_HELPER: &str = "nsbox-overlay-probe";

/// Per-user data directory: `$XDG_DATA_HOME/nsbox`, else `~/.local/share/nsbox`,
/// else a shared location under the system temp dir.
#[must_use]
pub fn user_data_dir() -> PathBuf {
    if let Ok(xdg_data) = std::env::var("XDG_DATA_HOME") {
        if !xdg_data.is_empty() {
            return PathBuf::from(xdg_data).join("nsbox");
        }
    }
    if let Ok(home) = std::env::var("HOME") {
        if !home.is_empty() {
            return PathBuf::from(home).join(".local/share/nsbox");
        }
    }
    std::env::temp_dir().join("nsbox")
}

/// Locates a helper binary by name.
///
/// Tried in order: `SANDBOX_HELPER_DIR`, the per-user data directory's `bin/`,
/// then `$PATH`. Environment variables are re-read on every call so tests and
/// long-lived hosts can repoint helpers without restarting.
#[must_use]
pub fn helper_path(name: &str) -> Option<PathBuf> {
    if let Ok(dir) = std::env::var("SANDBOX_HELPER_DIR") {
        let candidate = Path::new(&dir).join(name);
        if is_executable(&candidate) {
            return Some(candidate);
        }
    }

    let candidate = user_data_dir().join("bin").join(name);
    if is_executable(&candidate) {
        return Some(candidate);
    }

    which(name)
}

/// Searches `$PATH` for an executable.
#[must_use]
pub fn which(name: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Whether the host application should build helpers from source rather than
/// use prebuilt ones. Read once; this engine only passes the answer through.
#[must_use]
pub fn build_local_sandbox() -> bool {
    static MEMO: OnceLock<bool> = OnceLock::new();
    *MEMO.get_or_init(|| {
        std::env::var("SANDBOX_BUILD_LOCAL_SANDBOX")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false)
    })
}

/// Name of the OCI runtime CLI used by the container-runtime executor.
#[must_use]
pub fn runtime_cli() -> &'static str {
    static MEMO: OnceLock<String> = OnceLock::new();
    MEMO.get_or_init(|| {
        std::env::var("SANDBOX_RUNTIME_CLI").unwrap_or_else(|_| "docker".to_string())
    })
}

/// How the privileged executor reaches root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Escalation {
    /// Already uid 0; no wrapper needed.
    AlreadyRoot,
    /// `sudo <helper> ...` (non-interactive probe succeeded).
    Sudo,
    /// `su root -c '<helper> ...'`.
    Su,
    /// Nothing usable; commands run unwrapped with a warning.
    Unavailable,
}

impl Escalation {
    pub(crate) fn usable(self) -> bool {
        self != Self::Unavailable
    }
}

/// Selects the escalation wrapper, memoized process-wide.
pub(crate) fn escalation() -> Escalation {
    static MEMO: OnceLock<Escalation> = OnceLock::new();
    *MEMO.get_or_init(|| {
        let selected = detect_escalation();
        debug!(?selected, "Selected root escalation wrapper");
        selected
    })
}

fn detect_escalation() -> Escalation {
    if system::uid() == 0 {
        return Escalation::AlreadyRoot;
    }

    if which("sudo").is_some() {
        let probe = std::process::Command::new("sudo")
            .args(["-n", "true"])
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status();
        if probe.map(|s| s.success()).unwrap_or(false) {
            return Escalation::Sudo;
        }
    }

    if which("su").is_some() {
        return Escalation::Su;
    }

    warn!("No usable root escalation found; privileged commands will run unwrapped");
    Escalation::Unavailable
}

/// Wraps a helper invocation in the given escalation mechanism.
pub(crate) fn wrap(
    escalation: Escalation,
    program: PathBuf,
    args: Vec<String>,
) -> (PathBuf, Vec<String>) {
    match escalation {
        Escalation::AlreadyRoot | Escalation::Unavailable => (program, args),
        Escalation::Sudo => {
            let mut wrapped = vec![program.to_string_lossy().into_owned()];
            wrapped.extend(args);
            (PathBuf::from("sudo"), wrapped)
        }
        Escalation::Su => {
            let mut line = shell_quote(&program.to_string_lossy());
            for arg in &args {
                line.push(' ');
                line.push_str(&shell_quote(arg));
            }
            (
                PathBuf::from("su"),
                vec!["root".to_string(), "-c".to_string(), line],
            )
        }
    }
}

/// Single-quote a string for `sh -c` consumption.
#[must_use]
pub(crate) fn shell_quote(s: &str) -> String {
    if !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || "-_./:=".contains(c)) {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', "'\\''"))
}
