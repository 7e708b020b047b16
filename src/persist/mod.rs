//! Overlay persistence: selecting a backing filesystem and managing the
//! keyed upper/work directories that live on it.
//!
//! # Storage layout
//!
//! Each persistent overlay gets a keyed directory under the selected
//! persistence root:
//!
//! ```text
//! {persist_root}/
//! └── {rootfs-basename}-{key-hash}/
//!     ├── upper/      # overlay upper layer (writable changes)
//!     ├── work/       # overlay work directory (kernel internal)
//!     └── meta.json   # provenance for out-of-band pruning
//! ```
//!
//! Non-persistent overlays use the same layout under a per-run temporary
//! directory that is removed when the executor is released.

mod dirs;
mod root;

pub use dirs::{OverlayDirs, OverlayStore, PersistenceKey};
pub use root::{default_hints, find_persist_root, PersistenceRoot};
