//! Cross-platform utilities used by the upgrade engine
//!
//! - [`fs`] - atomic writes and co-located derived paths
//! - [`platform`] - OS/architecture detection and release asset naming

pub mod fs;
pub mod platform;

pub use fs::{atomic_write, ensure_dir, with_suffix};
pub use platform::{Arch, Os, Platform};
