//! Host-backed implementations of the fastluks seams: running the real
//! binaries, probing mounts and block devices, and locating `cryptsetup`.

mod command;
mod discovery;
mod host;
mod parse;

pub use command::{SystemCommandRunner, SPAWN_FAILED_STATUS, TIMED_OUT_STATUS};
pub use discovery::{discover_cryptsetup, with_discovered_binaries, DEFAULT_CRYPTSETUP_PATHS};
pub use host::{running_as_root, SystemHost, OS_RELEASE_PATHS};
