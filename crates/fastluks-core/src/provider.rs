//! Seams between the workflows and the host they drive.
//!
//! Every privileged action (format, open, mount, service restart) goes
//! through a [`CommandRunner`], and every filesystem probe through a
//! [`HostProbe`], so the state machines can be exercised with fakes.

use std::path::Path;

/// Collected stdout, stderr, and exit status of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub status: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }

    /// Prefer stderr, fall back to stdout, for human-facing diagnostics.
    pub fn diagnostic(&self) -> &str {
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            stderr
        } else {
            self.stdout.trim()
        }
    }
}

/// Executes external programs.
///
/// Implementations never fail: a program that cannot be spawned or that
/// times out is reported through a non-zero `status` and an explanatory
/// `stderr`, so callers interpret every outcome through the exit code.
pub trait CommandRunner {
    /// Run `program` with `args`, writing `input` to its stdin when present.
    fn run(&self, program: &str, args: &[&str], input: Option<&[u8]>) -> CommandOutput;
}

impl<R: CommandRunner + ?Sized> CommandRunner for &R {
    fn run(&self, program: &str, args: &[&str], input: Option<&[u8]>) -> CommandOutput {
        (**self).run(program, args, input)
    }
}

/// Read-only questions about host filesystem state.
pub trait HostProbe {
    /// True when `path` is the root of a mounted filesystem.
    fn is_mount_point(&self, path: &Path) -> bool;

    /// True when `path` exists and is a block device node.
    fn is_block_device(&self, path: &Path) -> bool;

    /// Lower-case distribution identifier (`ID=` in os-release), if known.
    fn distro_id(&self) -> Option<String>;
}

impl<H: HostProbe + ?Sized> HostProbe for &H {
    fn is_mount_point(&self, path: &Path) -> bool {
        (**self).is_mount_point(path)
    }

    fn is_block_device(&self, path: &Path) -> bool {
        (**self).is_block_device(path)
    }

    fn distro_id(&self) -> Option<String> {
        (**self).distro_id()
    }
}
