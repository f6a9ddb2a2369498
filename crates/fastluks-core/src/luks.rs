//! Thin wrapper over the `cryptsetup` CLI and the helpers that read its
//! neighbours' output (`lsblk`, `df`).
//!
//! Passphrases always travel over stdin, never on the command line.

use crate::config::CryptoCfg;
use crate::error::{LuksError, LuksResult};
use crate::passphrase::stdin_line;
use crate::provider::{CommandOutput, CommandRunner};
use regex::Regex;
use std::fmt;
use std::path::Path;

/// Meaning of a `cryptsetup` exit status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolExit {
    Success,
    InvalidParameters,
    BadPassphrase,
    OutOfMemory,
    WrongDevice,
    DeviceBusy,
    Other(i32),
}

impl ToolExit {
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => ToolExit::Success,
            1 => ToolExit::InvalidParameters,
            2 => ToolExit::BadPassphrase,
            3 => ToolExit::OutOfMemory,
            4 => ToolExit::WrongDevice,
            5 => ToolExit::DeviceBusy,
            other => ToolExit::Other(other),
        }
    }

    pub fn code(self) -> i32 {
        match self {
            ToolExit::Success => 0,
            ToolExit::InvalidParameters => 1,
            ToolExit::BadPassphrase => 2,
            ToolExit::OutOfMemory => 3,
            ToolExit::WrongDevice => 4,
            ToolExit::DeviceBusy => 5,
            ToolExit::Other(code) => code,
        }
    }

    pub fn describe(self) -> &'static str {
        match self {
            ToolExit::Success => "success",
            ToolExit::InvalidParameters => "wrong parameters",
            ToolExit::BadPassphrase => "no permission (bad passphrase)",
            ToolExit::OutOfMemory => "out of memory",
            ToolExit::WrongDevice => "wrong device specified",
            ToolExit::DeviceBusy => "device already exists or device is busy",
            ToolExit::Other(_) => "unrecognised exit status",
        }
    }
}

impl fmt::Display for ToolExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "exit code {}: {}", self.code(), self.describe())
    }
}

/// Turn a finished command into `Ok(())` or a [`LuksError::Tool`] carrying its
/// mapped exit code and raw diagnostic.
pub fn check_tool(tool: &str, output: &CommandOutput) -> LuksResult<()> {
    match ToolExit::from_code(output.status) {
        ToolExit::Success => Ok(()),
        exit => Err(LuksError::Tool {
            tool: tool.to_string(),
            exit,
            diagnostic: if output.diagnostic().is_empty() {
                "no additional output".to_string()
            } else {
                output.diagnostic().to_string()
            },
        }),
    }
}

/// `cryptsetup` invocations used by the workflows.
pub struct Cryptsetup<'a, R: CommandRunner> {
    runner: &'a R,
    binary: &'a str,
}

impl<'a, R: CommandRunner> Cryptsetup<'a, R> {
    pub fn new(runner: &'a R, binary: &'a str) -> Self {
        Self { runner, binary }
    }

    /// `luksFormat` the device with the configured cipher parameters.
    pub fn format(&self, device: &str, secret: &str, crypto: &CryptoCfg) -> CommandOutput {
        let keysize = crypto.keysize.to_string();
        let iter_time = crypto.iter_time_ms.to_string();
        let args = [
            "-v",
            "--cipher",
            crypto.cipher_algorithm.as_str(),
            "--key-size",
            keysize.as_str(),
            "--hash",
            crypto.hash_algorithm.as_str(),
            "--iter-time",
            iter_time.as_str(),
            "--use-urandom",
            "--batch-mode",
            "luksFormat",
            device,
        ];
        let input = stdin_line(secret);
        self.runner.run(self.binary, &args, Some(input.as_slice()))
    }

    /// Store a binary copy of the header and keyslot area at `file`.
    pub fn header_backup(&self, device: &str, file: &Path) -> CommandOutput {
        let file = file.to_string_lossy().into_owned();
        self.runner.run(
            self.binary,
            &["luksHeaderBackup", "--header-backup-file", file.as_str(), device],
            None,
        )
    }

    pub fn open(&self, device: &str, name: &str, secret: &str) -> CommandOutput {
        let input = stdin_line(secret);
        self.runner
            .run(self.binary, &["luksOpen", device, name], Some(input.as_slice()))
    }

    pub fn close(&self, name: &str) -> CommandOutput {
        self.runner.run(self.binary, &["luksClose", name], None)
    }

    pub fn status(&self, name: &str) -> CommandOutput {
        self.runner.run(self.binary, &["-v", "status", name], None)
    }

    pub fn dump(&self, device: &str) -> CommandOutput {
        self.runner.run(self.binary, &["luksDump", device], None)
    }

    /// Read the LUKS header UUID of `device`.
    pub fn uuid(&self, device: &str) -> LuksResult<String> {
        let out = self.runner.run(self.binary, &["luksUUID", device], None);
        check_tool("cryptsetup luksUUID", &out)?;
        Ok(out.stdout.trim().to_string())
    }
}

/// True when `lsblk -l -p -n -o NAME,FSTYPE` output lists `device` with a LUKS
/// signature.
pub fn lsblk_reports_luks(listing: &str, device: &str) -> bool {
    let pattern = format!(r"(?m)^\s*{}\s+crypto_LUKS\b", regex::escape(device));
    Regex::new(&pattern)
        .map(|re| re.is_match(listing))
        .unwrap_or(false)
}

/// Source device of the last row of `df -P <path>` output.
pub fn df_source(output: &str) -> Option<String> {
    output
        .lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .and_then(|line| line.split_whitespace().next())
        .filter(|source| *source != "Filesystem")
        .map(str::to_string)
}

pub fn mapper_path(name: &str) -> String {
    format!("/dev/mapper/{name}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[derive(Default)]
    struct Recorder {
        calls: RefCell<Vec<(String, Vec<String>, Option<Vec<u8>>)>>,
    }

    impl CommandRunner for Recorder {
        fn run(&self, program: &str, args: &[&str], input: Option<&[u8]>) -> CommandOutput {
            self.calls.borrow_mut().push((
                program.to_string(),
                args.iter().map(|a| a.to_string()).collect(),
                input.map(<[u8]>::to_vec),
            ));
            CommandOutput {
                stdout: "0b4f1c3e-8a51-4c1d-9d2e-5f4a3b2c1d0e\n".into(),
                ..CommandOutput::default()
            }
        }
    }

    #[test]
    fn exit_code_mapping_is_total_and_exact() {
        let expected = [
            (0, ToolExit::Success),
            (1, ToolExit::InvalidParameters),
            (2, ToolExit::BadPassphrase),
            (3, ToolExit::OutOfMemory),
            (4, ToolExit::WrongDevice),
            (5, ToolExit::DeviceBusy),
        ];
        for (code, exit) in expected {
            assert_eq!(ToolExit::from_code(code), exit);
            assert_eq!(exit.code(), code);
        }
        for code in [-1, 6, 127, 255] {
            assert_eq!(ToolExit::from_code(code), ToolExit::Other(code));
            assert_eq!(ToolExit::from_code(code).code(), code);
        }
    }

    #[test]
    fn check_tool_keeps_raw_output_for_unknown_codes() {
        let out = CommandOutput {
            stdout: "partial".into(),
            stderr: "kernel says no".into(),
            status: 22,
        };
        match check_tool("cryptsetup luksOpen", &out).unwrap_err() {
            LuksError::Tool {
                exit, diagnostic, ..
            } => {
                assert_eq!(exit, ToolExit::Other(22));
                assert_eq!(diagnostic, "kernel says no");
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(check_tool("x", &CommandOutput::default()).is_ok());
    }

    #[test]
    fn format_passes_secret_on_stdin_only() {
        let runner = Recorder::default();
        let cs = Cryptsetup::new(&runner, "/sbin/cryptsetup");
        cs.format("/dev/vdb", "hunter2", &CryptoCfg::default());
        let calls = runner.calls.borrow();
        let (program, args, input) = &calls[0];
        assert_eq!(program, "/sbin/cryptsetup");
        assert!(!args.iter().any(|a| a.contains("hunter2")));
        assert_eq!(input.as_deref(), Some(&b"hunter2\n"[..]));
        assert_eq!(args.last().map(String::as_str), Some("/dev/vdb"));
        assert!(args.windows(2).any(|w| w[0] == "--key-size" && w[1] == "256"));
    }

    #[test]
    fn uuid_is_trimmed() {
        let runner = Recorder::default();
        let cs = Cryptsetup::new(&runner, "cryptsetup");
        let uuid = cs.uuid("/dev/vdb").unwrap();
        assert_eq!(uuid.len(), 36);
    }

    #[test]
    fn lsblk_detection_matches_exact_device() {
        let listing = "/dev/vda  \n/dev/vda1 ext4\n/dev/vdb  crypto_LUKS\n/dev/vdb1 xfs\n";
        assert!(lsblk_reports_luks(listing, "/dev/vdb"));
        assert!(!lsblk_reports_luks(listing, "/dev/vda"));
        assert!(!lsblk_reports_luks(listing, "/dev/vd"));
        assert!(!lsblk_reports_luks("/dev/vdb ext4\n", "/dev/vdb"));
    }

    #[test]
    fn df_source_reads_last_row() {
        let out = "Filesystem 1024-blocks Used Available Capacity Mounted on\n/dev/vdb 1000 10 990 1% /export\n";
        assert_eq!(df_source(out), Some("/dev/vdb".to_string()));
        assert_eq!(df_source("Filesystem 1024-blocks\n"), None);
    }
}
