//! Workflow orchestration for encrypting, formatting, and reopening volumes.

pub mod encrypt;
pub mod volume;
pub mod volume_setup;

use crate::provider::CommandOutput;
use log::Level;
use std::fs;
use std::path::Path;

pub use encrypt::{EncryptOptions, EncryptReport, VolumeEncryptor, ENCRYPTION_COMPLETED};
pub use volume::{LocalVolume, LocalVolumeStatus};
pub use volume_setup::{encrypt_and_setup, VolumeSetup, SETUP_COMPLETED};

/// Severity levels used when reporting workflow events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowLevel {
    Info,
    Success,
    Warn,
    Error,
    Security,
}

impl WorkflowLevel {
    fn log_level(self) -> Level {
        match self {
            WorkflowLevel::Info | WorkflowLevel::Success | WorkflowLevel::Security => Level::Info,
            WorkflowLevel::Warn => Level::Warn,
            WorkflowLevel::Error => Level::Error,
        }
    }
}

/// Single line of output produced by a workflow step.
#[derive(Debug, Clone)]
pub struct WorkflowEvent {
    pub level: WorkflowLevel,
    pub message: String,
}

/// Aggregated report returned by any workflow entry point.
#[derive(Debug, Clone)]
pub struct WorkflowReport {
    pub title: String,
    pub events: Vec<WorkflowEvent>,
}

/// Convenience constructor that wraps the repeated boilerplate.
pub(crate) fn event(level: WorkflowLevel, message: impl Into<String>) -> WorkflowEvent {
    WorkflowEvent {
        level,
        message: message.into(),
    }
}

/// Event sink owned by one workflow run.
///
/// Every event is kept for the final report and forwarded to the `log`
/// facade under the workflow's target.
#[derive(Debug)]
pub struct WorkflowLog {
    target: &'static str,
    events: Vec<WorkflowEvent>,
}

impl WorkflowLog {
    pub fn new(target: &'static str) -> Self {
        Self {
            target,
            events: Vec::new(),
        }
    }

    pub fn push(&mut self, level: WorkflowLevel, message: impl Into<String>) {
        let event = event(level, message);
        log::log!(target: self.target, level.log_level(), "{}", event.message);
        self.events.push(event);
    }

    pub fn info(&mut self, message: impl Into<String>) {
        self.push(WorkflowLevel::Info, message);
    }

    pub fn success(&mut self, message: impl Into<String>) {
        self.push(WorkflowLevel::Success, message);
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.push(WorkflowLevel::Warn, message);
    }

    pub fn error(&mut self, message: impl Into<String>) {
        self.push(WorkflowLevel::Error, message);
    }

    pub fn security(&mut self, message: impl Into<String>) {
        self.push(WorkflowLevel::Security, message);
    }

    /// Dump a finished command at debug level. Only called for commands that
    /// never receive the secret on stdin.
    pub fn command(&self, label: &str, output: &CommandOutput) {
        log::debug!(
            target: self.target,
            "{label} exited with {}; stdout: {}; stderr: {}",
            output.status,
            output.stdout.trim(),
            output.stderr.trim()
        );
    }

    pub fn events(&self) -> &[WorkflowEvent] {
        &self.events
    }

    pub fn into_report(self, title: impl Into<String>) -> WorkflowReport {
        WorkflowReport {
            title: title.into(),
            events: self.events,
        }
    }
}

/// Write a completion marker, creating its directory when needed.
pub(crate) fn write_marker(path: &str, text: &str) -> std::io::Result<()> {
    let path = Path::new(path);
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    fs::write(path, text)
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_keeps_events_in_order() {
        let mut log = WorkflowLog::new("fastluks::test");
        log.info("start");
        log.warn("careful");
        log.success("done");
        let report = log.into_report("Run");
        assert_eq!(report.title, "Run");
        let levels: Vec<_> = report.events.iter().map(|e| e.level).collect();
        assert_eq!(
            levels,
            vec![WorkflowLevel::Info, WorkflowLevel::Warn, WorkflowLevel::Success]
        );
    }

    #[test]
    fn marker_creates_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run/fast-luks-encryption.success");
        write_marker(path.to_str().unwrap(), ENCRYPTION_COMPLETED).unwrap();
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "LUKS encryption completed."
        );
    }
}
