//! Logger setup for the fastluks binaries.
//!
//! Every record carries the emitting binary (`component`), the workflow step
//! taken from the log target (`fastluks::encrypt` → `encrypt`), and the
//! host name, so lines collected from a master and its workers can be told
//! apart.

use crate::lock::hostname;
use env_logger::{Env, Target};
use serde_json::{json, Value};
use std::env;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::OnceLock;

static INIT: OnceLock<()> = OnceLock::new();

const FORMAT_ENV: &str = "FASTLUKS_LOG_FORMAT";
const LEVEL_ENV: &str = "FASTLUKS_LOG_LEVEL";
const FILE_ENV: &str = "FASTLUKS_LOG_FILE";

/// Resolved logger settings for one binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    pub component: &'static str,
    /// Filter used when `RUST_LOG` is unset.
    pub level: String,
    pub json: bool,
    /// Append here instead of stderr.
    pub file: Option<PathBuf>,
}

impl LogSettings {
    pub fn from_env(component: &'static str, default_level: &str) -> Self {
        Self::from_lookup(component, default_level, |key| env::var(key).ok())
    }

    fn from_lookup(
        component: &'static str,
        default_level: &str,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Self {
        let json = lookup(FORMAT_ENV)
            .map(|format| !format.eq_ignore_ascii_case("plain"))
            .unwrap_or(true);
        Self {
            component,
            level: lookup(LEVEL_ENV).unwrap_or_else(|| default_level.to_string()),
            json,
            file: lookup(FILE_ENV)
                .filter(|path| !path.trim().is_empty())
                .map(PathBuf::from),
        }
    }
}

/// Initialize the process logger for `component`. Only the first call has an
/// effect.
pub fn init(component: &'static str, default_level: &str) {
    let _ = INIT.get_or_init(|| configure(LogSettings::from_env(component, default_level)));
}

fn configure(settings: LogSettings) {
    let mut builder =
        env_logger::Builder::from_env(Env::default().default_filter_or(settings.level.as_str()));
    let component = settings.component;

    if settings.json {
        let host = hostname();
        builder.format(move |buf, record| {
            let line = json_line(
                &buf.timestamp().to_string(),
                record.level(),
                component,
                record.target(),
                &host,
                &record.args().to_string(),
            );
            writeln!(buf, "{line}")
        });
    } else {
        builder.format(move |buf, record| {
            writeln!(
                buf,
                "{} {} {}[{}] - {}",
                buf.timestamp(),
                record.level(),
                component,
                step(record.target()),
                record.args()
            )
        });
    }

    if let Some(path) = &settings.file {
        match OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => {
                builder.target(Target::Pipe(Box::new(file)));
            }
            Err(err) => eprintln!(
                "cannot open log file {}: {err}; logging to stderr",
                path.display()
            ),
        }
    }

    if let Err(err) = builder.try_init() {
        eprintln!("failed to initialize logger: {err}");
    }
}

/// Workflow step named by a log target.
fn step(target: &str) -> &str {
    target
        .strip_prefix("fastluks::")
        .or_else(|| target.strip_prefix("fastluks_"))
        .unwrap_or(target)
}

fn json_line(
    timestamp: &str,
    level: log::Level,
    component: &str,
    target: &str,
    host: &str,
    message: &str,
) -> Value {
    json!({
        "timestamp": timestamp,
        "level": level.as_str().to_lowercase(),
        "component": component,
        "step": step(target),
        "host": host,
        "pid": std::process::id(),
        "message": message,
    })
}
