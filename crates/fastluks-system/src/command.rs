//! Spawns host binaries with an optional timeout and turns every outcome,
//! including spawn failures and timeouts, into a [`CommandOutput`].

use fastluks_core::provider::{CommandOutput, CommandRunner};
use log::{debug, warn};
use std::io::{self, Read, Write};
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

/// Status reported when the program could not be started.
pub const SPAWN_FAILED_STATUS: i32 = 127;
/// Status reported when the program was killed after the timeout.
pub const TIMED_OUT_STATUS: i32 = 124;
/// How long output readers may outlive a bounded child before their output is
/// abandoned.
const READER_GRACE: Duration = Duration::from_secs(2);

/// [`CommandRunner`] backed by `std::process`.
#[derive(Debug, Clone, Default)]
pub struct SystemCommandRunner {
    timeout: Option<Duration>,
}

impl SystemCommandRunner {
    /// `None` waits for the program however long it takes; `dd` over a large
    /// mapping is expected to run for hours.
    pub fn new(timeout: Option<Duration>) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    fn spawn(&self, program: &str, args: &[&str], input: Option<&[u8]>) -> io::Result<Child> {
        let mut command = Command::new(program);
        command.args(args);
        if self.timeout.is_some() {
            // Own process group so a timeout also reaches children of sudo.
            command.process_group(0);
        }
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        command.stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });

        let mut child = command.spawn()?;
        if let Some(bytes) = input {
            if let Some(mut stdin) = child.stdin.take() {
                // A program that exits before reading its stdin closes the pipe.
                if let Err(err) = stdin.write_all(bytes) {
                    if err.kind() != io::ErrorKind::BrokenPipe {
                        return Err(err);
                    }
                }
                stdin.flush().ok();
            }
        }
        Ok(child)
    }

    /// Wait for the child until it exits or the timeout elapses.
    fn wait(&self, program: &str, mut child: Child) -> io::Result<CommandOutput> {
        let stdout_handle = spawn_output_reader(child.stdout.take());
        let stderr_handle = spawn_output_reader(child.stderr.take());

        let status = match self.timeout {
            None => Some(child.wait()?),
            Some(limit) => wait_with_deadline(&mut child, limit)?,
        };

        let grace = self.timeout.map(|_| READER_GRACE);
        let stdout = join_reader(stdout_handle, "stdout", grace)?;
        let mut stderr = join_reader(stderr_handle, "stderr", grace)?;

        let status = match status {
            Some(status) => exit_code(status),
            None => {
                warn!("{program} timed out after {:?}", self.timeout);
                if !stderr.is_empty() && !stderr.ends_with('\n') {
                    stderr.push('\n');
                }
                stderr.push_str(&format!("{program} timed out after {:?}", self.timeout));
                TIMED_OUT_STATUS
            }
        };
        Ok(CommandOutput {
            stdout,
            stderr,
            status,
        })
    }
}

impl CommandRunner for SystemCommandRunner {
    fn run(&self, program: &str, args: &[&str], input: Option<&[u8]>) -> CommandOutput {
        debug!("running {program} {}", args.join(" "));
        let result = self
            .spawn(program, args, input)
            .and_then(|child| self.wait(program, child));
        match result {
            Ok(output) => {
                debug!("{program} exited with {}", output.status);
                output
            }
            Err(err) => {
                warn!("unable to run {program}: {err}");
                CommandOutput {
                    stdout: String::new(),
                    stderr: format!("unable to run {program}: {err}"),
                    status: SPAWN_FAILED_STATUS,
                }
            }
        }
    }
}

/// Poll the child every 25ms; kill it once `limit` has passed.
fn wait_with_deadline(child: &mut Child, limit: Duration) -> io::Result<Option<ExitStatus>> {
    let start = Instant::now();
    while start.elapsed() <= limit {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        thread::sleep(Duration::from_millis(25));
    }
    kill_group(child);
    child.wait()?;
    Ok(None)
}

/// SIGKILL the child's process group, falling back to the child alone.
fn kill_group(child: &mut Child) {
    let Ok(pgid) = libc::pid_t::try_from(child.id()) else {
        warn!("pid {} out of range; killing child only", child.id());
        kill_child(child);
        return;
    };
    // SAFETY: kill(2) with a negative pid only signals the group created for
    // this child in `spawn`.
    if unsafe { libc::kill(-pgid, libc::SIGKILL) } == 0 {
        return;
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() != Some(libc::ESRCH) {
        warn!("failed to kill process group {pgid}: {err}");
    }
    kill_child(child);
}

fn kill_child(child: &mut Child) {
    if let Err(err) = child.kill() {
        if err.kind() != io::ErrorKind::InvalidInput {
            warn!("failed to kill pid {}: {err}", child.id());
        }
    }
}

fn exit_code(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
        .unwrap_or(-1)
}

/// Join a reader thread. With a `grace` period, a pipe still held open by a
/// process that escaped the kill is abandoned once the grace elapses.
fn join_reader(
    handle: thread::JoinHandle<io::Result<String>>,
    name: &str,
    grace: Option<Duration>,
) -> io::Result<String> {
    if let Some(grace) = grace {
        let deadline = Instant::now() + grace;
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                warn!("{name} still open after {grace:?}; output abandoned");
                return Ok(String::new());
            }
            thread::sleep(Duration::from_millis(10));
        }
    }
    handle
        .join()
        .map_err(|_| io::Error::new(io::ErrorKind::Other, format!("{name} reader thread panicked")))?
}

/// Drain a pipe on a helper thread so a chatty child never blocks on a full
/// buffer.
fn spawn_output_reader<R>(pipe: Option<R>) -> thread::JoinHandle<io::Result<String>>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || -> io::Result<String> {
        let mut buf = Vec::new();
        if let Some(mut reader) = pipe {
            reader.read_to_end(&mut buf)?;
        }
        Ok(String::from_utf8_lossy(&buf).into_owned())
    })
}
