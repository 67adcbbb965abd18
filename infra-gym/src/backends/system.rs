use anyhow::{anyhow, Context, Result};
use log::{debug, warn};
use std::{
    io::{self, Read},
    process::{Child, Command, Stdio},
    sync::{
        mpsc::{self, Receiver, RecvTimeoutError},
        Arc, Mutex,
    },
    thread,
    time::{Duration, Instant},
};
use wait_timeout::ChildExt;

use crate::{
    models::{Invocation, Outcome},
    services::CommandRunner,
};

/// Exit code reported when the program could not be found, as a shell would.
const NOT_FOUND: i32 = 127;

/// How long a killed command's pipes may stay open before the output is taken as is.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Output gathered so far by a reader thread, and the signal that it hit end of file.
struct OutputReader {
    buffer: Arc<Mutex<Vec<u8>>>,
    done: Receiver<io::Result<()>>,
}

/// Spawns real processes and blocks until they exit.
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&mut self, invocation: &Invocation) -> Result<Outcome> {
        debug!(
            "running: {} (cwd={:?})",
            invocation.command_line(),
            invocation.cwd
        );

        let mut command = Command::new(&invocation.program);
        command.args(&invocation.args).envs(&invocation.env);
        if invocation.timeout.is_some() {
            // Only commands that can be killed get their own group, the rest keep Ctrl-C.
            own_process_group(&mut command);
        }
        if let Some(cwd) = &invocation.cwd {
            command.current_dir(cwd);
        }
        if invocation.capture {
            command.stdout(Stdio::piped()).stderr(Stdio::piped());
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!("{} not found: {}", invocation.program, err);
                return Ok(Outcome::exited(NOT_FOUND)
                    .with_stderr(format!("{}: command not found", invocation.program)));
            }
            Err(err) => {
                return Err(err).with_context(|| format!("failed to spawn {}", invocation.program))
            }
        };

        // Drain the pipes while waiting, a full pipe would otherwise stall the child.
        let stdout = child.stdout.take().map(spawn_reader);
        let stderr = child.stderr.take().map(spawn_reader);

        let (status, timed_out) = match invocation.timeout {
            Some(timeout) => match child.wait_timeout(timeout)? {
                Some(status) => (Some(status), false),
                None => {
                    warn!(
                        "command timed out after {}s: {}",
                        timeout.as_secs(),
                        invocation.command_line()
                    );
                    kill_process_group(&mut child);
                    child.wait()?;
                    (None, true)
                }
            },
            None => (Some(child.wait()?), false),
        };

        // Anything that escaped the kill may still hold the pipes open.
        let deadline = if timed_out {
            Some(Instant::now() + DRAIN_GRACE)
        } else {
            None
        };

        Ok(Outcome {
            code: status.and_then(|status| status.code()),
            stdout: collect_output(stdout, deadline)?,
            stderr: collect_output(stderr, deadline)?,
            timed_out,
        })
    }
}

#[cfg(unix)]
fn own_process_group(command: &mut Command) {
    use std::os::unix::process::CommandExt;

    command.process_group(0);
}

#[cfg(not(unix))]
fn own_process_group(_command: &mut Command) {}

/// Kills the child and everything it started, so servers and background jobs go too.
#[cfg(unix)]
fn kill_process_group(child: &mut Child) {
    // The child leads its own group, its pid is the group id.
    let group = child.id() as libc::pid_t;
    if unsafe { libc::killpg(group, libc::SIGKILL) } != 0 {
        debug!("killpg({}) failed: {}", group, io::Error::last_os_error());
        let _ = child.kill();
    }
}

#[cfg(not(unix))]
fn kill_process_group(child: &mut Child) {
    let _ = child.kill();
}

fn spawn_reader<R: 'static + Read + Send>(mut reader: R) -> OutputReader {
    let buffer = Arc::new(Mutex::new(Vec::new()));
    let (sender, done) = mpsc::channel();

    let sink = Arc::clone(&buffer);
    thread::spawn(move || {
        let _ = sender.send(drain(&mut reader, &sink));
    });

    OutputReader { buffer, done }
}

fn drain<R: Read>(reader: &mut R, sink: &Mutex<Vec<u8>>) -> io::Result<()> {
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk) {
            Ok(0) => return Ok(()),
            Ok(read) => sink
                .lock()
                .map_err(|_| io::Error::new(io::ErrorKind::Other, "output buffer poisoned"))?
                .extend_from_slice(&chunk[..read]),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }
}

/// Waits for end of file, or only until `deadline` when one is given.
fn collect_output(reader: Option<OutputReader>, deadline: Option<Instant>) -> Result<String> {
    let reader = match reader {
        Some(reader) => reader,
        None => return Ok(String::new()),
    };

    match deadline {
        Some(deadline) => {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match reader.done.recv_timeout(remaining) {
                Ok(result) => result?,
                Err(RecvTimeoutError::Timeout) => {
                    debug!("output pipe still open after the kill, keeping partial output")
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(anyhow!("output reader thread panicked"))
                }
            }
        }
        None => reader
            .done
            .recv()
            .map_err(|_| anyhow!("output reader thread panicked"))??,
    }

    let bytes = reader
        .buffer
        .lock()
        .map_err(|_| anyhow!("output buffer poisoned"))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}
