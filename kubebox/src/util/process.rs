//! Bounded subprocess execution for host probes.

use std::io::Read;
use std::process::{Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use kubebox_shared::errors::{KubeboxError, KubeboxResult};

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Captured result of a finished child process.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }
}

/// Run `cmd` to completion, killing it if it outlives `timeout`.
///
/// # Returns
/// * `Ok(CommandOutput)` - The child exited (successfully or not)
/// * `Err(Timeout)` - The deadline passed; the child was killed and reaped
/// * `Err(Driver)` - The child could not be spawned
pub fn run_with_timeout(mut cmd: Command, timeout: Duration) -> KubeboxResult<CommandOutput> {
    let program = format!("{:?}", cmd.get_program());
    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| KubeboxError::Driver(format!("Failed to spawn {}: {}", program, e)))?;

    // Drain pipes on their own threads so a chatty child can't block on a full pipe.
    let stdout_reader = child.stdout.take().map(spawn_reader);
    let stderr_reader = child.stderr.take().map(spawn_reader);

    let deadline = Instant::now() + timeout;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) if Instant::now() >= deadline => {
                let _ = child.kill();
                let _ = child.wait();
                tracing::debug!(program = %program, ?timeout, "Killed command after deadline");
                return Err(KubeboxError::Timeout(format!(
                    "{} did not finish within {:?}",
                    program, timeout
                )));
            }
            Ok(None) => std::thread::sleep(POLL_INTERVAL),
            Err(e) => {
                return Err(KubeboxError::Driver(format!(
                    "Failed to wait for {}: {}",
                    program, e
                )));
            }
        }
    };

    Ok(CommandOutput {
        status,
        stdout: join_reader(stdout_reader),
        stderr: join_reader(stderr_reader),
    })
}

fn spawn_reader<R: Read + Send + 'static>(mut pipe: R) -> std::thread::JoinHandle<String> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        String::from_utf8_lossy(&buf).into_owned()
    })
}

fn join_reader(handle: Option<std::thread::JoinHandle<String>>) -> String {
    handle.and_then(|h| h.join().ok()).unwrap_or_default()
}
