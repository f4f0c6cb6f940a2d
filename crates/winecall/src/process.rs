//! Child processes of a session and their output readers.

use std::io::{self, BufRead, BufReader, Read};
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use winecall_logging::{forward_foreign_line, OutputStream};

struct Reader {
    stream: OutputStream,
    task: JoinHandle<()>,
    /// Disconnects when the reader thread ends
    done: Receiver<()>,
}

/// A child started in its own process group, with stdout and stderr
/// forwarded line by line to the log.
pub struct ForeignProcess {
    label: String,
    child: Child,
    readers: Vec<Reader>,
}

impl ForeignProcess {
    pub fn spawn(mut command: Command, label: &str, session_id: &str) -> io::Result<Self> {
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);
        let mut child = command.spawn()?;
        log::debug!("{label} started with pid {}", child.id());

        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_reader(stdout, OutputStream::Stdout, label, session_id)?);
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader(stderr, OutputStream::Stderr, label, session_id)?);
        }
        Ok(Self {
            label: label.to_string(),
            child,
            readers,
        })
    }

    pub fn id(&self) -> u32 {
        self.child.id()
    }

    pub fn try_wait(&mut self) -> io::Result<Option<ExitStatus>> {
        self.child.try_wait()
    }

    /// Sends `signal` to the whole process group.
    pub fn signal_group(&self, signal: libc::c_int) -> io::Result<()> {
        let pgid = self.child.id() as libc::pid_t;
        // SAFETY: plain syscall on a group we created.
        if unsafe { libc::killpg(pgid, signal) } == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    /// Interrupts the process group, then waits up to `timeout` for the
    /// readers and the child itself. Readers still running after that are
    /// abandoned; a child still running is killed.
    pub fn stop(mut self, signal: libc::c_int, timeout: Duration) {
        if let Err(e) = self.signal_group(signal) {
            if e.raw_os_error() != Some(libc::ESRCH) {
                log::warn!("cannot signal {}: {e}", self.label);
            }
        }
        let deadline = Instant::now() + timeout;
        for reader in self.readers.drain(..) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match reader.done.recv_timeout(remaining) {
                Err(RecvTimeoutError::Disconnected) | Ok(()) => {
                    if reader.task.join().is_err() {
                        log::warn!("{} {} reader panicked", self.label, reader.stream.as_str());
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    log::debug!(
                        "abandoning {} {} reader after {:.1}s",
                        self.label,
                        reader.stream.as_str(),
                        timeout.as_secs_f64()
                    );
                }
            }
        }
        self.reap(deadline);
    }

    fn reap(&mut self, deadline: Instant) {
        loop {
            match self.child.try_wait() {
                Ok(Some(status)) => {
                    log::debug!("{} exited with {status}", self.label);
                    return;
                }
                Ok(None) if Instant::now() < deadline => thread::sleep(Duration::from_millis(10)),
                Ok(None) => break,
                Err(e) => {
                    log::warn!("cannot wait for {}: {e}", self.label);
                    return;
                }
            }
        }
        log::warn!("{} did not exit in time, killing it", self.label);
        let _ = self.signal_group(libc::SIGKILL);
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn spawn_reader<R: Read + Send + 'static>(
    source: R,
    stream: OutputStream,
    label: &str,
    session_id: &str,
) -> io::Result<Reader> {
    let (done_tx, done) = mpsc::channel::<()>();
    let session_id = session_id.to_string();
    let task = thread::Builder::new()
        .name(format!("{label}-{}", stream.as_str()))
        .spawn(move || {
            let _done = done_tx;
            for line in BufReader::new(source).lines() {
                match line {
                    Ok(line) => forward_foreign_line(&session_id, stream, &line),
                    Err(_) => break,
                }
            }
        })?;
    Ok(Reader { stream, task, done })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_interrupts_the_group() {
        let mut command = Command::new("sh");
        command.args(["-c", "echo ready; sleep 30"]);
        let process = ForeignProcess::spawn(command, "sleeper", "test").unwrap();
        let started = Instant::now();
        process.stop(libc::SIGINT, Duration::from_secs(5));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_stop_after_exit() {
        let mut command = Command::new("sh");
        command.args(["-c", "echo out; echo err >&2"]);
        let mut process = ForeignProcess::spawn(command, "short", "test").unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while process.try_wait().unwrap().is_none() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        process.stop(libc::SIGINT, Duration::from_secs(1));
    }
}
