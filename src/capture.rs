//! Stream capture for a running child process.
//!
//! Stdin is fed from its own thread while two more threads drain stdout and
//! stderr, so a child that never reads its input (or floods its output)
//! cannot block the harness. The calling thread waits for exit, enforcing the
//! timeout.

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::process::{Child, ChildStdin, ExitStatus};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// How often the child is polled for exit.
pub(crate) const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// How long readers may keep draining after the child has exited.
///
/// Pipes inherited by grandchildren can stay open indefinitely; whatever was
/// read by then is kept and the readers are abandoned.
pub(crate) const READER_GRACE: Duration = Duration::from_millis(500);

/// Everything captured from one run of a child process.
#[derive(Debug, Clone, Default)]
pub struct Captured {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Exit code if the process exited normally.
    pub exit_code: Option<i32>,
    /// Signal number if the process was terminated by a signal (unix only).
    pub signal: Option<i32>,
    /// The process was killed because it exceeded its timeout.
    pub timed_out: bool,
    pub duration: Duration,
}

type SharedChild = Arc<Mutex<Child>>;

#[derive(Debug, Default)]
struct TableInner {
    next_id: u64,
    children: HashMap<u64, SharedChild>,
    cancelled: bool,
}

/// Registry of live child processes.
///
/// Used to terminate every in-flight child when the run is interrupted.
#[derive(Debug, Clone, Default)]
pub struct ProcessTable {
    inner: Arc<Mutex<TableInner>>,
}

impl ProcessTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, TableInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn insert(&self, child: Child) -> (u64, SharedChild) {
        let mut inner = self.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        let child = Arc::new(Mutex::new(child));
        inner.children.insert(id, Arc::clone(&child));
        (id, child)
    }

    fn remove(&self, id: u64) {
        self.lock().children.remove(&id);
    }

    /// Number of children currently running.
    pub fn live(&self) -> usize {
        self.lock().children.len()
    }

    pub fn is_cancelled(&self) -> bool {
        self.lock().cancelled
    }

    /// Kill every registered child and refuse to wait on new ones.
    ///
    /// Returns the number of children signalled.
    pub fn terminate_all(&self) -> usize {
        let mut inner = self.lock();
        inner.cancelled = true;
        let mut killed = 0;
        for child in inner.children.values() {
            if lock_child(child).kill().is_ok() {
                killed += 1;
            }
        }
        tracing::warn!(killed, "terminated running test processes");
        killed
    }
}

fn lock_child(child: &SharedChild) -> MutexGuard<'_, Child> {
    child.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Feed `stdin` to a spawned child, drain its output and wait for it.
///
/// The child must have been spawned with all three standard streams piped.
/// Each stdin line is written with a trailing newline and flushed on its own;
/// stdin is closed once all lines are written (immediately if there are
/// none). A child still running after `timeout` is killed and the result is
/// flagged as timed out.
pub fn run(
    mut child: Child,
    stdin: Vec<String>,
    timeout: Option<Duration>,
    table: &ProcessTable,
) -> Result<Captured> {
    let start = Instant::now();

    let writer = child.stdin.take().map(|pipe| spawn_writer(pipe, stdin));
    let stdout = child.stdout.take().map(spawn_reader);
    let stderr = child.stderr.take().map(spawn_reader);

    let (id, child) = table.insert(child);
    let outcome = wait(&child, timeout, start, table);
    table.remove(id);
    let (status, timed_out) = outcome?;
    let duration = start.elapsed();

    // The writer ends on its own once the read end is gone; it is never
    // joined so a grandchild holding the pipe cannot stall the harness.
    drop(writer);

    let deadline = Instant::now() + READER_GRACE;
    let stdout = collect(stdout, deadline);
    let stderr = collect(stderr, deadline);

    #[cfg(unix)]
    let signal = {
        use std::os::unix::process::ExitStatusExt;
        status.signal()
    };
    #[cfg(not(unix))]
    let signal = None;

    Ok(Captured {
        stdout,
        stderr,
        exit_code: status.code(),
        signal,
        timed_out,
        duration,
    })
}

fn wait(
    child: &SharedChild,
    timeout: Option<Duration>,
    start: Instant,
    table: &ProcessTable,
) -> Result<(ExitStatus, bool)> {
    loop {
        if table.is_cancelled() {
            let mut child = lock_child(child);
            let _ = child.kill();
            let _ = child.wait();
            return Err(Error::Cancelled);
        }

        let polled = lock_child(child).try_wait()?;
        if let Some(status) = polled {
            return Ok((status, false));
        }

        if let Some(timeout) = timeout
            && start.elapsed() >= timeout
        {
            let mut child = lock_child(child);
            tracing::debug!(pid = child.id(), "killing process after timeout");
            let _ = child.kill();
            let status = child.wait()?;
            return Ok((status, true));
        }

        thread::sleep(POLL_INTERVAL);
    }
}

fn spawn_writer(mut pipe: ChildStdin, lines: Vec<String>) -> JoinHandle<()> {
    thread::spawn(move || {
        for line in lines {
            let written = pipe
                .write_all(line.as_bytes())
                .and_then(|()| pipe.write_all(b"\n"))
                .and_then(|()| pipe.flush());
            match written {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::BrokenPipe => {
                    tracing::debug!("process closed stdin before all input was written");
                    return;
                }
                Err(e) => {
                    tracing::warn!("failed to write stdin: {e}");
                    return;
                }
            }
        }
    })
}

pub(crate) struct Reader {
    buffer: Arc<Mutex<Vec<u8>>>,
    handle: JoinHandle<()>,
}

pub(crate) fn spawn_reader<R: Read + Send + 'static>(mut pipe: R) -> Reader {
    let buffer = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&buffer);
    let handle = thread::spawn(move || {
        let mut chunk = [0u8; 8192];
        loop {
            match pipe.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => sink
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::warn!("failed to read process output: {e}");
                    break;
                }
            }
        }
    });
    Reader { buffer, handle }
}

pub(crate) fn collect(reader: Option<Reader>, deadline: Instant) -> Vec<u8> {
    let Some(reader) = reader else {
        return Vec::new();
    };
    while !reader.handle.is_finished() && Instant::now() < deadline {
        thread::sleep(POLL_INTERVAL);
    }
    if reader.handle.is_finished() {
        let _ = reader.handle.join();
    } else {
        tracing::debug!("output pipe still open after exit; keeping partial output");
    }
    std::mem::take(&mut *reader.buffer.lock().unwrap_or_else(PoisonError::into_inner))
}
