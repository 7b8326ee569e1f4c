//! Child process spawning and termination

use crate::{Error, Result};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::ffi::OsStr;
use std::io::{BufRead, BufReader, Read};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

/// Callback receiving each line the child writes to stdout or stderr
pub type OutputLineFn = Arc<dyn Fn(&str) + Send + Sync + 'static>;

/// How often the reaper checks whether the child has exited
const REAP_INTERVAL: Duration = Duration::from_millis(5);

/// Handle to a spawned child process
///
/// The child is reaped by a background thread, so it never lingers as a
/// zombie even if the handle is dropped while it runs. Reaping and killing
/// share a lock, so a kill never reaches a recycled pid.
#[derive(Debug)]
pub struct ProcessHandle {
    id: u32,
    child: Arc<Mutex<Child>>,
    running: Arc<AtomicBool>,
}

impl ProcessHandle {
    /// OS process id
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Whether the child has not been reaped yet
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

/// Id of the calling process
pub fn current_process_id() -> u32 {
    std::process::id()
}

/// Start `command` without waiting for it
///
/// Output lines go to `on_output_line`; `on_exit` receives the exit code
/// once the child is reaped (`-1` when it was killed by a signal).
pub fn spawn<I, S, E>(
    command: impl AsRef<OsStr>,
    args: I,
    on_output_line: OutputLineFn,
    on_exit: E,
) -> Result<ProcessHandle>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
    E: FnOnce(Result<i32>) + Send + 'static,
{
    let command = command.as_ref();
    let mut child = start(command, args)?;
    let id = child.id();
    let readers = forward_output(&mut child, &on_output_line);

    let child = Arc::new(Mutex::new(child));
    let running = Arc::new(AtomicBool::new(true));

    let reaped = Arc::clone(&child);
    let flag = Arc::clone(&running);
    let waiter = thread::Builder::new()
        .name(format!("ringlink-reaper-{}", id))
        .spawn(move || {
            let status = reap(&reaped);
            flag.store(false, Ordering::Release);
            for reader in readers {
                let _ = reader.join();
            }
            on_exit(status.map(exit_code).map_err(Error::from));
        });

    if let Err(e) = waiter {
        let mut child = lock(&child);
        let _ = child.kill();
        let _ = child.wait();
        running.store(false, Ordering::Release);
        return Err(Error::Spawn(format!("failed to start reaper thread: {}", e)));
    }

    Ok(ProcessHandle { id, child, running })
}

/// Kill the child with `SIGKILL`; no-op once it has exited
pub fn terminate(handle: &ProcessHandle) {
    let mut child = lock(&handle.child);
    // The pid stays ours until it is reaped, and reaping needs this lock
    match child.try_wait() {
        Ok(None) => {
            if let Err(e) = signal::kill(Pid::from_raw(handle.id as i32), Signal::SIGKILL) {
                tracing::debug!(pid = handle.id, error = %e, "kill failed");
            }
        }
        Ok(Some(_)) => {}
        Err(e) => tracing::debug!(pid = handle.id, error = %e, "failed to query child status"),
    }
}

fn lock(child: &Mutex<Child>) -> MutexGuard<'_, Child> {
    child.lock().unwrap_or_else(PoisonError::into_inner)
}

fn reap(child: &Mutex<Child>) -> std::io::Result<ExitStatus> {
    loop {
        if let Some(status) = lock(child).try_wait()? {
            return Ok(status);
        }
        thread::sleep(REAP_INTERVAL);
    }
}

/// Run `command` to completion, streaming its output lines
pub fn run<I, S>(command: impl AsRef<OsStr>, args: I, on_output_line: OutputLineFn) -> Result<i32>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut child = start(command.as_ref(), args)?;
    let readers = forward_output(&mut child, &on_output_line);
    let status = child.wait()?;
    for reader in readers {
        let _ = reader.join();
    }
    Ok(exit_code(status))
}

fn start<I, S>(command: &OsStr, args: I) -> Result<Child>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(command)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| Error::Spawn(format!("{}: {}", command.to_string_lossy(), e)))
}

fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

fn forward_output(child: &mut Child, on_line: &OutputLineFn) -> Vec<thread::JoinHandle<()>> {
    let mut readers = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        readers.extend(spawn_line_reader(stdout, Arc::clone(on_line)));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.extend(spawn_line_reader(stderr, Arc::clone(on_line)));
    }
    readers
}

fn spawn_line_reader<R>(stream: R, on_line: OutputLineFn) -> Option<thread::JoinHandle<()>>
where
    R: Read + Send + 'static,
{
    thread::Builder::new()
        .name("ringlink-output".to_string())
        .spawn(move || {
            let mut reader = BufReader::new(stream);
            let mut line = Vec::new();
            loop {
                line.clear();
                match reader.read_until(b'\n', &mut line) {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {
                        let text = String::from_utf8_lossy(&line);
                        let text = text.trim_end_matches(['\n', '\r']);
                        if !text.is_empty() {
                            on_line(text);
                        }
                    }
                }
            }
        })
        .ok()
}
