//! Child process creation and the control thread.
//!
//! The control thread has two jobs: spawn the child with stdout and stderr
//! merged into one pipe, publish its handle, then pump decoded lines into a
//! channel until the stream ends. It performs no supervision of its own.

use std::io::{self, BufRead, BufReader, PipeWriter};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::Sender;
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::state::{StateCell, SupervisorState};

/// Snapshot of everything needed to create the child process.
#[derive(Debug, Clone)]
pub(super) struct CommandSpec {
    pub(super) program: String,
    pub(super) args: Vec<String>,
    pub(super) env: Vec<(String, String)>,
    pub(super) current_dir: Option<PathBuf>,
}

impl CommandSpec {
    /// Build the OS command with both output streams wired to the given pipe
    /// writers, stdin piped, and the environment overlay applied on top of the
    /// inherited environment.
    fn build(&self, stdout: PipeWriter, stderr: PipeWriter) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::piped())
            .stdout(stdout)
            .stderr(stderr);
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        if let Some(dir) = &self.current_dir {
            cmd.current_dir(dir);
        }
        cmd
    }
}

/// State shared between the caller thread and the control thread.
///
/// The child handle is written exactly once, by the control thread; afterwards
/// the caller thread is the only side that touches it.
#[derive(Debug, Default)]
pub(super) struct SharedSlot {
    child: Mutex<Option<Child>>,
    spawn_error: Mutex<Option<String>>,
    pub(super) state: StateCell,
}

impl SharedSlot {
    /// Lock the child slot, tolerating poisoning (the slot is a plain container).
    pub(super) fn child(&self) -> MutexGuard<'_, Option<Child>> {
        self.child.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pid of the published child, if any.
    pub(super) fn child_pid(&self) -> Option<u32> {
        self.child().as_ref().map(Child::id)
    }

    /// Recorded spawn failure, if the control thread could not create the child.
    pub(super) fn spawn_error(&self) -> Option<String> {
        self.spawn_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn publish(&self, child: Child) {
        *self.child() = Some(child);
        self.state.advance(SupervisorState::Running);
    }

    fn fail_spawn(&self, message: String) {
        *self
            .spawn_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(message);
        self.state.advance(SupervisorState::Stopped);
    }
}

/// Control thread body: spawn the child, publish the handle, pump lines.
///
/// Lines are split on `\n`, decoded lossily, and trimmed of surrounding
/// whitespace; empty lines are forwarded as empty strings. The thread exits at
/// end of stream, which disconnects the channel; the disconnect is the
/// consumer's end-of-stream signal.
pub(super) fn run_control(spec: &CommandSpec, shared: &SharedSlot, tx: &Sender<String>) {
    let (reader, stdout_writer) = match io::pipe() {
        Ok(pair) => pair,
        Err(e) => {
            shared.fail_spawn(format!("output pipe: {e}"));
            return;
        }
    };
    let stderr_writer = match stdout_writer.try_clone() {
        Ok(writer) => writer,
        Err(e) => {
            shared.fail_spawn(format!("output pipe: {e}"));
            return;
        }
    };

    let mut cmd = spec.build(stdout_writer, stderr_writer);
    match cmd.spawn() {
        Ok(child) => {
            tracing::debug!(pid = child.id(), program = %spec.program, "Child process spawned");
            shared.publish(child);
        }
        Err(e) => {
            tracing::error!(program = %spec.program, error = %e, "Failed to spawn child process");
            shared.fail_spawn(e.to_string());
            return;
        }
    }
    // The command still holds the parent's copies of the pipe write ends; they
    // must be closed or the reader never observes EOF after the child exits.
    drop(cmd);

    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf).trim().to_string();
                if tx.send(line).is_err() {
                    // Receiver dropped; nothing left to deliver to.
                    break;
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Output stream read failed");
                break;
            }
        }
    }
    tracing::debug!(program = %spec.program, "Output stream ended");
}
