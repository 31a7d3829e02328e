//! Process supervisor: lifecycle, liveness queries, and teardown.
//!
//! A [`Supervisor`] owns one child process and the control thread that
//! creates it. The control thread publishes the child handle and then pumps
//! output lines; the caller thread drives every other operation. The read
//! side of the stream lives in the lines half of this module.

use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::config::SupervisorConfig;

use super::error::SupervisorError;
use super::shutdown;
use super::spawn::{run_control, CommandSpec, SharedSlot};
use super::state::SupervisorState;

/// Default budget for the bounded part of the stop sequence.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(1);

/// Default interval for handle and exit polling.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Builder for configuring a [`Supervisor`].
#[derive(Debug, Clone)]
pub struct SupervisorBuilder {
    program: String,
    args: Vec<String>,
    env: Vec<(String, String)>,
    current_dir: Option<PathBuf>,
    stop_timeout: Duration,
    poll_interval: Duration,
    capture_output: bool,
    echo_output: bool,
    force_kill: bool,
}

impl SupervisorBuilder {
    /// Create a builder for the given program.
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            current_dir: None,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            capture_output: false,
            echo_output: false,
            force_kill: false,
        }
    }

    /// Create a builder seeded with defaults from a loaded configuration.
    #[must_use]
    pub fn from_config(program: impl Into<String>, config: &SupervisorConfig) -> Self {
        let mut builder = Self::new(program);
        builder.stop_timeout = config.process.stop_timeout();
        builder.poll_interval = config.process.poll_interval();
        builder.force_kill = config.process.force_kill;
        builder.capture_output = config.output.capture;
        builder.echo_output = config.output.echo;
        for (key, value) in &config.env {
            builder.env.push((key.clone(), value.clone()));
        }
        builder
    }

    /// Append one argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Add an environment overlay entry, merged onto the inherited environment.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Set the child's working directory.
    #[must_use]
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    /// Budget for the bounded part of the stop sequence.
    #[must_use]
    pub fn stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    /// Interval used when polling for handle publication and child exit.
    #[must_use]
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Keep every consumed output line in an internal buffer.
    #[must_use]
    pub fn capture_output(mut self, capture: bool) -> Self {
        self.capture_output = capture;
        self
    }

    /// Echo every consumed output line to the console.
    #[must_use]
    pub fn echo_output(mut self, echo: bool) -> Self {
        self.echo_output = echo;
        self
    }

    /// Escalate to a forceful kill when the child survives the stop sequence.
    /// Off by default.
    #[must_use]
    pub fn force_kill(mut self, force: bool) -> Self {
        self.force_kill = force;
        self
    }

    /// Compose the full command line (program followed by arguments).
    #[must_use]
    pub fn command_line(&self) -> Vec<String> {
        let mut line = Vec::with_capacity(self.args.len() + 1);
        line.push(self.program.clone());
        line.extend(self.args.iter().cloned());
        line
    }

    /// Build the supervisor without starting it.
    #[must_use]
    pub fn build(self) -> Supervisor {
        Supervisor {
            spec: CommandSpec {
                program: self.program,
                args: self.args,
                env: self.env,
                current_dir: self.current_dir,
            },
            stop_timeout: self.stop_timeout,
            poll_interval: self.poll_interval,
            capture_output: self.capture_output,
            echo_output: self.echo_output,
            force_kill: self.force_kill,
            shared: Arc::new(SharedSlot::default()),
            control: None,
            line_rx: None,
            captured: Vec::new(),
        }
    }

    /// Build and immediately start. Dropping the returned supervisor
    /// terminates the child, so binding it acquires the process for the
    /// enclosing scope.
    ///
    /// # Errors
    ///
    /// Propagates [`Supervisor::start`] failures.
    pub fn start(self) -> Result<Supervisor, SupervisorError> {
        let mut supervisor = self.build();
        supervisor.start()?;
        Ok(supervisor)
    }
}

/// Supervises one child process for the lifetime of this instance.
///
/// Reads assume a single caller thread and take `&mut self`; the only other
/// thread involved is the internal control thread.
#[derive(Debug)]
pub struct Supervisor {
    spec: CommandSpec,
    stop_timeout: Duration,
    pub(super) poll_interval: Duration,
    pub(super) capture_output: bool,
    pub(super) echo_output: bool,
    force_kill: bool,
    pub(super) shared: Arc<SharedSlot>,
    control: Option<JoinHandle<()>>,
    pub(super) line_rx: Option<Receiver<String>>,
    pub(super) captured: Vec<String>,
}

impl Supervisor {
    /// Start configuring a supervisor for the given program.
    #[must_use]
    pub fn builder(program: impl Into<String>) -> SupervisorBuilder {
        SupervisorBuilder::new(program)
    }

    /// Launch the control thread, which creates the child process.
    ///
    /// Returns as soon as the thread is launched; child creation happens
    /// asynchronously. Use [`Self::wait_for_handle`] to synchronize on it.
    ///
    /// # Errors
    ///
    /// `AlreadyStarted` on a second call, `Disposed` after teardown, and
    /// `SpawnFailed` if the OS refuses a new thread.
    pub fn start(&mut self) -> Result<(), SupervisorError> {
        match self.shared.state.get() {
            SupervisorState::NotStarted => {}
            SupervisorState::Disposed => return Err(SupervisorError::Disposed),
            _ => return Err(SupervisorError::AlreadyStarted),
        }
        self.shared.state.advance(SupervisorState::Starting);

        let (tx, rx) = mpsc::channel();
        let spec = self.spec.clone();
        let shared = Arc::clone(&self.shared);
        let handle = std::thread::Builder::new()
            .name("procwatch-control".to_string())
            .spawn(move || run_control(&spec, &shared, &tx))
            .map_err(|e| SupervisorError::SpawnFailed(format!("control thread: {e}")))?;

        self.control = Some(handle);
        self.line_rx = Some(rx);
        Ok(())
    }

    /// Block until the child handle is published or the control thread dies
    /// without producing one. Polls at the configured interval.
    ///
    /// Returns the child's pid.
    ///
    /// # Errors
    ///
    /// `NotStarted` before [`Self::start`], `Disposed` after teardown, and
    /// `SpawnFailed` when the child could not be created.
    pub fn wait_for_handle(&self) -> Result<u32, SupervisorError> {
        match self.shared.state.get() {
            SupervisorState::NotStarted => return Err(SupervisorError::NotStarted),
            SupervisorState::Disposed => return Err(SupervisorError::Disposed),
            _ => {}
        }
        self.poll_handle()
    }

    /// Poll until the handle exists or the spawn has settled without one.
    fn poll_handle(&self) -> Result<u32, SupervisorError> {
        loop {
            if let Some(pid) = self.shared.child_pid() {
                return Ok(pid);
            }
            if let Some(message) = self.shared.spawn_error() {
                return Err(SupervisorError::SpawnFailed(message));
            }
            let thread_alive = self
                .control
                .as_ref()
                .is_some_and(|handle| !handle.is_finished());
            if !thread_alive {
                // The thread may have published and exited between the checks.
                if let Some(pid) = self.shared.child_pid() {
                    return Ok(pid);
                }
                return Err(SupervisorError::SpawnFailed(
                    "control thread exited before publishing a child handle".to_string(),
                ));
            }
            std::thread::sleep(self.poll_interval);
        }
    }

    /// Whether `start` has ever been called on this instance.
    #[must_use]
    pub fn was_started(&self) -> bool {
        self.shared.state.get() != SupervisorState::NotStarted
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SupervisorState {
        self.shared.state.get()
    }

    /// Pid of the child, once the handle has been published.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.shared.child_pid()
    }

    /// Whether a child handle exists and the OS reports it still running.
    #[must_use]
    pub fn is_running_process(&self) -> bool {
        let mut guard = self.shared.child();
        match guard.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Whether the control thread is still running.
    #[must_use]
    pub fn is_running_thread(&self) -> bool {
        self.control
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Exit status of the child, once it has exited and been observed.
    #[must_use]
    pub fn exit_status(&self) -> Option<ExitStatus> {
        let mut guard = self.shared.child();
        guard
            .as_mut()
            .and_then(|child| child.try_wait().ok().flatten())
    }

    /// Lines consumed from the output stream, when capture is enabled.
    #[must_use]
    pub fn captured_lines(&self) -> &[String] {
        &self.captured
    }

    /// Configured stop budget.
    #[must_use]
    pub fn stop_timeout(&self) -> Duration {
        self.stop_timeout
    }

    /// Stop the child and tear this instance down.
    ///
    /// Runs the stop sequence (interrupt, polite terminate, bounded join of
    /// the control thread, forceful kill only when opted in), then closes the
    /// child's stdin, reaps the child, and joins the control thread unbounded.
    /// Ends in `Disposed` in every case, including a child that never started
    /// cleanly. Calling it again is a no-op.
    ///
    /// # Errors
    ///
    /// None today: signal races with an exiting child and teardown I/O
    /// failures are logged and swallowed so disposal always completes.
    pub fn terminate(&mut self) -> Result<(), SupervisorError> {
        match self.shared.state.get() {
            SupervisorState::Disposed => return Ok(()),
            SupervisorState::NotStarted => {
                self.shared.state.advance(SupervisorState::Disposed);
                return Ok(());
            }
            _ => {}
        }

        // Let the spawn settle so the handle question has an answer.
        if self.poll_handle().is_ok() {
            self.signal_stop();
        }

        let joined = match &self.control {
            Some(handle) => {
                shutdown::join_timeout(handle, self.stop_timeout, self.poll_interval)
            }
            None => true,
        };
        if !joined {
            tracing::debug!("Control thread still running after stop budget");
        }

        if self.force_kill && self.is_running_process() {
            let mut guard = self.shared.child();
            if let Some(child) = guard.as_mut() {
                tracing::warn!(pid = child.id(), "Escalating to forceful kill");
                if let Err(e) = shutdown::send_kill(child) {
                    tracing::warn!(error = %e, "Forceful kill failed");
                }
            }
        }

        self.drain_child();

        if let Some(handle) = self.control.take() {
            if handle.join().is_err() {
                tracing::error!("Control thread panicked");
            }
        }

        self.shared.state.advance(SupervisorState::Disposed);
        Ok(())
    }

    /// Interrupt, then politely terminate the child. Already-gone races are
    /// swallowed inside the send helpers; anything else is logged here.
    fn signal_stop(&self) {
        let mut guard = self.shared.child();
        if let Some(child) = guard.as_mut() {
            let pid = child.id();
            tracing::debug!(pid, "Sending interrupt signal");
            if let Err(e) = shutdown::send_interrupt(child) {
                tracing::warn!(pid, error = %e, "Interrupt signal failed");
            }
            tracing::debug!(pid, "Sending terminate signal");
            if let Err(e) = shutdown::send_terminate(child) {
                tracing::warn!(pid, error = %e, "Terminate signal failed");
            }
        }
    }

    /// Close the child's stdin and reap it, recording the exit.
    fn drain_child(&self) {
        let mut guard = self.shared.child();
        if let Some(child) = guard.as_mut() {
            drop(child.stdin.take());
            match child.wait() {
                Ok(status) => {
                    tracing::debug!(pid = child.id(), %status, "Child process reaped");
                    self.shared.state.advance(SupervisorState::Stopped);
                }
                Err(e) => tracing::warn!(error = %e, "Waiting on child failed"),
            }
        }
    }
}

impl Drop for Supervisor {
    /// Leaving the owning scope releases the child: best-effort terminate
    /// unless already disposed.
    fn drop(&mut self) {
        if self.shared.state.get() != SupervisorState::Disposed {
            let _ = self.terminate();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let builder = SupervisorBuilder::new("server");
        assert_eq!(builder.stop_timeout, DEFAULT_STOP_TIMEOUT);
        assert_eq!(builder.poll_interval, DEFAULT_POLL_INTERVAL);
        assert!(!builder.capture_output);
        assert!(!builder.echo_output);
        assert!(!builder.force_kill);
        assert!(builder.args.is_empty());
        assert!(builder.env.is_empty());
    }

    #[test]
    fn test_builder_command_line() {
        let builder = Supervisor::builder("server")
            .arg("--port")
            .arg("8080")
            .args(["--quiet", "--once"]);
        assert_eq!(
            builder.command_line(),
            ["server", "--port", "8080", "--quiet", "--once"]
        );
    }

    #[test]
    fn test_builder_setters_compose() {
        let builder = Supervisor::builder("server")
            .env("A", "1")
            .env("B", "2")
            .current_dir("/tmp")
            .stop_timeout(Duration::from_millis(200))
            .poll_interval(Duration::from_millis(10))
            .capture_output(true)
            .echo_output(true)
            .force_kill(true);
        assert_eq!(builder.env.len(), 2);
        assert_eq!(builder.current_dir, Some(PathBuf::from("/tmp")));
        assert_eq!(builder.stop_timeout, Duration::from_millis(200));
        assert_eq!(builder.poll_interval, Duration::from_millis(10));
        assert!(builder.capture_output);
        assert!(builder.echo_output);
        assert!(builder.force_kill);
    }

    #[test]
    fn test_builder_from_config() {
        let mut config = SupervisorConfig::default();
        config.process.stop_timeout_ms = 250;
        config.process.force_kill = true;
        config.output.capture = true;
        config
            .env
            .insert("FROM_CONFIG".to_string(), "yes".to_string());

        let builder = SupervisorBuilder::from_config("server", &config);
        assert_eq!(builder.stop_timeout, Duration::from_millis(250));
        assert!(builder.force_kill);
        assert!(builder.capture_output);
        assert!(!builder.echo_output);
        assert_eq!(builder.env, [("FROM_CONFIG".to_string(), "yes".to_string())]);
    }

    #[test]
    fn test_unstarted_supervisor_queries() {
        let supervisor = Supervisor::builder("server").build();
        assert_eq!(supervisor.state(), SupervisorState::NotStarted);
        assert!(!supervisor.was_started());
        assert!(!supervisor.is_running_process());
        assert!(!supervisor.is_running_thread());
        assert!(supervisor.pid().is_none());
        assert!(supervisor.exit_status().is_none());
        assert!(supervisor.captured_lines().is_empty());
    }

    #[test]
    fn test_wait_for_handle_before_start_fails() {
        let supervisor = Supervisor::builder("server").build();
        assert!(matches!(
            supervisor.wait_for_handle(),
            Err(SupervisorError::NotStarted)
        ));
    }

    #[test]
    fn test_terminate_without_start_disposes() {
        let mut supervisor = Supervisor::builder("server").build();
        supervisor.terminate().unwrap();
        assert_eq!(supervisor.state(), SupervisorState::Disposed);
        // Idempotent.
        supervisor.terminate().unwrap();
        assert_eq!(supervisor.state(), SupervisorState::Disposed);
    }

    #[test]
    fn test_start_after_terminate_fails() {
        let mut supervisor = Supervisor::builder("server").build();
        supervisor.terminate().unwrap();
        assert!(matches!(
            supervisor.start(),
            Err(SupervisorError::Disposed)
        ));
    }

    #[test]
    fn test_wait_for_handle_after_terminate_fails() {
        let mut supervisor = Supervisor::builder("server").build();
        supervisor.terminate().unwrap();
        assert!(matches!(
            supervisor.wait_for_handle(),
            Err(SupervisorError::Disposed)
        ));
    }

    #[test]
    fn test_spawn_failure_surfaces_through_wait_for_handle() {
        let mut supervisor = Supervisor::builder("procwatch-test-no-such-binary")
            .poll_interval(Duration::from_millis(5))
            .build();
        supervisor.start().unwrap();

        assert!(matches!(
            supervisor.wait_for_handle(),
            Err(SupervisorError::SpawnFailed(_))
        ));
        supervisor.terminate().unwrap();
        assert_eq!(supervisor.state(), SupervisorState::Disposed);
    }

    #[cfg(unix)]
    #[test]
    fn test_start_publishes_handle_and_double_start_fails() {
        let mut supervisor = Supervisor::builder("sleep")
            .arg("30")
            .poll_interval(Duration::from_millis(5))
            .build();
        supervisor.start().unwrap();

        let pid = supervisor.wait_for_handle().unwrap();
        assert!(pid > 0);
        assert!(supervisor.was_started());
        assert!(supervisor.is_running_process());
        assert_eq!(supervisor.state(), SupervisorState::Running);
        assert!(matches!(
            supervisor.start(),
            Err(SupervisorError::AlreadyStarted)
        ));

        supervisor.terminate().unwrap();
        assert_eq!(supervisor.state(), SupervisorState::Disposed);
        assert!(!supervisor.is_running_process());
        assert!(!supervisor.is_running_thread());
    }

    #[cfg(unix)]
    #[test]
    fn test_exit_status_observed_after_child_exits() {
        let mut supervisor = Supervisor::builder("sh")
            .args(["-c", "exit 7"])
            .poll_interval(Duration::from_millis(5))
            .build();
        supervisor.start().unwrap();
        supervisor.wait_for_handle().unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while supervisor.is_running_process() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }

        assert_eq!(supervisor.exit_status().and_then(|s| s.code()), Some(7));
        supervisor.terminate().unwrap();
        assert_eq!(supervisor.exit_status().and_then(|s| s.code()), Some(7));
    }

    #[cfg(unix)]
    #[test]
    fn test_drop_terminates_child() {
        use nix::errno::Errno;
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        let pid = {
            let mut supervisor = Supervisor::builder("sleep")
                .arg("30")
                .poll_interval(Duration::from_millis(5))
                .build();
            supervisor.start().unwrap();
            supervisor.wait_for_handle().unwrap()
        };

        let nix_pid = Pid::from_raw(i32::try_from(pid).unwrap_or(i32::MAX));
        assert_eq!(kill(nix_pid, None), Err(Errno::ESRCH));
    }

    #[cfg(unix)]
    #[test]
    fn test_terminate_is_idempotent_after_run() {
        let mut supervisor = Supervisor::builder("sh")
            .args(["-c", "echo done"])
            .poll_interval(Duration::from_millis(5))
            .build();
        supervisor.start().unwrap();
        supervisor.wait_for_handle().unwrap();

        supervisor.terminate().unwrap();
        supervisor.terminate().unwrap();
        assert_eq!(supervisor.state(), SupervisorState::Disposed);
    }
}
