//! Consumer side of the line channel: single reads, matched waits with
//! composable timeouts, and the blocking line iterator.

use std::sync::mpsc::RecvTimeoutError;
use std::time::{Duration, Instant};

use regex::Regex;

use super::error::SupervisorError;
use super::runner::Supervisor;
use super::state::SupervisorState;

/// Outcome of one receive attempt against the line channel.
enum Pull {
    Line(String),
    Closed,
    TimedOut,
}

impl Supervisor {
    /// Consume and return the next output line, blocking until one arrives
    /// or the stream ends.
    ///
    /// Returns `None` exactly at end of stream: the channel has drained and
    /// the child has exited. Further calls keep returning `None`.
    ///
    /// # Errors
    ///
    /// `NotStarted` before [`Self::start`], `Disposed` after teardown,
    /// `SpawnFailed` when the stream ended because the child was never
    /// created, and `Io` if the OS fails while the exit is being confirmed.
    pub fn next_line(&mut self) -> Result<Option<String>, SupervisorError> {
        self.read_line(None)
    }

    /// Begin a matched wait over the output stream.
    ///
    /// With no predicate and no timeouts the wait behaves exactly like
    /// [`Self::next_line`].
    pub fn find_line(&mut self) -> LineWait<'_> {
        LineWait {
            supervisor: self,
            matcher: None,
            line_timeout: None,
            total_timeout: None,
        }
    }

    /// Iterator over the remaining output lines, ending at end of stream.
    ///
    /// Blocking; a read error also ends the iteration.
    pub fn lines(&mut self) -> Lines<'_> {
        Lines { supervisor: self }
    }

    /// One read against the channel, bounded when `budget` is set. The
    /// budget covers the whole read, including the exit wait after the
    /// channel has drained.
    fn read_line(&mut self, budget: Option<Duration>) -> Result<Option<String>, SupervisorError> {
        match self.shared.state.get() {
            SupervisorState::NotStarted => return Err(SupervisorError::NotStarted),
            SupervisorState::Disposed => return Err(SupervisorError::Disposed),
            _ => {}
        }
        let deadline = budget.map(|b| Instant::now() + b);

        match self.pull(deadline) {
            Pull::Line(line) => {
                self.consume_line(&line);
                Ok(Some(line))
            }
            Pull::TimedOut => Err(SupervisorError::LineWaitingTimeout),
            Pull::Closed => self.await_exit(deadline),
        }
    }

    /// One receive attempt, bounded by `deadline` when present. An expired
    /// attempt consumes nothing; undelivered lines stay queued in order.
    fn pull(&self, deadline: Option<Instant>) -> Pull {
        let Some(rx) = self.line_rx.as_ref() else {
            return Pull::Closed;
        };
        match deadline {
            None => match rx.recv() {
                Ok(line) => Pull::Line(line),
                Err(_) => Pull::Closed,
            },
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                match rx.recv_timeout(remaining) {
                    Ok(line) => Pull::Line(line),
                    Err(RecvTimeoutError::Timeout) => Pull::TimedOut,
                    Err(RecvTimeoutError::Disconnected) => Pull::Closed,
                }
            }
        }
    }

    /// Apply capture and echo to a line being handed to the caller.
    fn consume_line(&mut self, line: &str) {
        if self.capture_output {
            self.captured.push(line.to_string());
        }
        if self.echo_output {
            println!("{line}");
        }
    }

    /// The channel has drained; decide between end of stream and failure.
    ///
    /// A drained channel with a live child means the child closed its output
    /// early: keep waiting for the exit, bounded by `deadline` when present.
    fn await_exit(
        &mut self,
        deadline: Option<Instant>,
    ) -> Result<Option<String>, SupervisorError> {
        if let Some(message) = self.shared.spawn_error() {
            return Err(SupervisorError::SpawnFailed(message));
        }
        loop {
            let exited = {
                let mut guard = self.shared.child();
                match guard.as_mut() {
                    Some(child) => child.try_wait()?.is_some(),
                    None => {
                        return Err(SupervisorError::SpawnFailed(
                            "child handle was never published".to_string(),
                        ))
                    }
                }
            };
            if exited {
                self.shared.state.advance(SupervisorState::Stopped);
                return Ok(None);
            }
            match deadline {
                None => std::thread::sleep(self.poll_interval),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(SupervisorError::LineWaitingTimeout);
                    }
                    std::thread::sleep(self.poll_interval.min(deadline - now));
                }
            }
        }
    }
}

/// In-progress matched wait, built by [`Supervisor::find_line`].
///
/// Layers an optional per-line bound and an optional total bound over raw
/// reads; [`LineWait::wait`] runs the read loop. The two bounds compose,
/// neither overrides the other.
pub struct LineWait<'a> {
    supervisor: &'a mut Supervisor,
    matcher: Option<Box<dyn FnMut(&str) -> bool + 'a>>,
    line_timeout: Option<Duration>,
    total_timeout: Option<Duration>,
}

impl<'a> LineWait<'a> {
    /// Match lines satisfying `predicate`.
    #[must_use]
    pub fn matching(mut self, predicate: impl FnMut(&str) -> bool + 'a) -> Self {
        self.matcher = Some(Box::new(predicate));
        self
    }

    /// Match lines matching `pattern`.
    #[must_use]
    pub fn matching_regex(mut self, pattern: &Regex) -> Self {
        let pattern = pattern.clone();
        self.matcher = Some(Box::new(move |line| pattern.is_match(line)));
        self
    }

    /// Match lines containing `needle`.
    #[must_use]
    pub fn containing(mut self, needle: impl Into<String>) -> Self {
        let needle = needle.into();
        self.matcher = Some(Box::new(move |line| line.contains(&needle)));
        self
    }

    /// Bound the wait for each individual line.
    #[must_use]
    pub fn line_timeout(mut self, timeout: Duration) -> Self {
        self.line_timeout = Some(timeout);
        self
    }

    /// Bound the wait for the match as a whole.
    #[must_use]
    pub fn total_timeout(mut self, timeout: Duration) -> Self {
        self.total_timeout = Some(timeout);
        self
    }

    /// Consume lines until one matches.
    ///
    /// Returns the matching line, or `None` at end of stream without a
    /// match. Non-matching lines are consumed on the way (captured and
    /// echoed when enabled). Without a predicate any line matches.
    ///
    /// # Errors
    ///
    /// `LineWaitingTimeout` when a per-line or total bound elapses first;
    /// otherwise as [`Supervisor::next_line`].
    pub fn wait(mut self) -> Result<Option<String>, SupervisorError> {
        let total_deadline = self.total_timeout.map(|t| Instant::now() + t);
        loop {
            let budget = match (self.line_timeout, total_deadline) {
                (None, None) => None,
                (Some(line), None) => Some(line),
                (line, Some(deadline)) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(SupervisorError::LineWaitingTimeout);
                    }
                    Some(match line {
                        Some(line) => line.min(remaining),
                        None => remaining,
                    })
                }
            };
            match self.supervisor.read_line(budget)? {
                Some(line) => {
                    let matched = match &mut self.matcher {
                        Some(matcher) => matcher(&line),
                        None => true,
                    };
                    if matched {
                        return Ok(Some(line));
                    }
                }
                None => return Ok(None),
            }
        }
    }
}

/// Blocking iterator over output lines. See [`Supervisor::lines`].
pub struct Lines<'a> {
    supervisor: &'a mut Supervisor,
}

impl Iterator for Lines<'_> {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        self.supervisor.next_line().ok().flatten()
    }
}
