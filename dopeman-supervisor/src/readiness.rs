//! Readiness detection from a child's output.
//!
//! Output is pushed line by line over a channel by the process's pipe readers.
//! The detector consumes that channel until the first line accepted by its
//! [`LineMatcher`], the process exits, or the timeout elapses. The receiver is
//! dropped on resolution, which detaches the detector from the readers.

use std::fmt;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::debug;

use crate::process::ExitState;

/// Which pipe a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl fmt::Display for OutputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputStream::Stdout => f.write_str("stdout"),
            OutputStream::Stderr => f.write_str("stderr"),
        }
    }
}

/// One line of child output, without the trailing newline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub text: String,
}

impl OutputLine {
    pub fn stdout(text: impl Into<String>) -> Self {
        Self {
            stream: OutputStream::Stdout,
            text: text.into(),
        }
    }

    pub fn stderr(text: impl Into<String>) -> Self {
        Self {
            stream: OutputStream::Stderr,
            text: text.into(),
        }
    }
}

/// Restricts matching to one stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamSelector {
    Stdout,
    Stderr,
    #[default]
    Any,
}

impl StreamSelector {
    fn accepts(self, stream: OutputStream) -> bool {
        match self {
            StreamSelector::Any => true,
            StreamSelector::Stdout => stream == OutputStream::Stdout,
            StreamSelector::Stderr => stream == OutputStream::Stderr,
        }
    }
}

/// Predicate over a line of output.
#[derive(Debug, Clone)]
pub struct LineMatcher {
    stream: StreamSelector,
    regex: Regex,
}

impl LineMatcher {
    pub fn new(stream: StreamSelector, regex: Regex) -> Self {
        Self { stream, regex }
    }

    /// Match lines containing any of `needles` literally.
    pub fn contains_any<S: AsRef<str>>(
        stream: StreamSelector,
        needles: &[S],
    ) -> Result<Self, regex::Error> {
        let alternation = needles
            .iter()
            .map(|n| regex::escape(n.as_ref()))
            .collect::<Vec<_>>()
            .join("|");
        // An empty needle list never matches.
        let source = if alternation.is_empty() {
            "[^\\s\\S]".to_string()
        } else {
            alternation
        };
        Ok(Self {
            stream,
            regex: Regex::new(&source)?,
        })
    }

    pub fn matches(&self, line: &OutputLine) -> bool {
        self.stream.accepts(line.stream) && self.regex.is_match(&line.text)
    }
}

/// How a readiness wait resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadinessOutcome {
    /// A line satisfied the matcher.
    Matched(OutputLine),
    /// The timeout elapsed while the process was still running.
    TimedOut,
    /// The process exited first.
    Exited(ExitState),
}

impl ReadinessOutcome {
    /// Ready or optimistically ready.
    pub fn is_success(&self) -> bool {
        !matches!(self, ReadinessOutcome::Exited(_))
    }
}

#[derive(Debug, Clone)]
pub struct ReadinessDetector {
    matcher: LineMatcher,
    timeout: Duration,
}

impl ReadinessDetector {
    pub fn new(matcher: LineMatcher, timeout: Duration) -> Self {
        Self { matcher, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Wait for the first matching line, process exit, or the timeout.
    ///
    /// Buffered lines are evaluated before an exit notification, so a
    /// process that printed its marker and then died still counts as matched.
    pub async fn wait(
        &self,
        mut lines: mpsc::Receiver<OutputLine>,
        mut exit: watch::Receiver<Option<ExitState>>,
    ) -> ReadinessOutcome {
        let deadline = Instant::now() + self.timeout;
        let sleep = tokio::time::sleep_until(deadline);
        tokio::pin!(sleep);

        let mut lines_open = true;
        let mut exit_open = true;

        loop {
            tokio::select! {
                biased;

                line = lines.recv(), if lines_open => match line {
                    Some(line) if self.matcher.matches(&line) => {
                        debug!(stream = %line.stream, "Readiness line matched: {}", line.text);
                        return ReadinessOutcome::Matched(line);
                    }
                    Some(_) => {}
                    None => lines_open = false,
                },

                state = wait_for_exit(&mut exit), if exit_open => match state {
                    Some(state) => return ReadinessOutcome::Exited(state),
                    None => exit_open = false,
                },

                _ = &mut sleep => {
                    return match *exit.borrow() {
                        Some(state) => ReadinessOutcome::Exited(state),
                        None => ReadinessOutcome::TimedOut,
                    };
                }
            }
        }
    }
}

/// Resolve once an exit state is published; `None` if the publisher went away first.
async fn wait_for_exit(exit: &mut watch::Receiver<Option<ExitState>>) -> Option<ExitState> {
    exit.wait_for(Option::is_some).await.ok().and_then(|s| *s)
}
