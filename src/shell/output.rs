//! Captured command output.
//!
//! stdout and stderr lines are kept in arrival order, each tagged with the
//! stream it came from. Capture is bounded; once the budget is spent later
//! lines are dropped and the result is marked truncated.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stream {
    Stdout,
    Stderr,
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stdout => f.write_str("out"),
            Self::Stderr => f.write_str("err"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputLine {
    pub stream: Stream,
    pub text: String,
}

/// Receives output lines as they arrive, before the command finishes.
pub trait OutputObserver: Send + Sync {
    fn on_line(&self, line: &OutputLine);
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Interleaved stdout/stderr.
    pub output: Vec<OutputLine>,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    pub timed_out: bool,
    #[serde(default)]
    pub truncated: bool,
}

impl ExecutionResult {
    pub fn stdout(&self) -> String {
        self.stream_text(Stream::Stdout)
    }

    pub fn stderr(&self) -> String {
        self.stream_text(Stream::Stderr)
    }

    fn stream_text(&self, stream: Stream) -> String {
        self.output
            .iter()
            .filter(|l| l.stream == stream)
            .map(|l| l.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// All output with `[out]`/`[err]` origin markers.
    pub fn interleaved(&self) -> String {
        self.output
            .iter()
            .map(|l| format!("[{}] {}", l.stream, l.text))
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }

    /// A result for actions the gateway performs itself.
    pub fn internal(stdout: &str) -> Self {
        Self {
            output: stdout
                .lines()
                .map(|text| OutputLine {
                    stream: Stream::Stdout,
                    text: text.to_string(),
                })
                .collect(),
            exit_code: Some(0),
            ..Self::default()
        }
    }
}

/// Bounded line accumulator.
#[derive(Debug)]
pub struct OutputCollector {
    lines: Vec<OutputLine>,
    used: usize,
    limit: usize,
    truncated: bool,
}

impl OutputCollector {
    pub fn new(limit: usize) -> Self {
        Self {
            lines: Vec::new(),
            used: 0,
            limit,
            truncated: false,
        }
    }

    /// Store a line if budget remains. Returns the stored line, possibly cut
    /// short, or `None` once capture is full.
    pub fn push(&mut self, stream: Stream, text: String) -> Option<&OutputLine> {
        if self.truncated {
            return None;
        }
        let remaining = self.limit.saturating_sub(self.used);
        // Count the newline the line had on the wire.
        let cost = text.len() + 1;
        let text = if cost > remaining {
            self.truncated = true;
            let cut = truncate_bytes_utf8(&text, remaining.saturating_sub(1));
            if cut.is_empty() {
                return None;
            }
            cut
        } else {
            text
        };
        self.used += text.len() + 1;
        self.lines.push(OutputLine { stream, text });
        self.lines.last()
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    pub fn into_lines(self) -> (Vec<OutputLine>, bool) {
        (self.lines, self.truncated)
    }
}

fn truncate_bytes_utf8(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }

    // Find a valid UTF-8 boundary <= max_bytes.
    let mut cut = 0usize;
    for (idx, _) in s.char_indices() {
        if idx > max_bytes {
            break;
        }
        cut = idx;
    }
    s[..cut].to_string()
}
