//! Write-ahead capture of command output for privileged sessions.
//!
//! Each output line is appended to `capture/<session-id>.jsonl` and flushed
//! as it arrives, so the capture is on disk before the response leaves.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::error;
use uuid::Uuid;

use crate::shell::{OutputLine, OutputObserver, Stream};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedLine {
    pub at: DateTime<Utc>,
    pub record_id: Uuid,
    pub stream: Stream,
    pub text: String,
}

#[derive(Debug)]
pub struct CaptureStream {
    path: PathBuf,
    record_id: Uuid,
    file: Mutex<File>,
    failed: AtomicBool,
}

impl CaptureStream {
    pub fn capture_path(audit_dir: &Path, session_id: Uuid) -> PathBuf {
        audit_dir.join("capture").join(format!("{session_id}.jsonl"))
    }

    pub fn open(audit_dir: &Path, session_id: Uuid, record_id: Uuid) -> std::io::Result<Self> {
        let path = Self::capture_path(audit_dir, session_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            record_id,
            file: Mutex::new(file),
            failed: AtomicBool::new(false),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True once any line failed to reach disk.
    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    /// Sync everything written so far.
    pub fn finish(&self) -> std::io::Result<()> {
        let file = self.file.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        file.sync_data()
    }

    fn write_line(&self, line: &OutputLine) -> std::io::Result<()> {
        let captured = CapturedLine {
            at: Utc::now(),
            record_id: self.record_id,
            stream: line.stream,
            text: strip_ansi_codes(&line.text),
        };
        let mut json = serde_json::to_string(&captured)?;
        json.push('\n');

        let mut file = self.file.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        file.write_all(json.as_bytes())?;
        file.flush()
    }
}

impl OutputObserver for CaptureStream {
    fn on_line(&self, line: &OutputLine) {
        if let Err(e) = self.write_line(line) {
            error!("Capture write to {} failed: {}", self.path.display(), e);
            self.failed.store(true, Ordering::SeqCst);
        }
    }
}

/// Strip ANSI escape sequences (CSI and OSC) from captured output.
pub fn strip_ansi_codes(text: &str) -> String {
    let mut result = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '\x1b' {
            if chars.peek() == Some(&'[') {
                chars.next();
                // CSI ends at the first letter.
                while let Some(&next_ch) = chars.peek() {
                    chars.next();
                    if next_ch.is_ascii_alphabetic() {
                        break;
                    }
                }
            } else if chars.peek() == Some(&']') {
                chars.next();
                // OSC ends at BEL or ST.
                while let Some(&next_ch) = chars.peek() {
                    chars.next();
                    if next_ch == '\x07' {
                        break;
                    }
                    if next_ch == '\x1b' && chars.peek() == Some(&'\\') {
                        chars.next();
                        break;
                    }
                }
            }
        } else {
            result.push(ch);
        }
    }

    result
}
