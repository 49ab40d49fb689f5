//! Audit record stores.
//!
//! `FileAuditLog` keeps one JSON Lines file per UTC day under the audit
//! directory. Appends are serialized by a mutex; each record is written,
//! flushed and synced before the append resolves, and carries a sequence
//! number that keeps counting across restarts.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{Days, NaiveDate, Utc};
use futures::future::BoxFuture;
use tracing::{debug, info, warn};

use super::{AuditError, AuditQuery, AuditRecord, AuditSink};

const FILE_PREFIX: &str = "audit-";
const FILE_SUFFIX: &str = ".jsonl";

pub fn audit_file_name(day: NaiveDate) -> String {
    format!("{FILE_PREFIX}{}{FILE_SUFFIX}", day.format("%Y-%m-%d"))
}

fn parse_audit_file_name(name: &str) -> Option<NaiveDate> {
    let date = name.strip_prefix(FILE_PREFIX)?.strip_suffix(FILE_SUFFIX)?;
    NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()
}

/// Audit files in `dir`, oldest first.
fn list_audit_files(dir: &Path) -> std::io::Result<Vec<(NaiveDate, PathBuf)>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        if let Some(day) = name.to_str().and_then(parse_audit_file_name) {
            files.push((day, entry.path()));
        }
    }
    files.sort();
    Ok(files)
}

/// Delete day files older than `retention_days` relative to `today`.
pub fn purge_expired(dir: &Path, retention_days: u32, today: NaiveDate) -> std::io::Result<usize> {
    let Some(cutoff) = today.checked_sub_days(Days::new(u64::from(retention_days))) else {
        return Ok(0);
    };
    let mut removed = 0;
    for (day, path) in list_audit_files(dir)? {
        if day < cutoff {
            fs::remove_file(&path)?;
            info!("Purged expired audit file {}", path.display());
            removed += 1;
        }
    }
    Ok(removed)
}

fn read_records(path: &Path) -> std::io::Result<Vec<AuditRecord>> {
    let reader = BufReader::new(File::open(path)?);
    let mut records = Vec::new();
    for (n, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<AuditRecord>(&line) {
            Ok(record) => records.push(record),
            Err(e) => warn!("Skipping malformed audit line {}:{}: {}", path.display(), n + 1, e),
        }
    }
    Ok(records)
}

/// True when the file's last byte is not a newline, i.e. a previous append
/// was cut short.
fn has_torn_tail(path: &Path) -> std::io::Result<bool> {
    let mut file = File::open(path)?;
    if file.metadata()?.len() == 0 {
        return Ok(false);
    }
    file.seek(SeekFrom::End(-1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] != b'\n')
}

#[derive(Debug)]
struct Writer {
    dir: PathBuf,
    retention_days: u32,
    next_sequence: u64,
    day: Option<NaiveDate>,
    file: Option<File>,
    /// The current file ends in a partial line; the next record starts on a
    /// fresh one.
    torn: bool,
}

impl Writer {
    fn roll_to(&mut self, day: NaiveDate) -> Result<(), AuditError> {
        if self.day == Some(day) && self.file.is_some() {
            return Ok(());
        }
        let path = self.dir.join(audit_file_name(day));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        if self.day.is_some() {
            purge_expired(&self.dir, self.retention_days, day)?;
        }
        self.torn = has_torn_tail(&path)?;
        if self.torn {
            warn!("Audit file {} ends in a partial line", path.display());
        }
        debug!("Audit log now writing {}", path.display());
        self.file = Some(file);
        self.day = Some(day);
        Ok(())
    }

    fn write(&mut self, mut record: AuditRecord) -> Result<AuditRecord, AuditError> {
        self.roll_to(record.timestamp.date_naive())?;
        record.sequence = self.next_sequence;
        let mut line = String::new();
        if self.torn {
            line.push('\n');
        }
        line.push_str(&serde_json::to_string(&record)?);
        line.push('\n');

        let file = self
            .file
            .as_mut()
            .ok_or_else(|| AuditError::Task("audit file not open".to_string()))?;
        let start = file.metadata()?.len();
        if let Err(e) = file.write_all(line.as_bytes()).and_then(|()| file.flush()) {
            // Cut the partial line back off; failing that, fence it off.
            if let Err(trunc) = file.set_len(start) {
                warn!("Cannot truncate partial audit line: {}", trunc);
                self.torn = true;
            }
            return Err(e.into());
        }
        self.torn = false;
        file.sync_data()?;

        self.next_sequence += 1;
        Ok(record)
    }
}

#[derive(Debug, Clone)]
pub struct FileAuditLog {
    dir: PathBuf,
    writer: Arc<Mutex<Writer>>,
}

impl FileAuditLog {
    /// Open (creating if needed) the audit directory, purge expired files and
    /// recover the next sequence number.
    pub fn open(dir: impl Into<PathBuf>, retention_days: u32) -> Result<Self, AuditError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&dir, fs::Permissions::from_mode(0o700))?;
        }

        let purged = purge_expired(&dir, retention_days, Utc::now().date_naive())?;
        let next_sequence = Self::recover_sequence(&dir)?;
        info!(
            "Audit log at {} (next sequence {}, purged {} file(s))",
            dir.display(),
            next_sequence,
            purged
        );

        Ok(Self {
            writer: Arc::new(Mutex::new(Writer {
                dir: dir.clone(),
                retention_days,
                next_sequence,
                day: None,
                file: None,
                torn: false,
            })),
            dir,
        })
    }

    fn recover_sequence(dir: &Path) -> Result<u64, AuditError> {
        for (_, path) in list_audit_files(dir)?.into_iter().rev() {
            if let Some(last) = read_records(&path)?.iter().map(|r| r.sequence).max() {
                return Ok(last + 1);
            }
        }
        Ok(0)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

fn lock_writer(writer: &Mutex<Writer>) -> MutexGuard<'_, Writer> {
    writer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl AuditSink for FileAuditLog {
    fn append(&self, record: AuditRecord) -> BoxFuture<'_, Result<AuditRecord, AuditError>> {
        let writer = self.writer.clone();
        Box::pin(async move {
            tokio::task::spawn_blocking(move || lock_writer(&writer).write(record))
                .await
                .map_err(|e| AuditError::Task(e.to_string()))?
        })
    }

    fn query(&self, query: &AuditQuery) -> Result<Vec<AuditRecord>, AuditError> {
        let since_day = query.since.map(|t| t.date_naive());
        let until_day = query.until.map(|t| t.date_naive());

        let mut out = Vec::new();
        for (day, path) in list_audit_files(&self.dir)? {
            if since_day.is_some_and(|d| day < d) || until_day.is_some_and(|d| day > d) {
                continue;
            }
            out.extend(read_records(&path)?.into_iter().filter(|r| query.matches(r)));
        }
        out.sort_by_key(|r| r.sequence);
        Ok(out)
    }
}

/// In-memory store with the same contract, for embedding and tests.
#[derive(Debug, Default)]
pub struct MemoryAuditLog {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<AuditRecord>> {
        self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

impl AuditSink for MemoryAuditLog {
    fn append(&self, mut record: AuditRecord) -> BoxFuture<'_, Result<AuditRecord, AuditError>> {
        Box::pin(async move {
            let mut records = self.lock();
            record.sequence = records.len() as u64;
            records.push(record.clone());
            Ok(record)
        })
    }

    fn query(&self, query: &AuditQuery) -> Result<Vec<AuditRecord>, AuditError> {
        Ok(self.lock().iter().filter(|r| query.matches(r)).cloned().collect())
    }
}
