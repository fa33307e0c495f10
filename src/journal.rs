//! Diagnostics journal: a bounded, queryable record of what translation had to drop
//! or degrade, persisted as JSONL so it survives restarts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::translate::{Diagnostic, DiagnosticKind};

const MAX_JOURNAL_ENTRIES: usize = 10_000;
/// Rewrite the file down to the ring once it holds this many lines.
const COMPACT_AFTER_LINES: usize = MAX_JOURNAL_ENTRIES * 2;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JournalLevel {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub level: JournalLevel,
    pub component: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<DiagnosticKind>,
    pub message: String,
}

impl JournalEntry {
    pub fn new(level: JournalLevel, component: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            request_id: None,
            level,
            component: component.into(),
            kind: None,
            message: message.into(),
        }
    }

    pub fn for_request(mut self, request_id: &str) -> Self {
        self.request_id = Some(request_id.to_string());
        self
    }

    pub fn from_diagnostic(component: &str, diagnostic: &Diagnostic) -> Self {
        let level = if diagnostic.kind.is_translation_error() {
            JournalLevel::Warn
        } else {
            JournalLevel::Info
        };
        Self {
            kind: Some(diagnostic.kind),
            ..Self::new(level, component, diagnostic.message.clone())
        }
    }
}

/// Ring buffer of journal entries, optionally mirrored to a JSONL file.
pub struct Journal {
    entries: VecDeque<JournalEntry>,
    file_path: Option<PathBuf>,
    writer: Option<BufWriter<File>>,
    /// Lines currently in the file, including ones that failed to parse.
    file_lines: usize,
}

impl Journal {
    /// Open (or create) the journal file and reload its most recent entries.
    pub fn open(file_path: impl AsRef<Path>) -> std::io::Result<Self> {
        let file_path = file_path.as_ref();

        if let Some(parent) = file_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let mut entries = VecDeque::with_capacity(MAX_JOURNAL_ENTRIES);
        let mut file_lines = 0;

        if file_path.exists() {
            let reader = BufReader::new(File::open(file_path)?);
            for line in reader.lines().map_while(std::result::Result::ok) {
                file_lines += 1;
                if let Ok(entry) = serde_json::from_str::<JournalEntry>(&line) {
                    if entries.len() >= MAX_JOURNAL_ENTRIES {
                        entries.pop_front();
                    }
                    entries.push_back(entry);
                }
            }
        }

        let mut journal = Self {
            entries,
            file_path: Some(file_path.to_path_buf()),
            writer: None,
            file_lines,
        };

        if file_lines > journal.entries.len() {
            journal.compact()?;
        } else {
            journal.writer = Some(append_writer(file_path)?);
        }

        Ok(journal)
    }

    pub fn in_memory() -> Self {
        Self {
            entries: VecDeque::new(),
            file_path: None,
            writer: None,
            file_lines: 0,
        }
    }

    pub fn record(&mut self, entry: JournalEntry) {
        if let Some(ref mut writer) = self.writer {
            if let Ok(json) = serde_json::to_string(&entry) {
                let _ = writeln!(writer, "{json}");
                let _ = writer.flush();
                self.file_lines += 1;
            }
        }
        if self.entries.len() >= MAX_JOURNAL_ENTRIES {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);

        if self.file_lines >= COMPACT_AFTER_LINES {
            if let Err(e) = self.compact() {
                tracing::warn!("Failed to compact diagnostics journal: {}", e);
            }
        }
    }

    /// Rewrite the file so it holds exactly the entries in the ring.
    pub fn compact(&mut self) -> std::io::Result<()> {
        let Some(file_path) = self.file_path.clone() else {
            return Ok(());
        };

        self.writer = None;
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&file_path)?;
        let mut writer = BufWriter::new(file);
        let mut written = 0;
        for entry in &self.entries {
            if let Ok(json) = serde_json::to_string(entry) {
                writeln!(writer, "{json}")?;
                written += 1;
            }
        }
        writer.flush()?;

        self.file_lines = written;
        self.writer = Some(append_writer(&file_path)?);
        Ok(())
    }

    /// Newest first.
    pub fn recent(&self, limit: usize) -> Vec<JournalEntry> {
        self.entries.iter().rev().take(limit).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn append_writer(file_path: &Path) -> std::io::Result<BufWriter<File>> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(file_path)?;
    Ok(BufWriter::new(file))
}

/// Thread-safe handle shared by all request handlers.
#[derive(Clone)]
pub struct SharedJournal(Arc<Mutex<Journal>>);

impl SharedJournal {
    pub fn open(file_path: impl AsRef<Path>) -> std::io::Result<Self> {
        Ok(Self::from_journal(Journal::open(file_path)?))
    }

    pub fn in_memory() -> Self {
        Self::from_journal(Journal::in_memory())
    }

    fn from_journal(journal: Journal) -> Self {
        Self(Arc::new(Mutex::new(journal)))
    }

    pub fn record(&self, entry: JournalEntry) {
        if let Ok(mut journal) = self.0.lock() {
            journal.record(entry);
        }
    }

    /// Record translation diagnostics for one request.
    pub fn diagnostics(&self, request_id: &str, component: &str, diagnostics: &[Diagnostic]) {
        if diagnostics.is_empty() {
            return;
        }
        if let Ok(mut journal) = self.0.lock() {
            for d in diagnostics {
                journal.record(JournalEntry::from_diagnostic(component, d).for_request(request_id));
            }
        }
    }

    pub fn warn(&self, request_id: &str, component: &str, message: impl Into<String>) {
        self.record(JournalEntry::new(JournalLevel::Warn, component, message).for_request(request_id));
    }

    pub fn error(&self, request_id: &str, component: &str, message: impl Into<String>) {
        self.record(JournalEntry::new(JournalLevel::Error, component, message).for_request(request_id));
    }

    pub fn recent(&self, limit: usize) -> Vec<JournalEntry> {
        self.0.lock().map(|j| j.recent(limit)).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.0.lock().map(|j| j.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
