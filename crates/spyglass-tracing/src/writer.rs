//! JSONL record files.
//!
//! One record per line, appended as it arrives. A writer targets either a
//! single session file or a directory of `YYYY-MM-DD.jsonl` files keyed by
//! the UTC day the record was written.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{NaiveDate, Utc};

use crate::types::Record;

#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{path}:{line}: malformed record: {source}")]
    Malformed {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },
}

/// Where records go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriterConfig {
    /// Every record in one file.
    Session(PathBuf),
    /// One file per UTC day inside this directory.
    Daily(PathBuf),
}

impl WriterConfig {
    pub fn session(file: impl Into<PathBuf>) -> Self {
        Self::Session(file.into())
    }

    pub fn daily_rotation(dir: impl Into<PathBuf>) -> Self {
        Self::Daily(dir.into())
    }

    /// File a record written on `day` belongs to.
    pub fn file_for(&self, day: NaiveDate) -> PathBuf {
        match self {
            Self::Session(file) => file.clone(),
            Self::Daily(dir) => dir.join(format!("{}.jsonl", day.format("%Y-%m-%d"))),
        }
    }

    fn directory(&self) -> Option<&Path> {
        match self {
            Self::Session(file) => file.parent(),
            Self::Daily(dir) => Some(dir),
        }
    }
}

/// Appends records to JSONL files. Safe to share across threads.
pub struct RecordWriter {
    config: WriterConfig,
    open: Mutex<Option<OpenFile>>,
}

struct OpenFile {
    path: PathBuf,
    out: BufWriter<File>,
}

impl RecordWriter {
    /// Create the target directory and return a writer for it.
    pub fn new(config: WriterConfig) -> Result<Self, WriteError> {
        if let Some(dir) = config.directory().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }
        Ok(Self {
            config,
            open: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &WriterConfig {
        &self.config
    }

    /// File the next record will be appended to.
    pub fn current_file_path(&self) -> PathBuf {
        self.config.file_for(Utc::now().date_naive())
    }

    /// Append one record and flush it to disk.
    pub fn write(&self, record: &Record) -> Result<(), WriteError> {
        let line = serde_json::to_string(record)?;
        let path = self.current_file_path();

        // A poisoned lock only means another writer panicked mid-line; keep going.
        let mut open = self.open.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        // Reopen when the day rolls over.
        let file = match open.take() {
            Some(file) if file.path == path => file,
            _ => OpenFile {
                out: BufWriter::new(OpenOptions::new().create(true).append(true).open(&path)?),
                path,
            },
        };
        let file = open.insert(file);

        writeln!(file.out, "{line}")?;
        file.out.flush()?;
        Ok(())
    }

    /// Read every record from a JSONL file, skipping blank lines.
    ///
    /// A malformed line fails the read and names its line number.
    pub fn read_records(path: &Path) -> Result<Vec<Record>, WriteError> {
        fs::read_to_string(path)?
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(index, line)| {
                serde_json::from_str(line).map_err(|source| WriteError::Malformed {
                    path: path.to_path_buf(),
                    line: index + 1,
                    source,
                })
            })
            .collect()
    }
}
