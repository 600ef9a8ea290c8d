//! ---
//! ota_section: "03-persistence-logging"
//! ota_subsection: "module"
//! ota_type: "source"
//! ota_scope: "code"
//! ota_description: "Installed-version ledger and storage bindings."
//! ota_version: "v0.0.0-prealpha"
//! ota_owner: "tbd"
//! ---
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use ota_common::Target;
use serde::{Deserialize, Serialize};

use crate::{state::LEDGER_VERSION, PersistenceError, Result};

/// Header stored as the first line of the installation log.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct InstallLogHeader {
    version: u16,
    created_at: DateTime<Utc>,
}

/// Slot a target was moved into by a ledger mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstallMode {
    /// Installed, awaiting reboot.
    Pending,
    /// Running on the device.
    Current,
    /// Dropped from both slots (e.g. rolled back).
    None,
}

impl InstallMode {
    /// Lowercase label matching the on-disk encoding.
    pub fn as_str(&self) -> &'static str {
        match self {
            InstallMode::Pending => "pending",
            InstallMode::Current => "current",
            InstallMode::None => "none",
        }
    }
}

/// One line of the installation log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstallLogEntry {
    /// Sequential identifier assigned when appending.
    pub sequence: u64,
    /// Timestamp when the mutation was recorded.
    pub timestamp: DateTime<Utc>,
    /// Slot the target moved into.
    pub mode: InstallMode,
    /// Target affected by the mutation.
    pub target: Target,
}

impl InstallLogEntry {
    /// Construct an entry; the sequence is assigned on append.
    pub fn new(target: Target, mode: InstallMode) -> Self {
        Self {
            sequence: 0,
            timestamp: Utc::now(),
            mode,
            target,
        }
    }
}

/// Append-only writer for the installation log.
pub struct InstallLogWriter {
    path: PathBuf,
    writer: BufWriter<File>,
    next_sequence: u64,
}

impl InstallLogWriter {
    /// Open the log for appending, writing a header if the file is new.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let fresh = !path.exists() || fs::metadata(path)?.len() == 0;
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let mut writer = BufWriter::new(file);

        let next_sequence = if fresh {
            let header = InstallLogHeader {
                version: LEDGER_VERSION,
                created_at: Utc::now(),
            };
            writer.write_all(serde_json::to_string(&header)?.as_bytes())?;
            writer.write_all(b"\n")?;
            writer.flush()?;
            0
        } else {
            if !ends_with_newline(path)? {
                writer.write_all(b"\n")?;
                writer.flush()?;
            }
            last_sequence(path)?
        };

        Ok(Self {
            path: path.to_path_buf(),
            writer,
            next_sequence,
        })
    }

    /// Append an entry and return its assigned sequence number.
    pub fn append(&mut self, mut entry: InstallLogEntry) -> Result<u64> {
        self.next_sequence += 1;
        entry.sequence = self.next_sequence;
        let line = serde_json::to_string(&entry)?;
        self.writer.write_all(line.as_bytes())?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        Ok(entry.sequence)
    }

    /// Location of the log on disk.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn ends_with_newline(path: &Path) -> Result<bool> {
    let mut file = File::open(path)?;
    if file.metadata()?.len() == 0 {
        return Ok(true);
    }
    file.seek(SeekFrom::End(-1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] == b'\n')
}

fn last_sequence(path: &Path) -> Result<u64> {
    // A torn final line from a crash mid-append is skipped.
    Ok(InstallLogReader::open(path)?
        .flatten()
        .last()
        .map_or(0, |entry| entry.sequence))
}

/// Streaming iterator over log entries, header excluded.
pub struct InstallLogReader {
    lines: std::io::Lines<BufReader<File>>,
}

impl InstallLogReader {
    /// Open the log for sequential reading.
    pub fn open(path: &Path) -> Result<Self> {
        let mut reader = BufReader::new(File::open(path)?);
        let mut header = String::new();
        reader.read_line(&mut header)?;
        Ok(Self {
            lines: reader.lines(),
        })
    }
}

impl Iterator for InstallLogReader {
    type Item = Result<InstallLogEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.lines.next()? {
                Ok(line) if line.trim().is_empty() => continue,
                Ok(line) => {
                    return Some(serde_json::from_str(&line).map_err(PersistenceError::from))
                }
                Err(err) => return Some(Err(err.into())),
            }
        }
    }
}

/// Read every well-formed entry in order, skipping undecodable lines.
pub fn read_entries(path: &Path) -> Result<Vec<InstallLogEntry>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let mut entries = Vec::new();
    for entry in InstallLogReader::open(path)? {
        match entry {
            Ok(entry) => entries.push(entry),
            Err(PersistenceError::Json(err)) => {
                tracing::warn!(error = %err, log = %path.display(), "skipping unreadable installation log line");
            }
            Err(err) => return Err(err),
        }
    }
    Ok(entries)
}
