//! Append-only transaction log.
//!
//! One file per run: a header line, then one JSON object per record in the order
//! the writer received them. Each append is flushed before the writer forwards
//! the record, so a crash can at worst truncate the final line. [`TransactionLog::replay`]
//! tolerates that truncated tail and nothing else.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::LogError;
use crate::record::Record;

const MAGIC: &str = "NXSLOG";
const VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct Header {
    magic: String,
    version: u32,
}

#[derive(Serialize)]
struct EntryRef<'a> {
    seq: u64,
    record: &'a Record,
}

#[derive(Deserialize)]
struct Entry {
    seq: u64,
    record: Record,
}

/// Where log bytes end up. A plain [`File`] outside of tests.
pub trait LogSink: Write + Send {
    /// Makes everything written so far durable.
    fn sync(&mut self) -> std::io::Result<()>;
}

impl LogSink for File {
    fn sync(&mut self) -> std::io::Result<()> {
        self.sync_all()
    }
}

/// Exclusively owned by the writer. Released by [`TransactionLog::close`] or, on
/// any other exit path, by `Drop`.
pub struct TransactionLog {
    path: PathBuf,
    out: Option<BufWriter<Box<dyn LogSink>>>,
    seq: u64,
}

impl TransactionLog {
    /// Creates (truncating) the log at `path` and writes the header.
    pub fn create(path: impl Into<PathBuf>) -> Result<Self, LogError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| io_err(&path, e))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| io_err(&path, e))?;
        Self::from_sink(path, Box::new(file))
    }

    /// Starts a log on an already opened sink. `path` is only used for reporting.
    pub fn from_sink(path: impl Into<PathBuf>, sink: Box<dyn LogSink>) -> Result<Self, LogError> {
        let mut log = Self {
            path: path.into(),
            out: Some(BufWriter::new(sink)),
            seq: 0,
        };
        let header = serde_json::to_string(&Header {
            magic: MAGIC.to_string(),
            version: VERSION,
        })?;
        log.write_line(&header)?;
        debug!(path = %log.path.display(), "transaction log opened");
        Ok(log)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of records appended so far.
    pub fn len(&self) -> u64 {
        self.seq
    }

    pub fn is_empty(&self) -> bool {
        self.seq == 0
    }

    /// Appends `record` and flushes it to the OS before returning.
    pub fn append(&mut self, record: &Record) -> Result<u64, LogError> {
        let seq = self.seq;
        let line = serde_json::to_string(&EntryRef { seq, record })?;
        self.write_line(&line)?;
        self.seq += 1;
        Ok(seq)
    }

    fn write_line(&mut self, line: &str) -> Result<(), LogError> {
        let path = &self.path;
        let out = self.out.as_mut().ok_or_else(|| {
            io_err(path, std::io::Error::other("transaction log already closed"))
        })?;
        out.write_all(line.as_bytes()).map_err(|e| io_err(path, e))?;
        out.write_all(b"\n").map_err(|e| io_err(path, e))?;
        out.flush().map_err(|e| io_err(path, e))
    }

    /// Flushes and syncs the file, then releases the handle.
    pub fn close(mut self) -> Result<(), LogError> {
        self.release()
    }

    fn release(&mut self) -> Result<(), LogError> {
        let Some(mut out) = self.out.take() else {
            return Ok(());
        };
        out.flush().map_err(|e| io_err(&self.path, e))?;
        let mut sink = out.into_inner().map_err(|e| io_err(&self.path, e.into_error()))?;
        sink.sync().map_err(|e| io_err(&self.path, e))?;
        debug!(path = %self.path.display(), records = self.seq, "transaction log closed");
        Ok(())
    }

    /// Reads back every record in append order.
    pub fn replay(path: impl AsRef<Path>) -> Result<Vec<Record>, LogError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| io_err(path, e))?;
        let mut lines = BufReader::new(file).lines();

        let header_line = match lines.next() {
            Some(line) => line.map_err(|e| io_err(path, e))?,
            None => return Err(LogError::BadHeader(path.display().to_string())),
        };
        let header: Header = serde_json::from_str(&header_line)
            .map_err(|_| LogError::BadHeader(path.display().to_string()))?;
        if header.magic != MAGIC || header.version != VERSION {
            return Err(LogError::BadHeader(path.display().to_string()));
        }

        let raw: Vec<String> = lines
            .collect::<Result<_, _>>()
            .map_err(|e| io_err(path, e))?;
        let mut records = Vec::with_capacity(raw.len());
        for (idx, line) in raw.iter().enumerate() {
            let line_no = idx + 2;
            match serde_json::from_str::<Entry>(line) {
                Ok(entry) => {
                    if entry.seq != records.len() as u64 {
                        return Err(LogError::Corrupt {
                            line: line_no,
                            reason: format!("expected seq {}, found {}", records.len(), entry.seq),
                        });
                    }
                    records.push(entry.record);
                }
                // a crash mid-append leaves at most one partial line at the end
                Err(e) if idx + 1 == raw.len() => {
                    warn!(path = %path.display(), line = line_no, error = %e, "skipping truncated tail entry");
                }
                Err(e) => {
                    return Err(LogError::Corrupt {
                        line: line_no,
                        reason: e.to_string(),
                    })
                }
            }
        }
        Ok(records)
    }
}

impl Drop for TransactionLog {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!(path = %self.path.display(), error = %e, "failed to release transaction log");
        }
    }
}

fn io_err(path: &Path, source: std::io::Error) -> LogError {
    LogError::Io {
        path: path.display().to_string(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Item;

    #[test]
    fn test_append_then_replay_keeps_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.nexus");

        let mut log = TransactionLog::create(&path).unwrap();
        let records: Vec<Record> = (0..5)
            .map(|i| Record::history(vec![Item::new("step", i)]))
            .collect();
        for r in &records {
            log.append(r).unwrap();
        }
        assert_eq!(log.len(), 5);
        log.close().unwrap();

        assert_eq!(TransactionLog::replay(&path).unwrap(), records);
    }

    #[test]
    fn test_replay_skips_truncated_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.nexus");

        let mut log = TransactionLog::create(&path).unwrap();
        log.append(&Record::exit(0)).unwrap();
        drop(log);

        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{\"seq\":1,\"record\":{\"uu").unwrap();

        let replayed = TransactionLog::replay(&path).unwrap();
        assert_eq!(replayed.len(), 1);
    }

    #[test]
    fn test_replay_rejects_interior_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.nexus");
        fs::write(
            &path,
            "{\"magic\":\"NXSLOG\",\"version\":1}\nnot json\n{\"also\":\"bad\"}\n",
        )
        .unwrap();

        assert!(matches!(
            TransactionLog::replay(&path),
            Err(LogError::Corrupt { line: 2, .. })
        ));
    }

    #[test]
    fn test_replay_rejects_foreign_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("other.txt");
        fs::write(&path, "hello\n").unwrap();
        assert!(matches!(
            TransactionLog::replay(&path),
            Err(LogError::BadHeader(_))
        ));
    }
}
