#![allow(dead_code)]

use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use nexus_stream::error::TransportError;
use nexus_stream::record::{OutputRecord, OutputStream};
use nexus_stream::settings::RetrySettings;
use nexus_stream::store::LogSink;
use nexus_stream::{Record, RecordKind, Settings};
use nexus_stream::services::transport::Transport;
use parking_lot::Mutex;
use serde_json::Value;
use tempfile::TempDir;
use tokio::sync::Semaphore;

pub fn settings(dir: &TempDir) -> Settings {
    Settings {
        sync_dir: dir.path().to_path_buf(),
        show_footer: false,
        retry: RetrySettings {
            base_interval_ms: 1,
            max_interval_ms: 5,
            factor: 2.0,
            jitter: 0.0,
            max_attempts: 5,
        },
        ..Settings::default()
    }
}

pub fn output(line: &str) -> Record {
    Record::new(RecordKind::Output(OutputRecord {
        stream: OutputStream::Stdout,
        line: line.to_string(),
    }))
}

/// Accepts everything and remembers what it was sent.
#[derive(Default)]
pub struct RecordingTransport {
    pub sent: Mutex<Vec<Record>>,
}

impl RecordingTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn sent(&self) -> Vec<Record> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send(&self, record: &Record) -> Result<Option<Value>, TransportError> {
        self.sent.lock().push(record.clone());
        Ok(None)
    }
}

/// Fails the first `failures` sends with a transient error, then records.
pub struct FlakyTransport {
    failures: usize,
    pub calls: AtomicUsize,
    pub inner: RecordingTransport,
}

impl FlakyTransport {
    pub fn new(failures: usize) -> Arc<Self> {
        Arc::new(Self {
            failures,
            calls: AtomicUsize::new(0),
            inner: RecordingTransport::default(),
        })
    }
}

#[async_trait]
impl Transport for FlakyTransport {
    async fn send(&self, record: &Record) -> Result<Option<Value>, TransportError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            return Err(TransportError::Transient(format!("attempt {} refused", call)));
        }
        self.inner.send(record).await
    }
}

pub struct FailingTransport {
    pub permanent: bool,
    pub calls: AtomicUsize,
}

impl FailingTransport {
    pub fn transient() -> Arc<Self> {
        Arc::new(Self {
            permanent: false,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn permanent() -> Arc<Self> {
        Arc::new(Self {
            permanent: true,
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl Transport for FailingTransport {
    async fn send(&self, _record: &Record) -> Result<Option<Value>, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.permanent {
            Err(TransportError::Permanent("400 bad request".into()))
        } else {
            Err(TransportError::Transient("503 service unavailable".into()))
        }
    }
}

/// Every send waits for a permit, so the remote is as slow as the test wants.
pub struct GatedTransport {
    pub gate: Semaphore,
    pub inner: RecordingTransport,
}

impl GatedTransport {
    pub fn closed() -> Arc<Self> {
        Arc::new(Self {
            gate: Semaphore::new(0),
            inner: RecordingTransport::default(),
        })
    }

    pub fn open(&self) {
        self.gate.add_permits(Semaphore::MAX_PERMITS / 2);
    }
}

#[async_trait]
impl Transport for GatedTransport {
    async fn send(&self, record: &Record) -> Result<Option<Value>, TransportError> {
        match self.gate.acquire().await {
            Ok(permit) => permit.forget(),
            Err(_) => return Err(TransportError::Permanent("gate closed".into())),
        }
        self.inner.send(record).await
    }
}

/// Accepts `lines` complete lines, then fails every write.
pub struct FailingSink {
    pub lines: usize,
}

impl Write for FailingSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if self.lines == 0 {
            return Err(std::io::Error::other("disk full"));
        }
        let newlines = buf.iter().filter(|b| **b == b'\n').count();
        self.lines = self.lines.saturating_sub(newlines);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl LogSink for FailingSink {
    fn sync(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
