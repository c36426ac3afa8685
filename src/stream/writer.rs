use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{error, info, warn};

use super::shutdown::{Coordinator, Stage, StageGuard, StageSignal};
use super::Envelope;
use crate::error::Error;
use crate::store::TransactionLog;

/// Persists every record it receives before passing it on to the sender.
///
/// Runs on a blocking thread: the append is synchronous and must finish before
/// the record moves on.
pub(crate) struct Writer {
    coordinator: Arc<Coordinator>,
    log: Option<TransactionLog>,
    fwd: Option<mpsc::Sender<Envelope>>,
}

impl Writer {
    pub(crate) fn new(
        coordinator: Arc<Coordinator>,
        log: TransactionLog,
        fwd: mpsc::Sender<Envelope>,
    ) -> Self {
        Self {
            coordinator,
            log: Some(log),
            fwd: Some(fwd),
        }
    }

    pub(crate) fn run(mut self, mut input: mpsc::Receiver<Envelope>) {
        let _guard = StageGuard::new(Arc::clone(&self.coordinator), Stage::Writer);
        let token = self.coordinator.token();

        while let Some(envelope) = input.blocking_recv() {
            if token.is_cancelled() {
                warn!("stream failed, writer abandoning input");
                self.abandon();
                return;
            }

            if envelope.record.is_persistable() {
                if let Some(log) = self.log.as_mut() {
                    if let Err(e) = log.append(&envelope.record) {
                        error!(uuid = %envelope.record.uuid, error = %e, "transaction log append failed");
                        self.coordinator.fail(Stage::Writer, e.into());
                        self.abandon();
                        return;
                    }
                }
            }

            let Some(fwd) = &self.fwd else { break };
            if fwd.blocking_send(envelope).is_err() {
                if !self.coordinator.is_failed() {
                    self.coordinator
                        .fail(Stage::Writer, Error::Fatal("sender queue closed unexpectedly".into()));
                }
                self.abandon();
                return;
            }
        }

        self.coordinator.signal(Stage::Writer, StageSignal::BeginDrain);
        if let Some(log) = self.log.take() {
            let records = log.len();
            match log.close() {
                Ok(()) => info!(records, "transaction log closed"),
                Err(e) => {
                    error!(error = %e, "failed to close transaction log");
                    self.coordinator.fail(Stage::Writer, e.into());
                }
            }
        }
        self.coordinator.signal(Stage::Writer, StageSignal::Finish);
        // dropping the forward queue lets the sender finish
        self.fwd.take();
    }

    fn abandon(&mut self) {
        // the log's Drop flushes what was written
        self.log.take();
        self.fwd.take();
        self.coordinator.signal(Stage::Writer, StageSignal::Fail);
    }
}
