//! Transmission stage.
//!
//! Sends records to the remote service in the order the writer persisted them,
//! retrying transient failures with exponential backoff. An exit record starts
//! the finalization cascade: the sender walks [`DeferState`] by looping each
//! step back through the handler, and once it reaches `End` it closes the
//! loopback, which is what lets the rest of the stream shut down.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::shutdown::{Coordinator, Stage, StageGuard, StageSignal};
use super::Envelope;
use crate::error::{Error, Result};
use crate::record::{DeferState, Item, Record, RecordKind, Response, ResultRecord};
use crate::services::transport::Transport;
use crate::settings::Settings;

enum Outcome {
    Sent(Option<Value>),
    /// The service refused the record for good.
    Rejected,
    /// Not transmitted: local, filtered, or merged into the pending upsert.
    Skipped,
}

/// Config and summary updates merged until the next upsert.
#[derive(Debug, Default)]
struct PendingUpsert {
    config: BTreeMap<String, Value>,
    summary: BTreeMap<String, Value>,
    updates: usize,
    /// Merged records whose callers asked for a result; acked once the upsert is sent.
    awaiting_ack: Vec<Record>,
}

impl PendingUpsert {
    fn merge(&mut self, kind: &RecordKind) -> bool {
        let (target, items) = match kind {
            RecordKind::Config(c) => (&mut self.config, &c.update),
            RecordKind::Summary(s) => (&mut self.summary, &s.update),
            _ => return false,
        };
        for item in items {
            target.insert(item.key.clone(), item.value.clone());
        }
        self.updates += 1;
        true
    }

    fn take_records(&mut self) -> Vec<Record> {
        let mut records = Vec::with_capacity(2);
        let config = std::mem::take(&mut self.config);
        if !config.is_empty() {
            records.push(Record::config(into_items(config)));
        }
        let summary = std::mem::take(&mut self.summary);
        if !summary.is_empty() {
            records.push(Record::summary(into_items(summary)));
        }
        self.updates = 0;
        records
    }
}

fn into_items(map: BTreeMap<String, Value>) -> Vec<Item> {
    map.into_iter().map(|(key, value)| Item { key, value }).collect()
}

pub(crate) struct Sender {
    settings: Arc<Settings>,
    coordinator: Arc<Coordinator>,
    transport: Arc<dyn Transport>,
    loopback: Option<mpsc::Sender<Record>>,
    out: Option<mpsc::Sender<ResultRecord>>,
    pending: PendingUpsert,
    exit: Option<Record>,
    /// Past `FlushSender`: nothing is merged any more, every record goes out directly.
    upserts_flushed: bool,
    transmitted: u64,
}

impl Sender {
    pub(crate) fn new(
        settings: Arc<Settings>,
        coordinator: Arc<Coordinator>,
        transport: Arc<dyn Transport>,
        loopback: mpsc::Sender<Record>,
        out: mpsc::Sender<ResultRecord>,
    ) -> Self {
        Self {
            settings,
            coordinator,
            transport,
            loopback: Some(loopback),
            out: Some(out),
            pending: PendingUpsert::default(),
            exit: None,
            upserts_flushed: false,
            transmitted: 0,
        }
    }

    pub(crate) async fn run(mut self, mut input: mpsc::Receiver<Envelope>) {
        let _guard = StageGuard::new(Arc::clone(&self.coordinator), Stage::Sender);
        let token = self.coordinator.token();

        loop {
            let envelope = tokio::select! {
                biased;
                _ = token.cancelled() => {
                    warn!(pending = self.pending.updates, "stream failed, sender abandoning input");
                    self.abandon();
                    return;
                }
                envelope = input.recv() => envelope,
            };
            let Some(envelope) = envelope else { break };

            if let Err(e) = self.process(envelope).await {
                self.coordinator.fail(Stage::Sender, e);
                self.abandon();
                return;
            }
        }

        // the writer has finished, nothing else can arrive
        if let Err(e) = self.flush_pending().await {
            self.coordinator.fail(Stage::Sender, e);
            self.abandon();
            return;
        }
        if self.loopback.is_some() {
            warn!("input closed before finalization completed");
            self.coordinator.signal(Stage::Sender, StageSignal::BeginDrain);
            self.loopback.take();
        }
        info!(transmitted = self.transmitted, "sender finished");
        self.coordinator.signal(Stage::Sender, StageSignal::Finish);
        self.out.take();
    }

    async fn process(&mut self, envelope: Envelope) -> Result<()> {
        let Envelope { record, transmit } = envelope;

        if let Some(state) = record.defer_state() {
            return self.handle_defer(state).await;
        }

        if let RecordKind::Exit(exit) = &record.kind {
            info!(exit_code = exit.exit_code, "exit reached sender, flushing");
            self.flush_pending().await?;
            if transmit {
                self.transmit(&record).await?;
            }
            self.exit = Some(record);
            return self.loop_back(DeferState::Begin).await;
        }

        if transmit && !self.upserts_flushed && self.pending.merge(&record.kind) {
            if record.control.req_resp {
                self.pending.awaiting_ack.push(record);
            }
            if self.pending.updates >= self.settings.summary_batch_size {
                self.flush_pending().await?;
            }
            return Ok(());
        }

        let outcome = if transmit {
            self.transmit(&record).await?
        } else {
            Outcome::Skipped
        };

        if record.control.req_resp {
            let response = match (outcome, &record.kind) {
                (Outcome::Sent(payload), RecordKind::Run(_)) => Response::RunUpdate { payload },
                (Outcome::Sent(_), _) => Response::Ack { transmitted: true },
                (Outcome::Rejected | Outcome::Skipped, _) => Response::Ack { transmitted: false },
            };
            self.respond(ResultRecord::reply_to(&record, response)).await;
        }
        Ok(())
    }

    /// Sender side of one finalization step.
    async fn handle_defer(&mut self, state: DeferState) -> Result<()> {
        debug!(?state, "defer");
        if state == DeferState::FlushSender {
            self.flush_pending().await?;
            self.upserts_flushed = true;
        }

        match state.next() {
            Some(next) => self.loop_back(next).await,
            None => {
                self.coordinator.signal(Stage::Sender, StageSignal::BeginDrain);
                // closing the loopback lets the handler finish
                self.loopback.take();
                if let Some(exit) = self.exit.take() {
                    if let RecordKind::Exit(e) = &exit.kind {
                        let response = Response::Exit { exit_code: e.exit_code };
                        self.respond(ResultRecord::reply_to(&exit, response)).await;
                    }
                }
                info!("finalization complete");
                Ok(())
            }
        }
    }

    async fn loop_back(&mut self, state: DeferState) -> Result<()> {
        let Some(loopback) = &self.loopback else {
            warn!(?state, "finalization already complete, ignoring");
            return Ok(());
        };
        loopback
            .send(Record::defer(state))
            .await
            .map_err(|_| Error::Fatal("handler loopback closed during finalization".into()))
    }

    async fn flush_pending(&mut self) -> Result<()> {
        let awaiting_ack = std::mem::take(&mut self.pending.awaiting_ack);
        let mut transmitted = true;
        for record in self.pending.take_records() {
            if !matches!(self.transmit(&record).await?, Outcome::Sent(_)) {
                transmitted = false;
            }
        }
        for record in awaiting_ack {
            self.respond(ResultRecord::reply_to(&record, Response::Ack { transmitted }))
                .await;
        }
        Ok(())
    }

    /// Sends with retry. Errors only when the retry budget is spent or the stream failed.
    async fn transmit(&mut self, record: &Record) -> Result<Outcome> {
        let token = self.coordinator.token();
        let mut backoff = self.settings.retry.backoff();

        loop {
            let attempt = tokio::select! {
                _ = token.cancelled() => return Err(Error::Fatal("stream failed during transmission".into())),
                attempt = self.transport.send(record) => attempt,
            };

            match attempt {
                Ok(payload) => {
                    self.transmitted += 1;
                    return Ok(Outcome::Sent(payload));
                }
                Err(e) if e.is_retryable() => match backoff.next() {
                    Some(delay) => {
                        warn!(
                            uuid = %record.uuid, kind = record.name(), attempt = backoff.current_attempt(),
                            ?delay, error = %e, "transmission failed, retrying"
                        );
                        tokio::select! {
                            _ = token.cancelled() => return Err(Error::Fatal("stream failed during retry".into())),
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                    None => {
                        return Err(Error::Transport(format!(
                            "retries exhausted sending {} record {}: {}",
                            record.name(),
                            record.uuid,
                            e
                        )))
                    }
                },
                Err(e) => {
                    warn!(uuid = %record.uuid, kind = record.name(), error = %e, "record rejected by remote, dropping");
                    return Ok(Outcome::Rejected);
                }
            }
        }
    }

    async fn respond(&self, result: ResultRecord) {
        let Some(out) = &self.out else { return };
        if out.send(result).await.is_err() {
            warn!("dispatcher gone, dropping result");
        }
    }

    fn abandon(&mut self) {
        self.loopback.take();
        self.out.take();
        self.coordinator.signal(Stage::Sender, StageSignal::Fail);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_pending_upsert_merges_latest_values() {
        let mut pending = PendingUpsert::default();
        assert!(pending.merge(&Record::summary(vec![Item::new("loss", 1.0)]).kind));
        assert!(pending.merge(&Record::summary(vec![Item::new("loss", 0.5)]).kind));
        assert!(pending.merge(&Record::config(vec![Item::new("lr", 0.1)]).kind));
        assert!(!pending.merge(&Record::exit(0).kind));
        assert_eq!(pending.updates, 3);

        let records = pending.take_records();
        assert_eq!(records.len(), 2);
        match &records[1].kind {
            RecordKind::Summary(s) => assert_eq!(s.update, vec![Item::new("loss", json!(0.5))]),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(pending.updates, 0);
        assert!(pending.take_records().is_empty());
    }
}
