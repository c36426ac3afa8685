//! Business-logic stage. Owns the [`Run`], decides what gets persisted and what
//! gets transmitted, and answers requests.
//!
//! Input comes from two queues: the entry queue fed by callers, and the loopback
//! fed by the sender during finalization. Both go through the same
//! [`Handler::handle`], one record at a time, and each record's run updates are
//! applied under a single write lock so readers never see half of a record.

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::shutdown::{Coordinator, Stage, StageGuard, StageSignal};
use super::Envelope;
use crate::error::Error;
use crate::record::{
    ConfigRecord, DeferState, HistoryRecord, Item, Record, RecordKind, Request, Response,
    ResultRecord, SummaryRecord, TelemetryRecord,
};
use crate::run::{Run, RunDelta};
use crate::settings::Settings;

/// The forward queue is gone; the handler cannot continue.
struct ForwardLost;

pub(crate) struct Handler {
    settings: Arc<Settings>,
    run: Arc<RwLock<Run>>,
    coordinator: Arc<Coordinator>,
    fwd: Option<mpsc::Sender<Envelope>>,
    out: Option<mpsc::Sender<ResultRecord>>,
    exit_seen: bool,
    defer_started: bool,
    telemetry_flushed: bool,
    stats_seen: u64,
}

impl Handler {
    pub(crate) fn new(
        settings: Arc<Settings>,
        run: Arc<RwLock<Run>>,
        coordinator: Arc<Coordinator>,
        fwd: mpsc::Sender<Envelope>,
        out: mpsc::Sender<ResultRecord>,
    ) -> Self {
        Self {
            settings,
            run,
            coordinator,
            fwd: Some(fwd),
            out: Some(out),
            exit_seen: false,
            defer_started: false,
            telemetry_flushed: false,
            stats_seen: 0,
        }
    }

    pub(crate) async fn run(
        mut self,
        mut entry: mpsc::Receiver<Record>,
        mut loopback: mpsc::Receiver<Record>,
    ) {
        let _guard = StageGuard::new(Arc::clone(&self.coordinator), Stage::Handler);
        let token = self.coordinator.token();
        let mut entry_open = true;
        let mut loopback_open = true;

        while entry_open || loopback_open {
            let record = tokio::select! {
                biased;
                _ = token.cancelled() => {
                    warn!("stream failed, handler abandoning input");
                    self.coordinator.signal(Stage::Handler, StageSignal::Fail);
                    return;
                }
                record = loopback.recv(), if loopback_open => match record {
                    Some(record) => record,
                    None => {
                        debug!("loopback closed");
                        loopback_open = false;
                        continue;
                    }
                },
                record = entry.recv(), if entry_open => match record {
                    Some(record) if record.defer_state().is_some() => {
                        warn!(uuid = %record.uuid, "finalization steps are internal, dropping submitted record");
                        continue;
                    }
                    Some(record) => record,
                    None => {
                        debug!("entry queue closed");
                        entry_open = false;
                        if self.on_entry_closed().await.is_err() {
                            return;
                        }
                        continue;
                    }
                },
            };

            if self.handle(record).await.is_err() {
                return;
            }
        }

        self.coordinator.signal(Stage::Handler, StageSignal::BeginDrain);
        info!(records = self.run.read().records_seen(), "handler finished");
        self.coordinator.signal(Stage::Handler, StageSignal::Finish);
        // Closed must be visible before the writer sees the forward queue end
        self.fwd.take();
        self.out.take();
    }

    /// Without an exit record nobody starts the finalization cascade, so the
    /// handler starts it itself.
    async fn on_entry_closed(&mut self) -> Result<(), ForwardLost> {
        if self.exit_seen || self.defer_started {
            return Ok(());
        }
        info!("entry queue closed without an exit record, starting finalization");
        self.handle(Record::defer(DeferState::Begin)).await
    }

    async fn handle(&mut self, record: Record) -> Result<(), ForwardLost> {
        if let Err(reason) = record.validate() {
            warn!(uuid = %record.uuid, kind = record.name(), %reason, "dropping malformed record");
            return Ok(());
        }

        let local = record.control.local;
        let (record, transmit) = match &record.kind {
            RecordKind::Request(request) => return self.handle_request(*request, record).await,
            RecordKind::Exit(exit) => {
                let code = exit.exit_code;
                let accepted = self.with_run(|run| {
                    let accepted = run.reduce(RunDelta::Exit(code));
                    if accepted {
                        run.reduce(RunDelta::Counted);
                    }
                    accepted
                });
                if !accepted {
                    warn!(uuid = %record.uuid, exit_code = code, "duplicate exit record, dropping");
                    return Ok(());
                }
                self.exit_seen = true;
                info!(exit_code = code, "exit record received");
                // exit always reaches the sender, transmitted or not, to start finalization
                (record, true)
            }
            RecordKind::Run(meta) => {
                let meta = meta.clone();
                self.with_counted_run(|run| run.reduce(RunDelta::Metadata(meta)));
                (record, true)
            }
            RecordKind::Config(config) => {
                let (accepted, rejected) = self.with_counted_run(|run| {
                    let mut accepted = Vec::with_capacity(config.update.len());
                    let mut rejected = Vec::new();
                    for item in &config.update {
                        let delta = RunDelta::ConfigSet {
                            key: item.key.clone(),
                            value: item.value.clone(),
                        };
                        if run.reduce(delta) {
                            accepted.push(item.clone());
                        } else {
                            rejected.push(item.key.clone());
                        }
                    }
                    (accepted, rejected)
                });
                if rejected.is_empty() {
                    (record, true)
                } else {
                    warn!(keys = ?rejected, "config keys already set, ignoring new values");
                    let derived = record.derive(RecordKind::Config(ConfigRecord { update: accepted }));
                    (derived, true)
                }
            }
            RecordKind::History(history) => {
                let derived = self.with_counted_run(|run| {
                    let step = history.step.unwrap_or_else(|| run.next_step());
                    run.reduce(RunDelta::Step(step));
                    for item in &history.item {
                        run.reduce(RunDelta::SummarySet {
                            key: item.key.clone(),
                            value: item.value.clone(),
                        });
                    }
                    HistoryRecord {
                        step: Some(step),
                        item: history.item.clone(),
                    }
                });
                let derived = if history.step.is_some() {
                    record
                } else {
                    record.derive(RecordKind::History(derived))
                };
                (derived, true)
            }
            RecordKind::Summary(summary) => {
                self.with_counted_run(|run| {
                    for item in &summary.update {
                        run.reduce(RunDelta::SummarySet {
                            key: item.key.clone(),
                            value: item.value.clone(),
                        });
                    }
                });
                (record, true)
            }
            RecordKind::Stats(_) => {
                self.with_counted_run(|_| ());
                let sampled = self.stats_seen % self.settings.stats_sample_every as u64 == 0;
                self.stats_seen += 1;
                let transmit = sampled || record.control.always_send;
                (record, transmit)
            }
            RecordKind::Telemetry(telemetry) => {
                let features = telemetry.features.clone();
                self.with_counted_run(|run| run.reduce(RunDelta::Telemetry(features)));
                // until the merged list has gone out, it carries these features
                (record, self.telemetry_flushed)
            }
            RecordKind::Output(_) | RecordKind::Other { .. } => {
                self.with_counted_run(|_| ());
                (record, true)
            }
        };

        self.forward(record, transmit && !local).await
    }

    async fn handle_request(&mut self, request: Request, record: Record) -> Result<(), ForwardLost> {
        let response = match request {
            Request::Defer(state) => return self.handle_defer(state, record).await,
            Request::GetRun => Response::Run(self.run.read().snapshot()),
            Request::GetSummary => Response::Summary {
                summary: self.run.read().summary().clone(),
            },
            Request::Status => Response::Status {
                exit_seen: self.exit_seen,
                records_seen: self.run.read().records_seen(),
            },
        };
        self.respond(ResultRecord::reply_to(&record, response)).await;
        Ok(())
    }

    /// Handler side of one finalization step, then passes the step on.
    async fn handle_defer(&mut self, state: DeferState, record: Record) -> Result<(), ForwardLost> {
        debug!(?state, "defer");
        match state {
            DeferState::Begin => self.defer_started = true,
            DeferState::FlushSummary => {
                let summary: Vec<Item> = self
                    .run
                    .read()
                    .summary()
                    .iter()
                    .map(|(k, v)| Item::new(k.clone(), v.clone()))
                    .collect();
                if !summary.is_empty() {
                    let rollup = Record::new(RecordKind::Summary(SummaryRecord { update: summary }));
                    self.forward(rollup, true).await?;
                }
            }
            DeferState::FlushTelemetry => {
                let features = self.run.read().telemetry().to_vec();
                if !features.is_empty() {
                    let merged = Record::new(RecordKind::Telemetry(TelemetryRecord { features }));
                    self.forward(merged, true).await?;
                }
                self.telemetry_flushed = true;
            }
            DeferState::FlushSender | DeferState::End => {}
        }
        self.forward(record, false).await
    }

    fn with_run<T>(&self, f: impl FnOnce(&mut Run) -> T) -> T {
        let mut run = self.run.write();
        f(&mut run)
    }

    /// Applies `f` and counts the record under the same write lock.
    fn with_counted_run<T>(&self, f: impl FnOnce(&mut Run) -> T) -> T {
        let mut run = self.run.write();
        let out = f(&mut run);
        run.reduce(RunDelta::Counted);
        out
    }

    async fn forward(&mut self, record: Record, transmit: bool) -> Result<(), ForwardLost> {
        let Some(fwd) = &self.fwd else {
            return Err(ForwardLost);
        };
        if fwd.send(Envelope { record, transmit }).await.is_err() {
            if !self.coordinator.is_failed() {
                self.coordinator
                    .fail(Stage::Handler, Error::Fatal("writer queue closed unexpectedly".into()));
            }
            self.coordinator.signal(Stage::Handler, StageSignal::Fail);
            return Err(ForwardLost);
        }
        Ok(())
    }

    async fn respond(&self, result: ResultRecord) {
        let Some(out) = &self.out else { return };
        if out.send(result).await.is_err() {
            warn!("dispatcher gone, dropping result");
        }
    }
}
