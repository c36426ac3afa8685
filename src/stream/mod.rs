//! A stream is the per-run record pipeline.
//!
//! ```text
//!  submit --[entry]--> (handler) --[fwd]--> (writer) --[fwd]--> (sender) --> remote
//!                        ^   |                                   |   |
//!                        |   +--[out]--> (dispatcher) <--[out]---+   |
//!                        |                    |                      |
//!                        +------------[loopback]---------------------+
//!                                             v
//!                                        responders
//! ```
//!
//! Every arrow is a bounded queue, so a slow remote eventually makes `submit`
//! wait. Shutdown is described in [`shutdown`].

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, Instrument, Span};

use crate::error::{Error, Result};
use crate::record::{Control, Record};
use crate::run::{Run, RunSnapshot};
use crate::services::transport::{HttpTransport, OfflineTransport, Transport};
use crate::settings::Settings;
use crate::store::TransactionLog;

mod dispatcher;
pub mod footer;
mod handler;
pub mod responder;
mod sender;
pub mod shutdown;
mod writer;

use dispatcher::Dispatcher;
use handler::Handler;
pub use responder::{CallbackResponder, ChannelResponder, Responder, ResponderEntry, ResponderRegistry};
use sender::Sender;
pub use shutdown::{Coordinator, Stage, StageState};
use writer::Writer;

/// A record on its way from the handler to the sender, with the handler's
/// decision on whether it should be transmitted.
#[derive(Debug)]
pub(crate) struct Envelope {
    pub(crate) record: Record,
    pub(crate) transmit: bool,
}

pub struct Stream {
    settings: Arc<Settings>,
    coordinator: Arc<Coordinator>,
    run: Arc<RwLock<Run>>,
    registry: Arc<ResponderRegistry>,
    entry: Mutex<Option<mpsc::Sender<Record>>>,
    tasks: tokio::sync::Mutex<Vec<(Stage, JoinHandle<()>)>>,
    log_path: PathBuf,
    span: Span,
}

impl Stream {
    /// Starts a stream talking to `settings.base_url`, or to nobody when offline.
    pub fn start(settings: Settings) -> Result<Self> {
        let transport: Arc<dyn Transport> = if settings.offline {
            Arc::new(OfflineTransport)
        } else {
            Arc::new(HttpTransport::new(&settings)?)
        };
        Self::new(settings, transport)
    }

    /// Opens the transaction log at `settings.log_path()` and starts the stream.
    pub fn new(settings: Settings, transport: Arc<dyn Transport>) -> Result<Self> {
        settings.validate()?;
        let log = TransactionLog::create(settings.log_path())?;
        Self::with_log(settings, transport, log)
    }

    /// Builds the four stages around `log`, wires their queues and spawns them.
    /// Must be called from within a tokio runtime.
    pub fn with_log(settings: Settings, transport: Arc<dyn Transport>, log: TransactionLog) -> Result<Self> {
        settings.validate()?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::Config(format!("a stream needs a tokio runtime: {}", e)))?;

        let settings = Arc::new(settings);
        let span = info_span!("stream", id = %settings.run_id);
        let coordinator = Coordinator::new(settings.run_id.clone());
        let run = Arc::new(RwLock::new(Run::new(
            settings.run_id.clone(),
            settings.project.clone(),
        )));
        let registry = Arc::new(ResponderRegistry::new());
        let log_path = log.path().to_path_buf();

        let size = settings.buffer_size;
        let (entry_tx, entry_rx) = mpsc::channel(size);
        let (handler_fwd_tx, handler_fwd_rx) = mpsc::channel(size);
        let (writer_fwd_tx, writer_fwd_rx) = mpsc::channel(size);
        let (loopback_tx, loopback_rx) = mpsc::channel(size);
        let (handler_out_tx, handler_out_rx) = mpsc::channel(size);
        let (sender_out_tx, sender_out_rx) = mpsc::channel(size);

        let handler = Handler::new(
            Arc::clone(&settings),
            Arc::clone(&run),
            Arc::clone(&coordinator),
            handler_fwd_tx,
            handler_out_tx,
        );
        let writer = Writer::new(Arc::clone(&coordinator), log, writer_fwd_tx);
        let sender = Sender::new(
            Arc::clone(&settings),
            Arc::clone(&coordinator),
            transport,
            loopback_tx,
            sender_out_tx,
        );
        let dispatcher = Dispatcher::new(
            Arc::clone(&coordinator),
            Arc::clone(&registry),
            settings.unmatched_responses,
        );

        let mut tasks = Vec::with_capacity(4);
        tasks.push((
            Stage::Handler,
            runtime.spawn(handler.run(entry_rx, loopback_rx).instrument(span.clone())),
        ));
        let writer_span = span.clone();
        tasks.push((
            Stage::Writer,
            runtime.spawn_blocking(move || {
                let _enter = writer_span.enter();
                writer.run(handler_fwd_rx)
            }),
        ));
        tasks.push((
            Stage::Sender,
            runtime.spawn(sender.run(writer_fwd_rx).instrument(span.clone())),
        ));
        tasks.push((
            Stage::Dispatcher,
            runtime.spawn(
                dispatcher
                    .run(handler_out_rx, sender_out_rx)
                    .instrument(span.clone()),
            ),
        ));

        info!(parent: &span, log = %log_path.display(), offline = settings.offline, "created new stream");

        Ok(Self {
            settings,
            coordinator,
            run,
            registry,
            entry: Mutex::new(Some(entry_tx)),
            tasks: tokio::sync::Mutex::new(tasks),
            log_path,
            span,
        })
    }

    pub fn id(&self) -> &str {
        &self.settings.run_id
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn log_path(&self) -> &std::path::Path {
        &self.log_path
    }

    pub fn add_responders(&self, entries: impl IntoIterator<Item = ResponderEntry>) {
        self.registry.add(entries);
    }

    /// Queues `record` for processing, waiting while the entry queue is full.
    pub async fn submit(&self, record: Record) -> Result<()> {
        if let Some(err) = self.coordinator.fatal_error() {
            return Err(err);
        }
        let entry = self.entry.lock().clone().ok_or(Error::Closed)?;
        debug!(parent: &self.span, uuid = %record.uuid, kind = record.name(), "handling record");
        entry
            .send(record)
            .await
            .map_err(|_| self.coordinator.fatal_error().unwrap_or(Error::Closed))
    }

    pub fn get_run(&self) -> RunSnapshot {
        self.run.read().snapshot()
    }

    pub fn active_stages(&self) -> usize {
        self.coordinator.active_stages()
    }

    pub fn stage_state(&self, stage: Stage) -> StageState {
        self.coordinator.state(stage)
    }

    pub fn protocol_violations(&self) -> u32 {
        self.coordinator.protocol_violations()
    }

    /// Stops accepting records and waits for all four stages to exit.
    ///
    /// Calling it again, or concurrently, waits for the same shutdown. Returns the
    /// error that failed the stream, if one did.
    pub async fn close(&self) -> Result<()> {
        self.entry.lock().take();

        let mut tasks = self.tasks.lock().await;
        for (stage, handle) in tasks.drain(..) {
            if let Err(e) = handle.await {
                error!(parent: &self.span, %stage, error = %e, "stage task did not complete");
                if self.coordinator.state(stage) != StageState::Closed {
                    self.coordinator.fail(
                        stage,
                        Error::StagePanicked {
                            stage: stage.to_string(),
                            reason: e.to_string(),
                        },
                    );
                    self.coordinator.signal(stage, shutdown::StageSignal::Fail);
                }
            }
        }
        drop(tasks);

        match self.coordinator.fatal_error() {
            Some(err) => Err(err),
            None => {
                debug!(parent: &self.span, "all stages closed");
                Ok(())
            }
        }
    }

    /// Submits an exit record, closes the stream and prints the footer.
    pub async fn finish_and_close(&self, exit_code: i32) -> Result<RunSnapshot> {
        let exit = Record::exit(exit_code).with_control(Control {
            always_send: true,
            ..Control::default()
        });
        let submitted = self.submit(exit).await;
        let closed = self.close().await;

        let run = self.get_run();
        self.print_footer(&run);
        info!(parent: &self.span, "closed stream");

        submitted?;
        closed?;
        Ok(run)
    }

    fn print_footer(&self, run: &RunSnapshot) {
        let footer = footer::render(run, &self.settings);
        info!(parent: &self.span, "{}", footer.trim_end());
        if self.settings.show_footer {
            println!("{}", footer);
        }
    }
}
