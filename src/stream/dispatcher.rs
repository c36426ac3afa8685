use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::responder::ResponderRegistry;
use super::shutdown::{Coordinator, Stage, StageGuard, StageSignal};
use crate::record::ResultRecord;
use crate::settings::UnmatchedPolicy;

/// Merges the result queues of the handler and the sender and hands each
/// result to the responders registered for it.
pub(crate) struct Dispatcher {
    coordinator: Arc<Coordinator>,
    registry: Arc<ResponderRegistry>,
    policy: UnmatchedPolicy,
    delivered: u64,
    dropped: u64,
}

impl Dispatcher {
    pub(crate) fn new(
        coordinator: Arc<Coordinator>,
        registry: Arc<ResponderRegistry>,
        policy: UnmatchedPolicy,
    ) -> Self {
        Self {
            coordinator,
            registry,
            policy,
            delivered: 0,
            dropped: 0,
        }
    }

    pub(crate) async fn run(
        mut self,
        mut from_handler: mpsc::Receiver<ResultRecord>,
        mut from_sender: mpsc::Receiver<ResultRecord>,
    ) {
        let _guard = StageGuard::new(Arc::clone(&self.coordinator), Stage::Dispatcher);
        let mut handler_open = true;
        let mut sender_open = true;

        while handler_open || sender_open {
            let result = tokio::select! {
                result = from_handler.recv(), if handler_open => match result {
                    Some(result) => result,
                    None => {
                        debug!("handler result queue closed");
                        handler_open = false;
                        continue;
                    }
                },
                result = from_sender.recv(), if sender_open => match result {
                    Some(result) => result,
                    None => {
                        debug!("sender result queue closed");
                        sender_open = false;
                        continue;
                    }
                },
            };
            self.dispatch(result);
        }

        self.coordinator.signal(Stage::Dispatcher, StageSignal::BeginDrain);
        info!(delivered = self.delivered, dropped = self.dropped, "dispatcher finished");
        self.coordinator.signal(Stage::Dispatcher, StageSignal::Finish);
    }

    fn dispatch(&mut self, result: ResultRecord) {
        let targets = self.registry.targets(result.connection_id(), self.policy);
        if targets.is_empty() {
            self.dropped += 1;
            warn!(
                uuid = %result.uuid,
                connection = ?result.connection_id(),
                "no responder registered for result, dropping"
            );
            return;
        }

        for responder in targets {
            match responder.deliver(result.clone()) {
                Ok(()) => self.delivered += 1,
                Err(e) => {
                    self.dropped += 1;
                    warn!(uuid = %result.uuid, error = %e, "failed to deliver result");
                }
            }
        }
    }
}
