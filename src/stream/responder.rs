use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::error::DeliveryError;
use crate::record::ResultRecord;
use crate::settings::UnmatchedPolicy;

/// A delivery target for results. `deliver` must not block: the dispatcher
/// calls it from its merge loop.
pub trait Responder: Send + Sync {
    fn deliver(&self, result: ResultRecord) -> Result<(), DeliveryError>;
}

/// Runs a closure synchronously on the dispatcher task.
pub struct CallbackResponder<F> {
    callback: F,
}

impl<F> CallbackResponder<F>
where
    F: Fn(ResultRecord) + Send + Sync,
{
    pub fn new(callback: F) -> Self {
        Self { callback }
    }
}

impl<F> Responder for CallbackResponder<F>
where
    F: Fn(ResultRecord) + Send + Sync,
{
    fn deliver(&self, result: ResultRecord) -> Result<(), DeliveryError> {
        (self.callback)(result);
        Ok(())
    }
}

/// Queues results for an async consumer. A full queue is reported, never waited on.
pub struct ChannelResponder {
    tx: mpsc::Sender<ResultRecord>,
}

impl ChannelResponder {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<ResultRecord>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

impl Responder for ChannelResponder {
    fn deliver(&self, result: ResultRecord) -> Result<(), DeliveryError> {
        self.tx.try_send(result).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryError::Full,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Disconnected,
        })
    }
}

#[derive(Clone)]
pub struct ResponderEntry {
    pub id: String,
    pub responder: Arc<dyn Responder>,
}

impl ResponderEntry {
    pub fn new(id: impl Into<String>, responder: Arc<dyn Responder>) -> Self {
        Self {
            id: id.into(),
            responder,
        }
    }

    pub fn callback<F>(id: impl Into<String>, callback: F) -> Self
    where
        F: Fn(ResultRecord) + Send + Sync + 'static,
    {
        Self::new(id, Arc::new(CallbackResponder::new(callback)))
    }

    pub fn channel(id: impl Into<String>, capacity: usize) -> (Self, mpsc::Receiver<ResultRecord>) {
        let (responder, rx) = ChannelResponder::new(capacity);
        (Self::new(id, Arc::new(responder)), rx)
    }
}

/// Registered responders, shared by the stream (registration) and the dispatcher (lookup).
#[derive(Default)]
pub struct ResponderRegistry {
    entries: RwLock<Vec<ResponderEntry>>,
}

impl ResponderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, entries: impl IntoIterator<Item = ResponderEntry>) {
        self.entries.write().extend(entries);
    }

    /// Removes every entry registered under `id`, returning how many there were.
    pub fn remove(&self, id: &str) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|e| e.id != id);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Responders a result addressed to `id` goes to.
    pub fn targets(&self, id: Option<&str>, policy: UnmatchedPolicy) -> Vec<Arc<dyn Responder>> {
        let entries = self.entries.read();
        let matched: Vec<_> = entries
            .iter()
            .filter(|e| Some(e.id.as_str()) == id)
            .map(|e| Arc::clone(&e.responder))
            .collect();
        if !matched.is_empty() {
            return matched;
        }
        match policy {
            UnmatchedPolicy::Broadcast => entries.iter().map(|e| Arc::clone(&e.responder)).collect(),
            UnmatchedPolicy::Discard => Vec::new(),
        }
    }
}
