//! Records flowing through a stream, and the results routed back to callers.
//!
//! A [`Record`] has exactly one [`RecordKind`] and is never changed once it has
//! been handed to the next stage. Stages that need a different record (a
//! history point with its step filled in, a config with rejected keys removed)
//! build a new one with [`Record::derive`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::run::RunSnapshot;

/// Per-record routing flags.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Control {
    /// Skip sampling and filtering.
    pub always_send: bool,
    /// Process and persist, never transmit.
    pub local: bool,
    /// The caller wants a result back.
    pub req_resp: bool,
    /// Responder key results are routed to.
    pub connection_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    #[serde(default = "new_uuid")]
    pub uuid: String,
    #[serde(default)]
    pub control: Control,
    #[serde(flatten)]
    pub kind: RecordKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub key: String,
    pub value: Value,
}

impl Item {
    pub fn new(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RecordKind {
    Run(RunRecord),
    Config(ConfigRecord),
    History(HistoryRecord),
    Summary(SummaryRecord),
    Stats(StatsRecord),
    Output(OutputRecord),
    Telemetry(TelemetryRecord),
    Exit(ExitRecord),
    Request(Request),
    /// Anything the pipeline does not interpret. Persisted and transmitted as is.
    Other { name: String, payload: Value },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunRecord {
    pub run_id: String,
    pub project: Option<String>,
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigRecord {
    pub update: Vec<Item>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryRecord {
    pub step: Option<i64>,
    pub item: Vec<Item>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SummaryRecord {
    pub update: Vec<Item>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsRecord {
    pub timestamp_ms: u64,
    pub item: Vec<Item>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputRecord {
    pub stream: OutputStream,
    pub line: String,
}

/// Ordered feature identifiers recording which integration produced the run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryRecord {
    pub features: Vec<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitRecord {
    pub exit_code: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "request", content = "state", rename_all = "snake_case")]
pub enum Request {
    GetRun,
    GetSummary,
    Status,
    /// Shutdown step travelling Sender -> Handler -> Writer -> Sender.
    Defer(DeferState),
}

/// The steps of the finalization cascade started by an exit record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeferState {
    Begin,
    FlushSummary,
    FlushTelemetry,
    FlushSender,
    End,
}

impl DeferState {
    pub fn next(self) -> Option<DeferState> {
        match self {
            DeferState::Begin => Some(DeferState::FlushSummary),
            DeferState::FlushSummary => Some(DeferState::FlushTelemetry),
            DeferState::FlushTelemetry => Some(DeferState::FlushSender),
            DeferState::FlushSender => Some(DeferState::End),
            DeferState::End => None,
        }
    }
}

fn new_uuid() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

impl Record {
    pub fn new(kind: RecordKind) -> Self {
        Self {
            uuid: new_uuid(),
            control: Control::default(),
            kind,
        }
    }

    pub fn with_control(mut self, control: Control) -> Self {
        self.control = control;
        self
    }

    /// A new record of a different kind that keeps this record's identity and routing.
    pub fn derive(&self, kind: RecordKind) -> Self {
        Self {
            uuid: self.uuid.clone(),
            control: self.control.clone(),
            kind,
        }
    }

    pub fn config(items: Vec<Item>) -> Self {
        Self::new(RecordKind::Config(ConfigRecord { update: items }))
    }

    pub fn history(items: Vec<Item>) -> Self {
        Self::new(RecordKind::History(HistoryRecord { step: None, item: items }))
    }

    pub fn summary(items: Vec<Item>) -> Self {
        Self::new(RecordKind::Summary(SummaryRecord { update: items }))
    }

    pub fn telemetry(features: Vec<u32>) -> Self {
        Self::new(RecordKind::Telemetry(TelemetryRecord { features }))
    }

    pub fn exit(exit_code: i32) -> Self {
        Self::new(RecordKind::Exit(ExitRecord { exit_code }))
    }

    pub fn request(request: Request) -> Self {
        Self::new(RecordKind::Request(request))
    }

    pub fn defer(state: DeferState) -> Self {
        Self::request(Request::Defer(state)).with_control(Control {
            local: true,
            ..Control::default()
        })
    }

    pub fn name(&self) -> &'static str {
        match &self.kind {
            RecordKind::Run(_) => "run",
            RecordKind::Config(_) => "config",
            RecordKind::History(_) => "history",
            RecordKind::Summary(_) => "summary",
            RecordKind::Stats(_) => "stats",
            RecordKind::Output(_) => "output",
            RecordKind::Telemetry(_) => "telemetry",
            RecordKind::Exit(_) => "exit",
            RecordKind::Request(_) => "request",
            RecordKind::Other { .. } => "other",
        }
    }

    /// Requests are control traffic; everything else goes into the transaction log.
    pub fn is_persistable(&self) -> bool {
        !matches!(self.kind, RecordKind::Request(_))
    }

    pub fn defer_state(&self) -> Option<DeferState> {
        match self.kind {
            RecordKind::Request(Request::Defer(state)) => Some(state),
            _ => None,
        }
    }

    /// Describes why the record cannot be processed, if it cannot.
    pub fn validate(&self) -> Result<(), String> {
        let items: &[Item] = match &self.kind {
            RecordKind::Config(c) => &c.update,
            RecordKind::History(h) => &h.item,
            RecordKind::Summary(s) => &s.update,
            RecordKind::Stats(s) => &s.item,
            RecordKind::Other { name, .. } if name.is_empty() => {
                return Err("opaque record without a name".to_string())
            }
            _ => &[],
        };
        match items.iter().position(|item| item.key.is_empty()) {
            Some(idx) => Err(format!("{} item {} has an empty key", self.name(), idx)),
            None => Ok(()),
        }
    }
}

/// A response routed back to whoever registered for `control.connection_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub uuid: String,
    pub control: Control,
    pub response: Response,
}

impl ResultRecord {
    pub fn reply_to(record: &Record, response: Response) -> Self {
        Self {
            uuid: record.uuid.clone(),
            control: record.control.clone(),
            response,
        }
    }

    pub fn connection_id(&self) -> Option<&str> {
        self.control.connection_id.as_deref()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Run(RunSnapshot),
    Summary { summary: BTreeMap<String, Value> },
    Status { exit_seen: bool, records_seen: u64 },
    Ack { transmitted: bool },
    RunUpdate { payload: Option<Value> },
    Exit { exit_code: i32 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_json_shape() {
        let record = Record::config(vec![Item::new("lr", 0.1)]);
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["type"], "config");
        assert_eq!(json["update"][0]["key"], "lr");

        let back: Record = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn test_defer_sequence_ends() {
        let mut state = DeferState::Begin;
        let mut steps = 0;
        while let Some(next) = state.next() {
            assert!(next > state);
            state = next;
            steps += 1;
        }
        assert_eq!(state, DeferState::End);
        assert_eq!(steps, 4);
    }

    #[test]
    fn test_validate_rejects_empty_keys() {
        assert!(Record::history(vec![Item::new("", 1)]).validate().is_err());
        assert!(Record::history(vec![Item::new("loss", 1)]).validate().is_ok());
        let opaque = Record::new(RecordKind::Other {
            name: String::new(),
            payload: Value::Null,
        });
        assert!(opaque.validate().is_err());
    }

    #[test]
    fn test_requests_are_not_persisted() {
        assert!(!Record::defer(DeferState::Begin).is_persistable());
        assert!(Record::defer(DeferState::Begin).control.local);
        assert!(Record::exit(0).is_persistable());
    }
}
