//! The remote collection service, seen from the sender: an opaque sink that
//! accepts records and may answer with a payload.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::TransportError;
use crate::record::Record;

pub mod http;

pub use http::HttpTransport;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends one record. `Ok(Some(_))` carries the service's response payload.
    async fn send(&self, record: &Record) -> Result<Option<Value>, TransportError>;
}

/// Used in offline mode: accepts everything, transmits nothing.
#[derive(Debug, Default, Clone)]
pub struct OfflineTransport;

#[async_trait]
impl Transport for OfflineTransport {
    async fn send(&self, _record: &Record) -> Result<Option<Value>, TransportError> {
        Ok(None)
    }
}
