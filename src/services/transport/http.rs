use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use serde_json::Value;

use super::Transport;
use crate::error::TransportError;
use crate::record::Record;
use crate::settings::Settings;

#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
    records_url: String,
    api_key: Option<String>,
}

#[derive(Serialize)]
struct RecordRequest<'a> {
    record: &'a Record,
}

impl HttpTransport {
    pub fn new(settings: &Settings) -> Result<Self, TransportError> {
        let client = Client::builder()
            .timeout(settings.http_timeout())
            .build()
            .map_err(|e| TransportError::Permanent(format!("building http client: {}", e)))?;

        Ok(Self {
            client,
            records_url: format!(
                "{}/api/v1/runs/{}/records",
                settings.base_url.trim_end_matches('/'),
                settings.run_id
            ),
            api_key: settings.api_key.clone(),
        })
    }

    pub fn records_url(&self) -> &str {
        &self.records_url
    }
}

/// Rate limits and server errors are worth another attempt, anything else the
/// service refused is final.
fn classify(status: StatusCode) -> Option<TransportError> {
    if status.is_success() {
        None
    } else if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        Some(TransportError::Transient(format!("server answered {}", status)))
    } else {
        Some(TransportError::Permanent(format!("server answered {}", status)))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, record: &Record) -> Result<Option<Value>, TransportError> {
        let mut request = self
            .client
            .post(&self.records_url)
            .json(&RecordRequest { record });
        if let Some(key) = &self.api_key {
            request = request.basic_auth("api", Some(key));
        }

        // connect errors and timeouts are transient
        let response = request
            .send()
            .await
            .map_err(|e| TransportError::Transient(e.to_string()))?;

        if let Some(err) = classify(response.status()) {
            return Err(err);
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| TransportError::Transient(e.to_string()))?;
        if body.is_empty() {
            return Ok(None);
        }
        // a body that is not JSON is still an accepted record
        Ok(serde_json::from_slice(&body).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_statuses() {
        assert!(classify(StatusCode::OK).is_none());
        assert!(classify(StatusCode::TOO_MANY_REQUESTS).unwrap().is_retryable());
        assert!(classify(StatusCode::BAD_GATEWAY).unwrap().is_retryable());
        assert!(!classify(StatusCode::BAD_REQUEST).unwrap().is_retryable());
        assert!(!classify(StatusCode::UNAUTHORIZED).unwrap().is_retryable());
    }

    #[test]
    fn test_records_url() {
        let settings = Settings {
            run_id: "abc".into(),
            base_url: "http://collector:9000/".into(),
            ..Settings::default()
        };
        let transport = HttpTransport::new(&settings).unwrap();
        assert_eq!(transport.records_url(), "http://collector:9000/api/v1/runs/abc/records");
    }
}
