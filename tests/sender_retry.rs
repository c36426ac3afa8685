mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use nexus_stream::record::RecordKind;
use nexus_stream::{Error, Stream};
use tempfile::TempDir;

use common::{output, settings, FailingTransport, FlakyTransport};

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let dir = TempDir::new().unwrap();
    let transport = FlakyTransport::new(3);
    let stream = Stream::new(settings(&dir), transport.clone()).unwrap();

    let record = output("eventually");
    let uuid = record.uuid.clone();
    stream.submit(record).await.unwrap();
    stream.finish_and_close(0).await.unwrap();

    assert!(transport.calls.load(Ordering::SeqCst) > 3);
    let sent = transport.inner.sent();
    assert_eq!(sent[0].uuid, uuid);
    assert!(sent.iter().any(|r| matches!(r.kind, RecordKind::Exit(_))));
}

#[tokio::test]
async fn test_retry_exhaustion_is_fatal_and_close_is_bounded() {
    let dir = TempDir::new().unwrap();
    let mut settings = settings(&dir);
    settings.retry.max_attempts = 2;
    let transport = FailingTransport::transient();
    let stream = Stream::new(settings, transport.clone()).unwrap();

    stream.submit(output("doomed")).await.unwrap();
    let result = tokio::time::timeout(Duration::from_secs(5), stream.finish_and_close(0))
        .await
        .expect("close hung after fatal transport failure");

    let err = result.unwrap_err();
    assert!(matches!(err, Error::Transport(_)), "got {:?}", err);
    // one attempt plus two retries
    assert_eq!(transport.calls.load(Ordering::SeqCst), 3);
    assert_eq!(stream.active_stages(), 0);
    assert!(matches!(stream.submit(output("later")).await, Err(Error::Transport(_))));
}

#[tokio::test]
async fn test_permanent_rejection_drops_record_and_continues() {
    let dir = TempDir::new().unwrap();
    let transport = FailingTransport::permanent();
    let stream = Stream::new(settings(&dir), transport.clone()).unwrap();

    stream.submit(output("rejected")).await.unwrap();
    let run = stream.finish_and_close(0).await.unwrap();

    assert_eq!(run.exit_code, Some(0));
    // output and exit, each tried once
    assert_eq!(transport.calls.load(Ordering::SeqCst), 2);
}
