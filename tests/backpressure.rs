mod common;

use std::time::Duration;

use nexus_stream::Stream;
use tempfile::TempDir;

use common::{output, settings, GatedTransport};

#[tokio::test]
async fn test_slow_remote_blocks_submit_instead_of_buffering() {
    let dir = TempDir::new().unwrap();
    let mut settings = settings(&dir);
    settings.buffer_size = 2;
    let transport = GatedTransport::closed();
    let stream = Stream::new(settings, transport.clone()).unwrap();

    let mut accepted = 0usize;
    for i in 0..100 {
        match tokio::time::timeout(Duration::from_millis(200), stream.submit(output(&format!("{}", i)))).await {
            Ok(result) => {
                result.unwrap();
                accepted += 1;
            }
            Err(_) => break,
        }
    }
    // three queues of two plus one record held by each of the three stages
    assert!(accepted < 100, "submit never blocked");
    assert!(accepted <= 9, "accepted {} records with a stalled remote", accepted);

    transport.open();
    tokio::time::timeout(Duration::from_secs(5), stream.submit(output("after release")))
        .await
        .expect("submit still blocked after the remote recovered")
        .unwrap();

    let run = tokio::time::timeout(Duration::from_secs(5), stream.finish_and_close(0))
        .await
        .expect("close hung")
        .unwrap();
    assert_eq!(run.records_seen as usize, accepted + 2);
    assert_eq!(transport.inner.sent().len(), accepted + 2);
}
