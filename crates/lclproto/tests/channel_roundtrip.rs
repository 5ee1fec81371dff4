//! Push/pull channels over loopback TCP.

use bytes::Bytes;
use futures::StreamExt;
use lclproto::{ChannelConfig, ChannelError, PullChannel, PushChannel, Role};
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

static PORT: AtomicU16 = AtomicU16::new(17810);

fn next_endpoint() -> String {
    let port = PORT.fetch_add(1, Ordering::SeqCst);
    format!("tcp://127.0.0.1:{}", port)
}

fn test_config() -> ChannelConfig {
    ChannelConfig::default()
        .with_recv_timeout(Duration::from_millis(500))
        .with_dial_timeout(Duration::from_secs(2))
        .with_linger(Duration::from_secs(2))
}

fn numbered(i: u32) -> Bytes {
    Bytes::from(format!("message-{:04}", i))
}

async fn collect_all(pull: PullChannel) -> Vec<Bytes> {
    let stream = pull.messages();
    futures::pin_mut!(stream);
    let mut out = Vec::new();
    while let Some(msg) = stream.next().await {
        out.push(msg.expect("receive failed"));
    }
    out
}

#[tokio::test]
async fn test_dialing_push_to_listening_pull() {
    let endpoint = next_endpoint();
    let config = test_config();

    let pull = PullChannel::open(&endpoint, Role::Listen, &config).await.unwrap();
    let receiver = tokio::spawn(collect_all(pull));

    let mut push = PushChannel::open(&endpoint, Role::Dial(1), &config).await.unwrap();
    for i in 0..5 {
        push.send(numbered(i)).await.unwrap();
    }
    push.close().await.unwrap();

    let received = tokio::time::timeout(Duration::from_secs(10), receiver)
        .await
        .expect("pull never finished")
        .unwrap();
    let expected: Vec<Bytes> = (0..5).map(numbered).collect();
    assert_eq!(received, expected);
}

#[tokio::test]
async fn test_listening_push_to_dialing_pull() {
    let endpoint = next_endpoint();
    let config = test_config();

    let push_endpoint = endpoint.clone();
    let push_config = config.clone();
    let sender = tokio::spawn(async move {
        let mut push = PushChannel::open(&push_endpoint, Role::Listen, &push_config)
            .await
            .unwrap();
        for i in 0..3 {
            push.send(numbered(i)).await.unwrap();
        }
        push.close().await.unwrap();
    });

    // Give the push side time to bind before dialing it
    tokio::time::sleep(Duration::from_millis(100)).await;
    let pull = PullChannel::open(&endpoint, Role::Dial(1), &config).await.unwrap();
    let received = tokio::time::timeout(Duration::from_secs(10), collect_all(pull))
        .await
        .expect("pull never finished");

    sender.await.unwrap();
    assert_eq!(received, vec![numbered(0), numbered(1), numbered(2)]);
}

#[tokio::test]
async fn test_dial_without_listener_is_refused() {
    let endpoint = next_endpoint();
    let result = PushChannel::open(&endpoint, Role::Dial(1), &test_config()).await;
    match result {
        Err(ChannelError::ConnectionRefused { address, .. }) => assert_eq!(address, endpoint),
        Err(other) => panic!("expected ConnectionRefused, got {}", other),
        Ok(_) => panic!("dial to a closed port succeeded"),
    }
}

#[tokio::test]
async fn test_recv_times_out_before_any_peer() {
    let endpoint = next_endpoint();
    let config = test_config().with_recv_timeout(Duration::from_millis(100));
    let mut pull = PullChannel::open(&endpoint, Role::Listen, &config).await.unwrap();

    let err = pull.recv().await.unwrap_err();
    assert!(err.is_timeout());
    // Still usable after a timeout
    assert!(pull.recv().await.unwrap_err().is_timeout());
    assert_eq!(pull.peers().connected(), 0);
}

#[tokio::test]
async fn test_multiple_dials_all_count_as_peers() {
    let endpoint = next_endpoint();
    let config = test_config();

    let pull = PullChannel::open(&endpoint, Role::Listen, &config).await.unwrap();
    let receiver = tokio::spawn(collect_all(pull));

    let mut push = PushChannel::open(&endpoint, Role::Dial(2), &config).await.unwrap();
    assert_eq!(push.peers().connected(), 2);
    for i in 0..10 {
        push.send(numbered(i)).await.unwrap();
    }
    push.close().await.unwrap();

    let mut received = tokio::time::timeout(Duration::from_secs(10), receiver)
        .await
        .expect("pull never finished")
        .unwrap();
    // Round-robin across two connections may reorder between them
    received.sort();
    let expected: Vec<Bytes> = (0..10).map(numbered).collect();
    assert_eq!(received, expected);
}

#[tokio::test]
async fn test_full_buffer_blocks_send() {
    let endpoint = next_endpoint();
    let config = test_config().with_send_buffer(1);
    let pull_config = ChannelConfig {
        recv_buffer: 1,
        ..config.clone()
    };

    // Connected but never read from
    let pull = PullChannel::open(&endpoint, Role::Listen, &pull_config).await.unwrap();
    let mut push = PushChannel::open(&endpoint, Role::Dial(1), &config).await.unwrap();

    let big = Bytes::from(vec![0u8; 1 << 20]);
    let mut sent = 0usize;
    let blocked = tokio::time::timeout(Duration::from_secs(2), async {
        for _ in 0..256 {
            push.send(big.clone()).await.unwrap();
            sent += 1;
        }
    })
    .await
    .is_err();

    assert!(blocked, "all {} sends completed with nobody reading", sent);
    assert!(sent < 256);
    drop(pull);
}

#[tokio::test]
async fn test_inproc_push_to_listening_pull() {
    let endpoint = "inproc://frames-roundtrip";
    let config = test_config();

    let mut pull = PullChannel::open(endpoint, Role::Listen, &config).await.unwrap();
    let mut push = PushChannel::open(endpoint, Role::Dial(1), &config).await.unwrap();
    assert_eq!(push.peers().connected(), 1);

    for i in 0..5 {
        push.send(numbered(i)).await.unwrap();
    }
    push.close().await.unwrap();

    // inproc peers are invisible to the monitor, so read a known count
    let mut received = Vec::new();
    while received.len() < 5 {
        match pull.recv().await {
            Ok(Some(message)) => received.push(message),
            Ok(None) => break,
            Err(e) => panic!("receive failed: {}", e),
        }
    }
    let expected: Vec<Bytes> = (0..5).map(numbered).collect();
    assert_eq!(received, expected);
}
