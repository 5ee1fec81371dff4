//! End-to-end transfers over loopback TCP with the synthetic source.

use futures::StreamExt;
use lclconf::{CodecKind, StreamConfig};
use lclproto::{decode, ChannelConfig, Frame, PullChannel, Role};
use lclstream::{
    AccessMode, DataRequest, FrameSource, PipelineRunner, RetrievalMode, SourceDescriptor,
    SyntheticSource, TransferManager, TransferState,
};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

static PORT: AtomicU16 = AtomicU16::new(18810);

const EVENTS: usize = 45;
const BATCH: usize = 10;

fn next_endpoint() -> String {
    let port = PORT.fetch_add(1, Ordering::SeqCst);
    format!("tcp://127.0.0.1:{}", port)
}

fn test_config() -> StreamConfig {
    let mut config = StreamConfig::default();
    config.source.events = EVENTS;
    config.source.shape = vec![32, 48];
    config.pipeline.batch_size = BATCH;
    config.transport.recv_timeout_ms = 500;
    config.transport.linger_ms = 2000;
    config.workers.max_workers = 2;
    config
}

fn request(run: u32, address: &str) -> DataRequest {
    DataRequest {
        experiment: "xpptut15".into(),
        run,
        access_mode: AccessMode::Indexed,
        detector_name: "jungfrau4M".into(),
        retrieval_mode: RetrievalMode::Calibrated,
        destination_address: address.into(),
    }
}

fn manager(config: StreamConfig) -> TransferManager {
    TransferManager::new(Arc::new(PipelineRunner::new(config)))
}

fn expected_frames(request: &DataRequest, config: &StreamConfig) -> Vec<Frame> {
    SyntheticSource::new(&SourceDescriptor::from_request(request), &config.source)
        .unwrap()
        .frames(request.retrieval_mode)
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap()
}

/// Listen at `address` and collect every message until the peers are done.
async fn listen(address: &str, config: &StreamConfig) -> tokio::task::JoinHandle<Vec<bytes::Bytes>> {
    let pull = PullChannel::open(address, Role::Listen, &ChannelConfig::from(&config.transport))
        .await
        .unwrap();
    tokio::spawn(async move {
        let stream = pull.messages();
        futures::pin_mut!(stream);
        let mut out = Vec::new();
        while let Some(message) = stream.next().await {
            out.push(message.expect("receive failed"));
        }
        out
    })
}

async fn finish(receiver: tokio::task::JoinHandle<Vec<bytes::Bytes>>) -> Vec<bytes::Bytes> {
    tokio::time::timeout(Duration::from_secs(20), receiver)
        .await
        .expect("receiver never finished")
        .unwrap()
}

fn decode_all(messages: &[bytes::Bytes]) -> Vec<Frame> {
    messages
        .iter()
        .flat_map(|m| decode(m).expect("undecodable message").frames)
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_transfer_to_listening_pull_completes() {
    let config = test_config();
    let address = next_endpoint();
    let receiver = listen(&address, &config).await;

    let manager = manager(config.clone());
    let req = request(580, &address);
    let id = manager.create(req.clone()).unwrap();

    let state = tokio::time::timeout(Duration::from_secs(20), manager.wait(id))
        .await
        .expect("transfer never finished");
    assert_eq!(state, Some(TransferState::Completed));

    let messages = finish(receiver).await;
    assert_eq!(messages.len(), EVENTS.div_ceil(BATCH));

    let frames = decode_all(&messages);
    assert_eq!(frames, expected_frames(&req, &config));

    let info = manager.info(id).unwrap();
    let stats = info.status.stats.unwrap();
    assert_eq!(stats.count as usize, messages.len());
    assert_eq!(
        stats.total_bytes as usize,
        messages.iter().map(|m| m.len()).sum::<usize>()
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_compressed_codec_sends_one_frame_per_message() {
    let mut config = test_config();
    config.pipeline.codec = CodecKind::Compressed;
    let address = next_endpoint();
    let receiver = listen(&address, &config).await;

    let manager = manager(config.clone());
    let req = request(7, &address);
    let id = manager.create(req.clone()).unwrap();
    assert_eq!(manager.wait(id).await, Some(TransferState::Completed));

    let messages = finish(receiver).await;
    assert_eq!(messages.len(), EVENTS);
    assert_eq!(decode_all(&messages), expected_frames(&req, &config));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_dial_without_listener_fails() {
    let manager = manager(test_config());
    let id = manager.create(request(1, &next_endpoint())).unwrap();

    let state = tokio::time::timeout(Duration::from_secs(20), manager.wait(id))
        .await
        .expect("transfer never finished");
    assert_eq!(state, Some(TransferState::Failed));
    assert_eq!(manager.get(id), Some(TransferState::Failed));

    let error = manager.info(id).unwrap().status.error.unwrap();
    assert!(error.contains("Connection refused"), "{}", error);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_mask_mode_fails_before_connecting() {
    let config = test_config();
    let address = next_endpoint();
    let mut pull = PullChannel::open(&address, Role::Listen, &ChannelConfig::from(&config.transport))
        .await
        .unwrap();

    let manager = manager(config);
    let mut req = request(2, &address);
    req.retrieval_mode = RetrievalMode::BadPixelMask;
    let id = manager.create(req).unwrap();

    assert_eq!(manager.wait(id).await, Some(TransferState::Failed));
    let error = manager.info(id).unwrap().status.error.unwrap();
    assert!(error.contains("not supported"), "{}", error);

    assert!(pull.recv().await.unwrap_err().is_timeout());
    assert_eq!(pull.peers().connected(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_delete_stops_sending() {
    let mut config = test_config();
    config.source.events = 400;
    config.source.shape = vec![256, 256];
    config.pipeline.batch_size = 1;
    config.transport.send_buffer = 1;
    config.transport.recv_buffer = 1;

    let address = next_endpoint();
    let mut pull = PullChannel::open(&address, Role::Listen, &ChannelConfig::from(&config.transport))
        .await
        .unwrap();

    let manager = manager(config);
    let id = manager.create(request(3, &address)).unwrap();
    assert!(manager.delete(id));
    assert_eq!(manager.get(id), None);
    assert!(!manager.delete(id));

    let mut received = 0usize;
    let _ = tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            match pull.recv().await {
                Ok(Some(_)) => received += 1,
                Ok(None) => break,
                Err(e) if e.is_timeout() => continue,
                Err(e) => panic!("receive failed: {}", e),
            }
        }
    })
    .await;
    assert!(received < 400, "all {} messages arrived after delete", received);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancel_midstream() {
    let mut config = test_config();
    config.source.events = 400;
    config.source.shape = vec![256, 256];
    config.pipeline.batch_size = 1;
    config.transport.send_buffer = 1;
    config.transport.recv_buffer = 1;

    let address = next_endpoint();
    // Connected but never read, so the pipeline stalls on backpressure
    let _pull = PullChannel::open(&address, Role::Listen, &ChannelConfig::from(&config.transport))
        .await
        .unwrap();

    let manager = manager(config);
    let id = manager.create(request(4, &address)).unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert_eq!(manager.cancel(id), Some(true));
    assert_eq!(manager.get(id), Some(TransferState::Canceled));
    let state = tokio::time::timeout(Duration::from_secs(10), manager.wait(id))
        .await
        .expect("canceled transfer never stopped");
    assert_eq!(state, Some(TransferState::Canceled));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_transfers_keep_their_order() {
    let config = test_config();
    let manager = manager(config.clone());

    let mut pending = Vec::new();
    for run in 0..4u32 {
        let address = next_endpoint();
        let receiver = listen(&address, &config).await;
        let req = request(100 + run, &address);
        let id = manager.create(req.clone()).unwrap();
        pending.push((id, req, receiver));
    }

    for (id, req, receiver) in pending {
        assert_eq!(manager.wait(id).await, Some(TransferState::Completed));
        let messages = finish(receiver).await;
        assert_eq!(messages.len(), EVENTS.div_ceil(BATCH));
        assert_eq!(decode_all(&messages), expected_frames(&req, &config));
    }

    let counts = manager.counts();
    assert_eq!(counts.completed, 4);
    assert_eq!(manager.list().len(), 4);
}
