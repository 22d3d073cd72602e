//! End-to-end buffer flow tests against the production channel sink.
//!
//! These exercise the full path a chunk takes in the binary: push into the
//! buffer, through the sink adapter, into a bounded channel drained by a
//! consumer task. Time is paused so drain ticks run deterministically.

use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::timeout;

use captionflow::{BackpressureBuffer, BufferConfig, ChannelSink, FlowSignal};

fn small_config() -> BufferConfig {
    BufferConfig {
        max_buffer_bytes: 2_000,
        high_water_bytes: 1_500,
        resume_water_bytes: 500,
        batch_bytes: 200,
        drain_interval: Duration::from_millis(10),
        report_interval: Duration::from_secs(10),
    }
}

async fn collect(rx: &mut mpsc::Receiver<Bytes>, total: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(total);
    while out.len() < total {
        match rx.recv().await {
            Some(chunk) => out.extend_from_slice(&chunk),
            None => break,
        }
    }
    out
}

#[tokio::test(start_paused = true)]
async fn bytes_arrive_in_push_order_through_the_channel_sink() {
    let (buffer, _flow) = BackpressureBuffer::new(BufferConfig::default()).unwrap();
    let (tx, mut rx) = mpsc::channel::<Bytes>(4);
    buffer.attach_sink(ChannelSink::new(tx));

    let mut pushed = Vec::new();
    for i in 0..20u8 {
        let chunk = vec![i; 100];
        pushed.extend_from_slice(&chunk);
        buffer.push(Bytes::from(chunk)).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let received = timeout(Duration::from_secs(5), collect(&mut rx, pushed.len()))
        .await
        .expect("consumer starved");
    assert_eq!(received, pushed);
    assert_eq!(buffer.stats().lost_bytes, 0);
}

#[tokio::test(start_paused = true)]
async fn saturated_sink_resumes_after_drain_notification() {
    let (buffer, _flow) = BackpressureBuffer::new(BufferConfig::default()).unwrap();
    // Single-permit channel with nobody reading: the first write saturates
    // the sink and everything else queues behind it.
    let (tx, mut rx) = mpsc::channel::<Bytes>(1);
    buffer.attach_sink(ChannelSink::new(tx));

    let mut pushed = Vec::new();
    for i in 0..5u8 {
        let chunk = vec![i; 100];
        pushed.extend_from_slice(&chunk);
        buffer.push(Bytes::from(chunk)).unwrap();
    }

    let stats = buffer.stats();
    assert_eq!(stats.sent_bytes, 100);
    assert_eq!(stats.queued_bytes, 400);

    // A consumer appears; the drain notification restarts the flow.
    let received = timeout(Duration::from_secs(5), collect(&mut rx, pushed.len()))
        .await
        .expect("drain never resumed");
    assert_eq!(received, pushed);
    assert_eq!(buffer.stats().queued_bytes, 0);
    assert_eq!(buffer.stats().lost_bytes, 0);
}

#[tokio::test(start_paused = true)]
async fn obedient_producer_loses_nothing_against_a_slow_consumer() {
    let (buffer, mut flow) = BackpressureBuffer::new(small_config()).unwrap();
    let (tx, mut rx) = mpsc::channel::<Bytes>(2);
    buffer.attach_sink(ChannelSink::new(tx));

    let consumer = tokio::spawn(async move {
        let mut out = Vec::new();
        while let Some(chunk) = rx.recv().await {
            out.extend_from_slice(&chunk);
            // Consumer is slower than the producer.
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        out
    });

    // Producer honoring flow control the way the audio pump does.
    let mut pushed = Vec::new();
    let mut paused = false;
    for i in 0..100u32 {
        while let Ok(signal) = flow.try_recv() {
            paused = signal == FlowSignal::High;
        }
        while paused {
            match flow.recv().await {
                Some(signal) => paused = signal == FlowSignal::High,
                None => panic!("flow channel closed"),
            }
        }

        let chunk = vec![(i % 251) as u8; 100];
        pushed.extend_from_slice(&chunk);
        buffer.push(Bytes::from(chunk)).unwrap();
    }

    // Let the queue fully drain, then close the sink side.
    timeout(Duration::from_secs(30), async {
        while buffer.stats().queued_bytes > 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("queue never drained");
    buffer.detach_sink();

    let received = timeout(Duration::from_secs(5), consumer)
        .await
        .expect("consumer hung")
        .unwrap();
    assert_eq!(received, pushed);
    assert_eq!(buffer.stats().lost_bytes, 0);
}

#[tokio::test(start_paused = true)]
async fn sink_handoff_preserves_queued_audio() {
    let (buffer, _flow) = BackpressureBuffer::new(small_config()).unwrap();

    // First sink disappears with audio still queued behind it.
    let (tx1, rx1) = mpsc::channel::<Bytes>(1);
    buffer.attach_sink(ChannelSink::new(tx1));
    let mut pushed = Vec::new();
    for i in 0..8u8 {
        let chunk = vec![i; 100];
        pushed.extend_from_slice(&chunk);
        buffer.push(Bytes::from(chunk)).unwrap();
    }
    buffer.detach_sink();
    drop(rx1);

    let stats = buffer.stats();
    assert_eq!(stats.sent_bytes, 100);
    assert_eq!(stats.queued_bytes, 700);

    // Replacement sink receives everything that was still queued, in order.
    let (tx2, mut rx2) = mpsc::channel::<Bytes>(4);
    buffer.attach_sink(ChannelSink::new(tx2));

    let received = timeout(Duration::from_secs(5), collect(&mut rx2, 700))
        .await
        .expect("handoff stalled");
    assert_eq!(received, &pushed[100..]);
    assert_eq!(buffer.stats().lost_bytes, 0);
    assert_eq!(buffer.stats().sent_bytes, 800);
}
