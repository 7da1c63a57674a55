use std::sync::{Arc, Mutex};
use std::time::Duration;

use sluice_core::{Event, StreamError};
use sluice_streams::{Sink, SinkState};

use crate::*;

/// Completions fire in submission order even when later chunks are
/// faster to emit.
#[tokio::test]
async fn test_completions_are_fifo_regardless_of_latency() {
    let transport = Recorder::new().with_delays([
        Duration::from_millis(30),
        Duration::from_millis(1),
        Duration::from_millis(10),
    ]);
    let sink = Sink::new(objects("fifo"), transport.clone());

    let order = Arc::new(Mutex::new(Vec::new()));
    for name in ["first", "second", "third"] {
        let order = order.clone();
        sink.write_with(name.to_string(), move |result| {
            assert!(result.is_ok());
            order.lock().unwrap().push(name);
        });
    }
    sink.end();
    within(sink.finished()).await.unwrap();

    assert_eq!(*order.lock().unwrap(), ["first", "second", "third"]);
    assert_eq!(transport.chunks(), ["first", "second", "third"]);
}

#[tokio::test]
async fn test_saturation_and_single_drain() {
    let sink = Sink::new(bytes("hwm4", 4), Recorder::<String>::new());
    let mut events = sink.subscribe();
    let completed = Arc::new(Mutex::new(0));

    let mut accepted = Vec::new();
    for byte in ["a", "b", "c", "d"] {
        let completed = completed.clone();
        accepted.push(sink.write_with(byte.to_string(), move |_| {
            *completed.lock().unwrap() += 1;
        }));
    }
    assert_eq!(accepted, [true, true, true, false]);

    within(sink.drained()).await;
    assert_eq!(*completed.lock().unwrap(), 4);
    assert_eq!(sink.buffered_size(), 0);

    sink.end();
    within(sink.finished()).await.unwrap();

    let mut drains = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, Event::Drain) {
            drains += 1;
        }
    }
    assert_eq!(drains, 1);
}

#[tokio::test]
async fn test_no_drain_without_saturation() {
    let sink = Sink::new(bytes("roomy", 16), Recorder::<String>::new());
    let mut events = sink.subscribe();

    assert!(sink.write("abc".to_string()));
    sink.end();
    within(sink.finished()).await.unwrap();

    while let Ok(event) = events.try_recv() {
        assert!(!matches!(event, Event::Drain), "drain without saturation");
    }
}

/// Destroying mid-write lets the in-flight chunk settle and drops the
/// buffered ones without calling their callbacks.
#[tokio::test]
async fn test_destroy_after_partial_write() {
    let gate = Gate::closed();
    let sink = Sink::new(objects("partial"), gate.clone());

    let fired = Arc::new(Mutex::new(Vec::new()));
    for name in ["in-flight", "queued-1", "queued-2"] {
        let fired = fired.clone();
        sink.write_with(name.to_string(), move |result| {
            fired.lock().unwrap().push((name, result.is_ok()));
        });
    }

    until(|| gate.arrived_count() == 1).await;
    sink.destroy(None);
    assert_eq!(sink.state(), SinkState::Destroyed);

    gate.release(3);
    let status = within(sink.closed()).await;
    tokio::task::yield_now().await;

    assert!(status.is_premature_close());
    assert_eq!(gate.arrived(), ["in-flight"]);
    assert_eq!(*fired.lock().unwrap(), [("in-flight", true)]);
}

#[tokio::test]
async fn test_write_after_end_reported_to_callback() {
    let transport = Recorder::new();
    let sink = Sink::new(objects("late"), transport.clone());
    let mut events = sink.subscribe();

    sink.write("accepted".to_string());
    sink.end();

    let rejected = Arc::new(Mutex::new(None));
    let slot = rejected.clone();
    assert!(!sink.write_with("rejected".to_string(), move |result| {
        *slot.lock().unwrap() = Some(result);
    }));

    within(sink.finished()).await.unwrap();
    assert!(matches!(
        rejected.lock().unwrap().take(),
        Some(Err(StreamError::WriteAfterEnd))
    ));
    assert_eq!(transport.chunks(), ["accepted"]);

    while let Ok(event) = events.try_recv() {
        assert!(!matches!(event, Event::Error(_)), "error reported twice");
    }
}

#[tokio::test]
async fn test_batched_writes_reach_transport_together() {
    let transport = Recorder::new().batching();
    let sink = Sink::new(objects("batch"), transport.clone());

    sink.begin_batch();
    for n in 0..3 {
        sink.write(n.to_string());
    }
    sink.end_batch();
    sink.end();
    within(sink.finished()).await.unwrap();

    assert_eq!(transport.batches(), [3]);
    assert_eq!(transport.chunks(), ["0", "1", "2"]);
    assert_eq!(transport.finalized(), 1);
}

#[tokio::test]
async fn test_end_with_writes_last_chunk_then_finishes() {
    let transport = Recorder::new();
    let sink = Sink::new(objects("closing-line"), transport.clone());

    sink.write("body".to_string());
    sink.end_with("trailer".to_string());
    assert_eq!(sink.state(), SinkState::Ending);
    assert!(!sink.write("too late".to_string()));

    within(sink.finished()).await.unwrap();
    assert_eq!(transport.chunks(), ["body", "trailer"]);
    assert_eq!(transport.finalized(), 1);
}

/// A transport without batch support gets the held writes one by one, in
/// order, and nothing completes while the batch is open.
#[tokio::test]
async fn test_batch_over_single_chunk_transport() {
    let transport = Recorder::new();
    let sink = Sink::new(objects("one-by-one"), transport.clone());

    let done = Arc::new(Mutex::new(Vec::new()));
    sink.begin_batch();
    for n in 0..3 {
        let done = done.clone();
        sink.write_with(n.to_string(), move |result| {
            assert!(result.is_ok());
            done.lock().unwrap().push(n);
        });
    }
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }
    assert!(done.lock().unwrap().is_empty());
    assert!(transport.chunks().is_empty());

    sink.end_batch();
    sink.end();
    within(sink.finished()).await.unwrap();

    assert_eq!(*done.lock().unwrap(), [0, 1, 2]);
    assert_eq!(transport.chunks(), ["0", "1", "2"]);
    assert!(transport.batches().is_empty());
}

#[tokio::test]
async fn test_destroy_with_pending_writes_skips_finalize() {
    let gate = Gate::closed();
    let sink = Sink::new(objects("cut-short"), gate.clone());

    sink.write("first".to_string());
    sink.write("second".to_string());
    sink.end();
    until(|| gate.arrived_count() == 1).await;

    sink.destroy(None);
    gate.release(2);
    let status = within(sink.closed()).await;
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }

    assert!(status.is_premature_close());
    assert_eq!(gate.arrived(), ["first"]);
    assert_eq!(gate.finalized(), 0);
}

/// Destroy landing while `finalize` runs: `close` arrives, `finish` never.
#[tokio::test]
async fn test_destroy_during_finalize_closes_without_finish() {
    let gate = Gate::closed().gating_finalize();
    let sink = Sink::new(objects("finalizing"), gate.clone());
    let mut events = sink.subscribe();

    sink.write("only".to_string());
    gate.release(1);
    sink.end();
    until(|| gate.finalized() == 1).await;

    sink.destroy(None);
    assert_eq!(sink.state(), SinkState::Destroyed);
    gate.release(1);
    let status = within(sink.closed()).await;

    assert!(!status.completed);
    assert!(status.is_premature_close());
    let mut closes = 0;
    while let Ok(event) = events.try_recv() {
        assert!(!matches!(event, Event::Finish), "finish after destroy");
        if matches!(event, Event::Close) {
            closes += 1;
        }
    }
    assert_eq!(closes, 1);
}

#[tokio::test]
async fn test_transport_failure_destroys_sink() {
    struct Refuse;

    impl sluice_streams::Emit<String> for Refuse {
        fn emit(&mut self, _: String) -> futures::future::BoxFuture<'_, Result<(), StreamError>> {
            Box::pin(async { Err(StreamError::transport("disk full")) })
        }
    }

    let sink = Sink::new(objects("refuse"), Refuse);
    sink.write("x".to_string());

    let err = within(sink.finished()).await.unwrap_err();
    assert_eq!(err.to_string(), "transport failed: disk full");
    assert_eq!(sink.state(), SinkState::Destroyed);
    assert!(!sink.write("y".to_string()));
}
