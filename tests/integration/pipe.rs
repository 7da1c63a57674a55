use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;

use sluice_core::{Event, StreamError};
use sluice_streams::{Emit, Fetched, PipeOptions, Sink, SinkState, Source, SourceState};

use crate::*;

#[tokio::test]
async fn test_pipe_preserves_order_and_finishes_after_end() {
    let source = Source::new(objects("letters"), Script::chunks(["A", "B", "C"].map(String::from)));
    let transport = Recorder::new();
    let sink = Sink::new(objects("collect"), transport.clone());

    let order = Arc::new(Mutex::new(Vec::new()));
    let watch_source = {
        let (source, order) = (source.clone(), order.clone());
        tokio::spawn(async move {
            source.ended().await.unwrap();
            order.lock().unwrap().push("end");
        })
    };
    let watch_sink = {
        let (sink, order) = (sink.clone(), order.clone());
        tokio::spawn(async move {
            sink.finished().await.unwrap();
            order.lock().unwrap().push("finish");
        })
    };

    source.pipe_to(&sink, PipeOptions::default());
    within(watch_source).await.unwrap();
    within(watch_sink).await.unwrap();

    assert_eq!(transport.chunks(), ["A", "B", "C"]);
    assert_eq!(*order.lock().unwrap(), ["end", "finish"]);
}

/// "AB", "CD", end → "ABCD" and exactly one finish.
#[tokio::test]
async fn test_basic_relay() {
    let source = Source::new(
        bytes("relay-in", 16),
        Script::new([
            Ok(Fetched::Chunks(vec!["AB".to_string()])),
            Ok(Fetched::Chunks(vec!["CD".to_string()])),
            Ok(Fetched::End),
        ]),
    );
    let transport = Recorder::new();
    let sink = Sink::new(bytes("relay-out", 16), transport.clone());
    let mut events = sink.subscribe();

    source.pipe_to(&sink, PipeOptions::default());
    within(sink.closed()).await;

    assert_eq!(transport.joined(), "ABCD");
    let mut finishes = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, Event::Finish) {
            finishes += 1;
        }
    }
    assert_eq!(finishes, 1);
}

/// A saturated sink pauses the source; draining it resumes delivery.
#[tokio::test]
async fn test_pipe_backpressure_pauses_source() {
    let source = Source::new(
        objects("producer").with_high_water_mark(2),
        Script::chunks((0..10).map(|n| n.to_string())),
    );
    let gate = Gate::closed();
    let sink = Sink::new(objects("slow").with_high_water_mark(2), gate.clone());

    source.pipe_to(&sink, PipeOptions::default());
    until(|| source.state() == SourceState::Paused && gate.arrived_count() == 1).await;
    assert_eq!(sink.buffered_size(), 2);

    gate.release(10);
    within(sink.finished()).await.unwrap();

    let expected: Vec<String> = (0..10).map(|n| n.to_string()).collect();
    assert_eq!(gate.arrived(), expected);
}

#[tokio::test]
async fn test_pipe_without_completion_leaves_sink_open() {
    let source = Source::new(objects("short"), Script::chunks(["only".to_string()]));
    let transport = Recorder::new();
    let sink = Sink::new(objects("long-lived"), transport.clone());

    source.pipe_to(
        &sink,
        PipeOptions {
            propagate_completion: false,
        },
    );
    within(source.ended()).await.unwrap();
    until(|| transport.chunks().len() == 1).await;

    assert_eq!(sink.state(), SinkState::Writable);
    assert!(sink.write("more".to_string()));
}

#[tokio::test]
async fn test_pipe_to_several_sinks() {
    let source = Source::new(objects("fanout"), Script::chunks(["x", "y"].map(String::from)));
    let left = Recorder::new();
    let right = Recorder::new();
    let left_sink = Sink::new(objects("left"), left.clone());
    let right_sink = Sink::new(objects("right"), right.clone());

    source.pipe_to(&left_sink, PipeOptions::default());
    source.pipe_to(&right_sink, PipeOptions::default());
    within(left_sink.finished()).await.unwrap();
    within(right_sink.finished()).await.unwrap();

    assert_eq!(left.chunks(), ["x", "y"]);
    assert_eq!(right.chunks(), ["x", "y"]);
}

#[tokio::test]
async fn test_destroyed_sink_detaches_from_source() {
    let source = Source::<String>::pushable(objects("upstream"));
    let sink = Sink::new(objects("doomed"), Recorder::new());

    source.pipe_to(&sink, PipeOptions::default());
    assert_eq!(source.state(), SourceState::Flowing);

    sink.destroy(None);
    until(|| source.state() == SourceState::Paused).await;

    source.pusher().push("kept".to_string());
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }
    assert_eq!(source.read(None), Some(vec!["kept".to_string()]));
}

#[tokio::test]
async fn test_unpipe_all_pauses_and_stops_delivery() {
    let source = Source::<String>::pushable(objects("detaching"));
    let transport = Recorder::new();
    let sink = Sink::new(objects("former-target"), transport.clone());
    let pusher = source.pusher();

    source.pipe_to(&sink, PipeOptions::default());
    pusher.push("before".to_string());
    until(|| transport.chunks().len() == 1).await;

    source.unpipe_all();
    assert_eq!(source.state(), SourceState::Paused);

    pusher.push("after".to_string());
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }
    assert_eq!(transport.chunks(), ["before"]);
    assert_eq!(source.read(None), Some(vec!["after".to_string()]));
    assert_eq!(sink.state(), SinkState::Writable);
}

/// Flags when the sink's dispatch task lets go of its transport.
struct Tracked(Arc<AtomicBool>);

impl Drop for Tracked {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

impl Emit<String> for Tracked {
    fn emit(&mut self, _: String) -> BoxFuture<'_, Result<(), StreamError>> {
        Box::pin(async { Ok(()) })
    }
}

/// An unpiped sink is no longer held by the source once both handles go.
#[tokio::test]
async fn test_unpiped_sink_releases_transport() {
    let released = Arc::new(AtomicBool::new(false));
    let source = Source::<String>::pushable(objects("upstream"));
    let sink = Sink::new(objects("released"), Tracked(released.clone()));

    source.pipe_to(&sink, PipeOptions::default());
    tokio::task::yield_now().await;
    source.unpipe_all();
    drop(sink);
    drop(source);

    until(|| released.load(Ordering::SeqCst)).await;
}
