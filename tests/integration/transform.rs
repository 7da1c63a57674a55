use std::time::Duration;

use futures::future::BoxFuture;

use sluice_core::StreamError;
use sluice_streams::{
    PipeOptions, Pusher, Sink, Source, SourceState, Transform, TransformConfig, TransformStage,
};

use crate::*;

fn doubled(name: &str) -> TransformStage<String, String> {
    TransformStage::from_fns(
        TransformConfig::symmetric(objects(name)),
        |chunk: String, out: &Pusher<String>| {
            out.push(chunk.clone());
            out.push(chunk);
            Ok(())
        },
        |out: &Pusher<String>| {
            out.push("Z".to_string());
            Ok(())
        },
    )
}

/// Push-twice over [X, Y] plus a flush of [Z] → [X, X, Y, Y, Z].
#[tokio::test]
async fn test_transform_fan_out_and_flush() {
    let stage = doubled("twice");
    let transport = Recorder::new();
    let sink = Sink::new(objects("out"), transport.clone());

    stage.readable().pipe_to(&sink, PipeOptions::default());
    stage.writable().write("X".to_string());
    stage.writable().write("Y".to_string());
    stage.writable().end();

    within(sink.finished()).await.unwrap();
    assert_eq!(transport.chunks(), ["X", "X", "Y", "Y", "Z"]);
}

/// Output pushed after an await still lands before the next chunk's.
#[tokio::test]
async fn test_async_transform_keeps_order() {
    struct Slow;

    impl Transform<String, String> for Slow {
        fn transform(
            &mut self,
            chunk: String,
            out: Pusher<String>,
        ) -> BoxFuture<'_, Result<(), StreamError>> {
            Box::pin(async move {
                let delay = if chunk == "first" { 20 } else { 1 };
                tokio::time::sleep(Duration::from_millis(delay)).await;
                out.push(chunk);
                Ok(())
            })
        }
    }

    let stage = TransformStage::new(TransformConfig::symmetric(objects("slow")), Slow);
    let transport = Recorder::new();
    let sink = Sink::new(objects("out"), transport.clone());

    stage.readable().pipe_to(&sink, PipeOptions::default());
    stage.writable().write("first".to_string());
    stage.writable().write("second".to_string());
    stage.writable().end();

    within(sink.finished()).await.unwrap();
    assert_eq!(transport.chunks(), ["first", "second"]);
}

/// A saturated read side stops the stage from taking more input.
#[tokio::test]
async fn test_backpressure_crosses_the_stage() {
    let stage = TransformStage::from_fn(
        TransformConfig::symmetric(objects("narrow").with_high_water_mark(2)),
        |chunk: String, out: &Pusher<String>| {
            out.push(chunk);
            Ok(())
        },
    );

    let mut accepted = 0;
    for n in 0..6 {
        if stage.writable().write(n.to_string()) {
            accepted += 1;
        }
    }
    assert_eq!(accepted, 1);

    until(|| stage.readable().buffered_size() == 2).await;
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }
    assert_eq!(stage.readable().buffered_size(), 2);
    assert!(stage.writable().buffered_size() >= 4);

    let out = Source::clone(stage.readable());
    let drained = tokio::spawn(async move {
        let mut seen = Vec::new();
        while seen.len() < 6 {
            match out.read(None) {
                Some(chunks) => seen.extend(chunks),
                None => tokio::task::yield_now().await,
            }
        }
        seen
    });
    let seen = within(drained).await.unwrap();
    let expected: Vec<String> = (0..6).map(|n| n.to_string()).collect();
    assert_eq!(seen, expected);
}

#[tokio::test]
async fn test_read_side_ends_after_flush() {
    let stage = doubled("ending");
    stage.writable().write("X".to_string());
    stage.writable().end();
    within(stage.writable().finished()).await.unwrap();

    assert_eq!(stage.readable().state(), SourceState::Initial);
    assert_eq!(
        stage.readable().read(None),
        Some(vec!["X".to_string(), "X".to_string(), "Z".to_string()])
    );
    within(stage.readable().ended()).await.unwrap();
}
