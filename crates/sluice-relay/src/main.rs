//! sluice-relay — copy stdin to stdout through a sluice pipeline.
//!
//! Usage: `sluice-relay [--upper] [--json]`
//!
//! `--upper` ASCII-uppercases the byte stream. `--json` treats input as
//! JSON lines and writes each one back compact. Ctrl-C tears the pipeline
//! down; whatever already reached stdout stays there.

use anyhow::{bail, Context, Result};
use bytes::Bytes;

use sluice_core::{Mode, SluiceConfig};
use sluice_streams::{
    ConnectedPipeline, Pipeline, Pusher, Sink, Source, TransformConfig, TransformStage,
};

mod transports;

use transports::{JsonNormaliser, LineSplitter, ReaderFetch, WriterEmit};

#[derive(Debug, Default)]
struct Args {
    upper: bool,
    json: bool,
}

impl Args {
    fn parse(args: impl Iterator<Item = String>) -> Result<Self> {
        let mut parsed = Args::default();
        for arg in args {
            match arg.as_str() {
                "--upper" => parsed.upper = true,
                "--json" => parsed.json = true,
                other => bail!("unknown argument: {other}"),
            }
        }
        if parsed.upper && parsed.json {
            bail!("--upper and --json are mutually exclusive");
        }
        Ok(parsed)
    }
}

fn build(config: &SluiceConfig, args: &Args) -> ConnectedPipeline {
    let bytes = config.stream(Mode::Bytes);
    let objects = config.stream(Mode::Objects);

    let source = Source::new(
        bytes.clone().with_name("stdin"),
        ReaderFetch::new(tokio::io::stdin()),
    );

    if args.json {
        let split = TransformStage::new(
            TransformConfig {
                writable: bytes.with_name("split-lines"),
                readable: objects.clone().with_name("split-lines.out"),
            },
            LineSplitter::default(),
        );
        let normalise = TransformStage::new(
            TransformConfig::symmetric(objects.clone().with_name("normalise-json")),
            JsonNormaliser,
        );
        let stdout = Sink::new(
            objects.with_name("stdout"),
            WriterEmit::new(tokio::io::stdout()),
        );
        return Pipeline::from_source(source)
            .through(split)
            .through(normalise)
            .into_sink(stdout);
    }

    let stdout = Sink::new(
        bytes.clone().with_name("stdout"),
        WriterEmit::new(tokio::io::stdout()),
    );
    if args.upper {
        let upper = TransformStage::from_fn(
            TransformConfig::symmetric(bytes.with_name("uppercase")),
            |chunk: Bytes, out: &Pusher<Bytes>| {
                out.push(Bytes::from(chunk.to_ascii_uppercase()));
                Ok(())
            },
        );
        return Pipeline::from_source(source).through(upper).into_sink(stdout);
    }

    Pipeline::from_source(source).into_sink(stdout)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse(std::env::args().skip(1))?;
    let config = SluiceConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        SluiceConfig::default()
    });
    tracing::info!(
        upper = args.upper,
        json = args.json,
        byte_hwm = config.streams.byte_high_water_mark,
        object_hwm = config.streams.object_high_water_mark,
        "sluice-relay starting"
    );

    let pipeline = build(&config, &args);
    let teardown = pipeline.teardown();

    tokio::select! {
        result = pipeline.run() => {
            result.context("relay failed")?;
            tracing::info!("relay finished");
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupted, destroying pipeline");
            teardown.destroy_all();
        }
    }

    Ok(())
}
