//! pktflow - Main Entry Point
//!
//! Replays a capture file or follows a TCP stream through an ingestion loop
//! and a statistics node, logging status snapshots until the source ends or
//! faults.

use anyhow::{bail, Context};
use clap::Parser;
use pktflow::{
    config::FlowConfig,
    ingest::{CircularBuffer, CopierConfig, IngestionLoop, LoopExit, StatusMonitor, StreamCopier},
    pipeline::{nodes::StatsNode, DispatchGraph, KindFilter},
    types::{FaultKind, FaultReport, SourceId},
};
use std::io::Read;
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "pktflow")]
#[command(about = "Packet ingestion and batch dispatch", long_about = None)]
struct Args {
    /// Config file (defaults to the platform config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Read packets from a TCP peer, e.g. 127.0.0.1:9000
    #[arg(long, conflicts_with = "file")]
    connect: Option<String>,

    /// Replay packets from a file
    #[arg(long)]
    file: Option<PathBuf>,

    /// Print the effective configuration as TOML and exit
    #[arg(long)]
    print_config: bool,

    /// Also write logs to a daily rolling file in this directory
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Identity reported in telemetry and fault reports
    #[arg(long, default_value_t = 0)]
    source_id: u32,
}

fn init_logging(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "pktflow.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,pktflow=debug")),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();

    guard
}

fn load_config(path: Option<&Path>) -> anyhow::Result<FlowConfig> {
    match path {
        Some(path) => FlowConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display())),
        None => Ok(FlowConfig::load_or_default(FlowConfig::default_path())),
    }
}

fn open_source(args: &Args, config: &FlowConfig) -> anyhow::Result<(String, Box<dyn Read + Send>)> {
    if let Some(addr) = &args.connect {
        let stream = TcpStream::connect(addr).with_context(|| format!("connecting to {}", addr))?;
        // Bounded reads so the copy thread notices a stop request
        stream.set_read_timeout(Some(std::time::Duration::from_millis(
            config.buffer.wait_timeout_ms.max(1),
        )))?;
        tracing::info!(%addr, "connected");
        return Ok(("tcp".to_string(), Box::new(stream)));
    }
    if let Some(path) = &args.file {
        let file = std::fs::File::open(path)
            .with_context(|| format!("opening {}", path.display()))?;
        tracing::info!(path = %path.display(), "replaying file");
        return Ok(("file".to_string(), Box::new(std::io::BufReader::new(file))));
    }
    bail!("nothing to ingest: pass --connect <addr> or --file <path>")
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let _log_guard = init_logging(args.log_dir.as_deref());

    let config = load_config(args.config.as_deref())?;
    if args.print_config {
        println!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    tracing::info!("Starting pktflow");
    let (label, reader) = open_source(&args, &config)?;

    let graph = DispatchGraph::with_queue_depth(config.dispatch.default_queue_depth);
    let buffer = Arc::new(CircularBuffer::new(config.buffer.capacity));

    let ingest = IngestionLoop::new(
        SourceId(args.source_id),
        buffer.clone(),
        &graph,
        config.runtime_settings().into(),
    )
    .with_fault_handler(|report: &FaultReport| {
        tracing::warn!(
            source_id = %report.source_id,
            kind = %report.kind,
            processed = report.counters.packets_processed,
            "source halted: {}",
            report.message
        );
    });

    let stats = StatsNode::new("stats");
    let stats_handle = stats.handle();
    let stats_id = graph.add_node(stats)?;
    graph.subscribe(ingest.source_node(), stats_id, KindFilter::All)?;

    let monitor = StatusMonitor::new(config.monitor_interval(), config.monitor.channel_depth)
        .watch(ingest.shared(), buffer.clone())
        .spawn()?;

    let copier = StreamCopier::new(
        reader,
        buffer.clone(),
        CopierConfig {
            chunk_size: config.buffer.read_chunk,
            full_grace: config.full_grace(),
        },
    )
    .spawn(&label)?;

    let ingest = ingest.spawn()?;

    while !ingest.is_finished() {
        if let Ok(snapshot) = monitor.receiver().recv_timeout(config.monitor_interval()) {
            tracing::info!(
                source_id = %snapshot.source_id,
                status = %snapshot.status,
                processed = snapshot.counters.packets_processed,
                bytes = snapshot.counters.bytes_consumed,
                drop_rate = %format!("{:.2}%", snapshot.drop_rate()),
                "snapshot"
            );
        }
    }

    let exit = ingest.join();
    copier.stop();
    let copied = copier.join();
    monitor.join();
    graph.shutdown();

    let table = stats_handle.snapshot();
    tracing::info!(
        copied,
        packets = table.total.packets,
        bytes = table.total.bytes,
        bad = table.bad.packets,
        kinds = table.by_kind.len(),
        "Shutting down..."
    );

    match exit {
        LoopExit::Stopped => Ok(()),
        LoopExit::Faulted(report) if report.kind == FaultKind::SourceClosed => Ok(()),
        LoopExit::Faulted(report) => bail!(
            "{} faulted ({}): {}",
            report.source_id,
            report.kind,
            report.message
        ),
    }
}
