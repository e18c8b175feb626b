use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use riptide::engine::{Engine, EngineConfig};
use riptide::metainfo::{MagnetLink, Metainfo};

/// BitTorrent client: downloads a torrent or magnet link and seeds it.
#[derive(Debug, Parser)]
#[command(name = "riptide", version)]
struct Args {
    /// Path to a .torrent file, or a magnet:? link
    source: String,

    /// Download directory
    #[arg(short, long, default_value = ".")]
    output: PathBuf,

    /// Preferred listen port (falls back to BT_PORT, then 6881)
    #[arg(short, long)]
    port: Option<u16>,

    /// Keep seeding after the download completes
    #[arg(long)]
    seed: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("riptide=info")),
        )
        .with_target(false)
        .init();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(error) => {
            eprintln!("failed to start runtime: {}", error);
            return ExitCode::from(1);
        }
    };
    runtime.block_on(run(args))
}

async fn run(args: Args) -> ExitCode {
    let mut config = EngineConfig::new(args.output.clone());
    config.listen_port = args.port;
    config.seed = args.seed;

    let mut engine = if args.source.starts_with("magnet:?") {
        match MagnetLink::parse(&args.source) {
            Ok(magnet) => Engine::from_magnet(magnet, config),
            Err(error) => {
                eprintln!("invalid magnet link: {}", error);
                return ExitCode::from(2);
            }
        }
    } else if args.source.ends_with(".torrent") {
        let data = match tokio::fs::read(&args.source).await {
            Ok(data) => data,
            Err(error) => {
                eprintln!("cannot read {}: {}", args.source, error);
                return ExitCode::from(1);
            }
        };
        match Metainfo::from_bytes(&data) {
            Ok(metainfo) => Engine::from_metainfo(metainfo, config),
            Err(error) => {
                eprintln!("invalid torrent file: {}", error);
                return ExitCode::from(1);
            }
        }
    } else {
        eprintln!("expected a .torrent path or a magnet:? link");
        return ExitCode::from(2);
    };

    let mut progress = engine.progress();
    let reporter = tokio::spawn(async move {
        let mut last_have = usize::MAX;
        while progress.changed().await.is_ok() {
            let snapshot = progress.borrow().clone();
            if snapshot.pieces_total > 0 && snapshot.pieces_have != last_have {
                last_have = snapshot.pieces_have;
                tracing::info!(
                    pieces = format!("{}/{}", snapshot.pieces_have, snapshot.pieces_total),
                    downloaded = snapshot.downloaded,
                    uploaded = snapshot.uploaded,
                    peers = snapshot.connected_peers,
                    "progress"
                );
            }
        }
    });

    let outcome = tokio::select! {
        result = engine.run() => Some(result),
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupted, writing resume state");
            None
        }
    };
    reporter.abort();

    if let Err(error) = engine.shutdown().await {
        eprintln!("shutdown error: {}", error);
        return ExitCode::from(1);
    }

    match outcome {
        Some(Ok(())) | None => ExitCode::SUCCESS,
        Some(Err(error)) => {
            eprintln!("fatal: {}", error);
            ExitCode::from(1)
        }
    }
}
