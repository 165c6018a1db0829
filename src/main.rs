//! agent-relay binary entry point

use std::{convert::Infallible, path::PathBuf};

use agent_relay::{
    cli::{Cli, Commands},
    config::RelayConfig,
    server,
    services::streaming::{EventEmitter, StreamController},
};
use bytes::Bytes;
use color_eyre::Result;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Install error handler
    color_eyre::install()?;
    dotenv::dotenv().ok();

    // Parse CLI arguments
    let cli = Cli::parse_args();

    // Set up logging; stdout is reserved for frames
    let filter = if cli.verbose {
        EnvFilter::new("agent_relay=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let mut config = RelayConfig::load()?;

    // Handle commands
    match cli.command.unwrap_or_default() {
        Commands::Serve { listen, upstream } => {
            if let Some(listen) = listen {
                config.server.listen = listen;
            }
            if upstream.is_some() {
                config.upstream.url = upstream;
            }
            config.validate()?;
            server::serve(config).await?;
        }
        Commands::Replay {
            path,
            chunk_size,
            final_text,
        } => {
            config.validate()?;
            replay(&config, path, chunk_size, final_text).await?;
        }
        Commands::Config => {
            if config.upstream.bearer_token.is_some() {
                config.upstream.bearer_token = Some("********".to_string());
            }
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Commands::Version => {
            println!("agent-relay version {}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}

/// Run a recorded upstream body through the normalizer and print the frames
async fn replay(
    config: &RelayConfig,
    path: Option<PathBuf>,
    chunk_size: usize,
    final_text: bool,
) -> Result<()> {
    let input = match path {
        Some(path) => tokio::fs::read(&path).await?,
        None => {
            let mut buf = Vec::new();
            tokio::io::stdin().read_to_end(&mut buf).await?;
            buf
        }
    };

    let chunks: Vec<std::result::Result<Bytes, Infallible>> = input
        .chunks(chunk_size.max(1))
        .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
        .collect();

    let controller = StreamController::new(config.stream.clone());
    let (emitter, mut rx) = EventEmitter::channel(config.stream.channel_capacity);

    let writer = async {
        let mut stdout = tokio::io::stdout();
        while let Some(frame) = rx.recv().await {
            stdout.write_all(&frame).await?;
        }
        stdout.flush().await?;
        Ok::<(), std::io::Error>(())
    };

    let (report, written) = tokio::join!(
        controller.run(futures::stream::iter(chunks), emitter),
        writer
    );
    written?;

    if final_text {
        println!("{}", report.final_text);
    }

    tracing::info!(
        state = %report.state,
        units = report.stats.units_emitted,
        malformed = report.stats.malformed_spans,
        "replay finished"
    );
    Ok(())
}
