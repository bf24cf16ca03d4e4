//! Command-line probe for the LinguaLearn backend.
//!
//! Drives the same [`ll_client::Client`] the desktop app uses, which makes
//! it handy for checking a backend deployment by hand.
//!
//! Usage:
//!   ll-probe detect @frame.b64
//!   ll-probe record @clip.b64 --language es
//!   ll-probe --url ws://10.0.0.5:8000/ws watch
//!
//! Env vars:
//!   LL_CONFIG        — config file (default: lingualearn.toml)
//!   LL_BACKEND_URL   — backend URL override
//!   RUST_LOG         — log filter (default: warn)

use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use ll_client::{ClientBuilder, ClientConfig, TermRecording};
use tracing_subscriber::EnvFilter;

/// Talk to the detection/transcription backend.
#[derive(Debug, Parser)]
#[command(name = "ll-probe", version, about)]
struct Cli {
    /// Backend WebSocket URL (overrides config and LL_BACKEND_URL).
    #[arg(long, global = true)]
    url: Option<String>,
    /// How long to wait for the first connection, in seconds.
    #[arg(long, global = true, default_value_t = 10)]
    wait: u64,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run object detection on an image and print the objects as JSON.
    Detect {
        /// Base64 image or data URL; `@path` reads it from a file.
        image: String,
    },
    /// Transcribe a recorded term and print the text.
    Record {
        /// Base64 audio; `@path` reads it from a file.
        audio: String,
        /// Language hint for the transcriber (e.g. "es").
        #[arg(long)]
        language: Option<String>,
    },
    /// Connect and log connection state changes until Ctrl-C.
    Watch,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let cli = Cli::parse();

    let mut config = ClientConfig::load().context("loading client config")?;
    if let Some(url) = cli.url {
        config.url = url;
    }
    let client = ClientBuilder::from_config(&config)
        .build()
        .context("building client")?;

    tracing::info!(url = %config.url, "connecting to backend");
    tokio::time::timeout(Duration::from_secs(cli.wait), client.connect())
        .await
        .map_err(|_| anyhow::anyhow!("no connection to {} after {}s", config.url, cli.wait))?
        .with_context(|| format!("connecting to {}", config.url))?;

    match cli.command {
        Command::Detect { image } => {
            let image = read_payload(&image)?;
            let result = client.detect(image).await.context("detect")?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Command::Record { audio, language } => {
            let mut recording = TermRecording::new(read_payload(&audio)?);
            recording.language = language;
            let result = client.record_term(recording).await.context("record_term")?;
            println!("{}", result.text);
        }
        Command::Watch => {
            let mut state = client.watch_state();
            println!("{}", *state.borrow_and_update());
            loop {
                tokio::select! {
                    changed = state.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        println!("{}", *state.borrow_and_update());
                    }
                    _ = tokio::signal::ctrl_c() => break,
                }
            }
        }
    }

    client.disconnect().await;
    Ok(())
}

/// `@path` reads the payload from a file; anything else is used verbatim.
fn read_payload(arg: &str) -> anyhow::Result<String> {
    match arg.strip_prefix('@') {
        Some(path) => {
            let raw = std::fs::read_to_string(path).with_context(|| format!("reading {path}"))?;
            Ok(raw.trim().to_string())
        }
        None => Ok(arg.to_string()),
    }
}
