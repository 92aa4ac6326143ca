use anyhow::{Context, Result};
use clap::Parser;
use melodia::segment::{segment_lines, to_lrc};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "segment-lyrics")]
#[command(about = "Convert plain lyrics into timestamped LRC lines", long_about = None)]
struct Cli {
    /// Path to a plain-text lyrics file
    #[arg(short, long)]
    input: PathBuf,

    /// Total song duration in seconds
    #[arg(short, long)]
    duration: u32,

    /// Output path; defaults to the input path with an .lrc extension
    #[arg(short, long)]
    output: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let cli = Cli::parse();

    let lyrics = tokio::fs::read_to_string(&cli.input)
        .await
        .with_context(|| format!("Failed to read lyrics file: {}", cli.input.display()))?;

    let lines = segment_lines(&lyrics, cli.duration);
    if lines.is_empty() {
        anyhow::bail!("No displayable lyric lines in {}", cli.input.display());
    }

    let output = cli
        .output
        .unwrap_or_else(|| cli.input.with_extension("lrc"));

    tokio::fs::write(&output, to_lrc(&lines))
        .await
        .with_context(|| format!("Failed to write: {}", output.display()))?;

    tracing::info!(
        "Wrote {} timed lines ({}s) to {}",
        lines.len(),
        cli.duration,
        output.display()
    );

    Ok(())
}
