use crate::config::ProcessorConfig;
use crate::message::{Batch, Message, MessageRecord};
use crate::processor::HttpProcessor;
use anyhow::Context;
use clap::Parser;
use std::io::{Read, Write};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "http-batch-processor")]
#[command(about = "Send one HTTP request per message and print the mapped messages")]
#[command(version)]
pub struct Cli {
    /// Processor config file (TOML)
    #[arg(short, long, env = "HTTP_PROCESSOR_CONFIG")]
    pub config: PathBuf,

    /// Input file, or "-" for stdin
    #[arg(short, long, default_value = "-")]
    pub input: String,

    /// Treat each input line as a raw payload instead of a JSON record
    #[arg(long)]
    pub raw: bool,

    /// Messages per batch (0 sends all input as one batch)
    #[arg(long, default_value_t = 0)]
    pub batch_size: usize,

    /// Dispatch messages of a batch concurrently
    #[arg(long)]
    pub parallel: bool,

    /// Override the configured retry count
    #[arg(long)]
    pub retries: Option<u32>,

    /// Emit logs as JSON
    #[arg(long)]
    pub log_json: bool,
}

pub async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = ProcessorConfig::load(&cli.config)?;
    if cli.parallel {
        config.parallel = true;
    }
    if let Some(retries) = cli.retries {
        config.retries = retries;
    }
    let processor = HttpProcessor::new(&config).context("invalid processor configuration")?;

    let input = read_input(&cli.input)?;
    let messages = parse_messages(&input, cli.raw)?;
    info!(messages = messages.len(), mode = %processor.mode(), "processing input");

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling in-flight batch");
            interrupt.cancel();
        }
    });

    let chunk_size = if cli.batch_size == 0 {
        messages.len().max(1)
    } else {
        cli.batch_size
    };
    let mut pending = messages.into_iter().peekable();
    while pending.peek().is_some() {
        let batch: Batch = pending.by_ref().take(chunk_size).collect();
        let output = processor.process_batch_with_cancel(batch, &cancel).await?;
        write_records(&mut std::io::stdout().lock(), &output)?;
    }
    Ok(())
}

fn read_input(input: &str) -> anyhow::Result<String> {
    if input == "-" {
        let mut content = String::new();
        std::io::stdin()
            .read_to_string(&mut content)
            .context("Failed to read stdin")?;
        return Ok(content);
    }
    std::fs::read_to_string(input).with_context(|| format!("Failed to read {}", input))
}

/// Parse one message per non-empty line.
pub fn parse_messages(input: &str, raw: bool) -> anyhow::Result<Batch> {
    input
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(idx, line)| -> anyhow::Result<Message> {
            if raw {
                return Ok(Message::new(line.to_string()));
            }
            let record: MessageRecord = serde_json::from_str(line)
                .with_context(|| format!("invalid JSON record on line {}", idx + 1))?;
            Ok(Message::from(record))
        })
        .collect()
}

/// Write one JSON record per message.
pub fn write_records(out: &mut impl Write, batch: &Batch) -> anyhow::Result<()> {
    for message in batch {
        serde_json::to_writer(&mut *out, &MessageRecord::from(message))?;
        writeln!(out)?;
    }
    out.flush()?;
    Ok(())
}
