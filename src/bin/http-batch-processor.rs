use clap::Parser;
use http_batch_processor::{cli, native};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = cli::Cli::parse();
    native::init_tracing(cli.log_json);
    cli::run(cli).await
}
