// Quill document agent
// Main entry point for the quill binary

use clap::Parser;
use quill_engine::cli::{Cli, Command};
use quill_engine::config::Config;
use quill_engine::handlers::{
    handle_list, handle_recover, handle_run, handle_show, OutputFormat, RunArgs,
};
use quill_engine::telemetry::init_telemetry_with_level;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse();

    // Load configuration (or use custom path if provided)
    let config = if let Some(config_path) = &cli.config {
        Config::load_from_path(config_path)?
    } else {
        Config::load_or_create()?
    };

    // --log wins over the config file; RUST_LOG wins over both
    let log_level = cli.log.as_deref().unwrap_or(&config.core.log_level);
    init_telemetry_with_level(log_level);

    tracing::debug!("Quill v{}", env!("CARGO_PKG_VERSION"));

    // Determine output format
    let format = if cli.json {
        OutputFormat::Json
    } else {
        OutputFormat::Text
    };

    match cli.command {
        Command::Run {
            document_id,
            section_id,
            knowledge_base_id,
            mode,
            requirement,
            params,
            output,
        } => {
            let args = RunArgs {
                document_id,
                section_id,
                knowledge_base_id,
                mode,
                requirement,
                params,
                output,
            };
            handle_run(args, &config, format).await
        }

        Command::Show { task_id } => handle_show(task_id, &config, format).await,

        Command::List { document_id, limit } => {
            handle_list(document_id, limit, &config, format).await
        }

        Command::Recover => handle_recover(&config, format).await,
    }
}
