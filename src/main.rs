mod config;
mod error;
mod extract;
mod llm;
mod normalize;
mod pipeline;
mod report;
mod response;
mod store;

use clap::{Parser, Subcommand};
use config::Config;
use extract::VisionExtractor;
use llm::{ChatClient, ResolvedEndpoint};
use pipeline::Pipeline;
use report::{LlmReporter, Reporter};
use std::path::{Path, PathBuf};
use std::time::Duration;
use store::DocumentStore;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "invoice_etl", version, about = "Extract invoice line items from scanned images into SQLite")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, global = true, env = "INVOICE_ETL_CONFIG", default_value = "invoice_etl.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Extract, normalize and load a batch of inputs (e.g. `000 001`).
    Run {
        /// Input identifiers; defaults to `pipeline.default_inputs`.
        inputs: Vec<String>,
        /// Print the normalized documents instead of loading them.
        #[arg(long)]
        dry_run: bool,
        /// Skip report generation after loading.
        #[arg(long)]
        no_report: bool,
    },
    /// Regenerate the report from the current store contents.
    Report,
    /// Print document and line item counts.
    Stats,
    /// Print one stored document as JSON.
    Show { filename: String },
}

fn load_config(path: &Path) -> Result<Config, Box<dyn std::error::Error>> {
    if path.exists() {
        Ok(Config::load(path)?)
    } else {
        warn!(path = %path.display(), "Config file not found, using defaults");
        Ok(Config::default())
    }
}

fn chat_client(cfg: &Config) -> Result<ChatClient, Box<dyn std::error::Error>> {
    let endpoint = ResolvedEndpoint::resolve(&cfg.llm)?;
    Ok(ChatClient::new(endpoint, Duration::from_secs(cfg.llm.timeout_secs))?)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // init tracing
    tracing_subscriber::fmt()
        .with_target(true)
        .with_level(true)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Install crypto provider
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| "Failed to install rustls crypto provider")?;

    let cli = Cli::parse();
    let cfg = load_config(&cli.config)?;

    match cli.command {
        Command::Run {
            inputs,
            dry_run,
            no_report,
        } => {
            let inputs = if inputs.is_empty() {
                cfg.pipeline.default_inputs.clone()
            } else {
                inputs
            };

            let chat = chat_client(&cfg)?;
            chat.ensure_ready().await?;
            let extractor = VisionExtractor::new(chat.clone(), &cfg.extract, cfg.llm.extraction_max_tokens);
            let pipeline = Pipeline::new(&extractor, &cfg);

            info!(count = inputs.len(), "=== Processing batch ===");

            if dry_run {
                let batch = pipeline.transform(&inputs).await?;
                println!("{}", serde_json::to_string_pretty(&batch.documents)?);
                for skipped in &batch.skipped {
                    eprintln!("skipped {}: {}", skipped.input, skipped.reason);
                }
                return Ok(());
            }

            let reporter = LlmReporter::new(chat, cfg.llm.report_max_tokens);
            let report: Option<(&dyn Reporter, &Path)> = if cfg.report.enabled && !no_report {
                Some((&reporter, cfg.report.output_path.as_path()))
            } else {
                None
            };

            let outcome = pipeline.run(&inputs, &cfg.store, report).await?;

            for skipped in &outcome.skipped {
                warn!(input = %skipped.input, reason = %skipped.reason, "Input skipped");
            }
            if let Some(err) = &outcome.report_error {
                warn!(error = %err, "Report was not generated");
            }
            info!(
                loaded = outcome.loaded,
                skipped = outcome.skipped.len(),
                defaulted_fields = outcome.defaulted_fields,
                report = ?outcome.report,
                "=== ETL completed ==="
            );
            println!(
                "Success! ETL completed: {} loaded, {} skipped.",
                outcome.loaded,
                outcome.skipped.len()
            );
        }
        Command::Report => {
            let chat = chat_client(&cfg)?;
            chat.ensure_ready().await?;
            let reporter = LlmReporter::new(chat, cfg.llm.report_max_tokens);
            let path = report::generate_report(&cfg.store, &reporter, &cfg.report.output_path).await?;
            println!("Report saved at: {}", path.display());
        }
        Command::Stats => {
            let db = DocumentStore::open(&cfg.store)?;
            let (documents, line_items) = db.counts()?;
            info!(documents, line_items, "Database statistics");
            println!("documents: {documents}\nline_items: {line_items}");
            db.close()?;
        }
        Command::Show { filename } => {
            let db = DocumentStore::open(&cfg.store)?;
            match db.document(&filename)? {
                Some(doc) => println!("{}", serde_json::to_string_pretty(&doc)?),
                None => return Err(format!("No document stored for '{filename}'").into()),
            }
            db.close()?;
        }
    }

    Ok(())
}
