use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::{prelude::*, EnvFilter};
use xchat_core::{ChatService, Components, XchatConfig};
use xchat_infer::KeywordLlmEngine;
use xchat_ledger::{tail, verify_log, EventSink, Ledger, NullSink};
use xchat_store::{demo_corpus, demo_source};
use xchat_types::ChatRequest;

#[derive(Parser)]
#[command(name = "xchat")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one chat request in-process against the demo tables.
    Demo {
        #[arg(long, default_value = "Show me the sales trend for the last 30 days")]
        prompt: String,
        /// Simulated scan latency of the demo store.
        #[arg(long, default_value_t = 300)]
        latency_ms: u64,
        /// Append telemetry to this ledger file.
        #[arg(long)]
        ledger: Option<String>,
    },
    Ledger {
        #[command(subcommand)]
        action: LedgerCommand,
        #[arg(long, default_value = "./xchat-ledger.jsonl")]
        path: String,
    },
}

#[derive(Subcommand)]
enum LedgerCommand {
    Tail {
        #[arg(long, default_value_t = 10)]
        lines: usize,
    },
    Verify,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "warn".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Demo {
            prompt,
            latency_ms,
            ledger,
        } => {
            let sink: Arc<dyn EventSink> = match ledger {
                Some(path) => Arc::new(Ledger::open(path)?),
                None => Arc::new(NullSink),
            };
            let service = ChatService::spawn(
                Components {
                    source: Arc::new(demo_source(Duration::from_millis(latency_ms)).await),
                    llm: Arc::new(KeywordLlmEngine::new()),
                    retriever: Arc::new(demo_corpus()),
                    sink,
                },
                &XchatConfig::load()?,
            );

            println!("Prompt: {prompt}");
            let id = service.submit(ChatRequest::new(prompt)).await?;
            println!("Request: {id}");

            let mut last_label = None;
            loop {
                let status = service.status(id).await?;
                if status.progress_label != last_label {
                    if let Some(label) = &status.progress_label {
                        println!("[{}] {label}", status.state.as_str());
                    }
                    last_label = status.progress_label.clone();
                }
                if status.state.is_terminal() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }

            let result = service.result(id).await?;
            println!("{}", serde_json::to_string_pretty(result.as_ref())?);
        }
        Command::Ledger { action, path } => match action {
            LedgerCommand::Tail { lines } => {
                for record in tail(&path, lines)? {
                    println!("{}", serde_json::to_string(&record)?);
                }
            }
            LedgerCommand::Verify => {
                let n = verify_log(&path)?;
                println!("ledger ok ({n} records)");
            }
        },
    }

    Ok(())
}
