use std::net::SocketAddr;
use std::sync::Arc;

use tracing_subscriber::{prelude::*, EnvFilter};

use xchat_core::{ChatService, Components, XchatConfig};
use xchat_http::{build_router, AppState};
use xchat_infer::{HttpLlmEngine, KeywordLlmEngine, LlmEngine};
use xchat_ledger::{EventSink, Ledger, NullSink};
use xchat_store::{demo_corpus, demo_source};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "xchat=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = XchatConfig::load()?;
    tracing::info!(?config, "configuration loaded");

    let tables = Arc::new(demo_source(config.fetch_latency()).await);

    let llm: Arc<dyn LlmEngine> = match &config.llm.url {
        Some(url) => {
            tracing::info!(%url, model = %config.llm.model, "using HTTP LLM engine");
            Arc::new(HttpLlmEngine::new(url.clone(), config.llm.model.clone()))
        }
        None => Arc::new(KeywordLlmEngine::new()),
    };

    let sink: Arc<dyn EventSink> = match &config.ledger_file {
        Some(path) => Arc::new(Ledger::open(path)?),
        None => Arc::new(NullSink),
    };

    let service = ChatService::spawn(
        Components {
            source: tables.clone(),
            llm,
            retriever: Arc::new(demo_corpus()),
            sink,
        },
        &config,
    );

    let app = build_router(AppState {
        service,
        tables: Some(tables),
    });

    let addr: SocketAddr = config.bind.parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "xchat HTTP server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    Ok(())
}
