use std::sync::Arc;

use ai_orchestrator::actions::JsonActionParser;
use ai_orchestrator::llm::{CommandProvider, Provider};
use ai_orchestrator::{Orchestrator, OrchestratorConfig, OrchestratorEvent};
use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Console logging always; a daily rolling file too when `AI_ORCH_LOG_DIR`
/// is set. The guard must outlive `main` for the file writer to flush.
fn init_tracing() -> anyhow::Result<Option<WorkerGuard>> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let mut guard = None;
    let file_layer = match std::env::var("AI_ORCH_LOG_DIR") {
        Ok(dir) if !dir.trim().is_empty() => {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("creating log directory {dir}"))?;
            let appender = tracing_appender::rolling::daily(dir, "ai-orchestrator.log");
            let (writer, g) = tracing_appender::non_blocking(appender);
            guard = Some(g);
            Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false)
                    .with_target(false),
            )
        }
        _ => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .with(file_layer)
        .init();

    Ok(guard)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _log_guard = init_tracing()?;

    let config = OrchestratorConfig::from_env().context("loading configuration")?;
    let provider: Arc<dyn Provider> =
        Arc::new(CommandProvider::from_env().context("configuring provider")?);

    eprintln!("🤖 AI Orchestrator v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Data: {}", config.data_dir.display());
    eprintln!("   Workers: {}", config.max_concurrent);
    eprintln!("   Type a message and press Enter. /status for counts, /quit to exit.\n");

    let orchestrator = Orchestrator::open(
        config,
        Arc::clone(&provider),
        provider,
        Arc::new(JsonActionParser::new()),
    )
    .await
    .context("opening runtime")?;
    orchestrator.start().await?;

    let mut events = orchestrator.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(OrchestratorEvent::ManagerReply { text }) => println!("\n{text}\n"),
                Ok(OrchestratorEvent::TaskUpdated { task_id, title, status }) => {
                    eprintln!("   [{status}] {title} ({task_id})");
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "Event printer lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => {
                let Some(line) = line.context("reading stdin")? else {
                    break;
                };
                let line = line.trim();
                match line {
                    "" => {}
                    "/quit" => break,
                    "/status" => {
                        let status = orchestrator.get_status().await;
                        println!("{}", serde_json::to_string_pretty(&status)?);
                    }
                    text => {
                        orchestrator.submit_input(text).await?;
                    }
                }
            }
        }
    }

    orchestrator.shutdown().await;
    Ok(())
}
