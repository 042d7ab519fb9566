use anyhow::Result;
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pluct::monitor::HealthMonitor;
use pluct::workflow::{Stage, WorkflowEvent, WorkflowOutcome};
use pluct::{output, Cli, Commands, Config, EngineApi, EngineContext};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let default_filter = if cli.verbose { "pluct=debug" } else { "pluct=info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = Config::load().await?;

    match cli.command {
        Commands::Transcribe { url, output, format } => {
            config.validate()?;
            let parsed = url::Url::parse(&url)
                .map_err(|e| anyhow::anyhow!("invalid video URL {:?}: {}", url, e))?;
            if !matches!(parsed.scheme(), "http" | "https") {
                anyhow::bail!("video URL must be http(s), got {:?}", parsed.scheme());
            }

            let context = EngineContext::from_config(config)?;
            let outcome = run_transcription(&context, &url, cli.quiet).await;

            match outcome {
                WorkflowOutcome::Completed(result) => match output {
                    Some(path) => {
                        output::save_to_file(&result, &path, format)?;
                        println!(
                            "{} Transcript saved to: {}",
                            console::style("✓").green(),
                            path.display()
                        );
                    }
                    None => output::print_to_console(&result, format)?,
                },
                WorkflowOutcome::Failed { category, message } => {
                    anyhow::bail!("transcription failed ({}): {}", category, message);
                }
                WorkflowOutcome::TimedOut { job_id, attempts } => {
                    anyhow::bail!(
                        "gave up on job {} after {} polls; it may still finish server-side",
                        job_id,
                        attempts
                    );
                }
            }
        }
        Commands::Balance => {
            config.validate()?;
            let context = EngineContext::from_config(config)?;
            let balance = context.api.credit_balance().await?;
            println!("Credit balance: {}", balance.balance);
            if let Some(updated_at) = balance.updated_at {
                println!("Updated at: {}", updated_at);
            }
        }
        Commands::Health => {
            let health_interval = config.health_interval();
            let context = EngineContext::from_config(config)?;
            let mut monitor = HealthMonitor::spawn(
                Arc::clone(&context.api) as Arc<dyn EngineApi>,
                health_interval,
            );
            let status = monitor.wait_for_first_probe().await;
            let styled = match status {
                pluct::monitor::HealthStatus::Healthy => console::style(status).green(),
                pluct::monitor::HealthStatus::Degraded => console::style(status).yellow(),
                _ => console::style(status).red(),
            };
            println!("Engine: {}", styled);
            let snapshot = context.metrics.snapshot();
            println!(
                "Requests: {} ({} ok, {} failed), retries: {}",
                snapshot.requests, snapshot.successes, snapshot.failures, snapshot.retries
            );
            monitor.shutdown().await;
        }
        Commands::Config { show } => {
            if show {
                config.display();
            } else {
                config.save().await?;
                println!("Configuration written; edit it to set engine credentials.");
            }
        }
    }

    Ok(())
}

/// Run one workflow session, rendering stage events as a spinner unless
/// `quiet` is set. Ctrl-C cancels the session.
async fn run_transcription(context: &EngineContext, url: &str, quiet: bool) -> WorkflowOutcome {
    let cancel = CancellationToken::new();
    let ctrl_c_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, cancelling session");
            ctrl_c_cancel.cancel();
        }
    });

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<WorkflowEvent>();
    let progress = if quiet {
        None
    } else {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        spinner.enable_steady_tick(std::time::Duration::from_millis(120));
        Some(spinner)
    };

    let workflow = context.workflow();
    let runner = workflow.run(url, &tx, &cancel);
    tokio::pin!(runner);

    let outcome = loop {
        tokio::select! {
            outcome = &mut runner => break outcome,
            event = rx.recv() => {
                if let (Some(event), Some(spinner)) = (event, progress.as_ref()) {
                    spinner.set_message(render_event(&event));
                }
            }
        }
    };

    if let Some(spinner) = progress {
        spinner.finish_and_clear();
    }
    outcome
}

fn render_event(event: &WorkflowEvent) -> String {
    match (&event.poll, event.stage) {
        (Some(poll), _) => {
            let progress = poll
                .progress
                .map(|p| format!(" {}%", p))
                .unwrap_or_default();
            format!(
                "[{}/{}] {}{}",
                poll.attempt, poll.max_attempts, poll.status, progress
            )
        }
        (None, Stage::Polling) => event.message.clone(),
        (None, stage) => format!("[{}] {}", stage, event.message),
    }
}
