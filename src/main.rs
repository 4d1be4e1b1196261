mod config;
mod editor;
mod engine;
mod error;
mod executor;
mod extractor;
mod formatter;
mod lifecycle;
mod orchestrator;
mod permission;
mod planner;
mod router;
mod streaming;
mod types;

#[cfg(test)]
mod integration_tests;
#[cfg(test)]
mod testing;

use std::path::PathBuf;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt};
use tracing_subscriber::EnvFilter;

use crate::orchestrator::{Orchestrator, ProcessOutcome};
use crate::permission::TerminalPrompter;

fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut verbose = false;
    let mut utterance: Option<String> = None;
    for arg in &args {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("codesmith {}", env!("CARGO_PKG_VERSION"));
                return Ok(());
            }
            "--help" | "-h" => {
                println!("codesmith {}", env!("CARGO_PKG_VERSION"));
                println!("{}\n", env!("CARGO_PKG_DESCRIPTION"));
                println!("Usage: codesmith [OPTIONS] [REQUEST]\n");
                println!("With a REQUEST argument, processes it and exits.");
                println!("Without one, starts an interactive session.\n");
                println!("Options:");
                println!("  -v, --verbose    Debug logging");
                println!("  -h, --help       Print help");
                println!("  -V, --version    Print version");
                println!("\nConfiguration is read from codesmith.toml (see README).");
                return Ok(());
            }
            "--verbose" | "-v" => verbose = true,
            other => utterance = Some(other.to_string()),
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            if verbose {
                EnvFilter::new("codesmith=debug")
            } else {
                EnvFilter::new("codesmith=info")
            }
        }))
        .with_writer(std::io::stderr)
        .init();

    let config_path = std::env::var("CODESMITH_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("codesmith.toml"));
    let config = config::AppConfig::load_or_default(&config_path)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(run(config, utterance))
}

async fn run(config: config::AppConfig, utterance: Option<String>) -> anyhow::Result<()> {
    let orchestrator = Orchestrator::new(
        config,
        engine::default_loader(),
        Box::new(TerminalPrompter),
    )?;

    let exit_code = match utterance {
        Some(single) => {
            let outcome = process_interruptible(&orchestrator, &single).await;
            println!("{}", outcome.text);
            orchestrator.shutdown().await;
            if outcome.denied {
                2
            } else {
                0
            }
        }
        None => {
            let code = interactive(&orchestrator).await?;
            orchestrator.shutdown().await;
            code
        }
    };

    if exit_code != 0 {
        std::process::exit(exit_code);
    }
    Ok(())
}

async fn interactive(orchestrator: &Orchestrator) -> anyhow::Result<i32> {
    let mut stdout = tokio::io::stdout();
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    let mut last_denied = false;

    loop {
        stdout.write_all(b"> ").await?;
        stdout.flush().await?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim().to_string();
        if line.is_empty() {
            continue;
        }
        if line == "exit" || line == "quit" {
            break;
        }

        let outcome = process_interruptible(orchestrator, &line).await;
        last_denied = outcome.denied;
        println!("{}", outcome.text);
    }

    Ok(if last_denied { 2 } else { 0 })
}

/// Run one request, turning Ctrl-C into a cancellation of the in-flight
/// generation rather than killing the process.
async fn process_interruptible(orchestrator: &Orchestrator, line: &str) -> ProcessOutcome {
    tokio::select! {
        outcome = orchestrator.process(line) => outcome,
        _ = tokio::signal::ctrl_c() => {
            orchestrator.cancel_current();
            ProcessOutcome {
                text: "Cancelled.".to_string(),
                denied: false,
                failed: true,
            }
        }
    }
}
