use crate::api::SessionClient;
use crate::driver::{self, UiCommand};
use crate::model::{DriverConfig, RetryPolicy, SessionEvent};
use anyhow::{Context, Result};
use clap::Parser;
use std::io::Write;
use std::time::Duration;
use tokio::sync::mpsc;

/// Output line routing for stdout/stderr writer.
enum OutputLine {
    Stdout(String),
    Stderr(String),
}

/// Spawn a blocking writer for stdout/stderr to avoid blocking async tasks.
fn spawn_output_writer() -> (
    mpsc::UnboundedSender<OutputLine>,
    tokio::task::JoinHandle<()>,
) {
    let (tx, mut rx) = mpsc::unbounded_channel::<OutputLine>();
    let handle = tokio::task::spawn_blocking(move || {
        let stdout = std::io::stdout();
        let stderr = std::io::stderr();
        let mut out = std::io::LineWriter::new(stdout.lock());
        let mut err = std::io::LineWriter::new(stderr.lock());

        while let Some(line) = rx.blocking_recv() {
            match line {
                OutputLine::Stdout(msg) => {
                    let _ = writeln!(out, "{}", msg);
                }
                OutputLine::Stderr(msg) => {
                    let _ = writeln!(err, "{}", msg);
                }
            }
        }

        let _ = out.flush();
        let _ = err.flush();
    });
    (tx, handle)
}

#[derive(Debug, Parser, Clone)]
#[command(
    name = "analysis-driver",
    version,
    about = "Drive a long-running server-hosted analysis session"
)]
pub struct Cli {
    /// Base URL of the analysis service
    #[arg(long, default_value = "http://localhost:8000")]
    pub base_url: String,

    /// Task description; starts a session immediately. Required in text mode,
    /// optional in the TUI (type it into the input form instead)
    #[arg(long)]
    pub task: Option<String>,

    /// Stream progress as plain text and exit on completion or Ctrl-C (no TUI)
    #[arg(long)]
    pub text: bool,

    /// Stream each status snapshot as a JSON line (implies no TUI)
    #[arg(long)]
    pub json: bool,

    /// Interval between status polls
    #[arg(long, default_value = "5s")]
    pub poll_interval: humantime::Duration,

    /// Idle delay before triggering the next iteration
    #[arg(long, default_value = "2s")]
    pub idle_delay: humantime::Duration,

    /// Stop driving once the server reports a terminal status
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub stop_on_complete: bool,

    /// Retry attempts per request (0 disables retries)
    #[arg(long, default_value_t = 0)]
    pub retries: u32,

    /// Backoff between retry attempts
    #[arg(long, default_value = "1s")]
    pub retry_backoff: humantime::Duration,

    /// Iteration budget sent with the start request
    #[arg(long)]
    pub iterations: Option<u32>,
}

/// Build a `DriverConfig` from CLI arguments.
pub fn build_config(args: &Cli) -> DriverConfig {
    DriverConfig {
        base_url: args.base_url.clone(),
        user_agent: format!("analysis-driver-cli/{}", env!("CARGO_PKG_VERSION")),
        poll_interval: Duration::from(args.poll_interval),
        idle_delay: Duration::from(args.idle_delay),
        stop_on_complete: args.stop_on_complete,
        retry: RetryPolicy {
            attempts: args.retries,
            backoff: Duration::from(args.retry_backoff),
        },
        iteration_budget: args.iterations,
    }
}

pub async fn run(args: Cli) -> Result<()> {
    if args.text || args.json {
        return run_text(args).await;
    }

    #[cfg(feature = "tui")]
    {
        crate::tui::run(args).await
    }
    #[cfg(not(feature = "tui"))]
    {
        // Fallback when built without TUI support.
        run_text(args).await
    }
}

/// Headless mode: start the session, stream progress to stdout/stderr, run
/// until the session completes or the user interrupts.
async fn run_text(args: Cli) -> Result<()> {
    let task = args
        .task
        .clone()
        .context("--task is required in text/JSON mode")?;
    let cfg = build_config(&args);
    let client = SessionClient::new(&cfg).context("failed to build HTTP client")?;

    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<SessionEvent>();
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<UiCommand>();
    let (out_tx, out_handle) = spawn_output_writer();

    let driver_handle = tokio::spawn(driver::run_driver(client, cfg, event_tx, cmd_rx));
    let _ = cmd_tx.send(UiCommand::Start(task));

    let mut printed = 0usize;
    let mut last_status: Option<String> = None;
    let mut start_error: Option<String> = None;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                let _ = out_tx.send(OutputLine::Stderr("Interrupted, shutting down".into()));
                let _ = cmd_tx.send(UiCommand::Quit);
                break;
            }
            ev = event_rx.recv() => {
                let Some(ev) = ev else { break };
                match ev {
                    SessionEvent::SessionStarted { session_id } => {
                        let _ = out_tx.send(OutputLine::Stderr(format!(
                            "Session started: {session_id}"
                        )));
                    }
                    SessionEvent::StartFailed { error } => {
                        start_error = Some(error);
                        let _ = cmd_tx.send(UiCommand::Quit);
                        break;
                    }
                    SessionEvent::Snapshot(snapshot) => {
                        if args.json {
                            let _ = out_tx.send(OutputLine::Stdout(
                                serde_json::to_string(&snapshot)?,
                            ));
                        } else {
                            let model = crate::render::project(Some(&snapshot));
                            if let Some(status) = model.status {
                                if last_status.as_deref() != Some(status.as_str()) {
                                    let _ = out_tx.send(OutputLine::Stderr(format!(
                                        "Status: {status}"
                                    )));
                                    last_status = Some(status);
                                }
                            }
                            // The server may rewrite history; restart from the
                            // new tail rather than skipping entries.
                            if model.entries.len() < printed {
                                printed = model.entries.len();
                            }
                            for entry in &model.entries[printed..] {
                                let _ = out_tx.send(OutputLine::Stdout(format!(
                                    "[{}] {}: {}",
                                    entry.timestamp, entry.kind, entry.content
                                )));
                            }
                            printed = model.entries.len();
                        }
                    }
                    SessionEvent::PollFailed { error } => {
                        let _ = out_tx.send(OutputLine::Stderr(format!(
                            "Status poll failed (will retry): {error}"
                        )));
                    }
                    SessionEvent::IterationFailed { error } => {
                        let _ = out_tx.send(OutputLine::Stderr(format!(
                            "Iteration failed (loop continues): {error}"
                        )));
                    }
                    SessionEvent::SessionComplete { session_id } => {
                        let _ = out_tx.send(OutputLine::Stderr(format!(
                            "Session {session_id} complete"
                        )));
                        let _ = cmd_tx.send(UiCommand::Quit);
                        break;
                    }
                    SessionEvent::Info(msg) => {
                        let _ = out_tx.send(OutputLine::Stderr(msg));
                    }
                }
            }
        }
    }

    driver_handle
        .await
        .context("driver task failed")??;

    drop(out_tx);
    let _ = out_handle.await;

    match start_error {
        Some(error) => Err(anyhow::anyhow!("failed to start session: {error}")),
        None => Ok(()),
    }
}
