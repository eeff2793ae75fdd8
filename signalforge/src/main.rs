use anyhow::Result;
use chrono::Utc;
use clap::Parser;
use std::collections::HashMap;
use std::process::ExitCode;
use tracing::info;

use signalforge::cli::{joined, Cli, Command, LoopArgs};
use signalforge::config::Config;
use signalforge::error::ConfigError;
use signalforge::logging;
use signalforge::runner::{RunMode, Runner, RunnerDeps};
use signalforge::utils::open_in_browser;

#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();
    let cli = Cli::parse();
    logging::init(cli.json);

    match execute(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("[SignalForge] {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn execute(cli: Cli) -> Result<()> {
    let env: HashMap<String, String> = std::env::vars().collect();
    let cwd = std::env::current_dir()?;
    let config = Config::resolve(&cli, &env, &cwd, Utc::now())?;
    let command = cli.command();

    if command.reads_vault() {
        config.require_vault()?;
    }

    let runner = Runner::new(config.clone(), RunnerDeps::from_config(&config)?);

    match command {
        Command::Init => {
            runner.init().await?;
            println!("Initialized findings at {}", config.findings_dir.display());
            println!("State file: {}", config.state_file.display());
        }
        Command::Run => {
            let report = runner.run_once(RunMode::Standard).await?;
            for finding in &report.findings {
                println!("Wrote {}", finding.path.display());
            }
        }
        Command::Loop(args) => run_loop_command(&runner, &args).await?,
        Command::Status => {
            let report = runner.status().await?;
            let summary = &report.summary;
            println!("State file: {}", report.state_file.display());
            println!(
                "Tasks: {} total, {} done, {} failed, {} in progress, {} pending",
                summary.total, summary.done, summary.failed, summary.in_progress, summary.pending
            );
            println!("With browser session: {}", summary.with_session);
            if let Some(updated) = summary.updated_at {
                println!("Updated at: {}", updated.to_rfc3339());
            }
            match report.loop_pid {
                Some(pid) => println!("Loop: running (pid {pid})"),
                None => println!("Loop: not running"),
            }
            for (query, error) in &summary.recent_failures {
                println!("Failed: {query}: {error}");
            }
        }
        Command::Replay(args) => {
            let token = joined(&args.token);
            match runner.replay(&token).await? {
                Some(details) => {
                    println!("Query: {}", details.query);
                    let show = |v: &Option<String>| v.clone().unwrap_or_else(|| "N/A".to_string());
                    println!("Session: {}", show(&details.session_id));
                    println!("Live view: {}", show(&details.live_view_url));
                    println!("Replay: {}", show(&details.replay_url));
                    println!("Replay hint: {}", show(&details.replay_hint));
                    println!("Finding: {}", show(&details.finding_path));
                    if args.open {
                        match details.live_view_url.as_ref().or(details.replay_url.as_ref()) {
                            Some(url) => open_in_browser(url)?,
                            None => println!("No live view or replay URL to open."),
                        }
                    }
                }
                None => println!("No replay match found for \"{token}\"."),
            }
        }
        Command::Purge => {
            let outcome = runner.purge().await?;
            let verb = if config.dry_run { "Would remove" } else { "Removed" };
            println!("{verb} {} orphaned record(s), kept {}.", outcome.removed, outcome.kept);
        }
        Command::Rerun(args) => {
            let query = joined(&args.query);
            if query.is_empty() {
                return Err(ConfigError::MissingArgument {
                    command: "rerun",
                    what: "a query",
                }
                .into());
            }
            let report = runner.run_once(RunMode::Rerun(query)).await?;
            for finding in &report.findings {
                println!("Wrote {}", finding.path.display());
            }
        }
    }
    Ok(())
}

async fn run_loop_command(runner: &Runner, args: &LoopArgs) -> Result<()> {
    if args.stop {
        let outcome = runner.stop().await?;
        println!("Loop stop: {}", outcome.as_str());
        return Ok(());
    }

    if args.daemon {
        let forwarded: Vec<String> = std::env::args()
            .skip(1)
            .filter(|arg| arg != "--daemon")
            .collect();
        let started = runner.start_daemon(&forwarded).await?;
        println!(
            "Started loop daemon (pid {}), logging to {}",
            started.pid,
            started.log_path.display()
        );
        return Ok(());
    }

    let outcome = runner.run_loop().await?;
    info!(cycles = outcome.cycles, "Loop finished");
    Ok(())
}
