mod config;

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use clap::Parser;

use config::DroverConfig;
use drover_core::orchestrator::{AgentStatus, Orchestrator, OrchestratorConfig};

#[derive(Parser)]
#[command(
    name = "drover",
    about = "Dependency-aware orchestrator for fleets of coding agents",
    version
)]
struct Cli {
    /// Target project directory
    #[arg(long)]
    project_dir: PathBuf,

    /// Maximum number of concurrent coding agents
    #[arg(
        short = 'p',
        long,
        default_value_t = 3,
        value_parser = clap::value_parser!(u8).range(1..=5)
    )]
    max_concurrency: u8,

    /// Model identifier forwarded to workers
    #[arg(long)]
    model: Option<String>,

    /// Skip regression-testing agents
    #[arg(long)]
    yolo: bool,

    /// Number of testing agents kept re-verifying passing features
    #[arg(
        long,
        default_value_t = 1,
        value_parser = clap::value_parser!(u8).range(0..=3)
    )]
    testing_agent_ratio: u8,

    /// Worker binary (falls back to DROVER_WORKER, then the config file)
    #[arg(long)]
    worker: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    if !cli.project_dir.is_dir() {
        eprintln!(
            "error: project directory {} does not exist",
            cli.project_dir.display()
        );
        std::process::exit(1);
    }

    let resolved = DroverConfig::resolve(cli.worker.clone(), cli.model.clone())?;

    println!("Project: {}", cli.project_dir.display());
    println!("  Worker: {}", resolved.worker.display());
    println!("  Max concurrency: {}", cli.max_concurrency);
    println!("  Testing agent ratio: {}", cli.testing_agent_ratio);
    if cli.yolo {
        println!("  Yolo mode: regression testing disabled");
    }

    let orchestrator = Orchestrator::new(
        OrchestratorConfig {
            project_dir: cli.project_dir.clone(),
            worker: resolved.worker,
            max_concurrency: cli.max_concurrency as usize,
            testing_agent_ratio: cli.testing_agent_ratio as usize,
            model: resolved.model,
            yolo: cli.yolo,
        },
        Arc::new(|id, line| {
            if id == drover_core::orchestrator::INITIALIZER_FEATURE_ID {
                println!("[init] {line}");
            } else {
                println!("[#{id}] {line}");
            }
        }),
        Arc::new(|id, status: AgentStatus| {
            println!("feature {id}: {status}");
        }),
    );

    // Graceful shutdown: first signal stops the scheduler and drains,
    // second force-exits.
    let got_first_signal = Arc::new(AtomicBool::new(false));
    {
        let orchestrator = orchestrator.clone();
        let got_first = Arc::clone(&got_first_signal);
        tokio::spawn(async move {
            loop {
                tokio::signal::ctrl_c().await.ok();
                if got_first.swap(true, Ordering::SeqCst) {
                    eprintln!("\nForce exit.");
                    std::process::exit(130);
                }
                eprintln!("\nShutting down gracefully (Ctrl+C again to force)...");
                orchestrator.shutdown();
            }
        });
    }

    orchestrator.run().await?;

    if got_first_signal.load(Ordering::SeqCst) {
        println!("\nStopped before completion.");
    } else {
        let passing = orchestrator.catalog().count_passing().await?;
        println!("\nAll schedulable features complete ({passing} passing).");
    }
    Ok(())
}
