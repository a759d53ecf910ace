use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::json;
use tracing::info;
use tracing_subscriber::EnvFilter;

use atelier::cli::{Cli, Command, KindArg, TierArg};
use atelier::collaborators::{MemoryBlobStore, MemoryJobStore, RecordingNotifier};
use atelier::provider::{FixtureProvider, StatusResponse, TaskStatus, build_provider};
use atelier::ui::{self, JobProgress};
use atelier::{AuditRecord, Collaborators, Credits, Engine, EngineConfig, JobKind, JobRequest, Tier};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut config = EngineConfig::load(cli.config.as_deref())?;
    if let Some(workers) = cli.workers {
        config.queue.workers = workers;
        config.validate()?;
    }

    match cli.command {
        Command::Run {
            kind,
            account,
            balance,
            tier,
            input,
            no_refine,
        } => {
            let balance = Credits::try_from(balance).map_err(anyhow::Error::msg)?;
            run_single(&config, kind, tier, &account, balance, input.as_deref(), no_refine).await
        }
        Command::Demo { jobs } => run_demo(&config, jobs).await,
        Command::Costs => {
            ui::print_costs(&config.costs);
            Ok(())
        }
    }
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("atelier=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("atelier=info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn content_type_for(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("webp") => "image/webp",
        _ => "application/octet-stream",
    }
}

async fn run_single(
    config: &EngineConfig,
    kind: KindArg,
    tier: TierArg,
    account: &str,
    balance: Credits,
    input: Option<&Path>,
    no_refine: bool,
) -> Result<()> {
    let provider = build_provider(&config.provider)?;
    let engine = Engine::new(config, provider, Collaborators::in_memory());
    engine.ledger().grant(account, balance, "cli");

    let (bytes, content_type) = match input {
        Some(path) => (
            std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?,
            content_type_for(path),
        ),
        None => (b"sample".to_vec(), "application/octet-stream"),
    };
    let kind = JobKind::from(kind);
    let mut req = JobRequest::new(account, kind, Tier::from(tier)).with_input(bytes, content_type);
    if no_refine {
        req.payload.refine = Some(false);
    }

    let progress = JobProgress::start(kind, account);
    if let Err(err) = engine.admit(req).await {
        progress.reject(&err);
        return Err(err.into());
    }

    progress.update(&format!("{kind} for {account}: running"));
    let job = engine
        .run_once()
        .await?
        .context("admitted job was not found in the queue")?;
    progress.complete(&job);
    progress.print_audit(&AuditRecord::from_job(&job));

    if let Some(snapshot) = engine.ledger().account(account) {
        println!();
        ui::print_balance(account, &snapshot);
    }
    Ok(())
}

async fn run_demo(config: &EngineConfig, jobs: usize) -> Result<()> {
    let mut config = config.clone();
    config.poll.default_interval_ms = config.poll.default_interval_ms.min(250);
    config.rate_limit.min_interval_ms = config.rate_limit.min_interval_ms.min(100);

    let provider = Arc::new(
        FixtureProvider::new()
            .with_processing_polls(2)
            .with_remaining_quota(500),
    );
    // The first status query reports a failed task, so one job fails and
    // its credits are released.
    provider.push_status(Ok(StatusResponse {
        status: TaskStatus::Failed,
        error: Some(json!({ "message": "no face detected" })),
        ..Default::default()
    }));

    let store = Arc::new(MemoryJobStore::new());
    let notifier = Arc::new(RecordingNotifier::new());
    let engine = Engine::new(
        &config,
        provider,
        Collaborators {
            jobs: store,
            blobs: Arc::new(MemoryBlobStore::new()),
            notifier: notifier.clone(),
        },
    );

    let accounts = ["alice", "bob", "studio"];
    engine.ledger().grant("alice", Credits::whole(12), "demo");
    engine.ledger().grant("bob", Credits::whole(4), "demo");
    engine.ledger().open_account("studio", true);

    let mut admitted = Vec::new();
    for i in 0..jobs {
        let account = accounts[i % accounts.len()];
        let kind = JobKind::ALL[i % JobKind::ALL.len()];
        let tier = if i % 3 == 0 { Tier::High } else { Tier::Normal };
        let input = format!("upload-{i}").into_bytes();
        let req = JobRequest::new(account, kind, tier).with_input(input, "image/png");
        match engine.admit(req).await {
            Ok(id) => admitted.push(id),
            Err(err) => println!(
                "  {} {kind} for {account}: {err} ({})",
                console::style("rejected").red(),
                err.kind().guidance()
            ),
        }
    }

    info!(admitted = admitted.len(), workers = config.queue.workers, "demo started");
    engine.spawn_workers(config.queue.workers);
    engine.shutdown().await;

    println!();
    for id in admitted {
        if let Some(job) = engine.job(id).await? {
            ui::print_summary(&job);
        }
    }

    println!();
    for account in accounts {
        if let Some(snapshot) = engine.ledger().account(account) {
            ui::print_balance(account, &snapshot);
        }
    }
    println!(
        "\n  notifications sent: {}, provider quota left: {}",
        notifier.events().len(),
        engine
            .provider_quota()
            .map_or_else(|| "unknown".to_string(), |q| q.to_string())
    );
    Ok(())
}
