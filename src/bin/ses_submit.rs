use anyhow::{bail, Context, Result};
use chrono::{FixedOffset, NaiveDate, Utc};
use clap::{Args, Parser, Subcommand};
use hospedajes_submission::config::{AppConfig, TelemetryConfig};
use hospedajes_submission::telemetry;
use hospedajes_submission::{
    CheckInId, CheckInRecord, ConnectionCheck, DocumentBuilder, DriverDeps, EnvelopePackager,
    InMemoryCheckInStore, InMemoryLedger, InMemoryTaskQueue, LogNotifier, MunicipalityTable,
    ReconciliationJob, SesClient, SubmissionDriver, TaskQueue, Trigger,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Parser, Debug)]
#[command(
    name = "ses-submit",
    about = "Render, package and submit guest registrations to SES.Hospedajes",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the registration XML for one check-in
    Render(RenderArgs),
    /// Print the SOAP envelope that would be sent for one check-in
    Package(PackageArgs),
    /// Submit check-ins immediately
    Submit(SubmitArgs),
    /// Submit every unacknowledged check-in arriving on a day
    Reconcile(ReconcileArgs),
    /// Schedule check-ins and process the queue until it drains
    Worker(WorkerArgs),
    /// Check the configured credentials against the registry
    Validate,
}

#[derive(Args, Debug)]
struct Inputs {
    /// JSON file with a check-in record or an array of them
    #[arg(long)]
    check_ins: PathBuf,
    /// JSON municipality reference table
    #[arg(long)]
    municipalities: PathBuf,
}

#[derive(Args, Debug)]
struct RenderArgs {
    #[command(flatten)]
    inputs: Inputs,
    /// Establishment code reported in the document
    #[arg(long)]
    establishment_code: String,
    /// Check-in to render (defaults to the first in the file)
    #[arg(long)]
    id: Option<String>,
}

#[derive(Args, Debug)]
struct PackageArgs {
    #[command(flatten)]
    render: RenderArgs,
    /// Landlord code for the envelope header
    #[arg(long)]
    landlord_code: String,
}

#[derive(Args, Debug)]
struct SubmitArgs {
    #[command(flatten)]
    inputs: Inputs,
    /// Only submit this check-in
    #[arg(long)]
    id: Option<String>,
}

#[derive(Args, Debug)]
struct ReconcileArgs {
    #[command(flatten)]
    inputs: Inputs,
    /// Arrival date to reconcile (YYYY-MM-DD, defaults to tomorrow)
    #[arg(long, value_parser = parse_date)]
    date: Option<NaiveDate>,
    /// Check-ins processed in parallel
    #[arg(long, default_value_t = 4)]
    concurrency: usize,
}

#[derive(Args, Debug)]
struct WorkerArgs {
    #[command(flatten)]
    inputs: Inputs,
    /// Seconds between queue polls
    #[arg(long, default_value_t = 5)]
    poll_secs: u64,
    /// Tasks processed in parallel
    #[arg(long, default_value_t = 4)]
    concurrency: usize,
}

#[tokio::main]
async fn main() {
    if let Err(err) = run_cli().await {
        eprintln!("application error: {err:#}");
        std::process::exit(1);
    }
}

async fn run_cli() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Render(args) => {
            telemetry::init(&TelemetryConfig::default())?;
            let xml = render(&args)?;
            println!("{xml}");
            Ok(())
        }
        Command::Package(args) => {
            telemetry::init(&TelemetryConfig::default())?;
            let xml = render(&args.render)?;
            let envelope = EnvelopePackager::new(args.landlord_code).package(&xml)?;
            println!("{}", envelope.soap);
            Ok(())
        }
        Command::Submit(args) => run_submit(args).await,
        Command::Reconcile(args) => run_reconcile(args).await,
        Command::Worker(args) => run_worker(args).await,
        Command::Validate => run_validate().await,
    }
}

fn parse_date(raw: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|err| format!("failed to parse '{raw}' as YYYY-MM-DD ({err})"))
}

fn load_check_ins(path: &Path) -> Result<Vec<CheckInRecord>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading check-ins from {}", path.display()))?;
    let value: serde_json::Value = serde_json::from_str(&raw)
        .with_context(|| format!("parsing {}", path.display()))?;
    let records = match value {
        serde_json::Value::Array(_) => serde_json::from_value(value)?,
        _ => vec![serde_json::from_value(value)?],
    };
    Ok(records)
}

fn load_municipalities(path: &Path) -> Result<Arc<MunicipalityTable>> {
    let table = MunicipalityTable::load(path)
        .with_context(|| format!("loading municipalities from {}", path.display()))?;
    info!(entries = table.len(), "municipality table loaded");
    Ok(Arc::new(table))
}

fn render(args: &RenderArgs) -> Result<String> {
    let records = load_check_ins(&args.inputs.check_ins)?;
    let record = match &args.id {
        Some(id) => records.iter().find(|r| r.id.as_str() == id),
        None => records.first(),
    };
    let Some(record) = record else {
        bail!("check-in not found in {}", args.inputs.check_ins.display());
    };

    let builder = DocumentBuilder::new(
        args.establishment_code.clone(),
        load_municipalities(&args.inputs.municipalities)?,
    );
    Ok(builder.build(record)?)
}

struct Pipeline {
    driver: Arc<SubmissionDriver>,
    store: Arc<InMemoryCheckInStore>,
    ledger: Arc<InMemoryLedger>,
    queue: Arc<InMemoryTaskQueue>,
    local_offset: FixedOffset,
    ids: Vec<CheckInId>,
}

fn pipeline(inputs: &Inputs) -> Result<Pipeline> {
    let config = AppConfig::from_env()?;
    telemetry::init(&config.telemetry)?;
    info!(?config, "configuration loaded");

    let store = Arc::new(InMemoryCheckInStore::new());
    let mut ids = Vec::new();
    for record in load_check_ins(&inputs.check_ins)? {
        ids.push(record.id.clone());
        store.insert(record);
    }

    let ledger = Arc::new(InMemoryLedger::new());
    let queue = Arc::new(InMemoryTaskQueue::new());
    let transport = Arc::new(SesClient::new(config.client.clone())?);

    let driver = SubmissionDriver::new(
        DriverDeps {
            store: store.clone(),
            ledger: ledger.clone(),
            transport,
            queue: queue.clone(),
            notifier: Arc::new(LogNotifier),
        },
        DocumentBuilder::new(
            config.establishment_code.clone(),
            load_municipalities(&inputs.municipalities)?,
        ),
        EnvelopePackager::new(config.landlord_code.clone()),
        config.retry.clone(),
        config.schedule.clone(),
    );

    Ok(Pipeline {
        driver: Arc::new(driver),
        store,
        ledger,
        queue,
        local_offset: config.local_offset,
        ids,
    })
}

async fn run_submit(args: SubmitArgs) -> Result<()> {
    let pipeline = pipeline(&args.inputs)?;
    let ids = match args.id {
        Some(id) => vec![CheckInId::new(id)],
        None => pipeline.ids.clone(),
    };

    for id in ids {
        let outcome = pipeline
            .driver
            .submit_now(&id, Utc::now(), Trigger::Manual)
            .await;
        match outcome {
            Ok(outcome) => println!("{id}: {outcome:?}"),
            Err(e) => println!("{id}: {e}"),
        }
    }
    Ok(())
}

async fn run_reconcile(args: ReconcileArgs) -> Result<()> {
    let pipeline = pipeline(&args.inputs)?;
    let job = ReconciliationJob::new(
        pipeline.store.clone(),
        pipeline.ledger.clone(),
        pipeline.driver.clone(),
    )
    .with_concurrency(args.concurrency)
    .with_local_offset(pipeline.local_offset);

    let report = job.run(args.date, Utc::now()).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn run_worker(args: WorkerArgs) -> Result<()> {
    let pipeline = pipeline(&args.inputs)?;

    for id in &pipeline.ids {
        match pipeline.driver.schedule(id, Utc::now()).await {
            Ok(receipt) => info!(check_in_id = %id, eta = %receipt.eta, "scheduled"),
            Err(e) => tracing::warn!(check_in_id = %id, error = %e, "not scheduled"),
        }
    }

    let poll = Duration::from_secs(args.poll_secs.max(1));
    loop {
        let queue: &dyn TaskQueue = pipeline.queue.as_ref();
        let results = pipeline
            .driver
            .run_due(queue, Utc::now(), args.concurrency)
            .await?;
        for (task, result) in results {
            match result {
                Ok(outcome) => info!(check_in_id = %task.check_in_id, ?outcome, "task finished"),
                Err(e) => tracing::error!(check_in_id = %task.check_in_id, error = %e, "task failed"),
            }
        }

        tracing::debug!(tracked = pipeline.driver.tracked(), pending = pipeline.queue.len(), "poll finished");

        if pipeline.queue.is_empty() {
            info!("queue drained");
            return Ok(());
        }

        tokio::select! {
            _ = tokio::time::sleep(poll) => {}
            _ = tokio::signal::ctrl_c() => {
                info!(pending = pipeline.queue.len(), "interrupted, leaving pending tasks");
                return Ok(());
            }
        }
    }
}

async fn run_validate() -> Result<()> {
    let config = AppConfig::from_env()?;
    telemetry::init(&config.telemetry)?;

    let client = SesClient::new(config.client.clone())?;
    // the check guest lives abroad, so no municipality table is needed
    let check = ConnectionCheck::new(
        DocumentBuilder::new(
            config.establishment_code.clone(),
            Arc::new(MunicipalityTable::new(Vec::new())),
        ),
        EnvelopePackager::new(config.landlord_code.clone()),
    );

    let today = Utc::now().with_timezone(&config.local_offset).date_naive();
    let result = check.run(&client, today, config.local_offset).await?;
    if !result.valid {
        bail!("credential check failed: {}", result.message);
    }
    println!("{}", result.message);
    Ok(())
}
