use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use clap::{Parser, Subcommand};
use handoff_adapters::{
    HttpClient, HttpInputTransfer, HttpJobHandler, HttpJobRepo, HttpOutputSource,
    HttpPipelineLauncher, HttpTaskMatcher, HttpTaskRepo, TokenSigner, TokenVerifier,
};
use handoff_core::AttributeParser;
use handoff_stages::{
    maybe_build_scheduler, run_reconcile, Dispatch, InputReceiver, InputSender, Intake,
    OutputReceiver, OutputSender, Reconcile, ServiceConfig, StoreKind,
};
use handoff_storage::{JobRepository, KvStore, MemoryStore, PgStore, TaskRepository};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "handoff")]
#[command(about = "Job ownership pipeline services")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, Subcommand)]
enum Commands {
    /// Job repository backed by the configured store.
    JobRepo,
    /// Registers new input files and routes them.
    Intake,
    /// Pushes input files from the edge to the gateway.
    InputSender,
    /// Lands input files on the gateway.
    InputReceiver,
    /// Matches jobs to tasks and launches pipelines. Also hosts the task repository.
    Dispatch,
    /// Serves and archives output files on the gateway.
    OutputSender,
    /// Pulls output files back to the edge.
    OutputReceiver,
    /// Creates the Postgres store tables.
    Migrate,
}

impl Commands {
    fn name(self) -> &'static str {
        match self {
            Commands::JobRepo => "job-repo",
            Commands::Intake => "intake",
            Commands::InputSender => "input-sender",
            Commands::InputReceiver => "input-receiver",
            Commands::Dispatch => "dispatch",
            Commands::OutputSender => "output-sender",
            Commands::OutputReceiver => "output-receiver",
            Commands::Migrate => "migrate",
        }
    }
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,handoff=debug"));
    let json = std::env::var("HANDOFF_LOG_JSON")
        .is_ok_and(|v| v == "1" || v.eq_ignore_ascii_case("true"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let config = ServiceConfig::from_env();
    let service = cli.command.name();

    let signer = match &config.jwt_private_key {
        Some(path) => {
            let pem = std::fs::read(path)
                .with_context(|| format!("reading {}", path.display()))?;
            Some(
                TokenSigner::from_pem(&pem, service, config.jwt_issuer.clone())
                    .context("loading signing key")?,
            )
        }
        None => None,
    };
    let verifier = match &config.jwt_public_key {
        Some(path) => {
            let pem = std::fs::read(path)
                .with_context(|| format!("reading {}", path.display()))?;
            Some(Arc::new(
                TokenVerifier::from_pem(&pem, config.jwt_issuer.as_deref())
                    .context("loading verification key")?,
            ))
        }
        None => None,
    };
    let http = HttpClient::new(config.http_client(), signer)?;
    let jobs = Arc::new(HttpJobRepo::new(http.clone(), &config.job_repo_url));

    let (router, reconciler): (Router, Option<Arc<dyn Reconcile>>) = match cli.command {
        Commands::Migrate => return migrate(&config).await,
        Commands::JobRepo => {
            let repo = Arc::new(JobRepository::new(open_store(&config).await?));
            (handoff_web::jobs::router(repo), None)
        }
        Commands::Intake => {
            let mut intake = Intake::new(
                jobs,
                Arc::new(HttpTaskMatcher::new(http.clone(), &config.dispatch_url)),
                Arc::new(HttpJobHandler::new(http.clone(), next_url(&config, service)?)),
            );
            if let Some(path) = &config.attribute_parser {
                let parser = AttributeParser::from_path(path)
                    .with_context(|| format!("loading attribute parser {}", path.display()))?;
                intake = intake.with_attribute_parser(parser);
            }
            let intake = Arc::new(intake);
            (handoff_web::intake::router(intake.clone()), Some(intake as Arc<dyn Reconcile>))
        }
        Commands::InputSender => {
            let transfer = HttpInputTransfer::new(http.clone(), next_url(&config, service)?);
            let sender = Arc::new(InputSender::new(jobs, Arc::new(transfer), &config.hostname));
            (
                handoff_web::transfer::input_sender_router(sender.clone()),
                Some(sender as Arc<dyn Reconcile>),
            )
        }
        Commands::InputReceiver => {
            let receiver = Arc::new(InputReceiver::new(
                jobs,
                Arc::new(HttpJobHandler::new(http.clone(), &config.dispatch_url)),
                &config.input_folder,
                &config.hostname,
            ));
            (
                handoff_web::transfer::input_receiver_router(receiver.clone()),
                Some(receiver as Arc<dyn Reconcile>),
            )
        }
        Commands::Dispatch => {
            let tasks = Arc::new(TaskRepository::new(open_store(&config).await?));
            let dispatch = Dispatch::new(
                jobs,
                tasks.clone(),
                Arc::new(HttpPipelineLauncher::new(http.clone(), &config.pipeline_url)),
                Arc::new(HttpJobHandler::new(http.clone(), next_url(&config, service)?)),
                &config.hostname,
            )
            .with_callback_urls(&config.job_repo_url, &config.public_url)
            .with_window(config.retry_window());
            let dispatch = Arc::new(dispatch);
            (
                handoff_web::dispatch::router(dispatch.clone(), tasks),
                Some(dispatch as Arc<dyn Reconcile>),
            )
        }
        Commands::OutputSender => {
            let sender = Arc::new(OutputSender::new(
                jobs,
                Arc::new(HttpTaskRepo::new(http.clone(), &config.task_repo_url)),
                Arc::new(HttpJobHandler::new(http.clone(), next_url(&config, service)?)),
                &config.archive_folder,
                &config.reject_folder,
            ));
            (
                handoff_web::output::output_sender_router(sender.clone()),
                Some(sender as Arc<dyn Reconcile>),
            )
        }
        Commands::OutputReceiver => {
            // The peer here is the output sender the files are pulled from.
            let source = HttpOutputSource::new(http.clone(), next_url(&config, service)?);
            let receiver = Arc::new(OutputReceiver::new(
                jobs,
                Arc::new(source),
                &config.output_folder,
                &config.hostname,
            ));
            (
                handoff_web::output::output_receiver_router(receiver.clone()),
                Some(receiver as Arc<dyn Reconcile>),
            )
        }
    };

    let listener = TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("binding {}", config.bind))?;
    info!(service, bind = %config.bind, hostname = %config.hostname, "starting");

    let scheduler = match reconciler {
        Some(reconciler) => {
            let startup = reconciler.clone();
            tokio::spawn(async move {
                let _ = run_reconcile(startup.as_ref()).await;
            });
            maybe_build_scheduler(config.reconcile_cron.as_deref(), reconciler).await?
        }
        None => None,
    };
    if let Some(scheduler) = &scheduler {
        scheduler
            .start()
            .await
            .context("starting reconcile scheduler")?;
    }

    handoff_web::serve(listener, handoff_web::finish(router, verifier)).await
}

async fn open_store(config: &ServiceConfig) -> Result<Arc<dyn KvStore>> {
    let store: Arc<dyn KvStore> = match config.store {
        StoreKind::Memory => Arc::new(MemoryStore::new()),
        StoreKind::Postgres => Arc::new(
            PgStore::connect(&config.database_url)
                .await
                .context("connecting to postgres")?,
        ),
    };
    Ok(store)
}

async fn migrate(config: &ServiceConfig) -> Result<()> {
    let store = PgStore::connect(&config.database_url)
        .await
        .context("connecting to postgres")?;
    store.migrate().await?;
    info!("store migrations applied");
    Ok(())
}

fn next_url<'a>(config: &'a ServiceConfig, service: &str) -> Result<&'a str> {
    config
        .next_url
        .as_deref()
        .with_context(|| format!("HANDOFF_NEXT_URL must be set for {service}"))
}
