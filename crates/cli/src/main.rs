use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use bindsight_core::{
    create_upload_identifier, parse_identifier, ConservationMode, PredictorProfile,
    StructureSource, TaskConfiguration,
};
use pipeline::{
    ConservationCaches, HttpStructureFetcher, PipelineExecutor, ProcessConservationTool,
    ProcessPredictor, ProcessStructureTool, RunOutcome, TaskRunner,
};
use store::TaskStore;
use synchronization::{
    ExportConfiguration, HttpCatalogClient, HttpPredictionService, Reconciler, ReconcilerOptions,
};

const DEFAULT_WORKER_INTERVAL: u64 = 30;
const DEFAULT_QUEUE_LIMIT: usize = 4;

#[derive(Parser)]
#[command(name = "bindsight")]
#[command(about = "Binding-site prediction orchestration", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new task in the store.
    Create {
        /// Root of the task store.
        #[arg(long)]
        root: PathBuf,

        /// Store the task directly under the root without a shard
        /// directory.
        #[arg(long)]
        unsharded: bool,

        /// Accession identifier, optionally with chains: 2SRC or
        /// 2SRC_A,B.
        #[arg(long, conflicts_with_all = ["upload", "model"])]
        code: Option<String>,

        /// Structure file to upload; the task gets a generated
        /// identifier.
        #[arg(long, conflicts_with = "model")]
        upload: Option<PathBuf>,

        /// Predicted-model identifier.
        #[arg(long)]
        model: Option<String>,

        /// Conservation mode: none, alignment or hmm.
        #[arg(long, default_value = "none")]
        conservation: String,

        /// Predictor profile: default, conservation_hmm, alphafold or
        /// alphafold_conservation_hmm.
        #[arg(long, default_value = "default")]
        profile: String,
    },
    /// Execute one stored task through the prediction pipeline.
    RunTask {
        #[command(flatten)]
        pipeline: PipelineArgs,

        /// Task identifier.
        id: String,
    },
    /// Repeatedly sweep the store and execute every queued task.
    Worker {
        #[command(flatten)]
        pipeline: PipelineArgs,

        /// Seconds between sweeps.
        #[arg(long, default_value_t = DEFAULT_WORKER_INTERVAL)]
        interval: u64,
    },
    /// Run one synchronization pass against the remote catalogue and
    /// prediction service.
    Synchronize {
        /// Directory holding the index, working files and export tree.
        #[arg(long)]
        data: PathBuf,

        /// Prediction server URL, without a trailing slash.
        #[arg(long, default_value = "http://localhost:8020")]
        server: String,

        /// Prediction database name on the server.
        #[arg(long, default_value = "conservation-hmm")]
        database: String,

        /// Maximum number of records kept queued on the server.
        #[arg(long, default_value_t = DEFAULT_QUEUE_LIMIT)]
        queue_limit: usize,

        /// Reset failed records to new before the pass.
        #[arg(long)]
        retry: bool,

        /// Fetch catalogue entries from this date instead of the stored
        /// cursor, format 2021-12-01T00:00:00Z.
        #[arg(long)]
        from: Option<String>,

        /// Resource name stamped into export documents.
        #[arg(long, default_value = "bindsight")]
        data_resource: String,

        /// Predictor version stamped into export documents.
        #[arg(long)]
        predictor_version: String,
    },
}

#[derive(Args)]
struct PipelineArgs {
    /// Root of the task store.
    #[arg(long)]
    root: PathBuf,

    /// Directory for advisory lock files; defaults to `{root}/.locks`.
    #[arg(long)]
    lock_directory: Option<PathBuf>,

    /// Store tasks directly under the root without shard directories.
    #[arg(long)]
    unsharded: bool,

    /// Root of the conservation cache; caching is off when absent.
    #[arg(long)]
    conservation_cache: Option<PathBuf>,

    /// Structure manipulation executable.
    #[arg(long)]
    structure_tool: PathBuf,

    /// Structure summary executable.
    #[arg(long)]
    structure_info_tool: PathBuf,

    /// Conservation pipeline executable.
    #[arg(long)]
    conservation_tool: PathBuf,

    /// Predictor executable.
    #[arg(long)]
    predictor: PathBuf,

    /// Keep the working subtree of successful tasks.
    #[arg(long)]
    keep_working: bool,

    /// Reuse outputs of already-finished stages.
    #[arg(long)]
    lazy: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Create {
            root,
            unsharded,
            code,
            upload,
            model,
            conservation,
            profile,
        } => {
            create_task(
                root,
                unsharded,
                code,
                upload,
                model,
                &conservation,
                &profile,
            )
            .await
        }
        Commands::RunTask { pipeline, id } => run_task(pipeline, &id).await,
        Commands::Worker { pipeline, interval } => worker(pipeline, interval).await,
        Commands::Synchronize {
            data,
            server,
            database,
            queue_limit,
            retry,
            from,
            data_resource,
            predictor_version,
        } => {
            synchronize(
                data,
                server,
                database,
                queue_limit,
                retry,
                from,
                data_resource,
                predictor_version,
            )
            .await
        }
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "bindsight=info,pipeline=info,store=info,synchronization=info".into()
            }),
        )
        .init();
}

fn build_runner(args: &PipelineArgs) -> TaskRunner {
    let store = if args.unsharded {
        TaskStore::unsharded(&args.root)
    } else {
        TaskStore::new(&args.root)
    };
    let lock_directory = args
        .lock_directory
        .clone()
        .unwrap_or_else(|| args.root.join(".locks"));
    let caches = match &args.conservation_cache {
        Some(directory) => ConservationCaches::rooted(directory),
        None => ConservationCaches::disabled(),
    };
    let executor = PipelineExecutor::new(
        Arc::new(HttpStructureFetcher::new()),
        Arc::new(ProcessStructureTool::new(
            &args.structure_tool,
            &args.structure_info_tool,
        )),
        Arc::new(ProcessConservationTool::new(&args.conservation_tool)),
        Arc::new(ProcessPredictor::new(&args.predictor)),
        caches,
    );
    TaskRunner::new(store, lock_directory, Arc::new(executor))
        .with_keep_working(args.keep_working)
        .with_lazy(args.lazy)
}

#[allow(clippy::too_many_arguments)]
async fn create_task(
    root: PathBuf,
    unsharded: bool,
    code: Option<String>,
    upload: Option<PathBuf>,
    model: Option<String>,
    conservation: &str,
    profile: &str,
) -> Result<()> {
    let conservation = match conservation {
        "none" => ConservationMode::None,
        "alignment" => ConservationMode::Alignment,
        "hmm" => ConservationMode::Hmm,
        other => return Err(anyhow!("unknown conservation mode: {other}")),
    };
    let profile = match profile {
        "default" => PredictorProfile::Default,
        "conservation_hmm" => PredictorProfile::ConservationHmm,
        "alphafold" => PredictorProfile::Alphafold,
        "alphafold_conservation_hmm" => PredictorProfile::AlphafoldConservationHmm,
        other => return Err(anyhow!("unknown predictor profile: {other}")),
    };

    let store = if unsharded {
        TaskStore::unsharded(&root)
    } else {
        TaskStore::new(&root)
    };

    let (id, configuration, upload_source) = if let Some(identifier) = code {
        let (code, chains) = parse_identifier(&identifier);
        let id = if chains.is_empty() {
            code.clone()
        } else {
            format!("{code}_{}", chains.join(","))
        };
        let configuration =
            TaskConfiguration::new(StructureSource::AccessionCode { code }).with_chains(chains);
        (id, configuration, None)
    } else if let Some(file) = upload {
        let name = file
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .ok_or_else(|| anyhow!("upload path has no file name"))?;
        let configuration = TaskConfiguration::new(StructureSource::UploadedFile { file: name });
        (create_upload_identifier(), configuration, Some(file))
    } else if let Some(id) = model {
        let configuration =
            TaskConfiguration::new(StructureSource::PredictedModel { id: id.clone() });
        (id, configuration, None)
    } else {
        return Err(anyhow!("one of --code, --upload or --model is required"));
    };

    let configuration = configuration
        .with_conservation(conservation)
        .with_profile(profile);
    configuration.validate()?;

    let info = store
        .create(&id, &configuration, serde_json::Map::new())
        .await?;
    if let Some(source) = upload_source {
        let input = store.input_directory(&id)?;
        let name = source.file_name().unwrap_or_default();
        tokio::fs::copy(&source, input.join(name)).await?;
    }
    info!(task_id = %info.id, status = info.status.as_str(), "Task created");
    Ok(())
}

async fn run_task(args: PipelineArgs, id: &str) -> Result<()> {
    std::fs::create_dir_all(
        args.lock_directory
            .clone()
            .unwrap_or_else(|| args.root.join(".locks")),
    )?;
    let runner = build_runner(&args);
    match runner.run(id).await? {
        RunOutcome::Completed => {
            info!(task_id = %id, "Task completed");
            Ok(())
        }
        RunOutcome::AlreadyDone => {
            info!(task_id = %id, "Task already finished");
            Ok(())
        }
        RunOutcome::AlreadyRunning => {
            warn!(task_id = %id, "Task is locked by another worker");
            Ok(())
        }
        RunOutcome::Failed => Err(anyhow!("task {id} failed, see its log artifact")),
    }
}

async fn worker(args: PipelineArgs, interval: u64) -> Result<()> {
    std::fs::create_dir_all(
        args.lock_directory
            .clone()
            .unwrap_or_else(|| args.root.join(".locks")),
    )?;
    let runner = build_runner(&args);
    info!(root = %args.root.display(), interval = interval, "Worker started");
    loop {
        match runner.run_pending().await {
            Ok(completed) if completed > 0 => {
                info!(completed = completed, "Sweep done");
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Sweep failed"),
        }
        tokio::time::sleep(Duration::from_secs(interval)).await;
    }
}

#[allow(clippy::too_many_arguments)]
async fn synchronize(
    data: PathBuf,
    server: String,
    database: String,
    queue_limit: usize,
    retry: bool,
    from: Option<String>,
    data_resource: String,
    predictor_version: String,
) -> Result<()> {
    let url_template = format!("{server}/analyze/?database={database}&code={{}}");
    let reconciler = Reconciler::new(
        data,
        Arc::new(HttpCatalogClient::new()),
        Arc::new(HttpPredictionService::new(server).with_database(database)),
        ExportConfiguration::new(data_resource, url_template, predictor_version),
        ReconcilerOptions {
            queue_limit,
            retry_failed: retry,
            since: from,
        },
    );
    let summary = reconciler.run_pass().await?;
    info!(
        imported = summary.imported,
        reverted = summary.reverted,
        "Synchronization pass done"
    );
    Ok(())
}
