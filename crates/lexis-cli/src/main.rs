use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use lexis_assets::MatchingRules;
use lexis_core::KeyMode;
use lexis_reconcile::{Phase, ReconcileConfig, Reconciler, RunSummary};
use lexis_storage::{
    AssetIndex, BucketAssetIndex, BucketConfig, DirAssetIndex, PgRecordStore, RecordStore,
    RetryingStore, SnapshotStore,
};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "lexis")]
#[command(about = "Duplicate resolution and asset matching for the lexis content store")]
#[command(version)]
struct Cli {
    #[command(flatten)]
    run: RunArgs,
    #[command(subcommand)]
    command: Commands,
}

/// Overrides for values otherwise read from the environment.
#[derive(Debug, Args)]
struct RunArgs {
    /// Postgres connection string
    #[arg(long, global = true)]
    database_url: Option<String>,
    /// Rehearse against a JSON export instead of the database; nothing is written back
    #[arg(long, global = true, env = "LEXIS_SNAPSHOT", conflicts_with = "database_url")]
    snapshot: Option<PathBuf>,
    #[arg(long, global = true)]
    page_size: Option<usize>,
    #[arg(long, global = true)]
    batch_size: Option<usize>,
    #[arg(long, global = true)]
    batch_delay_ms: Option<u64>,
    #[arg(long, global = true)]
    max_retries: Option<usize>,
    /// Include token position in the duplicate key
    #[arg(long, global = true)]
    key_with_position: bool,
    /// Report planned writes without issuing them
    #[arg(long, global = true)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct AssetArgs {
    #[arg(long)]
    rules: Option<PathBuf>,
    /// Local asset directory
    #[arg(long, conflicts_with = "bucket_url")]
    assets_dir: Option<PathBuf>,
    /// Object storage base URL
    #[arg(long)]
    bucket_url: Option<String>,
    #[arg(long)]
    bucket: Option<String>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Report duplicate groups without writing
    Detect,
    /// Delete non-canonical token duplicates
    Delete,
    /// Re-fetch and report residual duplicate keys
    Verify,
    /// Delete tokens whose section is missing
    Orphans,
    /// Merge duplicate sections and relink their tokens
    Sections,
    /// Attach assets to tokens that lack one
    MatchAssets(AssetArgs),
    /// Run sections, orphans, delete and verify in order
    Reconcile,
}

impl Commands {
    fn name(&self) -> &'static str {
        match self {
            Commands::Detect => "detect",
            Commands::Delete => "delete",
            Commands::Verify => "verify",
            Commands::Orphans => "orphans",
            Commands::Sections => "sections",
            Commands::MatchAssets(_) => "match-assets",
            Commands::Reconcile => "reconcile",
        }
    }

    fn phases(&self) -> &'static [Phase] {
        match self {
            Commands::Detect => &[Phase::Detect],
            Commands::Delete => &[Phase::Delete],
            Commands::Verify => &[Phase::Verify],
            Commands::Orphans => &[Phase::Orphans],
            Commands::Sections => &[Phase::Sections],
            Commands::MatchAssets(_) => &[],
            Commands::Reconcile => &Phase::RECONCILE,
        }
    }
}

fn build_config(args: &RunArgs, command: &Commands) -> ReconcileConfig {
    let mut config = ReconcileConfig::from_env();
    if let Some(url) = &args.database_url {
        config.database_url = Some(url.clone());
    }
    if let Some(page_size) = args.page_size {
        config.page_size = page_size;
    }
    if let Some(batch_size) = args.batch_size {
        config.batch_size = batch_size;
    }
    if let Some(ms) = args.batch_delay_ms {
        config.batch_delay = Duration::from_millis(ms);
    }
    if let Some(max_retries) = args.max_retries {
        config.max_retries = max_retries;
    }
    if args.key_with_position {
        config.key_mode = KeyMode::TextSectionPosition;
    }
    config.dry_run |= args.dry_run;
    if let Commands::MatchAssets(assets) = command {
        if let Some(rules) = &assets.rules {
            config.rules_path = rules.clone();
        }
        if let Some(dir) = &assets.assets_dir {
            config.assets_dir = Some(dir.clone());
            config.asset_bucket_url = None;
        }
        if let Some(url) = &assets.bucket_url {
            config.asset_bucket_url = Some(url.clone());
            config.assets_dir = None;
        }
        if let Some(bucket) = &assets.bucket {
            config.asset_bucket = Some(bucket.clone());
        }
    }
    config
}

async fn open_store(
    snapshot: Option<&PathBuf>,
    config: &ReconcileConfig,
) -> Result<Option<Box<dyn RecordStore>>> {
    let policy = config.retry_policy();
    if let Some(path) = snapshot {
        info!(path = %path.display(), "rehearsing against snapshot");
        let store = SnapshotStore::from_json_file(path).await?;
        return Ok(Some(Box::new(RetryingStore::new(store, policy))));
    }
    let Some(url) = config.database_url.as_deref() else {
        return Ok(None);
    };
    let store = PgRecordStore::connect(url).await?;
    Ok(Some(Box::new(RetryingStore::new(store, policy))))
}

fn open_asset_index(config: &ReconcileConfig) -> Result<Option<Box<dyn AssetIndex>>> {
    if let Some(dir) = &config.assets_dir {
        return Ok(Some(Box::new(DirAssetIndex::new(dir.clone()))));
    }
    match (&config.asset_bucket_url, &config.asset_bucket) {
        (Some(url), Some(bucket)) => {
            let mut bucket_config = BucketConfig::new(url.clone(), bucket.clone());
            bucket_config.api_key = config.asset_bucket_key.clone();
            bucket_config.timeout = Duration::from_secs(config.http_timeout_secs);
            bucket_config.retry = config.retry_policy();
            let index = BucketAssetIndex::new(bucket_config).context("building bucket client")?;
            Ok(Some(Box::new(index)))
        }
        _ => Ok(None),
    }
}

async fn execute(cli: &Cli, config: &ReconcileConfig) -> Result<RunSummary> {
    let command = cli.command.name();
    let Some(store) = open_store(cli.run.snapshot.as_ref(), config).await? else {
        return Ok(RunSummary::configuration_failure(
            command,
            config.dry_run,
            "no record store: set DATABASE_URL or pass --snapshot",
        ));
    };
    let reconciler = Reconciler::new(store.as_ref(), config);

    if let Commands::MatchAssets(_) = cli.command {
        let rules = match MatchingRules::from_path(&config.rules_path) {
            Ok(rules) => rules,
            Err(err) => return Ok(RunSummary::configuration_failure(command, config.dry_run, err)),
        };
        let Some(index) = open_asset_index(config)? else {
            return Ok(RunSummary::configuration_failure(
                command,
                config.dry_run,
                "no asset index: set LEXIS_ASSETS_DIR or LEXIS_ASSET_BUCKET_URL and LEXIS_ASSET_BUCKET",
            ));
        };
        return Ok(reconciler.match_assets(index.as_ref(), &rules).await);
    }

    Ok(reconciler.run(command, cli.command.phases()).await)
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "lexis=info,lexis_core=info,lexis_storage=info,lexis_assets=info,lexis_reconcile=info"
                    .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = build_config(&cli.run, &cli.command);

    let summary = match execute(&cli, &config).await {
        Ok(summary) => summary,
        Err(err) => RunSummary::aborted(cli.command.name(), config.dry_run, err),
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);
    info!(
        run_id = %summary.run_id,
        command = %summary.command,
        clean = summary.is_clean(),
        "run finished"
    );
    Ok(ExitCode::from(summary.exit_code()))
}
