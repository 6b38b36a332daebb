use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use fipe_adapters::{with_browser, ApiCatalog, BrowserCatalog, Navigator};
use fipe_core::VehicleType;
use fipe_storage::{with_session, DbSession};
use fipe_sync::export::{export_brands, export_models, BRANDS_EXPORT_FILE, MODELS_EXPORT_FILE};
use fipe_sync::snapshot::{compare_brands, compare_brands_inverse, compare_models, ComparisonSummary};
use fipe_sync::{seed_periods, SourceKind, Stage, SyncConfig, SyncOptions, SyncPipeline, SyncRunSummary};
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "fipe-cli")]
#[command(about = "Reconciles the FIPE vehicle catalog into PostgreSQL")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Where catalog content is read from.
    #[arg(long, global = true, default_value = "browser")]
    source: SourceKind,

    /// Limit scoped stages to one vehicle type (car, truck, motorcycle).
    #[arg(long = "vehicle-type", global = true)]
    vehicle_type: Option<VehicleType>,

    /// Limit scoped stages to one stored period, e.g. `março/2025`.
    #[arg(long, global = true)]
    period: Option<String>,

    /// Limit scoped stages to the newest N stored periods.
    #[arg(long, global = true)]
    latest: Option<usize>,

    /// Compute deltas without writing to the store.
    #[arg(long, global = true)]
    dry_run: bool,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Every stage in order: periods, brands, models, years.
    Run,
    Migrate,
    /// Insert the periods of one year without consulting the catalog.
    SeedPeriods {
        #[arg(long)]
        year: i32,
        #[arg(long, value_delimiter = ',', required = true)]
        months: Vec<u32>,
    },
    SyncPeriods,
    SyncBrands,
    /// Models of brands that have none stored yet.
    SyncModels,
    SyncYears,
    ExportBrands {
        #[arg(long, default_value = BRANDS_EXPORT_FILE)]
        out: PathBuf,
    },
    ExportModels {
        #[arg(long, default_value = MODELS_EXPORT_FILE)]
        out: PathBuf,
    },
    /// Brands only in the catalog extract, as SQL inserts.
    CompareBrands {
        #[arg(long, default_value = BRANDS_EXPORT_FILE)]
        catalog: PathBuf,
        #[arg(long, default_value = "marcas_ojc.csv")]
        reference: PathBuf,
        #[arg(long, default_value = ".")]
        out_dir: PathBuf,
    },
    /// Brands only in the reference extract, as CSV.
    CompareBrandsInverse {
        #[arg(long, default_value = BRANDS_EXPORT_FILE)]
        catalog: PathBuf,
        #[arg(long, default_value = "marcas_ojc.csv")]
        reference: PathBuf,
        #[arg(long, default_value = ".")]
        out_dir: PathBuf,
    },
    CompareModels {
        #[arg(long, default_value = MODELS_EXPORT_FILE)]
        catalog: PathBuf,
        #[arg(long, default_value = "modelos_ojc.csv")]
        reference: PathBuf,
        #[arg(long, default_value = ".")]
        out_dir: PathBuf,
    },
}

impl Commands {
    fn log_name(&self) -> &'static str {
        match self {
            Commands::Run => "run",
            Commands::Migrate => "migrate",
            Commands::SeedPeriods { .. } => "seed-periods",
            Commands::SyncPeriods => "sync-periods",
            Commands::SyncBrands => "sync-brands",
            Commands::SyncModels => "sync-models",
            Commands::SyncYears => "sync-years",
            Commands::ExportBrands { .. } => "export-brands",
            Commands::ExportModels { .. } => "export-models",
            Commands::CompareBrands { .. } => "compare-brands",
            Commands::CompareBrandsInverse { .. } => "compare-brands-inverse",
            Commands::CompareModels { .. } => "compare-models",
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = SyncConfig::from_env();
    let command = cli.command.unwrap_or(Commands::Run);
    init_logging(&config.log_dir, command.log_name())?;

    let options = SyncOptions {
        vehicle_types: cli
            .vehicle_type
            .map(|t| vec![t])
            .unwrap_or_else(|| VehicleType::ALL.to_vec()),
        period: cli.period,
        latest: cli.latest,
        dry_run: cli.dry_run,
    };

    match command {
        Commands::Run => {
            let stages = [Stage::Periods, Stage::Brands, Stage::Models, Stage::Years];
            let summary = run_stages(&config, cli.source, options, &stages).await?;
            print_summary(&summary);
        }
        Commands::Migrate => {
            let mut db = config.db_config();
            db.run_migrations = false;
            let session = DbSession::open(&db).await.context("opening database session")?;
            let migrated = session.migrate().await.context("applying migrations");
            session.close().await;
            migrated?;
            println!("migrations applied");
        }
        Commands::SeedPeriods { year, months } => {
            let dry_run = options.dry_run;
            let report = with_session(&config.db_config(), |store| async move {
                Ok(seed_periods(&store, year, &months, dry_run).await)
            })
            .await?;
            println!("{}: {:?}", report.unit, report.outcome);
        }
        Commands::SyncPeriods => {
            let summary = run_stages(&config, cli.source, options, &[Stage::Periods]).await?;
            print_summary(&summary);
        }
        Commands::SyncBrands => {
            let summary = run_stages(&config, cli.source, options, &[Stage::Brands]).await?;
            print_summary(&summary);
        }
        Commands::SyncModels => {
            let summary = run_stages(&config, cli.source, options, &[Stage::Models]).await?;
            print_summary(&summary);
        }
        Commands::SyncYears => {
            let summary = run_stages(&config, cli.source, options, &[Stage::Years]).await?;
            print_summary(&summary);
        }
        Commands::ExportBrands { out } => {
            let rows = with_session(&config.db_config(), |store| async move {
                export_brands(&store, &out).await
            })
            .await?;
            println!("exported {rows} brands");
        }
        Commands::ExportModels { out } => {
            let rows = with_session(&config.db_config(), |store| async move {
                export_models(&store, &out).await
            })
            .await?;
            println!("exported {rows} models");
        }
        Commands::CompareBrands {
            catalog,
            reference,
            out_dir,
        } => {
            let summary = compare_brands(&catalog, &reference, &out_dir, Utc::now())?;
            print_comparison(&summary);
        }
        Commands::CompareBrandsInverse {
            catalog,
            reference,
            out_dir,
        } => {
            let summary = compare_brands_inverse(&catalog, &reference, &out_dir, Utc::now())?;
            print_comparison(&summary);
        }
        Commands::CompareModels {
            catalog,
            reference,
            out_dir,
        } => {
            let summary = compare_models(&catalog, &reference, &out_dir, Utc::now())?;
            print_comparison(&summary);
        }
    }

    Ok(())
}

/// One store session and one catalog session for the whole run.
async fn run_stages(
    config: &SyncConfig,
    source: SourceKind,
    options: SyncOptions,
    stages: &[Stage],
) -> Result<SyncRunSummary> {
    info!(%source, ?stages, "starting sync");
    with_session(&config.db_config(), |store| async move {
        match source {
            SourceKind::Browser => {
                with_browser(&config.browser_config(), |page| async move {
                    let catalog = BrowserCatalog::new(
                        Navigator::new(page, config.wait_policy()),
                        config.retry_policy(),
                    );
                    SyncPipeline::new(&store, &catalog, &config.reports_dir)
                        .with_options(options)
                        .run_once(stages)
                        .await
                })
                .await
            }
            SourceKind::Api => {
                let catalog = ApiCatalog::new(config.api_config())?;
                SyncPipeline::new(&store, &catalog, &config.reports_dir)
                    .with_options(options)
                    .run_once(stages)
                    .await
            }
        }
    })
    .await
}

fn init_logging(log_dir: &Path, command: &str) -> Result<()> {
    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("creating log directory {}", log_dir.display()))?;
    let path = log_dir.join(format!("{command}.log"));
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("opening log file {}", path.display()))?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
        .try_init()
        .context("installing log subscriber")?;
    Ok(())
}

fn print_summary(summary: &SyncRunSummary) {
    println!(
        "sync complete: run_id={} source={} units={} inserted={} up_to_date={} failed={} reports={}",
        summary.run_id,
        summary.source,
        summary.totals.units,
        summary.totals.inserted,
        summary.totals.up_to_date,
        summary.totals.failed,
        summary.reports_dir
    );
}

fn print_comparison(summary: &ComparisonSummary) {
    println!(
        "compared {} against {} rows: {} emitted to {}",
        summary.left_total,
        summary.right_total,
        summary.emitted,
        summary.output.display()
    );
}
