use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use pmon_storage::PgStore;
use pmon_sync::{FetchMode, JobKind, JobOutcome, Jobs, MonitorConfig};
use pmon_web::AppState;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "pmon-cli")]
#[command(about = "Partner directory monitor command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Scrape the directory and reconcile partners. Without flags the mode
    /// comes from the stored settings.
    Fetch {
        #[arg(long, value_enum)]
        mode: Option<ModeArg>,
        #[arg(long)]
        page: Option<u32>,
        #[arg(long)]
        country: Option<String>,
    },
    ValidateCountries,
    ValidatePartners,
    ReprocessCountries,
    ReprocessPartners,
    Migrate,
    /// Run the cron scheduler until Ctrl-C.
    Schedule,
    Serve,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ModeArg {
    All,
    First,
    Specific,
    SpecificCountry,
}

impl ModeArg {
    fn setting(self) -> &'static str {
        match self {
            ModeArg::All => "all",
            ModeArg::First => "first",
            ModeArg::Specific => "specific",
            ModeArg::SpecificCountry => "specific_country",
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = MonitorConfig::from_env();

    match cli.command {
        Commands::Fetch {
            mode,
            page,
            country,
        } => {
            let jobs = pmon_sync::jobs_from_config(&config).await?;
            let outcome = match mode {
                Some(mode) => {
                    let page = page.map(|p| p.to_string());
                    let mode = FetchMode::from_parts(Some(mode.setting()), page.as_deref(), country.as_deref())
                        .context("invalid fetch arguments")?;
                    jobs.run_fetch(mode).await?
                }
                None => jobs.run(JobKind::FetchPartnerData).await?,
            };
            print_outcome(&outcome)?;
        }
        Commands::ValidateCountries => run_job(&config, JobKind::ValidateCountries).await?,
        Commands::ValidatePartners => run_job(&config, JobKind::ValidatePartners).await?,
        Commands::ReprocessCountries => run_job(&config, JobKind::ReprocessFlaggedCountries).await?,
        Commands::ReprocessPartners => run_job(&config, JobKind::ReprocessFlaggedPartners).await?,
        Commands::Migrate => {
            let pool = pmon_storage::connect(&config.database_url).await?;
            pmon_storage::run_migrations(&pool).await?;
            println!("migrations applied");
        }
        Commands::Schedule => {
            let jobs = Arc::new(pmon_sync::jobs_from_config(&config).await?);
            let mut sched = pmon_sync::build_scheduler(jobs, &config).await?;
            sched.start().await.context("starting scheduler")?;
            info!("scheduler running; press Ctrl-C to stop");
            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Serve => {
            let pool = pmon_storage::connect(&config.database_url).await?;
            let state = AppState::new(Arc::new(PgStore::new(pool)));

            let jobs = Arc::new(pmon_sync::jobs_from_config(&config).await?);
            let _sched = match pmon_sync::maybe_build_scheduler(jobs, &config).await? {
                Some(sched) => {
                    sched.start().await.context("starting scheduler")?;
                    info!("scheduler enabled alongside the dashboard api");
                    Some(sched)
                }
                None => None,
            };
            pmon_web::serve(state, config.web_port).await?;
        }
    }

    Ok(())
}

async fn run_job(config: &MonitorConfig, kind: JobKind) -> Result<()> {
    let jobs: Jobs = pmon_sync::jobs_from_config(config).await?;
    let outcome = jobs.run(kind).await?;
    print_outcome(&outcome)
}

fn print_outcome(outcome: &JobOutcome) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(outcome)?);
    Ok(())
}
