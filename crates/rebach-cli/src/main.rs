//! The `rebach` binary: one-shot preservation run over the institution's
//! published articles and collections.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Local;
use clap::Parser;

use rebach_bagger::wasabi::Wasabi;
use rebach_config::Config;
use rebach_core::{
    ArticleOrchestrator, CollectionOrchestrator, DEFAULT_BAGGER_CONFIG_PATH, IntegrationDriver,
    PreservationProbes, summary,
};
use rebach_figshare::CatalogClient;
use rebach_index::FinalStoreClient;
use rebach_package::PackageBuilder;
use rebach_types::{Reporter, RunTotals};

mod logger;

use logger::FileLog;

#[derive(Parser, Debug)]
#[command(name = "rebach", version)]
#[command(about = "ReDATA preservation pipeline: package, verify, and bag published items")]
struct Cli {
    /// Path to the rebach configuration file, e.g. .env.ini
    #[arg(long)]
    xfg: PathBuf,

    /// Comma-separated article and/or collection ids to process, e.g. "2323,4353"
    #[arg(long, value_delimiter = ',')]
    ids: Option<Vec<u64>>,

    /// Keep going after per-item errors
    #[arg(long)]
    continue_on_error: bool,

    /// Log every decision without writing packages or invoking processors
    #[arg(long)]
    dry_run: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load(&cli.xfg)?;
    if cli.continue_on_error {
        config.system.continue_on_error = true;
    }
    if cli.dry_run {
        config.system.dry_run = true;
    }
    config.validate()?;

    let mut log = FileLog::create(&config.system.logs_location)?;
    log.info("rebach has started");
    log.info(&format!("config file: {}", cli.xfg.display()));
    log.info(&format!("log file: {}", log.path().display()));
    if config.system.dry_run {
        log.warn("dry-run mode: no packages will be written and no processors invoked");
    }

    let result = run(&config, cli.ids.as_deref(), &mut log);
    if let Err(e) = &result {
        log.error(&format!("{e:#}"));
    }
    result
}

fn run(config: &Config, ids: Option<&[u64]>, log: &mut FileLog) -> Result<()> {
    let catalog = CatalogClient::new(
        &config.figshare.url,
        &config.figshare.token,
        config.figshare.institution,
        config.figshare.retry_policy(),
    )?;
    let final_store = FinalStoreClient::new(
        &config.aptrust.url,
        &config.aptrust.user,
        &config.aptrust.token,
        config.aptrust.items_per_page,
        &config.aptrust.alt_identifier_starts_with,
        config.aptrust.retry_policy(),
    )?;
    let builder = PackageBuilder::new(&config.figshare.token, config.figshare.retry_policy())?;

    let bagger_config = load_bagger_config_if_present(log)?;
    let staging = bagger_config
        .as_ref()
        .map(|bc| Wasabi::from_config(&bc.wasabi));
    let probes = PreservationProbes {
        final_store,
        staging,
        local_root: config.system.preservation_storage_location.clone(),
    };
    let driver = IntegrationDriver::new(&config.system, bagger_config);

    let run_date = Local::now().date_naive();
    let mut totals = RunTotals::default();

    let articles = ArticleOrchestrator {
        catalog: &catalog,
        probes: &probes,
        builder: &builder,
        driver: &driver,
        system: &config.system,
        ids,
        run_date,
    };
    articles.run(&mut totals, log)?;

    let collections = CollectionOrchestrator {
        catalog: &catalog,
        probes: &probes,
        builder: &builder,
        driver: &driver,
        system: &config.system,
        ids,
        run_date,
    };
    collections.run(&mut totals, log)?;

    let (warnings, errors) = log.counts();
    summary::report(&totals, warnings, errors, log);
    Ok(())
}

/// The bagger TOML is required for in-process bagging and for the staging
/// probe; without it the run still works, minus the staging-store checks.
fn load_bagger_config_if_present(log: &mut FileLog) -> Result<Option<rebach_bagger::BaggerConfig>> {
    let path = Path::new(DEFAULT_BAGGER_CONFIG_PATH);
    if !path.exists() {
        log.warn(&format!(
            "bagger config not found at {DEFAULT_BAGGER_CONFIG_PATH}; staging-store probe disabled"
        ));
        return Ok(None);
    }
    let config = rebach_bagger::load_bagger_config(path)
        .context("the bagger config file exists but could not be loaded")?;
    Ok(Some(config))
}
