//! Command line interface.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::filter::LevelFilter;

use crate::cds::HttpCdsApi;
use crate::config::{CdsCredentials, Params};
use crate::date::{DateMode, parse_date_like};
use crate::ecpds::HttpFileServer;
use crate::error::Result;
use crate::job::{Services, aggregate_exit_code, plan_cds, planned_ecpds_run_date, run_cds, run_ecpds};
use crate::logging::{default_log_file, parse_level};
use crate::notify::NotificationDispatcher;
use crate::request::{FetchRequest, build_ecpds_requests};
use crate::retry::SystemClock;
use crate::storage::object_store_for;

#[derive(Debug, Parser)]
#[command(name = "indra", version, about = "Fetch weather datasets and deliver them to object storage")]
pub struct Cli {
    /// trace, debug, info, warn or error
    #[arg(short = 'l', long, global = true, default_value = "info")]
    pub log_level: String,

    /// Defaults to indra_YYYYMMDD.log
    #[arg(short = 'f', long, global = true)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Fetch data from a source
    Fetch {
        #[command(subcommand)]
        source: FetchSource,
    },
}

#[derive(Debug, Subcommand)]
pub enum FetchSource {
    /// Climate data store reanalysis
    Cds {
        /// YAML configuration file
        config: PathBuf,

        /// Fetch the whole current month, ignoring configured dates
        #[arg(long, conflicts_with = "custom_date")]
        current_month: bool,

        /// Use start_date/end_date from the configuration (default)
        #[arg(long)]
        custom_date: bool,

        #[arg(long)]
        debug: bool,

        /// Resolve and list requests without fetching
        #[arg(long)]
        dry_run: bool,
    },
    /// Forecast files from the distribution server
    Ecpds {
        /// YAML configuration file
        config: PathBuf,

        /// Run date (YYYY-MM-DD, YYYYMMDD or a day offset like -1)
        #[arg(long)]
        date: Option<String>,

        #[arg(long)]
        debug: bool,

        /// Resolve and list requests without fetching
        #[arg(long)]
        dry_run: bool,
    },
}

impl Cli {
    /// Level from `--log-level`, forced to debug by a subcommand `--debug`.
    pub fn level(&self) -> Result<LevelFilter> {
        let Command::Fetch { source } = &self.command;
        let debug = match source {
            FetchSource::Cds { debug, .. } | FetchSource::Ecpds { debug, .. } => *debug,
        };
        if debug { Ok(LevelFilter::DEBUG) } else { parse_level(&self.log_level) }
    }
}

/// Run the parsed command and return the process exit status.
pub fn run(cli: &Cli) -> u8 {
    match execute(cli) {
        Ok(code) => code,
        Err(e) => {
            error!("{e}");
            e.exit_code()
        }
    }
}

fn execute(cli: &Cli) -> Result<u8> {
    let Command::Fetch { source } = &cli.command;
    let today = Utc::now().date_naive();
    let log_file = cli.log_file.clone().unwrap_or_else(|| default_log_file(today));
    match source {
        FetchSource::Cds {
            config,
            current_month,
            custom_date,
            dry_run,
            ..
        } => fetch_cds(config, date_mode(*current_month, *custom_date), *dry_run, &log_file),
        FetchSource::Ecpds { config, date, dry_run, .. } => {
            let date = date.as_deref().map(|d| parse_date_like(d, today)).transpose()?;
            fetch_ecpds(config, date, *dry_run, &log_file)
        }
    }
}

/// `--current-month` and `--custom-date` are mutually exclusive; with neither flag the
/// configured dates are used.
fn date_mode(current_month: bool, custom_date: bool) -> DateMode {
    match (current_month, custom_date) {
        (true, false) => DateMode::CurrentMonth,
        _ => DateMode::Custom,
    }
}

fn services(params: &Params, log_file: &Path) -> Result<Services> {
    let shared = &params.shared_params;
    Ok(Services {
        store: object_store_for(&shared.s3_bucket, shared.s3_region.as_deref())?,
        clock: Arc::new(SystemClock),
        notifier: NotificationDispatcher::from_env(shared.email_recipients.clone(), shared.job_name.clone())
            .with_attachment(log_file),
    })
}

fn fetch_cds(config: &Path, mode: DateMode, dry_run: bool, log_file: &Path) -> Result<u8> {
    let params = Params::load(config)?;
    let cds = params.cds()?;

    if dry_run {
        let (range, requests) = plan_cds(cds, mode, Utc::now().date_naive())?;
        info!("dry run: {} requests for {range}", requests.len());
        for r in &requests {
            info!("  {} -> {}", r.label(), r.file_name());
        }
        return Ok(0);
    }

    let api = Arc::new(HttpCdsApi::new(&CdsCredentials::load()?)?);
    let result = run_cds(&params, mode, api, &services(&params, log_file)?)?;
    Ok(aggregate_exit_code([result.exit_code()]))
}

fn fetch_ecpds(config: &Path, date: Option<NaiveDate>, dry_run: bool, log_file: &Path) -> Result<u8> {
    let params = Params::load(config)?;
    let ecpds = params.ecpds()?;

    if dry_run {
        let run_date = planned_ecpds_run_date(ecpds, date, &SystemClock)?;
        let requests = build_ecpds_requests(ecpds, run_date)?;
        info!("dry run: {} requests for run {run_date}", requests.len());
        for r in &requests {
            info!("  {} -> {}", r.url, r.file_name());
        }
        return Ok(0);
    }

    let server = Arc::new(HttpFileServer::new()?);
    let result = run_ecpds(&params, date, server, &services(&params, log_file)?)?;
    Ok(aggregate_exit_code([result.exit_code()]))
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;

    use super::*;
    use crate::config::tests::SAMPLE;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(args).unwrap()
    }

    #[test]
    fn parses_fetch_subcommands() {
        let cli = parse(&["indra", "--log-level", "warn", "fetch", "cds", "cfg.yaml", "--current-month"]);
        assert_eq!(cli.level().unwrap(), LevelFilter::WARN);
        match cli.command {
            Command::Fetch {
                source: FetchSource::Cds { current_month, .. },
            } => assert!(current_month),
            other => panic!("unexpected {other:?}"),
        }

        let cli = parse(&["indra", "fetch", "ecpds", "cfg.yaml", "--date", "2024-03-14", "--debug"]);
        assert_eq!(cli.level().unwrap(), LevelFilter::DEBUG);
    }

    #[test]
    fn date_modes_are_exclusive() {
        let r = Cli::try_parse_from(["indra", "fetch", "cds", "c.yaml", "--current-month", "--custom-date"]);
        assert!(r.is_err());
    }

    fn cds_mode(args: &[&str]) -> DateMode {
        match parse(args).command {
            Command::Fetch {
                source: FetchSource::Cds {
                    current_month,
                    custom_date,
                    ..
                },
            } => date_mode(current_month, custom_date),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn date_mode_follows_flags() {
        assert_eq!(cds_mode(&["indra", "fetch", "cds", "c.yaml"]), DateMode::Custom);
        assert_eq!(cds_mode(&["indra", "fetch", "cds", "c.yaml", "--custom-date"]), DateMode::Custom);
        assert_eq!(cds_mode(&["indra", "fetch", "cds", "c.yaml", "--current-month"]), DateMode::CurrentMonth);
    }

    #[test]
    fn dry_runs_do_not_touch_the_network() {
        let tmp = TempDir::new().unwrap();
        let config = tmp.path().join("params.yaml");
        fs::write(&config, SAMPLE).unwrap();
        let config = config.to_str().unwrap();

        assert_eq!(run(&parse(&["indra", "fetch", "cds", config, "--dry-run"])), 0);
        assert_eq!(run(&parse(&["indra", "fetch", "ecpds", config, "--date", "20240314", "--dry-run"])), 0);
    }

    #[test]
    fn configuration_errors_exit_with_two() {
        let tmp = TempDir::new().unwrap();
        let missing = tmp.path().join("missing.yaml");
        assert_eq!(run(&parse(&["indra", "fetch", "cds", missing.to_str().unwrap()])), 2);

        let bad = tmp.path().join("bad.yaml");
        fs::write(&bad, SAMPLE.replace("ka: [19, 74, 11, 79]", "ka: [11, 74, 19, 79]")).unwrap();
        assert_eq!(run(&parse(&["indra", "fetch", "cds", bad.to_str().unwrap(), "--dry-run"])), 2);
    }
}
