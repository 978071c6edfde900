//! relay-run - One scheduled relay pass
//!
//! Picks the source for the current time slot, relays one fresh media post
//! from it and exits. Meant to be started by cron or a CI schedule.

use chrono::{DateTime, Utc};
use clap::{ArgAction, Parser};
use librelay::logging::{LogFormat, LoggingConfig};
use librelay::media::{HttpDownloader, JpegConverter};
use librelay::remote::x::{XClient, XCredentials};
use librelay::{Config, RelayError, RelayPipeline, Result};
use rand::Rng;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "relay-run")]
#[command(version)]
#[command(about = "Relay one media post from the current source to the operator account")]
#[command(long_about = "\
relay-run - Relay one media post from a rotating pool of sources

DESCRIPTION:
    Each invocation divides the UTC day into 7 slots, picks the source for
    the current slot, fetches its recent media posts, chooses one that was
    never relayed before and republishes it with an attribution line.

    Relayed post ids and per-source cursors are kept in two JSON files so a
    post is never relayed twice.

USAGE:
    # Normal scheduled run
    relay-run

    # See what would be relayed, without touching anything
    relay-run --dry-run --no-jitter

    # Pretend it is a given time (slot selection)
    relay-run --dry-run --at 2026-01-01T12:00:00Z

CONFIGURATION:
    Configuration file: $RELAY_CONFIG or ~/.config/relay/config.toml

    [sources]
    pool = [\"nasa\", \"esa\"]
    max_posts = 5

    [rate_limit]
    policy = \"backoff\"   # or \"abort\"

    Environment overrides: SOURCE_USERNAMES, MAX_TWEETS_TO_FETCH,
    TWEET_PREFIX, HISTORY_FILE, SINCE_FILE, RELAY_RATE_LIMIT_POLICY

CREDENTIALS:
    X_BEARER_TOKEN, X_CONSUMER_KEY, X_CONSUMER_SECRET, X_ACCESS_TOKEN,
    X_ACCESS_SECRET (read from the environment or a .env file)

EXIT CODES:
    0 - Run finished, including runs that relayed nothing
    2 - Configuration error
    3 - Invalid input
")]
struct Cli {
    /// Configuration file (overrides RELAY_CONFIG and the default location)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Stop after choosing a post; no download, upload, publish or state writes
    #[arg(long)]
    dry_run: bool,

    /// Skip the random startup delay
    #[arg(long)]
    no_jitter: bool,

    /// Run as if the current time were this RFC 3339 instant
    #[arg(long, value_name = "RFC3339")]
    at: Option<DateTime<Utc>>,

    /// Log format: text, json or pretty (default: RELAY_LOG_FORMAT or text)
    #[arg(long, value_name = "FORMAT")]
    log_format: Option<LogFormat>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // A missing .env file is the normal case in CI
    dotenvy::dotenv().ok();
    init_logging(&cli);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if e.is_quota_abort() {
                warn!("{}", e);
            } else {
                error!("{}", e);
            }
            ExitCode::from(e.exit_code().clamp(0, 255) as u8)
        }
    }
}

fn init_logging(cli: &Cli) {
    let mut logging = LoggingConfig::from_env();
    if let Some(format) = cli.log_format {
        logging.format = format;
    }
    logging.verbosity = cli.verbose;
    logging.init();
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    let Some(path) = path else {
        return Config::load();
    };

    let mut config = Config::load_from_path(path)?;
    config.apply_env_overrides()?;
    config.validate()?;
    Ok(config)
}

async fn run(cli: Cli) -> Result<()> {
    let config = load_config(cli.config.as_deref())?;
    if config.sources.pool.is_empty() {
        info!("No sources configured, nothing to do");
        return Ok(());
    }
    let credentials = XCredentials::from_env()?;

    let api = XClient::new(credentials, config.http.timeout())
        .map_err(|e| RelayError::InvalidInput(format!("Failed to set up API client: {}", e)))?;
    let downloader = HttpDownloader::new(config.http.timeout())
        .map_err(|e| RelayError::InvalidInput(format!("Failed to set up downloader: {}", e)))?;

    let mut pipeline = RelayPipeline::from_config(
        Arc::new(api),
        Arc::new(downloader),
        Arc::new(JpegConverter),
        &config,
    )
    .dry_run(cli.dry_run);

    let settings = pipeline.settings();
    info!(
        "relay-run starting: {} sources{}, history at {}, cursors at {}",
        settings.pool.len(),
        if settings.dry_run { " (dry run)" } else { "" },
        pipeline.store().history_path().display(),
        pipeline.store().cursor_path().display()
    );

    if !cli.no_jitter && config.run.startup_jitter_secs > 0 {
        let jitter = startup_jitter(config.run.startup_jitter_secs);
        info!("Startup jitter: sleeping {}", humantime::format_duration(jitter));
        tokio::time::sleep(jitter).await;
    }

    let now = cli.at.unwrap_or_else(Utc::now);
    pipeline.run(now).await?;

    Ok(())
}

/// Uniform delay in `[0, max_secs)`, rounded to milliseconds
fn startup_jitter(max_secs: u64) -> Duration {
    let millis = max_secs.saturating_mul(1000);
    Duration::from_millis(rand::thread_rng().gen_range(0..millis))
}
