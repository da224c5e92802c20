mod config;
mod error;
mod leverage;
mod matrix;
mod optimizer;
mod provider;
mod report;
mod returns;
mod table;

use anyhow::{bail, Context, Result};
use chrono::{Duration, NaiveDate, Utc};
use clap::{Args, Parser, Subcommand};
use leverage::LeverageRequest;
use matrix::ReturnMatrix;
use optimizer::{MonteCarloOptimizer, OptimizerConfig};
use provider::{CsvProvider, PriceHistoryProvider, YahooProvider};
use report::PortfolioReport;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Markowitz-Sim: Monte Carlo mean-variance portfolio simulation",
    after_help = "EXAMPLES:
    # Simulate the default pair over the last five years
    cargo run --release -- markowitz

    # Reproducible run with a fixed seed and no chart
    cargo run --release -- markowitz ITSA4.SA,PETR4.SA --seed 42 --headless

    # Lever every asset to a 50% cumulative return first
    cargo run --release -- markowitz-with-leverage --expected-return 0.5

    # Save close prices for later offline runs
    cargo run --release -- download BOVA11,SMAL11 --out-dir data"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Sample random long-only portfolios and report the extremal ones
    Markowitz {
        #[command(flatten)]
        run: RunArgs,
    },
    /// Calibrate per-asset leverage to a target cumulative return, then simulate
    MarkowitzWithLeverage {
        /// Target cumulative (summed) return each asset is levered to
        #[arg(long)]
        expected_return: f64,

        #[command(flatten)]
        run: RunArgs,
    },
    /// Download close prices from Yahoo Finance into one CSV per ticker
    Download {
        /// Comma-separated tickers; the exchange suffix is appended when missing
        #[arg(default_value = config::DEFAULT_STOCKS)]
        stocks: String,

        /// First date of history (YYYY-MM-DD, default: five years ago)
        #[arg(long)]
        start_date: Option<NaiveDate>,

        /// Exchange suffix appended to bare tickers
        #[arg(long, default_value = config::DEFAULT_TICKER_SUFFIX)]
        suffix: String,

        #[arg(long, default_value = "data")]
        out_dir: PathBuf,

        /// Save the raw close instead of the split/dividend adjusted close
        #[arg(long)]
        raw_close: bool,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Comma-separated instruments (e.g. BOVA11.SA,SMAL11.SA)
    #[arg(default_value = config::DEFAULT_STOCKS)]
    stocks: String,

    /// First date of history (YYYY-MM-DD, default: five years ago)
    #[arg(long)]
    start_date: Option<NaiveDate>,

    /// Number of random portfolios to draw
    #[arg(long, default_value_t = config::DEFAULT_NUM_PORTFOLIOS)]
    samples: usize,

    /// RNG seed for a reproducible run (default: drawn from entropy and logged)
    #[arg(long)]
    seed: Option<u64>,

    /// Annualization factor: 252 for daily bars, 52 for weekly
    #[arg(long, default_value_t = config::TRADING_DAYS)]
    periods_per_year: f64,

    /// Read prices from a `Date,<inst>,...` CSV instead of Yahoo Finance
    #[arg(long)]
    from_csv: Option<PathBuf>,

    /// Skip the chart
    #[arg(long)]
    headless: bool,

    /// Use the raw close instead of the split/dividend adjusted close (Yahoo only)
    #[arg(long)]
    raw_close: bool,

    /// Also write every sample and the two extremal portfolios as CSV, plus
    /// the levered price paths when leverage is applied
    #[arg(long)]
    export_samples: bool,
}

fn default_start_date() -> NaiveDate {
    Utc::now().date_naive() - Duration::days(config::DEFAULT_LOOKBACK_YEARS * 365)
}

async fn run_markowitz<P: PriceHistoryProvider>(
    provider: &P,
    args: &RunArgs,
    target_return: Option<f64>,
) -> Result<()> {
    let instruments = provider::parse_instrument_list(&args.stocks);
    if instruments.is_empty() {
        bail!("at least one instrument is required, e.g. BOVA11.SA,SMAL11.SA");
    }
    let start = args.start_date.unwrap_or_else(default_start_date);
    let end = Utc::now().date_naive();

    println!("Assets: {}", instruments.join(", "));
    println!("Start date: {}", start);
    println!("End date: {}", end);

    info!("Loading prices from {} provider", provider.name());
    let prices = provider.fetch(&instruments, start).await?;
    if let (Some(first), Some(last)) = (prices.dates().first(), prices.dates().last()) {
        info!("Using {} aligned rows from {} to {}", prices.len(), first, last);
    }

    let returns = match target_return {
        Some(target) => {
            let request = LeverageRequest {
                target_return: target,
                instruments: prices.instruments().to_vec(),
            };
            let (levered, factors) = leverage::adjust_leverage(&prices, &request)?;
            for f in &factors {
                println!("Leverage {}: {:.2}x", f.instrument, f.leverage_factor);
            }
            if args.export_samples {
                export_levered_paths(&levered)?;
            }
            levered
        }
        None => prices.returns()?,
    };

    let optimizer = MonteCarloOptimizer::new(OptimizerConfig {
        num_portfolios: args.samples,
        periods_per_year: args.periods_per_year,
        seed: args.seed,
        retain_samples: !args.headless || args.export_samples,
        ..OptimizerConfig::default()
    });
    let result = optimizer.run(&returns)?;
    let report = PortfolioReport::new(&result);
    println!("{}", report);

    let order = &result.instrument_order;
    if args.export_samples {
        report.write_samples_csv(config::report_file_path(order, "samples.csv"))?;
        report.write_extremes_csv(config::report_file_path(order, "extremes.csv"))?;
    }
    report.write_chart(config::report_file_path(order, "html"), args.headless)?;
    Ok(())
}

fn export_levered_paths(levered: &ReturnMatrix) -> Result<()> {
    let reports_dir = &config::runtime_settings().reports_dir;
    std::fs::create_dir_all(reports_dir)
        .with_context(|| format!("failed creating report directory {:?}", reports_dir))?;
    for instrument in levered.instruments() {
        let table = leverage::levered_price_table(levered, instrument)?;
        let path = config::report_file_path(std::slice::from_ref(instrument), "levered.csv");
        table.save_price(&path)?;
        info!("Levered price path for {} written to {}", instrument, path.display());
    }
    Ok(())
}

async fn run_download(
    stocks: &str,
    start: NaiveDate,
    suffix: &str,
    out_dir: &Path,
    raw_close: bool,
) -> Result<()> {
    let tickers = provider::convert_tickers(&provider::parse_instrument_list(stocks), suffix);
    if tickers.is_empty() {
        bail!("no tickers to download");
    }
    std::fs::create_dir_all(out_dir)
        .with_context(|| format!("failed creating output directory {:?}", out_dir))?;

    let yahoo = YahooProvider::new().with_adjusted_close(!raw_close);
    for symbol in &tickers {
        let table = yahoo
            .fetch_table(symbol, start)
            .await
            .with_context(|| format!("provider unavailable: yahoo fetch failed for {}", symbol))?;
        let path = out_dir.join(format!("{}.csv", symbol));
        table.save_price(&path)?;
        info!("Saved {} rows for {} to {}", table.len(), symbol, path.display());
    }
    Ok(())
}

async fn dispatch(cli: Cli) -> Result<()> {
    let (run, target) = match cli.command {
        Command::Markowitz { run } => (run, None),
        Command::MarkowitzWithLeverage {
            expected_return,
            run,
        } => (run, Some(expected_return)),
        Command::Download {
            stocks,
            start_date,
            suffix,
            out_dir,
            raw_close,
        } => {
            let start = start_date.unwrap_or_else(default_start_date);
            return run_download(&stocks, start, &suffix, &out_dir, raw_close).await;
        }
    };

    match &run.from_csv {
        Some(path) => run_markowitz(&CsvProvider::new(path), &run, target).await,
        None => {
            let yahoo = YahooProvider::new().with_adjusted_close(!run.raw_close);
            run_markowitz(&yahoo, &run, target).await
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("markowitz_sim=info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();
    config::init_cpu_parallelism();

    match dispatch(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}
