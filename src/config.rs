use rayon::ThreadPoolBuilder;
use std::path::PathBuf;
use std::sync::OnceLock;
use tracing::{info, warn};

static RAYON_INIT: OnceLock<()> = OnceLock::new();
static RUNTIME_SETTINGS: OnceLock<RuntimeSettings> = OnceLock::new();

/// Assumed number of trading periods per year for daily data.
pub const TRADING_DAYS: f64 = 252.0;
/// Random portfolios drawn per optimization run.
pub const DEFAULT_NUM_PORTFOLIOS: usize = 25_000;
/// Samples generated per RNG stream; chunking is fixed so results do not
/// depend on the thread count.
pub const SAMPLE_CHUNK_SIZE: usize = 1_024;
/// Leverage search increment.
pub const LEVERAGE_STEP: f64 = 0.01;
/// Upper bound on leverage search iterations before giving up.
pub const LEVERAGE_MAX_ITERATIONS: usize = 100_000;
/// Default history window when no start date is given.
pub const DEFAULT_LOOKBACK_YEARS: i64 = 5;
pub const DEFAULT_STOCKS: &str = "BOVA11.SA,SMAL11.SA";
/// Exchange suffix for B3 tickers on Yahoo Finance.
pub const DEFAULT_TICKER_SUFFIX: &str = "SA";
/// Seconds a cached provider response stays fresh.
pub const CACHE_MAX_AGE_SECS: u64 = 86_400;

#[derive(Clone, Debug)]
pub struct RuntimeSettings {
    pub reports_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub fetch_retries: usize,
}

/// Environment overrides, read once per process.
pub fn runtime_settings() -> &'static RuntimeSettings {
    RUNTIME_SETTINGS.get_or_init(|| {
        let reports_dir = env_path("MARKOWITZ_REPORTS_DIR").unwrap_or_else(|| PathBuf::from("reports"));
        let cache_dir = env_path("MARKOWITZ_CACHE_DIR").unwrap_or_else(|| PathBuf::from(".cache"));
        let fetch_retries = match std::env::var("MARKOWITZ_FETCH_RETRIES") {
            Ok(raw) => match raw.trim().parse::<usize>() {
                Ok(n) if n > 0 => n,
                _ => {
                    warn!(
                        "Invalid MARKOWITZ_FETCH_RETRIES={} ; defaulting to 3",
                        raw
                    );
                    3
                }
            },
            Err(_) => 3,
        };
        RuntimeSettings {
            reports_dir,
            cache_dir,
            fetch_retries,
        }
    })
}

fn env_path(key: &str) -> Option<PathBuf> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

pub fn init_cpu_parallelism() {
    RAYON_INIT.get_or_init(|| {
        let num_threads = num_cpus::get().max(1);
        match ThreadPoolBuilder::new().num_threads(num_threads).build_global() {
            Ok(_) => info!(
                "Initialized Rayon thread pool with {} threads (all logical CPU cores)",
                num_threads
            ),
            Err(e) => warn!(
                "Rayon thread pool already initialized or unavailable ({}). Using existing configuration.",
                e
            ),
        }
    });
}

/// Report file for a run over `instruments`, e.g.
/// `reports/simulador-markowitz_BOVA11.SA-SMAL11.SA.html`.
pub fn report_file_path(instruments: &[String], extension: &str) -> PathBuf {
    runtime_settings()
        .reports_dir
        .join(format!("simulador-markowitz_{}.{}", instruments.join("-"), extension))
}
