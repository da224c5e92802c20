use crate::config::{runtime_settings, CACHE_MAX_AGE_SECS};
use crate::matrix::PriceMatrix;
use crate::table::{PriceTable, RawBar};
use anyhow::{anyhow, Context, Result};
use chrono::{NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Source of aligned closing-price history.
#[allow(async_fn_in_trait)]
pub trait PriceHistoryProvider {
    fn name(&self) -> &'static str;

    /// Price history for `instruments` from `start` onwards, inner-joined on
    /// date, columns in the order given.
    async fn fetch(&self, instruments: &[String], start: NaiveDate) -> Result<PriceMatrix>;
}

/// Splits a comma-separated instrument list, trimming, upper-casing and
/// dropping blanks and repeats.
pub fn parse_instrument_list(raw: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for symbol in raw.split(',').map(|s| s.trim().to_uppercase()) {
        if !symbol.is_empty() && !out.contains(&symbol) {
            out.push(symbol);
        }
    }
    out
}

/// Appends an exchange suffix (`BOVA11` -> `BOVA11.SA`) to tickers that
/// don't carry one yet.
pub fn convert_tickers(tickers: &[String], suffix: &str) -> Vec<String> {
    let suffix = suffix.trim().trim_start_matches('.');
    tickers
        .iter()
        .map(|t| {
            let t = t.trim();
            if suffix.is_empty() || t.contains('.') {
                t.to_string()
            } else {
                format!("{}.{}", t, suffix)
            }
        })
        .collect()
}

// ──────────────────────────────────────────────────────────────────────────────
// Yahoo Finance
// ──────────────────────────────────────────────────────────────────────────────

#[derive(Deserialize, Serialize, Debug)]
struct YahooChartResponse {
    chart: YahooChart,
}

#[derive(Deserialize, Serialize, Debug)]
struct YahooChart {
    result: Option<Vec<YahooResult>>,
    #[serde(default)]
    error: Option<YahooError>,
}

#[derive(Deserialize, Serialize, Debug)]
struct YahooError {
    code: Option<String>,
    description: Option<String>,
}

#[derive(Deserialize, Serialize, Debug)]
struct YahooResult {
    #[serde(default)]
    timestamp: Vec<i64>,
    indicators: YahooIndicators,
}

#[derive(Deserialize, Serialize, Debug)]
struct YahooIndicators {
    quote: Vec<YahooQuote>,
    #[serde(default)]
    adjclose: Option<Vec<YahooAdjClose>>,
}

#[derive(Deserialize, Serialize, Debug)]
struct YahooQuote {
    #[serde(default)]
    open: Vec<Option<f64>>,
    #[serde(default)]
    high: Vec<Option<f64>>,
    #[serde(default)]
    low: Vec<Option<f64>>,
    #[serde(default)]
    close: Vec<Option<f64>>,
    #[serde(default)]
    volume: Vec<Option<f64>>,
}

#[derive(Deserialize, Serialize, Debug)]
struct YahooAdjClose {
    adjclose: Vec<Option<f64>>,
}

pub struct YahooProvider {
    client: reqwest::Client,
    cache_dir: PathBuf,
    max_attempts: usize,
    /// Use the split/dividend adjusted close instead of the raw close.
    adjusted_close: bool,
}

impl YahooProvider {
    pub fn new() -> Self {
        let settings = runtime_settings();
        Self {
            client: reqwest::Client::new(),
            cache_dir: settings.cache_dir.clone(),
            max_attempts: settings.fetch_retries,
            adjusted_close: true,
        }
    }

    pub fn with_adjusted_close(mut self, adjusted_close: bool) -> Self {
        self.adjusted_close = adjusted_close;
        self
    }

    /// Fetches one instrument as a canonical OHLC table.
    pub async fn fetch_table(&self, symbol: &str, start: NaiveDate) -> Result<PriceTable> {
        if !self.cache_dir.exists() {
            std::fs::create_dir_all(&self.cache_dir)?;
        }
        let cache_file = self.cache_dir.join(format!("{}_{}.json", symbol, start));

        let response: YahooChartResponse = match cache_age_secs(&cache_file) {
            Some(age) if age < CACHE_MAX_AGE_SECS => {
                info!("Loading {} from cache...", symbol);
                let file = std::fs::File::open(&cache_file)?;
                let reader = std::io::BufReader::new(file);
                serde_json::from_reader(reader)?
            }
            Some(_) => {
                info!("Cache expired for {}, fetching...", symbol);
                self.fetch_from_api(symbol, start, &cache_file).await?
            }
            None => {
                info!("Cache miss for {}, fetching...", symbol);
                self.fetch_from_api(symbol, start, &cache_file).await?
            }
        };

        response_to_table(symbol, response, self.adjusted_close)
    }

    async fn fetch_from_api(
        &self,
        symbol: &str,
        start: NaiveDate,
        cache_path: &Path,
    ) -> Result<YahooChartResponse> {
        let period1 = start
            .and_hms_opt(0, 0, 0)
            .map(|dt| dt.and_utc().timestamp())
            .ok_or_else(|| anyhow!("invalid start date {}", start))?;
        let period2 = Utc::now().timestamp();
        let url = format!(
            "https://query1.finance.yahoo.com/v8/finance/chart/{}?period1={}&period2={}&interval=1d&events=div%2Csplit",
            symbol, period1, period2
        );

        let mut last_err: Option<anyhow::Error> = None;
        for attempt in 1..=self.max_attempts {
            match self
                .client
                .get(&url)
                .header("User-Agent", "Mozilla/5.0")
                .send()
                .await
            {
                Ok(resp) => match resp.error_for_status() {
                    Ok(ok_resp) => match ok_resp.json::<YahooChartResponse>().await {
                        Ok(parsed) => {
                            store_in_cache(cache_path, &parsed)?;
                            return Ok(parsed);
                        }
                        Err(err) => last_err = Some(err.into()),
                    },
                    Err(err) => last_err = Some(err.into()),
                },
                Err(err) => last_err = Some(err.into()),
            }

            if attempt < self.max_attempts {
                warn!(
                    "Yahoo history fetch retry for {} ({}/{}): {}",
                    symbol,
                    attempt,
                    self.max_attempts,
                    last_err.as_ref().map(|e| e.to_string()).unwrap_or_default()
                );
                tokio::time::sleep(std::time::Duration::from_secs(2)).await;
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow!("Yahoo history fetch failed for {}", symbol)))
    }
}

/// Writes a usable chart response to the cache. Error payloads and empty
/// results are never cached. Returns whether the file was written.
fn store_in_cache(cache_path: &Path, response: &YahooChartResponse) -> Result<bool> {
    let usable = response.chart.error.is_none()
        && response.chart.result.as_ref().is_some_and(|r| !r.is_empty());
    if !usable {
        warn!("Not caching unusable Yahoo response at {}", cache_path.display());
        return Ok(false);
    }
    let file = std::fs::File::create(cache_path)?;
    let writer = std::io::BufWriter::new(file);
    serde_json::to_writer(writer, response)?;
    Ok(true)
}

impl Default for YahooProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl PriceHistoryProvider for YahooProvider {
    fn name(&self) -> &'static str {
        "yahoo"
    }

    async fn fetch(&self, instruments: &[String], start: NaiveDate) -> Result<PriceMatrix> {
        if instruments.is_empty() {
            return Err(anyhow!("no instruments requested"));
        }
        let mut tables = Vec::with_capacity(instruments.len());
        for symbol in instruments {
            let table = self
                .fetch_table(symbol, start)
                .await
                .with_context(|| format!("provider unavailable: yahoo fetch failed for {}", symbol))?;
            tables.push(table);
        }
        let matrix = PriceMatrix::join(&tables).context("joining price tables")?;
        info!(
            "Aligned {} instruments over {} common dates",
            matrix.instruments().len(),
            matrix.len()
        );
        Ok(matrix)
    }
}

fn cache_age_secs(path: &Path) -> Option<u64> {
    let modified = std::fs::metadata(path).ok()?.modified().ok()?;
    std::time::SystemTime::now()
        .duration_since(modified)
        .ok()
        .map(|d| d.as_secs())
}

fn response_to_table(symbol: &str, response: YahooChartResponse, adjusted_close: bool) -> Result<PriceTable> {
    if let Some(err) = response.chart.error {
        return Err(anyhow!(
            "yahoo error for {}: {} {}",
            symbol,
            err.code.unwrap_or_default(),
            err.description.unwrap_or_default()
        ));
    }
    let result = response
        .chart
        .result
        .and_then(|r| r.into_iter().next())
        .ok_or_else(|| anyhow!("No data found for {}", symbol))?;
    let quote = result
        .indicators
        .quote
        .first()
        .ok_or_else(|| anyhow!("No quotes found for {}", symbol))?;
    let adjclose = result
        .indicators
        .adjclose
        .as_ref()
        .and_then(|a| a.first())
        .filter(|_| adjusted_close);

    let at = |series: &Vec<Option<f64>>, i: usize| series.get(i).copied().flatten();

    let mut raw = Vec::with_capacity(result.timestamp.len());
    let mut skipped = 0usize;
    for (i, &timestamp) in result.timestamp.iter().enumerate() {
        let close = match adjclose {
            Some(adj) => at(&adj.adjclose, i),
            None => at(&quote.close, i),
        };
        let bar = RawBar {
            time: Utc.timestamp_opt(timestamp, 0).single(),
            open: at(&quote.open, i),
            high: at(&quote.high, i),
            low: at(&quote.low, i),
            close,
            volume: at(&quote.volume, i),
            ticker: Some(symbol.to_uppercase()),
            timeframe: Some("1d".to_string()),
        };
        // Yahoo leaves holes (nulls) on halted or partial sessions
        if bar.is_complete() {
            raw.push(bar);
        } else {
            skipped += 1;
        }
    }
    if skipped > 0 {
        warn!("{}: skipped {} incomplete bars", symbol, skipped);
    }

    Ok(PriceTable::ohlc(raw)
        .with_ticker(symbol.to_uppercase())
        .with_source("Yfinance-History")
        .validated()?)
}

// ──────────────────────────────────────────────────────────────────────────────
// Local CSV
// ──────────────────────────────────────────────────────────────────────────────

/// Reads a `Date,<inst1>,<inst2>,...` matrix from disk.
pub struct CsvProvider {
    path: PathBuf,
}

impl CsvProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl PriceHistoryProvider for CsvProvider {
    fn name(&self) -> &'static str {
        "csv"
    }

    async fn fetch(&self, instruments: &[String], start: NaiveDate) -> Result<PriceMatrix> {
        let matrix = PriceMatrix::from_csv(&self.path, instruments)
            .with_context(|| format!("provider unavailable: cannot read {}", self.path.display()))?;
        Ok(matrix.since(start).with_context(|| format!("no rows on or after {}", start))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_instrument_list() {
        assert_eq!(
            parse_instrument_list(" bova11.sa, SMAL11.SA,,BOVA11.SA "),
            vec!["BOVA11.SA".to_string(), "SMAL11.SA".to_string()]
        );
        assert!(parse_instrument_list(" , ").is_empty());
    }

    #[test]
    fn test_convert_tickers() {
        let tickers = vec!["BOVA11".to_string(), "SMALL11".to_string()];
        assert_eq!(
            convert_tickers(&tickers, "SA"),
            vec!["BOVA11.SA".to_string(), "SMALL11.SA".to_string()]
        );
        assert_eq!(convert_tickers(&["PETR4.SA".to_string()], ".SA"), vec!["PETR4.SA".to_string()]);
        assert_eq!(convert_tickers(&["AAPL".to_string()], ""), vec!["AAPL".to_string()]);
        assert!(convert_tickers(&[], "SA").is_empty());
    }

    #[test]
    fn test_response_to_table_prefers_adjusted_close() {
        let json = r#"{"chart":{"result":[{"timestamp":[1672833600,1672747200,1672920000],
            "indicators":{"quote":[{"open":[10.0,9.0,null],"high":[11.0,10.0,12.0],
            "low":[9.5,8.5,10.5],"close":[10.5,9.5,11.5],"volume":[100.0,200.0,300.0]}],
            "adjclose":[{"adjclose":[10.4,9.4,11.4]}]}}],"error":null}}"#;
        let response: YahooChartResponse = serde_json::from_str(json).unwrap();
        let table = response_to_table("bova11.sa", response, true).unwrap();

        assert_eq!(table.ticker(), Some("BOVA11.SA"));
        assert_eq!(table.len(), 2);
        // sorted ascending by time
        assert_eq!(table.candles()[0].close, 9.4);
        assert_eq!(table.candles()[1].close, 10.4);
    }

    #[test]
    fn test_response_to_table_raw_close_and_errors() {
        let json = r#"{"chart":{"result":[{"timestamp":[1672747200],
            "indicators":{"quote":[{"open":[9.0],"high":[10.0],"low":[8.5],"close":[9.5],"volume":[200.0]}],
            "adjclose":[{"adjclose":[9.4]}]}}]}}"#;
        let response: YahooChartResponse = serde_json::from_str(json).unwrap();
        let table = response_to_table("X", response, false).unwrap();
        assert_eq!(table.candles()[0].close, 9.5);

        let missing = r#"{"chart":{"result":null,"error":{"code":"Not Found","description":"No data found, symbol may be delisted"}}}"#;
        let response: YahooChartResponse = serde_json::from_str(missing).unwrap();
        assert!(response_to_table("GONE", response, true).is_err());
    }

    #[test]
    fn test_error_payload_is_not_cached() {
        let dir = tempfile::tempdir().unwrap();
        let cache_file = dir.path().join("GONE.SA_2023-01-01.json");

        let missing = r#"{"chart":{"result":null,"error":{"code":"Not Found","description":"No data found"}}}"#;
        let response: YahooChartResponse = serde_json::from_str(missing).unwrap();
        assert!(!store_in_cache(&cache_file, &response).unwrap());
        assert!(!cache_file.exists());

        let empty = r#"{"chart":{"result":[],"error":null}}"#;
        let response: YahooChartResponse = serde_json::from_str(empty).unwrap();
        assert!(!store_in_cache(&cache_file, &response).unwrap());
        assert!(!cache_file.exists());
    }

    #[test]
    fn test_usable_payload_is_cached() {
        let dir = tempfile::tempdir().unwrap();
        let cache_file = dir.path().join("X_2023-01-01.json");
        let json = r#"{"chart":{"result":[{"timestamp":[1672747200],
            "indicators":{"quote":[{"open":[9.0],"high":[10.0],"low":[8.5],"close":[9.5],"volume":[200.0]}]}}]}}"#;
        let response: YahooChartResponse = serde_json::from_str(json).unwrap();
        assert!(store_in_cache(&cache_file, &response).unwrap());

        let cached: YahooChartResponse =
            serde_json::from_reader(std::fs::File::open(&cache_file).unwrap()).unwrap();
        assert_eq!(response_to_table("X", cached, true).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_csv_provider_selects_and_filters() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "Date,ITSA4,PETR4,VALE3").unwrap();
        writeln!(file, "2022-12-29,8.0,24.0,88.0").unwrap();
        writeln!(file, "2023-01-02,8.1,23.0,87.0").unwrap();
        writeln!(file, "2023-01-03,8.2,22.5,").unwrap();
        writeln!(file, "2023-01-04,8.3,23.5,89.0").unwrap();
        file.flush().unwrap();

        let provider = CsvProvider::new(file.path());
        let start = NaiveDate::from_ymd_opt(2023, 1, 1).unwrap();
        let wanted = vec!["PETR4".to_string(), "ITSA4".to_string()];
        let matrix = provider.fetch(&wanted, start).await.unwrap();

        assert_eq!(provider.name(), "csv");
        assert_eq!(matrix.instruments(), wanted.as_slice());
        // the VALE3 hole does not affect the requested columns
        assert_eq!(matrix.len(), 3);
        assert_eq!(matrix.column("PETR4").unwrap(), &[23.0, 22.5, 23.5]);

        let unknown = vec!["WEGE3".to_string()];
        assert!(provider.fetch(&unknown, start).await.is_err());
    }
}
